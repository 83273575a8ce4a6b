use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use deploy_instructions::{
    loader, ArchiveBackend, Backend, DirectBackend, ErrorPolicy, ExecutionPlan, InstructionEntry,
    Report, Source, TargetLock,
};

fn usage() -> &'static str {
    "Usage:\n  deploy-instructions apply --target <dir> [--continue-on-error] <package>:<role>=<doc.toml>...\n  deploy-instructions archive --output <file.tar[.zst]> [--staging <dir>] [--continue-on-error] <package>:<role>=<doc.toml>..."
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.split_first() {
        Some((command, rest)) if command == "apply" => apply(rest),
        Some((command, rest)) if command == "archive" => archive(rest),
        _ => bail!(usage()),
    }
}

struct CommonArgs {
    policy: ErrorPolicy,
    sets: Vec<Vec<InstructionEntry>>,
    plan_size: usize,
}

/// Parse shared flags and load every instruction document up front, so a
/// bad set is rejected before anything is applied.
fn parse_common(
    args: &[String],
    flags_with_value: &[&str],
) -> Result<(CommonArgs, Vec<(String, String)>)> {
    let mut policy = ErrorPolicy::StopOnFirstError;
    let mut values: Vec<(String, String)> = Vec::new();
    let mut documents: Vec<(Source, PathBuf)> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--continue-on-error" {
            policy = ErrorPolicy::ContinueOnError;
        } else if let Some(flag) = flags_with_value.iter().find(|f| *f == arg) {
            let value = iter
                .next()
                .with_context(|| format!("{} requires a value\n{}", flag, usage()))?;
            values.push((flag.to_string(), value.clone()));
        } else if let Some((label, path)) = arg.split_once('=') {
            let (package, role) = label
                .split_once(':')
                .with_context(|| format!("bad source label '{}' (expected <package>:<role>)", label))?;
            documents.push((Source::new(package, role), PathBuf::from(path)));
        } else {
            bail!("unrecognized argument '{}'\n{}", arg, usage());
        }
    }

    if documents.is_empty() {
        bail!("no instruction documents given\n{}", usage());
    }

    let mut sets = Vec::with_capacity(documents.len());
    let mut plan_size = 0;
    for (source, path) in &documents {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading instruction document {}", path.display()))?;
        let entries = loader::load(&text, source)
            .with_context(|| format!("loading {}", path.display()))?;
        plan_size += entries.len();
        sets.push(entries);
    }

    Ok((
        CommonArgs {
            policy,
            sets,
            plan_size,
        },
        values,
    ))
}

fn flag_value<'a>(values: &'a [(String, String)], flag: &str) -> Option<&'a str> {
    values
        .iter()
        .find(|(name, _)| name == flag)
        .map(|(_, value)| value.as_str())
}

fn apply(args: &[String]) -> Result<()> {
    let (common, values) = parse_common(args, &["--target"])?;
    let target = Path::new(flag_value(&values, "--target").with_context(|| usage())?);
    if !target.is_dir() {
        bail!("target '{}' is not a directory", target.display());
    }

    let plan = ExecutionPlan::build(common.sets);
    println!(
        "[apply] {} instruction(s) against {}",
        plan.len(),
        target.display()
    );

    if plan.needs_privilege() && unsafe { libc::geteuid() } != 0 {
        eprintln!(
            "[apply] warning: not running as root; ownership changes and device nodes will likely fail"
        );
    }

    let _lock = TargetLock::acquire(target)?;
    let mut backend = DirectBackend::new(target);
    let report = deploy_instructions::run(&mut backend, &plan, common.policy);
    finish(&report, plan.len())
}

fn archive(args: &[String]) -> Result<()> {
    let (common, values) = parse_common(args, &["--output", "--staging"])?;
    let output = Path::new(flag_value(&values, "--output").with_context(|| usage())?);

    let mut backend = match flag_value(&values, "--staging") {
        Some(staging) => ArchiveBackend::from_staging(Path::new(staging))?,
        None => ArchiveBackend::new(),
    };
    println!(
        "[archive] {} instruction(s) into {} ({})",
        common.plan_size,
        output.display(),
        backend.describe_target()
    );

    let plan = ExecutionPlan::build(common.sets);
    let _lock = TargetLock::acquire(output)?;
    let report = deploy_instructions::run(&mut backend, &plan, common.policy);
    finish(&report, plan.len())?;

    // Only a fully successful plan produces an archive.
    backend.write_tar(output)?;
    println!("[archive] wrote {}", output.display());
    Ok(())
}

/// Report failures the way an author needs to see them: every failing
/// instruction with its originating package/role.
fn finish(report: &Report, plan_len: usize) -> Result<()> {
    for failure in report.failures() {
        if let Err(err) = &failure.result {
            eprintln!("[failed] {}: {}: {}", failure.source, failure.summary, err);
        }
    }
    let failed = report.failures().count();
    if failed > 0 {
        bail!(
            "{} of {} instruction(s) failed ({} attempted)",
            failed,
            plan_len,
            report.attempted()
        );
    }
    Ok(())
}
