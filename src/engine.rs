//! Orchestration: drives a plan through a backend, collecting per-entry
//! outcomes.
//!
//! Execution is single-threaded and strictly in plan order: later
//! instructions may intentionally override earlier ones on the same path,
//! so reordering or parallel application would change observable results.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use crate::backend::Backend;
use crate::error::ExecutionError;
use crate::plan::{ExecutionPlan, Source};

/// What to do when an instruction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Abort the run on the first failing instruction. The default: a
    /// broken deployment description should not quietly produce a
    /// partially-correct image.
    #[default]
    StopOnFirstError,
    /// Attempt every instruction and report all failures at the end.
    ContinueOnError,
}

/// The outcome of one attempted plan entry.
#[derive(Debug)]
pub struct Outcome {
    pub source: Source,
    /// Operator-readable instruction summary.
    pub summary: String,
    pub result: Result<(), ExecutionError>,
}

/// Per-entry outcomes for one run, in plan order. Entries after an
/// aborting failure were never attempted and do not appear.
#[derive(Debug, Default)]
pub struct Report {
    outcomes: Vec<Outcome>,
}

impl Report {
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// How many entries were attempted (not necessarily successfully).
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }
}

/// Apply every plan entry through `backend`, in order.
pub fn run(backend: &mut dyn Backend, plan: &ExecutionPlan, policy: ErrorPolicy) -> Report {
    let mut outcomes = Vec::with_capacity(plan.len());
    for entry in plan.entries() {
        let result = backend.apply(entry);
        let failed = result.is_err();
        outcomes.push(Outcome {
            source: entry.source.clone(),
            summary: entry.instruction.to_string(),
            result,
        });
        if failed && policy == ErrorPolicy::StopOnFirstError {
            break;
        }
    }
    Report { outcomes }
}

/// Advisory exclusive lock over a target for the duration of a run.
///
/// The lock file lives next to the target (`<target>.lock`), never inside
/// it, so direct-mode runs do not pollute the deployed tree.
#[derive(Debug)]
pub struct TargetLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl TargetLock {
    pub fn acquire(target: &Path) -> Result<TargetLock> {
        let path = lock_path(target);
        // Do not unlink "stale" lock files: unlinking a still-locked file
        // lets a second process lock a fresh file at the same path,
        // defeating mutual exclusion.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating lock file {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!("target is locked by another run: {}", path.display());
        }
        Ok(TargetLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DirectBackend;
    use crate::instruction::Instruction;
    use crate::plan::{ExecutionPlan, InstructionEntry};
    use std::fs;
    use tempfile::TempDir;

    fn chmod_entry(spec: &str, mode: u32) -> InstructionEntry {
        InstructionEntry {
            priority: 50,
            source: Source::new("pkg", "role"),
            instruction: Instruction::Chmod {
                root: ".".into(),
                spec: spec.into(),
                mode,
            },
        }
    }

    fn plan_with_failure_in_middle() -> (TempDir, ExecutionPlan) {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), "").unwrap();
        fs::write(temp.path().join("c"), "").unwrap();
        fs::set_permissions(temp.path().join("c"), fs::Permissions::from_mode(0o640)).unwrap();
        // "b" does not exist, so the middle entry fails.
        let plan = ExecutionPlan::build(vec![vec![
            chmod_entry("a", 0o600),
            chmod_entry("b", 0o600),
            chmod_entry("c", 0o600),
        ]]);
        (temp, plan)
    }

    #[test]
    fn test_stop_on_first_error_halts() {
        let (temp, plan) = plan_with_failure_in_middle();
        let mut backend = DirectBackend::new(temp.path());

        let report = run(&mut backend, &plan, ErrorPolicy::StopOnFirstError);
        assert_eq!(report.attempted(), 2);
        assert_eq!(report.failures().count(), 1);
        assert!(!report.is_success());

        // The third entry was never attempted: "c" keeps its old bits.
        use std::os::unix::fs::PermissionsExt;
        let c_mode = fs::metadata(temp.path().join("c"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(c_mode & 0o7777, 0o640);
    }

    #[test]
    fn test_continue_on_error_attempts_all() {
        let (temp, plan) = plan_with_failure_in_middle();
        let mut backend = DirectBackend::new(temp.path());

        let report = run(&mut backend, &plan, ErrorPolicy::ContinueOnError);
        assert_eq!(report.attempted(), 3);
        assert_eq!(report.failures().count(), 1);

        use std::os::unix::fs::PermissionsExt;
        let c_mode = fs::metadata(temp.path().join("c"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(c_mode & 0o7777, 0o600);
    }

    #[test]
    fn test_report_identifies_failing_source() {
        let (temp, plan) = plan_with_failure_in_middle();
        let mut backend = DirectBackend::new(temp.path());
        let report = run(&mut backend, &plan, ErrorPolicy::ContinueOnError);

        let failure = report.failures().next().unwrap();
        assert_eq!(failure.source.to_string(), "pkg{role}");
        assert!(failure.summary.contains("chmod"));
    }

    #[test]
    fn test_target_lock_excludes_second_run() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("rootfs");
        fs::create_dir_all(&target).unwrap();

        let lock = TargetLock::acquire(&target).unwrap();
        assert!(TargetLock::acquire(&target).is_err());
        drop(lock);
        assert!(TargetLock::acquire(&target).is_ok());
    }
}
