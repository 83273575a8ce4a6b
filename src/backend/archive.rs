//! Archive backend: records instruction effects as archive-entry metadata.
//!
//! Nothing here touches the real filesystem beyond reading staged content.
//! The backend keeps an in-memory model of the archive: entries scanned
//! from a staging tree, mutated by instructions, then rendered in one pass
//! as a reproducible GNU tar stream (deterministic order, mtime 0), with
//! zstd compression when the output name asks for it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::error::ExecutionError;
use crate::instruction::{DeviceKind, Instruction, OwnerRef};
use crate::plan::InstructionEntry;
use crate::resolve;

use super::Backend;

/// What an archive entry is, independent of the tar encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    /// Regular file; content is streamed from the staged copy at render
    /// time rather than held in memory.
    File { size: u64, staged: PathBuf },
    Symlink { target: PathBuf },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
}

/// Metadata recorded for one archive path, honored when the archive is
/// later unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub kind: EntryKind,
    /// Permission bits only; the file type lives in `kind`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Symbolic owner names, preferred over the numeric ids by unpackers
    /// when present.
    pub uname: Option<String>,
    pub gname: Option<String>,
}

impl ArchiveEntry {
    fn new(kind: EntryKind, mode: u32) -> ArchiveEntry {
        ArchiveEntry {
            kind,
            mode,
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
        }
    }
}

/// In-memory archive being assembled for one execution run.
#[derive(Debug, Default)]
pub struct ArchiveBackend {
    // BTreeMap keys give the deterministic entry order; parents sort
    // before their children.
    entries: BTreeMap<PathBuf, ArchiveEntry>,
}

impl ArchiveBackend {
    /// An archive with no staged content; instructions that create entries
    /// (device nodes) still work.
    pub fn new() -> ArchiveBackend {
        ArchiveBackend::default()
    }

    /// Scan a staged tree into archive entries. Modes are taken from disk;
    /// ownership starts at root (0:0) like any reproducible image build,
    /// with instructions as the only way to deviate.
    pub fn from_staging(staging: &Path) -> Result<ArchiveBackend> {
        use std::os::unix::fs::PermissionsExt;

        let mut backend = ArchiveBackend::new();
        for dir_entry in WalkDir::new(staging).follow_links(false) {
            let dir_entry = dir_entry
                .with_context(|| format!("scanning staging tree {}", staging.display()))?;
            let path = dir_entry.path();
            if path == staging {
                continue;
            }
            let rel = path
                .strip_prefix(staging)
                .unwrap_or(path)
                .to_path_buf();

            let md = fs::symlink_metadata(path)
                .with_context(|| format!("reading metadata for {}", path.display()))?;
            let mode = md.permissions().mode() & 0o7777;
            let kind = if md.is_dir() {
                EntryKind::Directory
            } else if md.file_type().is_symlink() {
                let target = fs::read_link(path)
                    .with_context(|| format!("reading symlink {}", path.display()))?;
                EntryKind::Symlink { target }
            } else {
                EntryKind::File {
                    size: md.len(),
                    staged: path.to_path_buf(),
                }
            };
            backend.entries.insert(rel, ArchiveEntry::new(kind, mode));
        }
        Ok(backend)
    }

    pub fn entry(&self, rel: &Path) -> Option<&ArchiveEntry> {
        self.entries.get(rel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the archive. A `.zst` output name gets a zstd-compressed
    /// stream, anything else a plain tar.
    pub fn write_tar(&self, output: &Path) -> Result<()> {
        let out = File::create(output)
            .with_context(|| format!("creating archive {}", output.display()))?;
        if output.extension().is_some_and(|ext| ext == "zst") {
            let encoder = zstd::stream::Encoder::new(out, 3)?;
            let encoder = self.write_to(encoder)?;
            encoder.finish()?;
        } else {
            self.write_to(out)?;
        }
        Ok(())
    }

    /// Write all entries as a GNU tar stream and return the inner writer.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<W> {
        let mut builder = tar::Builder::new(writer);

        for (rel, entry) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_uid(u64::from(entry.uid));
            header.set_gid(u64::from(entry.gid));
            header.set_mtime(0);
            if let Some(uname) = &entry.uname {
                header
                    .set_username(uname)
                    .with_context(|| format!("recording user name for {}", rel.display()))?;
            }
            if let Some(gname) = &entry.gname {
                header
                    .set_groupname(gname)
                    .with_context(|| format!("recording group name for {}", rel.display()))?;
            }

            match &entry.kind {
                EntryKind::Directory => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append_data(&mut header, rel, std::io::empty())?;
                }
                EntryKind::File { size, staged } => {
                    let mut content = File::open(staged)
                        .with_context(|| format!("opening staged file {}", staged.display()))?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(*size);
                    header.set_cksum();
                    builder.append_data(&mut header, rel, &mut content)?;
                }
                EntryKind::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_link_name(target)?;
                    header.set_cksum();
                    builder.append_data(&mut header, rel, std::io::empty())?;
                }
                EntryKind::CharDevice { major, minor } => {
                    header.set_entry_type(tar::EntryType::Char);
                    header.set_size(0);
                    header.set_device_major(*major)?;
                    header.set_device_minor(*minor)?;
                    header.set_cksum();
                    builder.append_data(&mut header, rel, std::io::empty())?;
                }
                EntryKind::BlockDevice { major, minor } => {
                    header.set_entry_type(tar::EntryType::Block);
                    header.set_size(0);
                    header.set_device_major(*major)?;
                    header.set_device_minor(*minor)?;
                    header.set_cksum();
                    builder.append_data(&mut header, rel, std::io::empty())?;
                }
            }
        }

        builder.into_inner().context("finishing archive stream")
    }
}

impl Backend for ArchiveBackend {
    fn describe_target(&self) -> String {
        format!("archive ({} staged entries)", self.entries.len())
    }

    fn apply(&mut self, entry: &InstructionEntry) -> Result<(), ExecutionError> {
        match &entry.instruction {
            Instruction::Chown {
                root,
                spec,
                user,
                group,
            } => {
                let rel = resolve::resolve_rel(root, spec)?;
                let target = self
                    .entries
                    .get_mut(&rel)
                    .ok_or(ExecutionError::NoSuchEntry { path: rel })?;
                match user {
                    Some(OwnerRef::Id(id)) => {
                        target.uid = *id;
                        target.uname = None;
                    }
                    Some(OwnerRef::Name(name)) => target.uname = Some(name.clone()),
                    None => {}
                }
                match group {
                    Some(OwnerRef::Id(id)) => {
                        target.gid = *id;
                        target.gname = None;
                    }
                    Some(OwnerRef::Name(name)) => target.gname = Some(name.clone()),
                    None => {}
                }
                Ok(())
            }
            Instruction::Chmod { root, spec, mode } => {
                let rel = resolve::resolve_rel(root, spec)?;
                let target = self
                    .entries
                    .get_mut(&rel)
                    .ok_or(ExecutionError::NoSuchEntry { path: rel })?;
                target.mode = *mode;
                Ok(())
            }
            Instruction::Mknod {
                name,
                uid,
                gid,
                kind,
                major,
                minor,
                mode,
            } => {
                let rel = resolve::normalize(name)?;
                if self.entries.contains_key(&rel) {
                    return Err(ExecutionError::NodeExists { path: rel });
                }
                let entry_kind = match kind {
                    DeviceKind::Char => EntryKind::CharDevice {
                        major: *major,
                        minor: *minor,
                    },
                    DeviceKind::Block => EntryKind::BlockDevice {
                        major: *major,
                        minor: *minor,
                    },
                };
                let mut archive_entry = ArchiveEntry::new(entry_kind, *mode);
                archive_entry.uid = *uid;
                archive_entry.gid = *gid;
                self.entries.insert(rel, archive_entry);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Source;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn entry(instruction: Instruction) -> InstructionEntry {
        InstructionEntry {
            priority: 50,
            source: Source::new("pkg", "role"),
            instruction,
        }
    }

    fn staged_tree() -> (TempDir, ArchiveBackend) {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("etc")).unwrap();
        fs::write(staging.join("etc/passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();
        fs::write(staging.join("etc/motd"), "welcome\n").unwrap();
        std::os::unix::fs::symlink("passwd", staging.join("etc/passwd.old")).unwrap();
        let backend = ArchiveBackend::from_staging(&staging).unwrap();
        (temp, backend)
    }

    #[test]
    fn test_from_staging_scans_tree() {
        let (_temp, backend) = staged_tree();
        assert_eq!(backend.len(), 4);
        assert!(matches!(
            backend.entry(Path::new("etc")).unwrap().kind,
            EntryKind::Directory
        ));
        assert!(matches!(
            backend.entry(Path::new("etc/passwd")).unwrap().kind,
            EntryKind::File { .. }
        ));
        assert!(matches!(
            backend.entry(Path::new("etc/passwd.old")).unwrap().kind,
            EntryKind::Symlink { .. }
        ));
    }

    #[test]
    fn test_chmod_and_chown_rewrite_metadata() {
        let (_temp, mut backend) = staged_tree();

        backend
            .apply(&entry(Instruction::Chmod {
                root: "etc".into(),
                spec: "passwd".into(),
                mode: 0o600,
            }))
            .unwrap();
        backend
            .apply(&entry(Instruction::Chown {
                root: "etc".into(),
                spec: "passwd".into(),
                user: Some(OwnerRef::Id(123)),
                group: Some(OwnerRef::Name("shadow".into())),
            }))
            .unwrap();

        let e = backend.entry(Path::new("etc/passwd")).unwrap();
        assert_eq!(e.mode, 0o600);
        assert_eq!(e.uid, 123);
        assert_eq!(e.gname.as_deref(), Some("shadow"));
    }

    #[test]
    fn test_chmod_missing_entry_fails() {
        let (_temp, mut backend) = staged_tree();
        let err = backend
            .apply(&entry(Instruction::Chmod {
                root: "etc".into(),
                spec: "nope".into(),
                mode: 0o600,
            }))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoSuchEntry { .. }));
    }

    #[test]
    fn test_mknod_inserts_standalone_device_entry() {
        // No staged content at all: the device entry stands alone.
        let mut backend = ArchiveBackend::new();
        backend
            .apply(&entry(Instruction::Mknod {
                name: "/dev/console".into(),
                uid: 0,
                gid: 0,
                kind: DeviceKind::Char,
                major: 5,
                minor: 1,
                mode: 0o600,
            }))
            .unwrap();

        let e = backend.entry(Path::new("dev/console")).unwrap();
        assert_eq!(
            e.kind,
            EntryKind::CharDevice { major: 5, minor: 1 }
        );
        assert_eq!(e.mode, 0o600);
    }

    #[test]
    fn test_mknod_duplicate_entry_conflicts() {
        let mut backend = ArchiveBackend::new();
        let mknod = Instruction::Mknod {
            name: "dev/null".into(),
            uid: 0,
            gid: 0,
            kind: DeviceKind::Char,
            major: 1,
            minor: 3,
            mode: 0o666,
        };
        backend.apply(&entry(mknod.clone())).unwrap();
        let err = backend.apply(&entry(mknod)).unwrap_err();
        assert!(matches!(err, ExecutionError::NodeExists { .. }));
    }

    #[test]
    fn test_rendered_tar_carries_device_metadata() {
        let mut backend = ArchiveBackend::new();
        backend
            .apply(&entry(Instruction::Mknod {
                name: "/dev/console".into(),
                uid: 0,
                gid: 0,
                kind: DeviceKind::Char,
                major: 5,
                minor: 1,
                mode: 0o600,
            }))
            .unwrap();

        let bytes = backend.write_to(Cursor::new(Vec::new())).unwrap().into_inner();
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let entries: Vec<_> = archive.entries().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);

        let header = entries[0].header();
        assert_eq!(entries[0].path().unwrap().as_ref(), Path::new("dev/console"));
        assert_eq!(header.entry_type(), tar::EntryType::Char);
        assert_eq!(header.device_major().unwrap(), Some(5));
        assert_eq!(header.device_minor().unwrap(), Some(1));
        assert_eq!(header.mode().unwrap() & 0o7777, 0o600);
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
    }

    #[test]
    fn test_rendered_tar_is_deterministic_and_streams_content() {
        let (_temp, backend) = staged_tree();
        let first = backend.write_to(Cursor::new(Vec::new())).unwrap().into_inner();
        let second = backend.write_to(Cursor::new(Vec::new())).unwrap().into_inner();
        assert_eq!(first, second);

        let mut archive = tar::Archive::new(Cursor::new(first));
        let mut names = Vec::new();
        for e in archive.entries().unwrap() {
            let mut e = e.unwrap();
            names.push(e.path().unwrap().into_owned());
            if e.path().unwrap().as_ref() == Path::new("etc/motd") {
                let mut content = String::new();
                std::io::Read::read_to_string(&mut e, &mut content).unwrap();
                assert_eq!(content, "welcome\n");
            }
        }
        // BTreeMap order: parents before children, names sorted.
        assert_eq!(
            names,
            ["etc", "etc/motd", "etc/passwd", "etc/passwd.old"]
                .map(PathBuf::from)
                .to_vec()
        );
    }

    #[test]
    fn test_write_tar_zst_roundtrip() {
        let temp = TempDir::new().unwrap();
        let (_staging_tmp, backend) = staged_tree();
        let out = temp.path().join("image.tar.zst");
        backend.write_tar(&out).unwrap();

        let decoder = zstd::stream::Decoder::new(File::open(&out).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        assert_eq!(archive.entries().unwrap().count(), 4);
    }
}
