//! Direct backend: mutates a real filesystem subtree.
//!
//! Symbolic user/group names are resolved against the host's user
//! database; changing ownership and creating device nodes therefore
//! require the run to already hold the necessary privilege (privilege
//! acquisition is the caller's concern; an unprivileged run fails
//! cleanly per instruction).

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::ExecutionError;
use crate::instruction::{DeviceKind, Instruction, OwnerRef};
use crate::plan::InstructionEntry;
use crate::resolve::TargetPath;

use super::Backend;

/// Applies instructions to the tree rooted at `base`.
#[derive(Debug, Clone)]
pub struct DirectBackend {
    base: PathBuf,
}

impl DirectBackend {
    pub fn new(base: impl Into<PathBuf>) -> DirectBackend {
        DirectBackend { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl Backend for DirectBackend {
    fn describe_target(&self) -> String {
        self.base.display().to_string()
    }

    fn apply(&mut self, entry: &InstructionEntry) -> Result<(), ExecutionError> {
        match &entry.instruction {
            Instruction::Chown {
                root,
                spec,
                user,
                group,
            } => {
                let path = TargetPath::resolve(&self.base, root, spec)?.as_path();
                let uid = user.as_ref().map(resolve_uid).transpose()?;
                let gid = group.as_ref().map(resolve_gid).transpose()?;
                chown(&path, uid, gid)
                    .map_err(|err| ExecutionError::io(format!("chown {}", path.display()), err))
            }
            Instruction::Chmod { root, spec, mode } => {
                let path = TargetPath::resolve(&self.base, root, spec)?.as_path();
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode))
                    .map_err(|err| ExecutionError::io(format!("chmod {}", path.display()), err))
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
                let path = TargetPath::resolve_device_name(&self.base, name)?.as_path();
                if path.symlink_metadata().is_ok() {
                    return Err(ExecutionError::NodeExists { path });
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|err| {
                        ExecutionError::io(format!("mkdir -p {}", parent.display()), err)
                    })?;
                }
                mknod(&path, *kind, *major, *minor, *mode)?;
                // mknod is subject to the umask; set the declared bits
                // explicitly, then hand the node to its owner.
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode))
                    .map_err(|err| ExecutionError::io(format!("chmod {}", path.display()), err))?;
                chown(&path, Some(*uid), Some(*gid))
                    .map_err(|err| ExecutionError::io(format!("chown {}", path.display()), err))
            }
        }
    }
}

fn mknod(
    path: &Path,
    kind: DeviceKind,
    major: u32,
    minor: u32,
    mode: u32,
) -> Result<(), ExecutionError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ExecutionError::io(
            format!("mknod {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
        )
    })?;
    let file_type = match kind {
        DeviceKind::Char => libc::S_IFCHR,
        DeviceKind::Block => libc::S_IFBLK,
    };
    let rc = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            file_type | mode,
            libc::makedev(major, minor),
        )
    };
    if rc != 0 {
        return Err(ExecutionError::io(
            format!("mknod {}", path.display()),
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

fn resolve_uid(owner: &OwnerRef) -> Result<u32, ExecutionError> {
    match owner {
        OwnerRef::Id(id) => Ok(*id),
        OwnerRef::Name(name) => {
            let c_name = CString::new(name.as_str())
                .map_err(|_| ExecutionError::UnknownUser(name.clone()))?;
            // The engine is single-threaded; the static result buffer is
            // read out before anything else can touch it.
            let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
            if pw.is_null() {
                Err(ExecutionError::UnknownUser(name.clone()))
            } else {
                Ok(unsafe { (*pw).pw_uid })
            }
        }
    }
}

fn resolve_gid(owner: &OwnerRef) -> Result<u32, ExecutionError> {
    match owner {
        OwnerRef::Id(id) => Ok(*id),
        OwnerRef::Name(name) => {
            let c_name = CString::new(name.as_str())
                .map_err(|_| ExecutionError::UnknownGroup(name.clone()))?;
            let gr = unsafe { libc::getgrnam(c_name.as_ptr()) };
            if gr.is_null() {
                Err(ExecutionError::UnknownGroup(name.clone()))
            } else {
                Ok(unsafe { (*gr).gr_gid })
            }
        }
    }
}
