//! The instruction model: declarative filesystem-metadata operations.
//!
//! Instructions describe WHAT should happen to a path in the deployed tree
//! (ownership, permission bits, device nodes); a backend decides HOW that
//! is carried out. The set of kinds is closed: backends must understand
//! every kind they are handed, so new kinds are added here deliberately,
//! not through an extension mechanism.

use std::fmt;

use crate::error::ValidationError;

/// A user or group reference: either a symbolic name to be resolved
/// against the host database, or a numeric id used as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerRef {
    Name(String),
    Id(u32),
}

impl OwnerRef {
    /// Numeric text (decimal, `0x` hex, leading-zero octal) becomes an id;
    /// anything else is a symbolic name.
    pub fn parse(text: &str) -> OwnerRef {
        match parse_number(text) {
            Ok(id) => OwnerRef::Id(id),
            Err(_) => OwnerRef::Name(text.to_string()),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRef::Name(name) => write!(f, "{}", name),
            OwnerRef::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Device node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    /// Recognizes the document spelling of a device type.
    pub fn parse(text: &str) -> Option<DeviceKind> {
        match text {
            "char" => Some(DeviceKind::Char),
            "block" => Some(DeviceKind::Block),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Char => write!(f, "char"),
            DeviceKind::Block => write!(f, "block"),
        }
    }
}

/// One declarative operation on the deployed tree. Immutable once parsed.
///
/// `root`/`spec` name a directory in the target and one literal filename in
/// it. A `Mknod` name is stored target-relative (leading separators are
/// stripped at load time, never at execution time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Change owner and/or group. An absent field leaves that attribute
    /// unchanged.
    Chown {
        root: String,
        spec: String,
        user: Option<OwnerRef>,
        group: Option<OwnerRef>,
    },

    /// Change permission bits. The mode fully replaces the permission bits
    /// of the target; the file type is untouched.
    Chmod { root: String, spec: String, mode: u32 },

    /// Create a device special file.
    Mknod {
        name: String,
        uid: u32,
        gid: u32,
        kind: DeviceKind,
        major: u32,
        minor: u32,
        mode: u32,
    },
}

impl Instruction {
    /// Check semantic validity independent of any backend.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |reason: &str| {
            Err(ValidationError {
                context: self.to_string(),
                reason: reason.to_string(),
            })
        };

        match self {
            Instruction::Chown {
                root,
                spec,
                user,
                group,
            } => {
                if root.is_empty() || spec.is_empty() {
                    return fail("root and spec must be non-empty");
                }
                if user.is_none() && group.is_none() {
                    return fail("at least one of user/group is required");
                }
            }
            Instruction::Chmod { root, spec, mode } => {
                if root.is_empty() || spec.is_empty() {
                    return fail("root and spec must be non-empty");
                }
                if *mode > 0o7777 {
                    return fail("mode is out of range (max 07777)");
                }
            }
            Instruction::Mknod { name, mode, .. } => {
                if name.is_empty() {
                    return fail("device name must be non-empty");
                }
                if *mode > 0o7777 {
                    return fail("mode is out of range (max 07777)");
                }
            }
        }
        Ok(())
    }

    /// Whether applying this against a real filesystem generally requires
    /// privilege. Changing ownership and creating device nodes do; changing
    /// permission bits on files you own does not.
    pub fn needs_privilege(&self) -> bool {
        match self {
            Instruction::Chown { .. } | Instruction::Mknod { .. } => true,
            Instruction::Chmod { .. } => false,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Chown {
                root,
                spec,
                user,
                group,
            } => match (user, group) {
                (Some(u), Some(g)) => write!(f, "chown {}:{} {}/{}", u, g, root, spec),
                (Some(u), None) => write!(f, "chown {} {}/{}", u, root, spec),
                (None, Some(g)) => write!(f, "chgrp {} {}/{}", g, root, spec),
                (None, None) => write!(f, "chown ?:? {}/{}", root, spec),
            },
            Instruction::Chmod { root, spec, mode } => {
                write!(f, "chmod {:04o} {}/{}", mode, root, spec)
            }
            Instruction::Mknod {
                name,
                kind,
                major,
                minor,
                mode,
                uid,
                gid,
            } => write!(
                f,
                "mknod {} {} {}:{} mode {:04o} uid {} gid {}",
                name, kind, major, minor, mode, uid, gid
            ),
        }
    }
}

/// Parse a numeric field, accepting decimal, `0x`-prefixed hexadecimal, and
/// leading-zero octal text. The base does not survive parsing: `0x1A`,
/// `032` and `26` all yield 26.
pub fn parse_number(text: &str) -> Result<u32, String> {
    let t = text.trim();
    if t.is_empty() {
        return Err("empty numeric value".to_string());
    }
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if t.len() > 1 && t.starts_with('0') {
        u32::from_str_radix(&t[1..], 8)
    } else {
        t.parse::<u32>()
    };
    parsed.map_err(|_| format!("invalid numeric value '{}'", text))
}

/// Parse a mode expression. Only octal modes are supported; symbolic
/// expressions (`u+x` and friends) are rejected with an error naming the
/// value, as in the original tooling this replaces.
pub fn parse_mode(text: &str) -> Result<u32, String> {
    let t = text.trim();
    match t.chars().next() {
        Some('0'..='9') => {
            let mode = u32::from_str_radix(t, 8)
                .map_err(|_| format!("invalid octal mode '{}'", text))?;
            if mode > 0o7777 {
                return Err(format!("mode '{}' is out of range (max 07777)", text));
            }
            Ok(mode)
        }
        _ => Err(format!("unsupported mode expression '{}'", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_all_bases() {
        // Same value in all three encodings.
        assert_eq!(parse_number("26").unwrap(), 26);
        assert_eq!(parse_number("0x1A").unwrap(), 26);
        assert_eq!(parse_number("0X1a").unwrap(), 26);
        assert_eq!(parse_number("032").unwrap(), 26);
    }

    #[test]
    fn test_parse_number_zero_and_rejects() {
        assert_eq!(parse_number("0").unwrap(), 0);
        assert_eq!(parse_number("00").unwrap(), 0);
        assert!(parse_number("").is_err());
        assert!(parse_number("-1").is_err());
        assert!(parse_number("five").is_err());
        assert!(parse_number("09").is_err(), "9 is not an octal digit");
        assert!(parse_number("0xZZ").is_err());
    }

    #[test]
    fn test_parse_mode_octal() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("7777").unwrap(), 0o7777);
        assert_eq!(parse_mode("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_mode_rejects_symbolic_and_range() {
        assert!(parse_mode("u+x").is_err());
        assert!(parse_mode("a=rwx").is_err());
        assert!(parse_mode("").is_err());
        assert!(parse_mode("17777").is_err());
        assert!(parse_mode("648").is_err(), "8 is not an octal digit");
    }

    #[test]
    fn test_owner_ref_parse() {
        assert_eq!(OwnerRef::parse("root"), OwnerRef::Name("root".into()));
        assert_eq!(OwnerRef::parse("0"), OwnerRef::Id(0));
        assert_eq!(OwnerRef::parse("0x1A"), OwnerRef::Id(26));
    }

    #[test]
    fn test_validate_chown_requires_user_or_group() {
        let instr = Instruction::Chown {
            root: "etc".into(),
            spec: "passwd".into(),
            user: None,
            group: None,
        };
        assert!(instr.validate().is_err());

        let instr = Instruction::Chown {
            root: "etc".into(),
            spec: "passwd".into(),
            user: Some(OwnerRef::Name("root".into())),
            group: None,
        };
        assert!(instr.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_paths() {
        let instr = Instruction::Chmod {
            root: "".into(),
            spec: "passwd".into(),
            mode: 0o644,
        };
        assert!(instr.validate().is_err());

        let instr = Instruction::Mknod {
            name: "".into(),
            uid: 0,
            gid: 0,
            kind: DeviceKind::Char,
            major: 5,
            minor: 1,
            mode: 0o600,
        };
        assert!(instr.validate().is_err());
    }

    #[test]
    fn test_validate_mode_range() {
        let instr = Instruction::Mknod {
            name: "dev/console".into(),
            uid: 0,
            gid: 0,
            kind: DeviceKind::Char,
            major: 5,
            minor: 1,
            mode: 0o10000,
        };
        assert!(instr.validate().is_err());
    }

    #[test]
    fn test_needs_privilege() {
        let chmod = Instruction::Chmod {
            root: "etc".into(),
            spec: "passwd".into(),
            mode: 0o644,
        };
        let chown = Instruction::Chown {
            root: "etc".into(),
            spec: "passwd".into(),
            user: Some(OwnerRef::Id(0)),
            group: None,
        };
        assert!(!chmod.needs_privilege());
        assert!(chown.needs_privilege());
    }

    #[test]
    fn test_display_summaries() {
        let chgrp = Instruction::Chown {
            root: "etc".into(),
            spec: "shadow".into(),
            user: None,
            group: Some(OwnerRef::Name("shadow".into())),
        };
        assert_eq!(chgrp.to_string(), "chgrp shadow etc/shadow");

        let mknod = Instruction::Mknod {
            name: "dev/console".into(),
            uid: 0,
            gid: 0,
            kind: DeviceKind::Char,
            major: 5,
            minor: 1,
            mode: 0o600,
        };
        assert_eq!(
            mknod.to_string(),
            "mknod dev/console char 5:1 mode 0600 uid 0 gid 0"
        );
    }
}
