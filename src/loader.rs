//! Loading instruction documents.
//!
//! A document is TOML with one root container: an optional whole-document
//! `priority` and an ordered `[[instruction]]` array. Parsing happens in
//! two passes, raw serde structs first and a conversion/validation pass
//! second, so problems are reported against the offending element rather
//! than as a generic parse failure.
//!
//! ```toml
//! priority = 10
//!
//! [[instruction]]
//! kind = "chown"
//! root = "etc"
//! spec = "shadow"
//! user = "root"
//! group = "shadow"
//!
//! [[instruction]]
//! kind = "mknod"
//! name = "/dev/console"
//! type = "char"
//! uid = 0
//! gid = 0
//! major = 5
//! minor = 1
//! mode = "0600"
//! ```
//!
//! Loading is all-or-nothing per document: any bad element means zero
//! instructions from that source. Numeric fields accept decimal, `0x` hex
//! and leading-zero octal text as well as bare integers.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ParseError, ValidationError};
use crate::instruction::{parse_mode, parse_number, DeviceKind, Instruction, OwnerRef};
use crate::plan::{InstructionEntry, Source, DEFAULT_PRIORITY};
use crate::resolve;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i64>,
    #[serde(default, rename = "instruction", skip_serializing_if = "Vec::is_empty")]
    instructions: Vec<RawInstruction>,
}

/// Union of the fields of all instruction kinds. Which ones are required
/// (and which are foreign) depends on `kind` and is checked in the
/// conversion pass.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInstruction {
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gid: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    major: Option<RawScalar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minor: Option<RawScalar>,
}

/// A field that may be written as a bare integer or as text (`"0x1A"`,
/// `"032"`, a user name, an octal mode).
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Text(String),
}

/// Parse one instruction document into ordered entries for `source`.
///
/// Declaration order is preserved. The document-level `priority` (default
/// [`DEFAULT_PRIORITY`]) applies to every contained instruction. Parse,
/// validation and path-escape problems all surface here, before any
/// execution can begin.
pub fn load(document: &str, source: &Source) -> Result<Vec<InstructionEntry>, Error> {
    let raw: RawDocument = toml::from_str(document).map_err(|err| ParseError::Document {
        source_label: source.to_string(),
        reason: err.message().to_string(),
    })?;
    let priority = raw.priority.unwrap_or(DEFAULT_PRIORITY);

    let mut entries = Vec::with_capacity(raw.instructions.len());
    for (index, element) in raw.instructions.iter().enumerate() {
        let instruction = convert(element, source, index)?;

        instruction.validate().map_err(|err| ValidationError {
            context: format!("{}: instruction {}: {}", source, index, err.context),
            reason: err.reason,
        })?;

        // Refuse escapes at load time so a bad set never reaches a backend.
        match &instruction {
            Instruction::Chown { root, spec, .. } | Instruction::Chmod { root, spec, .. } => {
                resolve::resolve_rel(root, spec)?;
            }
            Instruction::Mknod { name, .. } => {
                resolve::normalize(name)?;
            }
        }

        entries.push(InstructionEntry {
            priority,
            source: source.clone(),
            instruction,
        });
    }
    Ok(entries)
}

/// Serialize a loaded set back into a document, the inverse of [`load`].
/// Orchestrators use this to record the instruction files they applied.
pub fn render(priority: i64, instructions: &[Instruction]) -> anyhow::Result<String> {
    let raw = RawDocument {
        priority: Some(priority),
        instructions: instructions.iter().map(to_raw).collect(),
    };
    toml::to_string_pretty(&raw).context("serializing instruction document")
}

fn convert(raw: &RawInstruction, source: &Source, index: usize) -> Result<Instruction, ParseError> {
    let element = |reason: String| ParseError::Element {
        source_label: source.to_string(),
        index,
        kind: raw.kind.clone(),
        reason,
    };

    let instruction = match raw.kind.as_str() {
        "chown" => {
            reject_foreign_fields(raw, &["root", "spec", "user", "group"]).map_err(&element)?;
            Instruction::Chown {
                root: require(&raw.root, "root").map_err(&element)?.clone(),
                spec: require(&raw.spec, "spec").map_err(&element)?.clone(),
                user: raw.user.as_ref().map(scalar_to_owner).transpose().map_err(&element)?,
                group: raw.group.as_ref().map(scalar_to_owner).transpose().map_err(&element)?,
            }
        }
        "chmod" => {
            reject_foreign_fields(raw, &["root", "spec", "mode"]).map_err(&element)?;
            Instruction::Chmod {
                root: require(&raw.root, "root").map_err(&element)?.clone(),
                spec: require(&raw.spec, "spec").map_err(&element)?.clone(),
                mode: scalar_to_mode(require(&raw.mode, "mode").map_err(&element)?)
                    .map_err(&element)?,
            }
        }
        "mknod" => {
            reject_foreign_fields(raw, &["name", "type", "uid", "gid", "major", "minor", "mode"])
                .map_err(&element)?;
            let declared = require(&raw.name, "name").map_err(&element)?;
            let type_text = require(&raw.device_type, "type").map_err(&element)?;
            let kind = DeviceKind::parse(type_text).ok_or_else(|| {
                element(format!(
                    "unrecognized device type '{}' (expected 'char' or 'block')",
                    type_text
                ))
            })?;
            Instruction::Mknod {
                // Stored target-relative: leading separators go now, not
                // at execution time.
                name: declared.trim_start_matches('/').to_string(),
                uid: scalar_to_u32(require(&raw.uid, "uid").map_err(&element)?, "uid")
                    .map_err(&element)?,
                gid: scalar_to_u32(require(&raw.gid, "gid").map_err(&element)?, "gid")
                    .map_err(&element)?,
                kind,
                major: scalar_to_u32(require(&raw.major, "major").map_err(&element)?, "major")
                    .map_err(&element)?,
                minor: scalar_to_u32(require(&raw.minor, "minor").map_err(&element)?, "minor")
                    .map_err(&element)?,
                mode: scalar_to_mode(require(&raw.mode, "mode").map_err(&element)?)
                    .map_err(&element)?,
            }
        }
        other => {
            return Err(ParseError::UnsupportedKind {
                source_label: source.to_string(),
                index,
                kind: other.to_string(),
            })
        }
    };
    Ok(instruction)
}

fn require<'a, T>(field: &'a Option<T>, field_name: &str) -> Result<&'a T, String> {
    field
        .as_ref()
        .ok_or_else(|| format!("missing required field '{}'", field_name))
}

/// A field belonging to a different kind is an authoring mistake, not
/// something to skip silently.
fn reject_foreign_fields(raw: &RawInstruction, allowed: &[&str]) -> Result<(), String> {
    let present = [
        ("root", raw.root.is_some()),
        ("spec", raw.spec.is_some()),
        ("user", raw.user.is_some()),
        ("group", raw.group.is_some()),
        ("mode", raw.mode.is_some()),
        ("name", raw.name.is_some()),
        ("type", raw.device_type.is_some()),
        ("uid", raw.uid.is_some()),
        ("gid", raw.gid.is_some()),
        ("major", raw.major.is_some()),
        ("minor", raw.minor.is_some()),
    ];
    for (field_name, is_set) in present {
        if is_set && !allowed.contains(&field_name) {
            return Err(format!(
                "field '{}' is not valid for '{}' instructions",
                field_name, raw.kind
            ));
        }
    }
    Ok(())
}

fn scalar_to_u32(value: &RawScalar, field_name: &str) -> Result<u32, String> {
    match value {
        RawScalar::Int(i) => {
            u32::try_from(*i).map_err(|_| format!("invalid {} value {}", field_name, i))
        }
        RawScalar::Text(text) => {
            parse_number(text).map_err(|reason| format!("{}: {}", field_name, reason))
        }
    }
}

fn scalar_to_mode(value: &RawScalar) -> Result<u32, String> {
    match value {
        // A bare integer is taken at face value (TOML supports 0o644);
        // text modes are octal, as in `chmod`.
        RawScalar::Int(i) => {
            let mode = u32::try_from(*i).map_err(|_| format!("invalid mode value {}", i))?;
            if mode > 0o7777 {
                return Err(format!("mode {:o} is out of range (max 07777)", mode));
            }
            Ok(mode)
        }
        RawScalar::Text(text) => parse_mode(text),
    }
}

fn scalar_to_owner(value: &RawScalar) -> Result<OwnerRef, String> {
    match value {
        RawScalar::Int(i) => u32::try_from(*i)
            .map(OwnerRef::Id)
            .map_err(|_| format!("invalid numeric owner {}", i)),
        RawScalar::Text(text) => Ok(OwnerRef::parse(text)),
    }
}

fn to_raw(instruction: &Instruction) -> RawInstruction {
    let owner_to_raw = |owner: &OwnerRef| match owner {
        OwnerRef::Name(name) => RawScalar::Text(name.clone()),
        OwnerRef::Id(id) => RawScalar::Int(i64::from(*id)),
    };
    match instruction {
        Instruction::Chown {
            root,
            spec,
            user,
            group,
        } => RawInstruction {
            kind: "chown".to_string(),
            root: Some(root.clone()),
            spec: Some(spec.clone()),
            user: user.as_ref().map(owner_to_raw),
            group: group.as_ref().map(owner_to_raw),
            ..Default::default()
        },
        Instruction::Chmod { root, spec, mode } => RawInstruction {
            kind: "chmod".to_string(),
            root: Some(root.clone()),
            spec: Some(spec.clone()),
            mode: Some(RawScalar::Text(format!("{:04o}", mode))),
            ..Default::default()
        },
        Instruction::Mknod {
            name,
            uid,
            gid,
            kind,
            major,
            minor,
            mode,
        } => RawInstruction {
            kind: "mknod".to_string(),
            name: Some(name.clone()),
            device_type: Some(kind.to_string()),
            uid: Some(RawScalar::Int(i64::from(*uid))),
            gid: Some(RawScalar::Int(i64::from(*gid))),
            major: Some(RawScalar::Int(i64::from(*major))),
            minor: Some(RawScalar::Int(i64::from(*minor))),
            mode: Some(RawScalar::Text(format!("{:04o}", mode))),
            ..Default::default()
        },
    }
}
