//! Error taxonomy for instruction loading and application.
//!
//! Loading problems (`ParseError`, `ValidationError`, `PathEscapeError`)
//! surface before any execution begins, so a bad instruction set never
//! causes partial application. `ExecutionError` is per-instruction; whether
//! it aborts the run is governed by [`crate::engine::ErrorPolicy`].

use std::path::PathBuf;

use thiserror::Error;

/// A document could not be turned into instructions.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document itself is malformed (bad TOML, unknown top-level keys,
    /// a non-integer priority, ...).
    #[error("{source_label}: {reason}")]
    Document { source_label: String, reason: String },

    /// One instruction element is malformed: a missing required field, a
    /// field that does not belong to its kind, or an unparseable value.
    #[error("{source_label}: instruction {index} ({kind}): {reason}")]
    Element {
        source_label: String,
        /// Zero-based position of the element in the document.
        index: usize,
        kind: String,
        reason: String,
    },

    /// An instruction element names a kind this engine does not implement.
    #[error("{source_label}: instruction {index}: unsupported instruction kind '{kind}'")]
    UnsupportedKind {
        source_label: String,
        index: usize,
        kind: String,
    },
}

/// A structurally parsed instruction that is semantically invalid.
#[derive(Debug, Error)]
#[error("{context}: {reason}")]
pub struct ValidationError {
    /// What is being validated (instruction summary, optionally prefixed
    /// with its source and position by the loader).
    pub context: String,
    pub reason: String,
}

/// A declared path resolved outside the target base.
///
/// Never silently clamped: an instruction that tries to climb out of the
/// target is refused outright.
#[derive(Debug, Error)]
#[error("path '{path}' escapes the target base")]
pub struct PathEscapeError {
    /// The declared path as written in the instruction.
    pub path: String,
}

/// A backend failed to apply one instruction.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A symbolic user name is not in the host's user database.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// A symbolic group name is not in the host's group database.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    /// A device node (or any other entry) already occupies the path.
    /// Existing nodes are never overwritten.
    #[error("refusing to overwrite existing node at '{}'", path.display())]
    NodeExists { path: PathBuf },

    /// The archive holds no entry for the path an instruction names.
    #[error("no archive entry for '{}'", path.display())]
    NoSuchEntry { path: PathBuf },

    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ExecutionError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Umbrella error for callers that drive the whole load/plan/apply flow.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
