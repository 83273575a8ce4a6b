//! Execution backends.
//!
//! The instruction model is backend-agnostic: the same plan can be carried
//! out by mutating a real filesystem subtree ([`DirectBackend`]) or by
//! recording equivalent metadata into an output archive
//! ([`ArchiveBackend`]). Backends are a small closed set selected once per
//! run, not a plugin surface.

pub mod archive;
pub mod direct;

pub use archive::ArchiveBackend;
pub use direct::DirectBackend;

use crate::error::ExecutionError;
use crate::plan::InstructionEntry;

/// Carries out one instruction against this backend's target.
pub trait Backend {
    /// Human-readable target description for progress output.
    fn describe_target(&self) -> String;

    /// Apply one plan entry. Failures are per-entry; whether they abort
    /// the run is the orchestrator's policy, not the backend's.
    fn apply(&mut self, entry: &InstructionEntry) -> Result<(), ExecutionError>;
}
