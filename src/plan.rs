//! Plan assembly: merging per-source instruction sets into one ordered
//! execution plan.
//!
//! Ordering is by priority ascending (higher priorities apply last, so
//! they win on the same path), with ties broken by source enumeration
//! order and then declaration order. The sort is stable, so the merged
//! plan is deterministic for a given input ordering.

use std::fmt;

use crate::instruction::Instruction;

/// Priority assumed for documents that do not declare one.
pub const DEFAULT_PRIORITY: i64 = 50;

/// The originating package + role of an instruction set. Used for
/// diagnostics and for deterministic tie-breaking, never for dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub package: String,
    pub role: String,
}

impl Source {
    pub fn new(package: impl Into<String>, role: impl Into<String>) -> Source {
        Source {
            package: package.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.package, self.role)
    }
}

/// One instruction together with its declared priority and provenance.
///
/// Two entries are never considered "the same" even with identical
/// content; conflicting instructions on one path are applied faithfully
/// in plan order and the later one wins.
#[derive(Debug, Clone)]
pub struct InstructionEntry {
    pub priority: i64,
    pub source: Source,
    pub instruction: Instruction,
}

/// The fully merged, priority-ordered sequence of instructions for one
/// execution run. Built completely before any execution begins.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    entries: Vec<InstructionEntry>,
}

impl ExecutionPlan {
    /// Merge instruction sets, preserving per-source order, then stable
    /// sort by priority ascending. Nothing is dropped or deduplicated.
    pub fn build(sets: Vec<Vec<InstructionEntry>>) -> ExecutionPlan {
        let mut entries: Vec<InstructionEntry> = sets.into_iter().flatten().collect();
        // Vec::sort_by_key is stable: equal priorities keep their
        // concatenation order (source enumeration, then declaration).
        entries.sort_by_key(|entry| entry.priority);
        ExecutionPlan { entries }
    }

    pub fn entries(&self) -> &[InstructionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any instruction in the plan generally requires privilege
    /// when applied to a real filesystem.
    pub fn needs_privilege(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.instruction.needs_privilege())
    }
}
