//! Instruction-application engine for finalizing staged filesystem trees.
//!
//! Build rules stage files into a tree but usually cannot set final
//! ownership, permission bits, or create device nodes: staging may run
//! unprivileged, and whether the result lands on a mounted filesystem or
//! in a packed archive is not known until deployment. This crate splits
//! the two concerns: packages/roles declare small instruction documents
//! (WHAT should happen to a path), and an execution backend decides HOW.
//!
//! # Architecture
//!
//! ```text
//! loader (one document per source)
//!     │  ordered (priority, source, instruction) entries
//!     ▼
//! plan builder ── stable sort by priority ascending
//!     │  immutable ExecutionPlan
//!     ▼
//! engine::run ── applies entries strictly in order
//!     │
//!     ├── DirectBackend   chown/chmod/mknod on a real subtree
//!     └── ArchiveBackend  equivalent metadata on tar entries
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use deploy_instructions::{loader, DirectBackend, ErrorPolicy, ExecutionPlan, Source};
//!
//! let source = Source::new("busybox", "rootfs");
//! let entries = loader::load(&document_text, &source)?;
//! let plan = ExecutionPlan::build(vec![entries]);
//!
//! let mut backend = DirectBackend::new("/tmp/rootfs");
//! let report = deploy_instructions::run(&mut backend, &plan, ErrorPolicy::default());
//! assert!(report.is_success());
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod instruction;
pub mod loader;
pub mod plan;
pub mod resolve;

pub use backend::{ArchiveBackend, Backend, DirectBackend};
pub use engine::{run, ErrorPolicy, Outcome, Report, TargetLock};
pub use error::{Error, ExecutionError, ParseError, PathEscapeError, ValidationError};
pub use instruction::{DeviceKind, Instruction, OwnerRef};
pub use plan::{ExecutionPlan, InstructionEntry, Source, DEFAULT_PRIORITY};
pub use resolve::TargetPath;
