//! # Request Dispatch
//!
//! Snapshot-scoped compilation cache and the per-request dispatch chain:
//! script binding, processors, static serving and fault escalation.

pub mod cache;
pub mod dispatcher;
pub mod error_page;
pub mod exclude;

pub use cache::{CompilationCache, CompileOutcome, SnapshotHandlerSet, DEFAULT_CACHE_CAPACITY};
pub use dispatcher::{normalize_path, RequestDispatcher, NOT_FOUND_MESSAGE};
pub use exclude::ExcludeRules;
