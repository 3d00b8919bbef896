//! # Snapshot Access
//!
//! Read-only view over a revision-addressed content tree.
//!
//! A mutable reference (branch, tag, `HEAD`) resolves to an immutable
//! [`SnapshotId`]; the snapshot's entries are listed as `(path, blob)`
//! pairs and blobs are opened as byte streams. Two providers ship with
//! the crate: [`GitCliProvider`] for real repositories and
//! [`MemorySnapshots`] for tests.

pub mod errors;
pub mod git;
pub mod memory;

use std::fmt;
use std::io::Read;
use std::sync::Arc;

pub use errors::{SnapshotError, SnapshotResult};
pub use git::GitCliProvider;
pub use memory::MemorySnapshots;

/// Reference consulted first when the alternate reference is allowed
pub const DEFAULT_STASH_REFERENCE: &str = "refs/stash";

/// Immutable identifier of a revision's content tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a blob inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One file of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated
    pub path: String,

    /// Blob holding the file content
    pub blob: BlobRef,
}

impl TreeEntry {
    pub fn new(path: impl Into<String>, blob: BlobRef) -> Self {
        Self {
            path: path.into(),
            blob,
        }
    }
}

/// Byte stream of an opened blob
pub type ContentStream = Box<dyn Read + Send>;

/// Lazy listing of a snapshot's entries
pub type EntryIter<'a> = Box<dyn Iterator<Item = SnapshotResult<TreeEntry>> + Send + 'a>;

/// Source of revision-addressed content
pub trait SnapshotProvider: Send + Sync {
    /// Resolve a reference; `Ok(None)` when the reference does not exist
    fn resolve(&self, reference: &str) -> SnapshotResult<Option<SnapshotId>>;

    /// List every blob of the snapshot, recursively, in tree order
    fn entries(&self, snapshot: &SnapshotId) -> SnapshotResult<EntryIter<'_>>;

    /// Open a blob for reading
    fn open_blob(&self, blob: &BlobRef) -> SnapshotResult<ContentStream>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Resolves the configured reference, honouring the alternate reference
/// when it is allowed and present.
#[derive(Clone)]
pub struct ReferenceResolver {
    provider: Arc<dyn SnapshotProvider>,
    reference: String,
    alternate: Option<String>,
}

impl ReferenceResolver {
    pub fn new(provider: Arc<dyn SnapshotProvider>, reference: impl Into<String>) -> Self {
        Self {
            provider,
            reference: reference.into(),
            alternate: None,
        }
    }

    /// Give `alternate` priority over the configured reference whenever it resolves
    pub fn with_alternate(mut self, alternate: impl Into<String>) -> Self {
        self.alternate = Some(alternate.into());
        self
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn provider(&self) -> &Arc<dyn SnapshotProvider> {
        &self.provider
    }

    /// Resolve to the snapshot that should serve the next request
    pub fn resolve(&self) -> SnapshotResult<SnapshotId> {
        if let Some(alternate) = &self.alternate {
            if let Some(id) = self.provider.resolve(alternate)? {
                tracing::debug!(reference = %alternate, snapshot = %id, "alternate reference in use");
                return Ok(id);
            }
        }

        self.provider
            .resolve(&self.reference)?
            .ok_or_else(|| SnapshotError::UnknownReference(self.reference.clone()))
    }
}

impl fmt::Debug for ReferenceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceResolver")
            .field("provider", &self.provider.name())
            .field("reference", &self.reference)
            .field("alternate", &self.alternate)
            .finish()
    }
}
