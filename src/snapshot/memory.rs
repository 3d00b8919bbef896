//! # In-Memory Snapshots
//!
//! A [`SnapshotProvider`] holding trees in process memory. Every
//! [`MemorySnapshots::commit`] creates a new immutable snapshot and moves a
//! reference to it, the way a commit moves a branch.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, PoisonError, RwLock};

use super::errors::{SnapshotError, SnapshotResult};
use super::{BlobRef, ContentStream, EntryIter, SnapshotId, SnapshotProvider, TreeEntry};

#[derive(Debug, Default)]
struct MemoryState {
    refs: HashMap<String, SnapshotId>,
    trees: HashMap<SnapshotId, Vec<TreeEntry>>,
    blobs: HashMap<BlobRef, Arc<[u8]>>,
    next_snapshot: u64,
    next_blob: u64,
}

/// Snapshot store kept in memory
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    state: RwLock<MemoryState>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new snapshot made of `files` and point `reference` at it.
    ///
    /// Files keep the given order, duplicates included.
    pub fn commit<P, C>(&self, reference: &str, files: Vec<(P, C)>) -> SnapshotId
    where
        P: Into<String>,
        C: AsRef<[u8]>,
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        state.next_snapshot += 1;
        let id = SnapshotId::new(format!("snapshot-{}", state.next_snapshot));

        let mut entries = Vec::with_capacity(files.len());
        for (path, content) in files {
            state.next_blob += 1;
            let blob = BlobRef::new(format!("blob-{}", state.next_blob));
            state.blobs.insert(blob.clone(), Arc::from(content.as_ref()));
            entries.push(TreeEntry::new(path, blob));
        }

        state.trees.insert(id.clone(), entries);
        state.refs.insert(reference.to_string(), id.clone());
        id
    }

    /// Point `reference` at an existing snapshot
    pub fn set_reference(&self, reference: &str, snapshot: &SnapshotId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.refs.insert(reference.to_string(), snapshot.clone());
    }

    /// Delete `reference`; the snapshot it pointed at stays readable
    pub fn remove_reference(&self, reference: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.refs.remove(reference);
    }
}

impl SnapshotProvider for MemorySnapshots {
    fn resolve(&self, reference: &str) -> SnapshotResult<Option<SnapshotId>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.refs.get(reference).cloned())
    }

    fn entries(&self, snapshot: &SnapshotId) -> SnapshotResult<EntryIter<'_>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let entries = state
            .trees
            .get(snapshot)
            .cloned()
            .ok_or_else(|| SnapshotError::UnknownSnapshot(snapshot.to_string()))?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn open_blob(&self, blob: &BlobRef) -> SnapshotResult<ContentStream> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = state
            .blobs
            .get(blob)
            .cloned()
            .ok_or_else(|| SnapshotError::UnknownBlob(blob.as_str().to_string()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
