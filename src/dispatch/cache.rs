//! # Compilation Cache
//!
//! One compile pass per snapshot. A single lock guards the whole cache, so
//! snapshot checks and compiles are serialized across every request.
//! Entries are evicted least-recently-used once `capacity` snapshots are
//! resident; an evicted snapshot is compiled again the next time it is
//! resolved.
//!
//! A failed compile is cached like a successful one: the snapshot is served
//! without handlers and is not retried while its entry stays resident.
//!
//! A compile that panics leaves its `Pending` placeholder behind and
//! poisons the lock. The next caller takes the lock back and compiles the
//! snapshot again.

use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::compiler::{LoggingSink, SourceCompiler, SourceUnit};
use crate::handlers::{FaultResult, HandlerRegistry};
use crate::snapshot::{SnapshotError, SnapshotId, SnapshotProvider, SnapshotResult};

/// Default number of resident snapshots
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// State of a snapshot's compile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Placeholder inserted before compiling
    Pending,
    Compiled,
    Failed,
}

impl fmt::Display for CompileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileOutcome::Pending => write!(f, "pending"),
            CompileOutcome::Compiled => write!(f, "compiled"),
            CompileOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Cache entry for one snapshot
#[derive(Debug)]
pub struct SnapshotHandlerSet {
    snapshot: SnapshotId,
    outcome: CompileOutcome,
    registry: HandlerRegistry,
}

impl SnapshotHandlerSet {
    fn new(snapshot: SnapshotId, outcome: CompileOutcome, registry: HandlerRegistry) -> Self {
        Self {
            snapshot,
            outcome,
            registry,
        }
    }

    fn pending(snapshot: SnapshotId) -> Self {
        Self::new(snapshot, CompileOutcome::Pending, HandlerRegistry::empty())
    }

    fn failed(snapshot: SnapshotId) -> Self {
        Self::new(snapshot, CompileOutcome::Failed, HandlerRegistry::empty())
    }

    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    pub fn outcome(&self) -> CompileOutcome {
        self.outcome
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == CompileOutcome::Failed
    }
}

/// Collect the handler sources of a snapshot, sorted by path.
/// Repeated paths keep their first entry.
pub fn collect_sources(
    provider: &dyn SnapshotProvider,
    snapshot: &SnapshotId,
    suffix: &str,
) -> SnapshotResult<Vec<SourceUnit>> {
    let mut seen = HashSet::new();
    let mut units = Vec::new();

    for entry in provider.entries(snapshot)? {
        let entry = entry?;
        if !entry.path.ends_with(suffix) || !seen.insert(entry.path.clone()) {
            continue;
        }

        let mut bytes = Vec::new();
        provider.open_blob(&entry.blob)?.read_to_end(&mut bytes)?;
        let text = String::from_utf8(bytes).map_err(|e| {
            SnapshotError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is not valid UTF-8: {}", entry.path, e),
            ))
        })?;
        units.push(SourceUnit::new(entry.path, text));
    }

    units.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(units)
}

/// Snapshot-keyed cache of handler sets
pub struct CompilationCache {
    compiler: Arc<dyn SourceCompiler>,
    entries: Mutex<LruCache<SnapshotId, Arc<SnapshotHandlerSet>>>,
}

impl CompilationCache {
    pub fn new(compiler: Arc<dyn SourceCompiler>, capacity: NonZeroUsize) -> Self {
        Self {
            compiler,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<SnapshotId, Arc<SnapshotHandlerSet>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("compilation cache lock poisoned by a panicking compile; recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Return the handler set of `snapshot`, compiling it on first use
    pub fn ensure(
        &self,
        provider: &dyn SnapshotProvider,
        snapshot: &SnapshotId,
    ) -> FaultResult<Arc<SnapshotHandlerSet>> {
        let mut entries = self.lock();

        if let Some(set) = entries.get(snapshot) {
            if set.outcome() != CompileOutcome::Pending {
                return Ok(Arc::clone(set));
            }
            tracing::warn!(snapshot = %snapshot, "previous compile was interrupted; compiling again");
        }

        let placeholder = Arc::new(SnapshotHandlerSet::pending(snapshot.clone()));
        if let Some((evicted, _)) = entries.push(snapshot.clone(), placeholder) {
            if evicted != *snapshot {
                tracing::info!(snapshot = %evicted, "evicted snapshot from compilation cache");
            }
        }

        let set = Arc::new(self.build(provider, snapshot));
        entries.put(snapshot.clone(), Arc::clone(&set));
        Ok(set)
    }

    fn build(&self, provider: &dyn SnapshotProvider, snapshot: &SnapshotId) -> SnapshotHandlerSet {
        let units = match collect_sources(provider, snapshot, self.compiler.suffix()) {
            Ok(units) => units,
            Err(e) => {
                tracing::error!(snapshot = %snapshot, "can't read handler sources: {}", e);
                return SnapshotHandlerSet::failed(snapshot.clone());
            }
        };

        if units.is_empty() {
            tracing::info!(snapshot = %snapshot, "no handler sources in snapshot");
            return SnapshotHandlerSet::new(
                snapshot.clone(),
                CompileOutcome::Compiled,
                HandlerRegistry::empty(),
            );
        }

        tracing::info!(
            snapshot = %snapshot,
            sources = units.len(),
            compiler = self.compiler.name(),
            "compiling handler sources"
        );

        let mut sink = LoggingSink;
        match self.compiler.compile(&units, &mut sink) {
            Ok(loader) => {
                let registry = HandlerRegistry::build(loader.as_ref());
                tracing::info!(
                    snapshot = %snapshot,
                    modules = registry.module_count(),
                    handlers = registry.len(),
                    "handler sources compiled"
                );
                SnapshotHandlerSet::new(snapshot.clone(), CompileOutcome::Compiled, registry)
            }
            Err(e) => {
                tracing::error!(
                    snapshot = %snapshot,
                    "{}; serving snapshot without handlers",
                    e
                );
                SnapshotHandlerSet::failed(snapshot.clone())
            }
        }
    }

    /// Number of resident snapshots
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `snapshot` is resident; does not touch its LRU position
    pub fn contains(&self, snapshot: &SnapshotId) -> bool {
        self.lock().contains(snapshot)
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }
}

impl fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationCache")
            .field("compiler", &self.compiler.name())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::compiler::{
        CompileError, CompileResult, DiagnosticSink, EmptyLoader, ModuleLoader,
    };
    use crate::snapshot::memory::MemorySnapshots;

    /// Compiler that records batches and fails when a source says "broken".
    /// A source saying "slow" stalls the pass; one saying "panic" panics on
    /// the first call only.
    #[derive(Default)]
    struct StubCompiler {
        calls: AtomicUsize,
        last_batch: Mutex<Vec<String>>,
    }

    impl SourceCompiler for StubCompiler {
        fn compile(
            &self,
            units: &[SourceUnit],
            _sink: &mut dyn DiagnosticSink,
        ) -> CompileResult<Box<dyn ModuleLoader>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if units.iter().any(|u| u.text.contains("slow")) {
                thread::sleep(Duration::from_millis(20));
            }
            if call == 1 && units.iter().any(|u| u.text.contains("panic")) {
                panic!("compiler crashed");
            }
            *self.last_batch.lock().unwrap() = units.iter().map(|u| u.path.clone()).collect();
            if units.iter().any(|u| u.text.contains("broken")) {
                return Err(CompileError::Failed { errors: 1 });
            }
            Ok(Box::new(EmptyLoader))
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn cache(capacity: usize) -> (Arc<StubCompiler>, CompilationCache) {
        let compiler = Arc::new(StubCompiler::default());
        let cache = CompilationCache::new(
            compiler.clone(),
            NonZeroUsize::new(capacity).unwrap(),
        );
        (compiler, cache)
    }

    #[test]
    fn test_no_sources_skips_compiler() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("test.txt", "line 1\nline 2\n")]);
        let (compiler, cache) = cache(4);

        let set = cache.ensure(&store, &id).unwrap();
        assert_eq!(set.outcome(), CompileOutcome::Compiled);
        assert!(set.registry().is_empty());
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_compiles_once_per_snapshot() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("b/Two.wat", "(module)"), ("a/One.wat", "(module)")]);
        let (compiler, cache) = cache(4);

        let first = cache.ensure(&store, &id).unwrap();
        let second = cache.ensure(&store, &id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *compiler.last_batch.lock().unwrap(),
            vec!["a/One.wat".to_string(), "b/Two.wat".to_string()]
        );
    }

    #[test]
    fn test_failure_is_cached() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("Bad.wat", "broken"), ("index.html", "<p>")]);
        let (compiler, cache) = cache(4);

        for _ in 0..3 {
            let set = cache.ensure(&store, &id).unwrap();
            assert!(set.is_failed());
            assert!(set.registry().is_empty());
        }
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_snapshot_compiles_again() {
        let store = MemorySnapshots::new();
        let broken = store.commit("HEAD", vec![("Main.wat", "broken")]);
        let fixed = store.commit("HEAD", vec![("Main.wat", "(module)")]);
        let (compiler, cache) = cache(4);

        assert!(cache.ensure(&store, &broken).unwrap().is_failed());
        assert!(!cache.ensure(&store, &fixed).unwrap().is_failed());
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_forces_recompile() {
        let store = MemorySnapshots::new();
        let a = store.commit("HEAD", vec![("A.wat", "(module)")]);
        let b = store.commit("HEAD", vec![("B.wat", "(module)")]);
        let (compiler, cache) = cache(1);

        cache.ensure(&store, &a).unwrap();
        cache.ensure(&store, &b).unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));

        cache.ensure(&store, &a).unwrap();
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_unreadable_source_degrades() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("Bin.wat", vec![0xffu8, 0xfe])]);
        let (compiler, cache) = cache(4);

        assert!(cache.ensure(&store, &id).unwrap().is_failed());
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_collect_sources_keeps_first_duplicate() {
        let store = MemorySnapshots::new();
        let id = store.commit(
            "HEAD",
            vec![("X.wat", "first"), ("X.wat", "second"), ("readme.md", "")],
        );

        let units = collect_sources(&store, &id, ".wat").unwrap();
        assert_eq!(units, vec![SourceUnit::new("X.wat", "first")]);
    }

    #[test]
    fn test_concurrent_requests_share_one_compile() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("Main.wat", "(module) ;; slow")]);
        let (compiler, cache) = cache(4);
        let barrier = Barrier::new(8);

        let sets: Vec<Arc<SnapshotHandlerSet>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.ensure(&store, &id).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        for set in &sets {
            assert_eq!(set.outcome(), CompileOutcome::Compiled);
            assert!(Arc::ptr_eq(set, &sets[0]));
        }
    }

    #[test]
    fn test_recovers_after_compile_panic() {
        let store = MemorySnapshots::new();
        let id = store.commit("HEAD", vec![("Main.wat", "(module) ;; panic")]);
        let (compiler, cache) = cache(4);

        let crashed = panic::catch_unwind(AssertUnwindSafe(|| cache.ensure(&store, &id)));
        assert!(crashed.is_err());
        assert!(cache.contains(&id));
        assert_eq!(cache.len(), 1);

        let set = cache.ensure(&store, &id).unwrap();
        assert_eq!(set.outcome(), CompileOutcome::Compiled);
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);

        // Settled entries are reused again
        cache.ensure(&store, &id).unwrap();
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.capacity(), 4);
    }
}
