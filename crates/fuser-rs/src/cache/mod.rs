//! Fingerprint-keyed artifact cache.
//!
//! Each [`Fingerprint`] maps to one entry owning the trace and an insertion-ordered list of
//! specializations, one per [`ConcreteShapeKey`]. Lookups take read locks only. Compilation runs
//! through a per-(fingerprint, key) in-flight cell so concurrent callers for the same key share
//! one compilation and its outcome; the cell is dropped once the compilation finishes, so a
//! failure is reported to its waiters but never cached.

mod persist;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Instant;

use log::debug;
use once_cell::sync::Lazy;

use crate::backend::{ArtifactRef, FusionBackend};
use crate::config::RestorePolicy;
use crate::error::{CompileError, FusionError, FusionResult};
use crate::events::{self, CacheCounters, CacheEvent, CacheStats};
use crate::fingerprint::Fingerprint;
use crate::shape_key::{first_unserved_input, select_specialization, ConcreteShapeKey};
use crate::trace::Trace;

use persist::{PersistedArtifact, PersistedCache, PersistedEntry, PersistedSpecialization};

pub use persist::FORMAT_VERSION as CACHE_FORMAT_VERSION;

type CompileOutcome<T> = Result<ArtifactRef<T>, CompileError>;
type InFlight<T> = Arc<OnceLock<CompileOutcome<T>>>;

enum Slot<T> {
    Ready(ArtifactRef<T>),
    /// Loaded with [`RestorePolicy::Lazy`]; rebuilt on first use.
    Portable(Arc<[u8]>),
    /// Persisted without a portable artifact; compiled on first use.
    Recompile,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        match self {
            Slot::Ready(artifact) => Slot::Ready(Arc::clone(artifact)),
            Slot::Portable(bytes) => Slot::Portable(Arc::clone(bytes)),
            Slot::Recompile => Slot::Recompile,
        }
    }
}

struct CacheEntry<T> {
    trace: Arc<Trace>,
    specializations: RwLock<Vec<(ConcreteShapeKey, Slot<T>)>>,
}

impl<T> CacheEntry<T> {
    fn new(trace: Arc<Trace>) -> Self {
        Self {
            trace,
            specializations: RwLock::new(Vec::new()),
        }
    }
}

enum Lookup<T> {
    Ready(ArtifactRef<T>),
    /// A lazily loaded specialization serves the request; its bytes were built for that key.
    Portable(ConcreteShapeKey, Arc<[u8]>),
    /// A persisted specialization without an artifact serves the request.
    Recompile,
    Miss,
}

/// What an in-flight cell produces. Restoring and compiling the same key never share a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CellKind {
    Restore,
    Compile,
}

type CellKey = (Fingerprint, ConcreteShapeKey, CellKind);

pub struct FusionCache<B: FusionBackend> {
    entries: RwLock<HashMap<Fingerprint, Arc<CacheEntry<B::Tensor>>>>,
    in_flight: Mutex<HashMap<CellKey, InFlight<B::Tensor>>>,
    counters: CacheCounters,
    /// Bumped by `reset`/`deserialize`; compilations started earlier are not installed.
    generation: AtomicU64,
}

impl<B: FusionBackend> Default for FusionCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: FusionBackend> FusionCache<B> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of distinct fingerprints held.
    pub fn num_entries(&self) -> usize {
        self.entries
            .read()
            .expect("fusion cache entries poisoned")
            .len()
    }

    /// Number of specializations stored under `fingerprint`.
    pub fn num_specializations(&self, fingerprint: Fingerprint) -> usize {
        self.entry(fingerprint)
            .map(|entry| {
                entry
                    .specializations
                    .read()
                    .expect("fusion cache specializations poisoned")
                    .len()
            })
            .unwrap_or(0)
    }

    /// Trace owned by the cache for `fingerprint`.
    pub fn trace(&self, fingerprint: Fingerprint) -> Option<Arc<Trace>> {
        self.entry(fingerprint)
            .map(|entry| Arc::clone(&entry.trace))
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        let mut out: Vec<_> = self
            .entries
            .read()
            .expect("fusion cache entries poisoned")
            .keys()
            .copied()
            .collect();
        out.sort();
        out
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    fn entry(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry<B::Tensor>>> {
        self.entries
            .read()
            .expect("fusion cache entries poisoned")
            .get(&fingerprint)
            .cloned()
    }

    fn find(&self, fingerprint: Fingerprint, request: &ConcreteShapeKey) -> Lookup<B::Tensor> {
        let Some(entry) = self.entry(fingerprint) else {
            return Lookup::Miss;
        };
        let specializations = entry
            .specializations
            .read()
            .expect("fusion cache specializations poisoned");
        match select_specialization(&specializations, request) {
            Some((_, Slot::Ready(artifact))) => Lookup::Ready(Arc::clone(artifact)),
            Some((key, Slot::Portable(bytes))) => Lookup::Portable(key.clone(), Arc::clone(bytes)),
            Some((_, Slot::Recompile)) => Lookup::Recompile,
            None => Lookup::Miss,
        }
    }

    fn ready_exact(
        &self,
        fingerprint: Fingerprint,
        key: &ConcreteShapeKey,
    ) -> Option<ArtifactRef<B::Tensor>> {
        let entry = self.entry(fingerprint)?;
        let specializations = entry
            .specializations
            .read()
            .expect("fusion cache specializations poisoned");
        specializations
            .iter()
            .find_map(|(candidate, slot)| match slot {
                Slot::Ready(artifact) if candidate == key => Some(Arc::clone(artifact)),
                _ => None,
            })
    }

    /// Resolves the artifact serving `key`, compiling it on a miss.
    ///
    /// `inputs` are the representative inputs handed to the backend when compiling; the result
    /// is stored under `key`. A lazily loaded portable specialization is restored under its own
    /// key instead, falling back to compiling when the backend rejects its bytes. With
    /// `compile_on_miss` off a miss fails with [`FusionError::ShapeConcretization`]; persisted
    /// specializations are still rebuilt.
    pub fn lookup_or_create(
        &self,
        backend: &B,
        trace: &Arc<Trace>,
        key: &ConcreteShapeKey,
        inputs: &[B::Tensor],
        compile_on_miss: bool,
    ) -> FusionResult<ArtifactRef<B::Tensor>> {
        let fingerprint = trace.fingerprint();
        let restorable = match self.find(fingerprint, key) {
            Lookup::Ready(artifact) => {
                self.counters.hit();
                events::emit(CacheEvent::Hit { fingerprint, key });
                debug!("fusion {fingerprint}: hit for key {:016x}", key.tag());
                return Ok(artifact);
            }
            Lookup::Portable(entry_key, bytes) => Some((entry_key, bytes)),
            Lookup::Recompile => None,
            Lookup::Miss => {
                if !compile_on_miss {
                    self.counters.miss();
                    events::emit(CacheEvent::Miss { fingerprint, key });
                    return Err(self.unserved(fingerprint, key));
                }
                None
            }
        };
        self.counters.miss();
        events::emit(CacheEvent::Miss { fingerprint, key });

        if let Some((entry_key, bytes)) = restorable {
            debug!(
                "fusion {fingerprint}: miss for key {:016x}, restoring {:016x}",
                key.tag(),
                entry_key.tag()
            );
            let restored = self.resolve(fingerprint, &entry_key, CellKind::Restore, || {
                self.restore_persisted(backend, fingerprint, &entry_key, &bytes)
            });
            match restored {
                Ok(artifact) => return Ok(artifact),
                Err(err) => debug!(
                    "fusion {fingerprint}: restoring key {:016x} failed ({err}); compiling",
                    entry_key.tag()
                ),
            }
        } else {
            debug!("fusion {fingerprint}: miss for key {:016x}", key.tag());
        }

        self.resolve(fingerprint, key, CellKind::Compile, || {
            self.compile(backend, trace, fingerprint, key, inputs)
        })
        .map_err(|source| FusionError::Compile {
            fingerprint,
            source,
        })
    }

    /// Error for a request no stored specialization serves when nothing may be compiled.
    fn unserved(&self, fingerprint: Fingerprint, key: &ConcreteShapeKey) -> FusionError {
        let index = match self.entry(fingerprint) {
            Some(entry) => {
                let specializations = entry
                    .specializations
                    .read()
                    .expect("fusion cache specializations poisoned");
                first_unserved_input(specializations.iter().map(|(candidate, _)| candidate), key)
            }
            None => 0,
        };
        let detail = match key.inputs.get(index) {
            Some(input) => format!(
                "no stored specialization serves axes {:?} with contiguity {:?} and compile-on-miss is disabled",
                input.axes.as_slice(),
                input.contiguity.as_slice()
            ),
            None => "no stored specialization serves these inputs and compile-on-miss is disabled"
                .to_string(),
        };
        FusionError::ShapeConcretization {
            fingerprint,
            index,
            detail,
        }
    }

    /// Runs `produce` at most once per in-flight cell; concurrent callers share its outcome.
    fn resolve(
        &self,
        fingerprint: Fingerprint,
        key: &ConcreteShapeKey,
        kind: CellKind,
        produce: impl FnOnce() -> CompileOutcome<B::Tensor>,
    ) -> CompileOutcome<B::Tensor> {
        let cell_key = (fingerprint, key.clone(), kind);
        let cell = {
            let mut in_flight = self.in_flight.lock().expect("fusion in-flight map poisoned");
            // A compilation for this key may have completed since the lookup.
            if let Some(artifact) = self.ready_exact(fingerprint, key) {
                return Ok(artifact);
            }
            Arc::clone(in_flight.entry(cell_key.clone()).or_default())
        };

        let outcome = cell.get_or_init(produce).clone();

        let mut in_flight = self.in_flight.lock().expect("fusion in-flight map poisoned");
        if in_flight
            .get(&cell_key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(&cell_key);
        }
        outcome
    }

    /// Rebuilds a lazily loaded specialization from its persisted bytes and installs it under
    /// `key`. On failure the slot is demoted so later requests compile instead.
    fn restore_persisted(
        &self,
        backend: &B,
        fingerprint: Fingerprint,
        key: &ConcreteShapeKey,
        bytes: &[u8],
    ) -> CompileOutcome<B::Tensor> {
        let generation = self.generation.load(Ordering::Acquire);
        let entry = self
            .entry(fingerprint)
            .ok_or_else(|| CompileError::new("persisted entry was dropped before restoring"))?;
        match backend.restore(&entry.trace, key, bytes) {
            Ok(artifact) => {
                self.counters.restored();
                events::emit(CacheEvent::Restored { fingerprint, key });
                debug!("fusion {fingerprint}: restored key {:016x}", key.tag());
                self.install(&entry.trace, fingerprint, key, &artifact, generation);
                Ok(artifact)
            }
            Err(err) => {
                let mut specializations = entry
                    .specializations
                    .write()
                    .expect("fusion cache specializations poisoned");
                if let Some((_, slot)) = specializations
                    .iter_mut()
                    .find(|(candidate, slot)| candidate == key && matches!(slot, Slot::Portable(_)))
                {
                    *slot = Slot::Recompile;
                }
                Err(err)
            }
        }
    }

    /// Compiles `trace` for `key` and installs the artifact. Runs at most once per in-flight cell.
    fn compile(
        &self,
        backend: &B,
        trace: &Arc<Trace>,
        fingerprint: Fingerprint,
        key: &ConcreteShapeKey,
        inputs: &[B::Tensor],
    ) -> CompileOutcome<B::Tensor> {
        let generation = self.generation.load(Ordering::Acquire);
        let owned_trace = self
            .entry(fingerprint)
            .map(|entry| Arc::clone(&entry.trace))
            .unwrap_or_else(|| Arc::clone(trace));

        events::emit(CacheEvent::CompileStarted { fingerprint, key });
        let start = Instant::now();
        match backend.compile(&owned_trace, inputs, key) {
            Ok(artifact) => {
                let elapsed = start.elapsed();
                self.counters.compiled();
                events::emit(CacheEvent::CompileFinished {
                    fingerprint,
                    key,
                    elapsed,
                });
                debug!(
                    "fusion {fingerprint}: compiled key {:016x} on {} in {:?}",
                    key.tag(),
                    backend.backend_name(),
                    elapsed
                );
                self.install(&owned_trace, fingerprint, key, &artifact, generation);
                Ok(artifact)
            }
            Err(error) => {
                self.counters.compile_failed();
                events::emit(CacheEvent::CompileFailed {
                    fingerprint,
                    key,
                    error: &error,
                });
                debug!(
                    "fusion {fingerprint}: compiling key {:016x} failed: {error}",
                    key.tag()
                );
                Err(error)
            }
        }
    }

    fn install(
        &self,
        trace: &Arc<Trace>,
        fingerprint: Fingerprint,
        key: &ConcreteShapeKey,
        artifact: &ArtifactRef<B::Tensor>,
        generation: u64,
    ) {
        let entry = {
            let mut entries = self.entries.write().expect("fusion cache entries poisoned");
            if self.generation.load(Ordering::Acquire) != generation {
                debug!("fusion {fingerprint}: cache was reset during compilation; result discarded");
                return;
            }
            Arc::clone(
                entries
                    .entry(fingerprint)
                    .or_insert_with(|| Arc::new(CacheEntry::new(Arc::clone(trace)))),
            )
        };
        let mut specializations = entry
            .specializations
            .write()
            .expect("fusion cache specializations poisoned");
        match specializations
            .iter_mut()
            .find(|(candidate, _)| candidate == key)
        {
            Some((_, slot)) => *slot = Slot::Ready(Arc::clone(artifact)),
            None => specializations.push((key.clone(), Slot::Ready(Arc::clone(artifact)))),
        }
    }

    /// Drops every entry. Artifacts and traces still held by callers stay valid.
    pub fn reset(&self) {
        let removed = {
            let mut entries = self.entries.write().expect("fusion cache entries poisoned");
            let removed = entries.len();
            entries.clear();
            self.generation.fetch_add(1, Ordering::AcqRel);
            removed
        };
        events::emit(CacheEvent::Reset { entries: removed });
        debug!("fusion cache reset ({removed} entries dropped)");
    }

    /// Writes every entry to `path`.
    ///
    /// Traces are always persisted. A specialization whose artifact exposes portable bytes is
    /// stored with them; any other specialization is stored as "recompile" and compiled again on
    /// its first use after loading.
    pub fn serialize(&self, backend: &B, path: impl AsRef<Path>) -> FusionResult<()> {
        let path = path.as_ref();
        let entries = self.entries.read().expect("fusion cache entries poisoned");
        let mut persisted = Vec::with_capacity(entries.len());
        for (fingerprint, entry) in entries.iter() {
            let specializations = entry
                .specializations
                .read()
                .expect("fusion cache specializations poisoned");
            let specializations = specializations
                .iter()
                .map(|(key, slot)| PersistedSpecialization {
                    key: key.clone(),
                    artifact: match slot {
                        Slot::Ready(artifact) => artifact
                            .portable_bytes()
                            .map(PersistedArtifact::Portable)
                            .unwrap_or(PersistedArtifact::Recompile),
                        Slot::Portable(bytes) => PersistedArtifact::Portable(bytes.to_vec()),
                        Slot::Recompile => PersistedArtifact::Recompile,
                    },
                })
                .collect();
            persisted.push(PersistedEntry {
                fingerprint: *fingerprint,
                trace: entry.trace.as_ref().clone(),
                specializations,
            });
        }
        persisted.sort_by_key(|entry| entry.fingerprint);
        let count = persisted.len();
        let cache = PersistedCache {
            backend: backend.backend_name().to_string(),
            entries: persisted,
        };
        persist::write_container(path, &cache)
            .map_err(|err| FusionError::serialization(path, format!("{err:#}")))?;
        events::emit(CacheEvent::Serialized {
            path,
            entries: count,
        });
        debug!("fusion cache serialized {count} entries to {}", path.display());
        Ok(())
    }

    /// Replaces the cache contents with the entries stored in `path`.
    ///
    /// The file is decoded and validated in full (and, under [`RestorePolicy::Eager`], every
    /// portable artifact rebuilt) before the live map is touched; on error the cache keeps its
    /// previous contents.
    pub fn deserialize(
        &self,
        backend: &B,
        path: impl AsRef<Path>,
        policy: RestorePolicy,
    ) -> FusionResult<()> {
        let path = path.as_ref();
        let fail = |reason: String| FusionError::deserialization(path, reason);
        let cache = persist::read_container(path).map_err(|err| fail(format!("{err:#}")))?;
        if cache.backend != backend.backend_name() {
            return Err(fail(format!(
                "cache was written by backend '{}', not '{}'",
                cache.backend,
                backend.backend_name()
            )));
        }

        let mut restored = HashMap::with_capacity(cache.entries.len());
        let mut restores = 0u64;
        for persisted in cache.entries {
            persisted.trace.validate().map_err(|reason| {
                fail(format!("entry {} holds an invalid trace: {reason}", persisted.fingerprint))
            })?;
            let trace = Arc::new(persisted.trace);
            let fingerprint = trace.fingerprint();
            if fingerprint != persisted.fingerprint {
                return Err(fail(format!(
                    "entry {} does not match its trace (recomputed {fingerprint})",
                    persisted.fingerprint
                )));
            }
            if restored.contains_key(&fingerprint) {
                return Err(fail(format!("entry {fingerprint} appears more than once")));
            }
            let mut specializations = Vec::with_capacity(persisted.specializations.len());
            for spec in persisted.specializations {
                if spec.key.inputs.len() != trace.inputs().len() {
                    return Err(fail(format!(
                        "entry {fingerprint} has a specialization key for {} inputs, trace declares {}",
                        spec.key.inputs.len(),
                        trace.inputs().len()
                    )));
                }
                if specializations
                    .iter()
                    .any(|(key, _): &(ConcreteShapeKey, Slot<B::Tensor>)| *key == spec.key)
                {
                    return Err(fail(format!(
                        "entry {fingerprint} repeats a specialization key"
                    )));
                }
                let slot = match (spec.artifact, policy) {
                    (PersistedArtifact::Portable(bytes), RestorePolicy::Eager) => {
                        let artifact = backend.restore(&trace, &spec.key, &bytes).map_err(|err| {
                            fail(format!("entry {fingerprint}: {err}"))
                        })?;
                        restores += 1;
                        Slot::Ready(artifact)
                    }
                    (PersistedArtifact::Portable(bytes), RestorePolicy::Lazy) => {
                        Slot::Portable(Arc::from(bytes))
                    }
                    (PersistedArtifact::Recompile, _) => Slot::Recompile,
                };
                specializations.push((spec.key, slot));
            }
            let entry = CacheEntry {
                trace,
                specializations: RwLock::new(specializations),
            };
            restored.insert(fingerprint, Arc::new(entry));
        }

        let count = restored.len();
        {
            let mut entries = self.entries.write().expect("fusion cache entries poisoned");
            *entries = restored;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.counters.restored_many(restores);
        events::emit(CacheEvent::Deserialized {
            path,
            entries: count,
        });
        debug!(
            "fusion cache deserialized {count} entries from {} ({policy:?} restore)",
            path.display()
        );
        Ok(())
    }
}

static GLOBAL_CACHES: Lazy<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide cache for backend type `B`, created on first use.
pub fn global_cache<B: FusionBackend>() -> Arc<FusionCache<B>> {
    let mut caches = GLOBAL_CACHES.lock().expect("global fusion caches poisoned");
    let cache = caches
        .entry(TypeId::of::<B>())
        .or_insert_with(|| Arc::new(FusionCache::<B>::new()) as Arc<dyn Any + Send + Sync>);
    match Arc::clone(cache).downcast::<FusionCache<B>>() {
        Ok(cache) => cache,
        Err(_) => {
            // Keyed by `TypeId::of::<B>()`, so the stored value always has this type.
            let fresh = Arc::new(FusionCache::<B>::new());
            *cache = Arc::clone(&fresh) as Arc<dyn Any + Send + Sync>;
            fresh
        }
    }
}

/// Resets the process-wide cache for `B`, if one was created.
pub fn reset_global_cache<B: FusionBackend>() {
    let existing = GLOBAL_CACHES
        .lock()
        .expect("global fusion caches poisoned")
        .get(&TypeId::of::<B>())
        .cloned();
    if let Some(cache) = existing.and_then(|cache| cache.downcast::<FusionCache<B>>().ok()) {
        cache.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::tensor::{DType, DeviceClass, StorageId, TensorView};
    use crate::trace::{next_trace_id, InputDecl, Node, Op, OutputDecl, UnaryOp, ValueMeta, ValueRef};

    #[derive(Clone)]
    struct Opaque;

    impl TensorView for Opaque {
        fn sizes(&self) -> &[usize] {
            &[]
        }

        fn strides(&self) -> &[isize] {
            &[]
        }

        fn dtype(&self) -> DType {
            DType::Float
        }

        fn device(&self) -> DeviceClass {
            DeviceClass::Cpu
        }

        fn storage_id(&self) -> StorageId {
            StorageId(0)
        }
    }

    /// Accepts cache files but never produces artifacts.
    struct InertBackend;

    impl FusionBackend for InertBackend {
        type Tensor = Opaque;

        fn backend_name(&self) -> &str {
            "inert"
        }

        fn compile(
            &self,
            _trace: &Trace,
            _inputs: &[Opaque],
            _key: &ConcreteShapeKey,
        ) -> Result<ArtifactRef<Opaque>, CompileError> {
            Err(CompileError::new("inert backend does not compile"))
        }

        fn write_into(&self, _dst: &Opaque, _src: &Opaque) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn negate(operand: ValueRef) -> Trace {
        Trace::from_parts(
            next_trace_id(),
            vec![InputDecl::symbolic(1, DType::Float)],
            vec![Node {
                op: Op::Unary(UnaryOp::Neg),
                inputs: vec![operand],
                outputs: vec![ValueMeta::tensor(DType::Float, 1)],
            }],
            vec![OutputDecl {
                value: ValueRef::Node { node: 0, slot: 0 },
                alias_input: None,
            }],
        )
    }

    fn write(path: &Path, traces: Vec<Trace>) {
        let entries = traces
            .into_iter()
            .map(|trace| PersistedEntry {
                fingerprint: trace.fingerprint(),
                trace,
                specializations: Vec::new(),
            })
            .collect();
        let cache = PersistedCache {
            backend: "inert".to_string(),
            entries,
        };
        persist::write_container(path, &cache).expect("container written");
    }

    #[test]
    fn structurally_invalid_traces_are_rejected_on_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("fusion.cache");
        let cache = FusionCache::<InertBackend>::new();

        write(&path, vec![negate(ValueRef::Input(0))]);
        cache
            .deserialize(&InertBackend, &path, RestorePolicy::Eager)
            .expect("well-formed entry loads");
        assert_eq!(cache.num_entries(), 1);

        write(&path, vec![negate(ValueRef::Input(3))]);
        match cache.deserialize(&InertBackend, &path, RestorePolicy::Eager) {
            Err(FusionError::Deserialization { reason, .. }) => {
                assert!(reason.contains("invalid trace"), "{reason}");
                assert!(reason.contains("Input(3)"), "{reason}");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(()) => panic!("dangling operand must not load"),
        }
        assert_eq!(cache.num_entries(), 1);
    }

    #[test]
    fn repeated_fingerprints_are_rejected_on_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("fusion.cache");
        let cache = FusionCache::<InertBackend>::new();
        write(
            &path,
            vec![negate(ValueRef::Input(0)), negate(ValueRef::Input(0))],
        );
        match cache.deserialize(&InertBackend, &path, RestorePolicy::Lazy) {
            Err(FusionError::Deserialization { reason, .. }) => {
                assert!(reason.contains("more than once"), "{reason}");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(()) => panic!("duplicate entries must not load"),
        }
        assert_eq!(cache.num_entries(), 0);
    }
}
