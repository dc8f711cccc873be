#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fuser_rs::events::{CacheEvent, CacheEventSink};
use fuser_rs::{
    Artifact, ArtifactRef, CompileError, ConcreteShapeKey, DType, ExecutionArgs, ExecutionError,
    ExecutionOutput, FusionBackend, FusionCache, FusionContext, InputDecl, Trace, TensorView,
};
use fuser_rs_backend_ref_cpu::{CpuBackend, HostTensor};

/// Serializes tests that touch process-wide state (event sink, global caches).
pub static GLOBAL_STATE_MUTEX: Mutex<()> = Mutex::new(());

/// Reference CPU backend with compile counting and fault injection.
pub struct TestBackend {
    inner: CpuBackend,
    name: &'static str,
    attempts: AtomicUsize,
    compiles: AtomicUsize,
    restores: AtomicUsize,
    restore_attempts: AtomicUsize,
    failures_to_inject: AtomicUsize,
    restores_allowed: AtomicUsize,
    compile_delay: Option<Duration>,
    compile_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    portable: bool,
    detached: bool,
}

impl TestBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: CpuBackend::new(),
            name,
            attempts: AtomicUsize::new(0),
            compiles: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            restore_attempts: AtomicUsize::new(0),
            failures_to_inject: AtomicUsize::new(0),
            restores_allowed: AtomicUsize::new(usize::MAX),
            compile_delay: None,
            compile_hook: None,
            portable: true,
            detached: false,
        }
    }

    pub fn with_inner(mut self, inner: CpuBackend) -> Self {
        self.inner = inner;
        self
    }

    /// Artifacts report no portable bytes, so persisted specializations must recompile.
    pub fn non_portable(mut self) -> Self {
        self.portable = false;
        self
    }

    /// Artifacts run on private copies of their inputs and never write aliased storage.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = Some(delay);
        self
    }

    /// Runs `hook` at the start of every compilation.
    pub fn with_compile_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.compile_hook = Some(Arc::new(hook));
        self
    }

    /// The next `count` compilations fail.
    pub fn fail_next_compiles(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    /// Restores after the first `count` fail, as if the persisted bytes were stale.
    pub fn fail_restores_after(&self, count: usize) {
        self.restores_allowed.store(count, Ordering::SeqCst);
    }

    /// Every call into `compile`, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    fn wrap(&self, artifact: ArtifactRef<HostTensor>) -> ArtifactRef<HostTensor> {
        if self.portable && !self.detached {
            return artifact;
        }
        Arc::new(WrappedArtifact {
            inner: artifact,
            portable: self.portable,
            detached: self.detached,
        })
    }
}

impl FusionBackend for TestBackend {
    type Tensor = HostTensor;

    fn backend_name(&self) -> &str {
        self.name
    }

    fn compile(
        &self,
        trace: &Trace,
        inputs: &[HostTensor],
        key: &ConcreteShapeKey,
    ) -> Result<ArtifactRef<HostTensor>, CompileError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.compile_hook {
            hook();
        }
        if let Some(delay) = self.compile_delay {
            std::thread::sleep(delay);
        }
        let inject = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject {
            return Err(CompileError::new("injected compile failure"));
        }
        let artifact = self.inner.compile(trace, inputs, key)?;
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(self.wrap(artifact))
    }

    fn restore(
        &self,
        trace: &Trace,
        key: &ConcreteShapeKey,
        bytes: &[u8],
    ) -> Result<ArtifactRef<HostTensor>, CompileError> {
        let attempt = self.restore_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.restores_allowed.load(Ordering::SeqCst) {
            return Err(CompileError::new("injected restore failure"));
        }
        let artifact = self.inner.restore(trace, key, bytes)?;
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(self.wrap(artifact))
    }

    fn write_into(&self, dst: &HostTensor, src: &HostTensor) -> Result<(), ExecutionError> {
        self.inner.write_into(dst, src)
    }
}

struct WrappedArtifact {
    inner: ArtifactRef<HostTensor>,
    portable: bool,
    detached: bool,
}

impl Artifact<HostTensor> for WrappedArtifact {
    fn execute(
        &self,
        args: &ExecutionArgs<'_, HostTensor>,
    ) -> Result<ExecutionOutput<HostTensor>, ExecutionError> {
        if !self.detached {
            return self.inner.execute(args);
        }
        let copies = args
            .inputs
            .iter()
            .map(|input| {
                HostTensor::from_vec(input.sizes(), input.to_vec(), input.dtype())
                    .map_err(|err| ExecutionError::new(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.inner.execute(&ExecutionArgs {
            inputs: &copies,
            runtime_scalars: args.runtime_scalars,
            rng_seed: args.rng_seed,
            capture_diagnostics: args.capture_diagnostics,
        })
    }

    fn portable_bytes(&self) -> Option<Vec<u8>> {
        if self.portable {
            self.inner.portable_bytes()
        } else {
            None
        }
    }

    fn executions(&self) -> u64 {
        self.inner.executions()
    }
}

/// Records every event kind it sees, by name.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<String> {
        self.events.lock().expect("recording sink poisoned").clone()
    }
}

impl CacheEventSink for RecordingSink {
    fn on_event(&self, event: &CacheEvent<'_>) {
        let name = match event {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::CompileStarted { .. } => "compile_started",
            CacheEvent::CompileFinished { .. } => "compile_finished",
            CacheEvent::CompileFailed { .. } => "compile_failed",
            CacheEvent::Restored { .. } => "restored",
            CacheEvent::Reset { .. } => "reset",
            CacheEvent::Serialized { .. } => "serialized",
            CacheEvent::Deserialized { .. } => "deserialized",
        };
        self.events
            .lock()
            .expect("recording sink poisoned")
            .push(name.to_string());
    }
}

pub fn context(backend: TestBackend) -> FusionContext<TestBackend> {
    FusionContext::new(Arc::new(backend), Arc::new(FusionCache::new()))
}

pub fn float(sizes: &[usize], data: Vec<f64>) -> HostTensor {
    HostTensor::from_vec(sizes, data, DType::Float).expect("data matches shape")
}

/// `0, 1, 2, ...` laid out row-major.
pub fn iota(sizes: &[usize]) -> HostTensor {
    let len: usize = sizes.iter().product();
    float(sizes, (0..len).map(|i| i as f64).collect())
}

/// `out = (a + b) * scale` over two symbolic float inputs of rank `rank`.
pub fn scaled_sum(rank: usize, scale: f64, runtime: bool) -> anyhow::Result<Arc<Trace>> {
    Ok(Trace::define(|rec| {
        let a = rec.declare_input(InputDecl::symbolic(rank, DType::Float))?;
        let b = rec.declare_input(InputDecl::symbolic(rank, DType::Float))?;
        let scale = if runtime {
            rec.define_runtime_scalar(scale)?
        } else {
            rec.define_scalar(scale)?
        };
        let sum = rec.add(a, b)?;
        let out = rec.mul(sum, scale)?;
        rec.declare_output(out, None)
    })?)
}
