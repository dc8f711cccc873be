//! Artifact compiler boundary.
//!
//! The core hands a finalized [`Trace`] plus one representative input set to a
//! [`FusionBackend`] and receives an opaque [`Artifact`]. It never inspects compiled internals;
//! everything it needs from tensors goes through [`TensorView`].

use std::sync::Arc;

use crate::error::{CompileError, ExecutionError};
use crate::shape_key::ConcreteShapeKey;
use crate::tensor::TensorView;
use crate::trace::{ScalarLiteral, Trace};

pub type ArtifactRef<T> = Arc<dyn Artifact<T>>;

/// Per-call arguments handed to an artifact.
pub struct ExecutionArgs<'a, T> {
    pub inputs: &'a [T],
    /// Values of the trace's runtime scalars, in node order.
    pub runtime_scalars: &'a [ScalarLiteral],
    pub rng_seed: u64,
    pub capture_diagnostics: bool,
}

pub struct ExecutionOutput<T> {
    /// Every declared output, aliased ones included, in declaration order.
    pub outputs: Vec<T>,
    /// Backend diagnostic text, only produced when requested.
    pub diagnostics: Option<String>,
}

/// Compiled, executable unit bound to one (fingerprint, shape key) pair.
///
/// Implementations may keep internal counters (e.g. a random-number offset) but must advance
/// them exactly once per successful execution.
pub trait Artifact<T>: Send + Sync {
    fn execute(&self, args: &ExecutionArgs<'_, T>) -> Result<ExecutionOutput<T>, ExecutionError>;

    /// Self-contained encoding that [`FusionBackend::restore`] accepts in a fresh process.
    /// `None` means the artifact must be recompiled after a restart.
    fn portable_bytes(&self) -> Option<Vec<u8>> {
        None
    }

    /// Number of successful executions so far.
    fn executions(&self) -> u64;
}

pub trait FusionBackend: Send + Sync + 'static {
    type Tensor: TensorView + Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Compiles `trace` specialised for `key`; `inputs` is one concrete input set matching it.
    fn compile(
        &self,
        trace: &Trace,
        inputs: &[Self::Tensor],
        key: &ConcreteShapeKey,
    ) -> Result<ArtifactRef<Self::Tensor>, CompileError>;

    /// Rebuilds an artifact from [`Artifact::portable_bytes`].
    fn restore(
        &self,
        _trace: &Trace,
        _key: &ConcreteShapeKey,
        _bytes: &[u8],
    ) -> Result<ArtifactRef<Self::Tensor>, CompileError> {
        Err(CompileError::new(format!(
            "backend '{}' cannot restore persisted artifacts",
            self.backend_name()
        )))
    }

    /// Copies `src` into the storage of `dst` in place. Used for alias outputs whose result the
    /// artifact did not already write into the aliased input.
    fn write_into(&self, dst: &Self::Tensor, src: &Self::Tensor) -> Result<(), ExecutionError>;
}
