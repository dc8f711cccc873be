//! Execution dispatch: validate, key, resolve, execute, apply aliases.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::backend::{ExecutionArgs, FusionBackend};
use crate::cache::{global_cache, FusionCache};
use crate::config::{ExecuteOptions, FusionConfig};
use crate::error::{ExecutionError, FusionError, FusionResult, TensorSummary};
use crate::fingerprint::Fingerprint;
use crate::shape_key::ConcreteShapeKey;
use crate::tensor::TensorView;
use crate::trace::{InputDecl, Trace};

/// Handle through which traces are executed: one backend, one cache, one configuration.
///
/// Several contexts may share a cache; `last_debug_output` is per context.
pub struct FusionContext<B: FusionBackend> {
    backend: Arc<B>,
    cache: Arc<FusionCache<B>>,
    config: FusionConfig,
    last_debug_output: Mutex<Option<String>>,
}

impl<B: FusionBackend> FusionContext<B> {
    pub fn new(backend: Arc<B>, cache: Arc<FusionCache<B>>) -> Self {
        Self {
            backend,
            cache,
            config: FusionConfig::default(),
            last_debug_output: Mutex::new(None),
        }
    }

    /// Context backed by the process-wide cache for `B`.
    pub fn with_global_cache(backend: Arc<B>) -> Self {
        Self::new(backend, global_cache::<B>())
    }

    pub fn with_config(mut self, config: FusionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<FusionCache<B>> {
        &self.cache
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Diagnostic text captured by the most recent `execute`, if capture was enabled for it.
    pub fn last_debug_output(&self) -> Option<String> {
        self.last_debug_output
            .lock()
            .expect("debug output lock poisoned")
            .clone()
    }

    /// Executes `trace` against `inputs`, compiling on first use.
    ///
    /// Returns the non-aliased outputs in declaration order. Outputs aliasing an input are
    /// written into that input's storage instead.
    pub fn execute(
        &self,
        trace: &Arc<Trace>,
        inputs: &[B::Tensor],
        options: &ExecuteOptions,
    ) -> FusionResult<Vec<B::Tensor>> {
        *self
            .last_debug_output
            .lock()
            .expect("debug output lock poisoned") = None;

        validate_inputs(trace.inputs(), inputs)?;
        let fingerprint = trace.fingerprint();
        let key =
            ConcreteShapeKey::derive(fingerprint, trace.inputs(), inputs, options.static_shapes)?;
        let compile_on_miss = options
            .compile_on_miss
            .unwrap_or(self.config.compile_on_miss);
        let artifact =
            self.cache
                .lookup_or_create(&self.backend, trace, &key, inputs, compile_on_miss)?;

        let capture = options
            .capture_debug_output
            .unwrap_or(self.config.capture_debug_output);
        let runtime_scalars = trace.runtime_scalars();
        let args = ExecutionArgs {
            inputs,
            runtime_scalars: &runtime_scalars,
            rng_seed: options.rng_seed,
            capture_diagnostics: capture,
        };
        let execution_error = |source: ExecutionError| FusionError::Execution {
            fingerprint,
            source,
        };
        let output = artifact.execute(&args).map_err(|source| {
            debug!(
                "fusion {fingerprint}: execution failed (recoverable: {}): {}",
                source.recoverable, source.message
            );
            execution_error(source)
        })?;

        let declared = trace.outputs();
        if output.outputs.len() != declared.len() {
            return Err(execution_error(ExecutionError::new(format!(
                "artifact returned {} outputs, trace declares {}",
                output.outputs.len(),
                declared.len()
            ))));
        }

        let mut visible = Vec::with_capacity(trace.visible_output_count());
        for (decl, result) in declared.iter().zip(output.outputs) {
            match decl.alias_input {
                Some(index) => {
                    let target = &inputs[index];
                    if result.storage_id() != target.storage_id() {
                        trace!("fusion {fingerprint}: copying aliased output into input {index}");
                        self.backend
                            .write_into(target, &result)
                            .map_err(execution_error)?;
                    }
                }
                None => visible.push(result),
            }
        }

        if capture {
            *self
                .last_debug_output
                .lock()
                .expect("debug output lock poisoned") =
                Some(output.diagnostics.unwrap_or_default());
        }
        Ok(visible)
    }

    /// Re-executes the trace the cache holds for `fingerprint`.
    pub fn execute_fingerprint(
        &self,
        fingerprint: Fingerprint,
        inputs: &[B::Tensor],
        options: &ExecuteOptions,
    ) -> FusionResult<Vec<B::Tensor>> {
        let trace = self
            .cache
            .trace(fingerprint)
            .ok_or(FusionError::UnknownFingerprint { fingerprint })?;
        self.execute(&trace, inputs, options)
    }

    pub fn serialize(&self, path: impl AsRef<Path>) -> FusionResult<()> {
        self.cache.serialize(&self.backend, path)
    }

    /// Loads `path` into the cache using the configured restore policy.
    pub fn deserialize(&self, path: impl AsRef<Path>) -> FusionResult<()> {
        self.cache
            .deserialize(&self.backend, path, self.config.restore_policy)
    }
}

/// Checks arity, then per input rank, dtype and device class.
fn validate_inputs<T: TensorView>(decls: &[InputDecl], inputs: &[T]) -> FusionResult<()> {
    if decls.len() != inputs.len() {
        return Err(FusionError::InputMismatch {
            index: decls.len().min(inputs.len()),
            expected: format!("{} inputs", decls.len()),
            actual: format!("{} inputs", inputs.len()),
        });
    }
    for (index, (decl, tensor)) in decls.iter().zip(inputs).enumerate() {
        let matches = decl.rank() == tensor.rank()
            && decl.dtype == tensor.dtype()
            && decl.device == tensor.device();
        if !matches {
            let expected = TensorSummary {
                rank: decl.rank(),
                dtype: decl.dtype,
                device: decl.device,
            };
            let actual = TensorSummary {
                rank: tensor.rank(),
                dtype: tensor.dtype(),
                device: tensor.device(),
            };
            return Err(FusionError::InputMismatch {
                index,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}
