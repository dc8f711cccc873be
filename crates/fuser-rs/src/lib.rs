//! Trace capture, structural fingerprinting and a compiled-artifact cache for fused tensor
//! programs.
//!
//! A caller records a [`Trace`] once, then executes it through a [`FusionContext`] as many times
//! as needed. Structurally equal traces share one cache entry keyed by their [`Fingerprint`];
//! each entry holds one compiled artifact per concrete shape class observed.

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod shape_key;
pub mod tensor;
pub mod trace;

pub use backend::{Artifact, ArtifactRef, ExecutionArgs, ExecutionOutput, FusionBackend};
pub use cache::{global_cache, reset_global_cache, FusionCache};
pub use config::{ExecuteOptions, FusionConfig, RestorePolicy};
pub use dispatch::FusionContext;
pub use error::{CompileError, ExecutionError, FusionError, FusionResult};
pub use fingerprint::{fingerprint, Fingerprint};
pub use shape_key::{AxisClass, ConcreteShapeKey};
pub use tensor::{DType, DeviceClass, StorageId, TensorView};
pub use trace::{AxisDecl, InputDecl, Trace, TraceRecorder, Value};
