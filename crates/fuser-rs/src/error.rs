//! Error taxonomy shared by recording, dispatch, caching and persistence.

use std::path::PathBuf;

use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::tensor::{DType, DeviceClass};

/// Compilation failure reported by a backend.
///
/// Cloneable so one failed in-flight compilation can be reported to every caller that was
/// waiting on it. Never cached: the next request for the same key compiles again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compilation failed: {message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runtime fault raised by an artifact after it started executing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Set when a re-specialisation could plausibly succeed (e.g. an alignment requirement).
    pub recoverable: bool,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn misaligned(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }
}

/// Shape/dtype summary used when reporting input mismatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSummary {
    pub rank: usize,
    pub dtype: DType,
    pub device: DeviceClass,
}

impl std::fmt::Display for TensorSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank {} {:?} on {}", self.rank, self.dtype, self.device)
    }
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("trace {trace_id}: operand {operand} of node {position} refers to a value that was never recorded in this trace")]
    DanglingReference {
        trace_id: u64,
        position: usize,
        operand: usize,
    },

    #[error("trace {trace_id} is finalized; it can no longer be modified")]
    FinalizedTrace { trace_id: u64 },

    #[error("a trace is already being recorded on this thread; nested recording is not allowed")]
    ReentrantRecording,

    #[error("trace {trace_id}: invalid definition at node {position}: {detail}")]
    InvalidDefinition {
        trace_id: u64,
        position: usize,
        detail: String,
    },

    #[error("input {index}: expected {expected}, got {actual}")]
    InputMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    /// Raised when an input contradicts its declaration, or when no stored specialization
    /// serves it and compile-on-miss is disabled.
    #[error("fusion {fingerprint}: input {index} cannot be specialised: {detail}")]
    ShapeConcretization {
        fingerprint: Fingerprint,
        index: usize,
        detail: String,
    },

    #[error("fusion {fingerprint}: {source}")]
    Compile {
        fingerprint: Fingerprint,
        #[source]
        source: CompileError,
    },

    #[error("fusion {fingerprint}: execution failed: {source}")]
    Execution {
        fingerprint: Fingerprint,
        #[source]
        source: ExecutionError,
    },

    #[error("fusion {fingerprint} is not present in the cache")]
    UnknownFingerprint { fingerprint: Fingerprint },

    #[error("failed to serialize fusion cache to {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },

    #[error("failed to deserialize fusion cache from {path}: {reason}")]
    Deserialization { path: PathBuf, reason: String },
}

impl FusionError {
    pub(crate) fn serialization(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FusionError::Serialization {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn deserialization(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FusionError::Deserialization {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for recording-time programmer errors that are never worth retrying.
    pub fn is_recording_error(&self) -> bool {
        matches!(
            self,
            FusionError::DanglingReference { .. }
                | FusionError::FinalizedTrace { .. }
                | FusionError::ReentrantRecording
                | FusionError::InvalidDefinition { .. }
        )
    }
}

pub type FusionResult<T> = Result<T, FusionError>;
