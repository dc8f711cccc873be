//! Reference host backend for `fuser-rs`.
//!
//! Traces are lowered to a flat [`KernelTape`] and interpreted over `f64` buffers, rounding every
//! intermediate to its recorded dtype. Tapes are portable, so persisted caches restore without
//! recompiling.

pub mod compiler;
mod kernels;
pub mod tensor;

pub use compiler::{CpuArtifact, CpuBackend, KernelTape};
pub use tensor::{round_to_dtype, HostTensor};
