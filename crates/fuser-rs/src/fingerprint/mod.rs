//! Structural fingerprints of traces.
//!
//! The fingerprint hashes a canonical signature of the trace: the node sequence with operator
//! attributes, input declarations reduced to rank, per-axis concreteness, contiguity, dtype and
//! device, and the output declarations. Runtime scalar values, declared static extents and the
//! process-local trace id are left out. Equal fingerprints are a necessary condition for two
//! traces to share a cache entry; the concrete shape key decides among specializations.

pub mod hashing;

use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, DeviceClass};
use crate::trace::{AxisDecl, Node, Op, OutputDecl, Trace, ValueMeta, ValueRef};

use hashing::DigestHasher;

/// Bumped whenever the canonical signature layout changes.
const SIGNATURE_VERSION: u32 = 1;
const SIGNATURE_DOMAIN: &str = "fuser-rs/trace-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Serialize)]
struct SignatureData<'a> {
    version: u32,
    inputs: Vec<SignatureInput<'a>>,
    nodes: Vec<SignatureNode<'a>>,
    outputs: &'a [OutputDecl],
}

#[derive(Serialize)]
struct SignatureInput<'a> {
    axes: Vec<SignatureAxis>,
    contiguity: &'a [Option<bool>],
    dtype: DType,
    device: DeviceClass,
}

#[derive(Serialize)]
enum SignatureAxis {
    Symbolic,
    Broadcast,
    Static,
}

#[derive(Serialize)]
struct SignatureNode<'a> {
    op: SignatureOp<'a>,
    inputs: &'a [ValueRef],
    outputs: &'a [ValueMeta],
}

#[derive(Serialize)]
enum SignatureOp<'a> {
    Static(&'a Op),
    RuntimeScalar { dtype: DType },
}

impl<'a> SignatureData<'a> {
    fn from_trace(trace: &'a Trace) -> Self {
        let inputs = trace
            .inputs()
            .iter()
            .map(|decl| SignatureInput {
                axes: decl
                    .axes
                    .iter()
                    .map(|axis| match axis {
                        AxisDecl::Symbolic => SignatureAxis::Symbolic,
                        AxisDecl::Broadcast => SignatureAxis::Broadcast,
                        AxisDecl::Static(_) => SignatureAxis::Static,
                    })
                    .collect(),
                contiguity: &decl.contiguity,
                dtype: decl.dtype,
                device: decl.device,
            })
            .collect();
        let nodes = trace.nodes().iter().map(SignatureNode::from_node).collect();
        Self {
            version: SIGNATURE_VERSION,
            inputs,
            nodes,
            outputs: trace.outputs(),
        }
    }
}

impl<'a> SignatureNode<'a> {
    fn from_node(node: &'a Node) -> Self {
        let op = match &node.op {
            Op::Scalar(attr) if attr.runtime => SignatureOp::RuntimeScalar { dtype: attr.dtype },
            op => SignatureOp::Static(op),
        };
        Self {
            op,
            inputs: &node.inputs,
            outputs: &node.outputs,
        }
    }
}

/// Canonical byte encoding of the trace signature.
pub fn canonical_bytes(trace: &Trace) -> bincode::Result<Vec<u8>> {
    bincode::serialize(&SignatureData::from_trace(trace))
}

/// Computes the structural fingerprint of `trace`.
///
/// Pure and deterministic across processes: bincode's fixed-width little-endian encoding of the
/// signature is fed to blake3 and the first 128 bits are kept.
pub fn fingerprint(trace: &Trace) -> Fingerprint {
    let signature = SignatureData::from_trace(trace);
    let mut hasher = DigestHasher::new(SIGNATURE_DOMAIN);
    if let Err(err) = hasher.write_serialized(&signature) {
        // Encoding into an in-memory hasher has no failure path in practice; fall back to the
        // debug form so the result stays deterministic.
        warn!("canonical trace encoding failed ({err}); hashing debug form");
        let mut hasher = DigestHasher::new(SIGNATURE_DOMAIN);
        hasher.write_bytes(format!("{:?}", trace.nodes()).as_bytes());
        return Fingerprint(hasher.finish_u128());
    }
    Fingerprint(hasher.finish_u128())
}
