//! Immutable fusion IR captured by the [`TraceRecorder`].
//!
//! A [`Trace`] is an ordered node list plus ordered input and output declarations. Node order
//! is significant: two traces are equal only when they recorded the same operators in the same
//! order with the same attributes.

mod display;
pub mod ops;
mod recorder;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{self, Fingerprint};
use crate::tensor::{DType, DeviceClass, TensorView};

pub use ops::{
    BinaryOp, BroadcastInDimSpec, Op, PermuteSpec, ReduceKind, ReduceSpec, ReshapeSpec,
    ScalarAttr, ScalarLiteral, UnaryOp, ValueMeta,
};
pub use recorder::TraceRecorder;

static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_trace_id() -> u64 {
    TRACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Reference to a value inside one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRef {
    Input(usize),
    Node { node: usize, slot: usize },
}

/// Handle returned by the recorder. Only valid inside the trace that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    pub(crate) trace_id: u64,
    pub(crate) value: ValueRef,
    pub(crate) meta: ValueMeta,
}

impl Value {
    pub fn value_ref(&self) -> ValueRef {
        self.value
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn rank(&self) -> usize {
        self.meta.rank
    }

    pub fn meta(&self) -> ValueMeta {
        self.meta
    }
}

/// Per-axis declaration of an input extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisDecl {
    /// Extent unknown until execution.
    Symbolic,
    /// Extent is always exactly 1.
    Broadcast,
    /// Extent is specialised exactly: every distinct extent gets its own artifact. The
    /// recorded extent is the one seen at declaration and only shows up in printed definitions.
    Static(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputDecl {
    pub axes: Vec<AxisDecl>,
    /// Expected contiguity, `None` entries accept any layout for that axis.
    pub contiguity: Vec<Option<bool>>,
    pub dtype: DType,
    pub device: DeviceClass,
}

impl InputDecl {
    /// Fully symbolic CPU input of the given rank with unconstrained layout.
    pub fn symbolic(rank: usize, dtype: DType) -> Self {
        Self {
            axes: vec![AxisDecl::Symbolic; rank],
            contiguity: vec![None; rank],
            dtype,
            device: DeviceClass::Cpu,
        }
    }

    /// Static CPU input declared with representative extents.
    pub fn fixed(sizes: &[usize], dtype: DType) -> Self {
        Self {
            axes: sizes.iter().map(|size| AxisDecl::Static(*size)).collect(),
            contiguity: vec![None; sizes.len()],
            dtype,
            device: DeviceClass::Cpu,
        }
    }

    /// Declares an input shaped like a live tensor.
    ///
    /// Size-1 axes become [`AxisDecl::Broadcast`]; the rest are symbolic unless
    /// `static_sizes` pins them. Contiguity is taken from the tensor's strides.
    pub fn from_tensor(tensor: &impl TensorView, static_sizes: bool) -> Self {
        let axes = tensor
            .sizes()
            .iter()
            .map(|&size| {
                if static_sizes {
                    AxisDecl::Static(size)
                } else if size == 1 {
                    AxisDecl::Broadcast
                } else {
                    AxisDecl::Symbolic
                }
            })
            .collect();
        Self {
            axes,
            contiguity: tensor.contiguity(),
            dtype: tensor.dtype(),
            device: tensor.device(),
        }
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    pub fn with_contiguity(mut self, contiguity: Vec<Option<bool>>) -> Self {
        self.contiguity = contiguity;
        self
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<ValueRef>,
    pub outputs: Vec<ValueMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputDecl {
    pub value: ValueRef,
    /// Index of the input whose storage receives this output.
    pub alias_input: Option<usize>,
}

/// Finalized, immutable trace. Shared through `Arc<Trace>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    #[serde(skip, default = "next_trace_id")]
    id: u64,
    inputs: Vec<InputDecl>,
    nodes: Vec<Node>,
    outputs: Vec<OutputDecl>,
    #[serde(skip)]
    fingerprint: OnceLock<Fingerprint>,
}

impl Trace {
    pub(crate) fn from_parts(
        id: u64,
        inputs: Vec<InputDecl>,
        nodes: Vec<Node>,
        outputs: Vec<OutputDecl>,
    ) -> Self {
        Self {
            id,
            inputs,
            nodes,
            outputs,
            fingerprint: OnceLock::new(),
        }
    }

    /// Records a trace inside `f` and finalizes it.
    ///
    /// ```ignore
    /// let trace = Trace::define(|rec| {
    ///     let a = rec.declare_input(InputDecl::symbolic(2, DType::Float))?;
    ///     let out = rec.neg(a)?;
    ///     rec.declare_output(out, None)
    /// })?;
    /// ```
    pub fn define<F>(f: F) -> crate::error::FusionResult<Arc<Trace>>
    where
        F: FnOnce(&mut TraceRecorder) -> crate::error::FusionResult<()>,
    {
        let mut recorder = TraceRecorder::begin()?;
        f(&mut recorder)?;
        recorder.end()
    }

    /// Process-local identity of this trace object. Not part of the fingerprint.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inputs(&self) -> &[InputDecl] {
        &self.inputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[OutputDecl] {
        &self.outputs
    }

    /// Structural fingerprint, computed once per trace object.
    pub fn fingerprint(&self) -> Fingerprint {
        *self
            .fingerprint
            .get_or_init(|| fingerprint::fingerprint(self))
    }

    /// Metadata of any value reachable in this trace.
    pub fn value_meta(&self, value: ValueRef) -> Option<ValueMeta> {
        match value {
            ValueRef::Input(index) => self
                .inputs
                .get(index)
                .map(|decl| ValueMeta::tensor(decl.dtype, decl.rank())),
            ValueRef::Node { node, slot } => self
                .nodes
                .get(node)
                .and_then(|node| node.outputs.get(slot))
                .copied(),
        }
    }

    /// Concrete values of every runtime scalar, in node order.
    pub fn runtime_scalars(&self) -> Vec<ScalarLiteral> {
        self.nodes
            .iter()
            .filter_map(|node| match &node.op {
                Op::Scalar(attr) if attr.runtime => Some(attr.value),
                _ => None,
            })
            .collect()
    }

    /// Number of outputs the dispatcher returns (aliased outputs are hidden).
    pub fn visible_output_count(&self) -> usize {
        self.outputs
            .iter()
            .filter(|output| output.alias_input.is_none())
            .count()
    }

    pub fn has_stochastic_ops(&self) -> bool {
        self.nodes.iter().any(|node| node.op.is_stochastic())
    }

    /// Re-checks what the recorder enforces while a trace is built: every operand refers to an
    /// input or an earlier node, recorded result metadata matches inference, outputs resolve
    /// and aliases target distinct inputs of the same dtype and rank.
    ///
    /// Recorded traces always pass. Traces decoded from bytes are only trusted once they do.
    pub fn validate(&self) -> Result<(), String> {
        for (index, decl) in self.inputs.iter().enumerate() {
            if decl.contiguity.len() != decl.axes.len() {
                return Err(format!(
                    "input {index} declares {} axes but {} contiguity entries",
                    decl.axes.len(),
                    decl.contiguity.len()
                ));
            }
        }
        for (position, node) in self.nodes.iter().enumerate() {
            let mut metas = Vec::with_capacity(node.inputs.len());
            for (operand, value) in node.inputs.iter().enumerate() {
                let meta = match *value {
                    ValueRef::Node { node: producer, .. } if producer >= position => None,
                    value => self.value_meta(value),
                };
                metas.push(meta.ok_or_else(|| {
                    format!("operand {operand} of node {position} refers to {value:?}, which is not recorded before it")
                })?);
            }
            let inferred = node
                .op
                .infer(&metas)
                .map_err(|detail| format!("node {position} ({}): {detail}", node.op.name()))?;
            if inferred != node.outputs {
                return Err(format!(
                    "node {position} ({}) records results {:?}, its operands give {:?}",
                    node.op.name(),
                    node.outputs,
                    inferred
                ));
            }
        }
        if self.outputs.is_empty() {
            return Err("trace declares no outputs".to_string());
        }
        let mut aliased = Vec::new();
        for (index, output) in self.outputs.iter().enumerate() {
            let meta = self
                .value_meta(output.value)
                .ok_or_else(|| format!("output {index} refers to unknown value {:?}", output.value))?;
            let Some(input) = output.alias_input else {
                continue;
            };
            let target = self
                .value_meta(ValueRef::Input(input))
                .ok_or_else(|| format!("output {index} aliases undeclared input {input}"))?;
            if target.dtype != meta.dtype || target.rank != meta.rank {
                return Err(format!(
                    "output {index} ({:?} rank {}) cannot alias input {input} ({:?} rank {})",
                    meta.dtype, meta.rank, target.dtype, target.rank
                ));
            }
            if aliased.contains(&input) {
                return Err(format!("input {input} is aliased more than once"));
            }
            aliased.push(input);
        }
        Ok(())
    }

    /// Structural equality: same declarations and node sequence, runtime scalar values ignored.
    pub fn structurally_eq(&self, other: &Trace) -> bool {
        self.fingerprint() == other.fingerprint()
            && fingerprint::canonical_bytes(self).ok() == fingerprint::canonical_bytes(other).ok()
    }
}
