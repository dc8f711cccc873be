use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;

use super::ops::{
    BinaryOp, BroadcastInDimSpec, Op, PermuteSpec, ReduceKind, ReduceSpec, ReshapeSpec,
    ScalarAttr, ScalarLiteral, UnaryOp, ValueMeta,
};
use super::{next_trace_id, InputDecl, Node, OutputDecl, Trace, Value, ValueRef};
use crate::error::{FusionError, FusionResult};
use crate::tensor::DType;

thread_local! {
    static RECORDING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as recording; cleared on drop. `!Send` so the flag is always
/// released on the thread that set it.
struct RecordingGuard {
    _not_send: PhantomData<*const ()>,
}

impl RecordingGuard {
    fn acquire() -> FusionResult<Self> {
        RECORDING.with(|flag| {
            if flag.get() {
                return Err(FusionError::ReentrantRecording);
            }
            flag.set(true);
            Ok(Self {
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        RECORDING.with(|flag| flag.set(false));
    }
}

/// Mutable, single-threaded builder for one [`Trace`].
///
/// Nodes are appended in call order. Every operand is checked to belong to this trace and to
/// precede the node being recorded, so a finished trace is always a well-formed DAG.
pub struct TraceRecorder {
    id: u64,
    inputs: Vec<InputDecl>,
    nodes: Vec<Node>,
    outputs: Vec<OutputDecl>,
    guard: Option<RecordingGuard>,
}

impl TraceRecorder {
    /// Opens a new trace. Fails if another recording is active on this thread.
    pub fn begin() -> FusionResult<Self> {
        let guard = RecordingGuard::acquire()?;
        let id = next_trace_id();
        trace!("trace {id}: recording started");
        Ok(Self {
            id,
            inputs: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            guard: Some(guard),
        })
    }

    pub fn trace_id(&self) -> u64 {
        self.id
    }

    pub fn is_finalized(&self) -> bool {
        self.guard.is_none()
    }

    fn ensure_open(&self) -> FusionResult<()> {
        if self.is_finalized() {
            return Err(FusionError::FinalizedTrace { trace_id: self.id });
        }
        Ok(())
    }

    fn invalid(&self, detail: impl Into<String>) -> FusionError {
        FusionError::InvalidDefinition {
            trace_id: self.id,
            position: self.nodes.len(),
            detail: detail.into(),
        }
    }

    /// Resolves a handle against this trace; `operand` is only used for error reporting.
    fn resolve(&self, value: &Value, operand: usize) -> FusionResult<ValueMeta> {
        let dangling = FusionError::DanglingReference {
            trace_id: self.id,
            position: self.nodes.len(),
            operand,
        };
        if value.trace_id != self.id {
            return Err(dangling);
        }
        let meta = match value.value {
            ValueRef::Input(index) => self
                .inputs
                .get(index)
                .map(|decl| ValueMeta::tensor(decl.dtype, decl.rank())),
            ValueRef::Node { node, slot } => self
                .nodes
                .get(node)
                .and_then(|node| node.outputs.get(slot))
                .copied(),
        };
        meta.ok_or(dangling)
    }

    pub fn declare_input(&mut self, decl: InputDecl) -> FusionResult<Value> {
        self.ensure_open()?;
        if decl.contiguity.len() != decl.axes.len() {
            return Err(self.invalid(format!(
                "input {} declares {} axes but {} contiguity entries",
                self.inputs.len(),
                decl.axes.len(),
                decl.contiguity.len()
            )));
        }
        let index = self.inputs.len();
        let meta = ValueMeta::tensor(decl.dtype, decl.rank());
        self.inputs.push(decl);
        Ok(Value {
            trace_id: self.id,
            value: ValueRef::Input(index),
            meta,
        })
    }

    /// Appends a node and returns handles to its output slots.
    pub fn record(&mut self, op: Op, inputs: &[Value]) -> FusionResult<Vec<Value>> {
        self.ensure_open()?;
        let mut metas = Vec::with_capacity(inputs.len());
        for (operand, value) in inputs.iter().enumerate() {
            metas.push(self.resolve(value, operand)?);
        }
        let outputs = op.infer(&metas).map_err(|detail| self.invalid(detail))?;
        let node = self.nodes.len();
        trace!("trace {}: %{} = {}", self.id, node, op.name());
        let handles = outputs
            .iter()
            .enumerate()
            .map(|(slot, meta)| Value {
                trace_id: self.id,
                value: ValueRef::Node { node, slot },
                meta: *meta,
            })
            .collect();
        self.nodes.push(Node {
            op,
            inputs: inputs.iter().map(|value| value.value).collect(),
            outputs,
        });
        Ok(handles)
    }

    fn record_single(&mut self, op: Op, inputs: &[Value]) -> FusionResult<Value> {
        let outputs = self.record(op, inputs)?;
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| self.invalid("operator produced no outputs"))
    }

    /// Compile-time constant; its value participates in the fingerprint.
    pub fn define_scalar(&mut self, value: impl Into<ScalarLiteral>) -> FusionResult<Value> {
        let value = value.into();
        self.define_scalar_with(value, value.default_dtype(), false)
    }

    /// Scalar whose value may differ between otherwise equal traces without forcing a
    /// recompilation.
    pub fn define_runtime_scalar(
        &mut self,
        value: impl Into<ScalarLiteral>,
    ) -> FusionResult<Value> {
        let value = value.into();
        self.define_scalar_with(value, value.default_dtype(), true)
    }

    pub fn define_scalar_with(
        &mut self,
        value: ScalarLiteral,
        dtype: DType,
        runtime: bool,
    ) -> FusionResult<Value> {
        self.record_single(
            Op::Scalar(ScalarAttr {
                value,
                dtype,
                runtime,
            }),
            &[],
        )
    }

    pub fn unary(&mut self, op: UnaryOp, input: Value) -> FusionResult<Value> {
        self.record_single(Op::Unary(op), &[input])
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.record_single(Op::Binary(op), &[lhs, rhs])
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn maximum(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Maximum, lhs, rhs)
    }

    pub fn minimum(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Minimum, lhs, rhs)
    }

    pub fn pow(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Pow, lhs, rhs)
    }

    pub fn lt(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Lt, lhs, rhs)
    }

    pub fn gt(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Gt, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: Value, rhs: Value) -> FusionResult<Value> {
        self.binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn neg(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Neg, input)
    }

    pub fn abs(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Abs, input)
    }

    pub fn exp(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Exp, input)
    }

    pub fn log(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Log, input)
    }

    pub fn tanh(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Tanh, input)
    }

    pub fn erf(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Erf, input)
    }

    pub fn relu(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Relu, input)
    }

    pub fn sigmoid(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Sigmoid, input)
    }

    pub fn sqrt(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Sqrt, input)
    }

    pub fn rsqrt(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Rsqrt, input)
    }

    pub fn reciprocal(&mut self, input: Value) -> FusionResult<Value> {
        self.unary(UnaryOp::Reciprocal, input)
    }

    pub fn where_(&mut self, cond: Value, on_true: Value, on_false: Value) -> FusionResult<Value> {
        self.record_single(Op::Where, &[cond, on_true, on_false])
    }

    pub fn cast(&mut self, input: Value, dtype: DType) -> FusionResult<Value> {
        self.record_single(Op::Cast { dtype }, &[input])
    }

    pub fn reduce(
        &mut self,
        kind: ReduceKind,
        input: Value,
        axes: &[isize],
        keep_dim: bool,
    ) -> FusionResult<Value> {
        self.record_single(
            Op::Reduce(ReduceSpec {
                kind,
                axes: axes.to_vec(),
                keep_dim,
                dtype: None,
            }),
            &[input],
        )
    }

    pub fn sum(&mut self, input: Value, axes: &[isize], keep_dim: bool) -> FusionResult<Value> {
        self.reduce(ReduceKind::Sum, input, axes, keep_dim)
    }

    pub fn max(&mut self, input: Value, axes: &[isize], keep_dim: bool) -> FusionResult<Value> {
        self.reduce(ReduceKind::Max, input, axes, keep_dim)
    }

    pub fn min(&mut self, input: Value, axes: &[isize], keep_dim: bool) -> FusionResult<Value> {
        self.reduce(ReduceKind::Min, input, axes, keep_dim)
    }

    pub fn mean(&mut self, input: Value, axes: &[isize], keep_dim: bool) -> FusionResult<Value> {
        self.reduce(ReduceKind::Mean, input, axes, keep_dim)
    }

    pub fn reshape(&mut self, input: Value, new_shape: &[i64]) -> FusionResult<Value> {
        self.record_single(
            Op::Reshape(ReshapeSpec {
                new_shape: new_shape.to_vec(),
            }),
            &[input],
        )
    }

    pub fn permute(&mut self, input: Value, dims: &[usize]) -> FusionResult<Value> {
        self.record_single(
            Op::Permute(PermuteSpec {
                dims: dims.to_vec(),
            }),
            &[input],
        )
    }

    pub fn broadcast_in_dim(
        &mut self,
        input: Value,
        shape: &[usize],
        broadcast_dims: &[usize],
    ) -> FusionResult<Value> {
        self.record_single(
            Op::BroadcastInDim(BroadcastInDimSpec {
                shape: shape.to_vec(),
                broadcast_dims: broadcast_dims.to_vec(),
            }),
            &[input],
        )
    }

    pub fn uniform(
        &mut self,
        like: Value,
        low: Value,
        high: Value,
        dtype: DType,
    ) -> FusionResult<Value> {
        self.record_single(Op::Uniform { dtype }, &[like, low, high])
    }

    pub fn normal(
        &mut self,
        like: Value,
        mean: Value,
        std: Value,
        dtype: DType,
    ) -> FusionResult<Value> {
        self.record_single(Op::Normal { dtype }, &[like, mean, std])
    }

    /// Marks `value` as a trace output, optionally written back into the storage of `alias`.
    ///
    /// `alias` must be a declared input of identical dtype and rank, aliased at most once.
    pub fn declare_output(&mut self, value: Value, alias: Option<Value>) -> FusionResult<()> {
        self.ensure_open()?;
        let meta = self.resolve(&value, 0)?;
        let alias_input = match alias {
            None => None,
            Some(alias) => {
                let alias_meta = self.resolve(&alias, 1)?;
                let ValueRef::Input(index) = alias.value else {
                    return Err(self.invalid("outputs can only alias declared inputs"));
                };
                if alias_meta.dtype != meta.dtype || alias_meta.rank != meta.rank {
                    return Err(self.invalid(format!(
                        "output {:?} rank {} cannot alias input {} of {:?} rank {}",
                        meta.dtype, meta.rank, index, alias_meta.dtype, alias_meta.rank
                    )));
                }
                if self
                    .outputs
                    .iter()
                    .any(|output| output.alias_input == Some(index))
                {
                    return Err(self.invalid(format!("input {index} is already aliased")));
                }
                Some(index)
            }
        };
        self.outputs.push(OutputDecl {
            value: value.value,
            alias_input,
        });
        Ok(())
    }

    /// Freezes the recording. Later mutation attempts fail with `FinalizedTrace`.
    pub fn end(&mut self) -> FusionResult<Arc<Trace>> {
        self.ensure_open()?;
        if self.outputs.is_empty() {
            return Err(self.invalid("trace declares no outputs"));
        }
        self.guard = None;
        trace!(
            "trace {}: finalized with {} inputs, {} nodes, {} outputs",
            self.id,
            self.inputs.len(),
            self.nodes.len(),
            self.outputs.len()
        );
        Ok(Arc::new(Trace::from_parts(
            self.id,
            std::mem::take(&mut self.inputs),
            std::mem::take(&mut self.nodes),
            std::mem::take(&mut self.outputs),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_recording_is_rejected_until_the_outer_one_ends() {
        let mut outer = TraceRecorder::begin().expect("first recording");
        assert!(matches!(
            TraceRecorder::begin(),
            Err(FusionError::ReentrantRecording)
        ));
        let a = outer
            .declare_input(InputDecl::symbolic(1, DType::Float))
            .expect("input");
        outer.declare_output(a, None).expect("output");
        outer.end().expect("end");
        let again = TraceRecorder::begin().expect("recording after end");
        drop(again);
    }

    #[test]
    fn handles_from_another_trace_are_dangling() {
        let mut first = TraceRecorder::begin().expect("begin");
        let foreign = first
            .declare_input(InputDecl::symbolic(1, DType::Float))
            .expect("input");
        first.declare_output(foreign, None).expect("output");
        first.end().expect("end");

        let mut second = TraceRecorder::begin().expect("begin");
        let own = second
            .declare_input(InputDecl::symbolic(1, DType::Float))
            .expect("input");
        let err = second.add(own, foreign).expect_err("foreign handle");
        assert!(matches!(
            err,
            FusionError::DanglingReference {
                position: 0,
                operand: 1,
                ..
            }
        ));
    }

    #[test]
    fn finalized_recorder_rejects_mutation() {
        let mut rec = TraceRecorder::begin().expect("begin");
        let a = rec
            .declare_input(InputDecl::symbolic(2, DType::Float))
            .expect("input");
        let b = rec.neg(a).expect("neg");
        rec.declare_output(b, None).expect("output");
        rec.end().expect("end");
        assert!(matches!(
            rec.neg(a),
            Err(FusionError::FinalizedTrace { .. })
        ));
        assert!(matches!(
            rec.declare_output(b, None),
            Err(FusionError::FinalizedTrace { .. })
        ));
        assert!(matches!(rec.end(), Err(FusionError::FinalizedTrace { .. })));
    }

    #[test]
    fn alias_requires_matching_input() {
        let mut rec = TraceRecorder::begin().expect("begin");
        let a = rec
            .declare_input(InputDecl::symbolic(2, DType::Float))
            .expect("input");
        let b = rec
            .declare_input(InputDecl::symbolic(1, DType::Float))
            .expect("input");
        let doubled = rec.add(a, a).expect("add");
        let err = rec
            .declare_output(doubled, Some(b))
            .expect_err("rank mismatch");
        assert!(matches!(err, FusionError::InvalidDefinition { .. }));
        let err = rec
            .declare_output(doubled, Some(doubled))
            .expect_err("alias to node");
        assert!(matches!(err, FusionError::InvalidDefinition { .. }));
        rec.declare_output(doubled, Some(a)).expect("alias a");
        let err = rec
            .declare_output(doubled, Some(a))
            .expect_err("second alias");
        assert!(matches!(err, FusionError::InvalidDefinition { .. }));
    }

    #[test]
    fn define_releases_guard_when_callback_fails() {
        let result = Trace::define(|rec| {
            let a = rec.declare_input(InputDecl::symbolic(2, DType::Float))?;
            rec.permute(a, &[0, 0])?;
            Ok(())
        });
        assert!(matches!(
            result,
            Err(FusionError::InvalidDefinition { position: 0, .. })
        ));
        drop(TraceRecorder::begin().expect("guard released"));
    }
}
