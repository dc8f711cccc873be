//! Closed operator set recorded into traces.
//!
//! Every operator carries a fixed attribute payload; recording is construction of tagged
//! nodes, never virtual dispatch. Result metadata (dtype and rank) is inferred at record time
//! so malformed definitions fail before they ever reach a compiler.

use serde::{Deserialize, Serialize};

use crate::tensor::DType;

/// Scalar literal stored in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarLiteral {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ScalarLiteral {
    /// Dtype used when the caller does not request one explicitly.
    pub fn default_dtype(self) -> DType {
        match self {
            ScalarLiteral::Bool(_) => DType::Bool,
            ScalarLiteral::Int(_) => DType::Int64,
            ScalarLiteral::Float(_) => DType::Double,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ScalarLiteral::Bool(value) => {
                if value {
                    1.0
                } else {
                    0.0
                }
            }
            ScalarLiteral::Int(value) => value as f64,
            ScalarLiteral::Float(value) => value,
        }
    }
}

impl From<f64> for ScalarLiteral {
    fn from(value: f64) -> Self {
        ScalarLiteral::Float(value)
    }
}

impl From<i64> for ScalarLiteral {
    fn from(value: i64) -> Self {
        ScalarLiteral::Int(value)
    }
}

impl From<bool> for ScalarLiteral {
    fn from(value: bool) -> Self {
        ScalarLiteral::Bool(value)
    }
}

/// Attribute payload for `scalar`.
///
/// A `runtime` scalar is a value the caller expects to vary between otherwise identical
/// definitions: its value is excluded from the fingerprint and handed to the artifact on every
/// execution instead of being baked into compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarAttr {
    pub value: ScalarLiteral,
    pub dtype: DType,
    pub runtime: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Erf,
    Relu,
    Sigmoid,
    Sqrt,
    Rsqrt,
    Reciprocal,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Erf => "erf",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Reciprocal => "reciprocal",
        }
    }

    /// Transcendental ops produce floating results even for integral operands.
    fn requires_float(self) -> bool {
        !matches!(self, UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Relu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Pow => "pow",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
    Mean,
}

impl ReduceKind {
    pub fn name(self) -> &'static str {
        match self {
            ReduceKind::Sum => "sum",
            ReduceKind::Max => "max",
            ReduceKind::Min => "min",
            ReduceKind::Mean => "mean",
        }
    }
}

/// Attribute payload for reductions. Negative axes count from the back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<isize>,
    pub keep_dim: bool,
    pub dtype: Option<DType>,
}

/// Attribute payload for `reshape`; a single `-1` entry is inferred from the element count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermuteSpec {
    pub dims: Vec<usize>,
}

/// Attribute payload for `broadcast_in_dim`: operand axis `i` maps onto output axis
/// `broadcast_dims[i]`; the remaining output axes are new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastInDimSpec {
    pub shape: Vec<usize>,
    pub broadcast_dims: Vec<usize>,
}

/// Recorded operator with its static attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Scalar(ScalarAttr),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `where(cond, on_true, on_false)`.
    Where,
    Cast { dtype: DType },
    Reduce(ReduceSpec),
    Reshape(ReshapeSpec),
    Permute(PermuteSpec),
    BroadcastInDim(BroadcastInDimSpec),
    /// `uniform(like, low, high)`: samples shaped like the first operand.
    Uniform { dtype: DType },
    /// `normal(like, mean, std)`: samples shaped like the first operand.
    Normal { dtype: DType },
}

/// Result metadata tracked per recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueMeta {
    pub dtype: DType,
    pub rank: usize,
    /// Produced by a `scalar` node (rank 0, participates in scalar-aware promotion).
    pub scalar: bool,
}

impl ValueMeta {
    pub fn tensor(dtype: DType, rank: usize) -> Self {
        Self {
            dtype,
            rank,
            scalar: false,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            rank: 0,
            scalar: true,
        }
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Scalar(_) => "scalar",
            Op::Unary(op) => op.name(),
            Op::Binary(op) => op.name(),
            Op::Where => "where",
            Op::Cast { .. } => "cast",
            Op::Reduce(spec) => spec.kind.name(),
            Op::Reshape(_) => "reshape",
            Op::Permute(_) => "permute",
            Op::BroadcastInDim(_) => "broadcast_in_dim",
            Op::Uniform { .. } => "uniform",
            Op::Normal { .. } => "normal",
        }
    }

    /// Whether the operator consumes per-execution random state.
    pub fn is_stochastic(&self) -> bool {
        matches!(self, Op::Uniform { .. } | Op::Normal { .. })
    }

    fn arity(&self) -> usize {
        match self {
            Op::Scalar(_) => 0,
            Op::Unary(_)
            | Op::Cast { .. }
            | Op::Reduce(_)
            | Op::Reshape(_)
            | Op::Permute(_)
            | Op::BroadcastInDim(_) => 1,
            Op::Binary(_) => 2,
            Op::Where | Op::Uniform { .. } | Op::Normal { .. } => 3,
        }
    }

    /// Infers result metadata, returning a human readable reason on malformed definitions.
    pub fn infer(&self, inputs: &[ValueMeta]) -> Result<Vec<ValueMeta>, String> {
        if inputs.len() != self.arity() {
            return Err(format!(
                "{} expects {} operand(s), got {}",
                self.name(),
                self.arity(),
                inputs.len()
            ));
        }
        let out = match self {
            Op::Scalar(attr) => {
                check_scalar_dtype(attr)?;
                ValueMeta::scalar(attr.dtype)
            }
            Op::Unary(op) => {
                let input = inputs[0];
                let dtype = if op.requires_float() && !input.dtype.is_float() {
                    DType::Float
                } else {
                    input.dtype
                };
                ValueMeta {
                    dtype,
                    rank: input.rank,
                    scalar: input.scalar,
                }
            }
            Op::Binary(op) => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                let mut dtype = binary_result_dtype(lhs, rhs);
                if *op == BinaryOp::Div && !dtype.is_float() {
                    dtype = DType::Float;
                }
                if op.is_comparison() {
                    dtype = DType::Bool;
                }
                ValueMeta {
                    dtype,
                    rank: lhs.rank.max(rhs.rank),
                    scalar: lhs.scalar && rhs.scalar,
                }
            }
            Op::Where => {
                let (cond, lhs, rhs) = (inputs[0], inputs[1], inputs[2]);
                if cond.dtype != DType::Bool {
                    return Err(format!(
                        "where condition must be Bool, got {:?}",
                        cond.dtype
                    ));
                }
                ValueMeta {
                    dtype: binary_result_dtype(lhs, rhs),
                    rank: cond.rank.max(lhs.rank).max(rhs.rank),
                    scalar: cond.scalar && lhs.scalar && rhs.scalar,
                }
            }
            Op::Cast { dtype } => ValueMeta {
                dtype: *dtype,
                rank: inputs[0].rank,
                scalar: inputs[0].scalar,
            },
            Op::Reduce(spec) => {
                let input = inputs[0];
                let axes = normalize_axes(&spec.axes, input.rank)?;
                let rank = if spec.keep_dim {
                    input.rank
                } else {
                    input.rank - axes.len()
                };
                let dtype = match (spec.dtype, spec.kind) {
                    (Some(dtype), _) => dtype,
                    (None, ReduceKind::Mean) if !input.dtype.is_float() => DType::Float,
                    (None, _) => input.dtype,
                };
                ValueMeta::tensor(dtype, rank)
            }
            Op::Reshape(spec) => {
                let inferred = spec.new_shape.iter().filter(|dim| **dim == -1).count();
                if inferred > 1 {
                    return Err("reshape allows at most one inferred (-1) extent".to_string());
                }
                if let Some(bad) = spec.new_shape.iter().find(|dim| **dim < -1) {
                    return Err(format!("reshape extent {bad} is invalid"));
                }
                let extents = spec
                    .new_shape
                    .iter()
                    .filter(|dim| **dim >= 0)
                    .map(|dim| usize::try_from(*dim).unwrap_or(usize::MAX));
                if checked_volume(extents).is_none() {
                    return Err(format!(
                        "reshape extents {:?} exceed the addressable element count",
                        spec.new_shape
                    ));
                }
                ValueMeta::tensor(inputs[0].dtype, spec.new_shape.len())
            }
            Op::Permute(spec) => {
                let input = inputs[0];
                let mut seen = vec![false; input.rank];
                if spec.dims.len() != input.rank {
                    return Err(format!(
                        "permute expects {} dims, got {}",
                        input.rank,
                        spec.dims.len()
                    ));
                }
                for &dim in &spec.dims {
                    if dim >= input.rank || seen[dim] {
                        return Err(format!("permute dims {:?} are not a permutation", spec.dims));
                    }
                    seen[dim] = true;
                }
                ValueMeta::tensor(input.dtype, input.rank)
            }
            Op::BroadcastInDim(spec) => {
                let input = inputs[0];
                if spec.broadcast_dims.len() != input.rank {
                    return Err(format!(
                        "broadcast_in_dim maps {} operand axes but operand has rank {}",
                        spec.broadcast_dims.len(),
                        input.rank
                    ));
                }
                let increasing = spec.broadcast_dims.windows(2).all(|w| w[0] < w[1]);
                let in_range = spec.broadcast_dims.iter().all(|dim| *dim < spec.shape.len());
                if !increasing || !in_range {
                    return Err(format!(
                        "broadcast dims {:?} must be strictly increasing and below rank {}",
                        spec.broadcast_dims,
                        spec.shape.len()
                    ));
                }
                if checked_volume(spec.shape.iter().copied()).is_none() {
                    return Err(format!(
                        "broadcast shape {:?} exceeds the addressable element count",
                        spec.shape
                    ));
                }
                ValueMeta::tensor(input.dtype, spec.shape.len())
            }
            Op::Uniform { dtype } | Op::Normal { dtype } => {
                if !dtype.is_float() {
                    return Err(format!("{} requires a floating dtype", self.name()));
                }
                if !inputs[1].scalar || !inputs[2].scalar {
                    return Err(format!("{} bounds must be scalars", self.name()));
                }
                ValueMeta::tensor(*dtype, inputs[0].rank)
            }
        };
        Ok(vec![out])
    }
}

fn check_scalar_dtype(attr: &ScalarAttr) -> Result<(), String> {
    let compatible = match attr.value {
        ScalarLiteral::Bool(_) => true,
        ScalarLiteral::Int(_) => attr.dtype != DType::Bool,
        ScalarLiteral::Float(_) => attr.dtype.is_float(),
    };
    if compatible {
        Ok(())
    } else {
        Err(format!(
            "scalar {:?} cannot be declared as {:?}",
            attr.value, attr.dtype
        ))
    }
}

/// Scalars never widen a tensor of the same category: `float_tensor * 3.0` stays `Float`.
fn binary_result_dtype(lhs: ValueMeta, rhs: ValueMeta) -> DType {
    let category = |dtype: DType| {
        if dtype.is_float() {
            2
        } else if dtype.is_integer() {
            1
        } else {
            0
        }
    };
    match (lhs.scalar, rhs.scalar) {
        (true, false) | (false, true) => {
            let (scalar, tensor) = if lhs.scalar { (lhs, rhs) } else { (rhs, lhs) };
            if category(scalar.dtype) <= category(tensor.dtype) {
                tensor.dtype
            } else if scalar.dtype.is_float() {
                DType::Float
            } else {
                scalar.dtype
            }
        }
        _ => lhs.dtype.promote(rhs.dtype),
    }
}

/// Element count spanned by the non-zero `extents`, or `None` when it exceeds `isize::MAX`.
///
/// Zero extents are skipped so every row-major stride of such a shape fits as well.
pub fn checked_volume(extents: impl IntoIterator<Item = usize>) -> Option<usize> {
    extents
        .into_iter()
        .filter(|extent| *extent != 0)
        .try_fold(1usize, |acc, extent| acc.checked_mul(extent))
        .filter(|volume| *volume <= isize::MAX as usize)
}

/// Resolves possibly negative axes against `rank`, rejecting duplicates and out-of-range axes.
pub fn normalize_axes(axes: &[isize], rank: usize) -> Result<Vec<usize>, String> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let resolved = if axis < 0 {
            axis + rank as isize
        } else {
            axis
        };
        if resolved < 0 || resolved as usize >= rank {
            return Err(format!("axis {axis} is out of range for rank {rank}"));
        }
        let resolved = resolved as usize;
        if out.contains(&resolved) {
            return Err(format!("axis {axis} is repeated"));
        }
        out.push(resolved);
    }
    out.sort_unstable();
    Ok(out)
}
