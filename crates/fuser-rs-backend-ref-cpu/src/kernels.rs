//! Dense reference kernels over row-major `f64` buffers.

use fuser_rs::trace::ops::{checked_volume, normalize_axes};
use fuser_rs::trace::{BinaryOp, BroadcastInDimSpec, ReduceKind, ReduceSpec, UnaryOp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) type KernelResult<T> = Result<T, String>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Buffer {
    pub(crate) dims: Vec<usize>,
    pub(crate) data: Vec<f64>,
}

impl Buffer {
    pub(crate) fn scalar(value: f64) -> Self {
        Self {
            dims: Vec::new(),
            data: vec![value],
        }
    }
}

pub(crate) fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize], coords: &mut [usize]) {
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            coords[i] = 0;
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
}

/// Numpy-style broadcast of right-aligned shapes.
pub(crate) fn broadcast_shapes(shapes: &[&[usize]]) -> KernelResult<Vec<usize>> {
    let rank = shapes.iter().map(|shape| shape.len()).max().unwrap_or(0);
    let mut out = vec![1usize; rank];
    for shape in shapes {
        let pad = rank - shape.len();
        for (axis, &dim) in shape.iter().enumerate() {
            let slot = &mut out[pad + axis];
            if *slot == 1 {
                *slot = dim;
            } else if dim != 1 && dim != *slot {
                return Err(format!("shapes {:?} cannot be broadcast together", shapes));
            }
        }
    }
    Ok(out)
}

/// Strides mapping an output index of shape `out` into a buffer of shape `dims`
/// (0 on broadcast axes).
fn broadcast_strides(dims: &[usize], out: &[usize]) -> Vec<usize> {
    let pad = out.len() - dims.len();
    let own = compute_strides(dims);
    let mut strides = vec![0usize; out.len()];
    for (axis, &dim) in dims.iter().enumerate() {
        if dim != 1 {
            strides[pad + axis] = own[axis];
        }
    }
    strides
}

fn map_broadcast(operands: &[&Buffer], f: impl Fn(&[f64]) -> f64) -> KernelResult<Buffer> {
    let shapes: Vec<&[usize]> = operands.iter().map(|b| b.dims.as_slice()).collect();
    let dims = broadcast_shapes(&shapes)?;
    let strides: Vec<Vec<usize>> = operands
        .iter()
        .map(|operand| broadcast_strides(&operand.dims, &dims))
        .collect();
    let len: usize = dims.iter().product();
    let mut coords = vec![0usize; dims.len()];
    let mut values = vec![0.0; operands.len()];
    let mut data = Vec::with_capacity(len);
    for index in 0..len {
        unravel_index(index, &dims, &mut coords);
        for (slot, (operand, strides)) in operands.iter().zip(&strides).enumerate() {
            let position: usize = coords.iter().zip(strides).map(|(c, s)| c * s).sum();
            values[slot] = operand.data[position];
        }
        data.push(f(&values));
    }
    Ok(Buffer { dims, data })
}

pub(crate) fn unary(op: UnaryOp, input: &Buffer) -> Buffer {
    let f = |x: f64| match op {
        UnaryOp::Neg => -x,
        UnaryOp::Abs => x.abs(),
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Erf => libm::erf(x),
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Rsqrt => 1.0 / x.sqrt(),
        UnaryOp::Reciprocal => 1.0 / x,
    };
    Buffer {
        dims: input.dims.clone(),
        data: input.data.iter().map(|&x| f(x)).collect(),
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &Buffer, rhs: &Buffer) -> KernelResult<Buffer> {
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    map_broadcast(&[lhs, rhs], |v| {
        let (x, y) = (v[0], v[1]);
        match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Maximum => x.max(y),
            BinaryOp::Minimum => x.min(y),
            BinaryOp::Pow => x.powf(y),
            BinaryOp::Lt => flag(x < y),
            BinaryOp::Le => flag(x <= y),
            BinaryOp::Gt => flag(x > y),
            BinaryOp::Ge => flag(x >= y),
            BinaryOp::Eq => flag(x == y),
            BinaryOp::Ne => flag(x != y),
        }
    })
}

pub(crate) fn select(cond: &Buffer, on_true: &Buffer, on_false: &Buffer) -> KernelResult<Buffer> {
    map_broadcast(&[cond, on_true, on_false], |v| {
        if v[0] != 0.0 {
            v[1]
        } else {
            v[2]
        }
    })
}

pub(crate) fn reduce_dims(dims: &[usize], spec: &ReduceSpec) -> KernelResult<Vec<usize>> {
    let axes = normalize_axes(&spec.axes, dims.len())?;
    Ok(dims
        .iter()
        .enumerate()
        .filter_map(|(axis, &dim)| {
            if !axes.contains(&axis) {
                Some(dim)
            } else if spec.keep_dim {
                Some(1)
            } else {
                None
            }
        })
        .collect())
}

pub(crate) fn reduce(spec: &ReduceSpec, input: &Buffer) -> KernelResult<Buffer> {
    let axes = normalize_axes(&spec.axes, input.dims.len())?;
    // Accumulate into a keep-dim layout, then drop reduced axes if requested.
    let kept: Vec<usize> = input
        .dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if axes.contains(&axis) { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept);
    let out_len: usize = kept.iter().product();
    let init = match spec.kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0,
        ReduceKind::Max => f64::NEG_INFINITY,
        ReduceKind::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_len];
    let mut coords = vec![0usize; input.dims.len()];
    for (index, &value) in input.data.iter().enumerate() {
        unravel_index(index, &input.dims, &mut coords);
        let target: usize = coords
            .iter()
            .zip(&kept_strides)
            .enumerate()
            .map(|(axis, (c, s))| if axes.contains(&axis) { 0 } else { c * s })
            .sum();
        let slot = &mut acc[target];
        *slot = match spec.kind {
            ReduceKind::Sum | ReduceKind::Mean => *slot + value,
            ReduceKind::Max => slot.max(value),
            ReduceKind::Min => slot.min(value),
        };
    }
    if spec.kind == ReduceKind::Mean {
        let count: usize = axes.iter().map(|&axis| input.dims[axis]).product();
        for value in &mut acc {
            *value /= count as f64;
        }
    }
    Ok(Buffer {
        dims: reduce_dims(&input.dims, spec)?,
        data: acc,
    })
}

pub(crate) fn reshape_dims(dims: &[usize], new_shape: &[i64]) -> KernelResult<Vec<usize>> {
    let overflow = || format!("reshape of {:?} to {:?} overflows the element count", dims, new_shape);
    let total = checked_volume(dims.iter().copied()).ok_or_else(overflow)?;
    let total = if dims.contains(&0) { 0 } else { total };
    let mut out = Vec::with_capacity(new_shape.len());
    let mut inferred = None;
    for (axis, &dim) in new_shape.iter().enumerate() {
        if dim >= 0 {
            out.push(usize::try_from(dim).map_err(|_| overflow())?);
        } else {
            inferred = Some(axis);
            out.push(1);
        }
    }
    let known = checked_volume(out.iter().copied()).ok_or_else(overflow)?;
    let known = if out.contains(&0) { 0 } else { known };
    if let Some(axis) = inferred {
        if known == 0 || total % known != 0 {
            return Err(format!(
                "cannot infer -1 in reshape of {:?} to {:?}",
                dims, new_shape
            ));
        }
        out[axis] = total / known;
    } else if known != total {
        return Err(format!("cannot reshape {:?} to {:?}", dims, new_shape));
    }
    Ok(out)
}

pub(crate) fn reshape(input: &Buffer, new_shape: &[i64]) -> KernelResult<Buffer> {
    Ok(Buffer {
        dims: reshape_dims(&input.dims, new_shape)?,
        data: input.data.clone(),
    })
}

pub(crate) fn permute(input: &Buffer, dims: &[usize]) -> Buffer {
    let out_dims: Vec<usize> = dims.iter().map(|&d| input.dims[d]).collect();
    let in_strides = compute_strides(&input.dims);
    let len = input.data.len();
    let mut coords = vec![0usize; out_dims.len()];
    let mut data = Vec::with_capacity(len);
    for index in 0..len {
        unravel_index(index, &out_dims, &mut coords);
        let position: usize = coords
            .iter()
            .zip(dims)
            .map(|(c, &d)| c * in_strides[d])
            .sum();
        data.push(input.data[position]);
    }
    Buffer {
        dims: out_dims,
        data,
    }
}

pub(crate) fn check_broadcast_in_dim(
    dims: &[usize],
    spec: &BroadcastInDimSpec,
) -> KernelResult<()> {
    if checked_volume(spec.shape.iter().copied()).is_none() {
        return Err(format!("broadcast shape {:?} overflows the element count", spec.shape));
    }
    for (axis, (&dim, &target)) in dims.iter().zip(&spec.broadcast_dims).enumerate() {
        let extent = spec.shape[target];
        if dim != 1 && dim != extent {
            return Err(format!(
                "operand axis {axis} of extent {dim} cannot broadcast to {extent}"
            ));
        }
    }
    Ok(())
}

pub(crate) fn broadcast_in_dim(input: &Buffer, spec: &BroadcastInDimSpec) -> KernelResult<Buffer> {
    check_broadcast_in_dim(&input.dims, spec)?;
    let own = compute_strides(&input.dims);
    let mut strides = vec![0usize; spec.shape.len()];
    for (axis, &target) in spec.broadcast_dims.iter().enumerate() {
        if input.dims[axis] != 1 {
            strides[target] = own[axis];
        }
    }
    let len: usize = spec.shape.iter().product();
    let mut coords = vec![0usize; spec.shape.len()];
    let mut data = Vec::with_capacity(len);
    for index in 0..len {
        unravel_index(index, &spec.shape, &mut coords);
        let position: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
        data.push(input.data[position]);
    }
    Ok(Buffer {
        dims: spec.shape.clone(),
        data,
    })
}

/// Seeds one generator per (seed, execution, node) so results only depend on call order.
fn node_rng(seed: u64, execution: u64, node: usize) -> StdRng {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    for word in [execution, node as u64] {
        state = (state ^ word).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        state ^= state >> 31;
    }
    StdRng::seed_from_u64(state)
}

pub(crate) fn uniform(
    dims: &[usize],
    low: f64,
    high: f64,
    seed: u64,
    execution: u64,
    node: usize,
) -> Buffer {
    let mut rng = node_rng(seed, execution, node);
    let len: usize = dims.iter().product();
    Buffer {
        dims: dims.to_vec(),
        data: (0..len)
            .map(|_| low + (high - low) * rng.gen::<f64>())
            .collect(),
    }
}

pub(crate) fn normal(
    dims: &[usize],
    mean: f64,
    std: f64,
    seed: u64,
    execution: u64,
    node: usize,
) -> Buffer {
    let mut rng = node_rng(seed, execution, node);
    let len: usize = dims.iter().product();
    let data = (0..len)
        .map(|_| {
            // Box-Muller; `1 - u` keeps the log argument in (0, 1].
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen::<f64>();
            let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
            mean + std * z
        })
        .collect();
    Buffer {
        dims: dims.to_vec(),
        data,
    }
}
