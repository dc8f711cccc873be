//! Lowers traces to flat kernel tapes and executes them on host tensors.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fuser_rs::backend::{ArtifactRef, ExecutionArgs, ExecutionOutput};
use fuser_rs::shape_key::ConcreteShapeKey;
use fuser_rs::tensor::{DType, TensorView};
use fuser_rs::trace::{Op, Trace, ValueRef};
use fuser_rs::{Artifact, CompileError, ExecutionError, Fingerprint, FusionBackend};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::kernels::{self, Buffer, KernelResult};
use crate::tensor::{round_to_dtype, HostTensor};

const TAPE_VERSION: u32 = 1;

/// One lowered node. Slots `0..input_count` hold the inputs; node `i` writes slot
/// `input_count + i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Instruction {
    op: Op,
    operands: SmallVec<[usize; 3]>,
    result: usize,
    dtype: DType,
    /// Index into the per-call runtime scalar list for runtime `scalar` nodes.
    runtime_scalar: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TapeOutput {
    slot: usize,
    dtype: DType,
    alias_input: Option<usize>,
}

/// Portable compiled form of one trace specialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelTape {
    version: u32,
    fingerprint: Fingerprint,
    input_count: usize,
    input_dtypes: Vec<DType>,
    instructions: Vec<Instruction>,
    outputs: Vec<TapeOutput>,
    stochastic: bool,
}

impl KernelTape {
    /// Lowers `trace`, checking every node against the concrete input shapes.
    pub fn lower(trace: &Trace, inputs: &[HostTensor]) -> Result<Self, CompileError> {
        if inputs.len() != trace.inputs().len() {
            return Err(CompileError::new(format!(
                "expected {} representative inputs, got {}",
                trace.inputs().len(),
                inputs.len()
            )));
        }
        let input_count = inputs.len();
        let slot_of = |value: ValueRef| match value {
            ValueRef::Input(index) => index,
            ValueRef::Node { node, .. } => input_count + node,
        };

        let mut dims: Vec<Vec<usize>> = inputs.iter().map(|t| t.sizes().to_vec()).collect();
        let mut instructions = Vec::with_capacity(trace.nodes().len());
        let mut runtime_index = 0usize;
        for (position, node) in trace.nodes().iter().enumerate() {
            if node.outputs.len() != 1 {
                return Err(CompileError::new(format!(
                    "node {position} ({}) has {} results; only single-result nodes are supported",
                    node.op.name(),
                    node.outputs.len()
                )));
            }
            let operands: SmallVec<[usize; 3]> =
                node.inputs.iter().map(|value| slot_of(*value)).collect();
            let operand_dims: Vec<&[usize]> =
                operands.iter().map(|slot| dims[*slot].as_slice()).collect();
            let result_dims = infer_dims(&node.op, &operand_dims).map_err(|reason| {
                CompileError::new(format!("node {position} ({}): {reason}", node.op.name()))
            })?;
            let runtime_scalar = match &node.op {
                Op::Scalar(attr) if attr.runtime => {
                    runtime_index += 1;
                    Some(runtime_index - 1)
                }
                _ => None,
            };
            dims.push(result_dims);
            instructions.push(Instruction {
                op: node.op.clone(),
                operands,
                result: input_count + position,
                dtype: node.outputs[0].dtype,
                runtime_scalar,
            });
        }

        let outputs = trace
            .outputs()
            .iter()
            .map(|output| {
                let dtype = trace
                    .value_meta(output.value)
                    .map(|meta| meta.dtype)
                    .ok_or_else(|| CompileError::new("output refers to an unknown value"))?;
                let slot = slot_of(output.value);
                if let Some(index) = output.alias_input {
                    if dims[slot] != dims[index] {
                        return Err(CompileError::new(format!(
                            "aliased output of shape {:?} does not match input {index} of shape {:?}",
                            dims[slot], dims[index]
                        )));
                    }
                }
                Ok(TapeOutput {
                    slot,
                    dtype,
                    alias_input: output.alias_input,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;

        Ok(Self {
            version: TAPE_VERSION,
            fingerprint: trace.fingerprint(),
            input_count,
            input_dtypes: trace.inputs().iter().map(|decl| decl.dtype).collect(),
            stochastic: instructions.iter().any(|instr| instr.op.is_stochastic()),
            instructions,
            outputs,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompileError> {
        let tape: KernelTape = bincode::deserialize(bytes)
            .map_err(|err| CompileError::new(format!("invalid kernel tape: {err}")))?;
        if tape.version != TAPE_VERSION {
            return Err(CompileError::new(format!(
                "unsupported kernel tape version {}",
                tape.version
            )));
        }
        Ok(tape)
    }

    /// Checks that a decoded tape lines up with `trace`: the same inputs, one instruction per
    /// node reading the slots the node's operands lower to, and the same outputs and aliases.
    fn check_against(&self, trace: &Trace) -> Result<(), CompileError> {
        let mismatch =
            |what: String| Err(CompileError::new(format!("kernel tape does not match trace: {what}")));
        let input_dtypes: Vec<DType> = trace.inputs().iter().map(|decl| decl.dtype).collect();
        if self.input_count != input_dtypes.len() || self.input_dtypes != input_dtypes {
            return mismatch(format!(
                "{} inputs {:?}, trace declares {:?}",
                self.input_count, self.input_dtypes, input_dtypes
            ));
        }
        if self.instructions.len() != trace.nodes().len() {
            return mismatch(format!(
                "{} instructions for {} nodes",
                self.instructions.len(),
                trace.nodes().len()
            ));
        }
        let slot_of = |value: ValueRef| match value {
            ValueRef::Input(index) => index,
            ValueRef::Node { node, .. } => self.input_count + node,
        };
        let mut runtime_index = 0usize;
        for (position, (instr, node)) in self.instructions.iter().zip(trace.nodes()).enumerate() {
            let operands: SmallVec<[usize; 3]> =
                node.inputs.iter().map(|value| slot_of(*value)).collect();
            let runtime_scalar = match &node.op {
                Op::Scalar(attr) if attr.runtime => {
                    runtime_index += 1;
                    Some(runtime_index - 1)
                }
                _ => None,
            };
            if instr.op != node.op
                || instr.operands != operands
                || instr.result != self.input_count + position
                || instr.runtime_scalar != runtime_scalar
                || node.outputs.first().map(|meta| meta.dtype) != Some(instr.dtype)
            {
                return mismatch(format!("instruction {position} differs from node {position}"));
            }
        }
        let outputs_match = self.outputs.len() == trace.outputs().len()
            && self
                .outputs
                .iter()
                .zip(trace.outputs())
                .all(|(output, decl)| {
                    output.slot == slot_of(decl.value)
                        && output.alias_input == decl.alias_input
                        && trace.value_meta(decl.value).map(|meta| meta.dtype) == Some(output.dtype)
                });
        if !outputs_match {
            return mismatch("outputs differ".to_string());
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        bincode::serialize(self).ok()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }
}

impl fmt::Display for KernelTape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tape {} (v{}, {} inputs)",
            self.fingerprint, self.version, self.input_count
        )?;
        for instr in &self.instructions {
            let operands = instr
                .operands
                .iter()
                .map(|slot| format!("s{slot}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  s{} = {}({operands}) : {:?}",
                instr.result,
                instr.op.name(),
                instr.dtype
            )?;
        }
        for output in &self.outputs {
            match output.alias_input {
                Some(index) => writeln!(f, "  out s{} -> in{index}", output.slot)?,
                None => writeln!(f, "  out s{}", output.slot)?,
            }
        }
        Ok(())
    }
}

/// Result extents of `op` for the given operand extents.
fn infer_dims(op: &Op, operands: &[&[usize]]) -> KernelResult<Vec<usize>> {
    match op {
        Op::Scalar(_) => Ok(Vec::new()),
        Op::Unary(_) | Op::Cast { .. } => Ok(operands[0].to_vec()),
        Op::Binary(_) | Op::Where => kernels::broadcast_shapes(operands),
        Op::Reduce(spec) => kernels::reduce_dims(operands[0], spec),
        Op::Reshape(spec) => kernels::reshape_dims(operands[0], &spec.new_shape),
        Op::Permute(spec) => Ok(spec.dims.iter().map(|&d| operands[0][d]).collect()),
        Op::BroadcastInDim(spec) => {
            kernels::check_broadcast_in_dim(operands[0], spec)?;
            Ok(spec.shape.clone())
        }
        Op::Uniform { .. } | Op::Normal { .. } => Ok(operands[0].to_vec()),
    }
}

pub struct CpuArtifact {
    tape: KernelTape,
    alignment: usize,
    executions: AtomicU64,
    /// Stochastic tapes serialize executions so each one sees a distinct RNG offset.
    rng_offset: Mutex<u64>,
}

impl CpuArtifact {
    fn new(tape: KernelTape, alignment: usize) -> Self {
        Self {
            tape,
            alignment,
            executions: AtomicU64::new(0),
            rng_offset: Mutex::new(0),
        }
    }

    pub fn tape(&self) -> &KernelTape {
        &self.tape
    }

    fn run(
        &self,
        args: &ExecutionArgs<'_, HostTensor>,
        rng_offset: u64,
    ) -> Result<Vec<HostTensor>, ExecutionError> {
        let tape = &self.tape;
        if args.inputs.len() != tape.input_count {
            return Err(ExecutionError::new(format!(
                "artifact expects {} inputs, got {}",
                tape.input_count,
                args.inputs.len()
            )));
        }
        for (index, input) in args.inputs.iter().enumerate() {
            if input.dtype() != tape.input_dtypes[index] {
                return Err(ExecutionError::new(format!(
                    "input {index} is {:?}, artifact was compiled for {:?}",
                    input.dtype(),
                    tape.input_dtypes[index]
                )));
            }
            if self.alignment > 1 && input.storage_offset() % self.alignment != 0 {
                return Err(ExecutionError::misaligned(format!(
                    "input {index} starts at element offset {}, vectorized path needs a multiple of {}",
                    input.storage_offset(),
                    self.alignment
                )));
            }
        }

        let mut slots: Vec<Option<Buffer>> = args
            .inputs
            .iter()
            .map(|input| {
                Some(Buffer {
                    dims: input.sizes().to_vec(),
                    data: input.to_vec(),
                })
            })
            .collect();
        slots.resize(tape.input_count + tape.instructions.len(), None);

        for instr in &tape.instructions {
            let operand = |i: usize| -> Result<&Buffer, ExecutionError> {
                slots[instr.operands[i]]
                    .as_ref()
                    .ok_or_else(|| ExecutionError::new("operand slot is empty"))
            };
            let fail = |reason: String| {
                ExecutionError::new(format!("s{} = {}: {reason}", instr.result, instr.op.name()))
            };
            let mut buffer = match &instr.op {
                Op::Scalar(attr) => {
                    let value = match instr.runtime_scalar {
                        Some(index) => args
                            .runtime_scalars
                            .get(index)
                            .ok_or_else(|| fail(format!("runtime scalar {index} was not supplied")))?
                            .as_f64(),
                        None => attr.value.as_f64(),
                    };
                    Buffer::scalar(value)
                }
                Op::Unary(op) => kernels::unary(*op, operand(0)?),
                Op::Binary(op) => kernels::binary(*op, operand(0)?, operand(1)?).map_err(fail)?,
                Op::Where => {
                    kernels::select(operand(0)?, operand(1)?, operand(2)?).map_err(fail)?
                }
                Op::Cast { .. } => operand(0)?.clone(),
                Op::Reduce(spec) => kernels::reduce(spec, operand(0)?).map_err(fail)?,
                Op::Reshape(spec) => kernels::reshape(operand(0)?, &spec.new_shape).map_err(fail)?,
                Op::Permute(spec) => kernels::permute(operand(0)?, &spec.dims),
                Op::BroadcastInDim(spec) => {
                    kernels::broadcast_in_dim(operand(0)?, spec).map_err(fail)?
                }
                Op::Uniform { .. } => {
                    let dims = operand(0)?.dims.clone();
                    let (low, high) = (operand(1)?.data[0], operand(2)?.data[0]);
                    kernels::uniform(&dims, low, high, args.rng_seed, rng_offset, instr.result)
                }
                Op::Normal { .. } => {
                    let dims = operand(0)?.dims.clone();
                    let (mean, std) = (operand(1)?.data[0], operand(2)?.data[0]);
                    kernels::normal(&dims, mean, std, args.rng_seed, rng_offset, instr.result)
                }
            };
            for value in &mut buffer.data {
                *value = round_to_dtype(*value, instr.dtype);
            }
            slots[instr.result] = Some(buffer);
        }

        // Validate every alias before mutating any input.
        for output in &tape.outputs {
            if let Some(index) = output.alias_input {
                let dims = slots[output.slot]
                    .as_ref()
                    .map(|buffer| buffer.dims.as_slice())
                    .unwrap_or_default();
                if dims != args.inputs[index].sizes() {
                    return Err(ExecutionError::new(format!(
                        "aliased output of shape {:?} does not match input {index} of shape {:?}",
                        dims,
                        args.inputs[index].sizes()
                    )));
                }
            }
        }

        let mut results = Vec::with_capacity(tape.outputs.len());
        for output in &tape.outputs {
            let buffer = slots[output.slot]
                .as_ref()
                .ok_or_else(|| ExecutionError::new("output slot is empty"))?;
            let tensor = match output.alias_input {
                Some(index) => {
                    let target = &args.inputs[index];
                    target
                        .write_dense(&buffer.data)
                        .map_err(|err| ExecutionError::new(err.to_string()))?;
                    target.clone()
                }
                None => HostTensor::from_vec(&buffer.dims, buffer.data.clone(), output.dtype)
                    .map_err(|err| ExecutionError::new(err.to_string()))?,
            };
            results.push(tensor);
        }
        Ok(results)
    }
}

impl Artifact<HostTensor> for CpuArtifact {
    fn execute(
        &self,
        args: &ExecutionArgs<'_, HostTensor>,
    ) -> Result<ExecutionOutput<HostTensor>, ExecutionError> {
        let outputs = if self.tape.stochastic {
            let mut offset = self.rng_offset.lock().expect("rng offset lock poisoned");
            let outputs = self.run(args, *offset)?;
            *offset += 1;
            outputs
        } else {
            self.run(args, 0)?
        };
        let execution = self.executions.fetch_add(1, Ordering::AcqRel);
        trace!(
            "cpu artifact {}: execution #{execution} finished",
            self.tape.fingerprint
        );
        let diagnostics = args
            .capture_diagnostics
            .then(|| format!("execution #{execution}\n{}", self.tape));
        Ok(ExecutionOutput {
            outputs,
            diagnostics,
        })
    }

    fn portable_bytes(&self) -> Option<Vec<u8>> {
        self.tape.to_bytes()
    }

    fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }
}

/// Reference backend. Compiles traces to [`KernelTape`]s and runs them on the host.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    alignment: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self { alignment: 1 }
    }

    /// Requires every input to start at an element offset that is a multiple of `alignment`.
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            alignment: alignment.max(1),
        }
    }
}

impl FusionBackend for CpuBackend {
    type Tensor = HostTensor;

    fn backend_name(&self) -> &str {
        "cpu-ref"
    }

    fn compile(
        &self,
        trace: &Trace,
        inputs: &[HostTensor],
        key: &ConcreteShapeKey,
    ) -> Result<ArtifactRef<HostTensor>, CompileError> {
        let tape = KernelTape::lower(trace, inputs)?;
        debug!(
            "cpu-ref: lowered {} to {} instructions (key {:016x})",
            tape.fingerprint,
            tape.instruction_count(),
            key.tag()
        );
        Ok(Arc::new(CpuArtifact::new(tape, self.alignment)))
    }

    fn restore(
        &self,
        trace: &Trace,
        _key: &ConcreteShapeKey,
        bytes: &[u8],
    ) -> Result<ArtifactRef<HostTensor>, CompileError> {
        let tape = KernelTape::from_bytes(bytes)?;
        if tape.fingerprint != trace.fingerprint() {
            return Err(CompileError::new(format!(
                "kernel tape was compiled for {}, not {}",
                tape.fingerprint,
                trace.fingerprint()
            )));
        }
        tape.check_against(trace)?;
        Ok(Arc::new(CpuArtifact::new(tape, self.alignment)))
    }

    fn write_into(&self, dst: &HostTensor, src: &HostTensor) -> Result<(), ExecutionError> {
        if dst.sizes() != src.sizes() {
            return Err(ExecutionError::new(format!(
                "cannot write tensor of shape {:?} into {:?}",
                src.sizes(),
                dst.sizes()
            )));
        }
        dst.write_dense(&src.to_vec())
            .map_err(|err| ExecutionError::new(err.to_string()))
    }
}
