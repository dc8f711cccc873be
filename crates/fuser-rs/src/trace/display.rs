//! Textual form of a trace.
//!
//! The output never includes the process-local trace id, so two independently recorded equal
//! traces print identically.

use std::fmt;

use super::ops::{Op, ScalarLiteral};
use super::{AxisDecl, InputDecl, Trace, ValueRef};

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, "fusion {")?;
        write_line(f, 1, "inputs:")?;
        for (index, decl) in self.inputs().iter().enumerate() {
            write_line(f, 2, &format!("%in{index} : {}", fmt_input(decl)))?;
        }
        write_line(f, 1, "body:")?;
        for (index, node) in self.nodes().iter().enumerate() {
            let operands = node
                .inputs
                .iter()
                .map(|value| fmt_value(*value))
                .collect::<Vec<_>>()
                .join(", ");
            let results = node
                .outputs
                .iter()
                .map(|meta| format!("{:?}[rank {}]", meta.dtype, meta.rank))
                .collect::<Vec<_>>()
                .join(", ");
            write_line(
                f,
                2,
                &format!(
                    "%{index} = {}{}({operands}) -> {results}",
                    node.op.name(),
                    fmt_attrs(&node.op)
                ),
            )?;
        }
        write_line(f, 1, "outputs:")?;
        for output in self.outputs() {
            let line = match output.alias_input {
                Some(input) => format!("{} -> alias %in{input}", fmt_value(output.value)),
                None => fmt_value(output.value),
            };
            write_line(f, 2, &line)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_value(value: ValueRef) -> String {
    match value {
        ValueRef::Input(index) => format!("%in{index}"),
        ValueRef::Node { node, slot: 0 } => format!("%{node}"),
        ValueRef::Node { node, slot } => format!("%{node}#{slot}"),
    }
}

fn fmt_input(decl: &InputDecl) -> String {
    let axes = decl
        .axes
        .iter()
        .map(|axis| match axis {
            AxisDecl::Symbolic => "?".to_string(),
            AxisDecl::Broadcast => "1b".to_string(),
            AxisDecl::Static(size) => size.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    let contiguity = decl
        .contiguity
        .iter()
        .map(|entry| match entry {
            Some(true) => "T",
            Some(false) => "F",
            None => "_",
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{:?}[{axes}] contiguity=[{contiguity}] device={}",
        decl.dtype, decl.device
    )
}

fn fmt_literal(value: ScalarLiteral) -> String {
    match value {
        ScalarLiteral::Bool(value) => value.to_string(),
        ScalarLiteral::Int(value) => value.to_string(),
        ScalarLiteral::Float(value) => format!("{value:?}"),
    }
}

fn fmt_attrs(op: &Op) -> String {
    match op {
        Op::Scalar(attr) => format!(
            "<{} : {:?}{}>",
            fmt_literal(attr.value),
            attr.dtype,
            if attr.runtime { ", runtime" } else { "" }
        ),
        Op::Unary(_) | Op::Binary(_) | Op::Where => String::new(),
        Op::Cast { dtype } => format!("<{dtype:?}>"),
        Op::Reduce(spec) => {
            let dtype = spec
                .dtype
                .map(|dtype| format!(", dtype={dtype:?}"))
                .unwrap_or_default();
            format!("<axes={:?}, keep_dim={}{dtype}>", spec.axes, spec.keep_dim)
        }
        Op::Reshape(spec) => format!("<shape={:?}>", spec.new_shape),
        Op::Permute(spec) => format!("<dims={:?}>", spec.dims),
        Op::BroadcastInDim(spec) => format!(
            "<shape={:?}, broadcast_dims={:?}>",
            spec.shape, spec.broadcast_dims
        ),
        Op::Uniform { dtype } | Op::Normal { dtype } => format!("<{dtype:?}>"),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}
