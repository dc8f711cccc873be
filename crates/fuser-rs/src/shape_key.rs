//! Per-execution classification of concrete inputs.
//!
//! A [`ConcreteShapeKey`] buckets each input axis into `One`, `Symbolic` or `Exact(n)` according
//! to the trace's declarations, and records the observed contiguity. Several specializations can
//! live under one fingerprint; [`ConcreteShapeKey::serves`] and
//! [`ConcreteShapeKey::specificity`] decide which one handles a request.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{FusionError, FusionResult};
use crate::fingerprint::hashing::short_hash;
use crate::fingerprint::Fingerprint;
use crate::tensor::{DType, TensorView};
use crate::trace::{AxisDecl, InputDecl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisClass {
    One,
    /// Any extent other than 1.
    Symbolic,
    Exact(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputKey {
    pub dtype: DType,
    pub axes: SmallVec<[AxisClass; 6]>,
    pub contiguity: SmallVec<[Option<bool>; 6]>,
}

impl InputKey {
    fn serves(&self, request: &InputKey) -> bool {
        if self.dtype != request.dtype
            || self.axes.len() != request.axes.len()
            || self.contiguity.len() != request.contiguity.len()
        {
            return false;
        }
        let axes_ok = self
            .axes
            .iter()
            .zip(&request.axes)
            .all(|(entry, req)| match (entry, req) {
                _ if entry == req => true,
                (AxisClass::Symbolic, AxisClass::Exact(n)) => *n != 1,
                _ => false,
            });
        let layout_ok = self
            .contiguity
            .iter()
            .zip(&request.contiguity)
            .all(|(entry, req)| entry == req || (*entry == Some(false) && *req == Some(true)));
        axes_ok && layout_ok
    }

    fn exact_positions(&self, request: &InputKey) -> usize {
        let axes = self
            .axes
            .iter()
            .zip(&request.axes)
            .filter(|(entry, req)| entry == req)
            .count();
        let layout = self
            .contiguity
            .iter()
            .zip(&request.contiguity)
            .filter(|(entry, req)| entry == req)
            .count();
        axes + layout
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteShapeKey {
    pub inputs: Vec<InputKey>,
}

impl ConcreteShapeKey {
    /// Classifies `inputs` against their declarations.
    ///
    /// Inputs must already have passed arity/rank/dtype validation. With `static_shapes` every
    /// axis is keyed by its exact extent.
    pub fn derive<T: TensorView>(
        fingerprint: Fingerprint,
        decls: &[InputDecl],
        inputs: &[T],
        static_shapes: bool,
    ) -> FusionResult<Self> {
        let mut keys = Vec::with_capacity(inputs.len());
        for (index, (decl, tensor)) in decls.iter().zip(inputs).enumerate() {
            let fail = |detail: String| FusionError::ShapeConcretization {
                fingerprint,
                index,
                detail,
            };
            let mut axes = SmallVec::new();
            for (axis, (declared, &size)) in decl.axes.iter().zip(tensor.sizes()).enumerate() {
                let class = match declared {
                    _ if static_shapes => AxisClass::Exact(size),
                    AxisDecl::Static(_) => AxisClass::Exact(size),
                    AxisDecl::Broadcast if size == 1 => AxisClass::One,
                    AxisDecl::Broadcast => {
                        return Err(fail(format!(
                            "axis {axis} is declared as broadcast but has extent {size}"
                        )));
                    }
                    AxisDecl::Symbolic if size == 1 => AxisClass::One,
                    AxisDecl::Symbolic => AxisClass::Symbolic,
                };
                axes.push(class);
            }
            let observed = tensor.contiguity();
            for (axis, (declared, actual)) in decl.contiguity.iter().zip(&observed).enumerate() {
                if *declared == Some(true) && *actual == Some(false) {
                    return Err(fail(format!(
                        "axis {axis} is declared contiguous but strides {:?} are not",
                        tensor.strides()
                    )));
                }
            }
            keys.push(InputKey {
                dtype: tensor.dtype(),
                axes,
                contiguity: observed.into_iter().collect(),
            });
        }
        Ok(Self { inputs: keys })
    }

    /// Whether an artifact compiled for `self` can execute `request`.
    ///
    /// Per axis the classes must match, or `self` is `Symbolic` and the request is an exact
    /// extent other than 1. A non-contiguous specialization also handles contiguous layouts.
    pub fn serves(&self, request: &ConcreteShapeKey) -> bool {
        self.inputs.len() == request.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&request.inputs)
                .all(|(entry, req)| entry.serves(req))
    }

    /// Number of positions where `self` matches `request` exactly. Higher is more specific.
    pub fn specificity(&self, request: &ConcreteShapeKey) -> usize {
        self.inputs
            .iter()
            .zip(&request.inputs)
            .map(|(entry, req)| entry.exact_positions(req))
            .sum()
    }

    /// Short tag for log lines.
    pub fn tag(&self) -> u64 {
        short_hash(self).unwrap_or_default()
    }
}

/// Picks the specialization serving `request`: highest specificity first, then the most
/// recently inserted. `candidates` must be in insertion order.
pub fn select_specialization<'a, A>(
    candidates: &'a [(ConcreteShapeKey, A)],
    request: &ConcreteShapeKey,
) -> Option<&'a (ConcreteShapeKey, A)> {
    let mut best: Option<(usize, &'a (ConcreteShapeKey, A))> = None;
    for candidate in candidates {
        if !candidate.0.serves(request) {
            continue;
        }
        let score = candidate.0.specificity(request);
        // `>=` lets later insertions win ties.
        if best.map_or(true, |(best_score, _)| score >= best_score) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, candidate)| candidate)
}

/// First input, in declaration order, past which none of `candidates` can serve `request`.
///
/// Names the offending input when a request cannot be served and nothing may be compiled.
pub fn first_unserved_input<'a>(
    candidates: impl IntoIterator<Item = &'a ConcreteShapeKey>,
    request: &ConcreteShapeKey,
) -> usize {
    let mut live: Vec<&ConcreteShapeKey> = candidates
        .into_iter()
        .filter(|candidate| candidate.inputs.len() == request.inputs.len())
        .collect();
    for (index, input) in request.inputs.iter().enumerate() {
        live.retain(|candidate| candidate.inputs[index].serves(input));
        if live.is_empty() {
            return index;
        }
    }
    0
}
