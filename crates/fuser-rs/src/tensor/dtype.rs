//! Enumerates the scalar element types a trace can declare and a backend must honour.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between trace declarations and backend tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    /// Predicate values stored as 0/1.
    Bool,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer, the default for integral scalars.
    Int64,
    /// IEEE-754 binary16.
    Half,
    /// bfloat16 as used by most accelerators.
    BFloat16,
    /// IEEE-754 binary32.
    Float,
    /// IEEE-754 binary64, the default for floating scalars.
    Double,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            DType::Half | DType::BFloat16 | DType::Float | DType::Double
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::Int32 | DType::Int64)
    }

    /// Type promotion for binary arithmetic: floats beat integers, wider beats narrower.
    ///
    /// `Half` and `BFloat16` promote to `Float` when mixed with each other.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        match (self, other) {
            (DType::Half, DType::BFloat16) | (DType::BFloat16, DType::Half) => DType::Float,
            _ => {
                if self.rank_order() >= other.rank_order() {
                    self
                } else {
                    other
                }
            }
        }
    }

    fn rank_order(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::Int32 => 1,
            DType::Int64 => 2,
            DType::Half => 3,
            DType::BFloat16 => 3,
            DType::Float => 4,
            DType::Double => 5,
        }
    }
}
