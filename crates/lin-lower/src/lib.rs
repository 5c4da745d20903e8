//! # Linear-Algebra Lowering
//!
//! This crate rewrites host linear-algebra operators into explicit reduction
//! kernels over zero-initialized (or bias-initialized) output buffers.
//!
//! ## Overview
//!
//! Each operator kind has one [`dispatch::LoweringRule`]:
//!
//! | Operator | Rule | Result |
//! |----------|------|--------|
//! | `mm` | [`matmul::MmRule`] | `matmul` |
//! | `matmul` | [`matmul::MatmulRule`] | `dot` / `vecmat` / `matvec` / `matmul` / `batch_matmul` / generic |
//! | `bmm` | [`matmul::BmmRule`] | `batch_matmul` |
//! | `convolution` | [`conv::ConvolutionRule`] | `conv_*` / `depthwise_conv_*` / grouped |
//! | `trilinear` | [`trilinear::TrilinearRule`] | unrolled element-wise products |
//! | `flip` | [`flip::FlipRule`] | `flip` |
//!
//! ## Pipeline
//!
//! ```text
//! Rule dispatch
//!     |  extract operands (zero-points)
//!     v
//! Quantization normalizer    <- unsigned storage shifted to signed
//!     |
//!     v
//! Shape & broadcast resolver <- static checks or run-time guards
//!     |
//!     v
//! Kind-specific lowering     <- reduction kernel
//!     |
//!     v
//! Convert + Cast             <- declared element type and shape
//! ```
//!
//! A rule either succeeds, declines (`NoMatch`, the op is left for the host),
//! or fails with a fatal error. Either way a failed attempt leaves the graph
//! untouched.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod conv;
pub mod dispatch;
pub mod flip;
pub mod matmul;
pub mod quant;
pub mod shape;
pub mod trilinear;

use lin_ir::{DType, IrError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use builder::{Builder, DimValue};
pub use dispatch::{
    apply_conversion, lower_graph, populate_linear_patterns, ConversionReport, ConversionTarget,
    Declined, Lowered, Lowering, LoweringRule, RuleSet,
};
pub use matmul::MatmulForm;

/// Errors that can occur during lowering.
#[derive(Clone, Debug, Error)]
pub enum LowerError {
    /// The rule does not apply to this operator instance. Recoverable: the
    /// operator is left for the host.
    #[error("no match: {reason}")]
    NoMatch {
        /// Why the rule declined.
        reason: String,
    },

    /// Two sizes that must agree are statically known to differ.
    #[error("static shape mismatch in {what}: {lhs} vs {rhs}")]
    StaticShapeMismatch {
        /// The relation checked.
        what: String,
        /// Left size.
        lhs: i64,
        /// Right size.
        rhs: i64,
    },

    /// An element type is neither a float nor an integer.
    #[error("invalid element type {dtype}: expected a float or integer type")]
    InvalidElementType {
        /// The offending type.
        dtype: DType,
    },

    /// The graph is malformed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

impl LowerError {
    /// Creates a no-match error.
    pub fn no_match(reason: impl Into<String>) -> Self {
        Self::NoMatch {
            reason: reason.into(),
        }
    }

    /// Returns true if the error only means the rule does not apply.
    #[must_use]
    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch { .. })
    }
}

/// Configuration for lowering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowerConfig {
    /// Assume dynamic sizes that must agree do agree; `mm` then emits no
    /// contracting-dimension guard.
    pub assume_strict_symbolic_shapes: bool,
    /// Lower channel-per-group convolutions with depthwise kernels instead of
    /// the general grouped kernel.
    pub prefer_depthwise_kernels: bool,
    /// Largest unroll-axis size the trilinear rule expands.
    pub max_unroll: usize,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            assume_strict_symbolic_shapes: false,
            prefer_depthwise_kernels: true,
            max_unroll: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LowerConfig::default();
        assert!(!config.assume_strict_symbolic_shapes);
        assert!(config.prefer_depthwise_kernels);
        assert_eq!(config.max_unroll, 4096);
    }

    #[test]
    fn test_config_partial_json() {
        let config: LowerConfig =
            serde_json::from_str(r#"{ "assume_strict_symbolic_shapes": true }"#).unwrap();
        assert!(config.assume_strict_symbolic_shapes);
        assert!(config.prefer_depthwise_kernels);
        assert_eq!(config.max_unroll, 4096);
    }

    #[test]
    fn test_error_classification() {
        assert!(LowerError::no_match("rank 0").is_no_match());
        let fatal = LowerError::InvalidElementType {
            dtype: DType::Complex64,
        };
        assert!(!fatal.is_no_match());
        assert_eq!(
            fatal.to_string(),
            "invalid element type complex<f32>: expected a float or integer type"
        );
    }
}
