//! Host operator descriptors.
//!
//! These are the operations the lowering engine consumes. Attributes that the
//! host could only express as run-time values are kept as
//! [`Attr::Dynamic`]; the engine declines to lower those.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::graph::{Graph, Op};
use crate::{IrError, TensorType, ValueId};

/// An operator attribute: a compile-time constant or a run-time value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attr<T> {
    /// Known while lowering.
    Const(T),
    /// Only known when the program runs.
    Dynamic(ValueId),
}

impl<T> Attr<T> {
    /// Returns the constant, if this attribute is one.
    #[must_use]
    pub fn as_const(&self) -> Option<&T> {
        match self {
            Self::Const(v) => Some(v),
            Self::Dynamic(_) => None,
        }
    }

    fn value(&self) -> Option<ValueId> {
        match self {
            Self::Const(_) => None,
            Self::Dynamic(v) => Some(*v),
        }
    }
}

/// The kind of a host operator, used as the dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinearKind {
    /// Strict rank-2 matrix multiply.
    Mm,
    /// Rank-polymorphic matrix multiply.
    Matmul,
    /// Strict rank-3 batched matrix multiply.
    Bmm,
    /// N-d convolution.
    Convolution,
    /// Fused three-operand contraction.
    Trilinear,
    /// Axis reversal.
    Flip,
}

impl fmt::Display for LinearKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mm => "mm",
            Self::Matmul => "matmul",
            Self::Bmm => "bmm",
            Self::Convolution => "convolution",
            Self::Trilinear => "trilinear",
            Self::Flip => "flip",
        };
        f.write_str(name)
    }
}

/// Operands of a two-input multiply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryOperands {
    /// Left operand.
    pub lhs: ValueId,
    /// Right operand.
    pub rhs: ValueId,
}

/// A convolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionOp {
    /// Input `[N, C, spatial...]`.
    pub input: ValueId,
    /// Weight `[F, C/groups, kernel...]` (transposed: `[C, F/groups, kernel...]`).
    pub weight: ValueId,
    /// Optional rank-1 bias over output channels.
    pub bias: Option<ValueId>,
    /// Stride per spatial axis.
    pub stride: Attr<Vec<i64>>,
    /// Symmetric padding per spatial axis.
    pub padding: Attr<Vec<i64>>,
    /// Dilation per spatial axis.
    pub dilation: Attr<Vec<i64>>,
    /// Extra output size per spatial axis (transposed only).
    pub output_padding: Attr<Vec<i64>>,
    /// Whether this is a transposed convolution.
    pub transposed: Attr<bool>,
    /// Number of channel groups.
    pub groups: Attr<i64>,
}

/// A fused product of three tensors with optional sum and unrolled axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrilinearOp {
    /// Operands.
    pub inputs: [ValueId; 3],
    /// Axes to insert into each operand before combining.
    pub expand: [Attr<Vec<i64>>; 3],
    /// Axes summed away.
    pub sum_dim: Attr<Vec<i64>>,
    /// The axis iterated at compile time.
    pub unroll_dim: Attr<i64>,
}

/// Reversal along a set of axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlipOp {
    /// Input tensor.
    pub input: ValueId,
    /// Axes to reverse (may be negative).
    pub dims: Attr<Vec<i64>>,
}

/// A host-level linear-algebra operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LinearOp {
    /// `mm`.
    Mm(BinaryOperands),
    /// `matmul`.
    Matmul(BinaryOperands),
    /// `bmm`.
    Bmm(BinaryOperands),
    /// `convolution`.
    Convolution(ConvolutionOp),
    /// `trilinear`.
    Trilinear(TrilinearOp),
    /// `flip`.
    Flip(FlipOp),
}

impl LinearOp {
    /// Returns the dispatch key.
    #[must_use]
    pub fn kind(&self) -> LinearKind {
        match self {
            Self::Mm(_) => LinearKind::Mm,
            Self::Matmul(_) => LinearKind::Matmul,
            Self::Bmm(_) => LinearKind::Bmm,
            Self::Convolution(_) => LinearKind::Convolution,
            Self::Trilinear(_) => LinearKind::Trilinear,
            Self::Flip(_) => LinearKind::Flip,
        }
    }

    /// Returns every value this operator reads.
    #[must_use]
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        match self {
            Self::Mm(ops) | Self::Matmul(ops) | Self::Bmm(ops) => {
                SmallVec::from_slice(&[ops.lhs, ops.rhs])
            }
            Self::Convolution(conv) => [Some(conv.input), Some(conv.weight), conv.bias]
                .into_iter()
                .chain([
                    conv.stride.value(),
                    conv.padding.value(),
                    conv.dilation.value(),
                    conv.output_padding.value(),
                    conv.transposed.value(),
                    conv.groups.value(),
                ])
                .flatten()
                .collect(),
            Self::Trilinear(tri) => tri
                .inputs
                .iter()
                .copied()
                .chain(tri.expand.iter().filter_map(Attr::value))
                .chain(tri.sum_dim.value())
                .chain(tri.unroll_dim.value())
                .collect(),
            Self::Flip(flip) => std::iter::once(flip.input).chain(flip.dims.value()).collect(),
        }
    }

    /// Rewrites every value this operator reads.
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        fn attr<T>(a: &mut Attr<T>, f: &mut impl FnMut(ValueId) -> ValueId) {
            if let Attr::Dynamic(v) = a {
                *v = f(*v);
            }
        }
        match self {
            Self::Mm(ops) | Self::Matmul(ops) | Self::Bmm(ops) => {
                ops.lhs = f(ops.lhs);
                ops.rhs = f(ops.rhs);
            }
            Self::Convolution(conv) => {
                conv.input = f(conv.input);
                conv.weight = f(conv.weight);
                conv.bias = conv.bias.map(&mut f);
                attr(&mut conv.stride, &mut f);
                attr(&mut conv.padding, &mut f);
                attr(&mut conv.dilation, &mut f);
                attr(&mut conv.output_padding, &mut f);
                attr(&mut conv.transposed, &mut f);
                attr(&mut conv.groups, &mut f);
            }
            Self::Trilinear(tri) => {
                for input in &mut tri.inputs {
                    *input = f(*input);
                }
                for expand in &mut tri.expand {
                    attr(expand, &mut f);
                }
                attr(&mut tri.sum_dim, &mut f);
                attr(&mut tri.unroll_dim, &mut f);
            }
            Self::Flip(flip) => {
                flip.input = f(flip.input);
                attr(&mut flip.dims, &mut f);
            }
        }
    }
}

/// Typed view of one operator operand.
///
/// A quantized operand is defined by a `MakeQuantized` node; the view looks
/// through it to the integer storage and its zero-point.
#[derive(Clone, Debug, PartialEq)]
pub struct OperandInfo {
    /// The stored tensor.
    pub value: ValueId,
    /// Type of the stored tensor.
    pub ty: TensorType,
    /// Zero-point scalar, if the operand is quantized.
    pub zero_point: Option<ValueId>,
}

impl OperandInfo {
    /// Extracts the operand view of `value`.
    ///
    /// # Errors
    ///
    /// Returns an [`IrError`] when `value` is unknown or not a tensor.
    pub fn extract(graph: &Graph, value: ValueId) -> Result<Self, IrError> {
        if let Op::MakeQuantized {
            storage,
            zero_point,
            ..
        } = graph.node(value)?.op
        {
            return Ok(Self {
                value: storage,
                ty: graph.tensor_type(storage)?.clone(),
                zero_point: Some(zero_point),
            });
        }
        Ok(Self {
            value,
            ty: graph.tensor_type(value)?.clone(),
            zero_point: None,
        })
    }

    /// Returns true if the operand carries a zero-point.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.zero_point.is_some()
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.ty.rank()
    }
}

/// Why convolution attributes cannot be turned into geometry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    /// An attribute is a run-time value.
    #[error("{attr} must be a compile-time constant")]
    NonConstant {
        /// Attribute name.
        attr: &'static str,
    },

    /// An attribute list does not have one entry per spatial axis.
    #[error("{attr} has {got} entries, expected {expected}")]
    WrongLength {
        /// Attribute name.
        attr: &'static str,
        /// Spatial rank.
        expected: usize,
        /// Entries given.
        got: usize,
    },

    /// An attribute entry is out of range.
    #[error("{attr} value {value} out of range")]
    OutOfRange {
        /// Attribute name.
        attr: &'static str,
        /// The offending value.
        value: i64,
    },
}

/// Convolution geometry with every attribute resolved to a constant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    /// Symmetric padding per spatial axis.
    pub padding: SmallVec<[i64; 3]>,
    /// Stride per spatial axis.
    pub stride: SmallVec<[i64; 3]>,
    /// Dilation per spatial axis.
    pub dilation: SmallVec<[i64; 3]>,
    /// Output padding per spatial axis.
    pub output_padding: SmallVec<[i64; 3]>,
    /// Number of channel groups (at least one).
    pub groups: i64,
    /// Whether the convolution is transposed.
    pub transposed: bool,
}

impl ConvGeometry {
    /// Resolves the attributes of `op` for `spatial_rank` spatial axes.
    ///
    /// # Errors
    ///
    /// Returns a [`GeometryError`] for run-time attributes, wrong list lengths,
    /// non-positive strides, dilations or groups, and negative paddings.
    pub fn from_op(op: &ConvolutionOp, spatial_rank: usize) -> Result<Self, GeometryError> {
        let transposed = *op
            .transposed
            .as_const()
            .ok_or(GeometryError::NonConstant { attr: "transposed" })?;
        let list = |attr: &'static str,
                    a: &Attr<Vec<i64>>,
                    min: i64|
         -> Result<SmallVec<[i64; 3]>, GeometryError> {
            let values = a.as_const().ok_or(GeometryError::NonConstant { attr })?;
            if values.len() != spatial_rank {
                return Err(GeometryError::WrongLength {
                    attr,
                    expected: spatial_rank,
                    got: values.len(),
                });
            }
            if let Some(&value) = values.iter().find(|&&v| v < min) {
                return Err(GeometryError::OutOfRange { attr, value });
            }
            Ok(values.iter().copied().collect())
        };
        let stride = list("stride", &op.stride, 1)?;
        let dilation = list("dilation", &op.dilation, 1)?;
        let padding = list("padding", &op.padding, 0)?;
        let output_padding = list("output_padding", &op.output_padding, 0)?;
        let groups = *op
            .groups
            .as_const()
            .ok_or(GeometryError::NonConstant { attr: "groups" })?;
        if groups < 1 {
            return Err(GeometryError::OutOfRange {
                attr: "groups",
                value: groups,
            });
        }
        Ok(Self {
            padding,
            stride,
            dilation,
            output_padding,
            groups,
            transposed,
        })
    }

    /// Returns the number of spatial axes.
    #[must_use]
    pub fn spatial_rank(&self) -> usize {
        self.stride.len()
    }

    /// Output size of spatial `axis` for the given input and kernel sizes.
    #[must_use]
    pub fn output_size(&self, axis: usize, input: i64, kernel: i64) -> Option<i64> {
        if self.transposed {
            conv_transpose_output_size(
                input,
                kernel,
                self.padding[axis],
                self.stride[axis],
                self.dilation[axis],
                self.output_padding[axis],
            )
        } else {
            conv_output_size(
                input,
                kernel,
                self.padding[axis],
                self.stride[axis],
                self.dilation[axis],
            )
        }
    }

    /// Offset at which a transposed convolution places the input inside its
    /// enlarged buffer: `(kernel - 1) * dilation - padding`.
    #[must_use]
    pub fn transposed_offset(&self, axis: usize, kernel: i64) -> i64 {
        (kernel - 1) * self.dilation[axis] - self.padding[axis]
    }

    /// Size of the enlarged buffer a transposed convolution runs over.
    #[must_use]
    pub fn transposed_buffer_size(&self, axis: usize, input: i64, kernel: i64) -> i64 {
        let inner = (input - 1) * self.stride[axis] + 1;
        2 * self.transposed_offset(axis, kernel) + inner + self.output_padding[axis]
    }
}

/// `floor((input + 2*padding - dilation*(kernel-1) - 1) / stride) + 1`.
///
/// Returns `None` when the window does not fit (non-positive result) or the
/// stride is not positive.
#[must_use]
pub fn conv_output_size(
    input: i64,
    kernel: i64,
    padding: i64,
    stride: i64,
    dilation: i64,
) -> Option<i64> {
    if stride < 1 {
        return None;
    }
    let span = input + 2 * padding - dilation * (kernel - 1) - 1;
    let out = span.div_euclid(stride) + 1;
    (out > 0).then_some(out)
}

/// `(input-1)*stride - 2*padding + dilation*(kernel-1) + output_padding + 1`.
///
/// Returns `None` for a non-positive result.
#[must_use]
pub fn conv_transpose_output_size(
    input: i64,
    kernel: i64,
    padding: i64,
    stride: i64,
    dilation: i64,
    output_padding: i64,
) -> Option<i64> {
    let out = (input - 1) * stride - 2 * padding + dilation * (kernel - 1) + output_padding + 1;
    (out > 0).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conv_op(stride: Vec<i64>, padding: Vec<i64>, groups: i64) -> ConvolutionOp {
        let n = stride.len();
        ConvolutionOp {
            input: lin_index::Idx::new(0),
            weight: lin_index::Idx::new(1),
            bias: None,
            stride: Attr::Const(stride),
            padding: Attr::Const(padding),
            dilation: Attr::Const(vec![1; n]),
            output_padding: Attr::Const(vec![0; n]),
            transposed: Attr::Const(false),
            groups: Attr::Const(groups),
        }
    }

    // === Output Size Tests ===

    #[test]
    fn test_standard_output_size() {
        assert_eq!(conv_output_size(5, 3, 1, 2, 1), Some(3));
        assert_eq!(conv_output_size(7, 3, 0, 1, 2), Some(3));
        assert_eq!(conv_output_size(2, 5, 0, 1, 1), None);
    }

    #[test]
    fn test_transposed_output_size() {
        assert_eq!(conv_transpose_output_size(3, 3, 0, 2, 1, 1), Some(8));
        assert_eq!(conv_transpose_output_size(4, 3, 1, 1, 1, 0), Some(4));
    }

    #[test]
    fn test_transposed_buffer() {
        let mut op = conv_op(vec![2], vec![0], 1);
        op.output_padding = Attr::Const(vec![1]);
        op.transposed = Attr::Const(true);
        let geometry = ConvGeometry::from_op(&op, 1).unwrap();
        assert_eq!(geometry.transposed_offset(0, 3), 2);
        // (3-1)*2+1 = 5 inner, plus 2*2 offset, plus 1 output padding
        assert_eq!(geometry.transposed_buffer_size(0, 3, 3), 10);
        // a stride-1 window of 3 over 10 elements yields the transposed size
        assert_eq!(conv_output_size(10, 3, 0, 1, 1), geometry.output_size(0, 3, 3));
    }

    // === Attribute Validation Tests ===

    #[test]
    fn test_geometry_rejects_dynamic_attr() {
        let mut op = conv_op(vec![1, 1], vec![0, 0], 1);
        op.groups = Attr::Dynamic(lin_index::Idx::new(9));
        assert_eq!(
            ConvGeometry::from_op(&op, 2),
            Err(GeometryError::NonConstant { attr: "groups" })
        );
    }

    #[test]
    fn test_geometry_rejects_wrong_length() {
        let op = conv_op(vec![1], vec![0, 0], 1);
        assert!(matches!(
            ConvGeometry::from_op(&op, 2),
            Err(GeometryError::WrongLength { attr: "stride", .. })
        ));
    }

    #[test]
    fn test_geometry_rejects_bad_values() {
        let op = conv_op(vec![0], vec![0], 1);
        assert!(matches!(
            ConvGeometry::from_op(&op, 1),
            Err(GeometryError::OutOfRange { attr: "stride", value: 0 })
        ));
        let op = conv_op(vec![1], vec![0], 0);
        assert!(matches!(
            ConvGeometry::from_op(&op, 1),
            Err(GeometryError::OutOfRange { attr: "groups", .. })
        ));
    }

    #[test]
    fn test_operand_collection() {
        let mut op = LinearOp::Convolution(conv_op(vec![1], vec![0], 1));
        assert_eq!(op.operands().len(), 2);
        op.map_operands(|v| lin_index::Idx::new(lin_index::Idx::index(v) + 10));
        assert_eq!(op.operands()[1], lin_index::Idx::new(11));
        assert_eq!(op.kind().to_string(), "convolution");
    }

    proptest! {
        #[test]
        fn prop_output_size_counts_windows(
            input in 1i64..64,
            kernel in 1i64..6,
            padding in 0i64..4,
            stride in 1i64..4,
            dilation in 1i64..3,
        ) {
            // Count window start positions that fit inside the padded input.
            let padded = input + 2 * padding;
            let extent = dilation * (kernel - 1) + 1;
            let count = (0..padded).step_by(usize::try_from(stride).unwrap())
                .filter(|start| start + extent <= padded)
                .count();
            let expected = i64::try_from(count).unwrap();
            let got = conv_output_size(input, kernel, padding, stride, dilation).unwrap_or(0);
            prop_assert_eq!(got, expected);
        }
    }
}
