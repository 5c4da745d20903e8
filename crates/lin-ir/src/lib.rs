//! # Lin IR
//!
//! This crate defines the graph representation shared by the linear-algebra
//! lowering engine: the host-level operator descriptors it consumes and the
//! indexed reduction form it produces.
//!
//! ## Overview
//!
//! A [`graph::Graph`] is a list of SSA nodes plus a schedule. Before lowering
//! it contains host operators ([`ops::LinearOp`]: `mm`, `matmul`, `bmm`,
//! `convolution`, `trilinear`, `flip`). After lowering every host operator has
//! been replaced by a sub-graph built from:
//!
//! - **Index arithmetic**: `Dim`, `Arith` over run-time sizes
//! - **Guards**: side-effecting run-time assertions
//! - **Layout ops**: fill, pad, transpose, expand/collapse, insert-slice
//! - **Reductions**: [`reduction::ReductionSpec`] over a zero-initialized
//!   output buffer, either a named kernel or a generic affine-indexed form
//!
//! ## Pipeline Position
//!
//! ```text
//! Host graph (Linear ops)
//!     |
//!     v
//! [lin-lower]  <- rule dispatch, shape resolution, quantization
//!     |
//!     v
//! Lowered graph (Reduce + layout ops + guards)
//!     |
//!     v
//! [lin-eval]   <- reference evaluation
//! ```
//!
//! ## Main Types
//!
//! - [`DType`]: Element types
//! - [`Shape`] / [`Dim`]: Static or dynamic tensor dimensions
//! - [`TensorType`] / [`ValueType`]: Value types
//! - [`graph::Op`]: Node operations
//! - [`ops::LinearOp`]: Host operator descriptors

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod affine;
pub mod graph;
pub mod ops;
pub mod reduction;

use std::fmt;

use lin_index::Idx;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use affine::{AffineExpr, AffineMap};
pub use graph::{ArithOp, ElementwiseOp, Graph, Guard, GuardCond, Node, Op, OpTraits};
pub use ops::{
    Attr, BinaryOperands, ConvGeometry, ConvolutionOp, FlipOp, GeometryError, LinearKind,
    LinearOp, OperandInfo, TrilinearOp,
};
pub use reduction::{
    CastKind, Combine, ConvKernel, ConvLayout, ConvVariant, GenericReduction, Indexing,
    IteratorKind, NamedKernel, ReductionKernel, ReductionSpec,
};

/// A unique identifier for a value (the result of exactly one node).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(u32);

impl Idx for ValueId {
    fn new(idx: usize) -> Self {
        Self(u32::new(idx))
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Tensor element types (data types).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Boolean (1 byte).
    Bool,
    /// 8-bit signed integer.
    Int8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit unsigned integer.
    UInt64,
    /// 16-bit floating point (half precision).
    Float16,
    /// 32-bit floating point (single precision).
    Float32,
    /// 64-bit floating point (double precision).
    Float64,
    /// Brain floating point (bfloat16).
    BFloat16,
    /// Complex number (single precision).
    Complex64,
    /// Complex number (double precision).
    Complex128,
}

impl DType {
    /// Returns the size in bytes of this dtype.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
        }
    }

    /// Returns the width in bits of one element.
    #[must_use]
    pub const fn bit_width(self) -> u32 {
        match self {
            Self::Bool => 1,
            #[allow(clippy::cast_possible_truncation)]
            other => (other.size_bytes() * 8) as u32,
        }
    }

    /// Returns true if this is a floating-point type.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float16 | Self::Float32 | Self::Float64 | Self::BFloat16
        )
    }

    /// Returns true if this is an integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    /// Returns true if this is an unsigned integer type.
    #[must_use]
    pub const fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64
        )
    }

    /// Returns true if elements of this type can feed a reduction kernel.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        self.is_float() || self.is_integer()
    }

    /// Returns true if this is a signed type.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        !self.is_unsigned_integer() && !matches!(self, Self::Bool)
    }

    /// Returns the signed integer type of the same width.
    ///
    /// Non-integer and already-signed types are returned unchanged.
    #[must_use]
    pub const fn to_signed(self) -> Self {
        match self {
            Self::UInt8 => Self::Int8,
            Self::UInt16 => Self::Int16,
            Self::UInt32 => Self::Int32,
            Self::UInt64 => Self::Int64,
            other => other,
        }
    }

    /// Returns the widened type reductions over this type accumulate in.
    ///
    /// Half-precision floats accumulate in `Float32`, 8-bit integers in
    /// `Int32`, wider integers in `Int64`. Bool and complex types have no
    /// accumulator.
    #[must_use]
    pub const fn accumulator(self) -> Option<Self> {
        match self {
            Self::Float16 | Self::BFloat16 | Self::Float32 => Some(Self::Float32),
            Self::Float64 => Some(Self::Float64),
            Self::Int8 | Self::UInt8 => Some(Self::Int32),
            Self::Int16
            | Self::Int32
            | Self::Int64
            | Self::UInt16
            | Self::UInt32
            | Self::UInt64 => Some(Self::Int64),
            Self::Bool | Self::Complex64 | Self::Complex128 => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "i1",
            Self::Int8 => "si8",
            Self::Int16 => "si16",
            Self::Int32 => "si32",
            Self::Int64 => "si64",
            Self::UInt8 => "ui8",
            Self::UInt16 => "ui16",
            Self::UInt32 => "ui32",
            Self::UInt64 => "ui64",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::BFloat16 => "bf16",
            Self::Complex64 => "complex<f32>",
            Self::Complex128 => "complex<f64>",
        };
        f.write_str(name)
    }
}

/// A dimension size (may be static or dynamic).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// A statically known dimension.
    Static(usize),
    /// A dimension only known at run time.
    Dynamic,
}

impl Dim {
    /// Returns the static value if known.
    #[must_use]
    pub const fn static_value(&self) -> Option<usize> {
        match self {
            Self::Static(n) => Some(*n),
            Self::Dynamic => None,
        }
    }

    /// Returns true if this dimension is statically known.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(n) => write!(f, "{n}"),
            Self::Dynamic => f.write_str("?"),
        }
    }
}

/// Tensor shape (list of dimensions).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(SmallVec<[Dim; 4]>);

impl Shape {
    /// Creates a new shape from dimensions.
    #[must_use]
    pub fn new(dims: impl IntoIterator<Item = Dim>) -> Self {
        Self(dims.into_iter().collect())
    }

    /// Creates a shape from static dimensions.
    #[must_use]
    pub fn from_static(dims: impl IntoIterator<Item = usize>) -> Self {
        Self(dims.into_iter().map(Dim::Static).collect())
    }

    /// Creates a scalar shape (rank 0).
    #[must_use]
    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    /// Returns the rank (number of dimensions).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns the dimensions.
    #[must_use]
    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// Returns the dimension at `axis`, if in range.
    #[must_use]
    pub fn dim(&self, axis: usize) -> Option<Dim> {
        self.0.get(axis).copied()
    }

    /// Returns the total number of elements (if statically known).
    #[must_use]
    pub fn num_elements(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, dim| dim.static_value().map(|n| acc * n))
    }

    /// Returns true if this is a scalar (rank 0).
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if all dimensions are statically known.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.0.iter().all(Dim::is_static)
    }

    /// Returns the number of dynamic dimensions.
    #[must_use]
    pub fn dynamic_count(&self) -> usize {
        self.0.iter().filter(|d| !d.is_static()).count()
    }

    /// Returns the static sizes, or `None` if any dimension is dynamic.
    #[must_use]
    pub fn to_static(&self) -> Option<SmallVec<[usize; 4]>> {
        self.0.iter().map(Dim::static_value).collect()
    }

    /// Returns this shape with its axes reordered by `perm`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidPermutation`] when `perm` does not match the
    /// rank.
    pub fn permuted(&self, perm: &Permutation) -> Result<Self, IrError> {
        perm.validate(self.rank())?;
        Ok(Self(perm.as_slice().iter().map(|&p| self.0[p]).collect()))
    }
}

impl FromIterator<Dim> for Shape {
    fn from_iter<I: IntoIterator<Item = Dim>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("x")?;
            }
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}

/// The type of a tensor value: element type plus shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    /// Element type.
    pub dtype: DType,
    /// Tensor shape.
    pub shape: Shape,
}

impl TensorType {
    /// Creates a tensor type.
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Returns the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Returns a copy of this type with another element type.
    #[must_use]
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self::new(dtype, self.shape.clone())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_scalar() {
            write!(f, "tensor<{}>", self.dtype)
        } else {
            write!(f, "tensor<{}x{}>", self.shape, self.dtype)
        }
    }
}

/// The type of any value in the graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// A run-time index (dimension sizes, offsets).
    Index,
    /// A scalar element.
    Scalar(DType),
    /// A tensor.
    Tensor(TensorType),
    /// No value (guards).
    Unit,
}

impl ValueType {
    /// Returns the tensor type, if this is a tensor.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Self::Tensor(ty) => Some(ty),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index => f.write_str("index"),
            Self::Scalar(dtype) => write!(f, "{dtype}"),
            Self::Tensor(ty) => write!(f, "{ty}"),
            Self::Unit => f.write_str("()"),
        }
    }
}

/// A scalar value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point.
    Float(f64),
}

impl ScalarValue {
    /// Returns the additive identity for `dtype`.
    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        if dtype.is_float() {
            Self::Float(0.0)
        } else if dtype == DType::Bool {
            Self::Bool(false)
        } else {
            Self::Int(0)
        }
    }

    /// Returns the value as an `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(n) => n as f64,
            Self::Float(x) => x,
        }
    }
}

/// An axis specification (possibly negative, counting from the end).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Axis(pub i64);

impl Axis {
    /// Creates a new axis.
    #[must_use]
    pub const fn new(axis: i64) -> Self {
        Self(axis)
    }

    /// Normalizes a potentially negative axis to a positive index.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn normalize(self, rank: usize) -> Option<usize> {
        let axis = if self.0 < 0 {
            (rank as i64) + self.0
        } else {
            self.0
        };
        if axis >= 0 && (axis as usize) < rank {
            Some(axis as usize)
        } else {
            None
        }
    }
}

/// A permutation for transpose.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permutation(SmallVec<[usize; 4]>);

impl Permutation {
    /// Creates a new permutation.
    #[must_use]
    pub fn new(perm: impl IntoIterator<Item = usize>) -> Self {
        Self(perm.into_iter().collect())
    }

    /// Returns the permutation as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Returns the number of axes permuted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if this permutes no axes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if this is the identity permutation.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &p)| i == p)
    }

    /// Returns the permutation undoing this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let mut inv: SmallVec<[usize; 4]> = SmallVec::from_elem(0, self.0.len());
        for (i, &p) in self.0.iter().enumerate() {
            if let Some(slot) = inv.get_mut(p) {
                *slot = i;
            }
        }
        Self(inv)
    }

    /// Checks that this is a permutation of `0..rank`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidPermutation`] otherwise.
    pub fn validate(&self, rank: usize) -> Result<(), IrError> {
        let mut seen: SmallVec<[bool; 4]> = SmallVec::from_elem(false, rank);
        let ok = self.0.len() == rank
            && self.0.iter().all(|&p| match seen.get_mut(p) {
                Some(s) if !*s => {
                    *s = true;
                    true
                }
                _ => false,
            });
        if ok {
            Ok(())
        } else {
            Err(IrError::InvalidPermutation {
                perm: self.0.to_vec(),
                rank,
            })
        }
    }
}

/// Grouping of contiguous axes used by expand/collapse reshapes.
///
/// Group `i` lists the axes of the expanded shape that fold into axis `i`
/// of the collapsed shape. An empty list of groups collapses a tensor whose
/// dimensions are all one into a rank-0 tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reassociation(Vec<SmallVec<[usize; 4]>>);

impl Reassociation {
    /// Creates a reassociation from explicit groups.
    #[must_use]
    pub fn new(groups: impl IntoIterator<Item = SmallVec<[usize; 4]>>) -> Self {
        Self(groups.into_iter().collect())
    }

    /// Groups axes `start..end` of a rank-`rank` tensor into one axis and
    /// keeps every other axis alone.
    #[must_use]
    pub fn fold_range(rank: usize, start: usize, end: usize) -> Self {
        let mut groups = Vec::with_capacity(rank);
        let mut axis = 0;
        while axis < rank {
            if axis == start && end > start {
                groups.push((start..end).collect());
                axis = end;
            } else {
                groups.push(SmallVec::from_slice(&[axis]));
                axis += 1;
            }
        }
        Self(groups)
    }

    /// Returns the groups.
    #[must_use]
    pub fn groups(&self) -> &[SmallVec<[usize; 4]>] {
        &self.0
    }

    /// Returns the rank of the collapsed side.
    #[must_use]
    pub fn collapsed_rank(&self) -> usize {
        self.0.len()
    }

    /// Returns the rank of the expanded side.
    #[must_use]
    pub fn expanded_rank(&self) -> usize {
        self.0.iter().map(SmallVec::len).sum()
    }

    /// Checks that the groups cover `0..expanded_rank` contiguously and in
    /// order. The empty reassociation (rank-0 collapse) is always accepted;
    /// unit sizes are checked when the data is reshaped.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidReassociation`] otherwise.
    pub fn validate(&self, expanded_rank: usize) -> Result<(), IrError> {
        if self.0.is_empty() {
            return Ok(());
        }
        let flat: Vec<usize> = self.0.iter().flatten().copied().collect();
        let contiguous = flat.iter().enumerate().all(|(i, &a)| i == a);
        let non_empty = self.0.iter().all(|g| !g.is_empty());
        if flat.len() == expanded_rank && contiguous && non_empty {
            Ok(())
        } else {
            Err(IrError::InvalidReassociation {
                groups: self.0.iter().map(|g| g.to_vec()).collect(),
                rank: expanded_rank,
            })
        }
    }

    /// Computes the collapsed shape of `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidReassociation`] when the groups do not fit
    /// `shape`.
    pub fn collapse(&self, shape: &Shape) -> Result<Shape, IrError> {
        self.validate(shape.rank())?;
        Ok(self
            .0
            .iter()
            .map(|group| {
                group
                    .iter()
                    .try_fold(1usize, |acc, &axis| {
                        shape.dims()[axis].static_value().map(|n| acc * n)
                    })
                    .map_or(Dim::Dynamic, Dim::Static)
            })
            .collect())
    }
}

/// Errors in IR construction and queries.
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum IrError {
    /// A value id does not name a node.
    #[error("unknown value {id}")]
    UnknownValue {
        /// The missing id.
        id: ValueId,
    },

    /// A value was expected to be a tensor.
    #[error("value {id} is not a tensor (type {ty})")]
    NotATensor {
        /// The value.
        id: ValueId,
        /// Its actual type.
        ty: ValueType,
    },

    /// Invalid axis for operation.
    #[error("invalid axis {axis} for tensor of rank {rank}")]
    InvalidAxis {
        /// The axis specified.
        axis: i64,
        /// The tensor rank.
        rank: usize,
    },

    /// Invalid permutation.
    #[error("invalid permutation {perm:?} for rank {rank}")]
    InvalidPermutation {
        /// The permutation.
        perm: Vec<usize>,
        /// The tensor rank.
        rank: usize,
    },

    /// Invalid reassociation.
    #[error("invalid reassociation {groups:?} for rank {rank}")]
    InvalidReassociation {
        /// The groups.
        groups: Vec<Vec<usize>>,
        /// The expanded rank.
        rank: usize,
    },

    /// Shape mismatch in operation.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Shape,
        /// Actual shape.
        got: Shape,
    },

    /// Type mismatch.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype.
        expected: DType,
        /// Actual dtype.
        got: DType,
    },

    /// A kernel operand does not have the rank its indexing map expects.
    #[error("{kernel}: operand {operand} has rank {got}, indexing map expects {expected}")]
    OperandRank {
        /// Kernel name.
        kernel: String,
        /// Operand position.
        operand: usize,
        /// Rank the map addresses.
        expected: usize,
        /// Actual rank.
        got: usize,
    },

    /// A node uses a value that is not scheduled before it.
    #[error("{user} uses {operand} before it is defined")]
    UseBeforeDef {
        /// The using node.
        user: ValueId,
        /// The operand.
        operand: ValueId,
    },
}
