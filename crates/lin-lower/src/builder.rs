//! Transactional node construction.
//!
//! A [`Builder`] creates nodes detached from the schedule and remembers them.
//! A rule threads one builder through every construction step; when the rule
//! succeeds the nodes are spliced into the schedule in creation order, and
//! when it declines they are dropped again.
//!
//! Every tensor-producing method computes the result type itself, so the
//! static part of each shape is tracked through the whole lowering. Index
//! arithmetic on [`DimValue`]s constant-folds when both sides are known.

use lin_ir::{
    ArithOp, DType, Dim, ElementwiseOp, Graph, Guard, GuardCond, IrError, Op, Permutation,
    Reassociation, ReductionSpec, ScalarValue, Shape, TensorType, ValueId, ValueType,
};
use tracing::trace;

use crate::LowerError;

/// A size value: the index node holding it plus its value when statically
/// known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimValue {
    /// The index value.
    pub value: ValueId,
    /// The size, if known while lowering.
    pub known: Option<i64>,
}

impl DimValue {
    /// Returns the shape dimension this size denotes.
    #[must_use]
    pub fn dim(self) -> Dim {
        match self.known.and_then(|n| usize::try_from(n).ok()) {
            Some(n) => Dim::Static(n),
            None => Dim::Dynamic,
        }
    }

    /// Returns true if the size is statically one.
    #[must_use]
    pub fn is_one(self) -> bool {
        self.known == Some(1)
    }
}

fn shape_of(sizes: &[DimValue]) -> Shape {
    sizes.iter().map(|d| d.dim()).collect()
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Static broadcast of two shapes (right-aligned). Unknown pairs stay
/// dynamic.
fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Shape {
    let rank = lhs.rank().max(rhs.rank());
    let at = |shape: &Shape, i: usize| {
        (i + shape.rank())
            .checked_sub(rank)
            .map_or(Dim::Static(1), |j| shape.dims()[j])
    };
    (0..rank)
        .map(|i| match (at(lhs, i), at(rhs, i)) {
            (Dim::Static(1), d) | (d, Dim::Static(1)) => d,
            (Dim::Static(a), Dim::Static(b)) if a == b => Dim::Static(a),
            (Dim::Static(a), Dim::Dynamic) | (Dim::Dynamic, Dim::Static(a)) => Dim::Static(a),
            _ => Dim::Dynamic,
        })
        .collect()
}

/// Builds nodes for one rewrite attempt.
pub struct Builder<'g> {
    graph: &'g mut Graph,
    start: usize,
    created: Vec<ValueId>,
}

impl<'g> Builder<'g> {
    /// Starts a rewrite attempt on `graph`.
    pub fn new(graph: &'g mut Graph) -> Self {
        let start = graph.len();
        Self {
            graph,
            start,
            created: Vec::new(),
        }
    }

    /// Returns the graph being built.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Returns the nodes created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> &[ValueId] {
        &self.created
    }

    /// Schedules the created nodes before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::UnknownValue`] if `anchor` is not scheduled.
    pub fn commit_before(self, anchor: ValueId) -> Result<Vec<ValueId>, IrError> {
        self.graph.insert_before(anchor, &self.created)?;
        Ok(self.created)
    }

    /// Schedules the created nodes at the end of the graph.
    pub fn commit(self) -> Vec<ValueId> {
        self.graph.append(&self.created);
        self.created
    }

    /// Drops every node created by this builder.
    pub fn rollback(self) {
        trace!(dropped = self.created.len(), "rollback");
        self.graph.truncate(self.start);
    }

    fn emit(&mut self, op: Op, ty: ValueType) -> ValueId {
        let name = op.name();
        let id = self.graph.create(op, ty);
        trace!(value = %id, op = name, "emit");
        self.created.push(id);
        id
    }

    fn emit_tensor(&mut self, op: Op, dtype: DType, shape: Shape) -> ValueId {
        self.emit(op, ValueType::Tensor(TensorType::new(dtype, shape)))
    }

    /// Returns the tensor type of `value`.
    ///
    /// # Errors
    ///
    /// Returns an IR error if `value` is not a tensor.
    pub fn tensor_type(&self, value: ValueId) -> Result<TensorType, LowerError> {
        Ok(self.graph.tensor_type(value)?.clone())
    }

    // === Index Arithmetic ===

    /// A constant index.
    pub fn index(&mut self, n: i64) -> DimValue {
        let value = self.emit(Op::Constant(ScalarValue::Int(n)), ValueType::Index);
        DimValue {
            value,
            known: Some(n),
        }
    }

    /// The size of `axis` of `tensor`: a constant when static, a `Dim` node
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] if `axis` is out of range.
    pub fn dim(&mut self, tensor: ValueId, axis: usize) -> Result<DimValue, LowerError> {
        let ty = self.tensor_type(tensor)?;
        match ty.shape.dim(axis) {
            Some(Dim::Static(n)) => Ok(self.index(to_i64(n))),
            Some(Dim::Dynamic) => {
                let value = self.emit(
                    Op::Dim {
                        source: tensor,
                        axis,
                    },
                    ValueType::Index,
                );
                Ok(DimValue { value, known: None })
            }
            None => Err(IrError::InvalidAxis {
                axis: to_i64(axis),
                rank: ty.rank(),
            }
            .into()),
        }
    }

    /// The sizes of every axis of `tensor`.
    ///
    /// # Errors
    ///
    /// Returns an IR error if `tensor` is not a tensor.
    pub fn dims(&mut self, tensor: ValueId) -> Result<Vec<DimValue>, LowerError> {
        let rank = self.tensor_type(tensor)?.rank();
        (0..rank).map(|axis| self.dim(tensor, axis)).collect()
    }

    /// Index arithmetic, folded when both sides are known.
    pub fn arith(&mut self, op: ArithOp, lhs: DimValue, rhs: DimValue) -> DimValue {
        if let (Some(a), Some(b)) = (lhs.known, rhs.known) {
            if let Some(n) = op.apply(a, b) {
                return self.index(n);
            }
        }
        match (op, lhs.known, rhs.known) {
            (ArithOp::Add, Some(0), _) | (ArithOp::Mul, Some(1), _) => return rhs,
            (ArithOp::Add | ArithOp::Sub, _, Some(0))
            | (ArithOp::Mul | ArithOp::FloorDiv, _, Some(1)) => return lhs,
            _ => {}
        }
        let value = self.emit(
            Op::Arith {
                op,
                lhs: lhs.value,
                rhs: rhs.value,
            },
            ValueType::Index,
        );
        DimValue { value, known: None }
    }

    /// `lhs + rhs`.
    pub fn add(&mut self, lhs: DimValue, rhs: DimValue) -> DimValue {
        self.arith(ArithOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`.
    pub fn sub(&mut self, lhs: DimValue, rhs: DimValue) -> DimValue {
        self.arith(ArithOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`.
    pub fn mul(&mut self, lhs: DimValue, rhs: DimValue) -> DimValue {
        self.arith(ArithOp::Mul, lhs, rhs)
    }

    /// `floor(lhs / rhs)`.
    pub fn floor_div(&mut self, lhs: DimValue, rhs: DimValue) -> DimValue {
        self.arith(ArithOp::FloorDiv, lhs, rhs)
    }

    /// `max(lhs, rhs)`.
    pub fn max(&mut self, lhs: DimValue, rhs: DimValue) -> DimValue {
        self.arith(ArithOp::Max, lhs, rhs)
    }

    /// `lhs + n`.
    pub fn add_const(&mut self, lhs: DimValue, n: i64) -> DimValue {
        let rhs = self.index(n);
        self.add(lhs, rhs)
    }

    /// `lhs * n`.
    pub fn mul_const(&mut self, lhs: DimValue, n: i64) -> DimValue {
        let rhs = self.index(n);
        self.mul(lhs, rhs)
    }

    // === Scalars and Guards ===

    /// A scalar constant of type `dtype`.
    pub fn scalar(&mut self, value: ScalarValue, dtype: DType) -> ValueId {
        self.emit(Op::Constant(value), ValueType::Scalar(dtype))
    }

    /// Truncating scalar conversion.
    pub fn scalar_cast(&mut self, value: ValueId, dtype: DType) -> ValueId {
        self.emit(Op::ScalarCast { value }, ValueType::Scalar(dtype))
    }

    /// Integer scalar `value + n` of type `dtype`.
    pub fn scalar_add_const(&mut self, value: ValueId, n: i64, dtype: DType) -> ValueId {
        let rhs = self.scalar(ScalarValue::Int(n), dtype);
        self.emit(
            Op::Arith {
                op: ArithOp::Add,
                lhs: value,
                rhs,
            },
            ValueType::Scalar(dtype),
        )
    }

    /// A run-time assertion.
    pub fn guard(&mut self, cond: GuardCond, message: impl Into<String>) -> ValueId {
        let message = message.into();
        trace!(%message, "guard");
        self.emit(Op::Guard(Guard { cond, message }), ValueType::Unit)
    }

    // === Tensor Construction ===

    /// A tensor of `sizes` filled with the scalar `value`.
    pub fn fill(&mut self, sizes: &[DimValue], value: ValueId, dtype: DType) -> ValueId {
        self.emit_tensor(
            Op::Fill {
                sizes: sizes.iter().map(|d| d.value).collect(),
                value,
            },
            dtype,
            shape_of(sizes),
        )
    }

    /// A zero-filled tensor of `sizes`.
    pub fn zeros(&mut self, sizes: &[DimValue], dtype: DType) -> ValueId {
        let zero = self.scalar(ScalarValue::zero(dtype), dtype);
        self.fill(sizes, zero, dtype)
    }

    /// Replicates `input` along the result axes listed in `added`.
    ///
    /// # Errors
    ///
    /// Returns an IR error when the ranks do not line up.
    pub fn broadcast(
        &mut self,
        input: ValueId,
        sizes: &[DimValue],
        added: Vec<usize>,
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let shape = shape_of(sizes);
        if ty.rank() + added.len() != sizes.len() || added.iter().any(|&a| a >= sizes.len()) {
            return Err(IrError::ShapeMismatch {
                expected: shape,
                got: ty.shape,
            }
            .into());
        }
        Ok(self.emit_tensor(
            Op::Broadcast {
                input,
                sizes: sizes.iter().map(|d| d.value).collect(),
                added,
            },
            ty.dtype,
            shape,
        ))
    }

    /// Numpy-style broadcast of `input` to `sizes`.
    ///
    /// # Errors
    ///
    /// Returns an IR error when `input` has more axes than `sizes`.
    pub fn broadcast_to(&mut self, input: ValueId, sizes: &[DimValue]) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let shape = shape_of(sizes);
        if ty.rank() > sizes.len() {
            return Err(IrError::ShapeMismatch {
                expected: shape,
                got: ty.shape,
            }
            .into());
        }
        if ty.shape.is_static() && ty.shape == shape {
            return Ok(input);
        }
        Ok(self.emit_tensor(
            Op::BroadcastTo {
                input,
                sizes: sizes.iter().map(|d| d.value).collect(),
            },
            ty.dtype,
            shape,
        ))
    }

    // === Layout ===

    /// Permutes the axes of `input`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidPermutation`] for a bad permutation.
    pub fn transpose(&mut self, input: ValueId, perm: Permutation) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let shape = ty.shape.permuted(&perm)?;
        if perm.is_identity() {
            return Ok(input);
        }
        Ok(self.emit_tensor(Op::Transpose { input, perm }, ty.dtype, shape))
    }

    /// Reverses `input` along `axes`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] for an axis out of range.
    pub fn flip(&mut self, input: ValueId, axes: Vec<usize>) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if let Some(&axis) = axes.iter().find(|&&a| a >= ty.rank()) {
            return Err(IrError::InvalidAxis {
                axis: to_i64(axis),
                rank: ty.rank(),
            }
            .into());
        }
        if axes.is_empty() {
            return Ok(input);
        }
        Ok(self.emit_tensor(Op::Flip { input, axes }, ty.dtype, ty.shape))
    }

    /// Splits axes of `input` into the groups of `reassociation`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidReassociation`] when the groups do not fit.
    pub fn expand_shape(
        &mut self,
        input: ValueId,
        reassociation: Reassociation,
        sizes: &[DimValue],
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        reassociation.validate(sizes.len())?;
        if reassociation.collapsed_rank() != ty.rank() {
            return Err(IrError::InvalidReassociation {
                groups: reassociation.groups().iter().map(|g| g.to_vec()).collect(),
                rank: sizes.len(),
            }
            .into());
        }
        Ok(self.emit_tensor(
            Op::ExpandShape {
                input,
                reassociation,
                sizes: sizes.iter().map(|d| d.value).collect(),
            },
            ty.dtype,
            shape_of(sizes),
        ))
    }

    /// Merges axes of `input` according to `reassociation`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidReassociation`] when the groups do not fit.
    pub fn collapse_shape(
        &mut self,
        input: ValueId,
        reassociation: Reassociation,
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let shape = reassociation.collapse(&ty.shape)?;
        Ok(self.emit_tensor(
            Op::CollapseShape {
                input,
                reassociation,
            },
            ty.dtype,
            shape,
        ))
    }

    /// Pads `input` with `value`.
    ///
    /// # Errors
    ///
    /// Returns an IR error when the padding lists do not match the rank.
    pub fn pad(
        &mut self,
        input: ValueId,
        low: Vec<i64>,
        high: Vec<i64>,
        value: ValueId,
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if low.len() != ty.rank() || high.len() != ty.rank() {
            return Err(IrError::InvalidAxis {
                axis: to_i64(low.len().max(high.len())),
                rank: ty.rank(),
            }
            .into());
        }
        if low.iter().chain(&high).all(|&p| p == 0) {
            return Ok(input);
        }
        let shape = ty
            .shape
            .dims()
            .iter()
            .zip(low.iter().zip(&high))
            .map(|(dim, (lo, hi))| match dim.static_value() {
                Some(n) => usize::try_from(to_i64(n) + lo + hi).map_or(Dim::Dynamic, Dim::Static),
                None => Dim::Dynamic,
            })
            .collect();
        Ok(self.emit_tensor(
            Op::Pad {
                input,
                low,
                high,
                value,
            },
            ty.dtype,
            shape,
        ))
    }

    /// Writes `source` into a copy of `dest`.
    ///
    /// # Errors
    ///
    /// Returns an IR error when ranks or element types differ.
    pub fn insert_slice(
        &mut self,
        source: ValueId,
        dest: ValueId,
        offsets: &[DimValue],
        strides: Vec<i64>,
    ) -> Result<ValueId, LowerError> {
        let src = self.tensor_type(source)?;
        let ty = self.tensor_type(dest)?;
        if src.dtype != ty.dtype {
            return Err(IrError::DTypeMismatch {
                expected: ty.dtype,
                got: src.dtype,
            }
            .into());
        }
        if src.rank() != ty.rank() || offsets.len() != ty.rank() || strides.len() != ty.rank() {
            return Err(IrError::ShapeMismatch {
                expected: ty.shape,
                got: src.shape,
            }
            .into());
        }
        Ok(self.emit_tensor(
            Op::InsertSlice {
                source,
                dest,
                offsets: offsets.iter().map(|d| d.value).collect(),
                strides,
            },
            ty.dtype,
            ty.shape,
        ))
    }

    /// The range `start..start + len` of `axis`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] for an axis out of range.
    pub fn narrow(
        &mut self,
        input: ValueId,
        axis: usize,
        start: i64,
        len: usize,
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let mut dims = ty.shape.dims().to_vec();
        let slot = dims.get_mut(axis).ok_or(IrError::InvalidAxis {
            axis: to_i64(axis),
            rank: ty.rank(),
        })?;
        *slot = Dim::Static(len);
        Ok(self.emit_tensor(
            Op::Narrow {
                input,
                axis,
                start,
                len,
            },
            ty.dtype,
            Shape::new(dims),
        ))
    }

    /// Removes the unit axis `axis`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] for an axis out of range.
    pub fn squeeze(&mut self, input: ValueId, axis: usize) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if axis >= ty.rank() {
            return Err(IrError::InvalidAxis {
                axis: to_i64(axis),
                rank: ty.rank(),
            }
            .into());
        }
        let mut dims = ty.shape.dims().to_vec();
        dims.remove(axis);
        Ok(self.emit_tensor(Op::Squeeze { input, axis }, ty.dtype, Shape::new(dims)))
    }

    /// Inserts a unit axis at `axis`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] for a position past the rank.
    pub fn unsqueeze(&mut self, input: ValueId, axis: usize) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if axis > ty.rank() {
            return Err(IrError::InvalidAxis {
                axis: to_i64(axis),
                rank: ty.rank(),
            }
            .into());
        }
        let mut dims = ty.shape.dims().to_vec();
        dims.insert(axis, Dim::Static(1));
        Ok(self.emit_tensor(Op::Unsqueeze { input, axis }, ty.dtype, Shape::new(dims)))
    }

    // === Compute ===

    /// Element-wise `lhs op rhs` producing `dtype`. `rhs` may be a scalar.
    ///
    /// # Errors
    ///
    /// Returns an IR error if `lhs` is not a tensor.
    pub fn elementwise(
        &mut self,
        op: ElementwiseOp,
        lhs: ValueId,
        rhs: ValueId,
        dtype: DType,
    ) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(lhs)?;
        let shape = match self.graph.ty(rhs)? {
            ValueType::Tensor(r) => broadcast_shapes(&ty.shape, &r.shape),
            _ => ty.shape,
        };
        Ok(self.emit_tensor(Op::Elementwise { op, lhs, rhs }, dtype, shape))
    }

    /// Sum over `axis`, keeping it with size one.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::InvalidAxis`] for an axis out of range.
    pub fn sum(&mut self, input: ValueId, axis: usize) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        let mut dims = ty.shape.dims().to_vec();
        let slot = dims.get_mut(axis).ok_or(IrError::InvalidAxis {
            axis: to_i64(axis),
            rank: ty.rank(),
        })?;
        *slot = Dim::Static(1);
        Ok(self.emit_tensor(Op::Sum { input, axis }, ty.dtype, Shape::new(dims)))
    }

    /// Converts the elements of `input` to `dtype`.
    ///
    /// # Errors
    ///
    /// Returns an IR error if `input` is not a tensor.
    pub fn convert(&mut self, input: ValueId, dtype: DType) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if ty.dtype == dtype {
            return Ok(input);
        }
        Ok(self.emit_tensor(Op::Convert { input }, dtype, ty.shape))
    }

    /// Coerces `input` to exactly `target`.
    ///
    /// # Errors
    ///
    /// Returns an IR error when element types or ranks differ, and
    /// [`LowerError::StaticShapeMismatch`] when a static size differs.
    pub fn cast(&mut self, input: ValueId, target: &TensorType) -> Result<ValueId, LowerError> {
        let ty = self.tensor_type(input)?;
        if ty.dtype != target.dtype {
            return Err(IrError::DTypeMismatch {
                expected: target.dtype,
                got: ty.dtype,
            }
            .into());
        }
        if ty.rank() != target.rank() {
            return Err(IrError::ShapeMismatch {
                expected: target.shape.clone(),
                got: ty.shape,
            }
            .into());
        }
        for (axis, (have, want)) in ty.shape.dims().iter().zip(target.shape.dims()).enumerate() {
            if let (Dim::Static(a), Dim::Static(b)) = (have, want) {
                if a != b {
                    return Err(LowerError::StaticShapeMismatch {
                        what: format!("result axis {axis}"),
                        lhs: to_i64(*a),
                        rhs: to_i64(*b),
                    });
                }
            }
        }
        if ty == *target {
            return Ok(input);
        }
        Ok(self.emit(Op::Cast { input }, ValueType::Tensor(target.clone())))
    }

    /// Converts `value` to the element type of `target`, then coerces it to
    /// exactly `target`.
    ///
    /// # Errors
    ///
    /// Returns an error when the shapes cannot agree (see [`Builder::cast`]).
    pub fn finish(&mut self, value: ValueId, target: &TensorType) -> Result<ValueId, LowerError> {
        let converted = self.convert(value, target.dtype)?;
        self.cast(converted, target)
    }

    /// Runs `spec` over `lhs` and `rhs`, accumulating into `init`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::OperandRank`] when an operand rank does not match
    /// the kernel's indexing map.
    pub fn reduce(
        &mut self,
        spec: ReductionSpec,
        lhs: ValueId,
        rhs: ValueId,
        zero_points: Option<[ValueId; 2]>,
        init: ValueId,
    ) -> Result<ValueId, LowerError> {
        let indexing = spec.indexing();
        for (operand, (value, map)) in [lhs, rhs, init].iter().zip(&indexing.maps).enumerate() {
            let got = self.tensor_type(*value)?.rank();
            if got != map.results().len() {
                return Err(IrError::OperandRank {
                    kernel: spec.name(),
                    operand,
                    expected: map.results().len(),
                    got,
                }
                .into());
            }
        }
        let ty = self.tensor_type(init)?;
        trace!(kernel = %spec.name(), "reduce");
        Ok(self.emit(
            Op::Reduce {
                spec,
                lhs,
                rhs,
                zero_points,
                init,
            },
            ValueType::Tensor(ty),
        ))
    }
}
