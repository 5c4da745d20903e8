//! Matrix-multiply family lowering.
//!
//! `matmul` is rank-polymorphic: the operand ranks select one of the
//! [`MatmulForm`]s, each with its own reduction kernel. `mm` and `bmm` are
//! the strict rank-2 and rank-3 forms.
//!
//! | lhs | rhs | Form | Kernel |
//! |-----|-----|------|--------|
//! | 1 | 1 | `Dot` | `dot` |
//! | 1 | 2 | `Vecmat` | `vecmat` |
//! | 2 | 1 | `Matvec` | `matvec` |
//! | 2 | 2 | `Matmul` | `matmul` |
//! | >=2 | >=2 | `Batched` | `batch_matmul` or generic |
//!
//! Every form accumulates in the widened type of the lhs element type and
//! converts to the declared element type at the end.

use lin_ir::{
    AffineExpr, AffineMap, CastKind, IteratorKind, LinearKind, LinearOp, NamedKernel,
    OperandInfo, Reassociation, ReductionSpec, TensorType, ValueId,
};
use tracing::debug;

use crate::builder::{Builder, DimValue};
use crate::dispatch::LoweringRule;
use crate::quant::{normalize_pair, NormalizedOperand};
use crate::shape::{accumulator_type, broadcast_batch_dims, check_dim_equal, check_element_kind};
use crate::{LowerConfig, LowerError};

/// The shape-directed form of a matrix multiply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatmulForm {
    /// Vector by vector.
    Dot,
    /// Vector by matrix.
    Vecmat,
    /// Matrix by vector.
    Matvec,
    /// Matrix by matrix.
    Matmul,
    /// Broadcast batches of matrices.
    Batched {
        /// Number of leading batch axes of the result.
        batch_rank: usize,
    },
}

impl MatmulForm {
    /// Selects the form for the given operand ranks, or `None` when no form
    /// applies.
    #[must_use]
    pub fn classify(lhs_rank: usize, rhs_rank: usize) -> Option<Self> {
        match (lhs_rank, rhs_rank) {
            (1, 1) => Some(Self::Dot),
            (1, 2) => Some(Self::Vecmat),
            (2, 1) => Some(Self::Matvec),
            (2, 2) => Some(Self::Matmul),
            (l, r) if l >= 2 && r >= 2 => Some(Self::Batched {
                batch_rank: l.max(r) - 2,
            }),
            _ => None,
        }
    }

    /// Returns the rank of the result.
    #[must_use]
    pub fn result_rank(self) -> usize {
        match self {
            Self::Dot => 0,
            Self::Vecmat | Self::Matvec => 1,
            Self::Matmul => 2,
            Self::Batched { batch_rank } => batch_rank + 2,
        }
    }
}

/// The accumulation buffer and zero-points shared by every form.
struct Operands {
    lhs: NormalizedOperand,
    rhs: NormalizedOperand,
    acc: lin_ir::DType,
}

impl Operands {
    fn zero_points(&self) -> Option<[ValueId; 2]> {
        Some([self.lhs.zero_point?, self.rhs.zero_point?])
    }

    fn is_quantized(&self) -> bool {
        self.lhs.zero_point.is_some()
    }
}

fn reduce_named(
    b: &mut Builder<'_>,
    kernel: NamedKernel,
    ops: &Operands,
    lhs: ValueId,
    rhs: ValueId,
    init: ValueId,
) -> Result<ValueId, LowerError> {
    b.reduce(ReductionSpec::named(kernel), lhs, rhs, ops.zero_points(), init)
}

fn lower_dot(b: &mut Builder<'_>, ops: &Operands) -> Result<ValueId, LowerError> {
    let k_lhs = b.dim(ops.lhs.value, 0)?;
    let k_rhs = b.dim(ops.rhs.value, 0)?;
    check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;
    let init = b.zeros(&[], ops.acc);
    reduce_named(b, NamedKernel::Dot, ops, ops.lhs.value, ops.rhs.value, init)
}

fn lower_vecmat(b: &mut Builder<'_>, ops: &Operands) -> Result<ValueId, LowerError> {
    let k_lhs = b.dim(ops.lhs.value, 0)?;
    let k_rhs = b.dim(ops.rhs.value, 0)?;
    let n = b.dim(ops.rhs.value, 1)?;
    check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;
    let init = b.zeros(&[n], ops.acc);
    reduce_named(b, NamedKernel::Vecmat, ops, ops.lhs.value, ops.rhs.value, init)
}

fn lower_matvec(b: &mut Builder<'_>, ops: &Operands) -> Result<ValueId, LowerError> {
    let m = b.dim(ops.lhs.value, 0)?;
    let k_lhs = b.dim(ops.lhs.value, 1)?;
    let k_rhs = b.dim(ops.rhs.value, 0)?;
    check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;
    let init = b.zeros(&[m], ops.acc);
    reduce_named(b, NamedKernel::Matvec, ops, ops.lhs.value, ops.rhs.value, init)
}

fn lower_matmul(
    b: &mut Builder<'_>,
    ops: &Operands,
    lhs: ValueId,
    rhs: ValueId,
) -> Result<ValueId, LowerError> {
    let m = b.dim(lhs, 0)?;
    let k_lhs = b.dim(lhs, 1)?;
    let k_rhs = b.dim(rhs, 0)?;
    let n = b.dim(rhs, 1)?;
    check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;
    let init = b.zeros(&[m, n], ops.acc);
    let kernel = if ops.is_quantized() {
        NamedKernel::QuantizedMatmul
    } else {
        NamedKernel::Matmul
    };
    reduce_named(b, kernel, ops, lhs, rhs, init)
}

/// Quantized vector forms: the vector operands become `[1, k]` / `[k, 1]`
/// matrices, the quantized matmul runs, and the unit axes are folded away.
fn lower_quantized_vector(
    b: &mut Builder<'_>,
    ops: &Operands,
    form: MatmulForm,
) -> Result<ValueId, LowerError> {
    let unit = || Reassociation::fold_range(2, 0, 2);
    let mut lhs = ops.lhs.value;
    let mut rhs = ops.rhs.value;
    if ops.lhs.ty.rank() == 1 {
        let one = b.index(1);
        let k = b.dim(lhs, 0)?;
        lhs = b.expand_shape(lhs, unit(), &[one, k])?;
    }
    if ops.rhs.ty.rank() == 1 {
        let one = b.index(1);
        let k = b.dim(rhs, 0)?;
        rhs = b.expand_shape(rhs, unit(), &[k, one])?;
    }
    let product = lower_matmul(b, ops, lhs, rhs)?;
    let fold = if form == MatmulForm::Dot {
        Reassociation::new([])
    } else {
        unit()
    };
    b.collapse_shape(product, fold)
}

fn lower_batched(
    b: &mut Builder<'_>,
    ops: &Operands,
    batch_rank: usize,
) -> Result<ValueId, LowerError> {
    let lhs_dims = b.dims(ops.lhs.value)?;
    let rhs_dims = b.dims(ops.rhs.value)?;
    let (lhs_batch, lhs_mat) = lhs_dims.split_at(lhs_dims.len() - 2);
    let (rhs_batch, rhs_mat) = rhs_dims.split_at(rhs_dims.len() - 2);
    let batch = broadcast_batch_dims(b, lhs_batch, rhs_batch)?;
    let (m, k_lhs) = (lhs_mat[0], lhs_mat[1]);
    let (k_rhs, n) = (rhs_mat[0], rhs_mat[1]);
    check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;

    let with = |tail: [DimValue; 2]| -> Vec<DimValue> {
        batch.iter().copied().chain(tail).collect()
    };
    let lhs = b.broadcast_to(ops.lhs.value, &with([m, k_lhs]))?;
    let rhs = b.broadcast_to(ops.rhs.value, &with([k_rhs, n]))?;
    let kernel = if ops.is_quantized() {
        NamedKernel::QuantizedBatchMatmul
    } else {
        NamedKernel::BatchMatmul
    };

    if batch_rank == 1 {
        debug!("batch_matmul");
        let init = b.zeros(&with([m, n]), ops.acc);
        return reduce_named(b, kernel, ops, lhs, rhs, init);
    }

    let dynamic_batch = batch.iter().filter(|d| d.known.is_none()).count();
    if dynamic_batch <= 1 {
        debug!(batch_rank, "collapsing batch axes");
        let fold = Reassociation::fold_range(batch_rank + 2, 0, batch_rank);
        let lhs = b.collapse_shape(lhs, fold.clone())?;
        let rhs = b.collapse_shape(rhs, fold.clone())?;
        let mut size = batch[0];
        for &d in &batch[1..] {
            size = b.mul(size, d);
        }
        let init = b.zeros(&[size, m, n], ops.acc);
        let product = reduce_named(b, kernel, ops, lhs, rhs, init)?;
        return b.expand_shape(product, fold, &with([m, n]));
    }

    debug!(batch_rank, dynamic_batch, "generic batched reduction");
    // b.., m, k, n
    let loops = batch_rank + 3;
    let batch_exprs = || (0..batch_rank).map(AffineExpr::dim);
    let (dm, dk, dn) = (batch_rank, batch_rank + 1, batch_rank + 2);
    let map = |rows: usize, cols: usize| {
        AffineMap::new(
            loops,
            batch_exprs().chain([AffineExpr::dim(rows), AffineExpr::dim(cols)]),
        )
    };
    let iterators = std::iter::repeat(IteratorKind::Parallel)
        .take(batch_rank + 1)
        .chain([IteratorKind::Reduction, IteratorKind::Parallel])
        .collect();
    let spec = ReductionSpec::generic(
        vec![map(dm, dk), map(dk, dn), map(dm, dn)],
        iterators,
        ops.is_quantized(),
    );
    let init = b.zeros(&with([m, n]), ops.acc);
    b.reduce(spec, lhs, rhs, ops.zero_points(), init)
}

fn binary_operands(op: &LinearOp) -> Option<(ValueId, ValueId)> {
    match op {
        LinearOp::Mm(ops) | LinearOp::Matmul(ops) | LinearOp::Bmm(ops) => Some((ops.lhs, ops.rhs)),
        _ => None,
    }
}

fn extract(
    b: &Builder<'_>,
    op: &LinearOp,
    kind: LinearKind,
) -> Result<(OperandInfo, OperandInfo), LowerError> {
    let (lhs, rhs) = binary_operands(op)
        .filter(|_| op.kind() == kind)
        .ok_or_else(|| LowerError::no_match(format!("expected {kind}")))?;
    Ok((
        OperandInfo::extract(b.graph(), lhs)?,
        OperandInfo::extract(b.graph(), rhs)?,
    ))
}

/// Checks element types and normalizes a quantized pair.
fn prepare(
    b: &mut Builder<'_>,
    lhs: &OperandInfo,
    rhs: &OperandInfo,
    result: &TensorType,
    name: &str,
) -> Result<Operands, LowerError> {
    for dtype in [lhs.ty.dtype, rhs.ty.dtype, result.dtype] {
        check_element_kind(dtype)?;
    }
    if !lhs.is_quantized() && lhs.ty.dtype != rhs.ty.dtype {
        return Err(LowerError::no_match(format!(
            "{name} with different input element types ({} and {})",
            lhs.ty.dtype, rhs.ty.dtype
        )));
    }
    let acc = accumulator_type(lhs.ty.dtype)?;
    let (lhs, rhs) = normalize_pair(b, lhs, rhs, name)?;
    Ok(Operands { lhs, rhs, acc })
}

/// Lowers `matmul`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatmulRule;

impl LoweringRule for MatmulRule {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Matmul
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        _config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let (lhs, rhs) = extract(b, op, LinearKind::Matmul)?;
        let form = MatmulForm::classify(lhs.rank(), rhs.rank()).ok_or_else(|| {
            LowerError::no_match(format!(
                "matmul of ranks {} and {}",
                lhs.rank(),
                rhs.rank()
            ))
        })?;
        let ops = prepare(b, &lhs, &rhs, result, "matmul")?;
        debug!(?form, acc = %ops.acc, quantized = ops.is_quantized(), "matmul form");

        let value = match form {
            MatmulForm::Dot | MatmulForm::Vecmat | MatmulForm::Matvec if ops.is_quantized() => {
                lower_quantized_vector(b, &ops, form)?
            }
            MatmulForm::Dot => lower_dot(b, &ops)?,
            MatmulForm::Vecmat => lower_vecmat(b, &ops)?,
            MatmulForm::Matvec => lower_matvec(b, &ops)?,
            MatmulForm::Matmul => lower_matmul(b, &ops, ops.lhs.value, ops.rhs.value)?,
            MatmulForm::Batched { batch_rank } => lower_batched(b, &ops, batch_rank)?,
        };
        b.finish(value, result)
    }
}

/// Lowers `mm`: strict rank-2 operands.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmRule;

impl LoweringRule for MmRule {
    fn name(&self) -> &'static str {
        "mm"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Mm
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let (lhs, rhs) = extract(b, op, LinearKind::Mm)?;
        if lhs.rank() != 2 || rhs.rank() != 2 {
            return Err(LowerError::no_match("expected both operands of mm to be rank 2"));
        }
        let unsigned = lhs.ty.dtype.is_unsigned_integer();
        let ops = prepare(b, &lhs, &rhs, result, "mm")?;

        let m = b.dim(ops.lhs.value, 0)?;
        let n = b.dim(ops.rhs.value, 1)?;
        let k_lhs = b.dim(ops.lhs.value, 1)?;
        let k_rhs = b.dim(ops.rhs.value, 0)?;
        if config.assume_strict_symbolic_shapes {
            if let (Some(l), Some(r)) = (k_lhs.known, k_rhs.known) {
                if l != r {
                    return Err(LowerError::StaticShapeMismatch {
                        what: "contracting dimension".into(),
                        lhs: l,
                        rhs: r,
                    });
                }
            }
        } else {
            check_dim_equal(b, k_lhs, k_rhs, "contracting dimension")?;
        }

        let init = b.zeros(&[m, n], ops.acc);
        let spec = if ops.is_quantized() {
            ReductionSpec::named(NamedKernel::QuantizedMatmul)
        } else if unsigned {
            ReductionSpec::named(NamedKernel::Matmul).with_cast(CastKind::Unsigned)
        } else {
            ReductionSpec::named(NamedKernel::Matmul)
        };
        debug!(kernel = %spec.name(), cast = ?spec.cast, "mm");
        let value = b.reduce(spec, ops.lhs.value, ops.rhs.value, ops.zero_points(), init)?;
        b.finish(value, result)
    }
}

/// Lowers `bmm`: strict rank-3 operands with equal batch sizes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BmmRule;

impl LoweringRule for BmmRule {
    fn name(&self) -> &'static str {
        "bmm"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Bmm
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        _config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let (lhs, rhs) = binary_operands(op)
            .filter(|_| op.kind() == LinearKind::Bmm)
            .ok_or_else(|| LowerError::no_match("expected bmm"))?;
        let lhs_ty = b.tensor_type(lhs)?;
        let rhs_ty = b.tensor_type(rhs)?;
        if lhs_ty.rank() != 3 || rhs_ty.rank() != 3 {
            return Err(LowerError::no_match("expected both operands of bmm to be rank 3"));
        }
        for dtype in [lhs_ty.dtype, rhs_ty.dtype, result.dtype] {
            check_element_kind(dtype)?;
        }

        let (mut lhs, mut rhs) = (lhs, rhs);
        if lhs_ty.dtype != rhs_ty.dtype {
            if lhs_ty.dtype == result.dtype {
                rhs = b.convert(rhs, result.dtype)?;
            } else {
                lhs = b.convert(lhs, result.dtype)?;
            }
        }
        let acc = accumulator_type(b.tensor_type(lhs)?.dtype)?;

        let lhs_dims = b.dims(lhs)?;
        let rhs_dims = b.dims(rhs)?;
        check_dim_equal(b, lhs_dims[0], rhs_dims[0], "batch dimension")?;
        check_dim_equal(b, lhs_dims[2], rhs_dims[1], "contracting dimension")?;

        let init = b.zeros(&[lhs_dims[0], lhs_dims[1], rhs_dims[2]], acc);
        let value = b.reduce(
            ReductionSpec::named(NamedKernel::BatchMatmul),
            lhs,
            rhs,
            None,
            init,
        )?;
        b.finish(value, result)
    }
}
