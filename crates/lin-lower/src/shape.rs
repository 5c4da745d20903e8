//! Shape and broadcast resolution.
//!
//! Size relations between operands are checked while lowering when both
//! sizes are known, and deferred to a run-time [`Guard`](lin_ir::Guard)
//! otherwise. A deferred check never blocks the rewrite: the lowering
//! proceeds assuming the guard holds.

use lin_ir::{DType, GuardCond};
use tracing::debug;

use crate::builder::{Builder, DimValue};
use crate::LowerError;

/// Requires `lhs == rhs`.
///
/// # Errors
///
/// Returns [`LowerError::StaticShapeMismatch`] when both sizes are known and
/// differ.
pub fn check_dim_equal(
    b: &mut Builder<'_>,
    lhs: DimValue,
    rhs: DimValue,
    what: &str,
) -> Result<(), LowerError> {
    match (lhs.known, rhs.known) {
        (Some(l), Some(r)) if l == r => Ok(()),
        (Some(l), Some(r)) => Err(LowerError::StaticShapeMismatch {
            what: what.to_string(),
            lhs: l,
            rhs: r,
        }),
        _ => {
            debug!(what, "deferring size equality to run time");
            b.guard(GuardCond::Eq(lhs.value, rhs.value), format!("mismatching {what}"));
            Ok(())
        }
    }
}

/// Requires `value % divisor == 0`.
///
/// # Errors
///
/// Returns [`LowerError::StaticShapeMismatch`] when both are known and the
/// division leaves a remainder (`lhs` is the value, `rhs` the divisor).
pub fn check_divisible(
    b: &mut Builder<'_>,
    value: DimValue,
    divisor: DimValue,
    what: &str,
) -> Result<(), LowerError> {
    match (value.known, divisor.known) {
        (Some(v), Some(d)) if d != 0 && v % d == 0 => Ok(()),
        (Some(v), Some(d)) => Err(LowerError::StaticShapeMismatch {
            what: what.to_string(),
            lhs: v,
            rhs: d,
        }),
        _ => {
            debug!(what, "deferring divisibility to run time");
            b.guard(
                GuardCond::Divisible {
                    value: value.value,
                    divisor: divisor.value,
                },
                format!("invalid: {what}"),
            );
            Ok(())
        }
    }
}

/// Broadcasts two batch-dimension lists against each other (numpy rules,
/// right-aligned) and returns the result sizes.
///
/// # Errors
///
/// Returns [`LowerError::StaticShapeMismatch`] for two known sizes that
/// differ with neither being one.
pub fn broadcast_batch_dims(
    b: &mut Builder<'_>,
    lhs: &[DimValue],
    rhs: &[DimValue],
) -> Result<Vec<DimValue>, LowerError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let l = (i + lhs.len()).checked_sub(rank).map(|j| lhs[j]);
        let r = (i + rhs.len()).checked_sub(rank).map(|j| rhs[j]);
        let dim = match (l, r) {
            (Some(d), None) | (None, Some(d)) => d,
            (Some(l), Some(r)) => broadcast_pair(b, l, r, i)?,
            (None, None) => continue,
        };
        out.push(dim);
    }
    Ok(out)
}

fn broadcast_pair(
    b: &mut Builder<'_>,
    l: DimValue,
    r: DimValue,
    axis: usize,
) -> Result<DimValue, LowerError> {
    let message = || format!("incompatible batch dimension {axis}");
    Ok(match (l.known, r.known) {
        (Some(x), Some(y)) if x == y => l,
        (Some(1), _) => r,
        (_, Some(1)) => l,
        (Some(x), Some(y)) => {
            return Err(LowerError::StaticShapeMismatch {
                what: message(),
                lhs: x,
                rhs: y,
            })
        }
        (Some(_), None) => {
            b.guard(
                GuardCond::Broadcastable {
                    size: r.value,
                    target: l.value,
                },
                message(),
            );
            l
        }
        (None, Some(_)) => {
            b.guard(
                GuardCond::Broadcastable {
                    size: l.value,
                    target: r.value,
                },
                message(),
            );
            r
        }
        (None, None) => {
            let max = b.max(l, r);
            for size in [l, r] {
                b.guard(
                    GuardCond::Broadcastable {
                        size: size.value,
                        target: max.value,
                    },
                    message(),
                );
            }
            max
        }
    })
}

/// Requires an element type a reduction can consume.
///
/// # Errors
///
/// Returns [`LowerError::InvalidElementType`] for bool and complex types.
pub fn check_element_kind(dtype: DType) -> Result<(), LowerError> {
    if dtype.is_numeric() {
        Ok(())
    } else {
        Err(LowerError::InvalidElementType { dtype })
    }
}

/// Returns the type reductions over `dtype` accumulate in.
///
/// # Errors
///
/// Returns [`LowerError::InvalidElementType`] for bool and complex types.
pub fn accumulator_type(dtype: DType) -> Result<DType, LowerError> {
    dtype
        .accumulator()
        .ok_or(LowerError::InvalidElementType { dtype })
}
