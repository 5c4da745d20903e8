//! Quantization normalization.
//!
//! Quantized operands reach a reduction as integer storage plus a
//! zero-point. The reduction kernels only understand signed storage, so an
//! unsigned operand is shifted into the signed range of the same width and
//! its zero-point is shifted by the same amount. The represented real values
//! `(stored - zero_point) * scale` do not change.

use lin_ir::{DType, ElementwiseOp, OperandInfo, ScalarValue, TensorType, ValueId};
use tracing::debug;

use crate::builder::Builder;
use crate::LowerError;

/// Type every zero-point is truncated to.
pub const ZERO_POINT_TYPE: DType = DType::Int32;

/// The shift applied to unsigned storage of `bits` bits: `-(2^(bits-1))`.
#[must_use]
pub fn sign_shift_offset(bits: u32) -> i64 {
    i64::MIN >> (64 - bits.clamp(1, 64))
}

/// An operand after normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedOperand {
    /// The (possibly shifted) storage.
    pub value: ValueId,
    /// Its type.
    pub ty: TensorType,
    /// The `i32` zero-point, if quantized.
    pub zero_point: Option<ValueId>,
}

impl NormalizedOperand {
    /// Wraps an operand that needs no normalization.
    #[must_use]
    pub fn plain(info: &OperandInfo) -> Self {
        Self {
            value: info.value,
            ty: info.ty.clone(),
            zero_point: info.zero_point,
        }
    }
}

/// Returns whether a pair of operands is quantized.
///
/// # Errors
///
/// Returns [`LowerError::NoMatch`] when only one of them carries a
/// zero-point.
pub fn quantized_pair(lhs: &OperandInfo, rhs: &OperandInfo, op: &str) -> Result<bool, LowerError> {
    match (lhs.is_quantized(), rhs.is_quantized()) {
        (true, true) => Ok(true),
        (false, false) => Ok(false),
        _ => Err(LowerError::no_match(format!("{op} with mixed quantization"))),
    }
}

/// Normalizes one operand: truncates its zero-point to `i32` and shifts
/// unsigned storage to signed.
///
/// # Errors
///
/// Returns an IR error if the storage is not a tensor.
pub fn normalize_operand(
    b: &mut Builder<'_>,
    info: &OperandInfo,
) -> Result<NormalizedOperand, LowerError> {
    let Some(zero_point) = info.zero_point else {
        return Ok(NormalizedOperand::plain(info));
    };
    let mut zero_point = b.scalar_cast(zero_point, ZERO_POINT_TYPE);
    let dtype = info.ty.dtype;
    if !dtype.is_unsigned_integer() {
        return Ok(NormalizedOperand {
            value: info.value,
            ty: info.ty.clone(),
            zero_point: Some(zero_point),
        });
    }

    let offset = sign_shift_offset(dtype.bit_width());
    let signed = dtype.to_signed();
    debug!(from = %dtype, to = %signed, offset, "shifting unsigned storage");
    zero_point = b.scalar_add_const(zero_point, offset, ZERO_POINT_TYPE);
    let shift = b.scalar(ScalarValue::Int(offset), signed);
    let value = b.elementwise(ElementwiseOp::Add, info.value, shift, signed)?;
    Ok(NormalizedOperand {
        value,
        ty: b.tensor_type(value)?,
        zero_point: Some(zero_point),
    })
}

/// Normalizes both operands of a binary reduction.
///
/// # Errors
///
/// Returns [`LowerError::NoMatch`] for mixed quantization.
pub fn normalize_pair(
    b: &mut Builder<'_>,
    lhs: &OperandInfo,
    rhs: &OperandInfo,
    op: &str,
) -> Result<(NormalizedOperand, NormalizedOperand), LowerError> {
    quantized_pair(lhs, rhs, op)?;
    Ok((normalize_operand(b, lhs)?, normalize_operand(b, rhs)?))
}
