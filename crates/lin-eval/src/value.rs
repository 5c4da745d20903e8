//! Runtime values.

use lin_ir::DType;
use ndarray::{ArrayD, IxDyn};

use crate::EvalError;

/// Rounds `x` to a value representable in `dtype`.
///
/// Integers truncate toward zero and wrap at their bit width; `Float16`
/// and `BFloat16` are approximated by `f32`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn normalize(dtype: DType, x: f64) -> f64 {
    match dtype {
        DType::Bool => f64::from(u8::from(x != 0.0)),
        DType::Float64 | DType::Complex128 => x,
        DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Complex64 => {
            f64::from(x as f32)
        }
        DType::Int64 | DType::UInt64 => x.trunc(),
        int => wrap(int, x.trunc()),
    }
}

/// Wraps an integral value into the range of an integer type of at most
/// 32 bits.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn wrap(dtype: DType, x: f64) -> f64 {
    let bits = dtype.bit_width();
    let modulus = 1i64 << bits;
    let v = (x as i64).rem_euclid(modulus);
    let v = if dtype.is_unsigned_integer() || v < modulus / 2 {
        v
    } else {
        v - modulus
    };
    v as f64
}

/// Reads integer storage of `dtype` as the signed type of the same width.
#[must_use]
pub fn reinterpret_signed(dtype: DType, x: f64) -> f64 {
    if dtype.is_unsigned_integer() && dtype.bit_width() < 64 {
        wrap(dtype.to_signed(), x)
    } else {
        x
    }
}

/// A dense tensor. Elements are held as `f64` and kept representable in
/// `dtype`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    dtype: DType,
    data: ArrayD<f64>,
}

impl Tensor {
    /// Creates a tensor, rounding every element to `dtype`.
    #[must_use]
    pub fn new(dtype: DType, data: ArrayD<f64>) -> Self {
        Self {
            dtype,
            data: data.mapv(|x| normalize(dtype, x)),
        }
    }

    /// Creates a tensor from row-major elements.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::ShapeError`] if the element count does not match
    /// `shape`.
    pub fn from_vec(dtype: DType, shape: &[usize], values: Vec<f64>) -> Result<Self, EvalError> {
        let len = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            EvalError::ShapeError(format!("{len} elements do not fill shape {shape:?}"))
        })?;
        Ok(Self::new(dtype, data))
    }

    /// Returns the element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the elements.
    #[must_use]
    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// Consumes the tensor, returning its elements.
    #[must_use]
    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }

    /// Returns the shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Returns the elements in row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }
}

/// A value produced by one node.
#[derive(Clone, Debug, PartialEq)]
pub enum RtValue {
    /// An index (size or offset).
    Index(i64),
    /// A scalar.
    Scalar {
        /// Element type.
        dtype: DType,
        /// The value.
        value: f64,
    },
    /// A tensor.
    Tensor(Tensor),
    /// The result of a guard.
    Unit,
}

impl RtValue {
    /// Returns a short description of the value's kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Index(_) => "index",
            Self::Scalar { .. } => "scalar",
            Self::Tensor(_) => "tensor",
            Self::Unit => "unit",
        }
    }

    /// Returns the tensor, if this is one.
    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Consumes the value, returning the tensor.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::TypeError`] for any other kind of value.
    pub fn into_tensor(self) -> Result<Tensor, EvalError> {
        match self {
            Self::Tensor(t) => Ok(t),
            other => Err(EvalError::TypeError {
                expected: "tensor".into(),
                got: other.kind().into(),
            }),
        }
    }
}
