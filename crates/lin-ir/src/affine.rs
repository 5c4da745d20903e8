//! Affine index expressions and maps.
//!
//! Every operand of a reduction is addressed through an [`AffineMap`] from the
//! iteration space (`d0, d1, ...`) to the operand's coordinates. Convolution
//! windows use `d_out * stride + d_kernel * dilation`; everything else is a
//! plain projection.

use std::fmt;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// An affine expression over iteration dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AffineExpr {
    /// The iteration dimension with this position.
    Dim(usize),
    /// A constant.
    Const(i64),
    /// Sum of two expressions.
    Add(Box<AffineExpr>, Box<AffineExpr>),
    /// An expression scaled by a constant.
    Mul(Box<AffineExpr>, i64),
}

impl AffineExpr {
    /// The iteration dimension `d{pos}`.
    #[must_use]
    pub const fn dim(pos: usize) -> Self {
        Self::Dim(pos)
    }

    /// A constant expression.
    #[must_use]
    pub const fn constant(value: i64) -> Self {
        Self::Const(value)
    }

    /// Evaluates the expression at an iteration point.
    ///
    /// # Panics
    ///
    /// Panics if the expression references a dimension outside `point`.
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> i64 {
        match self {
            Self::Dim(d) => point[*d],
            Self::Const(c) => *c,
            Self::Add(lhs, rhs) => lhs.eval(point) + rhs.eval(point),
            Self::Mul(expr, k) => expr.eval(point) * k,
        }
    }

    /// Returns the dimension position if this is a bare dimension.
    #[must_use]
    pub fn as_dim(&self) -> Option<usize> {
        match self {
            Self::Dim(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns the largest dimension position referenced, if any.
    #[must_use]
    pub fn max_dim(&self) -> Option<usize> {
        match self {
            Self::Dim(d) => Some(*d),
            Self::Const(_) => None,
            Self::Add(lhs, rhs) => lhs.max_dim().max(rhs.max_dim()),
            Self::Mul(expr, _) => expr.max_dim(),
        }
    }
}

impl Add for AffineExpr {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Const(0), e) | (e, Self::Const(0)) => e,
            (Self::Const(a), Self::Const(b)) => Self::Const(a + b),
            (lhs, rhs) => Self::Add(Box::new(lhs), Box::new(rhs)),
        }
    }
}

impl Mul<i64> for AffineExpr {
    type Output = Self;

    fn mul(self, k: i64) -> Self {
        match (self, k) {
            (e, 1) => e,
            (_, 0) => Self::Const(0),
            (Self::Const(c), k) => Self::Const(c * k),
            (e, k) => Self::Mul(Box::new(e), k),
        }
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dim(d) => write!(f, "d{d}"),
            Self::Const(c) => write!(f, "{c}"),
            Self::Add(lhs, rhs) => write!(f, "{lhs} + {rhs}"),
            Self::Mul(expr, k) => match **expr {
                Self::Add(..) => write!(f, "({expr}) * {k}"),
                _ => write!(f, "{expr} * {k}"),
            },
        }
    }
}

/// A map from an iteration space to operand coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineMap {
    num_dims: usize,
    results: SmallVec<[AffineExpr; 4]>,
}

impl AffineMap {
    /// Creates a map over `num_dims` iteration dimensions.
    #[must_use]
    pub fn new(num_dims: usize, results: impl IntoIterator<Item = AffineExpr>) -> Self {
        Self {
            num_dims,
            results: results.into_iter().collect(),
        }
    }

    /// Projects the iteration space onto the listed dimensions.
    #[must_use]
    pub fn projection(num_dims: usize, dims: impl IntoIterator<Item = usize>) -> Self {
        Self::new(num_dims, dims.into_iter().map(AffineExpr::Dim))
    }

    /// The identity map on `num_dims` dimensions.
    #[must_use]
    pub fn identity(num_dims: usize) -> Self {
        Self::projection(num_dims, 0..num_dims)
    }

    /// Returns the number of iteration dimensions.
    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    /// Returns the result expressions (one per operand axis).
    #[must_use]
    pub fn results(&self) -> &[AffineExpr] {
        &self.results
    }

    /// Evaluates every result at an iteration point.
    #[must_use]
    pub fn eval(&self, point: &[i64]) -> SmallVec<[i64; 4]> {
        self.results.iter().map(|e| e.eval(point)).collect()
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for d in 0..self.num_dims {
            if d > 0 {
                f.write_str(", ")?;
            }
            write!(f, "d{d}")?;
        }
        f.write_str(") -> (")?;
        for (i, e) in self.results.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{e}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_expr() {
        // d2 * 2 + d5 * 3
        let expr = AffineExpr::dim(2) * 2 + AffineExpr::dim(5) * 3;
        let point = [0, 0, 4, 0, 0, 1];
        assert_eq!(expr.eval(&point), 11);
        assert_eq!(expr.max_dim(), Some(5));
    }

    #[test]
    fn test_folding() {
        assert_eq!(AffineExpr::dim(1) * 1, AffineExpr::Dim(1));
        assert_eq!(AffineExpr::dim(1) + AffineExpr::constant(0), AffineExpr::Dim(1));
        assert_eq!(
            AffineExpr::constant(2) * 3 + AffineExpr::constant(1),
            AffineExpr::Const(7)
        );
    }

    #[test]
    fn test_map_display() {
        let map = AffineMap::new(3, [AffineExpr::dim(0), AffineExpr::dim(1) * 2 + AffineExpr::dim(2)]);
        assert_eq!(map.to_string(), "(d0, d1, d2) -> (d0, d1 * 2 + d2)");
        assert_eq!(map.eval(&[1, 2, 3]).as_slice(), &[1, 7]);
    }

    #[test]
    fn test_identity() {
        let map = AffineMap::identity(2);
        assert_eq!(map.eval(&[5, 6]).as_slice(), &[5, 6]);
        assert_eq!(map.results()[1].as_dim(), Some(1));
    }
}
