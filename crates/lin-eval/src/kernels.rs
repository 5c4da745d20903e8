//! Array kernels behind the node operations.
//!
//! Every function checks its preconditions and reports a violation as an
//! [`EvalError`]; none of them panics on malformed shapes or offsets.

use lin_ir::{Combine, Indexing};
use ndarray::{ArrayD, Axis, IxDyn, Slice, Zip};

use crate::EvalError;

fn out_of_bounds(what: impl Into<String>) -> EvalError {
    EvalError::OutOfBounds(what.into())
}

fn check_axis(data: &ArrayD<f64>, axis: usize) -> Result<(), EvalError> {
    if axis < data.ndim() {
        Ok(())
    } else {
        Err(out_of_bounds(format!(
            "axis {axis} of a rank-{} tensor",
            data.ndim()
        )))
    }
}

fn to_isize(n: i64) -> Result<isize, EvalError> {
    isize::try_from(n).map_err(|_| out_of_bounds(format!("offset {n}")))
}

/// Numpy broadcast of two shapes.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] for incompatible shapes.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, EvalError> {
    let rank = lhs.len().max(rhs.len());
    let at = |shape: &[usize], i: usize| {
        (i + shape.len())
            .checked_sub(rank)
            .map_or(1, |j| shape[j])
    };
    (0..rank)
        .map(|i| match (at(lhs, i), at(rhs, i)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(EvalError::ShapeError(format!(
                "cannot broadcast {lhs:?} with {rhs:?}"
            ))),
        })
        .collect()
}

/// Applies `f` element-wise after broadcasting both operands.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] for incompatible shapes.
pub fn zip_with(
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ArrayD<f64>, EvalError> {
    let shape = broadcast_shape(lhs.shape(), rhs.shape())?;
    let shape = IxDyn(&shape);
    let (Some(a), Some(b)) = (lhs.broadcast(shape.clone()), rhs.broadcast(shape)) else {
        return Err(EvalError::ShapeError("broadcast failed".into()));
    };
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

/// Inserts unit axes at `added` (ascending result positions), then
/// stretches to `sizes`.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] when the input does not fit.
pub fn broadcast_added(
    input: &ArrayD<f64>,
    sizes: &[usize],
    added: &[usize],
) -> Result<ArrayD<f64>, EvalError> {
    let mut added = added.to_vec();
    added.sort_unstable();
    let mut view = input.view();
    for &axis in &added {
        if axis > view.ndim() {
            return Err(EvalError::ShapeError(format!(
                "cannot add axis {axis} to a rank-{} tensor",
                view.ndim()
            )));
        }
        view = view.insert_axis(Axis(axis));
    }
    broadcast_view(&view.to_owned(), sizes)
}

/// Numpy-style broadcast to `sizes`.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] when the input does not fit.
pub fn broadcast_view(input: &ArrayD<f64>, sizes: &[usize]) -> Result<ArrayD<f64>, EvalError> {
    input
        .broadcast(IxDyn(sizes))
        .map(|v| v.to_owned())
        .ok_or_else(|| {
            EvalError::ShapeError(format!(
                "cannot broadcast {:?} to {sizes:?}",
                input.shape()
            ))
        })
}

/// Row-major reshape.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] when the element counts differ.
pub fn reshape(input: &ArrayD<f64>, sizes: &[usize]) -> Result<ArrayD<f64>, EvalError> {
    ArrayD::from_shape_vec(IxDyn(sizes), input.iter().copied().collect()).map_err(|_| {
        EvalError::ShapeError(format!("cannot reshape {:?} to {sizes:?}", input.shape()))
    })
}

/// Reverses `input` along each of `axes`.
///
/// # Errors
///
/// Returns [`EvalError::OutOfBounds`] for an axis out of range.
pub fn flip(input: &ArrayD<f64>, axes: &[usize]) -> Result<ArrayD<f64>, EvalError> {
    let mut view = input.view();
    for &axis in axes {
        check_axis(input, axis)?;
        view.invert_axis(Axis(axis));
    }
    Ok(view.to_owned())
}

/// Constant padding.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] for negative or mis-sized padding.
pub fn pad(
    input: &ArrayD<f64>,
    low: &[i64],
    high: &[i64],
    value: f64,
) -> Result<ArrayD<f64>, EvalError> {
    if low.len() != input.ndim() || high.len() != input.ndim() {
        return Err(EvalError::ShapeError("padding does not match rank".into()));
    }
    let mut sizes = Vec::with_capacity(input.ndim());
    let mut starts = Vec::with_capacity(input.ndim());
    for ((&n, &lo), &hi) in input.shape().iter().zip(low).zip(high) {
        let (Ok(lo), Ok(hi)) = (usize::try_from(lo), usize::try_from(hi)) else {
            return Err(EvalError::ShapeError(format!("negative padding {lo}/{hi}")));
        };
        sizes.push(lo + n + hi);
        starts.push(lo);
    }
    let mut out = ArrayD::from_elem(IxDyn(&sizes), value);
    let mut window = out.view_mut();
    for (axis, (&start, &n)) in starts.iter().zip(input.shape()).enumerate() {
        window.slice_axis_inplace(Axis(axis), Slice::from(start..start + n));
    }
    window.assign(input);
    Ok(out)
}

/// Writes `source` into a copy of `dest` starting at `offsets`, placing
/// consecutive source elements `strides` apart.
///
/// # Errors
///
/// Returns [`EvalError::OutOfBounds`] when the slice does not fit.
pub fn insert_slice(
    source: &ArrayD<f64>,
    dest: &ArrayD<f64>,
    offsets: &[i64],
    strides: &[i64],
) -> Result<ArrayD<f64>, EvalError> {
    let rank = dest.ndim();
    if source.ndim() != rank || offsets.len() != rank || strides.len() != rank {
        return Err(EvalError::ShapeError(format!(
            "cannot insert {:?} into {:?}",
            source.shape(),
            dest.shape()
        )));
    }
    let mut out = dest.clone();
    let mut window = out.view_mut();
    for axis in 0..rank {
        let (offset, stride) = (offsets[axis], strides[axis]);
        let n = i64::try_from(source.shape()[axis]).unwrap_or(i64::MAX);
        let len = i64::try_from(dest.shape()[axis]).unwrap_or(i64::MAX);
        let end = if n == 0 { offset } else { offset + (n - 1) * stride + 1 };
        if offset < 0 || stride < 1 || end > len {
            return Err(out_of_bounds(format!(
                "slice {offset}..{end} step {stride} on axis {axis} of size {len}"
            )));
        }
        let slice = Slice::new(to_isize(offset)?, Some(to_isize(end)?), to_isize(stride)?);
        window.slice_axis_inplace(Axis(axis), slice);
    }
    window.assign(source);
    Ok(out)
}

/// The range `start..start + len` of `axis`.
///
/// # Errors
///
/// Returns [`EvalError::OutOfBounds`] when the range does not fit.
pub fn narrow(
    input: &ArrayD<f64>,
    axis: usize,
    start: i64,
    len: usize,
) -> Result<ArrayD<f64>, EvalError> {
    check_axis(input, axis)?;
    let size = input.shape()[axis];
    let start = usize::try_from(start)
        .ok()
        .filter(|s| s + len <= size)
        .ok_or_else(|| out_of_bounds(format!("narrow {start}+{len} of size {size}")))?;
    Ok(input
        .slice_axis(Axis(axis), Slice::from(start..start + len))
        .to_owned())
}

/// Sum over `axis`, keeping it with size one.
///
/// # Errors
///
/// Returns [`EvalError::OutOfBounds`] for an axis out of range.
pub fn sum_keepdim(input: &ArrayD<f64>, axis: usize) -> Result<ArrayD<f64>, EvalError> {
    check_axis(input, axis)?;
    Ok(input.sum_axis(Axis(axis)).insert_axis(Axis(axis)))
}

/// Removes the unit axis `axis`.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] if the axis is not of size one.
pub fn squeeze(input: &ArrayD<f64>, axis: usize) -> Result<ArrayD<f64>, EvalError> {
    check_axis(input, axis)?;
    if input.shape()[axis] != 1 {
        return Err(EvalError::ShapeError(format!(
            "cannot squeeze axis {axis} of size {}",
            input.shape()[axis]
        )));
    }
    Ok(input.index_axis(Axis(axis), 0).to_owned())
}

/// Inserts a unit axis at `axis`.
///
/// # Errors
///
/// Returns [`EvalError::OutOfBounds`] for a position past the rank.
pub fn unsqueeze(input: &ArrayD<f64>, axis: usize) -> Result<ArrayD<f64>, EvalError> {
    if axis > input.ndim() {
        return Err(out_of_bounds(format!(
            "unsqueeze at {axis} of a rank-{} tensor",
            input.ndim()
        )));
    }
    Ok(input.view().insert_axis(Axis(axis)).to_owned())
}

/// Loop bounds of a reduction, read off the operand axes that a map indexes
/// with a bare loop variable.
fn loop_bounds(indexing: &Indexing, operands: [&[usize]; 3]) -> Result<Vec<usize>, EvalError> {
    let mut bounds: Vec<Option<usize>> = vec![None; indexing.num_loops()];
    for (operand, (map, shape)) in indexing.maps.iter().zip(operands).enumerate() {
        if map.results().len() != shape.len() {
            return Err(EvalError::ShapeError(format!(
                "operand {operand} has rank {}, its map has {} results",
                shape.len(),
                map.results().len()
            )));
        }
        for (expr, &size) in map.results().iter().zip(shape) {
            let Some(d) = expr.as_dim() else { continue };
            let bound = bounds
                .get_mut(d)
                .ok_or_else(|| EvalError::ShapeError(format!("map reads loop {d}")))?;
            match *bound {
                Some(prev) if prev != size => {
                    return Err(EvalError::ShapeError(format!(
                        "loop {d} bound by both {prev} and {size}"
                    )))
                }
                _ => *bound = Some(size),
            }
        }
    }
    bounds
        .into_iter()
        .enumerate()
        .map(|(d, b)| b.ok_or_else(|| EvalError::ShapeError(format!("loop {d} is unbounded"))))
        .collect()
}

fn position(point: &[i64], shape: &[usize]) -> Option<Vec<usize>> {
    point
        .iter()
        .zip(shape)
        .map(|(&i, &n)| usize::try_from(i).ok().filter(|&i| i < n))
        .collect()
}

/// Runs a reduction: for every point of the iteration space,
/// `out[o] += combine(lhs[l], rhs[r])` where the maps of `indexing` give
/// `l`, `r` and `o`.
///
/// # Errors
///
/// Returns [`EvalError::ShapeError`] when the operands do not bound every
/// loop consistently, and [`EvalError::OutOfBounds`] when a map reads past
/// an operand.
pub fn reduce(
    indexing: &Indexing,
    combine: Combine,
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    zero_points: (f64, f64),
    mut init: ArrayD<f64>,
) -> Result<ArrayD<f64>, EvalError> {
    let bounds = loop_bounds(indexing, [lhs.shape(), rhs.shape(), init.shape()])?;
    if bounds.iter().any(|&b| b == 0) {
        return Ok(init);
    }
    let bounds: Vec<i64> = bounds
        .into_iter()
        .map(|b| i64::try_from(b).unwrap_or(i64::MAX))
        .collect();
    let [l_map, r_map, o_map] = [&indexing.maps[0], &indexing.maps[1], &indexing.maps[2]];
    let (zl, zr) = zero_points;
    let mut point = vec![0i64; bounds.len()];
    loop {
        let l = l_map.eval(&point);
        let r = r_map.eval(&point);
        let o = o_map.eval(&point);
        let (Some(l), Some(r), Some(o)) = (
            position(&l, lhs.shape()),
            position(&r, rhs.shape()),
            position(&o, init.shape()),
        ) else {
            return Err(out_of_bounds(format!("reduction point {point:?}")));
        };
        let (a, b) = (lhs[l.as_slice()], rhs[r.as_slice()]);
        let product = match combine {
            Combine::MulAdd => a * b,
            Combine::QuantizedMulAdd => (a - zl) * (b - zr),
        };
        init[o.as_slice()] += product;

        // odometer step, innermost loop fastest
        let mut d = bounds.len();
        loop {
            if d == 0 {
                return Ok(init);
            }
            d -= 1;
            point[d] += 1;
            if point[d] < bounds[d] {
                break;
            }
            point[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lin_ir::NamedKernel;
    use ndarray::{arr1, arr2, ArrayD};
    use proptest::prelude::*;

    fn dynamic<D: ndarray::Dimension>(a: ndarray::Array<f64, D>) -> ArrayD<f64> {
        a.into_dyn()
    }

    fn values(a: &ArrayD<f64>) -> Vec<f64> {
        a.iter().copied().collect()
    }

    // === Broadcast ===

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[2, 1], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shape(&[], &[4]).unwrap(), vec![4]);
        assert!(broadcast_shape(&[2], &[3]).is_err());
    }

    #[test]
    fn test_broadcast_added() {
        let bias = dynamic(arr1(&[1.0, 2.0]));
        let out = broadcast_added(&bias, &[3, 2, 2], &[0, 2]).unwrap();
        assert_eq!(out.shape(), &[3, 2, 2]);
        assert_eq!(out[[2, 1, 0]], 2.0);
        assert_eq!(out[[0, 0, 1]], 1.0);
    }

    // === Layout ===

    #[test]
    fn test_pad_and_insert() {
        let x = dynamic(arr2(&[[1.0, 2.0]]));
        let padded = pad(&x, &[0, 1], &[1, 1], 9.0).unwrap();
        assert_eq!(padded.shape(), &[2, 4]);
        assert_eq!(
            values(&padded),
            vec![9.0, 1.0, 2.0, 9.0, 9.0, 9.0, 9.0, 9.0]
        );

        let dest = ArrayD::zeros(IxDyn(&[1, 5]));
        let out = insert_slice(&x, &dest, &[0, 1], &[1, 2]).unwrap();
        assert_eq!(values(&out), vec![0.0, 1.0, 0.0, 2.0, 0.0]);
        assert!(insert_slice(&x, &dest, &[0, 3], &[1, 2]).is_err());
    }

    #[test]
    fn test_flip_and_narrow() {
        let x = dynamic(arr1(&[1.0, 2.0, 3.0]));
        assert_eq!(values(&flip(&x, &[0]).unwrap()), vec![3.0, 2.0, 1.0]);
        assert_eq!(values(&narrow(&x, 0, 1, 2).unwrap()), vec![2.0, 3.0]);
        assert!(narrow(&x, 0, 2, 2).is_err());
    }

    // === Reduction ===

    #[test]
    fn test_matmul_reduction() {
        let a = dynamic(arr2(&[[1.0, 2.0], [3.0, 4.0]]));
        let b = dynamic(arr2(&[[5.0, 6.0], [7.0, 8.0]]));
        let init = ArrayD::zeros(IxDyn(&[2, 2]));
        let out = reduce(
            &NamedKernel::Matmul.indexing(),
            Combine::MulAdd,
            &a,
            &b,
            (0.0, 0.0),
            init,
        )
        .unwrap();
        assert_eq!(values(&out), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_quantized_dot() {
        let a = dynamic(arr1(&[3.0, 4.0]));
        let b = dynamic(arr1(&[1.0, 2.0]));
        let init = ArrayD::zeros(IxDyn(&[]));
        let out = reduce(
            &NamedKernel::Dot.indexing(),
            Combine::QuantizedMulAdd,
            &a,
            &b,
            (1.0, 1.0),
            init,
        )
        .unwrap();
        // (3-1)(1-1) + (4-1)(2-1)
        assert_eq!(out[IxDyn(&[])], 3.0);
    }

    #[test]
    fn test_inconsistent_bounds() {
        let a = dynamic(arr2(&[[1.0, 2.0, 3.0]]));
        let b = dynamic(arr2(&[[1.0], [2.0]]));
        let init = ArrayD::zeros(IxDyn(&[1, 1]));
        let err = reduce(
            &NamedKernel::Matmul.indexing(),
            Combine::MulAdd,
            &a,
            &b,
            (0.0, 0.0),
            init,
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::ShapeError(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_batch_matmul_matches_einsum(
            (batch, m, k, n) in (1usize..4, 1usize..4, 1usize..4, 1usize..4),
            seed in proptest::collection::vec(-8i32..8, 64),
            zl in -3i32..3,
            zr in -3i32..3,
        ) {
            let take = |offset: usize, shape: &[usize]| {
                let len: usize = shape.iter().product();
                let data = seed[offset..offset + len].iter().map(|&v| f64::from(v)).collect();
                ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
            };
            let a = take(0, &[batch, m, k]);
            let b = take(32, &[batch, k, n]);
            let (zl, zr) = (f64::from(zl), f64::from(zr));
            let out = reduce(
                &NamedKernel::QuantizedBatchMatmul.indexing(),
                Combine::QuantizedMulAdd,
                &a,
                &b,
                (zl, zr),
                ArrayD::zeros(IxDyn(&[batch, m, n])),
            )
            .unwrap();

            // out[b, i, j] = sum_p (a[b, i, p] - zl) * (b[b, p, j] - zr)
            for bi in 0..batch {
                for i in 0..m {
                    for j in 0..n {
                        let want: f64 = (0..k)
                            .map(|p| (a[[bi, i, p]] - zl) * (b[[bi, p, j]] - zr))
                            .sum();
                        prop_assert_eq!(out[[bi, i, j]], want);
                    }
                }
            }
        }
    }
}
