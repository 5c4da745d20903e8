//! End-to-end tests for trilinear contraction and flip.

mod common;

use common::*;
use lin_ir::{Attr, DType, FlipOp, Graph, LinearOp, TrilinearOp};
use lin_lower::LowerConfig;
use ndarray::{ArrayD, Axis};

struct Case<'a> {
    shapes: [&'a [usize]; 3],
    expand: [&'a [usize]; 3],
    sum_dim: &'a [usize],
    unroll_dim: i64,
}

fn check_trilinear(case: &Case<'_>) {
    let inputs: Vec<ArrayD<f64>> = case
        .shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| filled(shape, i + 1))
        .collect();
    let want = naive_trilinear(
        [&inputs[0], &inputs[1], &inputs[2]],
        case.expand,
        case.sum_dim,
    );

    let mut g = Graph::new();
    let names = ["i1", "i2", "i3"];
    let ids = [0, 1, 2].map(|i| g.input(names[i], static_type(DType::Float32, case.shapes[i])));
    let to_i64 = |axes: &[usize]| -> Vec<i64> {
        axes.iter().map(|&a| i64::try_from(a).unwrap()).collect()
    };
    host(
        &mut g,
        LinearOp::Trilinear(TrilinearOp {
            inputs: ids,
            expand: case.expand.map(|axes| Attr::Const(to_i64(axes))),
            sum_dim: Attr::Const(to_i64(case.sum_dim)),
            unroll_dim: Attr::Const(case.unroll_dim),
        }),
        static_type(DType::Float32, want.shape()),
    );
    lower(&mut g, &LowerConfig::default());

    let got = run(
        &g,
        names
            .iter()
            .zip(&inputs)
            .map(|(&name, data)| (name, tensor(DType::Float32, data)))
            .collect(),
    )
    .unwrap();
    assert_close(&got, &want);
}

// === Trilinear ===

#[test]
fn test_bilinear_form_unrolled_over_batch() {
    // out[b, k] = sum_j i1[b, j] * i2[b, k] * w[j, k]
    check_trilinear(&Case {
        shapes: [&[2, 3], &[2, 4], &[3, 4]],
        expand: [&[2], &[1], &[0]],
        sum_dim: &[1],
        unroll_dim: 0,
    });
}

#[test]
fn test_summed_unroll_axis() {
    check_trilinear(&Case {
        shapes: [&[3], &[3], &[3]],
        expand: [&[], &[], &[]],
        sum_dim: &[0],
        unroll_dim: 0,
    });
}

#[test]
fn test_sums_before_and_after_third_operand() {
    // i3 is expanded on axis 1, so that sum happens before it joins
    check_trilinear(&Case {
        shapes: [&[2, 3, 4], &[2, 3, 4], &[2, 4]],
        expand: [&[], &[], &[1]],
        sum_dim: &[1, 2],
        unroll_dim: 0,
    });
}

#[test]
fn test_unroll_axis_broadcasts_from_unit_size() {
    check_trilinear(&Case {
        shapes: [&[1, 3], &[2, 3], &[2, 3]],
        expand: [&[], &[], &[]],
        sum_dim: &[1],
        unroll_dim: 0,
    });
}

#[test]
fn test_unit_unroll_size_summed() {
    check_trilinear(&Case {
        shapes: [&[1, 3], &[1, 3], &[1, 3]],
        expand: [&[], &[], &[]],
        sum_dim: &[0, 1],
        unroll_dim: 0,
    });
}

#[test]
fn test_unit_unroll_size_unsummed() {
    check_trilinear(&Case {
        shapes: [&[1, 3], &[1, 3], &[1, 3]],
        expand: [&[], &[], &[]],
        sum_dim: &[1],
        unroll_dim: 0,
    });
}

#[test]
fn test_unroll_axis_of_size_zero() {
    let mut g = Graph::new();
    let ids = ["a", "b", "c"].map(|name| g.input(name, static_type(DType::Float32, &[0])));
    host(
        &mut g,
        LinearOp::Trilinear(TrilinearOp {
            inputs: ids,
            expand: [vec![], vec![], vec![]].map(Attr::Const),
            sum_dim: Attr::Const(vec![0]),
            unroll_dim: Attr::Const(0),
        }),
        static_type(DType::Float32, &[]),
    );
    lower(&mut g, &LowerConfig::default());
    let empty = array(&[0], vec![]);
    let got = run(
        &g,
        ["a", "b", "c"]
            .into_iter()
            .map(|name| (name, tensor(DType::Float32, &empty)))
            .collect(),
    )
    .unwrap();
    assert_eq!(got.shape(), &[] as &[usize]);
    assert_eq!(got.to_vec(), vec![0.0]);
}

// === Flip ===

#[test]
fn test_flip_reverses_selected_axes() {
    let data = filled(&[2, 3, 4], 9);
    let mut g = Graph::new();
    let x = g.input("x", static_type(DType::Float32, &[2, 3, 4]));
    host(
        &mut g,
        LinearOp::Flip(FlipOp {
            input: x,
            dims: Attr::Const(vec![-1, 0]),
        }),
        static_type(DType::Float32, &[2, 3, 4]),
    );
    lower(&mut g, &LowerConfig::default());
    let got = run(&g, vec![("x", tensor(DType::Float32, &data))]).unwrap();

    let mut want = data.clone();
    want.invert_axis(Axis(0));
    want.invert_axis(Axis(2));
    assert_close(&got, &want.as_standard_layout().to_owned());
}
