//! Shared helpers for the end-to-end tests: graph construction, lowering
//! plus evaluation, and naive reference implementations.

#![allow(dead_code)]
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use lin_eval::{kernels, EvalError, Evaluator, Tensor};
use lin_ir::{
    DType, Dim, Graph, LinearOp, Op, ScalarValue, Shape, TensorType, ValueId, ValueType,
};
use lin_lower::{lower_graph, ConversionReport, LowerConfig};
use ndarray::{ArrayD, Axis, Dimension, IxDyn};

// === Graph Construction ===

pub fn static_type(dtype: DType, dims: &[usize]) -> TensorType {
    TensorType::new(dtype, Shape::from_static(dims.iter().copied()))
}

pub fn dynamic_type(dtype: DType, dims: &[Option<usize>]) -> TensorType {
    TensorType::new(
        dtype,
        Shape::new(dims.iter().map(|d| d.map_or(Dim::Dynamic, Dim::Static))),
    )
}

/// Adds a host operator producing `result` and makes it the graph output.
pub fn host(g: &mut Graph, op: LinearOp, result: TensorType) -> ValueId {
    let id = g.push(Op::Linear(op), ValueType::Tensor(result));
    g.set_outputs([id]);
    id
}

/// Wraps integer storage with a constant zero-point.
pub fn quantized(g: &mut Graph, storage: ValueId, zero_point: i64) -> ValueId {
    let zp = g.constant(ScalarValue::Int(zero_point), ValueType::Scalar(DType::Int64));
    let ty = g.ty(storage).unwrap().clone();
    g.push(
        Op::MakeQuantized {
            storage,
            scale: 0.25,
            zero_point: zp,
        },
        ty,
    )
}

/// Lowers every host operator and checks that nothing was left behind.
pub fn lower(g: &mut Graph, config: &LowerConfig) -> ConversionReport {
    let report = lower_graph(g, config).unwrap();
    assert!(report.is_complete(), "{report}");
    assert!(g.host_ops().is_empty());
    g.verify().unwrap();
    report
}

/// Evaluates `g` and returns its single tensor output.
pub fn run(g: &Graph, inputs: Vec<(&str, Tensor)>) -> Result<Tensor, EvalError> {
    let evaluator = inputs
        .into_iter()
        .fold(Evaluator::new(), |ev, (name, t)| ev.with_input(name, t));
    let mut outputs = evaluator.run(g)?;
    assert_eq!(outputs.len(), 1);
    outputs.remove(0).into_tensor()
}

// === Data ===

/// Deterministic small integral values in `[-5, 5]`.
pub fn pattern(n: usize, seed: usize) -> Vec<f64> {
    (0..n)
        .map(|i| ((i * 7 + seed * 3 + 1) % 11) as f64 - 5.0)
        .collect()
}

pub fn array(shape: &[usize], values: Vec<f64>) -> ArrayD<f64> {
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
}

pub fn filled(shape: &[usize], seed: usize) -> ArrayD<f64> {
    array(shape, pattern(shape.iter().product(), seed))
}

pub fn tensor(dtype: DType, data: &ArrayD<f64>) -> Tensor {
    Tensor::new(dtype, data.clone())
}

pub fn assert_close(got: &Tensor, want: &ArrayD<f64>) {
    assert_eq!(got.shape(), want.shape(), "shape");
    for (i, (a, b)) in got.data().iter().zip(want.iter()).enumerate() {
        assert!((a - b).abs() < 1e-4, "element {i}: got {a}, want {b}");
    }
}

// === References ===

/// Matrix product with numpy rank rules: vector operands gain and then lose
/// a unit axis, batch axes broadcast.
pub fn naive_matmul(a: &ArrayD<f64>, b: &ArrayD<f64>) -> ArrayD<f64> {
    let (a_vec, b_vec) = (a.ndim() == 1, b.ndim() == 1);
    let a = if a_vec { a.clone().insert_axis(Axis(0)) } else { a.clone() };
    let b = if b_vec { b.clone().insert_axis(Axis(1)) } else { b.clone() };
    let (ra, rb) = (a.ndim(), b.ndim());
    let batch = kernels::broadcast_shape(&a.shape()[..ra - 2], &b.shape()[..rb - 2]).unwrap();
    let (m, k, n) = (a.shape()[ra - 2], a.shape()[ra - 1], b.shape()[rb - 1]);
    let with = |tail: [usize; 2]| -> Vec<usize> { batch.iter().copied().chain(tail).collect() };
    let a = a.broadcast(IxDyn(&with([m, k]))).unwrap().to_owned();
    let b = b.broadcast(IxDyn(&with([k, n]))).unwrap().to_owned();

    let rank = batch.len() + 2;
    let mut out = ArrayD::zeros(IxDyn(&with([m, n])));
    for (idx, slot) in out.indexed_iter_mut() {
        let idx = idx.slice();
        let mut acc = 0.0;
        for p in 0..k {
            let mut ia = idx.to_vec();
            ia[rank - 1] = p;
            let mut ib = idx.to_vec();
            ib[rank - 2] = p;
            acc += a[ia.as_slice()] * b[ib.as_slice()];
        }
        *slot = acc;
    }
    if b_vec {
        let axis = out.ndim() - 1;
        out = out.index_axis_move(Axis(axis), 0);
    }
    if a_vec {
        let axis = if b_vec { out.ndim() - 1 } else { out.ndim() - 2 };
        out = out.index_axis_move(Axis(axis), 0);
    }
    out
}

/// Convolution attributes for the references.
#[derive(Clone, Debug)]
pub struct Geometry {
    pub stride: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
    pub output_padding: Vec<i64>,
    pub groups: usize,
}

impl Geometry {
    pub fn unit(spatial: usize) -> Self {
        Self {
            stride: vec![1; spatial],
            padding: vec![0; spatial],
            dilation: vec![1; spatial],
            output_padding: vec![0; spatial],
            groups: 1,
        }
    }
}

/// Channel-first grouped convolution: input `[n, c, ..]`, weight
/// `[f, c/groups, k..]`.
pub fn naive_conv(
    input: &ArrayD<f64>,
    weight: &ArrayD<f64>,
    bias: Option<&[f64]>,
    geo: &Geometry,
) -> ArrayD<f64> {
    let spatial = input.ndim() - 2;
    let (n, c, f) = (input.shape()[0], input.shape()[1], weight.shape()[0]);
    let (cg, fg) = (c / geo.groups, f / geo.groups);
    let kernel = weight.shape()[2..].to_vec();
    let mut shape = vec![n, f];
    for i in 0..spatial {
        let (size, k) = (input.shape()[i + 2] as i64, kernel[i] as i64);
        let span = size + 2 * geo.padding[i] - geo.dilation[i] * (k - 1) - 1;
        shape.push((span / geo.stride[i] + 1) as usize);
    }

    let mut out = ArrayD::zeros(IxDyn(&shape));
    for (idx, slot) in out.indexed_iter_mut() {
        let idx = idx.slice();
        let (batch, fo) = (idx[0], idx[1]);
        let group = fo / fg;
        let mut acc = bias.map_or(0.0, |bias| bias[fo]);
        for ci in 0..cg {
            for kidx in ndarray::indices(IxDyn(&kernel)) {
                let kidx = kidx.slice();
                let mut pos = vec![batch, group * cg + ci];
                let inside = (0..spatial).all(|i| {
                    let p = idx[i + 2] as i64 * geo.stride[i] + kidx[i] as i64 * geo.dilation[i]
                        - geo.padding[i];
                    pos.push(p.max(0) as usize);
                    p >= 0 && p < input.shape()[i + 2] as i64
                });
                if !inside {
                    continue;
                }
                let mut w = vec![fo, ci];
                w.extend_from_slice(kidx);
                acc += input[pos.as_slice()] * weight[w.as_slice()];
            }
        }
        *slot = acc;
    }
    out
}

/// Ungrouped transposed convolution: input `[n, c, ..]`, weight
/// `[c, f, k..]`. Every input element scatters into the output.
pub fn naive_conv_transpose(
    input: &ArrayD<f64>,
    weight: &ArrayD<f64>,
    bias: Option<&[f64]>,
    geo: &Geometry,
) -> ArrayD<f64> {
    let spatial = input.ndim() - 2;
    let (n, f) = (input.shape()[0], weight.shape()[1]);
    let kernel = weight.shape()[2..].to_vec();
    let mut shape = vec![n, f];
    for i in 0..spatial {
        let (size, k) = (input.shape()[i + 2] as i64, kernel[i] as i64);
        let out = (size - 1) * geo.stride[i] - 2 * geo.padding[i]
            + geo.dilation[i] * (k - 1)
            + geo.output_padding[i]
            + 1;
        shape.push(out as usize);
    }

    let mut out = ArrayD::zeros(IxDyn(&shape));
    for (idx, &x) in input.indexed_iter() {
        let idx = idx.slice();
        for fo in 0..f {
            for kidx in ndarray::indices(IxDyn(&kernel)) {
                let kidx = kidx.slice();
                let mut pos = vec![idx[0], fo];
                let inside = (0..spatial).all(|i| {
                    let p = idx[i + 2] as i64 * geo.stride[i] + kidx[i] as i64 * geo.dilation[i]
                        - geo.padding[i];
                    pos.push(p.max(0) as usize);
                    p >= 0 && p < shape[i + 2] as i64
                });
                if !inside {
                    continue;
                }
                let mut w = vec![idx[1], fo];
                w.extend_from_slice(kidx);
                out[pos.as_slice()] += x * weight[w.as_slice()];
            }
        }
    }
    if let Some(bias) = bias {
        for (idx, slot) in out.indexed_iter_mut() {
            *slot += bias[idx[1]];
        }
    }
    out
}

/// Product of three tensors after inserting their expanded axes, summed
/// over `sum_dims`.
pub fn naive_trilinear(
    inputs: [&ArrayD<f64>; 3],
    expand: [&[usize]; 3],
    sum_dims: &[usize],
) -> ArrayD<f64> {
    let aligned: Vec<ArrayD<f64>> = inputs
        .into_iter()
        .zip(expand)
        .map(|(input, axes)| {
            axes.iter()
                .fold(input.clone(), |acc, &axis| acc.insert_axis(Axis(axis)))
        })
        .collect();
    let shape = kernels::broadcast_shape(aligned[0].shape(), aligned[1].shape()).unwrap();
    let shape = kernels::broadcast_shape(&shape, aligned[2].shape()).unwrap();
    let view = |a: &ArrayD<f64>| a.broadcast(IxDyn(&shape)).unwrap().to_owned();
    let mut product = view(&aligned[0]) * view(&aligned[1]) * view(&aligned[2]);
    let mut sums = sum_dims.to_vec();
    sums.sort_unstable();
    for &axis in sums.iter().rev() {
        product = product.sum_axis(Axis(axis));
    }
    product
}
