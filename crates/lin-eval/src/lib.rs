//! # Lin Eval
//!
//! A reference evaluator for lin IR graphs. It runs a lowered graph on
//! concrete tensors so that every lowering can be checked numerically
//! against a naive implementation of the operator it replaced.
//!
//! ## Overview
//!
//! Nodes are evaluated in schedule order into an [`Env`]. Tensors are dense
//! `ndarray` arrays of `f64` whose elements are kept representable in the
//! tensor's element type (integers wrap at their width). Guards are checked
//! when reached: a failing guard aborts the run with
//! [`EvalError::GuardFailed`].
//!
//! Host operators that were never lowered are not evaluated; reaching one is
//! an [`EvalError::Unlowered`].
//!
//! ## Example
//!
//! ```ignore
//! let outputs = Evaluator::new()
//!     .with_input("a", a)
//!     .with_input("b", b)
//!     .run(&graph)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod env;
pub mod kernels;
mod value;

pub use env::Env;
pub use value::{normalize, reinterpret_signed, RtValue, Tensor};

use lin_ir::{
    CastKind, DType, Dim, ElementwiseOp, Graph, GuardCond, IrError, LinearKind, Node, Op,
    TensorType, ValueId, ValueType,
};
use ndarray::ArrayD;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that can occur during evaluation.
#[derive(Clone, Debug, Error)]
pub enum EvalError {
    /// A run-time guard did not hold.
    #[error("guard failed: {message}")]
    GuardFailed {
        /// The guard's message.
        message: String,
    },

    /// A graph input was not supplied.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A value was read before it was computed.
    #[error("unbound value {0}")]
    Unbound(ValueId),

    /// A value has the wrong kind or element type.
    #[error("type error: expected {expected}, got {got}")]
    TypeError {
        /// What was expected.
        expected: String,
        /// What was found.
        got: String,
    },

    /// Shapes do not fit together.
    #[error("shape error: {0}")]
    ShapeError(String),

    /// An index or slice lies outside a tensor.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Integer division by zero in index arithmetic.
    #[error("division by zero")]
    DivisionByZero,

    /// A host operator survived lowering.
    #[error("host operator {kind} was not lowered")]
    Unlowered {
        /// The operator kind.
        kind: LinearKind,
    },

    /// The graph is malformed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Evaluates graphs on concrete inputs.
#[derive(Clone, Debug, Default)]
pub struct Evaluator {
    inputs: FxHashMap<String, Tensor>,
}

impl Evaluator {
    /// Creates an evaluator without inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies the graph input `name`.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }

    /// Runs `graph` and returns the values of its outputs.
    ///
    /// # Errors
    ///
    /// Returns the first error any node raises.
    pub fn run(&self, graph: &Graph) -> Result<Vec<RtValue>, EvalError> {
        let env = self.run_env(graph)?;
        graph
            .outputs()
            .iter()
            .map(|&id| env.get(id).cloned())
            .collect()
    }

    /// Runs `graph` and returns every computed value.
    ///
    /// # Errors
    ///
    /// Returns the first error any node raises.
    pub fn run_env(&self, graph: &Graph) -> Result<Env, EvalError> {
        let mut env = Env::new();
        for (id, node) in graph.iter() {
            trace!(%id, op = node.op.name(), "eval");
            let value = self.eval_node(&env, node)?;
            env.insert(id, value);
        }
        debug!(values = env.len(), "evaluation finished");
        Ok(env)
    }

    fn eval_node(&self, env: &Env, node: &Node) -> Result<RtValue, EvalError> {
        let tensor = |data: ArrayD<f64>| -> Result<RtValue, EvalError> {
            let dtype = result_dtype(&node.ty)?;
            Ok(RtValue::Tensor(Tensor::new(dtype, data)))
        };
        match &node.op {
            Op::Input { name } => {
                let given = self
                    .inputs
                    .get(name)
                    .ok_or_else(|| EvalError::MissingInput(name.clone()))?;
                check_tensor(given, &node.ty)?;
                Ok(RtValue::Tensor(given.clone()))
            }
            Op::Constant(value) => Ok(match node.ty {
                ValueType::Index => RtValue::Index(integral(value.as_f64())),
                ValueType::Scalar(dtype) => RtValue::Scalar {
                    dtype,
                    value: normalize(dtype, value.as_f64()),
                },
                _ => {
                    return Err(EvalError::TypeError {
                        expected: "index or scalar constant".into(),
                        got: "tensor".into(),
                    })
                }
            }),
            // the zero-point is consumed explicitly by the lowered kernels
            Op::MakeQuantized { storage, .. } => Ok(env.get(*storage)?.clone()),
            Op::Linear(op) => Err(EvalError::Unlowered { kind: op.kind() }),

            Op::Dim { source, axis } => {
                let shape = env.tensor(*source)?.shape();
                let n = shape.get(*axis).ok_or_else(|| {
                    EvalError::OutOfBounds(format!("axis {axis} of rank {}", shape.len()))
                })?;
                Ok(RtValue::Index(i64::try_from(*n).unwrap_or(i64::MAX)))
            }
            Op::Arith { op, lhs, rhs } => {
                let (a, b) = (integral(env.number(*lhs)?), integral(env.number(*rhs)?));
                let n = op.apply(a, b).ok_or(EvalError::DivisionByZero)?;
                Ok(match node.ty {
                    ValueType::Scalar(dtype) => RtValue::Scalar {
                        dtype,
                        value: normalize(dtype, to_f64(n)),
                    },
                    _ => RtValue::Index(n),
                })
            }
            Op::ScalarCast { value } => {
                let x = env.number(*value)?;
                Ok(match node.ty {
                    ValueType::Scalar(dtype) => RtValue::Scalar {
                        dtype,
                        value: normalize(dtype, x),
                    },
                    _ => RtValue::Index(integral(x)),
                })
            }
            Op::Guard(guard) => {
                let holds = match guard.cond {
                    GuardCond::Eq(a, b) => env.index(a)? == env.index(b)?,
                    GuardCond::Divisible { value, divisor } => {
                        let d = env.index(divisor)?;
                        d != 0 && env.index(value)? % d == 0
                    }
                    GuardCond::Broadcastable { size, target } => {
                        let s = env.index(size)?;
                        s == 1 || s == env.index(target)?
                    }
                };
                if holds {
                    Ok(RtValue::Unit)
                } else {
                    Err(EvalError::GuardFailed {
                        message: guard.message.clone(),
                    })
                }
            }

            Op::Fill { sizes, value } => {
                let sizes = sizes_of(env, sizes)?;
                tensor(ArrayD::from_elem(sizes, env.number(*value)?))
            }
            Op::Broadcast {
                input,
                sizes,
                added,
            } => {
                let sizes = sizes_of(env, sizes)?;
                tensor(kernels::broadcast_added(
                    env.tensor(*input)?.data(),
                    &sizes,
                    added,
                )?)
            }
            Op::BroadcastTo { input, sizes } => {
                let sizes = sizes_of(env, sizes)?;
                tensor(kernels::broadcast_view(env.tensor(*input)?.data(), &sizes)?)
            }

            Op::Transpose { input, perm } => {
                let data = env.tensor(*input)?.data();
                perm.validate(data.ndim())?;
                tensor(data.view().permuted_axes(perm.as_slice()).to_owned())
            }
            Op::Flip { input, axes } => tensor(kernels::flip(env.tensor(*input)?.data(), axes)?),
            Op::ExpandShape { input, sizes, .. } => {
                let sizes = sizes_of(env, sizes)?;
                tensor(kernels::reshape(env.tensor(*input)?.data(), &sizes)?)
            }
            Op::CollapseShape {
                input,
                reassociation,
            } => {
                let data = env.tensor(*input)?.data();
                reassociation.validate(data.ndim())?;
                let sizes: Vec<usize> = reassociation
                    .groups()
                    .iter()
                    .map(|group| group.iter().map(|&axis| data.shape()[axis]).product())
                    .collect();
                tensor(kernels::reshape(data, &sizes)?)
            }
            Op::Pad {
                input,
                low,
                high,
                value,
            } => tensor(kernels::pad(
                env.tensor(*input)?.data(),
                low,
                high,
                env.number(*value)?,
            )?),
            Op::InsertSlice {
                source,
                dest,
                offsets,
                strides,
            } => {
                let offsets = offsets
                    .iter()
                    .map(|&o| env.index(o))
                    .collect::<Result<Vec<_>, _>>()?;
                tensor(kernels::insert_slice(
                    env.tensor(*source)?.data(),
                    env.tensor(*dest)?.data(),
                    &offsets,
                    strides,
                )?)
            }
            Op::Narrow {
                input,
                axis,
                start,
                len,
            } => tensor(kernels::narrow(
                env.tensor(*input)?.data(),
                *axis,
                *start,
                *len,
            )?),
            Op::Squeeze { input, axis } => {
                tensor(kernels::squeeze(env.tensor(*input)?.data(), *axis)?)
            }
            Op::Unsqueeze { input, axis } => {
                tensor(kernels::unsqueeze(env.tensor(*input)?.data(), *axis)?)
            }

            Op::Elementwise { op, lhs, rhs } => {
                let a = env.tensor(*lhs)?.data();
                let f: fn(f64, f64) -> f64 = match op {
                    ElementwiseOp::Add => |x, y| x + y,
                    ElementwiseOp::Mul => |x, y| x * y,
                };
                match env.get(*rhs)? {
                    RtValue::Tensor(b) => tensor(kernels::zip_with(a, b.data(), f)?),
                    _ => {
                        let y = env.number(*rhs)?;
                        tensor(a.mapv(|x| f(x, y)))
                    }
                }
            }
            Op::Sum { input, axis } => {
                tensor(kernels::sum_keepdim(env.tensor(*input)?.data(), *axis)?)
            }
            Op::Convert { input } => tensor(env.tensor(*input)?.data().clone()),
            Op::Cast { input } => {
                let value = env.tensor(*input)?;
                check_tensor(value, &node.ty)?;
                Ok(RtValue::Tensor(value.clone()))
            }
            Op::Reduce {
                spec,
                lhs,
                rhs,
                zero_points,
                init,
            } => {
                let extend = |t: &Tensor| match spec.cast {
                    CastKind::Signed => t.data().mapv(|x| reinterpret_signed(t.dtype(), x)),
                    CastKind::Unsigned => t.data().clone(),
                };
                let zero_points = match zero_points {
                    Some([a, b]) => (env.number(*a)?, env.number(*b)?),
                    None if spec.is_quantized() => {
                        return Err(EvalError::TypeError {
                            expected: "zero-points for a quantized kernel".into(),
                            got: "none".into(),
                        })
                    }
                    None => (0.0, 0.0),
                };
                let out = kernels::reduce(
                    &spec.indexing(),
                    spec.combine,
                    &extend(env.tensor(*lhs)?),
                    &extend(env.tensor(*rhs)?),
                    zero_points,
                    env.tensor(*init)?.data().clone(),
                )?;
                tensor(out)
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn integral(x: f64) -> i64 {
    x as i64
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(n: i64) -> f64 {
    n as f64
}

fn result_dtype(ty: &ValueType) -> Result<DType, EvalError> {
    ty.as_tensor()
        .map(|t| t.dtype)
        .ok_or_else(|| EvalError::TypeError {
            expected: "tensor result".into(),
            got: format!("{ty:?}"),
        })
}

fn sizes_of(env: &Env, sizes: &[ValueId]) -> Result<Vec<usize>, EvalError> {
    sizes
        .iter()
        .map(|&s| {
            let n = env.index(s)?;
            usize::try_from(n).map_err(|_| EvalError::ShapeError(format!("negative size {n}")))
        })
        .collect()
}

/// Checks a tensor against a declared type: element type, rank and every
/// static size.
fn check_tensor(value: &Tensor, ty: &ValueType) -> Result<(), EvalError> {
    let Some(TensorType { dtype, shape }) = ty.as_tensor() else {
        return Err(EvalError::TypeError {
            expected: format!("{ty:?}"),
            got: "tensor".into(),
        });
    };
    if value.dtype() != *dtype {
        return Err(EvalError::TypeError {
            expected: dtype.to_string(),
            got: value.dtype().to_string(),
        });
    }
    let fits = value.shape().len() == shape.rank()
        && shape
            .dims()
            .iter()
            .zip(value.shape())
            .all(|(dim, &n)| match dim {
                Dim::Static(s) => *s == n,
                Dim::Dynamic => true,
            });
    if fits {
        Ok(())
    } else {
        Err(EvalError::ShapeError(format!(
            "{:?} does not fit declared shape {:?}",
            value.shape(),
            shape.dims()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lin_ir::{ArithOp, Guard, ScalarValue, Shape};

    fn f32_tensor(shape: &[usize], values: Vec<f64>) -> Tensor {
        Tensor::from_vec(DType::Float32, shape, values).unwrap()
    }

    fn index(g: &mut Graph, n: i64) -> ValueId {
        g.constant(ScalarValue::Int(n), ValueType::Index)
    }

    // === Inputs ===

    #[test]
    fn test_missing_input() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        g.set_outputs([x]);
        assert!(matches!(
            Evaluator::new().run(&g),
            Err(EvalError::MissingInput(name)) if name == "x"
        ));
    }

    #[test]
    fn test_input_shape_checked() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        g.set_outputs([x]);
        let err = Evaluator::new()
            .with_input("x", f32_tensor(&[3], vec![0.0; 3]))
            .run(&g)
            .unwrap_err();
        assert!(matches!(err, EvalError::ShapeError(_)));
    }

    // === Index Arithmetic and Guards ===

    #[test]
    fn test_arith_and_guard() {
        let mut g = Graph::new();
        let x = g.input(
            "x",
            TensorType::new(DType::Float32, Shape::new([Dim::Dynamic])),
        );
        let n = g.push(Op::Dim { source: x, axis: 0 }, ValueType::Index);
        let two = index(&mut g, 2);
        let half = g.push(
            Op::Arith {
                op: ArithOp::FloorDiv,
                lhs: n,
                rhs: two,
            },
            ValueType::Index,
        );
        g.push(
            Op::Guard(Guard {
                cond: GuardCond::Divisible {
                    value: n,
                    divisor: two,
                },
                message: "odd size".into(),
            }),
            ValueType::Unit,
        );
        g.set_outputs([half]);

        let out = Evaluator::new()
            .with_input("x", f32_tensor(&[6], vec![0.0; 6]))
            .run(&g)
            .unwrap();
        assert_eq!(out, vec![RtValue::Index(3)]);

        let err = Evaluator::new()
            .with_input("x", f32_tensor(&[5], vec![0.0; 5]))
            .run(&g)
            .unwrap_err();
        assert!(matches!(err, EvalError::GuardFailed { message } if message == "odd size"));
    }

    #[test]
    fn test_scalar_arith_wraps() {
        let mut g = Graph::new();
        let zp = g.constant(ScalarValue::Int(200), ValueType::Scalar(DType::Int32));
        let offset = g.constant(ScalarValue::Int(-128), ValueType::Scalar(DType::Int32));
        let shifted = g.push(
            Op::Arith {
                op: ArithOp::Add,
                lhs: zp,
                rhs: offset,
            },
            ValueType::Scalar(DType::Int32),
        );
        let narrow = g.push(Op::ScalarCast { value: zp }, ValueType::Scalar(DType::Int8));
        g.set_outputs([shifted, narrow]);
        let out = Evaluator::new().run(&g).unwrap();
        assert_eq!(
            out,
            vec![
                RtValue::Scalar {
                    dtype: DType::Int32,
                    value: 72.0
                },
                RtValue::Scalar {
                    dtype: DType::Int8,
                    value: -56.0
                },
            ]
        );
    }

    // === Tensors ===

    #[test]
    fn test_elementwise_with_scalar() {
        let mut g = Graph::new();
        let ty = TensorType::new(DType::UInt8, Shape::from_static([3]));
        let x = g.input("x", ty);
        let shift = g.constant(ScalarValue::Int(-128), ValueType::Scalar(DType::Int8));
        let y = g.push(
            Op::Elementwise {
                op: ElementwiseOp::Add,
                lhs: x,
                rhs: shift,
            },
            ValueType::Tensor(TensorType::new(DType::Int8, Shape::from_static([3]))),
        );
        g.set_outputs([y]);
        let input = Tensor::from_vec(DType::UInt8, &[3], vec![0.0, 128.0, 255.0]).unwrap();
        let out = Evaluator::new().with_input("x", input).run(&g).unwrap();
        let t = out[0].as_tensor().unwrap();
        assert_eq!(t.dtype(), DType::Int8);
        assert_eq!(t.to_vec(), vec![-128.0, 0.0, 127.0]);
    }

    #[test]
    fn test_unlowered_host_op() {
        let mut g = Graph::new();
        let ty = TensorType::new(DType::Float32, Shape::from_static([2, 2]));
        let a = g.input("a", ty.clone());
        let mm = g.push(
            Op::Linear(lin_ir::LinearOp::Mm(lin_ir::BinaryOperands { lhs: a, rhs: a })),
            ValueType::Tensor(ty),
        );
        g.set_outputs([mm]);
        let err = Evaluator::new()
            .with_input("a", f32_tensor(&[2, 2], vec![0.0; 4]))
            .run(&g)
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::Unlowered {
                kind: LinearKind::Mm
            }
        ));
    }
}
