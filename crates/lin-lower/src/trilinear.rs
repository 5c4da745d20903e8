//! Trilinear contraction.
//!
//! `trilinear(i1, i2, i3)` multiplies three tensors after aligning them to a
//! common rank, sums over `sum_dim`, and is lowered by unrolling one axis at
//! compile time. Each unrolled step works on unit-size slices:
//!
//! ```text
//! r_k = sum_{sum23}( sum_{sum12}( i1[k] * i2[k] ) * i3[k] )
//! ```
//!
//! Summed axes where `i3` is expanded are reduced before `i3` joins the
//! product, the rest after. When the unroll axis is itself summed every step
//! accumulates into the same slot; otherwise step `k` owns slot `k`.

use lin_ir::{
    Axis, DType, ElementwiseOp, LinearKind, LinearOp, TensorType, TrilinearOp, ValueId,
};
use tracing::{debug, trace};

use crate::builder::{Builder, DimValue};
use crate::dispatch::LoweringRule;
use crate::shape::broadcast_batch_dims;
use crate::{LowerConfig, LowerError};

/// Resolved attributes of one trilinear op.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Plan {
    total: usize,
    expand: [Vec<usize>; 3],
    summed: Vec<usize>,
    unroll: usize,
    sum12: Vec<usize>,
    sum23: Vec<usize>,
}

impl Plan {
    fn resolve(op: &TrilinearOp, rank1: usize) -> Result<Self, LowerError> {
        let constant = |name: &str| LowerError::no_match(format!("{name} must be constant"));
        let expand1 = op.expand[0].as_const().ok_or_else(|| constant("expand1"))?;
        let total = rank1 + expand1.len();
        let axes = |name: &str, dims: &[i64]| -> Result<Vec<usize>, LowerError> {
            let mut out = dims
                .iter()
                .map(|&d| {
                    Axis::new(d).normalize(total).ok_or_else(|| {
                        LowerError::no_match(format!("{name} axis {d} out of range for rank {total}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.sort_unstable();
            out.dedup();
            Ok(out)
        };

        let mut expand: [Vec<usize>; 3] = Default::default();
        for (i, slot) in expand.iter_mut().enumerate() {
            let name = format!("expand{}", i + 1);
            let dims = op.expand[i].as_const().ok_or_else(|| constant(&name))?;
            *slot = axes(&name, dims)?;
        }
        let summed = axes(
            "sum_dim",
            op.sum_dim.as_const().ok_or_else(|| constant("sum_dim"))?,
        )?;
        let unroll = *op
            .unroll_dim
            .as_const()
            .ok_or_else(|| constant("unroll_dim"))?;
        let unroll = Axis::new(unroll).normalize(total).ok_or_else(|| {
            LowerError::no_match(format!("unroll_dim {unroll} out of range for rank {total}"))
        })?;

        let (sum12, sum23) = summed
            .iter()
            .copied()
            .filter(|&d| d != unroll)
            .partition(|d| expand[2].contains(d));
        Ok(Self {
            total,
            expand,
            summed,
            unroll,
            sum12,
            sum23,
        })
    }

    fn unroll_is_summed(&self) -> bool {
        self.summed.contains(&self.unroll)
    }
}

/// Unsqueezes `value` at each axis of `expand` in ascending order.
fn align(b: &mut Builder<'_>, value: ValueId, expand: &[usize]) -> Result<ValueId, LowerError> {
    expand
        .iter()
        .try_fold(value, |acc, &axis| b.unsqueeze(acc, axis))
}

fn sum_axes(b: &mut Builder<'_>, value: ValueId, axes: &[usize]) -> Result<ValueId, LowerError> {
    axes.iter().try_fold(value, |acc, &axis| b.sum(acc, axis))
}

/// Lowers `trilinear`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrilinearRule;

impl TrilinearRule {
    /// One unrolled step: the contribution of slice `k`.
    fn step(
        b: &mut Builder<'_>,
        plan: &Plan,
        inputs: &[ValueId; 3],
        starts: [i64; 3],
        dtype: DType,
    ) -> Result<ValueId, LowerError> {
        let mut slices = [inputs[0]; 3];
        for (slice, (&input, start)) in slices.iter_mut().zip(inputs.iter().zip(starts)) {
            *slice = b.narrow(input, plan.unroll, start, 1)?;
        }
        let product = b.elementwise(ElementwiseOp::Mul, slices[0], slices[1], dtype)?;
        let product = sum_axes(b, product, &plan.sum12)?;
        let product = b.elementwise(ElementwiseOp::Mul, product, slices[2], dtype)?;
        sum_axes(b, product, &plan.sum23)
    }
}

impl LoweringRule for TrilinearRule {
    fn name(&self) -> &'static str {
        "trilinear"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Trilinear
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let LinearOp::Trilinear(tri) = op else {
            return Err(LowerError::no_match("expected trilinear"));
        };
        let types = [
            b.tensor_type(tri.inputs[0])?,
            b.tensor_type(tri.inputs[1])?,
            b.tensor_type(tri.inputs[2])?,
        ];
        let plan = Plan::resolve(tri, types[0].rank())?;
        for (i, ty) in types.iter().enumerate() {
            if ty.rank() + plan.expand[i].len() != plan.total {
                return Err(LowerError::no_match(format!(
                    "input {} has rank {} with {} expanded axes, expected total rank {}",
                    i + 1,
                    ty.rank(),
                    plan.expand[i].len(),
                    plan.total
                )));
            }
        }
        let dtype = types[0].dtype;
        if types.iter().any(|ty| ty.dtype != dtype) {
            return Err(LowerError::no_match(
                "trilinear operands must share an element type",
            ));
        }

        let mut inputs = tri.inputs;
        for (input, expand) in inputs.iter_mut().zip(&plan.expand) {
            *input = align(b, *input, expand)?;
        }

        // output sizes: the broadcast of the three aligned inputs
        let dims = [b.dims(inputs[0])?, b.dims(inputs[1])?, b.dims(inputs[2])?];
        let partial = broadcast_batch_dims(b, &dims[0], &dims[1])?;
        let mut out_dims = broadcast_batch_dims(b, &partial, &dims[2])?;

        let unroll_size = out_dims[plan.unroll]
            .known
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| LowerError::no_match("unroll axis size must be static"))?;
        if unroll_size > config.max_unroll {
            return Err(LowerError::no_match(format!(
                "unroll axis size {unroll_size} exceeds the limit of {}",
                config.max_unroll
            )));
        }
        debug!(
            total = plan.total,
            unroll = plan.unroll,
            unroll_size,
            summed = plan.unroll_is_summed(),
            "unrolling trilinear"
        );

        let one = b.index(1);
        for &axis in &plan.summed {
            out_dims[axis] = one;
        }
        let mut output = b.zeros(&out_dims, dtype);

        // inputs of size one along the unroll axis are read at slot zero
        let fixed: [bool; 3] = std::array::from_fn(|i| dims[i][plan.unroll].is_one());
        let zero = b.index(0);
        for k in 0..unroll_size {
            let k = i64::try_from(k).unwrap_or(i64::MAX);
            let starts = fixed.map(|f| if f { 0 } else { k });
            trace!(k, "trilinear step");
            let r = Self::step(b, &plan, &inputs, starts, dtype)?;
            if plan.unroll_is_summed() {
                output = b.elementwise(ElementwiseOp::Add, output, r, dtype)?;
            } else {
                let slot = b.narrow(output, plan.unroll, k, 1)?;
                let updated = b.elementwise(ElementwiseOp::Add, slot, r, dtype)?;
                let mut offsets: Vec<DimValue> = vec![zero; plan.total];
                offsets[plan.unroll] = b.index(k);
                output = b.insert_slice(updated, output, &offsets, vec![1; plan.total])?;
            }
        }

        for &axis in plan.summed.iter().rev() {
            output = b.squeeze(output, axis)?;
        }
        b.finish(output, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lin_ir::{Attr, Graph, Op, Shape};

    fn trilinear(
        inputs: [ValueId; 3],
        expand: [Vec<i64>; 3],
        sum_dim: Vec<i64>,
        unroll_dim: i64,
    ) -> TrilinearOp {
        TrilinearOp {
            inputs,
            expand: expand.map(Attr::Const),
            sum_dim: Attr::Const(sum_dim),
            unroll_dim: Attr::Const(unroll_dim),
        }
    }

    fn vector(g: &mut Graph, name: &str, n: usize) -> ValueId {
        g.input(name, TensorType::new(DType::Float32, Shape::from_static([n])))
    }

    fn count(g: &Graph, created: &[ValueId], name: &str) -> usize {
        created
            .iter()
            .filter(|&&id| g.node(id).is_ok_and(|n| n.op.name() == name))
            .count()
    }

    fn run(
        g: &mut Graph,
        op: TrilinearOp,
        result: &TensorType,
        config: &LowerConfig,
    ) -> Result<Vec<ValueId>, LowerError> {
        let op = LinearOp::Trilinear(op);
        let mut b = Builder::new(g);
        match TrilinearRule.lower(&op, result, &mut b, config) {
            Ok(_) => Ok(b.commit()),
            Err(err) => {
                b.rollback();
                Err(err)
            }
        }
    }

    // === Attribute Resolution ===

    #[test]
    fn test_plan_partitions_sums() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let op = trilinear([x, x, x], [vec![1, 2], vec![0, 2], vec![0, 1]], vec![1, 2], 0);
        let plan = Plan::resolve(&op, 1).unwrap();
        assert_eq!(plan.total, 3);
        // of the summed axes, i3 is expanded on axis 1 only
        assert_eq!(plan.sum12, vec![1]);
        assert_eq!(plan.sum23, vec![2]);
        assert!(!plan.unroll_is_summed());
    }

    #[test]
    fn test_negative_axes_normalize() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![-1], -1);
        let plan = Plan::resolve(&op, 1).unwrap();
        assert_eq!(plan.summed, vec![0]);
        assert_eq!(plan.unroll, 0);
        assert!(plan.unroll_is_summed());
    }

    #[test]
    fn test_dynamic_attribute_declines() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let mut op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![0], 0);
        op.unroll_dim = Attr::Dynamic(x);
        assert!(Plan::resolve(&op, 1).unwrap_err().is_no_match());
    }

    // === Unrolling ===

    #[test]
    fn test_summed_unroll_accumulates() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 3);
        let op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![0], 0);
        let result = TensorType::new(DType::Float32, Shape::scalar());
        let created = run(&mut g, op, &result, &LowerConfig::default()).unwrap();
        assert_eq!(count(&g, &created, "narrow"), 9);
        assert_eq!(count(&g, &created, "insert_slice"), 0);
        assert_eq!(count(&g, &created, "squeeze"), 1);
    }

    #[test]
    fn test_unsummed_unroll_writes_slots() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![], 0);
        let result = TensorType::new(DType::Float32, Shape::from_static([2]));
        let created = run(&mut g, op, &result, &LowerConfig::default()).unwrap();
        assert_eq!(count(&g, &created, "insert_slice"), 2);
        // three input slices plus one output slot per step
        assert_eq!(count(&g, &created, "narrow"), 8);
    }

    #[test]
    fn test_empty_unroll_axis() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 0);
        let op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![], 0);
        let result = TensorType::new(DType::Float32, Shape::from_static([0]));
        let created = run(&mut g, op, &result, &LowerConfig::default()).unwrap();
        assert_eq!(count(&g, &created, "narrow"), 0);
        assert_eq!(count(&g, &created, "fill"), 1);
    }

    #[test]
    fn test_unroll_limit() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 8);
        let op = trilinear([x, x, x], [vec![], vec![], vec![]], vec![0], 0);
        let result = TensorType::new(DType::Float32, Shape::scalar());
        let config = LowerConfig {
            max_unroll: 4,
            ..LowerConfig::default()
        };
        let before = g.len();
        let err = run(&mut g, op, &result, &config).unwrap_err();
        assert!(err.is_no_match());
        assert_eq!(g.len(), before);
    }

    #[test]
    fn test_rank_disagreement_declines() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let m = g.input("m", TensorType::new(DType::Float32, Shape::from_static([2, 2])));
        let op = trilinear([x, x, m], [vec![], vec![], vec![]], vec![0], 0);
        let result = TensorType::new(DType::Float32, Shape::scalar());
        let err = run(&mut g, op, &result, &LowerConfig::default()).unwrap_err();
        assert!(err.is_no_match());
    }

    #[test]
    fn test_mixed_element_types_decline() {
        let mut g = Graph::new();
        let x = vector(&mut g, "x", 2);
        let y = g.input("y", TensorType::new(DType::Float64, Shape::from_static([2])));
        let op = trilinear([x, x, y], [vec![], vec![], vec![]], vec![0], 0);
        let result = TensorType::new(DType::Float32, Shape::scalar());
        let err = run(&mut g, op, &result, &LowerConfig::default()).unwrap_err();
        assert!(err.is_no_match());
        assert!(matches!(g.node(x).map(|n| &n.op), Ok(Op::Input { .. })));
    }
}
