//! The SSA graph.
//!
//! Nodes live in an arena indexed by [`ValueId`]; the schedule lists the ids
//! that are part of the program in execution order. A node may exist in the
//! arena without being scheduled: the lowering builder creates nodes detached
//! and only splices them into the schedule once a rewrite succeeds.

use std::fmt;

use bitflags::bitflags;
use lin_index::Idx;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ops::LinearOp;
use crate::reduction::ReductionSpec;
use crate::{IrError, Permutation, Reassociation, ScalarValue, TensorType, ValueId, ValueType};

bitflags! {
    /// Static properties of an operation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OpTraits: u32 {
        /// No side effects; removable when unused.
        const PURE = 1 << 0;
        /// Must be kept even when its result is unused.
        const SIDE_EFFECT = 1 << 1;
        /// Reinterprets or rearranges elements without computing new ones.
        const VIEW = 1 << 2;
        /// Runs a reduction kernel.
        const REDUCTION = 1 << 3;
        /// A host operator that has to be lowered.
        const HOST = 1 << 4;
        /// Produces an index or scalar, not a tensor.
        const SCALAR = 1 << 5;
        /// A graph argument.
        const INTERFACE = 1 << 6;
    }
}

/// Index and scalar integer arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division rounding toward negative infinity.
    FloorDiv,
    /// Remainder.
    Rem,
    /// Maximum.
    Max,
}

impl ArithOp {
    /// Applies the operation. Returns `None` on overflow or division by zero.
    #[must_use]
    pub fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            Self::Add => lhs.checked_add(rhs),
            Self::Sub => lhs.checked_sub(rhs),
            Self::Mul => lhs.checked_mul(rhs),
            Self::FloorDiv => {
                let q = lhs.checked_div(rhs)?;
                if lhs % rhs != 0 && ((lhs < 0) != (rhs < 0)) {
                    Some(q - 1)
                } else {
                    Some(q)
                }
            }
            Self::Rem => lhs.checked_rem_euclid(rhs),
            Self::Max => Some(lhs.max(rhs)),
        }
    }
}

/// Element-wise tensor arithmetic (with numpy-style broadcasting; a scalar
/// operand applies to every element).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseOp {
    /// Addition.
    Add,
    /// Multiplication.
    Mul,
}

/// The condition a guard asserts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardCond {
    /// Two sizes are equal.
    Eq(ValueId, ValueId),
    /// `value % divisor == 0`.
    Divisible {
        /// The dividend.
        value: ValueId,
        /// The divisor.
        divisor: ValueId,
    },
    /// `size == target || size == 1`.
    Broadcastable {
        /// The operand size.
        size: ValueId,
        /// The broadcast size.
        target: ValueId,
    },
}

/// A run-time assertion. Aborts the program with `message` when its
/// condition does not hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    /// The asserted condition.
    pub cond: GuardCond,
    /// Failure message.
    pub message: String,
}

/// A node operation.
///
/// Result types are carried by the [`Node`]; operations whose result element
/// type or shape is not implied by their operands (`Convert`, `Cast`,
/// `ScalarCast`, `Fill`) read it from there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // === Host Level ===
    /// A named graph argument.
    Input {
        /// Argument name.
        name: String,
    },
    /// A constant index or scalar.
    Constant(ScalarValue),
    /// Attaches quantization parameters to integer storage.
    MakeQuantized {
        /// The stored integers.
        storage: ValueId,
        /// Scale factor.
        scale: f64,
        /// Zero-point scalar.
        zero_point: ValueId,
    },
    /// A host operator awaiting lowering.
    Linear(LinearOp),

    // === Index and Scalar Operations ===
    /// The run-time size of one axis.
    Dim {
        /// The tensor.
        source: ValueId,
        /// The axis.
        axis: usize,
    },
    /// Integer arithmetic.
    Arith {
        /// The operation.
        op: ArithOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// Conversion of a scalar to the node's scalar type (truncating).
    ScalarCast {
        /// The scalar.
        value: ValueId,
    },
    /// A run-time assertion.
    Guard(Guard),

    // === Tensor Construction ===
    /// A tensor of the given sizes filled with a scalar.
    Fill {
        /// One index per axis.
        sizes: Vec<ValueId>,
        /// Fill value.
        value: ValueId,
    },
    /// Replicates `input` along the axes listed in `added`; the other axes
    /// map to the input axes in order.
    Broadcast {
        /// The tensor.
        input: ValueId,
        /// Result sizes.
        sizes: Vec<ValueId>,
        /// Result axes not present in the input.
        added: Vec<usize>,
    },
    /// Numpy-style broadcast: leading axes are added, unit axes stretched.
    BroadcastTo {
        /// The tensor.
        input: ValueId,
        /// Result sizes.
        sizes: Vec<ValueId>,
    },

    // === Layout ===
    /// Axis permutation: result axis `i` is input axis `perm[i]`.
    Transpose {
        /// The tensor.
        input: ValueId,
        /// The permutation.
        perm: Permutation,
    },
    /// Reversal along each listed axis.
    Flip {
        /// The tensor.
        input: ValueId,
        /// Axes to reverse.
        axes: Vec<usize>,
    },
    /// Splits axes according to `reassociation`.
    ExpandShape {
        /// The tensor.
        input: ValueId,
        /// Groups of result axes per input axis.
        reassociation: Reassociation,
        /// Result sizes.
        sizes: Vec<ValueId>,
    },
    /// Merges axes according to `reassociation`.
    CollapseShape {
        /// The tensor.
        input: ValueId,
        /// Groups of input axes per result axis.
        reassociation: Reassociation,
    },
    /// Constant padding.
    Pad {
        /// The tensor.
        input: ValueId,
        /// Elements added before each axis.
        low: Vec<i64>,
        /// Elements added after each axis.
        high: Vec<i64>,
        /// Padding value.
        value: ValueId,
    },
    /// Writes `source` into a copy of `dest` at `offsets` with `strides`.
    InsertSlice {
        /// The slice.
        source: ValueId,
        /// The destination.
        dest: ValueId,
        /// One offset per axis.
        offsets: Vec<ValueId>,
        /// One stride per axis.
        strides: Vec<i64>,
    },
    /// The sub-range `start..start + len` of one axis.
    Narrow {
        /// The tensor.
        input: ValueId,
        /// The axis.
        axis: usize,
        /// First index.
        start: i64,
        /// Length.
        len: usize,
    },
    /// Removes a unit axis.
    Squeeze {
        /// The tensor.
        input: ValueId,
        /// The axis.
        axis: usize,
    },
    /// Inserts a unit axis.
    Unsqueeze {
        /// The tensor.
        input: ValueId,
        /// Position of the new axis.
        axis: usize,
    },

    // === Compute ===
    /// Element-wise arithmetic.
    Elementwise {
        /// The operation.
        op: ElementwiseOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand (tensor or scalar).
        rhs: ValueId,
    },
    /// Sum over one axis, keeping it with size one.
    Sum {
        /// The tensor.
        input: ValueId,
        /// The axis.
        axis: usize,
    },
    /// Element type conversion to the node's element type.
    Convert {
        /// The tensor.
        input: ValueId,
    },
    /// Exact-shape coercion to the node's type.
    Cast {
        /// The tensor.
        input: ValueId,
    },
    /// A reduction kernel accumulating into `init`.
    Reduce {
        /// The kernel.
        spec: ReductionSpec,
        /// First input.
        lhs: ValueId,
        /// Second input.
        rhs: ValueId,
        /// Zero-points of `lhs` and `rhs` for quantized kernels.
        zero_points: Option<[ValueId; 2]>,
        /// The initial accumulator.
        init: ValueId,
    },
}

impl Op {
    /// Returns a short operation name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Constant(_) => "constant",
            Self::MakeQuantized { .. } => "make_quantized",
            Self::Linear(_) => "linear",
            Self::Dim { .. } => "dim",
            Self::Arith { .. } => "arith",
            Self::ScalarCast { .. } => "scalar_cast",
            Self::Guard(_) => "guard",
            Self::Fill { .. } => "fill",
            Self::Broadcast { .. } => "broadcast",
            Self::BroadcastTo { .. } => "broadcast_to",
            Self::Transpose { .. } => "transpose",
            Self::Flip { .. } => "flip",
            Self::ExpandShape { .. } => "expand_shape",
            Self::CollapseShape { .. } => "collapse_shape",
            Self::Pad { .. } => "pad",
            Self::InsertSlice { .. } => "insert_slice",
            Self::Narrow { .. } => "narrow",
            Self::Squeeze { .. } => "squeeze",
            Self::Unsqueeze { .. } => "unsqueeze",
            Self::Elementwise { .. } => "elementwise",
            Self::Sum { .. } => "sum",
            Self::Convert { .. } => "convert",
            Self::Cast { .. } => "cast",
            Self::Reduce { .. } => "reduce",
        }
    }

    /// Returns the static properties of this operation.
    #[must_use]
    pub fn traits(&self) -> OpTraits {
        match self {
            Self::Input { .. } => OpTraits::INTERFACE,
            Self::Constant(_) | Self::Dim { .. } | Self::Arith { .. } | Self::ScalarCast { .. } => {
                OpTraits::PURE | OpTraits::SCALAR
            }
            Self::Guard(_) => OpTraits::SIDE_EFFECT | OpTraits::SCALAR,
            Self::Linear(_) => OpTraits::HOST,
            Self::MakeQuantized { .. }
            | Self::Transpose { .. }
            | Self::ExpandShape { .. }
            | Self::CollapseShape { .. }
            | Self::Squeeze { .. }
            | Self::Unsqueeze { .. }
            | Self::Narrow { .. }
            | Self::Cast { .. } => OpTraits::PURE | OpTraits::VIEW,
            Self::Reduce { .. } => OpTraits::PURE | OpTraits::REDUCTION,
            Self::Fill { .. }
            | Self::Broadcast { .. }
            | Self::BroadcastTo { .. }
            | Self::Flip { .. }
            | Self::Pad { .. }
            | Self::InsertSlice { .. }
            | Self::Elementwise { .. }
            | Self::Sum { .. }
            | Self::Convert { .. } => OpTraits::PURE,
        }
    }

    /// Returns every value this operation reads.
    #[must_use]
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        let mut out = SmallVec::new();
        self.visit_operands(|v| out.push(v));
        out
    }

    fn visit_operands(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Self::Input { .. } | Self::Constant(_) => {}
            Self::MakeQuantized {
                storage,
                zero_point,
                ..
            } => {
                f(*storage);
                f(*zero_point);
            }
            Self::Linear(op) => op.operands().into_iter().for_each(f),
            Self::Dim { source, .. } => f(*source),
            Self::Arith { lhs, rhs, .. } | Self::Elementwise { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Self::ScalarCast { value } => f(*value),
            Self::Guard(guard) => match guard.cond {
                GuardCond::Eq(a, b)
                | GuardCond::Divisible {
                    value: a,
                    divisor: b,
                }
                | GuardCond::Broadcastable { size: a, target: b } => {
                    f(a);
                    f(b);
                }
            },
            Self::Fill { sizes, value } => {
                sizes.iter().copied().for_each(&mut f);
                f(*value);
            }
            Self::Broadcast { input, sizes, .. }
            | Self::BroadcastTo { input, sizes }
            | Self::ExpandShape { input, sizes, .. } => {
                f(*input);
                sizes.iter().copied().for_each(f);
            }
            Self::Transpose { input, .. }
            | Self::Flip { input, .. }
            | Self::CollapseShape { input, .. }
            | Self::Narrow { input, .. }
            | Self::Squeeze { input, .. }
            | Self::Unsqueeze { input, .. }
            | Self::Sum { input, .. }
            | Self::Convert { input }
            | Self::Cast { input } => f(*input),
            Self::Pad { input, value, .. } => {
                f(*input);
                f(*value);
            }
            Self::InsertSlice {
                source,
                dest,
                offsets,
                ..
            } => {
                f(*source);
                f(*dest);
                offsets.iter().copied().for_each(f);
            }
            Self::Reduce {
                lhs,
                rhs,
                zero_points,
                init,
                ..
            } => {
                f(*lhs);
                f(*rhs);
                if let Some([a, b]) = zero_points {
                    f(*a);
                    f(*b);
                }
                f(*init);
            }
        }
    }

    /// Rewrites every value this operation reads.
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        let mut map = |v: &mut ValueId| *v = f(*v);
        match self {
            Self::Input { .. } | Self::Constant(_) => {}
            Self::MakeQuantized {
                storage,
                zero_point,
                ..
            } => {
                map(storage);
                map(zero_point);
            }
            Self::Linear(op) => op.map_operands(|v| {
                let mut v = v;
                map(&mut v);
                v
            }),
            Self::Dim { source, .. } => map(source),
            Self::Arith { lhs, rhs, .. } | Self::Elementwise { lhs, rhs, .. } => {
                map(lhs);
                map(rhs);
            }
            Self::ScalarCast { value } => map(value),
            Self::Guard(guard) => match &mut guard.cond {
                GuardCond::Eq(a, b)
                | GuardCond::Divisible {
                    value: a,
                    divisor: b,
                }
                | GuardCond::Broadcastable { size: a, target: b } => {
                    map(a);
                    map(b);
                }
            },
            Self::Fill { sizes, value } => {
                sizes.iter_mut().for_each(&mut map);
                map(value);
            }
            Self::Broadcast { input, sizes, .. }
            | Self::BroadcastTo { input, sizes }
            | Self::ExpandShape { input, sizes, .. } => {
                map(input);
                sizes.iter_mut().for_each(map);
            }
            Self::Transpose { input, .. }
            | Self::Flip { input, .. }
            | Self::CollapseShape { input, .. }
            | Self::Narrow { input, .. }
            | Self::Squeeze { input, .. }
            | Self::Unsqueeze { input, .. }
            | Self::Sum { input, .. }
            | Self::Convert { input }
            | Self::Cast { input } => map(input),
            Self::Pad { input, value, .. } => {
                map(input);
                map(value);
            }
            Self::InsertSlice {
                source,
                dest,
                offsets,
                ..
            } => {
                map(source);
                map(dest);
                offsets.iter_mut().for_each(map);
            }
            Self::Reduce {
                lhs,
                rhs,
                zero_points,
                init,
                ..
            } => {
                map(lhs);
                map(rhs);
                if let Some([a, b]) = zero_points {
                    map(a);
                    map(b);
                }
                map(init);
            }
        }
    }
}

/// A node: an operation and the type of its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// The operation.
    pub op: Op,
    /// The result type.
    pub ty: ValueType,
}

/// An SSA graph with an execution schedule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Node>,
    schedule: Vec<ValueId>,
    outputs: Vec<ValueId>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the arena (scheduled or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the arena holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node at the end of the schedule.
    pub fn push(&mut self, op: Op, ty: ValueType) -> ValueId {
        let id = self.create(op, ty);
        self.schedule.push(id);
        id
    }

    /// Adds a node to the arena without scheduling it.
    pub fn create(&mut self, op: Op, ty: ValueType) -> ValueId {
        let id = ValueId::new(self.nodes.len());
        self.nodes.push(Node { op, ty });
        id
    }

    /// Adds a named tensor argument.
    pub fn input(&mut self, name: impl Into<String>, ty: TensorType) -> ValueId {
        self.push(Op::Input { name: name.into() }, ValueType::Tensor(ty))
    }

    /// Adds a constant.
    pub fn constant(&mut self, value: ScalarValue, ty: ValueType) -> ValueId {
        self.push(Op::Constant(value), ty)
    }

    /// Returns the node defining `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::UnknownValue`] if `id` is not in the arena.
    pub fn node(&self, id: ValueId) -> Result<&Node, IrError> {
        self.nodes
            .get(id.index())
            .ok_or(IrError::UnknownValue { id })
    }

    /// Returns the type of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::UnknownValue`] if `id` is not in the arena.
    pub fn ty(&self, id: ValueId) -> Result<&ValueType, IrError> {
        self.node(id).map(|n| &n.ty)
    }

    /// Returns the tensor type of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::NotATensor`] if `id` is not a tensor.
    pub fn tensor_type(&self, id: ValueId) -> Result<&TensorType, IrError> {
        let ty = self.ty(id)?;
        ty.as_tensor().ok_or_else(|| IrError::NotATensor {
            id,
            ty: ty.clone(),
        })
    }

    /// Returns the schedule.
    #[must_use]
    pub fn schedule(&self) -> &[ValueId] {
        &self.schedule
    }

    /// Iterates over scheduled nodes in order.
    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &Node)> + '_ {
        self.schedule
            .iter()
            .map(move |&id| (id, &self.nodes[id.index()]))
    }

    /// Returns the graph outputs.
    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Sets the graph outputs.
    pub fn set_outputs(&mut self, outputs: impl IntoIterator<Item = ValueId>) {
        self.outputs = outputs.into_iter().collect();
    }

    /// Returns the scheduled host operators, in order.
    #[must_use]
    pub fn host_ops(&self) -> Vec<ValueId> {
        self.iter()
            .filter(|(_, node)| node.op.traits().contains(OpTraits::HOST))
            .map(|(id, _)| id)
            .collect()
    }

    /// Schedules detached nodes immediately before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::UnknownValue`] if `anchor` is not scheduled.
    pub fn insert_before(&mut self, anchor: ValueId, ids: &[ValueId]) -> Result<(), IrError> {
        let pos = self
            .schedule
            .iter()
            .position(|&id| id == anchor)
            .ok_or(IrError::UnknownValue { id: anchor })?;
        self.schedule.splice(pos..pos, ids.iter().copied());
        Ok(())
    }

    /// Schedules detached nodes at the end of the schedule.
    pub fn append(&mut self, ids: &[ValueId]) {
        self.schedule.extend_from_slice(ids);
    }

    /// Drops every node created at or after arena position `len`.
    ///
    /// Only detached nodes may be dropped.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(
            self.schedule.iter().all(|id| id.index() < len),
            "truncating scheduled nodes"
        );
        self.nodes.truncate(len);
    }

    /// Replaces every use of `from` with `to`, including graph outputs.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        let subst = |v: ValueId| if v == from { to } else { v };
        for node in &mut self.nodes {
            node.op.map_operands(subst);
        }
        for out in &mut self.outputs {
            *out = subst(*out);
        }
    }

    /// Removes `id` from the schedule. The node stays in the arena.
    pub fn erase(&mut self, id: ValueId) {
        self.schedule.retain(|&s| s != id);
    }

    /// Returns the scheduled nodes that read `id`.
    #[must_use]
    pub fn users(&self, id: ValueId) -> Vec<ValueId> {
        self.iter()
            .filter(|(_, node)| node.op.operands().contains(&id))
            .map(|(user, _)| user)
            .collect()
    }

    /// Unschedules pure nodes whose results are never used. Returns the
    /// number of nodes removed.
    pub fn prune_dead(&mut self) -> usize {
        let mut live: FxHashSet<ValueId> = self.outputs.iter().copied().collect();
        let mut keep = Vec::with_capacity(self.schedule.len());
        for &id in self.schedule.iter().rev() {
            let op = &self.nodes[id.index()].op;
            if live.contains(&id) || !op.traits().contains(OpTraits::PURE) {
                live.extend(op.operands());
                keep.push(id);
            }
        }
        keep.reverse();
        let removed = self.schedule.len() - keep.len();
        self.schedule = keep;
        removed
    }

    /// Checks that every scheduled node only reads values scheduled before
    /// it, and that every output is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`IrError::UseBeforeDef`] or [`IrError::UnknownValue`].
    pub fn verify(&self) -> Result<(), IrError> {
        let position: FxHashMap<ValueId, usize> = self
            .schedule
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        for (i, &user) in self.schedule.iter().enumerate() {
            for operand in self.node(user)?.op.operands() {
                match position.get(&operand) {
                    Some(&p) if p < i => {}
                    _ => return Err(IrError::UseBeforeDef { user, operand }),
                }
            }
        }
        match self.outputs.iter().find(|o| !position.contains_key(*o)) {
            Some(&id) => Err(IrError::UnknownValue { id }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, node) in self.iter() {
            write!(f, "{id} = {}", node.op.name())?;
            let operands = node.op.operands();
            for (i, operand) in operands.iter().enumerate() {
                f.write_str(if i == 0 { " " } else { ", " })?;
                write!(f, "{operand}")?;
            }
            if let Op::Reduce { spec, .. } = &node.op {
                write!(f, " {{{}}}", spec.name())?;
            }
            writeln!(f, " : {}", node.ty)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, Shape};

    fn f32_tensor(dims: &[usize]) -> ValueType {
        ValueType::Tensor(TensorType::new(
            DType::Float32,
            Shape::from_static(dims.iter().copied()),
        ))
    }

    #[test]
    fn test_detached_nodes_and_splice() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        let anchor = g.push(Op::Cast { input: x }, f32_tensor(&[2]));
        let neg = g.create(Op::Flip { input: x, axes: vec![0] }, f32_tensor(&[2]));
        assert_eq!(g.schedule(), &[x, anchor]);
        g.insert_before(anchor, &[neg]).unwrap();
        assert_eq!(g.schedule(), &[x, neg, anchor]);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_truncate_drops_detached() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        let len = g.len();
        g.create(Op::Cast { input: x }, f32_tensor(&[2]));
        g.truncate(len);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_replace_all_uses() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        let y = g.input("y", TensorType::new(DType::Float32, Shape::from_static([2])));
        let c = g.push(Op::Cast { input: x }, f32_tensor(&[2]));
        g.set_outputs([x, c]);
        g.replace_all_uses(x, y);
        assert_eq!(g.node(c).unwrap().op.operands().as_slice(), &[y]);
        assert_eq!(g.outputs(), &[y, c]);
        assert_eq!(g.users(y), vec![c]);
    }

    #[test]
    fn test_prune_keeps_guards() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Float32, Shape::from_static([2])));
        let d0 = g.push(Op::Dim { source: x, axis: 0 }, ValueType::Index);
        let d1 = g.push(Op::Dim { source: x, axis: 0 }, ValueType::Index);
        let unused = g.push(Op::Dim { source: x, axis: 0 }, ValueType::Index);
        g.push(
            Op::Guard(Guard {
                cond: GuardCond::Eq(d0, d1),
                message: "sizes differ".into(),
            }),
            ValueType::Unit,
        );
        g.set_outputs([x]);
        assert_eq!(g.prune_dead(), 1);
        assert!(!g.schedule().contains(&unused));
        assert!(g.schedule().contains(&d0));
    }

    #[test]
    fn test_verify_rejects_use_before_def() {
        let mut g = Graph::new();
        let late = g.create(Op::Constant(ScalarValue::Int(1)), ValueType::Index);
        let user = g.push(
            Op::Arith {
                op: ArithOp::Add,
                lhs: late,
                rhs: late,
            },
            ValueType::Index,
        );
        assert!(matches!(
            g.verify(),
            Err(IrError::UseBeforeDef { user: u, .. }) if u == user
        ));
    }

    #[test]
    fn test_arith_apply() {
        assert_eq!(ArithOp::FloorDiv.apply(7, 2), Some(3));
        assert_eq!(ArithOp::FloorDiv.apply(-7, 2), Some(-4));
        assert_eq!(ArithOp::FloorDiv.apply(-6, 2), Some(-3));
        assert_eq!(ArithOp::FloorDiv.apply(1, 0), None);
        assert_eq!(ArithOp::Rem.apply(-7, 3), Some(2));
        assert_eq!(ArithOp::Max.apply(-7, 3), Some(3));
        assert_eq!(ArithOp::Mul.apply(i64::MAX, 2), None);
    }

    #[test]
    fn test_traits() {
        let guard = Op::Guard(Guard {
            cond: GuardCond::Eq(ValueId::new(0), ValueId::new(1)),
            message: String::new(),
        });
        assert!(guard.traits().contains(OpTraits::SIDE_EFFECT));
        assert!(!guard.traits().contains(OpTraits::PURE));
        let cast = Op::Cast {
            input: ValueId::new(0),
        };
        assert!(cast.traits().contains(OpTraits::VIEW | OpTraits::PURE));
    }

    #[test]
    fn test_graph_serializes() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::new(DType::Int8, Shape::from_static([3])));
        g.set_outputs([x]);
        let json = serde_json::to_string(&g).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schedule(), g.schedule());
        assert_eq!(back.tensor_type(x).unwrap().dtype, DType::Int8);
    }
}
