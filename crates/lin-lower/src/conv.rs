//! Convolution lowering.
//!
//! One rule covers 1-D to 3-D convolutions, transposed convolutions,
//! grouped and depthwise convolutions, and quantized operands. The decision
//! sequence is fixed:
//!
//! ```text
//! operands ──> zero-points ──> validation ──> padded input
//!                                                 |
//!        bias or zero ──> accumulator ────────────┤
//!                                                 v
//!   groups == 1, float/int       conv_Nd_nc.._fc..
//!   groups == 1, quantized       conv_Nd_n..c_..cf_q   (channel-last)
//!   one channel per group        depthwise_conv_Nd_..
//!   otherwise (2-D)              conv_2d_ngchw_gfchw
//!                                                 |
//!                                                 v
//!                                       convert + cast
//! ```
//!
//! A transposed convolution becomes a stride-1 convolution over an enlarged
//! input: the input is written into a pad-filled buffer at stride `stride`,
//! and the weight is transposed on its first two axes and flipped along
//! every spatial axis.

use lin_ir::{
    ConvGeometry, ConvKernel, ConvLayout, ConvVariant, ConvolutionOp, DType, LinearKind,
    LinearOp, NamedKernel, OperandInfo, Permutation, Reassociation, ReductionSpec, ScalarValue,
    TensorType, ValueId,
};
use smallvec::SmallVec;
use tracing::debug;

use crate::builder::{Builder, DimValue};
use crate::dispatch::LoweringRule;
use crate::quant::{normalize_operand, quantized_pair, NormalizedOperand};
use crate::shape::{accumulator_type, check_divisible, check_element_kind};
use crate::{LowerConfig, LowerError};

/// Which kernel family a convolution lowers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvPath {
    /// `groups == 1`, channel-first kernel.
    Standard,
    /// `groups == 1` with zero-points, channel-last quantized kernel.
    QuantizedChannelLast,
    /// One input channel and one filter per group.
    Depthwise,
    /// General grouped kernel with an explicit group axis.
    Grouped,
}

/// Validated operands and geometry of one convolution.
struct ConvPlan {
    input: NormalizedOperand,
    weight: NormalizedOperand,
    geometry: ConvGeometry,
    spatial: usize,
    acc: DType,
}

impl ConvPlan {
    fn quantized(&self) -> bool {
        self.input.zero_point.is_some()
    }

    fn zero_points(&self) -> Option<[ValueId; 2]> {
        Some([self.input.zero_point?, self.weight.zero_point?])
    }

    fn kernel(&self, variant: ConvVariant) -> ReductionSpec {
        let strides = if self.geometry.transposed {
            SmallVec::from_elem(1, self.spatial)
        } else {
            self.geometry.stride.clone()
        };
        ReductionSpec::named(NamedKernel::Conv(ConvKernel {
            variant,
            strides,
            dilations: self.geometry.dilation.clone(),
            quantized: self.quantized(),
        }))
    }
}

/// `[0, 2, .., rank-1, 1]`: channel axis moved last.
fn channel_last(rank: usize) -> Permutation {
    Permutation::new(std::iter::once(0).chain(2..rank).chain(std::iter::once(1)))
}

/// `[0, rank-1, 1, .., rank-2]`: channel axis moved back to position one.
fn channel_first(rank: usize) -> Permutation {
    Permutation::new([0, rank - 1].into_iter().chain(1..rank - 1))
}

/// Standard output size of one spatial axis.
fn output_dim(
    b: &mut Builder<'_>,
    geometry: &ConvGeometry,
    axis: usize,
    input: DimValue,
    kernel: DimValue,
) -> Result<DimValue, LowerError> {
    if let (Some(i), Some(k)) = (input.known, kernel.known) {
        let out = geometry.output_size(axis, i, k).ok_or_else(|| {
            LowerError::no_match(format!("empty output along spatial axis {axis}"))
        })?;
        return Ok(b.index(out));
    }
    let (pad, stride, dilation) = (
        geometry.padding[axis],
        geometry.stride[axis],
        geometry.dilation[axis],
    );
    let k_minus_one = b.add_const(kernel, -1);
    let extent = b.mul_const(k_minus_one, dilation);
    let padded = b.add_const(input, 2 * pad - 1);
    let span = b.sub(padded, extent);
    let stride = b.index(stride);
    let steps = b.floor_div(span, stride);
    Ok(b.add_const(steps, 1))
}

/// Transposed output size of one spatial axis.
fn transposed_output_dim(
    b: &mut Builder<'_>,
    geometry: &ConvGeometry,
    axis: usize,
    input: DimValue,
    kernel: DimValue,
) -> Result<DimValue, LowerError> {
    if let (Some(i), Some(k)) = (input.known, kernel.known) {
        let out = geometry.output_size(axis, i, k).ok_or_else(|| {
            LowerError::no_match(format!("empty output along spatial axis {axis}"))
        })?;
        return Ok(b.index(out));
    }
    let (pad, stride, dilation, output_padding) = (
        geometry.padding[axis],
        geometry.stride[axis],
        geometry.dilation[axis],
        geometry.output_padding[axis],
    );
    let in_minus_one = b.add_const(input, -1);
    let strided = b.mul_const(in_minus_one, stride);
    let k_minus_one = b.add_const(kernel, -1);
    let extent = b.mul_const(k_minus_one, dilation);
    let sum = b.add(strided, extent);
    Ok(b.add_const(sum, output_padding + 1 - 2 * pad))
}

/// Pads the input for a regular convolution. Returns the padded input and
/// the output spatial sizes.
fn pad_input(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    in_dims: &[DimValue],
    kernel_dims: &[DimValue],
    pad_value: ValueId,
) -> Result<(ValueId, Vec<DimValue>), LowerError> {
    let edges: Vec<i64> = [0, 0]
        .into_iter()
        .chain(plan.geometry.padding.iter().copied())
        .collect();
    let padded = b.pad(plan.input.value, edges.clone(), edges, pad_value)?;
    let mut out = Vec::with_capacity(plan.spatial);
    for axis in 0..plan.spatial {
        out.push(output_dim(b, &plan.geometry, axis, in_dims[axis + 2], kernel_dims[axis])?);
    }
    Ok((padded, out))
}

/// Writes the input into the enlarged buffer of a transposed convolution.
/// Returns the buffer and the output spatial sizes.
fn dilate_input(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    in_dims: &[DimValue],
    kernel_dims: &[DimValue],
    pad_value: ValueId,
) -> Result<(ValueId, Vec<DimValue>), LowerError> {
    let geometry = &plan.geometry;
    let zero = b.index(0);
    let mut sizes = vec![in_dims[0], in_dims[1]];
    let mut offsets = vec![zero, zero];
    let mut strides = vec![1, 1];
    let mut out = Vec::with_capacity(plan.spatial);
    for axis in 0..plan.spatial {
        let input = in_dims[axis + 2];
        let kernel = kernel_dims[axis];
        if let Some(k) = kernel.known {
            if geometry.transposed_offset(axis, k) < 0 {
                return Err(LowerError::no_match(format!(
                    "transposed convolution padding exceeds the kernel reach on axis {axis}"
                )));
            }
        }

        let (offset, outer) = match (input.known, kernel.known) {
            (Some(n), Some(k)) => (
                b.index(geometry.transposed_offset(axis, k)),
                b.index(geometry.transposed_buffer_size(axis, n, k)),
            ),
            _ => {
                // (k - 1) * dilation - pad
                let k_minus_one = b.add_const(kernel, -1);
                let reach = b.mul_const(k_minus_one, geometry.dilation[axis]);
                let offset = b.add_const(reach, -geometry.padding[axis]);

                // 2 * offset + (in - 1) * stride + 1 + output_padding
                let in_minus_one = b.add_const(input, -1);
                let inner = b.mul_const(in_minus_one, geometry.stride[axis]);
                let both_sides = b.mul_const(offset, 2);
                let outer = b.add(both_sides, inner);
                (offset, b.add_const(outer, 1 + geometry.output_padding[axis]))
            }
        };

        sizes.push(outer);
        offsets.push(offset);
        strides.push(geometry.stride[axis]);
        out.push(transposed_output_dim(b, geometry, axis, input, kernel)?);
    }
    let buffer = b.fill(&sizes, pad_value, plan.input.ty.dtype);
    let dilated = b.insert_slice(plan.input.value, buffer, &offsets, strides)?;
    Ok((dilated, out))
}

/// Builds the accumulator: the bias broadcast along every non-channel axis,
/// or zeros.
fn accumulator(
    b: &mut Builder<'_>,
    bias: Option<ValueId>,
    out_dims: &[DimValue],
    acc: DType,
) -> Result<ValueId, LowerError> {
    let Some(bias) = bias else {
        return Ok(b.zeros(out_dims, acc));
    };
    let ty = b.tensor_type(bias)?;
    if ty.rank() != 1 {
        return Err(LowerError::no_match(format!(
            "expected a rank-1 bias, got rank {}",
            ty.rank()
        )));
    }
    let bias = b.convert(bias, acc)?;
    let added = (0..out_dims.len()).filter(|&axis| axis != 1).collect();
    b.broadcast(bias, out_dims, added)
}

fn select_path(
    plan: &ConvPlan,
    in_dims: &[DimValue],
    weight_dims: &[DimValue],
    config: &LowerConfig,
) -> ConvPath {
    let groups = plan.geometry.groups;
    if groups == 1 {
        return if plan.quantized() {
            ConvPath::QuantizedChannelLast
        } else {
            ConvPath::Standard
        };
    }
    let depthwise = in_dims[1].known == Some(groups)
        && weight_dims[0].known == Some(groups)
        && weight_dims[1].known == Some(1);
    if depthwise && config.prefer_depthwise_kernels {
        ConvPath::Depthwise
    } else {
        ConvPath::Grouped
    }
}

/// Splits axis `axis` of `value` into `[groups, size / groups]`.
fn split_groups(
    b: &mut Builder<'_>,
    value: ValueId,
    axis: usize,
    groups: DimValue,
) -> Result<(ValueId, Reassociation), LowerError> {
    let dims = b.dims(value)?;
    let per_group = b.floor_div(dims[axis], groups);
    let mut sizes = dims[..axis].to_vec();
    sizes.extend([groups, per_group]);
    sizes.extend_from_slice(&dims[axis + 1..]);
    let fold = Reassociation::fold_range(sizes.len(), axis, axis + 2);
    let expanded = b.expand_shape(value, fold.clone(), &sizes)?;
    Ok((expanded, fold))
}

fn run_standard(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    input: ValueId,
    weight: ValueId,
    init: ValueId,
) -> Result<ValueId, LowerError> {
    let spec = plan.kernel(ConvVariant::Standard(ConvLayout::ChannelFirst));
    b.reduce(spec, input, weight, None, init)
}

fn run_quantized_channel_last(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    input: ValueId,
    weight: ValueId,
    init: ValueId,
) -> Result<ValueId, LowerError> {
    let rank = plan.spatial + 2;
    // weight: [f, c, k..] -> [k.., c, f]
    let weight_perm = Permutation::new((2..rank).chain([1, 0]));
    let input = b.transpose(input, channel_last(rank))?;
    let weight = b.transpose(weight, weight_perm)?;
    let init = b.transpose(init, channel_last(rank))?;
    let spec = plan.kernel(ConvVariant::Standard(ConvLayout::ChannelLast));
    let out = b.reduce(spec, input, weight, plan.zero_points(), init)?;
    b.transpose(out, channel_first(rank))
}

fn run_depthwise(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    input: ValueId,
    weight: ValueId,
    init: ValueId,
) -> Result<ValueId, LowerError> {
    let rank = plan.spatial + 2;
    // [g, 1, k..] -> [g, k..]
    let weight = b.collapse_shape(weight, Reassociation::fold_range(rank, 0, 2))?;
    if !plan.quantized() {
        if plan.spatial > 2 {
            return Err(LowerError::no_match(
                "depthwise convolution is only supported in 1-D and 2-D",
            ));
        }
        let spec = plan.kernel(ConvVariant::Depthwise(ConvLayout::ChannelFirst));
        return b.reduce(spec, input, weight, None, init);
    }
    if plan.spatial != 2 {
        return Err(LowerError::no_match(
            "quantized depthwise convolution is only supported in 2-D",
        ));
    }
    // weight: [c, k..] -> [k.., c]
    let weight_perm = Permutation::new((1..rank - 1).chain(std::iter::once(0)));
    let input = b.transpose(input, channel_last(rank))?;
    let weight = b.transpose(weight, weight_perm)?;
    let init = b.transpose(init, channel_last(rank))?;
    let spec = plan.kernel(ConvVariant::Depthwise(ConvLayout::ChannelLast));
    let out = b.reduce(spec, input, weight, plan.zero_points(), init)?;
    b.transpose(out, channel_first(rank))
}

fn run_grouped(
    b: &mut Builder<'_>,
    plan: &ConvPlan,
    input: ValueId,
    weight: ValueId,
    init: ValueId,
) -> Result<ValueId, LowerError> {
    if plan.spatial != 2 {
        return Err(LowerError::no_match(
            "grouped convolution is only supported in 2-D",
        ));
    }
    let groups = b.index(plan.geometry.groups);
    // [n, c, ..] -> [n, g, c/g, ..]
    let (input, _) = split_groups(b, input, 1, groups)?;
    let (init, fold) = split_groups(b, init, 1, groups)?;
    // [f, c/g, ..] -> [g, f/g, c/g, ..]
    let (weight, _) = split_groups(b, weight, 0, groups)?;
    let spec = plan.kernel(ConvVariant::Grouped);
    let out = b.reduce(spec, input, weight, plan.zero_points(), init)?;
    b.collapse_shape(out, fold)
}

/// Lowers `convolution`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConvolutionRule;

impl ConvolutionRule {
    fn plan(
        b: &mut Builder<'_>,
        conv: &ConvolutionOp,
        result: &TensorType,
    ) -> Result<ConvPlan, LowerError> {
        let input = OperandInfo::extract(b.graph(), conv.input)?;
        let weight = OperandInfo::extract(b.graph(), conv.weight)?;
        let quantized = quantized_pair(&input, &weight, "convolution")?;
        if quantized {
            if let Some(bias) = conv.bias {
                let dtype = b.tensor_type(bias)?.dtype;
                if dtype != DType::Int32 {
                    return Err(LowerError::no_match(format!(
                        "quantized convolution needs an si32 bias, got {dtype}"
                    )));
                }
            }
        }
        for dtype in [input.ty.dtype, weight.ty.dtype, result.dtype] {
            check_element_kind(dtype)?;
        }

        let rank = input.rank();
        let spatial = rank.saturating_sub(2);
        if !(1..=3).contains(&spatial) {
            return Err(LowerError::no_match(format!(
                "only 1-D to 3-D convolutions are supported, got input rank {rank}"
            )));
        }
        if weight.rank() != rank {
            return Err(LowerError::no_match(format!(
                "weight rank {} does not match input rank {rank}",
                weight.rank()
            )));
        }
        let geometry = ConvGeometry::from_op(conv, spatial)
            .map_err(|err| LowerError::no_match(err.to_string()))?;
        if geometry.transposed && geometry.groups > 1 {
            return Err(LowerError::no_match("grouped transposed convolution"));
        }

        let acc = accumulator_type(input.ty.dtype)?;
        let input = normalize_operand(b, &input)?;
        let weight = normalize_operand(b, &weight)?;
        Ok(ConvPlan {
            input,
            weight,
            geometry,
            spatial,
            acc,
        })
    }
}

impl LoweringRule for ConvolutionRule {
    fn name(&self) -> &'static str {
        "convolution"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Convolution
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let LinearOp::Convolution(conv) = op else {
            return Err(LowerError::no_match("expected convolution"));
        };
        let plan = Self::plan(b, conv, result)?;
        let rank = plan.spatial + 2;

        let in_dims = b.dims(plan.input.value)?;
        let weight_dims = b.dims(plan.weight.value)?;
        let groups = b.index(plan.geometry.groups);
        check_divisible(
            b,
            in_dims[1],
            groups,
            "groups must divide input channel size evenly",
        )?;
        check_divisible(
            b,
            weight_dims[0],
            groups,
            "groups must divide weight batch size evenly",
        )?;

        let input_dtype = plan.input.ty.dtype;
        let pad_value = match plan.input.zero_point {
            Some(zp) => b.scalar_cast(zp, input_dtype),
            None => b.scalar(ScalarValue::zero(input_dtype), input_dtype),
        };

        let (padded, weight, out_channels, spatial_out) = if plan.geometry.transposed {
            // [c, f, k..] -> [f, c, k..], then reverse every kernel axis
            let swap = Permutation::new([1, 0].into_iter().chain(2..rank));
            let swapped = b.transpose(plan.weight.value, swap)?;
            let weight = b.flip(swapped, (2..rank).collect())?;
            let (dilated, out) = dilate_input(b, &plan, &in_dims, &weight_dims[2..], pad_value)?;
            debug!(spatial = plan.spatial, "transposed convolution");
            (dilated, weight, weight_dims[1], out)
        } else {
            let (padded, out) = pad_input(b, &plan, &in_dims, &weight_dims[2..], pad_value)?;
            (padded, plan.weight.value, weight_dims[0], out)
        };

        let mut out_dims = vec![in_dims[0], out_channels];
        out_dims.extend(spatial_out);
        let init = accumulator(b, conv.bias, &out_dims, plan.acc)?;

        let path = select_path(&plan, &in_dims, &weight_dims, config);
        debug!(
            ?path,
            spatial = plan.spatial,
            groups = plan.geometry.groups,
            quantized = plan.quantized(),
            acc = %plan.acc,
            "convolution path"
        );
        let value = match path {
            ConvPath::Standard => run_standard(b, &plan, padded, weight, init)?,
            ConvPath::QuantizedChannelLast => {
                run_quantized_channel_last(b, &plan, padded, weight, init)?
            }
            ConvPath::Depthwise => run_depthwise(b, &plan, padded, weight, init)?,
            ConvPath::Grouped => run_grouped(b, &plan, padded, weight, init)?,
        };
        b.finish(value, result)
    }
}
