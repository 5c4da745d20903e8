//! Canonical reduction kernels.
//!
//! A [`ReductionSpec`] describes one loop nest that reads its inputs through
//! affine indexing maps and accumulates into a zero-initialized (or
//! bias-initialized) output buffer. Named kernels are fixed indexing patterns;
//! [`GenericReduction`] carries the maps explicitly. Both expose the same
//! [`Indexing`], so a consumer never has to special-case either form.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::affine::{AffineExpr, AffineMap};

/// Whether a loop of the iteration space produces output or is summed away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IteratorKind {
    /// One output element per iteration.
    Parallel,
    /// Accumulated into the same output element.
    Reduction,
}

/// The combine function applied at every iteration point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combine {
    /// `acc + a * b`.
    MulAdd,
    /// `acc + (a - zp_a) * (b - zp_b)`.
    QuantizedMulAdd,
}

/// How input elements are extended to the accumulator type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    /// Sign-extend integers.
    #[default]
    Signed,
    /// Zero-extend integers.
    Unsigned,
}

/// Position of the channel axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvLayout {
    /// `N C spatial...`, weight `F C spatial...`.
    ChannelFirst,
    /// `N spatial... C`, weight `spatial... C F`.
    ChannelLast,
}

/// Which convolution family a kernel belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvVariant {
    /// Every output channel reads every input channel.
    Standard(ConvLayout),
    /// One filter per channel.
    Depthwise(ConvLayout),
    /// Explicit group axis on input, weight and output (`N G C spatial...`).
    Grouped,
}

/// A convolution kernel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvKernel {
    /// Family and layout.
    pub variant: ConvVariant,
    /// Strides per spatial axis.
    pub strides: SmallVec<[i64; 3]>,
    /// Dilations per spatial axis.
    pub dilations: SmallVec<[i64; 3]>,
    /// Whether input and weight carry zero-points.
    pub quantized: bool,
}

impl ConvKernel {
    /// Returns the number of spatial axes.
    #[must_use]
    pub fn spatial_rank(&self) -> usize {
        self.strides.len()
    }

    /// Returns the kernel name (`conv_2d_nchw_fchw`, `depthwise_conv_1d_ncw_cw`,
    /// `conv_2d_ngchw_gfchw_q`, ...).
    #[must_use]
    pub fn name(&self) -> String {
        let s = self.spatial_rank();
        let sp = match s {
            1 => "w",
            2 => "hw",
            _ => "dhw",
        };
        let base = match self.variant {
            ConvVariant::Standard(ConvLayout::ChannelFirst) => {
                format!("conv_{s}d_nc{sp}_fc{sp}")
            }
            ConvVariant::Standard(ConvLayout::ChannelLast) => {
                format!("conv_{s}d_n{sp}c_{sp}cf")
            }
            ConvVariant::Depthwise(ConvLayout::ChannelFirst) => {
                format!("depthwise_conv_{s}d_nc{sp}_c{sp}")
            }
            ConvVariant::Depthwise(ConvLayout::ChannelLast) => {
                format!("depthwise_conv_{s}d_n{sp}c_{sp}c")
            }
            ConvVariant::Grouped => format!("conv_{s}d_ngc{sp}_gfc{sp}"),
        };
        if self.quantized {
            base + "_q"
        } else {
            base
        }
    }

    /// Window expressions `o_i * stride_i + k_i * dilation_i`.
    fn windows(&self, out_base: usize, kernel_base: usize) -> impl Iterator<Item = AffineExpr> + '_ {
        (0..self.spatial_rank()).map(move |i| {
            AffineExpr::dim(out_base + i) * self.strides[i]
                + AffineExpr::dim(kernel_base + i) * self.dilations[i]
        })
    }

    fn indexing(&self) -> Indexing {
        let s = self.spatial_rank();
        let p = IteratorKind::Parallel;
        let r = IteratorKind::Reduction;
        let dims = |range: std::ops::Range<usize>| range.map(AffineExpr::dim);
        match self.variant {
            // n, f, o.., c, k..
            ConvVariant::Standard(layout) => {
                let n = 3 + 2 * s;
                let (f, c) = (1, 2 + s);
                let (out_base, k_base) = (2, 3 + s);
                let (input, weight, output): (Vec<_>, Vec<_>, Vec<_>) = match layout {
                    ConvLayout::ChannelFirst => (
                        [AffineExpr::dim(0), AffineExpr::dim(c)]
                            .into_iter()
                            .chain(self.windows(out_base, k_base))
                            .collect(),
                        [AffineExpr::dim(f), AffineExpr::dim(c)]
                            .into_iter()
                            .chain(dims(k_base..k_base + s))
                            .collect(),
                        [AffineExpr::dim(0), AffineExpr::dim(f)]
                            .into_iter()
                            .chain(dims(out_base..out_base + s))
                            .collect(),
                    ),
                    ConvLayout::ChannelLast => (
                        std::iter::once(AffineExpr::dim(0))
                            .chain(self.windows(out_base, k_base))
                            .chain(std::iter::once(AffineExpr::dim(c)))
                            .collect(),
                        dims(k_base..k_base + s)
                            .chain([AffineExpr::dim(c), AffineExpr::dim(f)])
                            .collect(),
                        std::iter::once(AffineExpr::dim(0))
                            .chain(dims(out_base..out_base + s))
                            .chain(std::iter::once(AffineExpr::dim(f)))
                            .collect(),
                    ),
                };
                let iterators = [p, p]
                    .into_iter()
                    .chain(std::iter::repeat(p).take(s))
                    .chain(std::iter::once(r))
                    .chain(std::iter::repeat(r).take(s))
                    .collect();
                Indexing::new(n, [input, weight, output], iterators)
            }
            // n, c, o.., k..
            ConvVariant::Depthwise(layout) => {
                let n = 2 + 2 * s;
                let (out_base, k_base) = (2, 2 + s);
                let (input, weight, output): (Vec<_>, Vec<_>, Vec<_>) = match layout {
                    ConvLayout::ChannelFirst => (
                        [AffineExpr::dim(0), AffineExpr::dim(1)]
                            .into_iter()
                            .chain(self.windows(out_base, k_base))
                            .collect(),
                        std::iter::once(AffineExpr::dim(1))
                            .chain(dims(k_base..k_base + s))
                            .collect(),
                        [AffineExpr::dim(0), AffineExpr::dim(1)]
                            .into_iter()
                            .chain(dims(out_base..out_base + s))
                            .collect(),
                    ),
                    ConvLayout::ChannelLast => (
                        std::iter::once(AffineExpr::dim(0))
                            .chain(self.windows(out_base, k_base))
                            .chain(std::iter::once(AffineExpr::dim(1)))
                            .collect(),
                        dims(k_base..k_base + s)
                            .chain(std::iter::once(AffineExpr::dim(1)))
                            .collect(),
                        std::iter::once(AffineExpr::dim(0))
                            .chain(dims(out_base..out_base + s))
                            .chain(std::iter::once(AffineExpr::dim(1)))
                            .collect(),
                    ),
                };
                let iterators = [p, p]
                    .into_iter()
                    .chain(std::iter::repeat(p).take(s))
                    .chain(std::iter::repeat(r).take(s))
                    .collect();
                Indexing::new(n, [input, weight, output], iterators)
            }
            // n, g, f, o.., c, k..
            ConvVariant::Grouped => {
                let n = 4 + 2 * s;
                let (out_base, c, k_base) = (3, 3 + s, 4 + s);
                let input: Vec<_> = [AffineExpr::dim(0), AffineExpr::dim(1), AffineExpr::dim(c)]
                    .into_iter()
                    .chain(self.windows(out_base, k_base))
                    .collect();
                let weight: Vec<_> = [AffineExpr::dim(1), AffineExpr::dim(2), AffineExpr::dim(c)]
                    .into_iter()
                    .chain(dims(k_base..k_base + s))
                    .collect();
                let output: Vec<_> = [AffineExpr::dim(0), AffineExpr::dim(1), AffineExpr::dim(2)]
                    .into_iter()
                    .chain(dims(out_base..out_base + s))
                    .collect();
                let iterators = [p, p, p]
                    .into_iter()
                    .chain(std::iter::repeat(p).take(s))
                    .chain(std::iter::once(r))
                    .chain(std::iter::repeat(r).take(s))
                    .collect();
                Indexing::new(n, [input, weight, output], iterators)
            }
        }
    }
}

/// Kernels with a fixed, well-known indexing pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamedKernel {
    /// `[k] . [k] -> []`.
    Dot,
    /// `[k] . [k, n] -> [n]`.
    Vecmat,
    /// `[m, k] . [k] -> [m]`.
    Matvec,
    /// `[m, k] . [k, n] -> [m, n]`.
    Matmul,
    /// `[b, m, k] . [b, k, n] -> [b, m, n]`.
    BatchMatmul,
    /// `matmul` with zero-point operands.
    QuantizedMatmul,
    /// `batch_matmul` with zero-point operands.
    QuantizedBatchMatmul,
    /// A convolution.
    Conv(ConvKernel),
}

impl NamedKernel {
    /// Returns true if the kernel takes zero-point operands.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        match self {
            Self::QuantizedMatmul | Self::QuantizedBatchMatmul => true,
            Self::Conv(conv) => conv.quantized,
            _ => false,
        }
    }

    /// Returns the kernel name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Dot => "dot".into(),
            Self::Vecmat => "vecmat".into(),
            Self::Matvec => "matvec".into(),
            Self::Matmul => "matmul".into(),
            Self::BatchMatmul => "batch_matmul".into(),
            Self::QuantizedMatmul => "quantized_matmul".into(),
            Self::QuantizedBatchMatmul => "quantized_batch_matmul".into(),
            Self::Conv(conv) => conv.name(),
        }
    }

    /// Returns the indexing maps and iterator kinds of this kernel.
    #[must_use]
    pub fn indexing(&self) -> Indexing {
        use IteratorKind::{Parallel as P, Reduction as R};
        match self {
            Self::Dot => Indexing::projections(1, [&[0][..], &[0], &[]], [R]),
            // n, k
            Self::Vecmat => Indexing::projections(2, [&[1][..], &[1, 0], &[0]], [P, R]),
            // m, k
            Self::Matvec => Indexing::projections(2, [&[0, 1][..], &[1], &[0]], [P, R]),
            // m, n, k
            Self::Matmul | Self::QuantizedMatmul => {
                Indexing::projections(3, [&[0, 2][..], &[2, 1], &[0, 1]], [P, P, R])
            }
            // b, m, n, k
            Self::BatchMatmul | Self::QuantizedBatchMatmul => Indexing::projections(
                4,
                [&[0, 1, 3][..], &[0, 3, 2], &[0, 1, 2]],
                [P, P, P, R],
            ),
            Self::Conv(conv) => conv.indexing(),
        }
    }
}

/// A reduction with explicit indexing maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericReduction {
    /// Maps for lhs, rhs and output, in that order.
    pub maps: Vec<AffineMap>,
    /// One kind per iteration dimension.
    pub iterators: Vec<IteratorKind>,
}

/// The kernel a reduction runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionKernel {
    /// A named kernel.
    Named(NamedKernel),
    /// An explicitly indexed reduction.
    Generic(GenericReduction),
}

/// Indexing maps (lhs, rhs, output) plus iterator kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Indexing {
    /// Maps for lhs, rhs and output, in that order.
    pub maps: Vec<AffineMap>,
    /// One kind per iteration dimension.
    pub iterators: Vec<IteratorKind>,
}

impl Indexing {
    fn new<E>(num_dims: usize, operands: [E; 3], iterators: Vec<IteratorKind>) -> Self
    where
        E: IntoIterator<Item = AffineExpr>,
    {
        Self {
            maps: operands
                .into_iter()
                .map(|results| AffineMap::new(num_dims, results))
                .collect(),
            iterators,
        }
    }

    fn projections<const N: usize>(
        num_dims: usize,
        operands: [&[usize]; 3],
        iterators: [IteratorKind; N],
    ) -> Self {
        Self {
            maps: operands
                .iter()
                .map(|dims| AffineMap::projection(num_dims, dims.iter().copied()))
                .collect(),
            iterators: iterators.to_vec(),
        }
    }

    /// Returns the number of iteration dimensions.
    #[must_use]
    pub fn num_loops(&self) -> usize {
        self.iterators.len()
    }

    /// Returns the positions of the reduction dimensions.
    #[must_use]
    pub fn reduction_dims(&self) -> Vec<usize> {
        self.iterators
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == IteratorKind::Reduction)
            .map(|(i, _)| i)
            .collect()
    }
}

/// A complete reduction: kernel, combine function and input extension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionSpec {
    /// The kernel.
    pub kernel: ReductionKernel,
    /// The combine function.
    pub combine: Combine,
    /// How integer inputs widen to the accumulator.
    pub cast: CastKind,
}

impl ReductionSpec {
    /// A reduction running a named kernel.
    #[must_use]
    pub fn named(kernel: NamedKernel) -> Self {
        let combine = if kernel.is_quantized() {
            Combine::QuantizedMulAdd
        } else {
            Combine::MulAdd
        };
        Self {
            kernel: ReductionKernel::Named(kernel),
            combine,
            cast: CastKind::Signed,
        }
    }

    /// A generic reduction over explicit maps.
    #[must_use]
    pub fn generic(maps: Vec<AffineMap>, iterators: Vec<IteratorKind>, quantized: bool) -> Self {
        Self {
            kernel: ReductionKernel::Generic(GenericReduction { maps, iterators }),
            combine: if quantized {
                Combine::QuantizedMulAdd
            } else {
                Combine::MulAdd
            },
            cast: CastKind::Signed,
        }
    }

    /// Sets the input extension mode.
    #[must_use]
    pub fn with_cast(mut self, cast: CastKind) -> Self {
        self.cast = cast;
        self
    }

    /// Returns the indexing of this reduction.
    #[must_use]
    pub fn indexing(&self) -> Indexing {
        match &self.kernel {
            ReductionKernel::Named(kernel) => kernel.indexing(),
            ReductionKernel::Generic(generic) => Indexing {
                maps: generic.maps.clone(),
                iterators: generic.iterators.clone(),
            },
        }
    }

    /// Returns a printable kernel name.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.kernel {
            ReductionKernel::Named(kernel) => kernel.name(),
            ReductionKernel::Generic(_) => "generic".into(),
        }
    }

    /// Returns true if the reduction takes zero-point operands.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.combine == Combine::QuantizedMulAdd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(variant: ConvVariant, spatial: usize, quantized: bool) -> ConvKernel {
        ConvKernel {
            variant,
            strides: SmallVec::from_elem(2, spatial),
            dilations: SmallVec::from_elem(1, spatial),
            quantized,
        }
    }

    // === Naming Tests ===

    #[test]
    fn test_conv_names() {
        let k = conv(ConvVariant::Standard(ConvLayout::ChannelFirst), 2, false);
        assert_eq!(k.name(), "conv_2d_nchw_fchw");
        let k = conv(ConvVariant::Standard(ConvLayout::ChannelLast), 3, true);
        assert_eq!(k.name(), "conv_3d_ndhwc_dhwcf_q");
        let k = conv(ConvVariant::Depthwise(ConvLayout::ChannelFirst), 1, false);
        assert_eq!(k.name(), "depthwise_conv_1d_ncw_cw");
        let k = conv(ConvVariant::Depthwise(ConvLayout::ChannelLast), 2, true);
        assert_eq!(k.name(), "depthwise_conv_2d_nhwc_hwc_q");
        let k = conv(ConvVariant::Grouped, 2, false);
        assert_eq!(k.name(), "conv_2d_ngchw_gfchw");
    }

    // === Indexing Tests ===

    #[test]
    fn test_matmul_indexing() {
        let idx = NamedKernel::Matmul.indexing();
        assert_eq!(idx.num_loops(), 3);
        assert_eq!(idx.reduction_dims(), vec![2]);
        assert_eq!(idx.maps[0].to_string(), "(d0, d1, d2) -> (d0, d2)");
        assert_eq!(idx.maps[1].to_string(), "(d0, d1, d2) -> (d2, d1)");
        assert_eq!(idx.maps[2].to_string(), "(d0, d1, d2) -> (d0, d1)");
    }

    #[test]
    fn test_dot_has_scalar_output() {
        let idx = NamedKernel::Dot.indexing();
        assert!(idx.maps[2].results().is_empty());
        assert_eq!(idx.iterators, vec![IteratorKind::Reduction]);
    }

    #[test]
    fn test_conv_2d_indexing() {
        let idx = NamedKernel::Conv(conv(ConvVariant::Standard(ConvLayout::ChannelFirst), 2, false))
            .indexing();
        // n, f, oh, ow, c, kh, kw
        assert_eq!(idx.num_loops(), 7);
        assert_eq!(idx.reduction_dims(), vec![4, 5, 6]);
        assert_eq!(
            idx.maps[0].to_string(),
            "(d0, d1, d2, d3, d4, d5, d6) -> (d0, d4, d2 * 2 + d5, d3 * 2 + d6)"
        );
        assert_eq!(idx.maps[1].results().len(), 4);
        assert_eq!(idx.maps[2].to_string(), "(d0, d1, d2, d3, d4, d5, d6) -> (d0, d1, d2, d3)");
    }

    #[test]
    fn test_channel_last_indexing() {
        let idx = NamedKernel::Conv(conv(ConvVariant::Standard(ConvLayout::ChannelLast), 1, true))
            .indexing();
        // n, f, ow, c, kw
        assert_eq!(idx.maps[0].to_string(), "(d0, d1, d2, d3, d4) -> (d0, d2 * 2 + d4, d3)");
        assert_eq!(idx.maps[1].to_string(), "(d0, d1, d2, d3, d4) -> (d4, d3, d1)");
        assert_eq!(idx.maps[2].to_string(), "(d0, d1, d2, d3, d4) -> (d0, d2, d1)");
    }

    #[test]
    fn test_grouped_indexing() {
        let idx = NamedKernel::Conv(conv(ConvVariant::Grouped, 2, false)).indexing();
        assert_eq!(idx.num_loops(), 8);
        assert_eq!(idx.maps[0].results().len(), 5);
        assert_eq!(idx.maps[1].results().len(), 5);
        assert_eq!(idx.maps[2].results().len(), 5);
        assert_eq!(idx.reduction_dims(), vec![5, 6, 7]);
    }

    #[test]
    fn test_spec_combine_follows_kernel() {
        assert_eq!(ReductionSpec::named(NamedKernel::Matmul).combine, Combine::MulAdd);
        let q = ReductionSpec::named(NamedKernel::QuantizedBatchMatmul);
        assert!(q.is_quantized());
        assert_eq!(q.name(), "quantized_batch_matmul");
    }
}
