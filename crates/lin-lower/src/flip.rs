//! Axis reversal.

use lin_ir::{Axis, LinearKind, LinearOp, TensorType, ValueId};
use tracing::debug;

use crate::builder::Builder;
use crate::dispatch::LoweringRule;
use crate::{LowerConfig, LowerError};

/// Lowers `flip`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlipRule;

impl LoweringRule for FlipRule {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn kind(&self) -> LinearKind {
        LinearKind::Flip
    }

    fn lower(
        &self,
        op: &LinearOp,
        result: &TensorType,
        b: &mut Builder<'_>,
        _config: &LowerConfig,
    ) -> Result<ValueId, LowerError> {
        let LinearOp::Flip(flip) = op else {
            return Err(LowerError::no_match("expected flip"));
        };
        let dims = flip
            .dims
            .as_const()
            .ok_or_else(|| LowerError::no_match("flip dims must be constant"))?;
        let rank = b.tensor_type(flip.input)?.rank();
        let mut axes = dims
            .iter()
            .map(|&d| {
                Axis::new(d).normalize(rank).ok_or_else(|| {
                    LowerError::no_match(format!("flip axis {d} out of range for rank {rank}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        axes.sort_unstable();
        axes.dedup();
        debug!(?axes, "flip");
        let flipped = b.flip(flip.input, axes)?;
        b.finish(flipped, result)
    }
}
