//! Value environment.

use lin_ir::ValueId;
use rustc_hash::FxHashMap;

use crate::value::{RtValue, Tensor};
use crate::EvalError;

/// Values computed so far, keyed by the node that produced them.
#[derive(Clone, Debug, Default)]
pub struct Env {
    values: FxHashMap<ValueId, RtValue>,
}

impl Env {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the value of `id`.
    pub fn insert(&mut self, id: ValueId, value: RtValue) {
        self.values.insert(id, value);
    }

    /// Returns the value of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Unbound`] if `id` has not been evaluated.
    pub fn get(&self, id: ValueId) -> Result<&RtValue, EvalError> {
        self.values.get(&id).ok_or(EvalError::Unbound(id))
    }

    /// Returns the index value of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::TypeError`] if `id` holds something else.
    pub fn index(&self, id: ValueId) -> Result<i64, EvalError> {
        match self.get(id)? {
            RtValue::Index(n) => Ok(*n),
            other => Err(EvalError::TypeError {
                expected: "index".into(),
                got: other.kind().into(),
            }),
        }
    }

    /// Returns the numeric value of a scalar or index.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::TypeError`] for tensors and units.
    #[allow(clippy::cast_precision_loss)]
    pub fn number(&self, id: ValueId) -> Result<f64, EvalError> {
        match self.get(id)? {
            RtValue::Index(n) => Ok(*n as f64),
            RtValue::Scalar { value, .. } => Ok(*value),
            other => Err(EvalError::TypeError {
                expected: "scalar".into(),
                got: other.kind().into(),
            }),
        }
    }

    /// Returns the tensor value of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::TypeError`] if `id` holds something else.
    pub fn tensor(&self, id: ValueId) -> Result<&Tensor, EvalError> {
        let value = self.get(id)?;
        value.as_tensor().ok_or_else(|| EvalError::TypeError {
            expected: "tensor".into(),
            got: value.kind().into(),
        })
    }

    /// Returns the number of values held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no value is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
