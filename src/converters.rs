//! Converter callbacks that fill record-layout tensors.
//!
//! The record layout is produced outside this crate. The surrounding
//! system supplies the converters, either on a [`Converters`] value handed
//! to an evaluator or once per process through [`register_converters`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::batch::PositionBatch;
use crate::error::EvaluatorError;

/// Fills `(primary, secondary)` from a position batch. The flag says
/// whether per-move auxiliary data is wanted.
pub type ToFlatFn = dyn Fn(&dyn PositionBatch, bool, &mut [f32], Option<&mut [f32]>) + Send + Sync;

/// Fills `(primary, secondary)` from input already in the converter's
/// native representation.
pub type FromNativeFn = dyn Fn(&dyn Any, &mut [f32], Option<&mut [f32]>) + Send + Sync;

#[derive(Clone, Default)]
pub struct Converters {
    to_flat: Option<Arc<ToFlatFn>>,
    from_native: Option<Arc<FromNativeFn>>,
}

impl Converters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_to_flat(
        mut self,
        f: impl Fn(&dyn PositionBatch, bool, &mut [f32], Option<&mut [f32]>) + Send + Sync + 'static,
    ) -> Self {
        self.to_flat = Some(Arc::new(f));
        self
    }

    pub fn with_from_native(
        mut self,
        f: impl Fn(&dyn Any, &mut [f32], Option<&mut [f32]>) + Send + Sync + 'static,
    ) -> Self {
        self.from_native = Some(Arc::new(f));
        self
    }

    pub fn to_flat(&self) -> Result<&ToFlatFn, EvaluatorError> {
        self.to_flat.as_deref().ok_or_else(|| {
            EvaluatorError::Configuration("a to-flat converter must be registered".to_string())
        })
    }

    pub fn from_native(&self) -> Result<&FromNativeFn, EvaluatorError> {
        self.from_native.as_deref().ok_or_else(|| {
            EvaluatorError::Configuration(
                "a from-native converter must be registered".to_string(),
            )
        })
    }
}

impl fmt::Debug for Converters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converters")
            .field("to_flat", &self.to_flat.is_some())
            .field("from_native", &self.from_native.is_some())
            .finish()
    }
}

static REGISTERED: OnceLock<Converters> = OnceLock::new();

/// Installs the process-wide converters. Only the first call succeeds.
pub fn register_converters(converters: Converters) -> Result<(), EvaluatorError> {
    REGISTERED.set(converters).map_err(|_| {
        EvaluatorError::Configuration("converters were already registered".to_string())
    })
}

/// The process-wide converters, or an empty set if none were registered.
pub fn registered_converters() -> Converters {
    REGISTERED.get().cloned().unwrap_or_default()
}
