//! The execution engine seam.
//!
//! An [`ExecutionEngine`] runs one forward pass over a staged batch and
//! reports the raw head arrays. Engines keep scratch state between calls,
//! so a handle allows at most one execution in flight. Scaling out means
//! more handles (one per device), not more threads on one handle.

use std::sync::{Mutex, MutexGuard};

use crate::error::EvaluatorError;

/// Head arrays exactly as the engine produced them, in input order.
///
/// Arrays are `f32`; half-precision sessions are widened on extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExecutionResult {
    /// Scalar value head, one entry per position.
    pub values: Option<Vec<f32>>,
    /// Win/draw/loss head, three entries per position.
    pub wdl: Option<Vec<f32>>,
    /// Policy, `policy_width` entries per position.
    pub policy: Vec<f32>,
    pub policy_width: usize,
    pub moves_left: Option<Vec<f32>>,
    pub uncertainty: Option<Vec<f32>>,
}

pub trait ExecutionEngine: Send {
    /// Runs a forward pass over `num_positions` staged positions.
    ///
    /// `wdl` selects the win/draw/loss value output over the scalar one.
    fn execute(
        &mut self,
        wdl: bool,
        primary: &[f32],
        secondary: Option<&[f32]>,
        num_positions: usize,
    ) -> Result<RawExecutionResult, EvaluatorError>;

    /// Whether the loaded model exposes an output with this name.
    fn has_output(&self, name: &str) -> bool;

    /// Stops profiling and returns the profile file, if profiling was on.
    fn end_profiling(&mut self) -> Result<Option<String>, EvaluatorError> {
        Ok(None)
    }
}

/// An engine behind its exclusive-access guard.
pub struct EngineHandle {
    engine: Mutex<Box<dyn ExecutionEngine>>,
}

impl EngineHandle {
    pub fn new(engine: impl ExecutionEngine + 'static) -> Self {
        Self::from_boxed(Box::new(engine))
    }

    pub fn from_boxed(engine: Box<dyn ExecutionEngine>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Blocks until no other caller is using the engine.
    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn ExecutionEngine>>, EvaluatorError> {
        self.engine.lock().map_err(|_| EvaluatorError::EnginePoisoned)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}
