//! Error types for the batch evaluator.
//!
//! A single enumeration covers every failure the evaluation pipeline can
//! surface. Foreign errors from ONNX Runtime, `ndarray`, `shakmaty` and
//! configuration loading are wrapped so callers handle one type.
//! Nothing in this crate retries or substitutes a default value when one
//! of these is produced.

use thiserror::Error;

use crate::types::Head;

#[derive(Error, Debug)]
pub enum EvaluatorError {
    /// Setup defect: a converter was never registered or a configuration
    /// value is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The configuration flags a head that the loaded model does not expose.
    #[error("evaluator `{network_id}` was configured with a {head} head but the network does not produce it")]
    ConfigurationMismatch { head: Head, network_id: String },

    /// The operation is not available for the configured network family.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Wraps an error returned by the underlying ONNX Runtime bindings.
    #[error("ONNX Runtime error: {0}")]
    EngineExecution(#[from] ort::Error),

    /// An array did not have the length the batch requires.
    #[error("{what} has length {actual}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch of {requested} positions exceeds evaluator capacity of {capacity}")]
    BatchTooLarge { requested: usize, capacity: usize },

    /// A previous execution panicked while holding the engine.
    #[error("execution engine lock poisoned by an earlier panic")]
    EnginePoisoned,

    /// Occurs when an ndarray has an unexpected shape during tensor
    /// preparation or extraction.
    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// The provided FEN string could not be parsed.
    #[error("Invalid FEN: {0}")]
    InvalidFen(#[from] shakmaty::fen::ParseFenError),

    /// A parsed position is invalid from the perspective of `shakmaty`.
    #[error("Invalid Chess Position: {0}")]
    InvalidPosition(#[from] shakmaty::PositionError<shakmaty::Chess>),

    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
