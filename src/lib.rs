//! Batch evaluation of chess positions with ONNX neural networks.
//!
//! This crate sits between a search and a loaded network. It stages a
//! batch of positions into flat input tensors, runs the network once per
//! batch through ONNX Runtime, and turns the raw head outputs back into
//! per-position results: a value (scalar or win/draw/loss), a policy over
//! the 1858-move index space, and the optional moves-left and uncertainty
//! heads.
//!
//! The principal type is [`OnnxEvaluator`]. One evaluator may be shared
//! by many threads; executions on its engine are serialized while staging
//! happens in per-caller [`ScratchBufferPool`]s. Engines can be reused
//! across evaluators through an explicit [`EngineCache`].
//!
//! Illegal moves are masked with [`ILLEGAL_MOVE_LOGIT`] when the caller
//! supplies a legality predicate, for example one backed by a
//! [`LegalityMask`] built from `shakmaty` positions.
//!
//! The library re-exports `shakmaty` to make position construction easy.

mod batch;
mod buffers;
mod cache;
mod config;
mod converters;
mod engine;
mod error;
mod evaluator;
mod moves;
mod onnx;
mod postprocess;
mod stager;
mod types;

#[cfg(test)]
mod test_util;

/// Main evaluator.
pub use evaluator::OnnxEvaluator;

/// Error type produced by library operations.
pub use error::EvaluatorError;

/// Evaluator configuration.
pub use config::{
    DEFAULT_BYTES_PER_SQUARE_RECORD, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MOVES_RECORD_LEN, Device,
    EvaluatorConfig, HeadFlags, InputNames, ModelBytes, ModelIdentity, ModelSource, NetworkFamily,
    OutputNames, PLANES_PER_POSITION, Precision, RULE50_PLANE, RULE50_SCALE, RuntimeBackend,
    SQUARES, bytes_fingerprint,
};

/// Input batches and their staging.
pub use batch::{PlanesBatch, PositionBatch};
pub use buffers::{ScratchBufferPool, with_thread_pool};
pub use converters::{
    Converters, FromNativeFn, ToFlatFn, register_converters, registered_converters,
};
pub use stager::{BatchInput, BatchInputStager, StagedInput};

/// Execution engines and their reuse.
pub use cache::{EngineCache, EngineFingerprint};
pub use engine::{EngineHandle, ExecutionEngine, RawExecutionResult};
pub use onnx::OnnxEngine;

/// Output post-processing and data structures.
pub use postprocess::{
    ILLEGAL_MOVE_LOGIT, LegalityFn, MoveIndexFn, ResultPostProcessor, apply_legality_mask,
    expand_compact_policy,
};
pub use types::{
    EvaluationBatch, Head, MoveProbability, OutputScalar, PolicyKind, PositionEvaluation,
    ValueEstimate,
};

/// Move index space and legality masks.
pub use moves::{
    LegalityMask, MOVE_SPACE, index_to_move, legal_move_indices, legal_move_indices_from_fen,
    move_index, network_move,
};

/// Re-export of `shakmaty` for convenience when building positions.
pub use shakmaty;
