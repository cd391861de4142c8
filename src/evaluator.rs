use std::any::Any;
use std::sync::Arc;

use log::{debug, info};

use crate::{
    batch::PositionBatch,
    buffers::{ScratchBufferPool, with_thread_pool},
    cache::{EngineCache, EngineFingerprint},
    config::EvaluatorConfig,
    converters::{Converters, registered_converters},
    engine::{EngineHandle, ExecutionEngine},
    error::EvaluatorError,
    onnx::OnnxEngine,
    postprocess::{LegalityFn, MoveIndexFn, ResultPostProcessor},
    stager::{BatchInput, BatchInputStager},
    types::{EvaluationBatch, Head, OutputScalar},
};

/// Batch evaluator over one execution engine.
///
/// Evaluation calls may come from many threads; they queue on the engine
/// and run one at a time. Each caller brings its own staging buffers,
/// either an explicit [`ScratchBufferPool`] or the thread's own through
/// the `*_on_thread` methods.
pub struct OnnxEvaluator {
    config: EvaluatorConfig,
    engine: Arc<EngineHandle>,
    converters: Converters,
}

impl OnnxEvaluator {
    /// Loads the configured model into a fresh ONNX Runtime session.
    pub fn new(config: EvaluatorConfig) -> Result<Self, EvaluatorError> {
        Self::with_cache(config, &EngineCache::disabled())
    }

    /// Like [`OnnxEvaluator::new`], reusing a session from `cache` when one
    /// was built for an identical configuration.
    pub fn with_cache(config: EvaluatorConfig, cache: &EngineCache) -> Result<Self, EvaluatorError> {
        Self::with_cache_using(config, cache, |config| {
            let engine: Box<dyn ExecutionEngine> = Box::new(OnnxEngine::new(config)?);
            Ok(engine)
        })
    }

    /// Cache lookup with a custom engine builder.
    pub fn with_cache_using(
        config: EvaluatorConfig,
        cache: &EngineCache,
        build: impl FnOnce(&EvaluatorConfig) -> Result<Box<dyn ExecutionEngine>, EvaluatorError>,
    ) -> Result<Self, EvaluatorError> {
        config.validate()?;
        let engine = cache.get_or_insert_with(EngineFingerprint::of(&config), || {
            Ok(EngineHandle::from_boxed(build(&config)?))
        })?;
        Self::from_handle(config, engine)
    }

    /// Wraps an already constructed engine.
    pub fn with_engine(
        config: EvaluatorConfig,
        engine: impl ExecutionEngine + 'static,
    ) -> Result<Self, EvaluatorError> {
        Self::from_handle(config, Arc::new(EngineHandle::new(engine)))
    }

    fn from_handle(config: EvaluatorConfig, engine: Arc<EngineHandle>) -> Result<Self, EvaluatorError> {
        config.validate()?;
        check_heads(&config, &engine)?;
        Ok(Self {
            config,
            engine,
            converters: registered_converters(),
        })
    }

    /// Uses `converters` instead of the process-wide ones.
    pub fn with_converters(mut self, converters: Converters) -> Self {
        self.converters = converters;
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn network_id(&self) -> &str {
        &self.config.network_id
    }

    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    pub fn is_wdl(&self) -> bool {
        self.config.heads.wdl
    }

    pub fn has_moves_left(&self) -> bool {
        self.config.heads.moves_left
    }

    pub fn has_uncertainty(&self) -> bool {
        self.config.heads.uncertainty
    }

    /// Evaluators of the same network produce the same output.
    pub fn is_equivalent_to(&self, other: &OnnxEvaluator) -> bool {
        self.config.network_id == other.config.network_id
    }

    /// Evaluates `batch`, staging inputs in `pool`.
    ///
    /// With `legality`, every move it rejects gets the illegal-move logit.
    pub fn evaluate<T: OutputScalar>(
        &self,
        batch: &dyn PositionBatch,
        pool: &mut ScratchBufferPool,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        self.run(BatchInput::Positions(batch), pool, legality)
    }

    /// Evaluates input already in the record converter's native form.
    /// Only record-layout networks accept it.
    pub fn evaluate_native<T: OutputScalar>(
        &self,
        input: &dyn Any,
        num_positions: usize,
        uses_secondary: bool,
        pool: &mut ScratchBufferPool,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        let input = BatchInput::Native {
            input,
            num_positions,
            uses_secondary,
        };
        self.run(input, pool, legality)
    }

    /// [`OnnxEvaluator::evaluate`] with the calling thread's buffers.
    pub fn evaluate_on_thread<T: OutputScalar>(
        &self,
        batch: &dyn PositionBatch,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        with_thread_pool(|pool| self.evaluate(batch, pool, legality))
    }

    /// [`OnnxEvaluator::evaluate_native`] with the calling thread's buffers.
    pub fn evaluate_native_on_thread<T: OutputScalar>(
        &self,
        input: &dyn Any,
        num_positions: usize,
        uses_secondary: bool,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        with_thread_pool(|pool| {
            self.evaluate_native(input, num_positions, uses_secondary, pool, legality)
        })
    }

    fn run<T: OutputScalar>(
        &self,
        input: BatchInput<'_>,
        pool: &mut ScratchBufferPool,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        let processor = ResultPostProcessor::new(&self.config);
        let staged = BatchInputStager::new(&self.config, &self.converters).stage(input, pool)?;
        let n = staged.num_positions;
        if n == 0 {
            let heads = self.config.heads;
            return Ok(EvaluationBatch::new(
                0,
                heads.wdl,
                Vec::new(),
                Vec::new(),
                heads.moves_left.then(Vec::new),
                heads.uncertainty.then(Vec::new),
            )
            .with_policy_kind(self.config.policy_kind));
        }

        let batch_moves = |position: usize, slot: usize| match input {
            BatchInput::Positions(batch) => batch
                .moves(position)
                .and_then(|moves| moves.get(slot))
                .map(|&idx| usize::from(idx)),
            BatchInput::Native { .. } => None,
        };
        let move_index: Option<MoveIndexFn<'_>> = match input {
            BatchInput::Positions(_) => Some(&batch_moves),
            BatchInput::Native { .. } => None,
        };

        let raw = {
            let mut engine = self.engine.lock()?;
            let mut raw = engine
                .execute(self.config.heads.wdl, staged.primary, staged.secondary, n)
                .map_err(|e| self.attribute(e))?;
            processor.prepare_policy(&mut raw, n, move_index, legality)?;
            raw
        };

        let result = processor.assemble(raw, n)?;
        debug!("evaluated {} positions with {}", n, self.config.network_id);
        Ok(result)
    }

    /// Engines may be shared, so head mismatches they report are
    /// attributed to this evaluator's network.
    fn attribute(&self, error: EvaluatorError) -> EvaluatorError {
        match error {
            EvaluatorError::ConfigurationMismatch { head, .. } => {
                EvaluatorError::ConfigurationMismatch {
                    head,
                    network_id: self.config.network_id.clone(),
                }
            }
            other => other,
        }
    }

    /// Stops engine profiling, returning the profile file if one was written.
    pub fn end_profiling(&self) -> Result<Option<String>, EvaluatorError> {
        self.engine.lock()?.end_profiling()
    }

    /// Releases this evaluator's hold on the engine. The engine is freed
    /// once no cache or other evaluator shares it.
    pub fn shutdown(self) {
        let shared = Arc::strong_count(&self.engine) - 1;
        info!(
            "Shutting down evaluator {} ({} other holders of its engine)",
            self.config.network_id, shared
        );
    }
}

/// Fails fast when the configuration names a head the engine lacks.
fn check_heads(config: &EvaluatorConfig, engine: &EngineHandle) -> Result<(), EvaluatorError> {
    let engine = engine.lock()?;
    let heads = config.heads;
    let outputs = &config.outputs;

    let required = [
        (Head::Wdl, &outputs.wdl, heads.wdl),
        (Head::Value, &outputs.value, !heads.wdl),
        (Head::Policy, &outputs.policy, true),
        (Head::MovesLeft, &outputs.moves_left, heads.moves_left),
        (Head::Uncertainty, &outputs.uncertainty, heads.uncertainty),
    ];
    for (head, name, wanted) in required {
        if wanted && !engine.has_output(name) {
            return Err(EvaluatorError::ConfigurationMismatch {
                head,
                network_id: config.network_id.clone(),
            });
        }
    }
    Ok(())
}
