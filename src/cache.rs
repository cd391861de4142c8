//! Reuse of loaded engines across evaluators.
//!
//! Loading a model dominates the cost of any single batch, so evaluators
//! built from identical configurations may share one engine handle. The
//! cache is an explicit object owned by whoever builds evaluators. It is
//! disabled unless constructed with [`EngineCache::with_capacity`], because
//! an engine may hold device state tied to the configuration it was built
//! for.
//!
//! Eviction is FIFO. Evicting or invalidating an entry only drops the
//! cache's reference; evaluators already holding the handle keep it alive.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::config::{
    Device, EvaluatorConfig, HeadFlags, InputNames, ModelIdentity, NetworkFamily, OutputNames,
    Precision, RuntimeBackend,
};
use crate::engine::EngineHandle;
use crate::error::EvaluatorError;

/// Every configuration field that reaches the engine.
///
/// Fields only used while staging or post-processing (network id, value
/// activation, 50-move scaling, moves flag) are left out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineFingerprint {
    model: ModelIdentity,
    family: NetworkFamily,
    device: Device,
    runtime: RuntimeBackend,
    precision: Precision,
    max_batch_size: usize,
    heads: HeadFlags,
    outputs: OutputNames,
    inputs: InputNames,
    intra_threads: Option<usize>,
    profiling: Option<PathBuf>,
}

impl EngineFingerprint {
    pub fn of(config: &EvaluatorConfig) -> Self {
        Self {
            model: config.model.identity(),
            family: config.family,
            device: config.device,
            runtime: config.runtime,
            precision: config.precision,
            max_batch_size: config.max_batch_size,
            heads: config.heads,
            outputs: config.outputs.clone(),
            inputs: config.inputs.clone(),
            intra_threads: config.intra_threads,
            profiling: config.profiling.clone(),
        }
    }
}

#[derive(Default)]
struct Entries {
    handles: HashMap<EngineFingerprint, Arc<EngineHandle>>,
    insertion_order: VecDeque<EngineFingerprint>,
}

#[derive(Default)]
pub struct EngineCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl EngineCache {
    /// A cache that never retains anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A cache holding up to `capacity` engines.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns the cached handle for `fingerprint`, building and caching one
    /// with `build` on a miss.
    ///
    /// Builds run under the cache lock so concurrent misses on the same
    /// fingerprint load the model once.
    pub fn get_or_insert_with(
        &self,
        fingerprint: EngineFingerprint,
        build: impl FnOnce() -> Result<EngineHandle, EvaluatorError>,
    ) -> Result<Arc<EngineHandle>, EvaluatorError> {
        if !self.is_enabled() {
            return Ok(Arc::new(build()?));
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = entries.handles.get(&fingerprint) {
            debug!("engine cache hit for {:?}", fingerprint.model);
            return Ok(handle.clone());
        }

        debug!("engine cache miss for {:?}", fingerprint.model);
        let handle = Arc::new(build()?);
        entries.handles.insert(fingerprint.clone(), handle.clone());
        entries.insertion_order.push_back(fingerprint);

        while entries.handles.len() > self.capacity {
            let Some(oldest) = entries.insertion_order.pop_front() else {
                break;
            };
            debug!("engine cache evicting {:?}", oldest.model);
            entries.handles.remove(&oldest);
        }
        Ok(handle)
    }

    /// Drops the cached handle for `fingerprint`, if any.
    pub fn invalidate(&self, fingerprint: &EngineFingerprint) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insertion_order.retain(|f| f != fingerprint);
        entries.handles.remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.handles.clear();
        entries.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
