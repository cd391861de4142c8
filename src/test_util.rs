//! Deterministic engine for tests that don't need a model file.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::OutputNames;
use crate::engine::{ExecutionEngine, RawExecutionResult};
use crate::error::EvaluatorError;
use crate::moves::MOVE_SPACE;

/// Shared observations of a [`MockEngine`].
#[derive(Debug, Default)]
pub struct MockStats {
    pub executions: AtomicUsize,
    pub last_primary_len: AtomicUsize,
    pub last_secondary_len: AtomicUsize,
    in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
}

/// Produces outputs derived from the position index so tests can check
/// ordering:
/// - scalar value `i / 10`, WDL logits `[i, 0, -i]`
/// - policy entry `(i, j)` is `i + j / 10000`
/// - moves-left `10 + i`, uncertainty `i / 100`
pub struct MockEngine {
    outputs: HashSet<String>,
    names: OutputNames,
    policy_width: usize,
    delay: Option<Duration>,
    failure: Option<fn() -> EvaluatorError>,
    panic_next: bool,
    pub stats: Arc<MockStats>,
}

impl MockEngine {
    /// Engine exposing value, WDL and policy outputs.
    pub fn new() -> Self {
        let names = OutputNames::default();
        let outputs = [&names.value, &names.wdl, &names.policy]
            .into_iter()
            .cloned()
            .collect();
        Self {
            outputs,
            names,
            policy_width: MOVE_SPACE,
            delay: None,
            failure: None,
            panic_next: false,
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn with_moves_left(mut self) -> Self {
        self.outputs.insert(self.names.moves_left.clone());
        self
    }

    pub fn with_uncertainty(mut self) -> Self {
        self.outputs.insert(self.names.uncertainty.clone());
        self
    }

    pub fn with_policy_width(mut self, width: usize) -> Self {
        self.policy_width = width;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next execution fails with the error `make` builds.
    pub fn with_failure(mut self, make: fn() -> EvaluatorError) -> Self {
        self.failure = Some(make);
        self
    }

    /// The next execution panics.
    pub fn with_panic(mut self) -> Self {
        self.panic_next = true;
        self
    }

    pub fn without_output(mut self, name: &str) -> Self {
        self.outputs.remove(name);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

impl ExecutionEngine for MockEngine {
    fn execute(
        &mut self,
        wdl: bool,
        primary: &[f32],
        secondary: Option<&[f32]>,
        num_positions: usize,
    ) -> Result<RawExecutionResult, EvaluatorError> {
        if self.stats.in_flight.swap(true, Ordering::SeqCst) {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        self.stats.executions.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut self.panic_next) {
            panic!("mock engine panicked mid-execution");
        }
        if let Some(make) = self.failure.take() {
            self.stats.in_flight.store(false, Ordering::SeqCst);
            return Err(make());
        }
        self.stats
            .last_primary_len
            .store(primary.len(), Ordering::SeqCst);
        self.stats
            .last_secondary_len
            .store(secondary.map_or(0, <[f32]>::len), Ordering::SeqCst);

        let n = num_positions;
        let has = |name: &String| self.outputs.contains(name);
        let result = RawExecutionResult {
            values: (!wdl && has(&self.names.value))
                .then(|| (0..n).map(|i| i as f32 / 10.0).collect()),
            wdl: (wdl && has(&self.names.wdl)).then(|| {
                (0..n)
                    .flat_map(|i| [i as f32, 0.0, -(i as f32)])
                    .collect()
            }),
            policy: (0..n)
                .flat_map(|i| (0..self.policy_width).map(move |j| i as f32 + j as f32 / 10000.0))
                .collect(),
            policy_width: self.policy_width,
            moves_left: has(&self.names.moves_left)
                .then(|| (0..n).map(|i| 10.0 + i as f32).collect()),
            uncertainty: has(&self.names.uncertainty)
                .then(|| (0..n).map(|i| i as f32 / 100.0).collect()),
        };

        self.stats.in_flight.store(false, Ordering::SeqCst);
        Ok(result)
    }

    fn has_output(&self, name: &str) -> bool {
        self.outputs.contains(name)
    }
}
