//! Turns raw head arrays into an [`EvaluationBatch`].
//!
//! Processing happens in two phases. [`ResultPostProcessor::prepare_policy`]
//! brings the policy into full move-space form and applies the legality
//! mask. It runs while the engine is still held, since the raw arrays may
//! be engine scratch. [`ResultPostProcessor::assemble`] validates the
//! remaining heads and converts everything to the output scalar.

use crate::config::EvaluatorConfig;
use crate::engine::RawExecutionResult;
use crate::error::EvaluatorError;
use crate::moves::MOVE_SPACE;
use crate::types::{EvaluationBatch, Head, OutputScalar};

/// Policy value written over illegal moves.
pub const ILLEGAL_MOVE_LOGIT: f32 = -100.0;

/// `(position, move index) -> legal`.
pub type LegalityFn<'a> = &'a (dyn Fn(usize, usize) -> bool + 'a);

/// `(position, move-list slot) -> move index`, `None` past the end of the list.
pub type MoveIndexFn<'a> = &'a (dyn Fn(usize, usize) -> Option<usize> + 'a);

/// Overwrites every illegal entry of a full-width policy with
/// [`ILLEGAL_MOVE_LOGIT`]. Shape and legal entries are untouched.
pub fn apply_legality_mask(policy: &mut [f32], num_positions: usize, is_legal: LegalityFn<'_>) {
    for (i, row) in policy
        .chunks_exact_mut(MOVE_SPACE)
        .take(num_positions)
        .enumerate()
    {
        for (j, logit) in row.iter_mut().enumerate() {
            if !is_legal(i, j) {
                *logit = ILLEGAL_MOVE_LOGIT;
            }
        }
    }
}

/// Scatters a policy indexed by move-list slot into the full move space.
/// Entries no move maps to stay zero.
pub fn expand_compact_policy(
    compact: &[f32],
    width: usize,
    num_positions: usize,
    move_index: MoveIndexFn<'_>,
) -> Result<Vec<f32>, EvaluatorError> {
    let mut expanded = vec![0.0; num_positions * MOVE_SPACE];
    for i in 0..num_positions {
        let source = &compact[i * width..(i + 1) * width];
        let target = &mut expanded[i * MOVE_SPACE..(i + 1) * MOVE_SPACE];
        for (slot, &logit) in source.iter().enumerate() {
            let Some(idx) = move_index(i, slot) else {
                break;
            };
            if idx >= MOVE_SPACE {
                return Err(EvaluatorError::ShapeMismatch {
                    what: "move index",
                    expected: MOVE_SPACE,
                    actual: idx,
                });
            }
            target[idx] = logit;
        }
    }
    Ok(expanded)
}

fn check_len(what: &'static str, data: &[f32], expected: usize) -> Result<(), EvaluatorError> {
    if data.len() != expected {
        return Err(EvaluatorError::ShapeMismatch {
            what,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn convert<T: OutputScalar>(data: &[f32]) -> Vec<T> {
    data.iter().map(|&v| T::from_f32(v)).collect()
}

pub struct ResultPostProcessor<'a> {
    config: &'a EvaluatorConfig,
}

impl<'a> ResultPostProcessor<'a> {
    pub fn new(config: &'a EvaluatorConfig) -> Self {
        Self { config }
    }

    fn mismatch(&self, head: Head) -> EvaluatorError {
        EvaluatorError::ConfigurationMismatch {
            head,
            network_id: self.config.network_id.clone(),
        }
    }

    /// Expands a compact policy if needed and masks illegal moves.
    pub fn prepare_policy(
        &self,
        raw: &mut RawExecutionResult,
        num_positions: usize,
        move_index: Option<MoveIndexFn<'_>>,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<(), EvaluatorError> {
        let width = raw.policy_width;
        check_len("policy", &raw.policy, num_positions * width)?;

        if width != MOVE_SPACE {
            if !self.config.family.compact_policy() {
                return Err(EvaluatorError::ShapeMismatch {
                    what: "policy width",
                    expected: MOVE_SPACE,
                    actual: width,
                });
            }
            let move_index = move_index.ok_or_else(|| {
                EvaluatorError::Configuration(
                    "compact policy output needs per-position move lists".to_string(),
                )
            })?;
            raw.policy = expand_compact_policy(&raw.policy, width, num_positions, move_index)?;
            raw.policy_width = MOVE_SPACE;
        }

        if let Some(is_legal) = legality {
            apply_legality_mask(&mut raw.policy, num_positions, is_legal);
        }
        Ok(())
    }

    /// Validates every head against the configuration and converts the
    /// batch to `T`. Expects a policy already in full move-space form.
    pub fn assemble<T: OutputScalar>(
        &self,
        raw: RawExecutionResult,
        num_positions: usize,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        let n = num_positions;
        let heads = self.config.heads;
        let logistic = self.config.value_head_logistic;

        let values = if heads.wdl {
            let mut wdl = raw.wdl.ok_or_else(|| self.mismatch(Head::Wdl))?;
            check_len("WDL head", &wdl, n * 3)?;
            if logistic {
                wdl.chunks_exact_mut(3).for_each(softmax);
            }
            wdl
        } else {
            let mut values = raw.values.ok_or_else(|| self.mismatch(Head::Value))?;
            check_len("value head", &values, n)?;
            if logistic {
                // 2 * sigmoid(x) - 1, keeping the value in [-1, 1].
                values.iter_mut().for_each(|v| *v = (*v / 2.0).tanh());
            }
            values
        };

        let moves_left = if heads.moves_left {
            let m = raw.moves_left.ok_or_else(|| self.mismatch(Head::MovesLeft))?;
            check_len("moves-left head", &m, n)?;
            Some(convert(&m))
        } else {
            None
        };

        let uncertainty = if heads.uncertainty {
            let u = raw
                .uncertainty
                .ok_or_else(|| self.mismatch(Head::Uncertainty))?;
            check_len("uncertainty head", &u, n)?;
            Some(convert(&u))
        } else {
            None
        };

        check_len("policy", &raw.policy, n * MOVE_SPACE)?;

        Ok(EvaluationBatch::new(
            n,
            heads.wdl,
            convert(&values),
            convert(&raw.policy),
            moves_left,
            uncertainty,
        )
        .with_policy_kind(self.config.policy_kind))
    }

    /// Both phases in one call.
    pub fn process<T: OutputScalar>(
        &self,
        mut raw: RawExecutionResult,
        num_positions: usize,
        move_index: Option<MoveIndexFn<'_>>,
        legality: Option<LegalityFn<'_>>,
    ) -> Result<EvaluationBatch<T>, EvaluatorError> {
        self.prepare_policy(&mut raw, num_positions, move_index, legality)?;
        self.assemble(raw, num_positions)
    }
}

fn softmax(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in logits.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in logits.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSource, NetworkFamily};
    use crate::moves::LegalityMask;
    use crate::types::{PolicyKind, ValueEstimate};
    use half::f16;

    fn config() -> EvaluatorConfig {
        EvaluatorConfig::new("unit", ModelSource::file("unit.onnx"), NetworkFamily::Planes)
    }

    fn raw_scalar(n: usize) -> RawExecutionResult {
        RawExecutionResult {
            values: Some((0..n).map(|i| i as f32 / 10.0).collect()),
            policy: (0..n * MOVE_SPACE).map(|k| (k % 97) as f32 / 10.0).collect(),
            policy_width: MOVE_SPACE,
            ..Default::default()
        }
    }

    #[test]
    fn output_is_sized_and_ordered_like_input() {
        let config = config();
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw_scalar(3), 3, None, None)
            .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.policy_flat().len(), 3 * MOVE_SPACE);
        for i in 0..3 {
            assert_eq!(batch.value(i), ValueEstimate::Scalar(i as f32 / 10.0));
            assert_eq!(batch.policy(i)[0], ((i * MOVE_SPACE) % 97) as f32 / 10.0);
        }
        assert_eq!(batch.moves_left(0), None);
        assert_eq!(batch.uncertainty(0), None);
    }

    #[test]
    fn flagged_head_missing_from_output_is_mismatch() {
        let config = config().with_moves_left(true);
        let processor = ResultPostProcessor::new(&config);
        for _ in 0..3 {
            let err = processor
                .process::<f32>(raw_scalar(1), 1, None, None)
                .unwrap_err();
            assert!(matches!(
                err,
                EvaluatorError::ConfigurationMismatch {
                    head: Head::MovesLeft,
                    ..
                }
            ));
        }

        let config = self::config().with_uncertainty(true);
        let err = ResultPostProcessor::new(&config)
            .process::<f32>(raw_scalar(1), 1, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluatorError::ConfigurationMismatch {
                head: Head::Uncertainty,
                ..
            }
        ));
    }

    #[test]
    fn disabled_head_is_absent_even_if_produced() {
        let config = config();
        let mut raw = raw_scalar(2);
        raw.moves_left = Some(vec![30.0, 40.0]);
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw, 2, None, None)
            .unwrap();
        assert!(!batch.has_moves_left());
        assert_eq!(batch.moves_left(1), None);
    }

    #[test]
    fn enabled_heads_are_carried_through() {
        let config = config().with_moves_left(true).with_uncertainty(true);
        let mut raw = raw_scalar(2);
        raw.moves_left = Some(vec![30.0, 40.0]);
        raw.uncertainty = Some(vec![0.25, 0.5]);
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw, 2, None, None)
            .unwrap();
        assert_eq!(batch.moves_left(1), Some(40.0));
        assert_eq!(batch.uncertainty(0), Some(0.25));
    }

    #[test]
    fn masking_is_idempotent() {
        let mut policy: Vec<f32> = (0..2 * MOVE_SPACE).map(|k| k as f32 * 0.01).collect();
        let is_legal = |i: usize, j: usize| (i + j) % 3 == 0;

        apply_legality_mask(&mut policy, 2, &is_legal);
        let once = policy.clone();
        apply_legality_mask(&mut policy, 2, &is_legal);

        assert_eq!(once, policy);
        assert_eq!(policy[1], ILLEGAL_MOVE_LOGIT);
        assert_eq!(policy[3], 3.0 * 0.01);
    }

    #[test]
    fn all_illegal_and_all_legal_rows() {
        let original: Vec<f32> = (0..2 * MOVE_SPACE).map(|k| (k as f32).sin()).collect();
        let mut policy = original.clone();
        // Position 0 has no legal moves, position 1 has all of them.
        apply_legality_mask(&mut policy, 2, &|i, _| i == 1);

        assert!(policy[..MOVE_SPACE].iter().all(|&v| v == ILLEGAL_MOVE_LOGIT));
        let untouched = policy[MOVE_SPACE..]
            .iter()
            .zip(&original[MOVE_SPACE..])
            .all(|(a, b)| a.to_bits() == b.to_bits());
        assert!(untouched);
    }

    #[test]
    fn single_wdl_position_with_three_legal_moves() {
        let config = config().with_wdl(true).with_value_head_logistic(true);
        let raw = RawExecutionResult {
            wdl: Some(vec![1.2, 0.3, -0.8]),
            policy: vec![0.5; MOVE_SPACE],
            policy_width: MOVE_SPACE,
            ..Default::default()
        };
        let mask = LegalityMask::from_indices([vec![12, 400, 1857]]);
        let is_legal = |i: usize, j: usize| mask.is_legal(i, j);

        let batch: EvaluationBatch<f16> = ResultPostProcessor::new(&config)
            .process(raw, 1, None, Some(&is_legal))
            .unwrap();

        let row = batch.policy(0);
        let sentinel = f16::from_f32(ILLEGAL_MOVE_LOGIT);
        assert_eq!(row.iter().filter(|&&v| v == sentinel).count(), 1855);
        assert_eq!(row.iter().filter(|&&v| v != sentinel).count(), 3);

        let ValueEstimate::Wdl { win, draw, loss } = batch.value(0) else {
            panic!("expected a WDL value");
        };
        let total = win.to_f32() + draw.to_f32() + loss.to_f32();
        assert!((total - 1.0).abs() < 1e-2);
        assert!(win > draw && draw > loss);
        assert_eq!(batch.moves_left(0), None);
    }

    #[test]
    fn logistic_scalar_value_is_squashed() {
        let config = config().with_value_head_logistic(true);
        let mut raw = raw_scalar(2);
        raw.values = Some(vec![0.0, 40.0]);
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw, 2, None, None)
            .unwrap();
        assert_eq!(batch.value(0).q(), 0.0);
        assert!((batch.value(1).q() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn compact_policy_is_expanded_before_masking() {
        let mut config = config();
        config.family = NetworkFamily::Record {
            bytes_per_square: 1,
            moves_record_len: 1,
            compact_policy: true,
        };
        let raw = RawExecutionResult {
            values: Some(vec![0.1]),
            policy: vec![2.0, 3.0, 4.0, 9.0],
            policy_width: 4,
            ..Default::default()
        };
        // Only three slots are occupied; slot 3 is padding.
        let moves = [700usize, 5, 1200];
        let move_index = |_: usize, slot: usize| moves.get(slot).copied();
        let is_legal = |_: usize, j: usize| j != 5;

        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw, 1, Some(&move_index), Some(&is_legal))
            .unwrap();

        let row = batch.policy(0);
        assert_eq!(row.len(), MOVE_SPACE);
        assert_eq!(row[700], 2.0);
        assert_eq!(row[5], ILLEGAL_MOVE_LOGIT);
        assert_eq!(row[1200], 4.0);
        assert_eq!(row[0], 0.0);
        assert_eq!(row.iter().filter(|&&v| v == 9.0).count(), 0);
    }

    #[test]
    fn compact_policy_without_move_lists_is_rejected() {
        let mut config = config();
        config.family = NetworkFamily::Record {
            bytes_per_square: 1,
            moves_record_len: 1,
            compact_policy: true,
        };
        let raw = RawExecutionResult {
            values: Some(vec![0.1]),
            policy: vec![2.0; 4],
            policy_width: 4,
            ..Default::default()
        };
        let err = ResultPostProcessor::new(&config)
            .process::<f32>(raw, 1, None, None)
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Configuration(_)));
    }

    #[test]
    fn unexpected_lengths_fail_fast() {
        let config = config();
        let mut raw = raw_scalar(2);
        raw.values = Some(vec![0.0]);
        let err = ResultPostProcessor::new(&config)
            .process::<f32>(raw, 2, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluatorError::ShapeMismatch {
                what: "value head",
                expected: 2,
                actual: 1
            }
        ));

        let mut raw = raw_scalar(1);
        raw.policy_width = 100;
        raw.policy.truncate(100);
        let err = ResultPostProcessor::new(&config)
            .process::<f32>(raw, 1, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            EvaluatorError::ShapeMismatch {
                what: "policy width",
                ..
            }
        ));
    }

    #[test]
    fn policy_kind_follows_configuration() {
        let config = config();
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw_scalar(1), 1, None, None)
            .unwrap();
        assert_eq!(batch.policy_kind(), PolicyKind::LogProbabilities);

        let config = config.with_policy_kind(PolicyKind::Probabilities);
        let batch: EvaluationBatch<f32> = ResultPostProcessor::new(&config)
            .process(raw_scalar(1), 1, None, None)
            .unwrap();
        assert_eq!(batch.policy_kind(), PolicyKind::Probabilities);
        assert_eq!(batch.get(0).policy_kind, PolicyKind::Probabilities);
    }
}
