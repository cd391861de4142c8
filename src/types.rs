use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};
use shakmaty::{CastlingMode, Chess, Position, uci::UciMove};

use crate::moves::{MOVE_SPACE, move_index, network_move};

/// One named output of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Head {
    Value,
    Wdl,
    Policy,
    MovesLeft,
    Uncertainty,
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Head::Value => "value",
            Head::Wdl => "WDL",
            Head::Policy => "policy",
            Head::MovesLeft => "moves-left",
            Head::Uncertainty => "value-uncertainty",
        })
    }
}

/// Scalar type results are stored in.
///
/// Heads are computed in `f32`; the final result is converted to the
/// caller's choice, typically `f16` to halve the storage of large batches.
pub trait OutputScalar: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn from_f32(value: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl OutputScalar for f32 {
    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_f32(self) -> f32 {
        self
    }
}

impl OutputScalar for f16 {
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

/// What the policy head emits. Masked entries hold the illegal-move
/// sentinel in either case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Unnormalized log-probabilities.
    #[default]
    LogProbabilities,
    Probabilities,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueEstimate<T: OutputScalar> {
    Scalar(T),
    Wdl { win: T, draw: T, loss: T },
}

impl<T: OutputScalar> ValueEstimate<T> {
    /// Expected outcome in `[-1, 1]` for the side to move.
    pub fn q(&self) -> f32 {
        match *self {
            ValueEstimate::Scalar(v) => v.to_f32(),
            ValueEstimate::Wdl { win, loss, .. } => win.to_f32() - loss.to_f32(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MoveProbability {
    pub uci: UciMove,
    pub index: usize,
    pub probability: f32,
}

/// Evaluation of a single position.
#[derive(Debug, Clone)]
pub struct PositionEvaluation<T: OutputScalar = f32> {
    pub value: ValueEstimate<T>,
    /// One entry per move index.
    pub policy: Vec<T>,
    pub moves_left: Option<T>,
    pub uncertainty: Option<T>,
    pub policy_kind: PolicyKind,
}

impl<T: OutputScalar> PositionEvaluation<T> {
    /// Softmax of the policy over the legal moves of `chess`, sorted
    /// highest to lowest.
    ///
    /// The network sees positions with the side to move as white, so
    /// black-to-move positions are looked up through their mirrored moves
    /// and reported as the real moves.
    pub fn move_probabilities(&self, chess: &Chess) -> Vec<MoveProbability> {
        let mirrored = chess.turn().is_black();
        let legal_moves = chess.legal_moves();

        let mut max_logit = f32::NEG_INFINITY;
        let mut move_data = Vec::with_capacity(legal_moves.len());
        for m in &legal_moves {
            let uci = m.to_uci(CastlingMode::Standard);
            if let Some(idx) = move_index(&network_move(*m, mirrored)) {
                let logit = self.policy[idx].to_f32();
                if logit > max_logit {
                    max_logit = logit;
                }
                move_data.push((uci, idx, logit));
            }
        }

        let mut sum_exp = 0.0;
        let mut exps = Vec::with_capacity(move_data.len());
        for &(_, _, logit) in &move_data {
            let exp = match self.policy_kind {
                PolicyKind::LogProbabilities => (logit - max_logit).exp(),
                PolicyKind::Probabilities => logit.max(0.0),
            };
            sum_exp += exp;
            exps.push(exp);
        }

        let mut policy: Vec<MoveProbability> = move_data
            .into_iter()
            .zip(exps)
            .map(|((uci, index, _), exp)| MoveProbability {
                uci,
                index,
                probability: if sum_exp > 0.0 { exp / sum_exp } else { 0.0 },
            })
            .collect();

        policy.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        policy
    }
}

/// Evaluations of a whole batch, stored head by head.
///
/// Index `i` of every accessor corresponds to position `i` of the input
/// batch.
#[derive(Debug, Clone)]
pub struct EvaluationBatch<T: OutputScalar = f32> {
    num_positions: usize,
    is_wdl: bool,
    values: Vec<T>,
    policy: Vec<T>,
    moves_left: Option<Vec<T>>,
    uncertainty: Option<Vec<T>>,
    policy_kind: PolicyKind,
}

impl<T: OutputScalar> EvaluationBatch<T> {
    pub(crate) fn new(
        num_positions: usize,
        is_wdl: bool,
        values: Vec<T>,
        policy: Vec<T>,
        moves_left: Option<Vec<T>>,
        uncertainty: Option<Vec<T>>,
    ) -> Self {
        debug_assert_eq!(values.len(), num_positions * if is_wdl { 3 } else { 1 });
        debug_assert_eq!(policy.len(), num_positions * MOVE_SPACE);
        Self {
            num_positions,
            is_wdl,
            values,
            policy,
            moves_left,
            uncertainty,
            policy_kind: PolicyKind::LogProbabilities,
        }
    }

    pub(crate) fn with_policy_kind(mut self, policy_kind: PolicyKind) -> Self {
        self.policy_kind = policy_kind;
        self
    }

    pub fn len(&self) -> usize {
        self.num_positions
    }

    pub fn is_empty(&self) -> bool {
        self.num_positions == 0
    }

    pub fn is_wdl(&self) -> bool {
        self.is_wdl
    }

    pub fn has_moves_left(&self) -> bool {
        self.moves_left.is_some()
    }

    pub fn has_uncertainty(&self) -> bool {
        self.uncertainty.is_some()
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy_kind
    }

    pub fn value(&self, i: usize) -> ValueEstimate<T> {
        if self.is_wdl {
            let w = &self.values[i * 3..i * 3 + 3];
            ValueEstimate::Wdl {
                win: w[0],
                draw: w[1],
                loss: w[2],
            }
        } else {
            ValueEstimate::Scalar(self.values[i])
        }
    }

    pub fn policy(&self, i: usize) -> &[T] {
        &self.policy[i * MOVE_SPACE..(i + 1) * MOVE_SPACE]
    }

    /// Flat policy for the whole batch, `len() * MOVE_SPACE` entries.
    pub fn policy_flat(&self) -> &[T] {
        &self.policy
    }

    pub fn moves_left(&self, i: usize) -> Option<T> {
        self.moves_left.as_ref().map(|m| m[i])
    }

    pub fn uncertainty(&self, i: usize) -> Option<T> {
        self.uncertainty.as_ref().map(|u| u[i])
    }

    pub fn get(&self, i: usize) -> PositionEvaluation<T> {
        PositionEvaluation {
            value: self.value(i),
            policy: self.policy(i).to_vec(),
            moves_left: self.moves_left(i),
            uncertainty: self.uncertainty(i),
            policy_kind: self.policy_kind,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PositionEvaluation<T>> + '_ {
        (0..self.num_positions).map(|i| self.get(i))
    }

    pub fn into_positions(self) -> Vec<PositionEvaluation<T>> {
        self.iter().collect()
    }
}
