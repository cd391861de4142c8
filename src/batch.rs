//! Input batches.
//!
//! A batch is an ordered set of encoded positions; output `i` of an
//! evaluation always belongs to input position `i`.

use std::any::Any;

use crate::config::{PLANES_PER_POSITION, RULE50_PLANE, RULE50_SCALE, SQUARES};

pub trait PositionBatch {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the batch into `out`, `PLANES_PER_POSITION * 64` floats per
    /// position, position-major.
    fn write_planes(&self, out: &mut [f32], scale_50_move_counter: bool);

    /// Policy indices of the moves of `position`, in move-list order.
    fn moves(&self, _position: usize) -> Option<&[u16]> {
        None
    }

    /// Lets registered converters reach their concrete batch type.
    fn as_any(&self) -> &dyn Any;
}

/// Positions stored as 112 bitboard planes, each with a single fill value.
#[derive(Debug, Clone, Default)]
pub struct PlanesBatch {
    masks: Vec<u64>,
    values: Vec<f32>,
    moves: Option<Vec<Vec<u16>>>,
}

impl PlanesBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(positions: usize) -> Self {
        Self {
            masks: Vec::with_capacity(positions * PLANES_PER_POSITION),
            values: Vec::with_capacity(positions * PLANES_PER_POSITION),
            moves: None,
        }
    }

    pub fn push(
        &mut self,
        masks: &[u64; PLANES_PER_POSITION],
        values: &[f32; PLANES_PER_POSITION],
    ) {
        self.masks.extend_from_slice(masks);
        self.values.extend_from_slice(values);
    }

    /// Attaches per-position move lists (policy indices).
    pub fn with_moves(mut self, moves: Vec<Vec<u16>>) -> Self {
        self.moves = Some(moves);
        self
    }
}

impl PositionBatch for PlanesBatch {
    fn len(&self) -> usize {
        self.masks.len() / PLANES_PER_POSITION
    }

    fn write_planes(&self, out: &mut [f32], scale_50_move_counter: bool) {
        assert!(
            out.len() >= self.masks.len() * SQUARES,
            "plane buffer too small for batch"
        );
        for (plane_idx, (&mask, &value)) in self.masks.iter().zip(&self.values).enumerate() {
            let value = if scale_50_move_counter && plane_idx % PLANES_PER_POSITION == RULE50_PLANE {
                value / RULE50_SCALE
            } else {
                value
            };
            let plane = &mut out[plane_idx * SQUARES..(plane_idx + 1) * SQUARES];
            for (sq, slot) in plane.iter_mut().enumerate() {
                *slot = if mask & (1 << sq) != 0 { value } else { 0.0 };
            }
        }
    }

    fn moves(&self, position: usize) -> Option<&[u16]> {
        self.moves
            .as_ref()
            .and_then(|moves| moves.get(position))
            .map(Vec::as_slice)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
