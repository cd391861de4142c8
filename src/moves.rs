use std::{collections::HashMap, sync::LazyLock};

use shakmaty::{CastlingMode, Chess, Move, Position, Role, Square, fen::Fen, uci::UciMove};

use crate::error::EvaluatorError;

/// Size of the fixed move-index space shared by all networks.
pub const MOVE_SPACE: usize = 1858;

const MASK_WORDS: usize = MOVE_SPACE.div_ceil(64);

/// The move vocabulary of the policy head, seen from the side to move
/// playing white.
///
/// Every queen-line and knight-jump (from, to) pair comes first, ordered by
/// origin square then destination square. The 66 under/queen promotion
/// entries with an explicit piece follow. A pawn move to the last rank
/// without a suffix is the knight promotion.
pub struct MoveTable {
    moves: Vec<UciMove>,
    index: HashMap<UciMove, usize>,
}

/// Lazily built on first access.
pub static MOVE_TABLE: LazyLock<MoveTable> = LazyLock::new(|| {
    let moves = enumerate_moves();
    let index = moves
        .iter()
        .enumerate()
        .map(|(idx, uci)| (uci.clone(), idx))
        .collect();
    MoveTable { moves, index }
});

fn square(file: i32, rank: i32) -> Option<Square> {
    ((0..8).contains(&file) && (0..8).contains(&rank)).then(|| Square::new((rank * 8 + file) as u32))
}

fn enumerate_moves() -> Vec<UciMove> {
    let mut moves = Vec::with_capacity(MOVE_SPACE);

    for from in Square::ALL {
        let (ff, fr) = (from.file() as i32, from.rank() as i32);
        for to in Square::ALL {
            let (df, dr) = (to.file() as i32 - ff, to.rank() as i32 - fr);
            let queen_line = (df, dr) != (0, 0) && (df == 0 || dr == 0 || df.abs() == dr.abs());
            let knight_jump = (df.abs(), dr.abs()) == (1, 2) || (df.abs(), dr.abs()) == (2, 1);
            if queen_line || knight_jump {
                moves.push(UciMove::Normal {
                    from,
                    to,
                    promotion: None,
                });
            }
        }
    }

    for file in 0..8 {
        let Some(from) = square(file, 6) else { continue };
        for df in [-1, 0, 1] {
            let Some(to) = square(file + df, 7) else { continue };
            for role in [Role::Queen, Role::Rook, Role::Bishop] {
                moves.push(UciMove::Normal {
                    from,
                    to,
                    promotion: Some(role),
                });
            }
        }
    }

    moves
}

/// Policy index of a move given from the network's point of view.
pub fn move_index(uci: &UciMove) -> Option<usize> {
    match uci {
        UciMove::Normal {
            from,
            to,
            promotion: Some(Role::Knight),
        } => MOVE_TABLE.index.get(&UciMove::Normal {
            from: *from,
            to: *to,
            promotion: None,
        }),
        other => MOVE_TABLE.index.get(other),
    }
    .copied()
}

/// Inverse of [`move_index`].
pub fn index_to_move(index: usize) -> Option<&'static UciMove> {
    MOVE_TABLE.moves.get(index)
}

/// `m` as the policy head encodes it: castling is king-takes-rook, and
/// black's moves are mirrored to white's side.
pub fn network_move(m: Move, mirrored: bool) -> UciMove {
    let uci = m.to_uci(CastlingMode::Chess960);
    if mirrored { uci.to_mirrored() } else { uci }
}

/// Policy indices of every legal move in `chess`.
///
/// Black-to-move positions are mirrored first, matching what the network
/// is fed.
pub fn legal_move_indices(chess: &Chess) -> Vec<usize> {
    let mirrored = chess.turn().is_black();
    chess
        .legal_moves()
        .iter()
        .filter_map(|&m| move_index(&network_move(m, mirrored)))
        .collect()
}

pub fn legal_move_indices_from_fen(fen: &str) -> Result<Vec<usize>, EvaluatorError> {
    let fen: Fen = fen.parse()?;
    let chess: Chess = fen.into_position(CastlingMode::Standard)?;
    Ok(legal_move_indices(&chess))
}

/// Per-position bitset over the move-index space.
///
/// Serves as the legality predicate handed to the evaluator.
#[derive(Debug, Clone, Default)]
pub struct LegalityMask {
    rows: Vec<[u64; MASK_WORDS]>,
}

impl LegalityMask {
    /// Mask for `num_positions` positions with every move illegal.
    pub fn new(num_positions: usize) -> Self {
        Self {
            rows: vec![[0; MASK_WORDS]; num_positions],
        }
    }

    /// Mask with every move legal in every position.
    pub fn all_legal(num_positions: usize) -> Self {
        let mut mask = Self::new(num_positions);
        for row in &mut mask.rows {
            for idx in 0..MOVE_SPACE {
                row[idx / 64] |= 1 << (idx % 64);
            }
        }
        mask
    }

    pub fn from_indices<I>(rows: impl IntoIterator<Item = I>) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut mask = Self::default();
        for (position, indices) in rows.into_iter().enumerate() {
            mask.rows.push([0; MASK_WORDS]);
            for idx in indices {
                mask.set_legal(position, idx);
            }
        }
        mask
    }

    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a Chess>) -> Self {
        Self::from_indices(positions.into_iter().map(legal_move_indices))
    }

    /// Marks a move legal. Returns `false` and leaves the mask unchanged
    /// when either index is out of range.
    pub fn set_legal(&mut self, position: usize, move_index: usize) -> bool {
        match self.rows.get_mut(position) {
            Some(row) if move_index < MOVE_SPACE => {
                row[move_index / 64] |= 1 << (move_index % 64);
                true
            }
            _ => false,
        }
    }

    pub fn is_legal(&self, position: usize, move_index: usize) -> bool {
        move_index < MOVE_SPACE
            && self
                .rows
                .get(position)
                .is_some_and(|row| row[move_index / 64] & (1 << (move_index % 64)) != 0)
    }

    pub fn legal_count(&self, position: usize) -> usize {
        self.rows
            .get(position)
            .map_or(0, |row| row.iter().map(|w| w.count_ones() as usize).sum())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
