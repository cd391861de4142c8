use std::any::Any;

use log::debug;

use crate::batch::PositionBatch;
use crate::buffers::ScratchBufferPool;
use crate::config::{EvaluatorConfig, NetworkFamily};
use crate::converters::Converters;
use crate::error::EvaluatorError;

/// What the caller hands to the evaluator.
#[derive(Clone, Copy)]
pub enum BatchInput<'a> {
    Positions(&'a dyn PositionBatch),
    /// Input already in the record converter's own representation.
    Native {
        input: &'a dyn Any,
        num_positions: usize,
        uses_secondary: bool,
    },
}

impl BatchInput<'_> {
    pub fn len(&self) -> usize {
        match self {
            BatchInput::Positions(batch) => batch.len(),
            BatchInput::Native { num_positions, .. } => *num_positions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flat input tensors ready for execution, borrowed from a scratch pool.
#[derive(Debug)]
pub struct StagedInput<'a> {
    pub primary: &'a [f32],
    pub secondary: Option<&'a [f32]>,
    pub num_positions: usize,
}

/// Fills scratch buffers with the flat tensors a batch needs.
pub struct BatchInputStager<'a> {
    config: &'a EvaluatorConfig,
    converters: &'a Converters,
}

impl<'a> BatchInputStager<'a> {
    pub fn new(config: &'a EvaluatorConfig, converters: &'a Converters) -> Self {
        Self { config, converters }
    }

    pub fn stage<'p>(
        &self,
        input: BatchInput<'_>,
        pool: &'p mut ScratchBufferPool,
    ) -> Result<StagedInput<'p>, EvaluatorError> {
        let num_positions = input.len();
        if num_positions > self.config.max_batch_size {
            return Err(EvaluatorError::BatchTooLarge {
                requested: num_positions,
                capacity: self.config.max_batch_size,
            });
        }
        self.reserve_on_first_use(pool);

        let primary_len = num_positions * self.config.primary_len_per_position();

        let (primary, secondary) = match input {
            BatchInput::Positions(batch) => match self.config.family {
                NetworkFamily::Record { .. } => {
                    let to_flat = self.converters.to_flat()?;
                    let secondary_len = self
                        .config
                        .secondary_len_per_position()
                        .map(|len| len * num_positions);
                    let (primary, mut secondary) = pool.acquire(primary_len, secondary_len);
                    to_flat(
                        batch,
                        self.config.moves_enabled,
                        &mut *primary,
                        secondary.as_deref_mut(),
                    );
                    (primary, secondary)
                }
                NetworkFamily::Planes => {
                    let (primary, _) = pool.acquire(primary_len, None);
                    batch.write_planes(&mut *primary, self.config.scale_50_move_counter);
                    (primary, None)
                }
            },
            BatchInput::Native {
                input,
                uses_secondary,
                ..
            } => {
                let NetworkFamily::Record {
                    moves_record_len, ..
                } = self.config.family
                else {
                    return Err(EvaluatorError::UnsupportedOperation(
                        "native input evaluation requires a record-layout network".to_string(),
                    ));
                };
                let from_native = self.converters.from_native()?;
                let secondary_len = uses_secondary.then_some(moves_record_len * num_positions);
                let (primary, mut secondary) = pool.acquire(primary_len, secondary_len);
                from_native(input, &mut *primary, secondary.as_deref_mut());
                (primary, secondary)
            }
        };

        let secondary = match secondary {
            Some(s) => Some(&*s),
            None => None,
        };
        Ok(StagedInput {
            primary,
            secondary,
            num_positions,
        })
    }

    /// Sizes an untouched pool for a full batch so later calls never grow it.
    fn reserve_on_first_use(&self, pool: &mut ScratchBufferPool) {
        if pool.primary_capacity() > 0 {
            return;
        }
        let capacity = self.config.max_batch_size;
        let secondary = match self.config.family {
            NetworkFamily::Record {
                moves_record_len, ..
            } => moves_record_len * capacity,
            NetworkFamily::Planes => 0,
        };
        debug!(
            "reserving staging buffers for {} positions of `{}`",
            capacity, self.config.network_id
        );
        pool.reserve(self.config.primary_len_per_position() * capacity, secondary);
    }
}
