//! Evaluator configuration.
//!
//! An [`EvaluatorConfig`] is built once per evaluator and never changes
//! afterwards; the evaluator keeps its own copy. Configurations can be
//! assembled with the `with_*` builder methods or loaded from JSON.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EvaluatorError;
use crate::types::PolicyKind;

/// Number of input planes per position in the planes layout.
pub const PLANES_PER_POSITION: usize = 112;

/// Squares on the board; every layout is per-square.
pub const SQUARES: usize = 64;

/// Index of the 50-move counter plane inside the 112 input planes.
pub const RULE50_PLANE: usize = 109;

/// Divisor applied to the 50-move counter plane when scaling is enabled.
pub const RULE50_SCALE: f32 = 99.0;

pub const DEFAULT_BYTES_PER_SQUARE_RECORD: usize = 137;
pub const DEFAULT_MOVES_RECORD_LEN: usize = 782;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1024;

/// Input/output tensor layout of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFamily {
    /// 112 channels x 64 squares per position, filled from the batch itself.
    Planes,
    /// Fixed-width records per square, filled by a registered converter.
    Record {
        bytes_per_square: usize,
        /// Length of the optional secondary (moves) tensor per position.
        moves_record_len: usize,
        /// Policy comes back indexed by move-list slot rather than by
        /// move index and has to be expanded.
        #[serde(default)]
        compact_policy: bool,
    },
}

impl NetworkFamily {
    /// Record family with the default record sizes and a full policy.
    pub fn record() -> Self {
        NetworkFamily::Record {
            bytes_per_square: DEFAULT_BYTES_PER_SQUARE_RECORD,
            moves_record_len: DEFAULT_MOVES_RECORD_LEN,
            compact_policy: false,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, NetworkFamily::Record { .. })
    }

    pub fn compact_policy(&self) -> bool {
        matches!(
            self,
            NetworkFamily::Record {
                compact_policy: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Gpu {
        index: i32,
        /// Prefer the TensorRT execution provider over plain CUDA.
        #[serde(default)]
        tensor_rt: bool,
    },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu { index, tensor_rt } if *tensor_rt => write!(f, "GPU {index} (TensorRT)"),
            Device::Gpu { index, .. } => write!(f, "GPU {index}"),
        }
    }
}

/// Which implementation sits behind the ONNX Runtime API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeBackend {
    /// An ONNX Runtime API the embedding process installed with
    /// `ort::set_api` before building any evaluator.
    Native,
    #[default]
    Tract,
    Candle,
}

/// Numeric precision the session runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    F32,
    F16,
}

/// Which optional heads the network is expected to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadFlags {
    pub wdl: bool,
    pub moves_left: bool,
    pub uncertainty: bool,
}

/// Names of the model outputs each head is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputNames {
    pub value: String,
    pub wdl: String,
    pub policy: String,
    pub moves_left: String,
    pub uncertainty: String,
}

impl Default for OutputNames {
    fn default() -> Self {
        Self {
            value: "/output/value".to_string(),
            wdl: "/output/wdl".to_string(),
            policy: "/output/policy".to_string(),
            moves_left: "/output/mlh".to_string(),
            uncertainty: "/output/uncertainty_v".to_string(),
        }
    }
}

/// Names of the model inputs the staged tensors are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct InputNames {
    pub primary: String,
    pub secondary: String,
}

impl Default for InputNames {
    fn default() -> Self {
        Self {
            primary: "/input/planes".to_string(),
            secondary: "/input/moves".to_string(),
        }
    }
}

/// Model bytes held in memory together with their fingerprint.
#[derive(Clone)]
pub struct ModelBytes {
    bytes: Arc<[u8]>,
    fingerprint: i64,
}

impl ModelBytes {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let fingerprint = bytes_fingerprint(&bytes);
        Self { bytes, fingerprint }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> i64 {
        self.fingerprint
    }
}

impl fmt::Debug for ModelBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBytes")
            .field("len", &self.bytes.len())
            .field("fingerprint", &format_args!("{:#x}", self.fingerprint))
            .finish()
    }
}

/// Where the serialized ONNX model comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    File(PathBuf),
    #[serde(skip)]
    Memory(ModelBytes),
}

impl ModelSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ModelSource::File(path.into())
    }

    pub fn memory(bytes: impl Into<Arc<[u8]>>) -> Self {
        ModelSource::Memory(ModelBytes::new(bytes))
    }

    /// Identity used when deciding whether two sources load the same model.
    pub fn identity(&self) -> ModelIdentity {
        match self {
            ModelSource::File(path) => ModelIdentity::Path(path.clone()),
            ModelSource::Memory(bytes) => ModelIdentity::Bytes {
                fingerprint: bytes.fingerprint(),
                len: bytes.bytes().len(),
            },
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::File(path) => write!(f, "{}", path.display()),
            ModelSource::Memory(bytes) => write!(f, "<{} bytes in memory>", bytes.bytes().len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelIdentity {
    Path(PathBuf),
    Bytes { fingerprint: i64, len: usize },
}

/// Cheap rolling hash over model bytes.
///
/// Each byte is shifted in from the right; whenever the top nibble of the
/// low 32 bits becomes set it is folded back into the lower bits.
pub fn bytes_fingerprint(bytes: &[u8]) -> i64 {
    let mut hash: i64 = 0;
    for &b in bytes {
        hash = (hash << 8).wrapping_add(b as i64);
        let g = hash & 0xF000_0000;
        if g != 0 {
            hash ^= g >> 24;
            hash ^= g;
        }
    }
    hash
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Identifier of the network, used in logs, errors and equivalence checks.
    pub network_id: String,
    pub model: ModelSource,
    pub family: NetworkFamily,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub runtime: RuntimeBackend,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub heads: HeadFlags,
    #[serde(default)]
    pub outputs: OutputNames,
    #[serde(default)]
    pub inputs: InputNames,
    /// Value head emits logits rather than probabilities.
    #[serde(default)]
    pub value_head_logistic: bool,
    #[serde(default)]
    pub policy_kind: PolicyKind,
    #[serde(default)]
    pub scale_50_move_counter: bool,
    /// Fill the secondary per-move tensor (record family only).
    #[serde(default)]
    pub moves_enabled: bool,
    #[serde(default)]
    pub intra_threads: Option<usize>,
    /// Write an ONNX Runtime profile to this path prefix.
    #[serde(default)]
    pub profiling: Option<PathBuf>,
}

impl EvaluatorConfig {
    pub fn new(network_id: impl Into<String>, model: ModelSource, family: NetworkFamily) -> Self {
        Self {
            network_id: network_id.into(),
            model,
            family,
            device: Device::default(),
            runtime: RuntimeBackend::default(),
            precision: Precision::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            heads: HeadFlags::default(),
            outputs: OutputNames::default(),
            inputs: InputNames::default(),
            value_head_logistic: false,
            policy_kind: PolicyKind::default(),
            scale_50_move_counter: false,
            moves_enabled: false,
            intra_threads: None,
            profiling: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, EvaluatorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EvaluatorError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeBackend) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_heads(mut self, heads: HeadFlags) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_wdl(mut self, wdl: bool) -> Self {
        self.heads.wdl = wdl;
        self
    }

    pub fn with_moves_left(mut self, moves_left: bool) -> Self {
        self.heads.moves_left = moves_left;
        self
    }

    pub fn with_uncertainty(mut self, uncertainty: bool) -> Self {
        self.heads.uncertainty = uncertainty;
        self
    }

    pub fn with_outputs(mut self, outputs: OutputNames) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_inputs(mut self, inputs: InputNames) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_value_head_logistic(mut self, logistic: bool) -> Self {
        self.value_head_logistic = logistic;
        self
    }

    pub fn with_policy_kind(mut self, policy_kind: PolicyKind) -> Self {
        self.policy_kind = policy_kind;
        self
    }

    pub fn with_scale_50_move_counter(mut self, scale: bool) -> Self {
        self.scale_50_move_counter = scale;
        self
    }

    pub fn with_moves_enabled(mut self, enabled: bool) -> Self {
        self.moves_enabled = enabled;
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads);
        self
    }

    pub fn with_profiling(mut self, path: impl Into<PathBuf>) -> Self {
        self.profiling = Some(path.into());
        self
    }

    /// Floats of primary input per position.
    pub fn primary_len_per_position(&self) -> usize {
        match self.family {
            NetworkFamily::Planes => PLANES_PER_POSITION * SQUARES,
            NetworkFamily::Record {
                bytes_per_square, ..
            } => bytes_per_square * SQUARES,
        }
    }

    /// Floats of secondary input per position, if a secondary tensor is staged.
    pub fn secondary_len_per_position(&self) -> Option<usize> {
        match self.family {
            NetworkFamily::Record {
                moves_record_len, ..
            } if self.moves_enabled => Some(moves_record_len),
            _ => None,
        }
    }

    /// Checks that can be made before any model is loaded.
    pub fn validate(&self) -> Result<(), EvaluatorError> {
        if self.max_batch_size == 0 {
            return Err(EvaluatorError::Configuration(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if let NetworkFamily::Record {
            bytes_per_square,
            moves_record_len,
            ..
        } = self.family
        {
            if bytes_per_square == 0 {
                return Err(EvaluatorError::Configuration(
                    "record family needs a non-zero bytes_per_square".to_string(),
                ));
            }
            if self.moves_enabled && moves_record_len == 0 {
                return Err(EvaluatorError::Configuration(
                    "moves_enabled needs a non-zero moves_record_len".to_string(),
                ));
            }
        } else if self.moves_enabled {
            return Err(EvaluatorError::Configuration(
                "moves_enabled is only meaningful for the record family".to_string(),
            ));
        }
        if self.intra_threads == Some(0) {
            return Err(EvaluatorError::Configuration(
                "intra_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
