use std::fmt::Display;
use std::sync::OnceLock;

use half::f16;
use log::{info, warn};
use ndarray::{ArrayD, IxDyn};
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{Session, SessionOutputs},
    value::{DynValue, Tensor},
};

use crate::{
    config::{
        Device, EvaluatorConfig, InputNames, ModelSource, NetworkFamily, OutputNames,
        PLANES_PER_POSITION, Precision, RuntimeBackend, SQUARES,
    },
    engine::{ExecutionEngine, RawExecutionResult},
    error::EvaluatorError,
    types::Head,
};

static RUNTIME: OnceLock<RuntimeBackend> = OnceLock::new();

/// Points ONNX Runtime at the requested implementation and returns the
/// backend in effect. Only the first backend requested in a process takes
/// effect.
pub(crate) fn install_runtime(requested: RuntimeBackend) -> RuntimeBackend {
    let active = *RUNTIME.get_or_init(|| {
        let installed = match requested {
            RuntimeBackend::Native => return RuntimeBackend::Native,
            RuntimeBackend::Tract => ort::set_api(ort_tract::api()),
            RuntimeBackend::Candle => ort::set_api(ort_candle::api()),
        };
        if installed {
            info!("Installed {requested:?} runtime backend");
            requested
        } else {
            warn!("an ONNX Runtime API was already installed, {requested:?} backend not used");
            RuntimeBackend::Native
        }
    });
    if active != requested {
        warn!("runtime backend {active:?} already active, ignoring request for {requested:?}");
    }
    active
}

fn setup_error(e: impl Display) -> EvaluatorError {
    EvaluatorError::Configuration(format!("failed to build ONNX session: {e}"))
}

/// An ONNX Runtime session loaded for one configuration.
pub struct OnnxEngine {
    session: Session,
    network_id: String,
    family: NetworkFamily,
    precision: Precision,
    max_batch_size: usize,
    inputs: InputNames,
    outputs: OutputNames,
    output_names: Vec<String>,
    profiling: bool,
}

impl OnnxEngine {
    pub fn new(config: &EvaluatorConfig) -> Result<Self, EvaluatorError> {
        config.validate()?;
        install_runtime(config.runtime);

        info!(
            "Starting ONNX runtime against {} from {} on {}",
            config.network_id, config.model, config.device
        );

        let mut builder = Session::builder()?;
        if let Some(threads) = config.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(setup_error)?;
        }
        if let Device::Gpu { index, tensor_rt } = config.device {
            let mut providers = Vec::with_capacity(2);
            if tensor_rt {
                providers.push(TensorRTExecutionProvider::default().with_device_id(index).build());
            }
            providers.push(CUDAExecutionProvider::default().with_device_id(index).build());
            builder = builder
                .with_execution_providers(providers)
                .map_err(setup_error)?;
        }
        if let Some(path) = &config.profiling {
            builder = builder
                .with_profiling(path.to_string_lossy().into_owned())
                .map_err(setup_error)?;
        }

        let session = match &config.model {
            ModelSource::File(path) => builder.commit_from_file(path)?,
            ModelSource::Memory(bytes) => builder.commit_from_memory(bytes.bytes())?,
        };

        let output_names = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();

        Ok(Self {
            session,
            network_id: config.network_id.clone(),
            family: config.family,
            precision: config.precision,
            max_batch_size: config.max_batch_size,
            inputs: config.inputs.clone(),
            outputs: config.outputs.clone(),
            output_names,
            profiling: config.profiling.is_some(),
        })
    }

}

/// Shape of the primary input tensor for `num_positions` positions.
fn primary_shape(family: NetworkFamily, num_positions: usize) -> Vec<usize> {
    match family {
        NetworkFamily::Planes => vec![num_positions, PLANES_PER_POSITION, 8, 8],
        NetworkFamily::Record {
            bytes_per_square, ..
        } => vec![num_positions, SQUARES, bytes_per_square],
    }
}

/// Builds an input tensor in the session's precision.
fn input_tensor(
    shape: Vec<usize>,
    data: &[f32],
    precision: Precision,
) -> Result<DynValue, EvaluatorError> {
    let value = match precision {
        Precision::F32 => {
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data.to_vec())?;
            Tensor::from_array(array)?.into_dyn()
        }
        Precision::F16 => {
            let halves: Vec<f16> = data.iter().map(|&v| f16::from_f32(v)).collect();
            let array = ArrayD::from_shape_vec(IxDyn(&shape), halves)?;
            Tensor::from_array(array)?.into_dyn()
        }
    };
    Ok(value)
}

/// Reads a named output as flat `f32` plus its shape, or `None` if the
/// model did not produce it.
fn extract(
    outputs: &SessionOutputs<'_>,
    name: &str,
    precision: Precision,
) -> Result<Option<(Vec<usize>, Vec<f32>)>, EvaluatorError> {
    let Some(value) = outputs.get(name) else {
        return Ok(None);
    };
    let extracted = match precision {
        Precision::F32 => {
            let array = value.try_extract_array::<f32>()?;
            (array.shape().to_vec(), array.iter().copied().collect())
        }
        Precision::F16 => {
            let array = value.try_extract_array::<f16>()?;
            (array.shape().to_vec(), array.iter().map(|v| v.to_f32()).collect())
        }
    };
    Ok(Some(extracted))
}

impl ExecutionEngine for OnnxEngine {
    fn execute(
        &mut self,
        wdl: bool,
        primary: &[f32],
        secondary: Option<&[f32]>,
        num_positions: usize,
    ) -> Result<RawExecutionResult, EvaluatorError> {
        if num_positions > self.max_batch_size {
            return Err(EvaluatorError::BatchTooLarge {
                requested: num_positions,
                capacity: self.max_batch_size,
            });
        }

        let primary_tensor =
            input_tensor(primary_shape(self.family, num_positions), primary, self.precision)?;
        let secondary_tensor = match secondary {
            Some(data) => {
                let per_position = data.len() / num_positions.max(1);
                Some(input_tensor(
                    vec![num_positions, per_position],
                    data,
                    self.precision,
                )?)
            }
            None => None,
        };

        let precision = self.precision;
        let outputs = match secondary_tensor {
            Some(secondary_tensor) => self.session.run(ort::inputs! {
                self.inputs.primary.as_str() => primary_tensor,
                self.inputs.secondary.as_str() => secondary_tensor,
            })?,
            None => self.session.run(ort::inputs! {
                self.inputs.primary.as_str() => primary_tensor,
            })?,
        };

        let value_name = if wdl {
            &self.outputs.wdl
        } else {
            &self.outputs.value
        };
        let value = extract(&outputs, value_name, precision)?.map(|(_, data)| data);
        if value.is_none() {
            return Err(EvaluatorError::ConfigurationMismatch {
                head: if wdl { Head::Wdl } else { Head::Value },
                network_id: self.network_id.clone(),
            });
        }

        let Some((policy_shape, policy)) = extract(&outputs, &self.outputs.policy, precision)?
        else {
            return Err(EvaluatorError::ConfigurationMismatch {
                head: Head::Policy,
                network_id: self.network_id.clone(),
            });
        };
        let policy_width = policy_shape.iter().skip(1).product();

        let moves_left = extract(&outputs, &self.outputs.moves_left, precision)?.map(|(_, d)| d);
        let uncertainty =
            extract(&outputs, &self.outputs.uncertainty, precision)?.map(|(_, d)| d);

        let (values, wdl) = if wdl { (None, value) } else { (value, None) };
        Ok(RawExecutionResult {
            values,
            wdl,
            policy,
            policy_width,
            moves_left,
            uncertainty,
        })
    }

    fn has_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    fn end_profiling(&mut self) -> Result<Option<String>, EvaluatorError> {
        if !self.profiling {
            return Ok(None);
        }
        self.profiling = false;
        Ok(Some(self.session.end_profiling()?))
    }
}

impl Drop for OnnxEngine {
    fn drop(&mut self) {
        info!("Releasing ONNX session for {}", self.network_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() {
        assert_eq!(install_runtime(RuntimeBackend::Tract), RuntimeBackend::Tract);
    }

    fn dims(value: &DynValue) -> Vec<i64> {
        value.shape().to_vec()
    }

    #[test]
    fn runtime_is_installed_once() {
        runtime();
        assert_eq!(install_runtime(RuntimeBackend::Candle), RuntimeBackend::Tract);
    }

    #[test]
    fn planes_tensor_has_board_shape() {
        runtime();
        let config =
            EvaluatorConfig::new("shape", ModelSource::file("shape.onnx"), NetworkFamily::Planes);
        let shape = primary_shape(config.family, 2);
        assert_eq!(shape, vec![2, PLANES_PER_POSITION, 8, 8]);

        let data = vec![0.5; 2 * config.primary_len_per_position()];
        let tensor = input_tensor(shape, &data, Precision::F32).unwrap();
        assert_eq!(dims(&tensor), vec![2, 112, 8, 8]);
        let array = tensor.try_extract_array::<f32>().unwrap();
        assert!(array.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn record_tensor_uses_bytes_per_square() {
        assert_eq!(
            primary_shape(NetworkFamily::record(), 3),
            vec![3, SQUARES, 137]
        );
    }

    #[test]
    fn mis_sized_buffer_is_a_shape_error() {
        runtime();
        let shape = primary_shape(NetworkFamily::Planes, 2);
        let data = vec![0.0; PLANES_PER_POSITION * SQUARES];
        assert!(matches!(
            input_tensor(shape, &data, Precision::F32),
            Err(EvaluatorError::Shape(_))
        ));
    }

    #[test]
    fn half_precision_tensor_round_trips() {
        runtime();
        let data = [0.0, 1.0, -0.5, 0.333, 99.0, -100.0];
        let tensor = input_tensor(vec![2, 3], &data, Precision::F16).unwrap();
        assert_eq!(dims(&tensor), vec![2, 3]);

        let array = tensor.try_extract_array::<f16>().unwrap();
        for (half, expected) in array.iter().zip(data) {
            assert!((half.to_f32() - expected).abs() <= expected.abs() * 1e-3);
        }
    }
}
