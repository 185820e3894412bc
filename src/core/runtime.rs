// ONNX Runtime execution of exported artifacts

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::export::{ExportError, ExportResult, RunReport};
use crate::models::tensor::DenseTensor;

/// Declared name, element type and dims (`None` = dynamic) of a session input or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub element_type: String,
    pub dims: Vec<Option<i64>>,
}

#[cfg(feature = "runtime")]
fn runtime_error(e: impl std::fmt::Display) -> ExportError {
    ExportError::Runtime(e.to_string())
}

#[cfg(feature = "runtime")]
mod ort_backend {
    use super::*;
    use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
    use ort::session::{Session, SessionInputValue};
    use ort::value::ValueType;

    pub struct InferenceSession {
        session: Session,
        inputs: Vec<TensorInfo>,
        outputs: Vec<TensorInfo>,
    }

    fn describe(name: &str, value_type: &ValueType) -> TensorInfo {
        match value_type {
            ValueType::Tensor { ty, shape, .. } => TensorInfo {
                name: name.to_string(),
                element_type: ty.to_string(),
                dims: shape.iter().map(|d| (*d >= 0).then_some(*d)).collect(),
            },
            other => TensorInfo {
                name: name.to_string(),
                element_type: format!("{:?}", other),
                dims: Vec::new(),
            },
        }
    }

    fn with_cuda(builder: SessionBuilder, use_cuda: bool) -> ExportResult<SessionBuilder> {
        #[cfg(feature = "cuda")]
        {
            if use_cuda {
                use ort::execution_providers::cuda::CUDAExecutionProvider;
                tracing::info!("Registering CUDA execution provider (falls back to CPU)");
                return builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])
                    .map_err(runtime_error);
            }
            Ok(builder)
        }
        #[cfg(not(feature = "cuda"))]
        {
            if use_cuda {
                tracing::debug!("Built without the `cuda` feature, running on CPU");
            }
            Ok(builder)
        }
    }

    impl InferenceSession {
        pub fn open(path: &Path, use_cuda: bool) -> ExportResult<Self> {
            let builder = Session::builder()
                .map_err(runtime_error)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(runtime_error)?
                .with_intra_threads(1)
                .map_err(runtime_error)?;
            let session = with_cuda(builder, use_cuda)?
                .commit_from_file(path)
                .map_err(runtime_error)?;

            let inputs = session
                .inputs
                .iter()
                .map(|i| describe(&i.name, &i.input_type))
                .collect();
            let outputs = session
                .outputs
                .iter()
                .map(|o| describe(&o.name, &o.output_type))
                .collect();
            tracing::debug!("Opened {} with ONNX Runtime", path.display());

            Ok(Self {
                session,
                inputs,
                outputs,
            })
        }

        pub fn inputs(&self) -> &[TensorInfo] {
            &self.inputs
        }

        pub fn outputs(&self) -> &[TensorInfo] {
            &self.outputs
        }

        /// Run one forward pass; every session input must be supplied by name
        pub fn run(&mut self, feeds: &[(&str, &DenseTensor)]) -> ExportResult<Vec<(String, DenseTensor)>> {
            for info in &self.inputs {
                if !feeds.iter().any(|(name, _)| *name == info.name) {
                    return Err(ExportError::Runtime(format!(
                        "no value supplied for session input '{}'",
                        info.name
                    )));
                }
            }

            let mut ort_inputs = Vec::with_capacity(feeds.len());
            for (name, tensor) in feeds {
                let value = ort::value::Tensor::from_array((tensor.shape.clone(), tensor.data.clone()))
                    .map_err(runtime_error)?
                    .into_dyn();
                ort_inputs.push((name.to_string(), SessionInputValue::from(value)));
            }

            let outputs = self.session.run(ort_inputs).map_err(runtime_error)?;
            let mut results = Vec::with_capacity(outputs.len());
            for (name, value) in outputs.iter() {
                let (shape, data) = value.try_extract_tensor::<f32>().map_err(runtime_error)?;
                let shape: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
                let tensor = DenseTensor::from_vec(&shape, data.to_vec()).ok_or_else(|| {
                    ExportError::Runtime(format!("output '{}' has inconsistent shape", name))
                })?;
                results.push((name.to_string(), tensor));
            }
            Ok(results)
        }
    }
}

#[cfg(feature = "runtime")]
pub use ort_backend::InferenceSession;

/// Placeholder so callers compile without ONNX Runtime
#[cfg(not(feature = "runtime"))]
pub struct InferenceSession {
    _private: (),
}

#[cfg(not(feature = "runtime"))]
impl InferenceSession {
    pub fn open(_path: &Path, _use_cuda: bool) -> ExportResult<Self> {
        Err(ExportError::Unsupported(
            "running models requires the `runtime` feature".into(),
        ))
    }

    pub fn inputs(&self) -> &[TensorInfo] {
        &[]
    }

    pub fn outputs(&self) -> &[TensorInfo] {
        &[]
    }

    pub fn run(&mut self, _feeds: &[(&str, &DenseTensor)]) -> ExportResult<Vec<(String, DenseTensor)>> {
        Err(ExportError::Unsupported(
            "running models requires the `runtime` feature".into(),
        ))
    }
}

/// Run `path` once on `input` (plus any `extra` named feeds) and report the shapes
pub fn run_and_compare(
    path: &Path,
    input_name: &str,
    input: &DenseTensor,
    extra: &[(&str, &DenseTensor)],
    use_cuda: bool,
) -> ExportResult<(RunReport, DenseTensor)> {
    let mut session = InferenceSession::open(path, use_cuda)?;
    let mut feeds = Vec::with_capacity(extra.len() + 1);
    feeds.push((input_name, input));
    feeds.extend_from_slice(extra);

    let mut outputs = session.run(&feeds)?;
    if outputs.is_empty() {
        return Err(ExportError::Runtime("model produced no outputs".into()));
    }
    let (_, output) = outputs.swap_remove(0);
    let report = RunReport {
        input_shape: input.dims_i64(),
        output_shape: output.dims_i64(),
    };
    tracing::debug!("Run: {:?} -> {:?}", report.input_shape, report.output_shape);
    Ok((report, output))
}
