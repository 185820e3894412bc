// Data models for the export pipeline: options, reports, and errors

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ==============================================================================
// Export Options
// ==============================================================================

/// Knobs of a single graph export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Store trained parameters inside the model file
    pub embed_parameters: bool,
    /// ONNX operator set the graph targets
    pub opset_version: i64,
    /// Evaluate initializer-only subgraphs at export time
    pub constant_folding: bool,
    pub input_name: String,
    pub output_name: String,
    /// Symbolic name of axis 0 on input and output; `None` keeps the batch fixed
    pub dynamic_batch: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            embed_parameters: true,
            opset_version: 14,
            constant_folding: true,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            dynamic_batch: Some("batch_size".to_string()),
        }
    }
}

/// Oldest and newest opsets the lowering is valid for.
/// ReduceMean switched `axes` to an input in opset 18.
pub const MIN_OPSET: i64 = 13;
pub const MAX_OPSET: i64 = 17;

impl ExportOptions {
    /// Reject option sets the exporter cannot honour
    pub fn validate(&self) -> ExportResult<()> {
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset_version) {
            return Err(ExportError::Unsupported(format!(
                "opset {} (supported: {}..={})",
                self.opset_version, MIN_OPSET, MAX_OPSET
            )));
        }
        if self.input_name.is_empty() || self.output_name.is_empty() {
            return Err(ExportError::InvalidConfig(
                "input and output names must be non-empty".into(),
            ));
        }
        if self.input_name == self.output_name {
            return Err(ExportError::InvalidConfig(format!(
                "input and output share the name '{}'",
                self.input_name
            )));
        }
        if matches!(&self.dynamic_batch, Some(name) if name.is_empty()) {
            return Err(ExportError::InvalidConfig(
                "dynamic batch axis needs a name".into(),
            ));
        }
        Ok(())
    }
}

// ==============================================================================
// Reports
// ==============================================================================

/// What the export stage wrote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub node_count: usize,
    pub initializer_count: usize,
    pub parameter_count: usize,
    pub folded_nodes: usize,
    pub input_dims: Vec<Option<i64>>,
    pub output_dims: Vec<Option<i64>>,
}

/// Result of running the artifact once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub input_shape: Vec<i64>,
    pub output_shape: Vec<i64>,
}

impl RunReport {
    /// Leading dimension survived the round trip
    pub fn batch_preserved(&self) -> bool {
        self.input_shape.first() == self.output_shape.first()
    }
}

// ==============================================================================
// Error Types
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Model not found: {model_id} ({reason})")]
    ModelNotFound { model_id: String, reason: String },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Invalid model configuration: {0}")]
    InvalidModelConfig(String),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Weight {name} has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Weights file error: {0}")]
    Weights(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid input geometry: {0}")]
    InputGeometry(String),

    #[error("Malformed ONNX file: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("ONNX checker found {} issue(s): {}", .0.len(), .0.join("; "))]
    CheckFailed(Vec<String>),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Output shape {actual:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<Option<i64>>,
        actual: Vec<i64>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;

impl ExportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExportError::ModelNotFound { .. })
    }
}
