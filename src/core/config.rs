use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::export::{ExportError, ExportOptions, ExportResult};

/// Checkpoint exported when nothing else is configured
pub const DEFAULT_MODEL_ID: &str = "usyd-community/vitpose-base-simple";

/// Export pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Hub identifier (`owner/name`) or a local checkpoint directory
    pub model_id: String,
    /// Hub branch, tag or commit
    pub revision: String,
    /// Where downloaded checkpoints are cached
    pub cache_dir: PathBuf,
    /// Bearer token for gated repositories
    pub auth_token: Option<String>,
    /// Where the ONNX file is written
    pub output_path: PathBuf,
    /// Input image height in pixels
    pub height: usize,
    /// Input image width in pixels
    pub width: usize,
    /// Batch size of the synthetic input used for export and the first run
    pub batch_size: usize,
    /// Seed for the synthetic input; `None` draws fresh values every run
    pub seed: Option<u64>,
    /// Additional batch sizes the exported file is run with
    pub verify_batch_sizes: Vec<usize>,
    /// Try the CUDA execution provider when running the artifact
    pub use_cuda: bool,
    pub export: ExportOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: "main".to_string(),
            cache_dir: default_cache_dir(),
            auth_token: None,
            output_path: PathBuf::from("vitpose_base.onnx"),
            height: 256,
            width: 192,
            batch_size: 1,
            seed: None,
            verify_batch_sizes: Vec::new(),
            use_cuda: false,
            export: ExportOptions::default(),
        }
    }
}

/// `$HF_HOME`-style cache under the user's home, or `./.cache` without one
fn default_cache_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    let mut path = PathBuf::from(home);
    path.push(".cache");
    path.push("vitpose-export");
    path.push("models");
    path
}

impl PipelineConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> ExportResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| ExportError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> ExportResult<()> {
        self.validate()?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ExportError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> ExportResult<()> {
        let invalid = |msg: String| Err(ExportError::InvalidConfig(msg));

        if self.model_id.trim().is_empty() {
            return invalid("model_id cannot be empty".into());
        }
        if self.revision.trim().is_empty() {
            return invalid("revision cannot be empty".into());
        }

        // Opset and tensor names
        self.export.validate()?;

        // Validate image size
        if self.height == 0 || self.width == 0 {
            return invalid(format!(
                "Invalid input size: {}x{}. Height and width must be non-zero",
                self.height, self.width
            ));
        }

        // Validate batch sizes
        if self.batch_size == 0 || self.verify_batch_sizes.contains(&0) {
            return invalid("Batch sizes must be at least 1".into());
        }
        if self.export.dynamic_batch.is_none()
            && self.verify_batch_sizes.iter().any(|b| *b != self.batch_size)
        {
            return invalid(
                "verify_batch_sizes needs a dynamic batch axis (export.dynamic_batch)".into(),
            );
        }

        if self.output_path.as_os_str().is_empty() {
            return invalid("output_path cannot be empty".into());
        }

        Ok(())
    }

    /// Patch-size divisibility, checked once the model's config is known
    pub fn validate_for_patch_size(&self, patch_size: [usize; 2]) -> ExportResult<()> {
        if self.height % patch_size[0] != 0 || self.width % patch_size[1] != 0 {
            return Err(ExportError::InvalidConfig(format!(
                "Input size {}x{} is not divisible by patch size {:?}",
                self.height, self.width, patch_size
            )));
        }
        Ok(())
    }
}
