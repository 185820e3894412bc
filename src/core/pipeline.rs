// End-to-end export pipeline: acquire, trace, write, check, run

use std::fmt;

use serde::Serialize;

use crate::core::checker::verify;
use crate::core::config::PipelineConfig;
use crate::core::exporter::export;
use crate::core::model_hub::{ModelManager, PoseModel};
use crate::core::runtime::run_and_compare;
use crate::core::weights::expected_weights;
use crate::models::export::{ExportError, ExportResult, ExportSummary, RunReport};
use crate::models::tensor::{build_synthetic_input, DenseTensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    BuildInput,
    Export,
    Verify,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Acquire => "acquire",
            Stage::BuildInput => "build-input",
            Stage::Export => "export",
            Stage::Verify => "verify",
            Stage::Run => "run",
        };
        f.write_str(name)
    }
}

/// Everything a successful pipeline run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub model_id: String,
    pub export: ExportSummary,
    pub runs: Vec<RunReport>,
}

/// Compare a runtime output shape with the shape the graph declares.
/// Symbolic dims must carry the input's batch on axis 0 and are free elsewhere.
pub fn compare_shapes(declared: &[Option<i64>], input_batch: i64, actual: &[i64]) -> ExportResult<()> {
    let matches = declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .enumerate()
            .all(|(axis, (want, got))| match want {
                Some(v) => v == got,
                None => axis != 0 || *got == input_batch,
            });
    if matches {
        Ok(())
    } else {
        Err(ExportError::ShapeMismatch {
            expected: declared.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

pub struct ExportPipeline {
    config: PipelineConfig,
}

impl ExportPipeline {
    pub fn new(config: PipelineConfig) -> ExportResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Acquire the configured checkpoint and run every later stage on it
    pub fn run(&self) -> ExportResult<PipelineReport> {
        let model = self.acquire()?;
        self.run_with_model(&model)
    }

    pub fn acquire(&self) -> ExportResult<PoseModel> {
        println!("Loading model: {}", self.config.model_id);
        tracing::debug!(stage = %Stage::Acquire, cache = %self.config.cache_dir.display());
        let manager = ModelManager::new(self.config.cache_dir.clone())?
            .with_auth_token(self.config.auth_token.clone());
        manager.acquire(&self.config.model_id, &self.config.revision)
    }

    pub fn build_input(&self, batch_size: usize) -> DenseTensor {
        tracing::debug!(stage = %Stage::BuildInput, batch_size);
        build_synthetic_input(
            batch_size,
            3,
            self.config.height,
            self.config.width,
            self.config.seed,
        )
    }

    /// Export, verify and run an already loaded model
    pub fn run_with_model(&self, model: &PoseModel) -> ExportResult<PipelineReport> {
        let config = &self.config;
        config.validate_for_patch_size(model.config.backbone_config.patch_size)?;

        let input = self.build_input(config.batch_size);

        println!("Exporting to {}...", config.output_path.display());
        tracing::debug!(stage = %Stage::Export);
        let summary = export(model, &input, &config.output_path, &config.export)?;
        println!("Export complete.");

        println!("Verifying ONNX model...");
        tracing::debug!(stage = %Stage::Verify);
        verify(&config.output_path)?;

        let mut runs = Vec::with_capacity(1 + config.verify_batch_sizes.len());
        runs.push(self.run_once(model, &summary, &input)?);
        println!("ONNX Runtime inference successful.");
        println!("Output shape: {:?}", runs[0].output_shape);

        for &batch_size in &config.verify_batch_sizes {
            let input = self.build_input(batch_size);
            let report = self.run_once(model, &summary, &input)?;
            println!("Batch {}: output shape {:?}", batch_size, report.output_shape);
            runs.push(report);
        }

        Ok(PipelineReport {
            model_id: model.id.clone(),
            export: summary,
            runs,
        })
    }

    fn run_once(
        &self,
        model: &PoseModel,
        summary: &ExportSummary,
        input: &DenseTensor,
    ) -> ExportResult<RunReport> {
        tracing::debug!(stage = %Stage::Run, shape = ?input.shape);
        let config = &self.config;

        // Parameters declared as graph inputs are fed from the loaded weights
        let mut parameter_feeds = Vec::new();
        if !config.export.embed_parameters {
            for spec in expected_weights(&model.config) {
                let tensor = model.weights.get(&spec.name, &spec.shape)?;
                parameter_feeds.push((spec.name, tensor));
            }
        }
        let extra: Vec<(&str, &DenseTensor)> = parameter_feeds
            .iter()
            .map(|(name, tensor)| (name.as_str(), *tensor))
            .collect();

        let (report, _) = run_and_compare(
            &config.output_path,
            &config.export.input_name,
            input,
            &extra,
            config.use_cuda,
        )?;

        let input_batch = report.input_shape.first().copied().unwrap_or_default();
        compare_shapes(&summary.output_dims, input_batch, &report.output_shape)?;
        Ok(report)
    }
}
