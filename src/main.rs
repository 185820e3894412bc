mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use vitpose_export_lib::core::pose_estimator::PoseEstimator;
use vitpose_export_lib::models::pose::PoseConfig;
use vitpose_export_lib::{ExportPipeline, PipelineConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid --log filter")?)
        .init();

    match cli.command {
        None => export(&cli, None, None, None),
        Some(Command::Export {
            ref model_id,
            ref output,
            seed,
        }) => export(&cli, model_id.clone(), output.clone(), seed),
        Some(Command::Infer {
            ref model,
            ref image,
            ref output,
            cpu,
        }) => {
            let config = PoseConfig {
                use_cuda: !cpu,
                ..PoseConfig::default()
            };
            let mut estimator = PoseEstimator::new(model, config)
                .with_context(|| format!("loading {}", model.display()))?;
            estimator
                .infer_file(image, output)
                .with_context(|| format!("estimating pose in {}", image.display()))?;
            Ok(())
        }
    }
}

fn export(
    cli: &Cli,
    model_id: Option<String>,
    output: Option<std::path::PathBuf>,
    seed: Option<u64>,
) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(model_id) = model_id {
        config.model_id = model_id;
    }
    if let Some(output) = output {
        config.output_path = output;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    if config.auth_token.is_none() {
        config.auth_token = std::env::var("HF_TOKEN").ok();
    }

    let pipeline = ExportPipeline::new(config).context("invalid pipeline configuration")?;
    let report = pipeline
        .run()
        .with_context(|| format!("exporting {}", pipeline.config().model_id))?;
    tracing::info!(
        "Wrote {} ({} bytes, {} nodes)",
        report.export.path.display(),
        report.export.file_size_bytes,
        report.export.node_count
    );
    Ok(())
}
