use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Export a pretrained ViTPose checkpoint to ONNX and check the result.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// JSON pipeline configuration; missing fields keep their defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Log filter (tracing `EnvFilter` syntax).
    #[arg(long, global = true, default_value = "info")]
    pub log: String,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire, export, verify and run the model (the default).
    Export {
        /// Override the checkpoint identifier or local directory.
        #[arg(long)]
        model_id: Option<String>,
        /// Override the output file.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Seed for the synthetic input.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Estimate the pose in an image with an exported model.
    Infer {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value = "result.jpg")]
        output: PathBuf,
        /// Run on CPU even when CUDA is available.
        #[arg(long, default_value_t = false)]
        cpu: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_runs_export() {
        let cli = Cli::try_parse_from(["vitpose-export"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "info");
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_infer_arguments() {
        let cli = Cli::try_parse_from([
            "vitpose-export",
            "infer",
            "--model",
            "m.onnx",
            "--image",
            "person.jpg",
            "--log",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log, "debug");
        match cli.command {
            Some(Command::Infer { model, image, output, cpu }) => {
                assert_eq!(model, PathBuf::from("m.onnx"));
                assert_eq!(image, PathBuf::from("person.jpg"));
                assert_eq!(output, PathBuf::from("result.jpg"));
                assert!(!cpu);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_infer_requires_model_and_image() {
        assert!(Cli::try_parse_from(["vitpose-export", "infer", "--model", "m.onnx"]).is_err());
    }
}
