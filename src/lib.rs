pub mod core;
pub mod models;
pub mod onnx;

pub use core::config::PipelineConfig;
pub use core::pipeline::{ExportPipeline, PipelineReport};
pub use models::export::{ExportError, ExportOptions, ExportResult};
