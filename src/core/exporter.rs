// Writes a pose model to an ONNX file

use std::fs;
use std::path::Path;

use crate::core::model_hub::PoseModel;
use crate::core::vitpose_graph::lower;
use crate::models::export::{ExportOptions, ExportResult, ExportSummary};
use crate::models::tensor::DenseTensor;
use crate::onnx::{builder, encode_model, fold_constants, Dim};

/// Static size of a declared dimension, `None` when symbolic
pub fn dim_value(dim: &Dim) -> Option<i64> {
    match dim {
        Dim::Fixed(v) => Some(*v),
        Dim::Symbolic(_) => None,
    }
}

/// Trace `model` with `input`'s geometry and write the graph to `path`
pub fn export(
    model: &PoseModel,
    input: &DenseTensor,
    path: &Path,
    options: &ExportOptions,
) -> ExportResult<ExportSummary> {
    options.validate()?;

    let lowered = lower(model, &input.shape, options)?;
    let mut graph = lowered.graph;
    tracing::debug!(
        "Lowered {} to {} nodes, {} initializers",
        model.id,
        graph.node.len(),
        graph.initializer.len()
    );

    let folded_nodes = if options.constant_folding {
        let stats = fold_constants(&mut graph);
        tracing::debug!(
            "Constant folding: {} nodes folded, {} initializers dropped",
            stats.folded_nodes,
            stats.removed_initializers
        );
        stats.folded_nodes
    } else {
        0
    };

    let config = &model.config;
    let (heat_h, heat_w) = config.heatmap_size(input.shape[2], input.shape[3]);
    let metadata = vec![
        ("source_model".to_string(), model.id.clone()),
        ("num_joints".to_string(), config.num_joints().to_string()),
        ("heatmap_size".to_string(), format!("{}x{}", heat_h, heat_w)),
        (
            "parameters".to_string(),
            if options.embed_parameters { "embedded" } else { "inputs" }.to_string(),
        ),
    ];

    let node_count = graph.node.len();
    let initializer_count = graph.initializer.len();
    let onnx_model = builder::model(graph, options.opset_version, &metadata);
    let bytes = encode_model(&onnx_model);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, &bytes)?;

    let summary = ExportSummary {
        path: path.to_path_buf(),
        file_size_bytes: bytes.len() as u64,
        node_count,
        initializer_count,
        parameter_count: model.weights.parameter_count(),
        folded_nodes,
        input_dims: lowered.input_dims.iter().map(dim_value).collect(),
        output_dims: lowered.output_dims.iter().map(dim_value).collect(),
    };
    tracing::info!(
        "Exported {} to {} ({} nodes, {:.1} MB)",
        model.id,
        path.display(),
        node_count,
        summary.file_size_bytes as f64 / 1_048_576.0
    );
    Ok(summary)
}
