// Structural validation of exported ONNX files

use std::collections::HashSet;
use std::path::Path;

use crate::models::export::{ExportError, ExportResult};
use crate::onnx::decode_model;
use crate::onnx::proto::{AttributeType, DataType, GraphProto, ModelProto, TensorProto, ValueInfoProto};
use crate::onnx::schema::{self, AttrSpec};

/// Newest IR version this checker understands
pub const MAX_IR_VERSION: i64 = 9;

/// Newest default-domain opset this checker accepts
pub const MAX_CHECKED_OPSET: i64 = 21;

/// Read, decode and check a model file
pub fn verify(path: &Path) -> ExportResult<ModelProto> {
    let bytes = std::fs::read(path)?;
    let model = decode_model(&bytes)?;
    let issues = check_model(&model);
    if !issues.is_empty() {
        for issue in &issues {
            tracing::warn!("{}: {}", path.display(), issue);
        }
        return Err(ExportError::CheckFailed(issues));
    }
    let graph_nodes = model.graph.as_ref().map_or(0, |g| g.node.len());
    tracing::info!("{} passed the model check ({} nodes)", path.display(), graph_nodes);
    Ok(model)
}

/// Every structural problem in `model`; empty when the model is well formed
pub fn check_model(model: &ModelProto) -> Vec<String> {
    let mut issues = Vec::new();

    if model.ir_version <= 0 {
        issues.push("ir_version is not set".to_string());
    } else if model.ir_version > MAX_IR_VERSION {
        issues.push(format!(
            "ir_version {} is newer than supported ({})",
            model.ir_version, MAX_IR_VERSION
        ));
    }

    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version);
    match opset {
        None => issues.push("no opset imported for the default domain".to_string()),
        Some(v) if v < 1 || v > MAX_CHECKED_OPSET => {
            issues.push(format!("default-domain opset {} is not supported", v))
        }
        Some(_) => {}
    }

    match &model.graph {
        Some(graph) => check_graph(graph, opset, &mut issues),
        None => issues.push("model has no graph".to_string()),
    }
    issues
}

fn check_graph(graph: &GraphProto, opset: Option<i64>, issues: &mut Vec<String>) {
    if graph.name.is_empty() {
        issues.push("graph has no name".to_string());
    }
    if graph.input.is_empty() {
        issues.push("graph declares no inputs".to_string());
    }
    if graph.output.is_empty() {
        issues.push("graph declares no outputs".to_string());
    }

    let mut defined: HashSet<&str> = HashSet::new();
    for value in &graph.input {
        check_value_info(value, "input", issues);
        if !defined.insert(value.name.as_str()) {
            issues.push(format!("graph input '{}' is declared twice", value.name));
        }
    }

    let mut initializer_names = HashSet::new();
    for tensor in &graph.initializer {
        if tensor.name.is_empty() {
            issues.push("initializer without a name".to_string());
        }
        if !initializer_names.insert(tensor.name.as_str()) {
            issues.push(format!("initializer '{}' is declared twice", tensor.name));
        }
        check_tensor(tensor, issues);
        defined.insert(tensor.name.as_str());
    }

    for (index, node) in graph.node.iter().enumerate() {
        let label = if node.name.is_empty() {
            format!("node #{} ({})", index, node.op_type)
        } else {
            format!("node '{}'", node.name)
        };

        for input in &node.input {
            if !input.is_empty() && !defined.contains(input.as_str()) {
                issues.push(format!("{} reads '{}' before it is defined", label, input));
            }
        }

        if !node.domain.is_empty() && node.domain != "ai.onnx" {
            issues.push(format!("{} uses unsupported domain '{}'", label, node.domain));
        } else {
            match schema::lookup(&node.op_type) {
                None => issues.push(format!("{} has unknown op type '{}'", label, node.op_type)),
                Some(op) => {
                    if let Some(opset) = opset.filter(|v| op.since_version > *v) {
                        issues.push(format!(
                            "{}: {} needs opset {}, model imports {}",
                            label, node.op_type, op.since_version, opset
                        ));
                    }
                    let inputs = node.input.len();
                    if inputs < op.min_inputs || inputs > op.max_inputs {
                        issues.push(format!(
                            "{}: {} takes {}..={} inputs, got {}",
                            label, node.op_type, op.min_inputs, op.max_inputs, inputs
                        ));
                    }
                    let outputs = node.output.len();
                    if outputs < op.min_outputs || outputs > op.max_outputs {
                        issues.push(format!(
                            "{}: {} produces {}..={} outputs, got {}",
                            label, node.op_type, op.min_outputs, op.max_outputs, outputs
                        ));
                    }
                    for spec in op.attributes.iter().filter(|a| a.required) {
                        if !node.attribute.iter().any(|a| a.name == spec.name) {
                            issues.push(format!(
                                "{}: required attribute '{}' is missing",
                                label, spec.name
                            ));
                        }
                    }
                    for attr in &node.attribute {
                        match op.attribute(&attr.name) {
                            None => issues.push(format!(
                                "{}: unrecognised attribute '{}' for {}",
                                label, attr.name, node.op_type
                            )),
                            Some(AttrSpec {
                                removed_in: Some(removed),
                                ..
                            }) if opset.is_some_and(|v| v >= *removed) => issues.push(format!(
                                "{}: attribute '{}' of {} was replaced by an input in opset {}",
                                label, attr.name, node.op_type, removed
                            )),
                            Some(spec) if AttributeType::try_from(attr.r#type).ok() != Some(spec.kind) => {
                                issues.push(format!(
                                    "{}: attribute '{}' should be {:?}",
                                    label, attr.name, spec.kind
                                ))
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
        }

        for output in &node.output {
            if output.is_empty() {
                continue;
            }
            if !defined.insert(output.as_str()) {
                issues.push(format!("{} redefines '{}'", label, output));
            }
        }
    }

    for value in &graph.output {
        check_value_info(value, "output", issues);
        if !defined.contains(value.name.as_str()) {
            issues.push(format!("graph output '{}' is never produced", value.name));
        }
    }
}

fn check_value_info(value: &ValueInfoProto, role: &str, issues: &mut Vec<String>) {
    if value.name.is_empty() {
        issues.push(format!("graph {} without a name", role));
        return;
    }
    match value.tensor_type() {
        None => issues.push(format!("graph {} '{}' has no tensor type", role, value.name)),
        Some(t) if t.elem_type == DataType::Undefined as i32 => {
            issues.push(format!("graph {} '{}' has no element type", role, value.name))
        }
        Some(_) => {}
    }
}

fn check_tensor(tensor: &TensorProto, issues: &mut Vec<String>) {
    if tensor.dims.iter().any(|d| *d < 0) {
        issues.push(format!("initializer '{}' has negative dims {:?}", tensor.name, tensor.dims));
        return;
    }
    // Externally stored payloads are not inspected
    if tensor.data_location == 1 {
        return;
    }
    let data_type = tensor.data_type();
    let Some(element_size) = data_type.element_size() else {
        issues.push(format!(
            "initializer '{}' has unsupported data type {}",
            tensor.name, tensor.data_type
        ));
        return;
    };

    let numel = tensor.numel() as usize;
    if !tensor.raw_data.is_empty() {
        if tensor.raw_data.len() != numel * element_size {
            issues.push(format!(
                "initializer '{}' holds {} bytes, dims {:?} need {}",
                tensor.name,
                tensor.raw_data.len(),
                tensor.dims,
                numel * element_size
            ));
        }
        return;
    }
    let stored = match data_type {
        DataType::Float => tensor.float_data.len(),
        DataType::Int64 => tensor.int64_data.len(),
        _ => tensor.int32_data.len(),
    };
    if stored != numel {
        issues.push(format!(
            "initializer '{}' holds {} values, dims {:?} need {}",
            tensor.name, stored, tensor.dims, numel
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exporter::export;
    use crate::core::model_hub::PoseModel;
    use crate::core::testing::tiny_config;
    use crate::models::export::ExportOptions;
    use crate::models::tensor::build_synthetic_input;
    use crate::onnx::builder::{self, attr_int, attr_ints, tensor_f32, Dim, GraphBuilder, ParameterMode};

    fn relu_model() -> ModelProto {
        let mut b = GraphBuilder::new("g", ParameterMode::Embedded);
        let x = b.input("x", DataType::Float, &[Dim::Symbolic("batch_size".into())]);
        let y = b.node("Relu", &[&x], vec![]);
        b.output(&y, "y", DataType::Float, &[Dim::Symbolic("batch_size".into())]);
        builder::model(b.finish(), 14, &[])
    }

    fn graph_mut(model: &mut ModelProto) -> &mut GraphProto {
        model.graph.as_mut().unwrap()
    }

    #[test]
    fn test_valid_model_has_no_issues() {
        assert!(check_model(&relu_model()).is_empty());
    }

    #[test]
    fn test_exported_models_pass() {
        for simple in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("model.onnx");
            let model = PoseModel::random(tiny_config(simple), Some(9)).unwrap();
            let input = build_synthetic_input(1, 3, 32, 16, None);
            export(&model, &input, &path, &ExportOptions::default()).unwrap();
            verify(&path).unwrap();
        }
    }

    #[test]
    fn test_detects_use_before_definition() {
        let mut model = relu_model();
        graph_mut(&mut model).node[0].input[0] = "missing".into();
        let issues = check_model(&model);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("before it is defined"));
    }

    #[test]
    fn test_detects_unknown_op_and_opset() {
        let mut model = relu_model();
        graph_mut(&mut model).node[0].op_type = "FancyOp".into();
        assert!(check_model(&model)[0].contains("unknown op type"));

        let mut model = relu_model();
        graph_mut(&mut model).node[0].op_type = "Gelu".into();
        assert!(check_model(&model)[0].contains("needs opset 20"));
    }

    #[test]
    fn test_detects_attribute_problems() {
        let mut model = relu_model();
        let node = &mut graph_mut(&mut model).node[0];
        node.op_type = "Concat".into();
        assert!(check_model(&model)[0].contains("required attribute 'axis'"));

        graph_mut(&mut model).node[0].attribute.push(crate::onnx::builder::attr_float("axis", 1.0));
        assert!(check_model(&model)[0].contains("should be Int"));

        let mut model = relu_model();
        graph_mut(&mut model).node[0].attribute.push(attr_int("alpha", 1));
        assert!(check_model(&model)[0].contains("unrecognised attribute"));
    }

    #[test]
    fn test_rejects_axes_attribute_after_it_became_an_input() {
        let reduce_model = |opset| {
            let mut b = GraphBuilder::new("g", ParameterMode::Embedded);
            let x = b.input("x", DataType::Float, &[Dim::Fixed(2), Dim::Fixed(3)]);
            let y = b.node(
                "ReduceMean",
                &[&x],
                vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)],
            );
            b.output(&y, "y", DataType::Float, &[Dim::Fixed(2), Dim::Fixed(1)]);
            builder::model(b.finish(), opset, &[])
        };

        assert!(check_model(&reduce_model(17)).is_empty());
        let issues = check_model(&reduce_model(18));
        assert_eq!(issues.len(), 1, "{:?}", issues);
        assert!(issues[0].contains("'axes' of ReduceMean was replaced by an input in opset 18"));
    }

    #[test]
    fn test_detects_bad_initializer_and_outputs() {
        let mut model = relu_model();
        let mut bad = tensor_f32("w", &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        bad.raw_data.truncate(12);
        graph_mut(&mut model).initializer.push(bad);
        graph_mut(&mut model).output[0].name = "z".into();
        let issues = check_model(&model);
        assert_eq!(issues.len(), 2, "{:?}", issues);
    }

    #[test]
    fn test_collects_model_level_issues() {
        let mut model = relu_model();
        model.ir_version = 0;
        model.opset_import.clear();
        graph_mut(&mut model).name.clear();
        assert_eq!(check_model(&model).len(), 3);
    }

    #[test]
    fn test_verify_reports_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.onnx");
        std::fs::write(&path, b"\xff\xff\xff\xff").unwrap();
        assert!(verify(&path).is_err());
    }
}
