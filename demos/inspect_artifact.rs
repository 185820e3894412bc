/// Inspect an exported ONNX file
///
/// Prints the declared inputs and outputs, metadata, and how often each
/// operator appears, then runs the structural checker on it.
///
/// Run with: cargo run --example inspect_artifact -- vitpose_base.onnx

use std::collections::BTreeMap;
use std::path::PathBuf;

use vitpose_export_lib::core::checker::check_model;
use vitpose_export_lib::onnx::decode_model;
use vitpose_export_lib::onnx::proto::tensor_shape_proto::dimension::Value;
use vitpose_export_lib::onnx::proto::ValueInfoProto;

fn describe(value: &ValueInfoProto) -> String {
    let Some(tensor) = value.tensor_type() else {
        return format!("{}: <untyped>", value.name);
    };
    let dims: Vec<String> = tensor
        .shape
        .iter()
        .flat_map(|s| s.dim.iter())
        .map(|d| match &d.value {
            Some(Value::DimValue(v)) => v.to_string(),
            Some(Value::DimParam(p)) => p.clone(),
            None => "?".to_string(),
        })
        .collect();
    format!("{}: elem_type={} [{}]", value.name, tensor.elem_type, dims.join(", "))
}

fn main() -> anyhow::Result<()> {
    let path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "vitpose_base.onnx".to_string()),
    );
    let bytes = std::fs::read(&path)?;
    let model = decode_model(&bytes)?;

    println!("=== {} ({} bytes) ===", path.display(), bytes.len());
    println!("   IR version: {}", model.ir_version);
    for opset in &model.opset_import {
        println!("   Opset: '{}' v{}", opset.domain, opset.version);
    }
    for entry in &model.metadata_props {
        println!("   {} = {}", entry.key, entry.value);
    }

    if let Some(graph) = &model.graph {
        println!("\nInputs:");
        for value in &graph.input {
            println!("   {}", describe(value));
        }
        println!("Outputs:");
        for value in &graph.output {
            println!("   {}", describe(value));
        }

        let mut ops: BTreeMap<&str, usize> = BTreeMap::new();
        for node in &graph.node {
            *ops.entry(node.op_type.as_str()).or_default() += 1;
        }
        println!(
            "\n{} nodes, {} initializers",
            graph.node.len(),
            graph.initializer.len()
        );
        for (op, count) in ops {
            println!("   {:<20} {}", op, count);
        }
    }

    let issues = check_model(&model);
    if issues.is_empty() {
        println!("\n✓ Model check passed");
    } else {
        println!("\n✗ {} issue(s):", issues.len());
        for issue in issues {
            println!("   {}", issue);
        }
    }

    Ok(())
}
