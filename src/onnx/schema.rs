// Operator schemas for the default ONNX domain
// Only the operators the exporter can emit (plus a few common neighbours) are listed.

use super::proto::AttributeType;

#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
    pub name: &'static str,
    pub kind: AttributeType,
    pub required: bool,
    /// Opset in which the attribute became an input
    pub removed_in: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct OpSchema {
    pub op_type: &'static str,
    /// First opset that defines the operator
    pub since_version: i64,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
    pub attributes: &'static [AttrSpec],
}

const fn opt(name: &'static str, kind: AttributeType) -> AttrSpec {
    AttrSpec {
        name,
        kind,
        required: false,
        removed_in: None,
    }
}

const fn req(name: &'static str, kind: AttributeType) -> AttrSpec {
    AttrSpec {
        name,
        kind,
        required: true,
        removed_in: None,
    }
}

const fn until(name: &'static str, kind: AttributeType, removed_in: i64) -> AttrSpec {
    AttrSpec {
        name,
        kind,
        required: false,
        removed_in: Some(removed_in),
    }
}

const fn op(
    op_type: &'static str,
    since_version: i64,
    inputs: (usize, usize),
    outputs: (usize, usize),
    attributes: &'static [AttrSpec],
) -> OpSchema {
    OpSchema {
        op_type,
        since_version,
        min_inputs: inputs.0,
        max_inputs: inputs.1,
        min_outputs: outputs.0,
        max_outputs: outputs.1,
        attributes,
    }
}

const CONV_ATTRS: &[AttrSpec] = &[
    opt("auto_pad", AttributeType::String),
    opt("dilations", AttributeType::Ints),
    opt("group", AttributeType::Int),
    opt("kernel_shape", AttributeType::Ints),
    opt("pads", AttributeType::Ints),
    opt("strides", AttributeType::Ints),
];

const CONV_TRANSPOSE_ATTRS: &[AttrSpec] = &[
    opt("auto_pad", AttributeType::String),
    opt("dilations", AttributeType::Ints),
    opt("group", AttributeType::Int),
    opt("kernel_shape", AttributeType::Ints),
    opt("output_padding", AttributeType::Ints),
    opt("output_shape", AttributeType::Ints),
    opt("pads", AttributeType::Ints),
    opt("strides", AttributeType::Ints),
];

const RESIZE_ATTRS: &[AttrSpec] = &[
    opt("coordinate_transformation_mode", AttributeType::String),
    opt("cubic_coeff_a", AttributeType::Float),
    opt("exclude_outside", AttributeType::Int),
    opt("extrapolation_value", AttributeType::Float),
    opt("mode", AttributeType::String),
    opt("nearest_mode", AttributeType::String),
];

const UNBOUNDED: usize = usize::MAX;

static SCHEMAS: &[OpSchema] = &[
    op("Add", 1, (2, 2), (1, 1), &[]),
    op("Sub", 1, (2, 2), (1, 1), &[]),
    op("Mul", 1, (2, 2), (1, 1), &[]),
    op("Div", 1, (2, 2), (1, 1), &[]),
    op("Pow", 1, (2, 2), (1, 1), &[]),
    op("Sqrt", 1, (1, 1), (1, 1), &[]),
    op("Erf", 9, (1, 1), (1, 1), &[]),
    op("Tanh", 1, (1, 1), (1, 1), &[]),
    op("Relu", 1, (1, 1), (1, 1), &[]),
    op("Sigmoid", 1, (1, 1), (1, 1), &[]),
    op("Identity", 1, (1, 1), (1, 1), &[]),
    op("MatMul", 1, (2, 2), (1, 1), &[]),
    op(
        "Gemm",
        1,
        (2, 3),
        (1, 1),
        &[
            opt("alpha", AttributeType::Float),
            opt("beta", AttributeType::Float),
            opt("transA", AttributeType::Int),
            opt("transB", AttributeType::Int),
        ],
    ),
    op("Softmax", 1, (1, 1), (1, 1), &[opt("axis", AttributeType::Int)]),
    op(
        "ReduceMean",
        1,
        (1, 2),
        (1, 1),
        &[
            until("axes", AttributeType::Ints, 18),
            opt("keepdims", AttributeType::Int),
        ],
    ),
    op("Reshape", 5, (2, 2), (1, 1), &[opt("allowzero", AttributeType::Int)]),
    op("Transpose", 1, (1, 1), (1, 1), &[opt("perm", AttributeType::Ints)]),
    op("Flatten", 1, (1, 1), (1, 1), &[opt("axis", AttributeType::Int)]),
    op("Shape", 1, (1, 1), (1, 1), &[]),
    op("Gather", 1, (2, 2), (1, 1), &[opt("axis", AttributeType::Int)]),
    op("Unsqueeze", 1, (1, 2), (1, 1), &[until("axes", AttributeType::Ints, 13)]),
    op("Concat", 1, (1, UNBOUNDED), (1, 1), &[req("axis", AttributeType::Int)]),
    op("Cast", 1, (1, 1), (1, 1), &[req("to", AttributeType::Int)]),
    op("Slice", 10, (3, 5), (1, 1), &[]),
    op("Constant", 1, (0, 0), (1, 1), &[]),
    op("Conv", 1, (2, 3), (1, 1), CONV_ATTRS),
    op("ConvTranspose", 1, (2, 3), (1, 1), CONV_TRANSPOSE_ATTRS),
    op(
        "BatchNormalization",
        1,
        (5, 5),
        (1, 3),
        &[
            opt("epsilon", AttributeType::Float),
            opt("momentum", AttributeType::Float),
            opt("training_mode", AttributeType::Int),
        ],
    ),
    op("Resize", 10, (1, 4), (1, 1), RESIZE_ATTRS),
    op(
        "LayerNormalization",
        17,
        (1, 3),
        (1, 3),
        &[
            opt("axis", AttributeType::Int),
            opt("epsilon", AttributeType::Float),
            opt("stash_type", AttributeType::Int),
        ],
    ),
    op("Gelu", 20, (1, 1), (1, 1), &[opt("approximate", AttributeType::String)]),
];

/// Schema for `op_type` in the default domain
pub fn lookup(op_type: &str) -> Option<&'static OpSchema> {
    SCHEMAS.iter().find(|s| s.op_type == op_type)
}

impl OpSchema {
    pub fn attribute(&self, name: &str) -> Option<&AttrSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_ops() {
        let conv = lookup("Conv").unwrap();
        assert_eq!(conv.min_inputs, 2);
        assert_eq!(conv.max_inputs, 3);
        assert!(lookup("Concat").unwrap().attribute("axis").unwrap().required);
        assert!(lookup("NotAnOp").is_none());
    }

    #[test]
    fn test_axes_attributes_record_their_removal() {
        let reduce = lookup("ReduceMean").unwrap();
        assert_eq!(reduce.attribute("axes").unwrap().removed_in, Some(18));
        assert_eq!(reduce.attribute("keepdims").unwrap().removed_in, None);
        assert_eq!(lookup("Unsqueeze").unwrap().attribute("axes").unwrap().removed_in, Some(13));
    }

    #[test]
    fn test_newer_ops_report_their_opset() {
        assert_eq!(lookup("LayerNormalization").unwrap().since_version, 17);
        assert_eq!(lookup("Gelu").unwrap().since_version, 20);
    }
}
