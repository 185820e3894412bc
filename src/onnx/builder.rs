// Incremental ONNX graph construction
// Names values the way traced exports do ("/scope/Op_output_0") so graphs stay readable in Netron.

use std::collections::HashMap;

use super::proto::{
    tensor_shape_proto, type_proto, AttributeProto, AttributeType, DataType, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto, TensorProto,
    TensorShapeProto, TypeProto, ValueInfoProto,
};

/// One dimension of a declared graph input/output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

/// Where trained parameters end up in the exported graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    /// Stored as initializers inside the model file
    Embedded,
    /// Declared as extra graph inputs, supplied by the caller at run time
    GraphInputs,
}

pub struct GraphBuilder {
    name: String,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
    parameter_inputs: Vec<ValueInfoProto>,
    parameter_mode: ParameterMode,
    scopes: Vec<String>,
    counters: HashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, parameter_mode: ParameterMode) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameter_inputs: Vec::new(),
            parameter_mode,
            scopes: Vec::new(),
            counters: HashMap::new(),
        }
    }

    pub fn parameter_mode(&self) -> ParameterMode {
        self.parameter_mode
    }

    /// Run `f` with `scope` appended to the node name prefix
    pub fn scoped<T>(&mut self, scope: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.scopes.push(scope.to_string());
        let out = f(self);
        self.scopes.pop();
        out
    }

    fn prefix(&self) -> String {
        let mut prefix = String::new();
        for scope in &self.scopes {
            prefix.push('/');
            prefix.push_str(scope);
        }
        prefix
    }

    fn next_name(&mut self, label: &str) -> String {
        let base = format!("{}/{}", self.prefix(), label);
        let count = self.counters.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base
        } else {
            format!("{}_{}", base, count)
        };
        *count += 1;
        name
    }

    /// Declare a graph input and return its value name
    pub fn input(&mut self, name: &str, elem_type: DataType, dims: &[Dim]) -> String {
        self.inputs.push(value_info(name, elem_type, dims));
        name.to_string()
    }

    /// Declare `value` as a graph output called `name`.
    /// The producing node's output is renamed so no Identity node is needed.
    pub fn output(&mut self, value: &str, name: &str, elem_type: DataType, dims: &[Dim]) {
        if value != name {
            for node in &mut self.nodes {
                for slot in node.input.iter_mut().chain(node.output.iter_mut()) {
                    if slot == value {
                        *slot = name.to_string();
                    }
                }
            }
        }
        self.outputs.push(value_info(name, elem_type, dims));
    }

    /// Trained parameter: an initializer or an extra graph input, depending on the mode
    pub fn parameter(&mut self, name: &str, dims: &[i64], data: &[f32]) -> String {
        match self.parameter_mode {
            ParameterMode::Embedded => self.constant_f32(name, dims, data),
            ParameterMode::GraphInputs => {
                let fixed: Vec<Dim> = dims.iter().map(|d| Dim::Fixed(*d)).collect();
                self.parameter_inputs
                    .push(value_info(name, DataType::Float, &fixed));
                name.to_string()
            }
        }
    }

    /// Graph constant that is always embedded (shapes, scalars)
    pub fn constant_f32(&mut self, name: &str, dims: &[i64], data: &[f32]) -> String {
        self.initializers.push(tensor_f32(name, dims, data));
        name.to_string()
    }

    pub fn constant_i64(&mut self, name: &str, dims: &[i64], data: &[i64]) -> String {
        self.initializers.push(tensor_i64(name, dims, data));
        name.to_string()
    }

    /// Scalar f32 constant named after the current scope
    pub fn scalar(&mut self, label: &str, value: f32) -> String {
        let name = self.next_name(label);
        self.constant_f32(&name, &[], &[value])
    }

    /// 1-D f32 constant named after the current scope
    pub fn floats(&mut self, label: &str, values: &[f32]) -> String {
        let name = self.next_name(label);
        self.constant_f32(&name, &[values.len() as i64], values)
    }

    /// 1-D i64 constant named after the current scope
    pub fn ints(&mut self, label: &str, values: &[i64]) -> String {
        let name = self.next_name(label);
        self.constant_i64(&name, &[values.len() as i64], values)
    }

    /// Append a single-output node and return the output value name
    pub fn node(&mut self, op_type: &str, inputs: &[&str], attribute: Vec<AttributeProto>) -> String {
        let name = self.next_name(op_type);
        let output = format!("{}_output_0", name);
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            domain: String::new(),
            attribute,
            doc_string: String::new(),
        });
        output
    }

    pub fn finish(self) -> GraphProto {
        let mut input = self.inputs;
        input.extend(self.parameter_inputs);
        GraphProto {
            node: self.nodes,
            name: self.name,
            initializer: self.initializers,
            doc_string: String::new(),
            input,
            output: self.outputs,
            value_info: Vec::new(),
        }
    }
}

/// IR version matching an opset release
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        _ => 9,
    }
}

/// Wrap a graph into a model importing the default domain at `opset`
pub fn model(graph: GraphProto, opset: i64, metadata: &[(String, String)]) -> ModelProto {
    ModelProto {
        ir_version: ir_version_for_opset(opset),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset,
        }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        domain: String::new(),
        model_version: 0,
        doc_string: String::new(),
        graph: Some(graph),
        metadata_props: metadata
            .iter()
            .map(|(key, value)| StringStringEntryProto {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
    }
}

pub fn value_info(name: &str, elem_type: DataType, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            denotation: String::new(),
            value: Some(match d {
                Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(*v),
                Dim::Symbolic(p) => tensor_shape_proto::dimension::Value::DimParam(p.clone()),
            }),
        })
        .collect();

    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        doc_string: String::new(),
    }
}

pub fn tensor_f32(name: &str, dims: &[i64], data: &[f32]) -> TensorProto {
    let mut raw_data = Vec::with_capacity(data.len() * 4);
    for v in data {
        raw_data.extend_from_slice(&v.to_le_bytes());
    }
    TensorProto {
        dims: dims.to_vec(),
        data_type: DataType::Float as i32,
        name: name.to_string(),
        raw_data,
        ..Default::default()
    }
}

pub fn tensor_i64(name: &str, dims: &[i64], data: &[i64]) -> TensorProto {
    let mut raw_data = Vec::with_capacity(data.len() * 8);
    for v in data {
        raw_data.extend_from_slice(&v.to_le_bytes());
    }
    TensorProto {
        dims: dims.to_vec(),
        data_type: DataType::Int64 as i32,
        name: name.to_string(),
        raw_data,
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

pub fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        ..Default::default()
    }
}

pub fn attr_string(name: &str, value: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::String as i32,
        s: value.as_bytes().to_vec(),
        ..Default::default()
    }
}
