// ONNX model representation, construction and graph passes

pub mod builder;
pub mod folding;
pub mod proto;
pub mod schema;

pub use builder::{Dim, GraphBuilder, ParameterMode};
pub use folding::{fold_constants, FoldStats};
pub use proto::{DataType, GraphProto, ModelProto};

use prost::Message;

/// Serialize a model to protobuf bytes
pub fn encode_model(model: &ModelProto) -> Vec<u8> {
    model.encode_to_vec()
}

/// Parse protobuf bytes into a model
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto, prost::DecodeError> {
    ModelProto::decode(bytes)
}
