// Data models for model export, synthetic tensors, and pose estimation

pub mod export;
pub mod pose;
pub mod tensor;
pub mod vitpose;
