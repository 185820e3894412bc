pub mod checker;
pub mod config;
pub mod exporter;
pub mod model_hub;
pub mod pipeline;
pub mod runtime;
pub mod vitpose_graph;
pub mod weights;

// Image-to-keypoints inference on exported models
pub mod pose_estimator;

#[cfg(test)]
pub(crate) mod testing;
