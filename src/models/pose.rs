// Data models for heatmap-based body pose estimation

use serde::{Deserialize, Serialize};

// ==============================================================================
// Pose Estimate (Unified Result)
// ==============================================================================

/// Decoded keypoints for a single image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub keypoints: Vec<Keypoint2D>,  // One per joint, in original image pixels
    pub heatmap_size: (usize, usize), // (height, width)
    pub image_size: (u32, u32),       // (width, height)
    pub processing_time_ms: u64,
}

impl PoseEstimate {
    /// Keypoints at or above `threshold`, paired with their joint
    pub fn visible(&self, threshold: f32) -> impl Iterator<Item = (CocoKeypoint, &Keypoint2D)> {
        self.keypoints
            .iter()
            .enumerate()
            .filter(move |(_, kp)| kp.is_visible(threshold))
            .filter_map(|(i, kp)| CocoKeypoint::from_index(i).map(|joint| (joint, kp)))
    }
}

// ==============================================================================
// Body Keypoints (COCO, 17 joints)
// ==============================================================================

/// COCO keypoint indices (17 total)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CocoKeypoint {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

pub const COCO_KEYPOINTS: [CocoKeypoint; 17] = [
    CocoKeypoint::Nose,
    CocoKeypoint::LeftEye,
    CocoKeypoint::RightEye,
    CocoKeypoint::LeftEar,
    CocoKeypoint::RightEar,
    CocoKeypoint::LeftShoulder,
    CocoKeypoint::RightShoulder,
    CocoKeypoint::LeftElbow,
    CocoKeypoint::RightElbow,
    CocoKeypoint::LeftWrist,
    CocoKeypoint::RightWrist,
    CocoKeypoint::LeftHip,
    CocoKeypoint::RightHip,
    CocoKeypoint::LeftKnee,
    CocoKeypoint::RightKnee,
    CocoKeypoint::LeftAnkle,
    CocoKeypoint::RightAnkle,
];

impl CocoKeypoint {
    pub fn from_index(index: usize) -> Option<Self> {
        COCO_KEYPOINTS.get(index).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CocoKeypoint::Nose => "Nose",
            CocoKeypoint::LeftEye => "Left Eye",
            CocoKeypoint::RightEye => "Right Eye",
            CocoKeypoint::LeftEar => "Left Ear",
            CocoKeypoint::RightEar => "Right Ear",
            CocoKeypoint::LeftShoulder => "Left Shoulder",
            CocoKeypoint::RightShoulder => "Right Shoulder",
            CocoKeypoint::LeftElbow => "Left Elbow",
            CocoKeypoint::RightElbow => "Right Elbow",
            CocoKeypoint::LeftWrist => "Left Wrist",
            CocoKeypoint::RightWrist => "Right Wrist",
            CocoKeypoint::LeftHip => "Left Hip",
            CocoKeypoint::RightHip => "Right Hip",
            CocoKeypoint::LeftKnee => "Left Knee",
            CocoKeypoint::RightKnee => "Right Knee",
            CocoKeypoint::LeftAnkle => "Left Ankle",
            CocoKeypoint::RightAnkle => "Right Ankle",
        }
    }
}

/// Limbs drawn between keypoints
pub const SKELETON: [(CocoKeypoint, CocoKeypoint); 16] = [
    (CocoKeypoint::Nose, CocoKeypoint::LeftEye),
    (CocoKeypoint::Nose, CocoKeypoint::RightEye),
    (CocoKeypoint::LeftEye, CocoKeypoint::LeftEar),
    (CocoKeypoint::RightEye, CocoKeypoint::RightEar),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::RightShoulder),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::LeftElbow),
    (CocoKeypoint::LeftElbow, CocoKeypoint::LeftWrist),
    (CocoKeypoint::RightShoulder, CocoKeypoint::RightElbow),
    (CocoKeypoint::RightElbow, CocoKeypoint::RightWrist),
    (CocoKeypoint::LeftShoulder, CocoKeypoint::LeftHip),
    (CocoKeypoint::RightShoulder, CocoKeypoint::RightHip),
    (CocoKeypoint::LeftHip, CocoKeypoint::RightHip),
    (CocoKeypoint::LeftHip, CocoKeypoint::LeftKnee),
    (CocoKeypoint::LeftKnee, CocoKeypoint::LeftAnkle),
    (CocoKeypoint::RightHip, CocoKeypoint::RightKnee),
    (CocoKeypoint::RightKnee, CocoKeypoint::RightAnkle),
];

// ==============================================================================
// Shared: 2D Keypoint
// ==============================================================================

/// A keypoint in image pixels with its heatmap peak as score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint2D {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

impl Keypoint2D {
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Self { x, y, score }
    }

    pub fn is_visible(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

// ==============================================================================
// Configuration
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseConfig {
    pub input_width: u32,       // Model input width (default: 192)
    pub input_height: u32,      // Model input height (default: 256)
    pub mean: [f32; 3],         // ImageNet channel mean
    pub std: [f32; 3],          // ImageNet channel std
    pub min_keypoint_score: f32, // Keypoints below this are not drawn (default: draw all)
    pub use_cuda: bool,         // Try the CUDA execution provider first
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            input_width: 192,
            input_height: 256,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            min_keypoint_score: f32::NEG_INFINITY,
            use_cuda: true,
        }
    }
}

// ==============================================================================
// Error Types
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PoseError {
    #[error("Could not read image: {0}")]
    ImageLoadFailed(String),

    #[error("Could not write image: {0}")]
    ImageSaveFailed(String),

    #[error("Model loading failed: {0}")]
    ModelLoadFailed(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Unexpected heatmap shape: {0:?}")]
    InvalidHeatmap(Vec<i64>),

    #[error("Not supported in this build: {0}")]
    NotSupported(String),
}

pub type PoseResult<T> = Result<T, PoseError>;
