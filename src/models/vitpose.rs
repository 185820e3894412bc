// ViTPose model configuration as published in the hub's config.json

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::export::{ExportError, ExportResult};

/// COCO body keypoints predicted by the released checkpoints
pub const DEFAULT_NUM_JOINTS: usize = 17;

/// Padding applied by the patch-embedding convolution
pub const PATCH_EMBED_PADDING: usize = 2;

// ==============================================================================
// Backbone
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,
    #[serde(default = "default_image_size")]
    pub image_size: [usize; 2], // [height, width]
    #[serde(default = "default_patch_size")]
    pub patch_size: [usize; 2], // [height, width]
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_num_experts")]
    pub num_experts: usize,
    /// 1-based indices of the encoder stages exposed as features
    #[serde(default)]
    pub out_indices: Option<Vec<usize>>,
}

fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_mlp_ratio() -> usize {
    4
}
fn default_image_size() -> [usize; 2] {
    [256, 192]
}
fn default_patch_size() -> [usize; 2] {
    [16, 16]
}
fn default_num_channels() -> usize {
    3
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}
fn default_true() -> bool {
    true
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_num_experts() -> usize {
    1
}
fn default_scale_factor() -> usize {
    4
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            mlp_ratio: default_mlp_ratio(),
            image_size: default_image_size(),
            patch_size: default_patch_size(),
            num_channels: default_num_channels(),
            layer_norm_eps: default_layer_norm_eps(),
            qkv_bias: true,
            hidden_act: default_hidden_act(),
            num_experts: default_num_experts(),
            out_indices: None,
        }
    }
}

impl BackboneConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn intermediate_size(&self) -> usize {
        self.hidden_size * self.mlp_ratio
    }

    /// Patch grid the position embeddings were trained for
    pub fn patch_grid(&self) -> (usize, usize) {
        (
            self.image_size[0] / self.patch_size[0],
            self.image_size[1] / self.patch_size[1],
        )
    }

    pub fn num_patches(&self) -> usize {
        let (h, w) = self.patch_grid();
        h * w
    }

    /// Encoder stage whose output feeds the decoder (1-based)
    pub fn feature_stage(&self) -> usize {
        self.out_indices
            .as_ref()
            .and_then(|indices| indices.last().copied())
            .unwrap_or(self.num_hidden_layers)
    }

    pub fn activation(&self) -> ExportResult<Activation> {
        Activation::parse(&self.hidden_act)
    }
}

/// Activation used inside the transformer MLP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`
    Gelu,
    /// Tanh approximation of GELU
    GeluTanh,
    Relu,
}

impl Activation {
    pub fn parse(name: &str) -> ExportResult<Self> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            other => Err(ExportError::Unsupported(format!(
                "activation function '{}'",
                other
            ))),
        }
    }
}

// ==============================================================================
// Full model
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitPoseConfig {
    #[serde(default)]
    pub backbone_config: BackboneConfig,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: usize,
    #[serde(default = "default_true")]
    pub use_simple_decoder: bool,
    #[serde(default)]
    pub id2label: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub model_type: Option<String>,
}

impl Default for VitPoseConfig {
    fn default() -> Self {
        Self {
            backbone_config: BackboneConfig::default(),
            scale_factor: default_scale_factor(),
            use_simple_decoder: true,
            id2label: None,
            model_type: Some("vitpose".to_string()),
        }
    }
}

/// Which heatmap head the checkpoint carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    /// ReLU, bilinear upsampling, 3x3 conv
    Simple,
    /// Two deconvolution blocks, 1x1 conv
    Classic,
}

/// Channels of the classic decoder's deconvolution blocks
pub const CLASSIC_DECODER_CHANNELS: usize = 256;

impl VitPoseConfig {
    pub fn from_json(contents: &str) -> ExportResult<Self> {
        let config: VitPoseConfig = serde_json::from_str(contents)
            .map_err(|e| ExportError::InvalidModelConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn num_joints(&self) -> usize {
        match &self.id2label {
            Some(labels) if !labels.is_empty() => labels.len(),
            _ => DEFAULT_NUM_JOINTS,
        }
    }

    pub fn decoder(&self) -> DecoderKind {
        if self.use_simple_decoder {
            DecoderKind::Simple
        } else {
            DecoderKind::Classic
        }
    }

    /// Patch-embedding output grid for an input of `height` x `width`
    pub fn token_grid(&self, height: usize, width: usize) -> (usize, usize) {
        let b = &self.backbone_config;
        let out = |size: usize, patch: usize| (size + 2 * PATCH_EMBED_PADDING - patch) / patch + 1;
        (out(height, b.patch_size[0]), out(width, b.patch_size[1]))
    }

    /// Heatmap resolution produced for an input of `height` x `width`
    pub fn heatmap_size(&self, height: usize, width: usize) -> (usize, usize) {
        let (h, w) = self.token_grid(height, width);
        match self.decoder() {
            DecoderKind::Simple => (h * self.scale_factor, w * self.scale_factor),
            DecoderKind::Classic => (h * 4, w * 4),
        }
    }

    /// Check the input geometry the exported graph will be traced with
    pub fn check_input_size(&self, height: usize, width: usize) -> ExportResult<()> {
        let b = &self.backbone_config;
        if [height, width] != b.image_size {
            return Err(ExportError::InputGeometry(format!(
                "model expects {}x{} images, got {}x{}",
                b.image_size[0], b.image_size[1], height, width
            )));
        }
        if self.token_grid(height, width) != b.patch_grid() {
            return Err(ExportError::InputGeometry(format!(
                "patch grid {:?} does not match position embeddings {:?}",
                self.token_grid(height, width),
                b.patch_grid()
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> ExportResult<()> {
        let b = &self.backbone_config;
        let invalid = |msg: String| Err(ExportError::InvalidModelConfig(msg));

        if b.hidden_size == 0 || b.num_hidden_layers == 0 || b.num_attention_heads == 0 {
            return invalid("hidden_size, num_hidden_layers and num_attention_heads must be non-zero".into());
        }
        if b.hidden_size % b.num_attention_heads != 0 {
            return invalid(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                b.hidden_size, b.num_attention_heads
            ));
        }
        if b.mlp_ratio == 0 || b.num_channels == 0 {
            return invalid("mlp_ratio and num_channels must be non-zero".into());
        }
        if b.patch_size.contains(&0) || b.image_size.contains(&0) {
            return invalid("image_size and patch_size must be non-zero".into());
        }
        if b.image_size[0] < b.patch_size[0] || b.image_size[1] < b.patch_size[1] {
            return invalid(format!(
                "image_size {:?} is smaller than patch_size {:?}",
                b.image_size, b.patch_size
            ));
        }
        if b.num_experts != 1 {
            return Err(ExportError::Unsupported(format!(
                "mixture-of-experts backbones ({} experts)",
                b.num_experts
            )));
        }
        let stage = b.feature_stage();
        if stage == 0 || stage > b.num_hidden_layers {
            return invalid(format!(
                "feature stage {} outside 1..={}",
                stage, b.num_hidden_layers
            ));
        }
        if self.scale_factor == 0 {
            return invalid("scale_factor must be non-zero".into());
        }
        b.activation()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_SIMPLE_JSON: &str = r#"{
        "architectures": ["VitPoseForPoseEstimation"],
        "backbone_config": {
            "model_type": "vitpose_backbone",
            "hidden_size": 768,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "mlp_ratio": 4,
            "image_size": [256, 192],
            "patch_size": [16, 16],
            "layer_norm_eps": 1e-06,
            "qkv_bias": true,
            "out_features": ["stage12"],
            "out_indices": [12]
        },
        "id2label": {"0": "Nose", "1": "L_Eye", "2": "R_Eye", "3": "L_Ear", "4": "R_Ear",
                     "5": "L_Shoulder", "6": "R_Shoulder", "7": "L_Elbow", "8": "R_Elbow",
                     "9": "L_Wrist", "10": "R_Wrist", "11": "L_Hip", "12": "R_Hip",
                     "13": "L_Knee", "14": "R_Knee", "15": "L_Ankle", "16": "R_Ankle"},
        "model_type": "vitpose",
        "scale_factor": 4,
        "use_simple_decoder": true
    }"#;

    #[test]
    fn test_parse_base_simple_config() {
        let config = VitPoseConfig::from_json(BASE_SIMPLE_JSON).unwrap();
        assert_eq!(config.backbone_config.hidden_size, 768);
        assert_eq!(config.backbone_config.layer_norm_eps, 1e-6);
        assert_eq!(config.num_joints(), 17);
        assert_eq!(config.decoder(), DecoderKind::Simple);
        assert_eq!(config.backbone_config.feature_stage(), 12);
        assert_eq!(config.backbone_config.head_dim(), 64);
    }

    #[test]
    fn test_geometry_for_default_input() {
        let config = VitPoseConfig::default();
        assert_eq!(config.token_grid(256, 192), (16, 12));
        assert_eq!(config.backbone_config.num_patches(), 192);
        assert_eq!(config.heatmap_size(256, 192), (64, 48));
        assert!(config.check_input_size(256, 192).is_ok());
        assert!(config.check_input_size(224, 224).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut config = VitPoseConfig::default();
        config.backbone_config.num_attention_heads = 7;
        assert!(config.validate().is_err());

        let mut config = VitPoseConfig::default();
        config.backbone_config.num_experts = 6;
        assert!(matches!(config.validate(), Err(ExportError::Unsupported(_))));

        let mut config = VitPoseConfig::default();
        config.backbone_config.hidden_act = "swish".into();
        assert!(config.validate().is_err());

        let mut config = VitPoseConfig::default();
        config.backbone_config.out_indices = Some(vec![13]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_labels_default_to_coco() {
        let config = VitPoseConfig::from_json("{}").unwrap();
        assert_eq!(config.num_joints(), DEFAULT_NUM_JOINTS);
        assert_eq!(config.backbone_config, BackboneConfig::default());
    }
}
