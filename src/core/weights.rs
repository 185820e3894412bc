// Named parameter tensors for a ViTPose checkpoint
// Reads safetensors files and knows which tensors a given configuration needs.

use std::collections::BTreeMap;
use std::path::Path;

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::models::export::{ExportError, ExportResult};
use crate::models::tensor::DenseTensor;
use crate::models::vitpose::{DecoderKind, VitPoseConfig, CLASSIC_DECODER_CHANNELS};

// ==============================================================================
// Expected Layout
// ==============================================================================

/// How a parameter is filled when no checkpoint is available
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Normal(f32),
    Zeros,
    Ones,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

fn spec(name: impl Into<String>, shape: &[usize], init: Init) -> WeightSpec {
    WeightSpec {
        name: name.into(),
        shape: shape.to_vec(),
        init,
    }
}

pub fn layer_prefix(index: usize) -> String {
    format!("backbone.encoder.layer.{}", index)
}

/// Every tensor the forward pass reads for `config`, with its shape
pub fn expected_weights(config: &VitPoseConfig) -> Vec<WeightSpec> {
    let b = &config.backbone_config;
    let d = b.hidden_size;
    let joints = config.num_joints();
    let init_std = Init::Normal(0.02);
    let mut specs = vec![
        spec(
            "backbone.embeddings.patch_embeddings.projection.weight",
            &[d, b.num_channels, b.patch_size[0], b.patch_size[1]],
            init_std,
        ),
        spec("backbone.embeddings.patch_embeddings.projection.bias", &[d], Init::Zeros),
        spec(
            "backbone.embeddings.position_embeddings",
            &[1, b.num_patches() + 1, d],
            init_std,
        ),
    ];

    for i in 0..b.feature_stage() {
        let p = layer_prefix(i);
        for proj in ["query", "key", "value"] {
            specs.push(spec(format!("{p}.attention.attention.{proj}.weight"), &[d, d], init_std));
            if b.qkv_bias {
                specs.push(spec(format!("{p}.attention.attention.{proj}.bias"), &[d], Init::Zeros));
            }
        }
        specs.push(spec(format!("{p}.attention.output.dense.weight"), &[d, d], init_std));
        specs.push(spec(format!("{p}.attention.output.dense.bias"), &[d], Init::Zeros));
        for norm in ["layernorm_before", "layernorm_after"] {
            specs.push(spec(format!("{p}.{norm}.weight"), &[d], Init::Ones));
            specs.push(spec(format!("{p}.{norm}.bias"), &[d], Init::Zeros));
        }
        let hidden = b.intermediate_size();
        specs.push(spec(format!("{p}.mlp.fc1.weight"), &[hidden, d], init_std));
        specs.push(spec(format!("{p}.mlp.fc1.bias"), &[hidden], Init::Zeros));
        specs.push(spec(format!("{p}.mlp.fc2.weight"), &[d, hidden], init_std));
        specs.push(spec(format!("{p}.mlp.fc2.bias"), &[d], Init::Zeros));
    }

    specs.push(spec("backbone.layernorm.weight", &[d], Init::Ones));
    specs.push(spec("backbone.layernorm.bias", &[d], Init::Zeros));

    match config.decoder() {
        DecoderKind::Simple => {
            specs.push(spec("head.conv.weight", &[joints, d, 3, 3], Init::Normal(0.001)));
            specs.push(spec("head.conv.bias", &[joints], Init::Zeros));
        }
        DecoderKind::Classic => {
            let c = CLASSIC_DECODER_CHANNELS;
            let mut in_channels = d;
            for stage in 1..=2 {
                specs.push(spec(
                    format!("head.deconv{stage}.weight"),
                    &[in_channels, c, 4, 4],
                    Init::Normal(0.001),
                ));
                specs.push(spec(format!("head.batchnorm{stage}.weight"), &[c], Init::Ones));
                specs.push(spec(format!("head.batchnorm{stage}.bias"), &[c], Init::Zeros));
                specs.push(spec(format!("head.batchnorm{stage}.running_mean"), &[c], Init::Zeros));
                specs.push(spec(format!("head.batchnorm{stage}.running_var"), &[c], Init::Ones));
                in_channels = c;
            }
            specs.push(spec("head.conv.weight", &[joints, c, 1, 1], Init::Normal(0.001)));
            specs.push(spec("head.conv.bias", &[joints], Init::Zeros));
        }
    }
    specs
}

// ==============================================================================
// Weight Store
// ==============================================================================

#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    tensors: BTreeMap<String, DenseTensor>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: DenseTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(DenseTensor::numel).sum()
    }

    /// Look up a tensor and check it has `expected` shape
    pub fn get(&self, name: &str, expected: &[usize]) -> ExportResult<&DenseTensor> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| ExportError::MissingWeight(name.to_string()))?;
        if tensor.shape != expected {
            return Err(ExportError::WeightShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        Ok(tensor)
    }

    /// Check that every tensor `config` needs is present with the right shape
    pub fn check_layout(&self, config: &VitPoseConfig) -> ExportResult<()> {
        for spec in expected_weights(config) {
            self.get(&spec.name, &spec.shape)?;
        }
        Ok(())
    }

    /// Randomly initialised parameters for `config`
    pub fn random(config: &VitPoseConfig, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let mut store = Self::new();
        for spec in expected_weights(config) {
            let numel: usize = spec.shape.iter().product();
            let data: Vec<f32> = match spec.init {
                Init::Normal(std) => (0..numel)
                    .map(|_| rng.sample::<f32, _>(StandardNormal) * std)
                    .collect(),
                Init::Zeros => vec![0.0; numel],
                Init::Ones => vec![1.0; numel],
            };
            store.insert(
                spec.name,
                DenseTensor {
                    shape: spec.shape,
                    data,
                },
            );
        }
        store
    }

    /// Parse a safetensors buffer; half-precision tensors are widened to f32
    pub fn from_safetensors(bytes: &[u8]) -> ExportResult<Self> {
        let file = SafeTensors::deserialize(bytes)
            .map_err(|e| ExportError::Weights(e.to_string()))?;

        let mut store = Self::new();
        for (name, view) in file.tensors() {
            let data = match decode_floats(view.dtype(), view.data()) {
                Some(data) => data,
                None => {
                    tracing::debug!("Skipping non-float tensor {} ({:?})", name, view.dtype());
                    continue;
                }
            };
            store.insert(
                name,
                DenseTensor {
                    shape: view.shape().to_vec(),
                    data,
                },
            );
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> ExportResult<Self> {
        let bytes = std::fs::read(path)?;
        let store = Self::from_safetensors(&bytes)?;
        tracing::info!("Loaded {} tensors from {}", store.len(), path.display());
        Ok(store)
    }

    /// Write all tensors as F32 safetensors
    pub fn save(&self, path: &Path) -> ExportResult<()> {
        let bytes: Vec<(String, Vec<u8>, Vec<usize>)> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let raw = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.clone(), raw, t.shape.clone())
            })
            .collect();

        let mut views = Vec::with_capacity(bytes.len());
        for (name, raw, shape) in &bytes {
            let view = TensorView::new(Dtype::F32, shape.clone(), raw)
                .map_err(|e| ExportError::Weights(e.to_string()))?;
            views.push((name.as_str(), view));
        }
        safetensors::serialize_to_file(views, &None, path)
            .map_err(|e| ExportError::Weights(e.to_string()))
    }
}

fn decode_floats(dtype: Dtype, raw: &[u8]) -> Option<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => raw
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => raw
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => return None,
    };
    Some(values)
}
