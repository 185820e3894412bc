// Small model geometries and a naive forward pass shared by unit tests

use std::f32::consts::{PI, SQRT_2};

use crate::core::model_hub::PoseModel;
use crate::core::weights::{expected_weights, layer_prefix, WeightStore};
use crate::models::tensor::DenseTensor;
use crate::models::vitpose::{
    Activation, BackboneConfig, DecoderKind, VitPoseConfig, CLASSIC_DECODER_CHANNELS, PATCH_EMBED_PADDING,
};

const BATCH_NORM_EPS: f32 = 1e-5;

/// 32x16 input, 8x8 patches, two layers of width 8
pub(crate) fn tiny_config(simple: bool) -> VitPoseConfig {
    VitPoseConfig {
        backbone_config: BackboneConfig {
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            mlp_ratio: 2,
            image_size: [32, 16],
            patch_size: [8, 8],
            ..BackboneConfig::default()
        },
        use_simple_decoder: simple,
        ..VitPoseConfig::default()
    }
}

/// Every parameter drawn from N(0, 0.25), with BatchNorm variances kept positive.
/// No bias is zero and no norm is the identity, so a misplaced op changes the output.
pub(crate) fn scaled_weights(config: &VitPoseConfig, seed: u64) -> WeightStore {
    let mut store = WeightStore::new();
    for (i, spec) in expected_weights(config).into_iter().enumerate() {
        let mut tensor = DenseTensor::randn(&spec.shape, Some(seed.wrapping_add(i as u64)));
        let variance = spec.name.ends_with("running_var");
        for v in &mut tensor.data {
            *v = if variance { v.abs() * 0.5 + 0.5 } else { *v * 0.5 };
        }
        store.insert(spec.name, tensor);
    }
    store
}

// ==============================================================================
// Reference Forward Pass
// ==============================================================================

/// One image's `(C, H, W)` activations
#[derive(Debug, Clone, PartialEq)]
struct FeatureMap {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl FeatureMap {
    fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    fn index(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.height + y) * self.width + x
    }

    fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[self.index(c, y, x)]
    }
}

fn param<'a>(weights: &'a WeightStore, name: &str, shape: &[usize]) -> &'a [f32] {
    &weights.get(name, shape).unwrap().data
}

/// Evaluate `model` on an NCHW batch one image at a time
pub(crate) fn reference_forward(model: &PoseModel, input: &DenseTensor) -> DenseTensor {
    assert_eq!(input.rank(), 4, "expected an NCHW batch");
    let (batch, channels, height, width) = (input.shape[0], input.shape[1], input.shape[2], input.shape[3]);

    let mut shape = vec![batch];
    let mut data = Vec::new();
    for pixels in input.data.chunks(channels * height * width) {
        let image = FeatureMap {
            channels,
            height,
            width,
            data: pixels.to_vec(),
        };
        let heatmaps = forward_image(model, &image);
        if shape.len() == 1 {
            shape.extend([heatmaps.channels, heatmaps.height, heatmaps.width]);
        }
        data.extend(heatmaps.data);
    }
    DenseTensor { shape, data }
}

fn forward_image(model: &PoseModel, image: &FeatureMap) -> FeatureMap {
    let config = &model.config;
    let bc = &config.backbone_config;
    let w = &model.weights;
    let d = bc.hidden_size;
    let [ph, pw] = bc.patch_size;
    let eps = bc.layer_norm_eps as f32;

    let projected = conv2d(
        image,
        param(w, "backbone.embeddings.patch_embeddings.projection.weight", &[d, image.channels, ph, pw]),
        Some(param(w, "backbone.embeddings.patch_embeddings.projection.bias", &[d])),
        d,
        (ph, pw),
        (ph, pw),
        PATCH_EMBED_PADDING,
    );
    let (hp, wp) = (projected.height, projected.width);
    let n = hp * wp;
    let pos = param(w, "backbone.embeddings.position_embeddings", &[1, n + 1, d]);

    // Token t is grid cell (t / wp, t % wp); the class slot is folded into every patch
    let mut hidden: Vec<Vec<f32>> = (0..n)
        .map(|t| {
            (0..d)
                .map(|c| projected.at(c, t / wp, t % wp) + pos[(t + 1) * d + c] + pos[c])
                .collect()
        })
        .collect();

    let activation = bc.activation().unwrap();
    for index in 0..bc.feature_stage() {
        hidden = encoder_layer(w, bc, index, &hidden, activation);
    }
    let hidden = layer_norm(
        &hidden,
        param(w, "backbone.layernorm.weight", &[d]),
        param(w, "backbone.layernorm.bias", &[d]),
        eps,
    );

    let mut features = FeatureMap::zeros(d, hp, wp);
    for (t, token) in hidden.iter().enumerate() {
        for (c, v) in token.iter().enumerate() {
            let i = features.index(c, t / wp, t % wp);
            features.data[i] = *v;
        }
    }

    let joints = config.num_joints();
    match config.decoder() {
        DecoderKind::Simple => {
            relu(&mut features.data);
            let upsampled = upsample_bilinear(&features, config.scale_factor);
            conv2d(
                &upsampled,
                param(w, "head.conv.weight", &[joints, d, 3, 3]),
                Some(param(w, "head.conv.bias", &[joints])),
                joints,
                (3, 3),
                (1, 1),
                1,
            )
        }
        DecoderKind::Classic => {
            let c = CLASSIC_DECODER_CHANNELS;
            let mut x = features;
            for stage in 1..=2 {
                let weight = param(w, &format!("head.deconv{stage}.weight"), &[x.channels, c, 4, 4]);
                x = conv_transpose2d(&x, weight, c);
                let bn = |field: &str| param(w, &format!("head.batchnorm{stage}.{field}"), &[c]);
                batch_norm(&mut x, bn("weight"), bn("bias"), bn("running_mean"), bn("running_var"));
                relu(&mut x.data);
            }
            conv2d(
                &x,
                param(w, "head.conv.weight", &[joints, c, 1, 1]),
                Some(param(w, "head.conv.bias", &[joints])),
                joints,
                (1, 1),
                (1, 1),
                0,
            )
        }
    }
}

fn encoder_layer(
    w: &WeightStore,
    bc: &BackboneConfig,
    index: usize,
    hidden: &[Vec<f32>],
    activation: Activation,
) -> Vec<Vec<f32>> {
    let d = bc.hidden_size;
    let m = bc.intermediate_size();
    let p = layer_prefix(index);
    let eps = bc.layer_norm_eps as f32;
    let get = |name: &str, shape: &[usize]| param(w, &format!("{p}.{name}"), shape);

    let normed = layer_norm(hidden, get("layernorm_before.weight", &[d]), get("layernorm_before.bias", &[d]), eps);
    let project = |proj: &str| {
        let bias = bc
            .qkv_bias
            .then(|| get(&format!("attention.attention.{proj}.bias"), &[d]));
        linear(&normed, get(&format!("attention.attention.{proj}.weight"), &[d, d]), bias)
    };
    let (q, k, v) = (project("query"), project("key"), project("value"));
    let context = attention(&q, &k, &v, bc.num_attention_heads);
    let attended = linear(
        &context,
        get("attention.output.dense.weight", &[d, d]),
        Some(get("attention.output.dense.bias", &[d])),
    );
    let hidden = add(hidden, &attended);

    let normed = layer_norm(&hidden, get("layernorm_after.weight", &[d]), get("layernorm_after.bias", &[d]), eps);
    let mut inner = linear(&normed, get("mlp.fc1.weight", &[m, d]), Some(get("mlp.fc1.bias", &[m])));
    for row in &mut inner {
        for x in row.iter_mut() {
            *x = activate(*x, activation);
        }
    }
    let mlp = linear(&inner, get("mlp.fc2.weight", &[d, m]), Some(get("mlp.fc2.bias", &[d])));
    add(&hidden, &mlp)
}

fn add(a: &[Vec<f32>], b: &[Vec<f32>]) -> Vec<Vec<f32>> {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.iter().zip(y).map(|(x, y)| x + y).collect())
        .collect()
}

/// `x @ W^T + b` with `W` stored `(out, in)`
fn linear(x: &[Vec<f32>], weight: &[f32], bias: Option<&[f32]>) -> Vec<Vec<f32>> {
    x.iter()
        .map(|row| {
            let inputs = row.len();
            weight
                .chunks(inputs)
                .enumerate()
                .map(|(o, w)| {
                    let dot: f32 = w.iter().zip(row).map(|(w, x)| w * x).sum();
                    dot + bias.map_or(0.0, |b| b[o])
                })
                .collect()
        })
        .collect()
}

fn layer_norm(x: &[Vec<f32>], weight: &[f32], bias: &[f32], eps: f32) -> Vec<Vec<f32>> {
    x.iter()
        .map(|row| {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let std = (var + eps).sqrt();
            row.iter()
                .enumerate()
                .map(|(i, v)| (v - mean) / std * weight[i] + bias[i])
                .collect()
        })
        .collect()
}

/// Multi-head attention; head `h` owns channels `h * hd..(h + 1) * hd`
fn attention(q: &[Vec<f32>], k: &[Vec<f32>], v: &[Vec<f32>], heads: usize) -> Vec<Vec<f32>> {
    let d = q.first().map_or(0, Vec::len);
    let hd = d / heads;
    let scale = (hd as f32).sqrt();
    let mut out = vec![vec![0.0; d]; q.len()];

    for h in 0..heads {
        let span = h * hd..(h + 1) * hd;
        for (i, qi) in q.iter().enumerate() {
            let scores: Vec<f32> = k
                .iter()
                .map(|kj| qi[span.clone()].iter().zip(&kj[span.clone()]).map(|(a, b)| a * b).sum::<f32>() / scale)
                .collect();
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
            let total: f32 = exp.iter().sum();
            for (j, e) in exp.iter().enumerate() {
                for c in span.clone() {
                    out[i][c] += e / total * v[j][c];
                }
            }
        }
    }
    out
}

fn activate(x: f32, activation: Activation) -> f32 {
    match activation {
        Activation::Gelu => 0.5 * x * (1.0 + libm::erff(x / SQRT_2)),
        Activation::GeluTanh => {
            let inner = (2.0 / PI).sqrt() * (x + 0.044715 * x.powi(3));
            0.5 * x * (1.0 + inner.tanh())
        }
        Activation::Relu => x.max(0.0),
    }
}

fn relu(data: &mut [f32]) {
    for v in data {
        *v = v.max(0.0);
    }
}

fn conv2d(
    x: &FeatureMap,
    weight: &[f32],
    bias: Option<&[f32]>,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    pad: usize,
) -> FeatureMap {
    let (kh, kw) = kernel;
    let oh = (x.height + 2 * pad - kh) / stride.0 + 1;
    let ow = (x.width + 2 * pad - kw) / stride.1 + 1;
    let mut out = FeatureMap::zeros(out_channels, oh, ow);

    for o in 0..out_channels {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut acc = bias.map_or(0.0, |b| b[o]);
                for c in 0..x.channels {
                    for ky in 0..kh {
                        let iy = (oy * stride.0 + ky) as isize - pad as isize;
                        if iy < 0 || iy >= x.height as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * stride.1 + kx) as isize - pad as isize;
                            if ix < 0 || ix >= x.width as isize {
                                continue;
                            }
                            let wi = ((o * x.channels + c) * kh + ky) * kw + kx;
                            acc += weight[wi] * x.at(c, iy as usize, ix as usize);
                        }
                    }
                }
                let i = out.index(o, oy, ox);
                out.data[i] = acc;
            }
        }
    }
    out
}

/// Kernel 4, stride 2, padding 1, no bias; doubles the resolution.
/// `weight` is stored `(in, out, 4, 4)`.
fn conv_transpose2d(x: &FeatureMap, weight: &[f32], out_channels: usize) -> FeatureMap {
    const K: usize = 4;
    let mut out = FeatureMap::zeros(out_channels, x.height * 2, x.width * 2);

    for c in 0..x.channels {
        for iy in 0..x.height {
            for ix in 0..x.width {
                let value = x.at(c, iy, ix);
                for o in 0..out_channels {
                    for ky in 0..K {
                        let oy = (iy * 2 + ky) as isize - 1;
                        if oy < 0 || oy >= out.height as isize {
                            continue;
                        }
                        for kx in 0..K {
                            let ox = (ix * 2 + kx) as isize - 1;
                            if ox < 0 || ox >= out.width as isize {
                                continue;
                            }
                            let wi = ((c * out_channels + o) * K + ky) * K + kx;
                            let i = out.index(o, oy as usize, ox as usize);
                            out.data[i] += value * weight[wi];
                        }
                    }
                }
            }
        }
    }
    out
}

fn batch_norm(x: &mut FeatureMap, gamma: &[f32], beta: &[f32], mean: &[f32], var: &[f32]) {
    let plane = x.height * x.width;
    for (c, channel) in x.data.chunks_mut(plane).enumerate() {
        let scale = gamma[c] / (var[c] + BATCH_NORM_EPS).sqrt();
        for v in channel {
            *v = (*v - mean[c]) * scale + beta[c];
        }
    }
}

/// Bilinear upsampling with `pytorch_half_pixel` coordinates, clamped at the edges
fn upsample_bilinear(x: &FeatureMap, scale: usize) -> FeatureMap {
    let source = |dst: usize, len: usize| -> (usize, usize, f32) {
        let src = ((dst as f32 + 0.5) / scale as f32 - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(len - 1);
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, src - i0 as f32)
    };

    let mut out = FeatureMap::zeros(x.channels, x.height * scale, x.width * scale);
    for c in 0..x.channels {
        for oy in 0..out.height {
            let (y0, y1, fy) = source(oy, x.height);
            for ox in 0..out.width {
                let (x0, x1, fx) = source(ox, x.width);
                let top = x.at(c, y0, x0) * (1.0 - fx) + x.at(c, y0, x1) * fx;
                let bottom = x.at(c, y1, x0) * (1.0 - fx) + x.at(c, y1, x1) * fx;
                let i = out.index(c, oy, ox);
                out.data[i] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tensor::build_synthetic_input;

    #[test]
    fn test_upsample_interpolates_between_centres() {
        let x = FeatureMap {
            channels: 1,
            height: 1,
            width: 2,
            data: vec![0.0, 4.0],
        };
        let up = upsample_bilinear(&x, 2);
        assert_eq!((up.height, up.width), (2, 4));
        assert_eq!(up.data, vec![0.0, 1.0, 3.0, 4.0, 0.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn test_conv_transpose_doubles_resolution() {
        let x = FeatureMap {
            channels: 1,
            height: 2,
            width: 2,
            data: vec![1.0; 4],
        };
        let out = conv_transpose2d(&x, &[1.0; 16], 1);
        assert_eq!((out.height, out.width), (4, 4));
        assert_eq!(out.at(0, 0, 0), 1.0);
        assert_eq!(out.at(0, 1, 1), 4.0);
        assert_eq!(out.data.iter().sum::<f32>(), 36.0);
    }

    #[test]
    fn test_reference_forward_is_per_image() {
        let config = tiny_config(true);
        let weights = scaled_weights(&config, 3);
        let model = PoseModel::new("tiny", config, weights).unwrap();
        let batch = build_synthetic_input(2, 3, 32, 16, Some(4));

        let both = reference_forward(&model, &batch);
        assert_eq!(both.shape, vec![2, 17, 16, 8]);
        assert!(both.data.iter().all(|v| v.is_finite()));

        let second = DenseTensor::from_vec(&[1, 3, 32, 16], batch.data[3 * 32 * 16..].to_vec()).unwrap();
        let alone = reference_forward(&model, &second);
        assert_eq!(alone.data[..], both.data[17 * 16 * 8..]);
    }

    #[test]
    fn test_scaled_weights_cover_the_layout() {
        let config = tiny_config(false);
        let weights = scaled_weights(&config, 1);
        weights.check_layout(&config).unwrap();
        let var = weights.get("head.batchnorm1.running_var", &[256]).unwrap();
        assert!(var.data.iter().all(|v| *v >= 0.5));
        let bias = weights.get("head.conv.bias", &[17]).unwrap();
        assert!(bias.data.iter().any(|v| *v != 0.0));
    }
}
