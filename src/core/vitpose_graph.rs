// Lowers a ViTPose model to an ONNX graph
// Emits the same primitive operators a traced opset-14 export produces: LayerNorm and GELU
// are decomposed, linear layers are MatMul against transposed weights.

use crate::core::model_hub::PoseModel;
use crate::core::weights::{layer_prefix, WeightStore};
use crate::models::export::{ExportError, ExportOptions, ExportResult};
use crate::models::vitpose::{
    Activation, DecoderKind, VitPoseConfig, CLASSIC_DECODER_CHANNELS, PATCH_EMBED_PADDING,
};
use crate::onnx::builder::{attr_float, attr_int, attr_ints, attr_string};
use crate::onnx::{DataType, Dim, GraphBuilder, GraphProto, ParameterMode};

pub const GRAPH_NAME: &str = "main_graph";

const BATCH_NORM_EPS: f32 = 1e-5;

/// Graph plus the declared shapes of its single input and output
#[derive(Debug, Clone)]
pub struct LoweredGraph {
    pub graph: GraphProto,
    pub input_dims: Vec<Dim>,
    pub output_dims: Vec<Dim>,
}

/// Build the inference graph for `model` traced with an input of `input_shape` (NCHW)
pub fn lower(model: &PoseModel, input_shape: &[usize], options: &ExportOptions) -> ExportResult<LoweredGraph> {
    let [batch, channels, height, width] = match input_shape {
        [b, c, h, w] => [*b, *c, *h, *w],
        other => {
            return Err(ExportError::InputGeometry(format!(
                "expected a 4-D NCHW input, got shape {:?}",
                other
            )))
        }
    };
    let config = &model.config;
    if channels != config.backbone_config.num_channels {
        return Err(ExportError::InputGeometry(format!(
            "model expects {} channels, got {}",
            config.backbone_config.num_channels, channels
        )));
    }
    if batch == 0 {
        return Err(ExportError::InputGeometry("batch size must be at least 1".into()));
    }
    config.check_input_size(height, width)?;

    let batch_dim = match &options.dynamic_batch {
        Some(name) => Dim::Symbolic(name.clone()),
        None => Dim::Fixed(batch as i64),
    };
    let (heat_h, heat_w) = config.heatmap_size(height, width);
    let input_dims = vec![
        batch_dim.clone(),
        Dim::Fixed(channels as i64),
        Dim::Fixed(height as i64),
        Dim::Fixed(width as i64),
    ];
    let output_dims = vec![
        batch_dim,
        Dim::Fixed(config.num_joints() as i64),
        Dim::Fixed(heat_h as i64),
        Dim::Fixed(heat_w as i64),
    ];

    let mode = if options.embed_parameters {
        ParameterMode::Embedded
    } else {
        ParameterMode::GraphInputs
    };
    let mut lowering = Lowering {
        b: GraphBuilder::new(GRAPH_NAME, mode),
        weights: &model.weights,
        config,
    };

    let x = lowering
        .b
        .input(&options.input_name, DataType::Float, &input_dims);
    let heatmaps = lowering.forward(&x)?;
    lowering
        .b
        .output(&heatmaps, &options.output_name, DataType::Float, &output_dims);

    Ok(LoweredGraph {
        graph: lowering.b.finish(),
        input_dims,
        output_dims,
    })
}

struct Lowering<'a> {
    b: GraphBuilder,
    weights: &'a WeightStore,
    config: &'a VitPoseConfig,
}

impl Lowering<'_> {
    fn param(&mut self, name: &str, shape: &[usize]) -> ExportResult<String> {
        let tensor = self.weights.get(name, shape)?;
        let dims: Vec<i64> = tensor.dims_i64();
        Ok(self.b.parameter(name, &dims, &tensor.data))
    }

    fn forward(&mut self, pixels: &str) -> ExportResult<String> {
        let tokens = self.embeddings(pixels)?;
        let mut hidden = tokens;
        let stages = self.config.backbone_config.feature_stage();
        for index in 0..stages {
            hidden = self.layer(index, &hidden)?;
        }
        let d = self.config.backbone_config.hidden_size;
        let hidden = {
            let w = self.param("backbone.layernorm.weight", &[d])?;
            let bias = self.param("backbone.layernorm.bias", &[d])?;
            let eps = self.config.backbone_config.layer_norm_eps as f32;
            self.b
                .scoped("backbone/layernorm", |b| layer_norm(b, &hidden, &w, &bias, eps))
        };
        let features = self.to_feature_map(&hidden);
        match self.config.decoder() {
            DecoderKind::Simple => self.simple_decoder(&features),
            DecoderKind::Classic => self.classic_decoder(&features),
        }
    }

    /// Patch projection plus position embeddings, `(B, N, D)`
    fn embeddings(&mut self, pixels: &str) -> ExportResult<String> {
        let bc = &self.config.backbone_config;
        let (d, c, [ph, pw]) = (bc.hidden_size, bc.num_channels, bc.patch_size);
        let n = bc.num_patches();
        let pad = PATCH_EMBED_PADDING as i64;

        let w = self.param(
            "backbone.embeddings.patch_embeddings.projection.weight",
            &[d, c, ph, pw],
        )?;
        let bias = self.param("backbone.embeddings.patch_embeddings.projection.bias", &[d])?;
        let pos = self.param("backbone.embeddings.position_embeddings", &[1, n + 1, d])?;

        let projected = self.b.scoped("backbone/embeddings/patch_embeddings/projection", |b| {
            b.node(
                "Conv",
                &[pixels, &w, &bias],
                vec![
                    attr_ints("dilations", &[1, 1]),
                    attr_int("group", 1),
                    attr_ints("kernel_shape", &[ph as i64, pw as i64]),
                    attr_ints("pads", &[pad, pad, pad, pad]),
                    attr_ints("strides", &[ph as i64, pw as i64]),
                ],
            )
        });

        let tokens = self.b.scoped("backbone/embeddings/patch_embeddings", |b| {
            let shape = b.ints("shape", &[0, d as i64, -1]);
            let flat = b.node("Reshape", &[&projected, &shape], vec![]);
            b.node("Transpose", &[&flat], vec![attr_ints("perm", &[0, 2, 1])])
        });

        Ok(self.b.scoped("backbone/embeddings", |b| {
            let axes = b.ints("axes", &[1]);
            let one = b.ints("starts", &[1]);
            let end = b.ints("ends", &[i64::MAX]);
            let zero = b.ints("starts", &[0]);
            let one_end = b.ints("ends", &[1]);
            let patches = b.node("Slice", &[&pos, &one, &end, &axes], vec![]);
            let cls = b.node("Slice", &[&pos, &zero, &one_end, &axes], vec![]);
            let table = b.node("Add", &[&patches, &cls], vec![]);
            b.node("Add", &[&tokens, &table], vec![])
        }))
    }

    /// One pre-norm transformer block
    fn layer(&mut self, index: usize, hidden: &str) -> ExportResult<String> {
        let bc = self.config.backbone_config.clone();
        let d = bc.hidden_size;
        let eps = bc.layer_norm_eps as f32;
        let p = layer_prefix(index);
        let scope = format!("backbone/encoder/layer.{}", index);

        let ln1_w = self.param(&format!("{p}.layernorm_before.weight"), &[d])?;
        let ln1_b = self.param(&format!("{p}.layernorm_before.bias"), &[d])?;
        let mut qkv = Vec::with_capacity(3);
        for proj in ["query", "key", "value"] {
            let w = self.param(&format!("{p}.attention.attention.{proj}.weight"), &[d, d])?;
            let bias = if bc.qkv_bias {
                Some(self.param(&format!("{p}.attention.attention.{proj}.bias"), &[d])?)
            } else {
                None
            };
            qkv.push((proj, w, bias));
        }
        let out_w = self.param(&format!("{p}.attention.output.dense.weight"), &[d, d])?;
        let out_b = self.param(&format!("{p}.attention.output.dense.bias"), &[d])?;
        let ln2_w = self.param(&format!("{p}.layernorm_after.weight"), &[d])?;
        let ln2_b = self.param(&format!("{p}.layernorm_after.bias"), &[d])?;
        let hidden_size = bc.intermediate_size();
        let fc1_w = self.param(&format!("{p}.mlp.fc1.weight"), &[hidden_size, d])?;
        let fc1_b = self.param(&format!("{p}.mlp.fc1.bias"), &[hidden_size])?;
        let fc2_w = self.param(&format!("{p}.mlp.fc2.weight"), &[d, hidden_size])?;
        let fc2_b = self.param(&format!("{p}.mlp.fc2.bias"), &[d])?;
        let activation = bc.activation()?;
        let heads = bc.num_attention_heads as i64;
        let head_dim = bc.head_dim();

        Ok(self.b.scoped(&scope, |b| {
            let normed = b.scoped("layernorm_before", |b| layer_norm(b, hidden, &ln1_w, &ln1_b, eps));

            let attended = b.scoped("attention/attention", |b| {
                let mut projected = Vec::with_capacity(3);
                for (proj, w, bias) in &qkv {
                    projected.push(b.scoped(proj, |b| linear(b, &normed, w, bias.as_deref())));
                }
                let split = b.ints("shape", &[0, 0, heads, head_dim as i64]);
                let q = b.node("Reshape", &[&projected[0], &split], vec![]);
                let q = b.node("Transpose", &[&q], vec![attr_ints("perm", &[0, 2, 1, 3])]);
                let k = b.node("Reshape", &[&projected[1], &split], vec![]);
                let k = b.node("Transpose", &[&k], vec![attr_ints("perm", &[0, 2, 3, 1])]);
                let v = b.node("Reshape", &[&projected[2], &split], vec![]);
                let v = b.node("Transpose", &[&v], vec![attr_ints("perm", &[0, 2, 1, 3])]);

                let scores = b.node("MatMul", &[&q, &k], vec![]);
                let dim = b.scalar("head_dim", head_dim as f32);
                let scale = b.node("Sqrt", &[&dim], vec![]);
                let scores = b.node("Div", &[&scores, &scale], vec![]);
                let probs = b.node("Softmax", &[&scores], vec![attr_int("axis", -1)]);
                let context = b.node("MatMul", &[&probs, &v], vec![]);
                let context = b.node("Transpose", &[&context], vec![attr_ints("perm", &[0, 2, 1, 3])]);
                let merge = b.ints("shape", &[0, 0, d as i64]);
                b.node("Reshape", &[&context, &merge], vec![])
            });
            let attended = b.scoped("attention/output/dense", |b| {
                linear(b, &attended, &out_w, Some(&out_b))
            });
            let hidden = b.node("Add", &[&attended, hidden], vec![]);

            let normed = b.scoped("layernorm_after", |b| layer_norm(b, &hidden, &ln2_w, &ln2_b, eps));
            let mlp = b.scoped("mlp", |b| {
                let h = b.scoped("fc1", |b| linear(b, &normed, &fc1_w, Some(&fc1_b)));
                let h = b.scoped("act", |b| activate(b, &h, activation));
                b.scoped("fc2", |b| linear(b, &h, &fc2_w, Some(&fc2_b)))
            });
            b.node("Add", &[&mlp, &hidden], vec![])
        }))
    }

    /// `(B, N, D)` tokens back to a `(B, D, Hp, Wp)` feature map
    fn to_feature_map(&mut self, hidden: &str) -> String {
        let bc = &self.config.backbone_config;
        let (hp, wp) = bc.patch_grid();
        let d = bc.hidden_size as i64;
        self.b.scoped("feature_map", |b| {
            let t = b.node("Transpose", &[hidden], vec![attr_ints("perm", &[0, 2, 1])]);
            let shape = b.ints("shape", &[0, d, hp as i64, wp as i64]);
            b.node("Reshape", &[&t, &shape], vec![])
        })
    }

    fn simple_decoder(&mut self, features: &str) -> ExportResult<String> {
        let d = self.config.backbone_config.hidden_size;
        let joints = self.config.num_joints();
        let scale = self.config.scale_factor as f32;
        let w = self.param("head.conv.weight", &[joints, d, 3, 3])?;
        let bias = self.param("head.conv.bias", &[joints])?;

        Ok(self.b.scoped("head", |b| {
            let x = b.node("Relu", &[features], vec![]);
            let scales = b.floats("scales", &[1.0, 1.0, scale, scale]);
            let x = b.scoped("upsampling", |b| {
                b.node(
                    "Resize",
                    &[&x, "", &scales],
                    vec![
                        attr_string("coordinate_transformation_mode", "pytorch_half_pixel"),
                        attr_float("cubic_coeff_a", -0.75),
                        attr_string("mode", "linear"),
                        attr_string("nearest_mode", "floor"),
                    ],
                )
            });
            b.scoped("conv", |b| {
                b.node(
                    "Conv",
                    &[&x, &w, &bias],
                    vec![
                        attr_ints("dilations", &[1, 1]),
                        attr_int("group", 1),
                        attr_ints("kernel_shape", &[3, 3]),
                        attr_ints("pads", &[1, 1, 1, 1]),
                        attr_ints("strides", &[1, 1]),
                    ],
                )
            })
        }))
    }

    fn classic_decoder(&mut self, features: &str) -> ExportResult<String> {
        let d = self.config.backbone_config.hidden_size;
        let joints = self.config.num_joints();
        let c = CLASSIC_DECODER_CHANNELS;

        let mut x = features.to_string();
        let mut in_channels = d;
        for stage in 1..=2 {
            let w = self.param(&format!("head.deconv{stage}.weight"), &[in_channels, c, 4, 4])?;
            let gamma = self.param(&format!("head.batchnorm{stage}.weight"), &[c])?;
            let beta = self.param(&format!("head.batchnorm{stage}.bias"), &[c])?;
            let mean = self.param(&format!("head.batchnorm{stage}.running_mean"), &[c])?;
            let var = self.param(&format!("head.batchnorm{stage}.running_var"), &[c])?;
            x = self.b.scoped("head", |b| {
                let y = b.scoped(&format!("deconv{stage}"), |b| {
                    b.node(
                        "ConvTranspose",
                        &[&x, &w],
                        vec![
                            attr_ints("dilations", &[1, 1]),
                            attr_int("group", 1),
                            attr_ints("kernel_shape", &[4, 4]),
                            attr_ints("pads", &[1, 1, 1, 1]),
                            attr_ints("strides", &[2, 2]),
                        ],
                    )
                });
                let y = b.scoped(&format!("batchnorm{stage}"), |b| {
                    b.node(
                        "BatchNormalization",
                        &[&y, &gamma, &beta, &mean, &var],
                        vec![
                            attr_float("epsilon", BATCH_NORM_EPS),
                            attr_float("momentum", 0.9),
                        ],
                    )
                });
                b.scoped(&format!("relu{stage}"), |b| b.node("Relu", &[&y], vec![]))
            });
            in_channels = c;
        }

        let w = self.param("head.conv.weight", &[joints, c, 1, 1])?;
        let bias = self.param("head.conv.bias", &[joints])?;
        Ok(self.b.scoped("head/conv", |b| {
            b.node(
                "Conv",
                &[&x, &w, &bias],
                vec![
                    attr_ints("dilations", &[1, 1]),
                    attr_int("group", 1),
                    attr_ints("kernel_shape", &[1, 1]),
                    attr_ints("pads", &[0, 0, 0, 0]),
                    attr_ints("strides", &[1, 1]),
                ],
            )
        }))
    }
}

/// `x @ W^T + b`
fn linear(b: &mut GraphBuilder, x: &str, weight: &str, bias: Option<&str>) -> String {
    let wt = b.node("Transpose", &[weight], vec![attr_ints("perm", &[1, 0])]);
    let y = b.node("MatMul", &[x, &wt], vec![]);
    match bias {
        Some(bias) => b.node("Add", &[&y, bias], vec![]),
        None => y,
    }
}

/// LayerNorm over the last axis from ReduceMean/Sub/Pow/Sqrt/Div
fn layer_norm(b: &mut GraphBuilder, x: &str, weight: &str, bias: &str, eps: f32) -> String {
    let mean = b.node(
        "ReduceMean",
        &[x],
        vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)],
    );
    let centered = b.node("Sub", &[x, &mean], vec![]);
    let two = b.scalar("pow", 2.0);
    let squared = b.node("Pow", &[&centered, &two], vec![]);
    let var = b.node(
        "ReduceMean",
        &[&squared],
        vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)],
    );
    let eps = b.scalar("eps", eps);
    let var = b.node("Add", &[&var, &eps], vec![]);
    let std = b.node("Sqrt", &[&var], vec![]);
    let normed = b.node("Div", &[&centered, &std], vec![]);
    let scaled = b.node("Mul", &[&normed, weight], vec![]);
    b.node("Add", &[&scaled, bias], vec![])
}

fn activate(b: &mut GraphBuilder, x: &str, activation: Activation) -> String {
    match activation {
        Activation::Gelu => {
            let root_two = b.scalar("sqrt2", std::f32::consts::SQRT_2);
            let scaled = b.node("Div", &[x, &root_two], vec![]);
            let erf = b.node("Erf", &[&scaled], vec![]);
            let one = b.scalar("one", 1.0);
            let shifted = b.node("Add", &[&erf, &one], vec![]);
            let gated = b.node("Mul", &[x, &shifted], vec![]);
            let half = b.scalar("half", 0.5);
            b.node("Mul", &[&gated, &half], vec![])
        }
        Activation::GeluTanh => {
            let three = b.scalar("pow", 3.0);
            let cubed = b.node("Pow", &[x, &three], vec![]);
            let coeff = b.scalar("coeff", 0.044715);
            let cubed = b.node("Mul", &[&cubed, &coeff], vec![]);
            let inner = b.node("Add", &[x, &cubed], vec![]);
            let root = b.scalar("sqrt_2_over_pi", (2.0 / std::f32::consts::PI).sqrt());
            let inner = b.node("Mul", &[&inner, &root], vec![]);
            let t = b.node("Tanh", &[&inner], vec![]);
            let one = b.scalar("one", 1.0);
            let shifted = b.node("Add", &[&t, &one], vec![]);
            let gated = b.node("Mul", &[x, &shifted], vec![]);
            let half = b.scalar("half", 0.5);
            b.node("Mul", &[&gated, &half], vec![])
        }
        Activation::Relu => b.node("Relu", &[x], vec![]),
    }
}
