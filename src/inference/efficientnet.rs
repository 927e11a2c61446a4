//! EfficientNetV2-RW-S for the secondary classifier variant.
//!
//! The checkpoint stores the six stages as `blocks.S.I`. The first three stages are edge-residual
//! blocks and the last three inverted-residual blocks with squeeze-excite, so each stage gets its
//! own field (`stage0` .. `stage5`) and the loader renames `blocks.S.` to `stageS.`.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};
use tracing::info;

use super::checkpoint;
use super::shape::{self, join, ShapeCheck};
use super::Network;

/// Checkpoint keys of the classification head; the backbone record has no slot for them.
pub const HEAD_KEYS: [&str; 2] = ["classifier.weight", "classifier.bias"];

const KEY_REMAP: [(&str, &str); 1] = [(r"^blocks\.([0-5])\.", "stage$1.")];

/// First-block stride of each stage.
const STAGE_STRIDES: [usize; 6] = [1, 2, 2, 2, 1, 2];
/// Expansion ratio of each stage; stages 0-2 are edge residual, 3-5 inverted residual.
const STAGE_EXPANSIONS: [usize; 6] = [1, 4, 4, 4, 6, 6];
const SE_RATIO: f64 = 0.25;

#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    #[config(default = "224")]
    pub image_size: usize,
    #[config(default = "24")]
    pub stem_channels: usize,
    /// Output channels of stages 0-5.
    #[config(default = "vec![24, 48, 64, 128, 160, 272]")]
    pub stage_channels: Vec<usize>,
    /// Blocks per stage.
    #[config(default = "vec![2, 4, 4, 6, 9, 15]")]
    pub stage_repeats: Vec<usize>,
    #[config(default = "1792")]
    pub num_features: usize,
    #[config(default = "22")]
    pub num_classes: usize,
}

impl EfficientNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetV2<B> {
        let mut in_chs = self.stem_channels;
        // (in, out, stride) per block; only the first block of a stage strides.
        let stage = |s: usize, in_chs: &mut usize| -> Vec<(usize, usize, usize)> {
            let out_chs = self.stage_channels[s];
            let mut dims = Vec::with_capacity(self.stage_repeats[s]);
            for i in 0..self.stage_repeats[s] {
                let stride = if i == 0 { STAGE_STRIDES[s] } else { 1 };
                dims.push((*in_chs, out_chs, stride));
                *in_chs = out_chs;
            }
            dims
        };
        let edge = |s: usize, dims: Vec<(usize, usize, usize)>| -> Vec<EdgeResidual<B>> {
            dims.into_iter()
                .map(|(i, o, st)| EdgeResidual::new(i, o, st, STAGE_EXPANSIONS[s], device))
                .collect()
        };
        let ir = |s: usize, dims: Vec<(usize, usize, usize)>| -> Vec<InvertedResidual<B>> {
            dims.into_iter()
                .map(|(i, o, st)| InvertedResidual::new(i, o, st, STAGE_EXPANSIONS[s], device))
                .collect()
        };

        let stage0 = edge(0, stage(0, &mut in_chs));
        let stage1 = edge(1, stage(1, &mut in_chs));
        let stage2 = edge(2, stage(2, &mut in_chs));
        let stage3 = ir(3, stage(3, &mut in_chs));
        let stage4 = ir(4, stage(4, &mut in_chs));
        let stage5 = ir(5, stage(5, &mut in_chs));

        let backbone = EfficientNetBackbone {
            conv_stem: conv(3, self.stem_channels, 3, 2, 1, device),
            bn1: bn(self.stem_channels, device),
            stage0,
            stage1,
            stage2,
            stage3,
            stage4,
            stage5,
            conv_head: conv(in_chs, self.num_features, 1, 1, 1, device),
            bn2: bn(self.num_features, device),
        };
        EfficientNetV2 {
            backbone,
            classifier: LinearConfig::new(self.num_features, self.num_classes).init(device),
        }
    }
}

fn conv<B: Backend>(
    in_chs: usize,
    out_chs: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let pad = kernel / 2;
    Conv2dConfig::new([in_chs, out_chs], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_groups(groups)
        .with_bias(false)
        .init(device)
}

fn bn<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels).init(device)
}

fn global_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.mean_dim(2).mean_dim(3)
}

/// Fused block: a full 3x3 expansion conv followed by a 1x1 projection.
#[derive(Module, Debug)]
pub struct EdgeResidual<B: Backend> {
    pub conv_exp: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv_pwl: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    has_skip: bool,
}

impl<B: Backend> EdgeResidual<B> {
    fn new(in_chs: usize, out_chs: usize, stride: usize, exp: usize, device: &B::Device) -> Self {
        let mid = in_chs * exp;
        Self {
            conv_exp: conv(in_chs, mid, 3, stride, 1, device),
            bn1: bn(mid, device),
            conv_pwl: conv(mid, out_chs, 1, 1, 1, device),
            bn2: bn(out_chs, device),
            has_skip: stride == 1 && in_chs == out_chs,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = x.clone();
        let x = silu(self.bn1.forward(self.conv_exp.forward(x)));
        let x = self.bn2.forward(self.conv_pwl.forward(x));
        if self.has_skip {
            x + shortcut
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pub conv_reduce: Conv2d<B>,
    pub conv_expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, reduced: usize, device: &B::Device) -> Self {
        Self {
            conv_reduce: Conv2dConfig::new([channels, reduced], [1, 1]).init(device),
            conv_expand: Conv2dConfig::new([reduced, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let s = silu(self.conv_reduce.forward(global_pool(x.clone())));
        let gate = sigmoid(self.conv_expand.forward(s));
        x * gate
    }
}

/// MBConv: 1x1 expansion, depthwise 3x3, squeeze-excite, 1x1 projection.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub conv_pw: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv_dw: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub se: SqueezeExcite<B>,
    pub conv_pwl: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    has_skip: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_chs: usize, out_chs: usize, stride: usize, exp: usize, device: &B::Device) -> Self {
        let mid = in_chs * exp;
        let reduced = ((in_chs as f64) * SE_RATIO).round() as usize;
        Self {
            conv_pw: conv(in_chs, mid, 1, 1, 1, device),
            bn1: bn(mid, device),
            conv_dw: conv(mid, mid, 3, stride, mid, device),
            bn2: bn(mid, device),
            se: SqueezeExcite::new(mid, reduced, device),
            conv_pwl: conv(mid, out_chs, 1, 1, 1, device),
            bn3: bn(out_chs, device),
            has_skip: stride == 1 && in_chs == out_chs,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = x.clone();
        let x = silu(self.bn1.forward(self.conv_pw.forward(x)));
        let x = silu(self.bn2.forward(self.conv_dw.forward(x)));
        let x = self.se.forward(x);
        let x = self.bn3.forward(self.conv_pwl.forward(x));
        if self.has_skip {
            x + shortcut
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct EfficientNetBackbone<B: Backend> {
    pub conv_stem: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub stage0: Vec<EdgeResidual<B>>,
    pub stage1: Vec<EdgeResidual<B>>,
    pub stage2: Vec<EdgeResidual<B>>,
    pub stage3: Vec<InvertedResidual<B>>,
    pub stage4: Vec<InvertedResidual<B>>,
    pub stage5: Vec<InvertedResidual<B>>,
    pub conv_head: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
}

impl<B: Backend> EfficientNetBackbone<B> {
    /// Globally pooled features, `[batch, num_features]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.bn1.forward(self.conv_stem.forward(images)));
        for block in self.stage0.iter().chain(&self.stage1).chain(&self.stage2) {
            x = block.forward(x);
        }
        for block in self.stage3.iter().chain(&self.stage4).chain(&self.stage5) {
            x = block.forward(x);
        }
        let x = silu(self.bn2.forward(self.conv_head.forward(x)));
        let [b, c, _, _] = x.dims();
        global_pool(x).reshape([b, c])
    }
}

impl<B: Backend> ShapeCheck for EdgeResidual<B> {
    fn check_shapes(&self, expected: &Self, path: &str, out: &mut Vec<String>) {
        self.conv_exp.check_shapes(&expected.conv_exp, &join(path, "conv_exp"), out);
        self.bn1.check_shapes(&expected.bn1, &join(path, "bn1"), out);
        self.conv_pwl.check_shapes(&expected.conv_pwl, &join(path, "conv_pwl"), out);
        self.bn2.check_shapes(&expected.bn2, &join(path, "bn2"), out);
    }
}

impl<B: Backend> ShapeCheck for InvertedResidual<B> {
    fn check_shapes(&self, expected: &Self, path: &str, out: &mut Vec<String>) {
        self.conv_pw.check_shapes(&expected.conv_pw, &join(path, "conv_pw"), out);
        self.bn1.check_shapes(&expected.bn1, &join(path, "bn1"), out);
        self.conv_dw.check_shapes(&expected.conv_dw, &join(path, "conv_dw"), out);
        self.bn2.check_shapes(&expected.bn2, &join(path, "bn2"), out);
        self.se.conv_reduce.check_shapes(&expected.se.conv_reduce, &join(path, "se.conv_reduce"), out);
        self.se.conv_expand.check_shapes(&expected.se.conv_expand, &join(path, "se.conv_expand"), out);
        self.conv_pwl.check_shapes(&expected.conv_pwl, &join(path, "conv_pwl"), out);
        self.bn3.check_shapes(&expected.bn3, &join(path, "bn3"), out);
    }
}

impl<B: Backend> ShapeCheck for EfficientNetBackbone<B> {
    fn check_shapes(&self, expected: &Self, path: &str, out: &mut Vec<String>) {
        self.conv_stem.check_shapes(&expected.conv_stem, &join(path, "conv_stem"), out);
        self.bn1.check_shapes(&expected.bn1, &join(path, "bn1"), out);
        self.stage0.check_shapes(&expected.stage0, &join(path, "stage0"), out);
        self.stage1.check_shapes(&expected.stage1, &join(path, "stage1"), out);
        self.stage2.check_shapes(&expected.stage2, &join(path, "stage2"), out);
        self.stage3.check_shapes(&expected.stage3, &join(path, "stage3"), out);
        self.stage4.check_shapes(&expected.stage4, &join(path, "stage4"), out);
        self.stage5.check_shapes(&expected.stage5, &join(path, "stage5"), out);
        self.conv_head.check_shapes(&expected.conv_head, &join(path, "conv_head"), out);
        self.bn2.check_shapes(&expected.bn2, &join(path, "bn2"), out);
    }
}

#[derive(Module, Debug)]
pub struct EfficientNetV2<B: Backend> {
    pub backbone: EfficientNetBackbone<B>,
    pub classifier: Linear<B>,
}

impl<B: Backend> EfficientNetV2<B> {
    pub fn from_checkpoint(
        config: &EfficientNetConfig,
        path: &Path,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        let template = config.init::<B>(device);
        let record =
            checkpoint::load_record::<B, EfficientNetBackbone<B>>(path, &KEY_REMAP, device)?;
        info!(
            path = %path.display(),
            head = ?HEAD_KEYS,
            "efficientnet backbone read; keys outside the backbone were not loaded"
        );

        let backbone = checkpoint::apply_record::<B, _>(template.backbone.clone(), record)?;
        shape::verify(&backbone, &template.backbone)?;
        Ok(Self {
            backbone,
            classifier: template.classifier,
        })
    }
}

impl<B: Backend> Network<B> for EfficientNetV2<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.classifier.forward(self.backbone.forward(images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::labels::NUM_CLASSES;
    use burn::backend::NdArray;
    use regex::Regex;

    type B = NdArray<f32>;

    /// Matches `tests/fixtures/make_checkpoints.py`.
    fn tiny() -> EfficientNetConfig {
        EfficientNetConfig::new()
            .with_image_size(32)
            .with_stem_channels(4)
            .with_stage_channels(vec![4, 8, 8, 8, 8, 8])
            .with_stage_repeats(vec![1; 6])
            .with_num_features(16)
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[test]
    fn default_stages_follow_rw_s_layout() {
        let device = Default::default();
        let config = EfficientNetConfig::new();
        assert_eq!(config.stage_repeats, vec![2, 4, 4, 6, 9, 15]);

        let model = config.init::<B>(&device);
        let b = &model.backbone;
        assert_eq!(b.stage0.len(), 2);
        assert_eq!(b.stage5.len(), 15);
        assert_eq!(b.stage3[0].conv_pw.weight.val().dims(), [256, 64, 1, 1]);
        assert_eq!(b.stage5[14].conv_pwl.weight.val().dims(), [272, 1632, 1, 1]);
        assert_eq!(b.conv_head.weight.val().dims(), [1792, 272, 1, 1]);
    }

    #[test]
    fn timm_keys_map_onto_stage_fields() {
        let (pattern, replacement) = KEY_REMAP[0];
        let re = Regex::new(pattern).unwrap();
        assert_eq!(
            re.replace("blocks.0.1.conv_exp.weight", replacement),
            "stage0.1.conv_exp.weight"
        );
        assert_eq!(
            re.replace("blocks.5.14.se.conv_reduce.bias", replacement),
            "stage5.14.se.conv_reduce.bias"
        );
        assert_eq!(re.replace("conv_head.weight", replacement), "conv_head.weight");
    }

    #[test]
    fn nested_checkpoint_fills_every_stage() {
        let device = Default::default();
        let model =
            EfficientNetV2::<B>::from_checkpoint(&tiny(), &fixture("efficientnet_nested.pth"), &device)
                .unwrap();
        let b = &model.backbone;

        let first = |t: Tensor<B, 4>| t.into_data().to_vec::<f32>().unwrap()[..2].to_vec();
        let close = |a: &[f32], e: &[f32]| a.iter().zip(e).all(|(a, e)| (a - e).abs() < 1e-6);
        assert!(close(&first(b.stage0[0].conv_exp.weight.val()), &[-0.08, -0.07]));
        assert!(close(&first(b.stage3[0].conv_pw.weight.val()), &[-0.08, -0.07]));
        assert!(close(&first(b.stage5[0].se.conv_expand.weight.val()), &[-0.08, -0.07]));

        let var = b.stage4[0].bn3.running_var.value().into_data().to_vec::<f32>().unwrap();
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-6), "{var:?}");

        let logits = model.forward(Tensor::<B, 4>::zeros([1, 3, 32, 32], &device));
        assert_eq!(logits.dims(), [1, NUM_CLASSES]);
    }

    #[test]
    fn stage_count_mismatch_is_reported() {
        let device = Default::default();
        let err = EfficientNetV2::<B>::from_checkpoint(
            &tiny().with_stage_repeats(vec![1, 1, 1, 2, 1, 1]),
            &fixture("efficientnet_nested.pth"),
            &device,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("same length"), "{err:#}");
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let device = Default::default();
        let result = EfficientNetV2::<B>::from_checkpoint(
            &tiny(),
            Path::new("/nonexistent/efficientnet.pth"),
            &device,
        );
        assert!(result.is_err());
    }
}
