//! ViT-Small/16 for the primary classifier variant.
//!
//! Field names mirror the checkpoint layout (`patch_embed.proj`, `blocks.N.attn.qkv`, ...) so the
//! PyTorch state dict maps onto the module tree without key remapping.

use std::path::Path;

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{
        activation::{gelu, softmax},
        backend::Backend,
        Distribution, Tensor,
    },
};
use tracing::info;

use super::checkpoint;
use super::shape::{self, check_param, join, ShapeCheck};
use super::Network;

/// Checkpoint keys of the classification head; the backbone record has no slot for them.
pub const HEAD_KEYS: [&str; 2] = ["head.weight", "head.bias"];

#[derive(Config, Debug)]
pub struct VitConfig {
    #[config(default = "224")]
    pub image_size: usize,
    #[config(default = "16")]
    pub patch_size: usize,
    #[config(default = "384")]
    pub embed_dim: usize,
    #[config(default = "12")]
    pub depth: usize,
    #[config(default = "6")]
    pub num_heads: usize,
    #[config(default = "4")]
    pub mlp_ratio: usize,
    #[config(default = "22")]
    pub num_classes: usize,
}

impl VitConfig {
    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionTransformer<B> {
        let dim = self.embed_dim;
        let patch_embed = PatchEmbed {
            proj: Conv2dConfig::new([3, dim], [self.patch_size, self.patch_size])
                .with_stride([self.patch_size, self.patch_size])
                .init(device),
        };
        let blocks = (0..self.depth)
            .map(|_| Block::new(dim, self.num_heads, dim * self.mlp_ratio, device))
            .collect();
        let backbone = VitBackbone {
            patch_embed,
            cls_token: Param::from_tensor(Tensor::zeros([1, 1, dim], device)),
            pos_embed: Param::from_tensor(Tensor::random(
                [1, self.num_patches() + 1, dim],
                Distribution::Normal(0.0, 0.02),
                device,
            )),
            blocks,
            norm: layer_norm(dim, device),
        };
        VisionTransformer {
            backbone,
            head: LinearConfig::new(dim, self.num_classes).init(device),
        }
    }
}

fn layer_norm<B: Backend>(dim: usize, device: &B::Device) -> LayerNorm<B> {
    LayerNormConfig::new(dim).with_epsilon(1e-6).init(device)
}

#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    pub proj: Conv2d<B>,
}

#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub qkv: Linear<B>,
    pub proj: Linear<B>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, n, c] = x.dims();
        let h = self.num_heads;
        let d = c / h;

        // [b, n, 3*c] -> [3, b, h, n, d]
        let qkv = self
            .qkv
            .forward(x)
            .reshape([b, n, 3, h, d])
            .permute([2, 0, 3, 1, 4]);
        let q = qkv.clone().slice([0..1, 0..b, 0..h, 0..n, 0..d]).reshape([b, h, n, d]);
        let k = qkv.clone().slice([1..2, 0..b, 0..h, 0..n, 0..d]).reshape([b, h, n, d]);
        let v = qkv.slice([2..3, 0..b, 0..h, 0..n, 0..d]).reshape([b, h, n, d]);

        let scores = q
            .matmul(k.swap_dims(2, 3))
            .mul_scalar((d as f64).powf(-0.5));
        let attn = softmax(scores, 3);
        let out = attn.matmul(v).swap_dims(1, 2).reshape([b, n, c]);
        self.proj.forward(out)
    }
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(gelu(self.fc1.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn: Attention<B>,
    pub norm2: LayerNorm<B>,
    pub mlp: Mlp<B>,
}

impl<B: Backend> Block<B> {
    fn new(dim: usize, num_heads: usize, hidden: usize, device: &B::Device) -> Self {
        Self {
            norm1: layer_norm(dim, device),
            attn: Attention {
                qkv: LinearConfig::new(dim, dim * 3).init(device),
                proj: LinearConfig::new(dim, dim).init(device),
                num_heads,
            },
            norm2: layer_norm(dim, device),
            mlp: Mlp {
                fc1: LinearConfig::new(dim, hidden).init(device),
                fc2: LinearConfig::new(hidden, dim).init(device),
            },
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn.forward(self.norm1.forward(x));
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

/// Everything except the classification head; this is what gets loaded from a checkpoint.
#[derive(Module, Debug)]
pub struct VitBackbone<B: Backend> {
    pub patch_embed: PatchEmbed<B>,
    pub cls_token: Param<Tensor<B, 3>>,
    pub pos_embed: Param<Tensor<B, 3>>,
    pub blocks: Vec<Block<B>>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> VitBackbone<B> {
    /// Pooled class-token features, `[batch, embed_dim]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let patches = self.patch_embed.proj.forward(images);
        let [b, c, _, _] = patches.dims();
        let tokens = patches.flatten::<3>(2, 3).swap_dims(1, 2);

        let cls = self.cls_token.val().expand([b, 1, c]);
        let mut x = Tensor::cat(vec![cls, tokens], 1) + self.pos_embed.val();
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.norm.forward(x);
        x.slice([0..b, 0..1, 0..c]).reshape([b, c])
    }
}

impl<B: Backend> ShapeCheck for VitBackbone<B> {
    fn check_shapes(&self, expected: &Self, path: &str, out: &mut Vec<String>) {
        self.patch_embed.proj.check_shapes(
            &expected.patch_embed.proj,
            &join(path, "patch_embed.proj"),
            out,
        );
        check_param(&self.cls_token, &expected.cls_token, &join(path, "cls_token"), out);
        check_param(&self.pos_embed, &expected.pos_embed, &join(path, "pos_embed"), out);
        self.blocks.check_shapes(&expected.blocks, &join(path, "blocks"), out);
        self.norm.check_shapes(&expected.norm, &join(path, "norm"), out);
    }
}

impl<B: Backend> ShapeCheck for Block<B> {
    fn check_shapes(&self, expected: &Self, path: &str, out: &mut Vec<String>) {
        self.norm1.check_shapes(&expected.norm1, &join(path, "norm1"), out);
        self.attn.qkv.check_shapes(&expected.attn.qkv, &join(path, "attn.qkv"), out);
        self.attn.proj.check_shapes(&expected.attn.proj, &join(path, "attn.proj"), out);
        self.norm2.check_shapes(&expected.norm2, &join(path, "norm2"), out);
        self.mlp.fc1.check_shapes(&expected.mlp.fc1, &join(path, "mlp.fc1"), out);
        self.mlp.fc2.check_shapes(&expected.mlp.fc2, &join(path, "mlp.fc2"), out);
    }
}

#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    pub backbone: VitBackbone<B>,
    pub head: Linear<B>,
}

impl<B: Backend> VisionTransformer<B> {
    /// Build from `config` and fill the backbone from a PyTorch checkpoint.
    /// The head keeps its fresh initialization sized for `config.num_classes`.
    pub fn from_checkpoint(
        config: &VitConfig,
        path: &Path,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        let template = config.init::<B>(device);
        let record = checkpoint::load_record::<B, VitBackbone<B>>(path, &[], device)?;
        info!(
            path = %path.display(),
            head = ?HEAD_KEYS,
            "vit backbone read; keys outside the backbone were not loaded"
        );

        let backbone = checkpoint::apply_record::<B, _>(template.backbone.clone(), record)?;
        shape::verify(&backbone, &template.backbone)?;
        Ok(Self {
            backbone,
            head: template.head,
        })
    }
}

impl<B: Backend> Network<B> for VisionTransformer<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }
}
