//! Vision Transformer (ViT) image classifier.
//!
//! Parameter names follow the published PyTorch checkpoints:
//! - `patch_embedding.{weight,bias}`: Conv2d with stride = kernel = patch size
//! - `class_token`: `[1, 1, dim]`, token classifier only
//! - `positional_embedding.pos_embedding`: `[1, seq_len, dim]`
//! - `transformer.blocks.{i}.{norm1,attn.proj_{q,k,v},proj,norm2,pwff.fc1,pwff.fc2}`
//! - `pre_logits.{weight,bias}`: when a representation size is configured
//! - `norm.{weight,bias}`, `fc.{weight,bias}`
//!
//! Dropout is an identity at inference time and is not modelled.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder, VarMap};

use crate::config::{pretrained_model, ClassifierMode, ViTConfig};
use crate::loader::{load_pretrained_weights, LoadOptions, WeightLoadError};
use crate::state_dict::{LoadReport, ModelTarget, ParameterSet, StateDictError};

// ─── Attention ───────────────────────────────────────────────────────────────

struct MultiHeadedSelfAttention {
    proj_q: Linear,
    proj_k: Linear,
    proj_v: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadedSelfAttention {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.head_dim();
        Ok(Self {
            proj_q: candle_nn::linear(cfg.dim, cfg.dim, vb.pp("proj_q"))?,
            proj_k: candle_nn::linear(cfg.dim, cfg.dim, vb.pp("proj_k"))?,
            proj_v: candle_nn::linear(cfg.dim, cfg.dim, vb.pp("proj_v"))?,
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let split = |proj: &Linear| -> Result<Tensor> {
            proj.forward(x)?
                .reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(&self.proj_q)?;
        let k = split(&self.proj_k)?;
        let v = split(&self.proj_v)?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = candle_nn::ops::softmax_last_dim(&scores)?;
        scores
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))
    }
}

// ─── Feed-forward ────────────────────────────────────────────────────────────

struct PositionWiseFeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl PositionWiseFeedForward {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.dim, cfg.ff_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.ff_dim, cfg.dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu_erf()?)
    }
}

// ─── Transformer block ───────────────────────────────────────────────────────

struct Block {
    norm1: LayerNorm,
    attn: MultiHeadedSelfAttention,
    proj: Linear,
    norm2: LayerNorm,
    pwff: PositionWiseFeedForward,
}

impl Block {
    fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(cfg.dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attn: MultiHeadedSelfAttention::new(cfg, vb.pp("attn"))?,
            proj: candle_nn::linear(cfg.dim, cfg.dim, vb.pp("proj"))?,
            norm2: candle_nn::layer_norm(cfg.dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            pwff: PositionWiseFeedForward::new(cfg, vb.pp("pwff"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self
            .proj
            .forward(&self.attn.forward(&self.norm1.forward(x)?)?)?;
        let x = (x + h)?;
        let h = self.pwff.forward(&self.norm2.forward(&x)?)?;
        x + h
    }
}

// ─── ViT ─────────────────────────────────────────────────────────────────────

/// Vision Transformer whose parameters live in an owned [`VarMap`].
///
/// Loading weights writes into the `VarMap` in place, so the layers below see
/// the new values without being rebuilt.
pub struct ViT {
    patch_embedding: Conv2d,
    class_token: Option<Tensor>,
    pos_embedding: Tensor,
    blocks: Vec<Block>,
    pre_logits: Option<Linear>,
    norm: LayerNorm,
    fc: Linear,
    config: ViTConfig,
    varmap: VarMap,
}

impl ViT {
    /// Build a randomly initialised model.
    pub fn new(cfg: &ViTConfig, dtype: DType, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let patch_embedding = candle_nn::conv2d(
            cfg.in_channels,
            cfg.dim,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb.pp("patch_embedding"),
        )?;

        let class_token = match cfg.classifier {
            ClassifierMode::Token => {
                Some(vb.get_with_hints((1, 1, cfg.dim), "class_token", Init::Const(0.0))?)
            }
            ClassifierMode::GlobalAveragePool => None,
        };

        let pos_embedding = vb.pp("positional_embedding").get_with_hints(
            (1, cfg.seq_len(), cfg.dim),
            "pos_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;

        let vb_blocks = vb.pp("transformer").pp("blocks");
        let blocks = (0..cfg.num_layers)
            .map(|i| Block::new(cfg, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let pre_logits = cfg
            .representation_size
            .map(|size| candle_nn::linear(cfg.dim, size, vb.pp("pre_logits")))
            .transpose()?;

        let norm = candle_nn::layer_norm(cfg.pre_logits_size(), cfg.layer_norm_eps, vb.pp("norm"))?;
        let fc = candle_nn::linear(cfg.pre_logits_size(), cfg.num_classes, vb.pp("fc"))?;

        Ok(Self {
            patch_embedding,
            class_token,
            pos_embedding,
            blocks,
            pre_logits,
            norm,
            fc,
            config: cfg.clone(),
            varmap,
        })
    }

    /// Build the registered variant `name` adapted to `cfg` and load its weights.
    ///
    /// The first convolution is skipped when `cfg.in_channels` is not 3, the
    /// classifier when `cfg.num_classes` differs from the checkpoint's, and the
    /// positional embedding is resized when `cfg.image_size` differs from the
    /// pretraining size. `options` supplies the remaining settings; its three
    /// flags are overwritten.
    pub fn from_pretrained(
        name: &str,
        cfg: &ViTConfig,
        options: LoadOptions,
        dtype: DType,
        device: &Device,
    ) -> std::result::Result<Self, WeightLoadError> {
        let entry = pretrained_model(name)
            .ok_or_else(|| WeightLoadError::UnknownModel(name.to_string()))?;
        let options = pretrained_load_options(cfg, entry.num_classes, entry.image_size, options);

        let model = Self::new(cfg, dtype, device).map_err(StateDictError::from)?;
        load_pretrained_weights(&model, name, cfg.classifier, &options)?;
        Ok(model)
    }

    /// Class logits for `pixel_values` of shape `[batch, channels, height, width]`.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b = pixel_values.dim(0)?;

        // [b, dim, gh, gw] -> [b, gh*gw, dim]
        let mut x = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;

        if let Some(tok) = &self.class_token {
            let tok = tok.broadcast_as((b, 1, self.config.dim))?;
            x = Tensor::cat(&[&tok, &x], 1)?;
        }
        x = x.broadcast_add(&self.pos_embedding)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }

        if let Some(pre_logits) = &self.pre_logits {
            x = pre_logits.forward(&x)?.tanh()?;
        }

        let x = self.norm.forward(&x)?;
        let pooled = match self.config.classifier {
            ClassifierMode::Token => x.i((.., 0))?,
            ClassifierMode::GlobalAveragePool => x.mean(1)?,
        };
        self.fc.forward(&pooled)
    }

    pub fn config(&self) -> &ViTConfig {
        &self.config
    }
}

impl ModelTarget for ViT {
    fn state_dict(&self) -> ParameterSet {
        self.varmap.state_dict()
    }

    fn load_state_dict(
        &self,
        params: &ParameterSet,
        strict: bool,
    ) -> std::result::Result<LoadReport, StateDictError> {
        self.varmap.load_state_dict(params, strict)
    }
}

/// Loader flags for adapting a checkpoint trained with `pretrained_num_classes`
/// classes at `pretrained_image_size` pixels to `cfg`.
pub fn pretrained_load_options(
    cfg: &ViTConfig,
    pretrained_num_classes: usize,
    pretrained_image_size: usize,
    options: LoadOptions,
) -> LoadOptions {
    LoadOptions {
        load_first_conv: cfg.in_channels == 3,
        load_fc: cfg.num_classes == pretrained_num_classes,
        resize_positional_embedding: cfg.image_size != pretrained_image_size,
        image_size: Some(cfg.image_size),
        ..options
    }
}
