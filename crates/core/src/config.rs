use std::path::Path;

use serde::{Deserialize, Serialize};

/// How the transformer output is reduced to a single feature vector.
///
/// This also decides whether the positional embedding carries a leading
/// class-token slot in front of the spatial grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierMode {
    /// A learned class token is prepended to the patch tokens.
    Token,
    /// No class token; patch tokens are mean-pooled.
    #[serde(alias = "gap")]
    GlobalAveragePool,
}

impl ClassifierMode {
    /// Number of non-spatial tokens in front of the patch grid.
    pub fn num_prefix_tokens(self) -> usize {
        match self {
            ClassifierMode::Token => 1,
            ClassifierMode::GlobalAveragePool => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViTConfig {
    pub patch_size: usize,
    pub dim: usize,
    pub ff_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub attention_dropout_rate: f64,
    #[serde(default)]
    pub dropout_rate: f64,
    #[serde(default)]
    pub representation_size: Option<usize>,
    pub classifier: ClassifierMode,
    pub image_size: usize,
    pub num_classes: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_in_channels() -> usize {
    3
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

impl Default for ViTConfig {
    fn default() -> Self {
        // ViT-B/16 @ 224px, ImageNet-21k head
        Self {
            patch_size: 16,
            dim: 768,
            ff_dim: 3072,
            num_heads: 12,
            num_layers: 12,
            attention_dropout_rate: 0.0,
            dropout_rate: 0.1,
            representation_size: Some(768),
            classifier: ClassifierMode::Token,
            image_size: 224,
            num_classes: 21843,
            in_channels: 3,
            layer_norm_eps: 1e-6,
        }
    }
}

impl ViTConfig {
    /// ViT-B/16.
    pub fn b16() -> Self {
        Self::default()
    }

    /// ViT-B/32.
    pub fn b32() -> Self {
        Self {
            patch_size: 32,
            ..Self::default()
        }
    }

    /// ViT-L/16.
    pub fn l16() -> Self {
        Self {
            patch_size: 16,
            dim: 1024,
            ff_dim: 4096,
            num_heads: 16,
            num_layers: 24,
            representation_size: Some(1024),
            ..Self::default()
        }
    }

    /// ViT-L/32.
    pub fn l32() -> Self {
        Self {
            patch_size: 32,
            ..Self::l16()
        }
    }

    /// Fine-tuned variant without the pre-logits layer.
    pub fn without_representation(self) -> Self {
        Self {
            representation_size: None,
            ..self
        }
    }

    /// Read a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Patches per image side.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Number of spatial patches.
    pub fn num_patches(&self) -> usize {
        let gs = self.grid_size();
        gs * gs
    }

    /// Tokens seen by the transformer, class token included.
    pub fn seq_len(&self) -> usize {
        self.num_patches() + self.classifier.num_prefix_tokens()
    }

    /// Width of the features fed to the final norm and classifier.
    pub fn pre_logits_size(&self) -> usize {
        self.representation_size.unwrap_or(self.dim)
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads
    }
}

/// Where a checkpoint is downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightsSource {
    /// Plain HTTP(S) URL, cached by file name.
    Url { url: String },
    /// File in a HuggingFace Hub model repository.
    Hub { repo: String, filename: String },
}

impl WeightsSource {
    pub fn url(url: impl Into<String>) -> Self {
        WeightsSource::Url { url: url.into() }
    }

    pub fn hub(repo: impl Into<String>, filename: impl Into<String>) -> Self {
        WeightsSource::Hub {
            repo: repo.into(),
            filename: filename.into(),
        }
    }
}

/// A named pretrained variant.
#[derive(Debug, Clone, PartialEq)]
pub struct PretrainedModel {
    pub name: &'static str,
    pub config: ViTConfig,
    /// Image size the checkpoint was trained at.
    pub image_size: usize,
    /// Number of classes of the checkpoint's head.
    pub num_classes: usize,
    /// `None` when no public checkpoint exists.
    pub source: Option<WeightsSource>,
}

const RELEASE_URL: &str = "https://github.com/lukemelas/PyTorch-Pretrained-ViT/releases/download/0.0.2";

const IMAGENET21K_CLASSES: usize = 21843;
const IMAGENET1K_CLASSES: usize = 1000;

fn release(file: &str) -> Option<WeightsSource> {
    Some(WeightsSource::url(format!("{RELEASE_URL}/{file}")))
}

fn entry(
    name: &'static str,
    config: ViTConfig,
    image_size: usize,
    num_classes: usize,
    source: Option<WeightsSource>,
) -> PretrainedModel {
    PretrainedModel {
        name,
        config: ViTConfig {
            image_size,
            num_classes,
            ..config
        },
        image_size,
        num_classes,
        source,
    }
}

fn registry() -> &'static [PretrainedModel] {
    static REGISTRY: std::sync::OnceLock<Vec<PretrainedModel>> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            entry("B_16", ViTConfig::b16(), 224, IMAGENET21K_CLASSES, release("B_16.pth")),
            entry("B_32", ViTConfig::b32(), 224, IMAGENET21K_CLASSES, release("B_32.pth")),
            entry("L_16", ViTConfig::l16(), 224, IMAGENET21K_CLASSES, None),
            entry("L_32", ViTConfig::l32(), 224, IMAGENET21K_CLASSES, release("L_32.pth")),
            entry(
                "B_16_imagenet1k",
                ViTConfig::b16().without_representation(),
                384,
                IMAGENET1K_CLASSES,
                release("B_16_imagenet1k.pth"),
            ),
            entry(
                "B_32_imagenet1k",
                ViTConfig::b32().without_representation(),
                384,
                IMAGENET1K_CLASSES,
                release("B_32_imagenet1k.pth"),
            ),
            entry(
                "L_16_imagenet1k",
                ViTConfig::l16().without_representation(),
                384,
                IMAGENET1K_CLASSES,
                release("L_16_imagenet1k.pth"),
            ),
            entry(
                "L_32_imagenet1k",
                ViTConfig::l32().without_representation(),
                384,
                IMAGENET1K_CLASSES,
                release("L_32_imagenet1k.pth"),
            ),
        ]
    })
}

/// Look up a pretrained variant by name.
pub fn pretrained_model(name: &str) -> Option<&'static PretrainedModel> {
    registry().iter().find(|m| m.name == name)
}

/// Names of all registered variants.
pub fn pretrained_model_names() -> Vec<&'static str> {
    registry().iter().map(|m| m.name).collect()
}
