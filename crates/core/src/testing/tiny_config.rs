use crate::config::{ClassifierMode, ViTConfig};

/// Create a tiny ViT config for testing (2 layers, dim 6, 2 heads, 8px images
/// with 4px patches). Uses < 1KB of parameters.
pub fn tiny_vit_config() -> ViTConfig {
    ViTConfig {
        patch_size: 4,
        dim: 6,
        ff_dim: 12,
        num_heads: 2,
        num_layers: 2,
        attention_dropout_rate: 0.0,
        dropout_rate: 0.0,
        representation_size: Some(6),
        classifier: ClassifierMode::Token,
        image_size: 8,
        num_classes: 5,
        in_channels: 3,
        layer_norm_eps: 1e-6,
    }
}
