//! Positional embedding resampling for checkpoints trained at a different
//! image resolution.
//!
//! The spatial part of a `[1, N, D]` embedding is treated as a `gs × gs`
//! grid and resampled with first-order (bilinear) interpolation. The class
//! token slot, when present, is carried over unchanged.

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use crate::config::ClassifierMode;

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("positional embedding must have shape [1, tokens, dim], got {0:?}")]
    Shape(Vec<usize>),
    #[error("embedding dims differ: checkpoint has {old}, model has {new}")]
    DimMismatch { old: usize, new: usize },
    #[error("{tokens} grid tokens do not form a square grid")]
    NotSquare { tokens: usize },
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Resample `posemb` to the token count of `posemb_new`.
///
/// `posemb_new` is only used for its shape. Returns a tensor with the shape of
/// `posemb_new`, in the dtype and device of `posemb`.
pub fn resize_positional_embedding(
    posemb: &Tensor,
    posemb_new: &Tensor,
    classifier: ClassifierMode,
) -> Result<Tensor, ResizeError> {
    let (ntok_old, dim) = embedding_shape(posemb)?;
    let (ntok_new, dim_new) = embedding_shape(posemb_new)?;
    if dim != dim_new {
        return Err(ResizeError::DimMismatch {
            old: dim,
            new: dim_new,
        });
    }

    let num_prefix = classifier.num_prefix_tokens();
    let gs_old = grid_side(ntok_old.saturating_sub(num_prefix))?;
    let gs_new = grid_side(ntok_new.saturating_sub(num_prefix))?;
    tracing::info!(gs_old, gs_new, "load_pretrained: resizing positional embedding grid");

    let grid = posemb
        .narrow(1, num_prefix, gs_old * gs_old)?
        .squeeze(0)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;
    let resized = zoom_grid(&grid, gs_old, gs_new);
    let resized = Tensor::from_vec(resized, (1, gs_new * gs_new, dim), &Device::Cpu)?
        .to_dtype(posemb.dtype())?
        .to_device(posemb.device())?;

    if num_prefix == 0 {
        return Ok(resized);
    }
    let posemb_tok = posemb.narrow(1, 0, num_prefix)?;
    Ok(Tensor::cat(&[&posemb_tok, &resized], 1)?)
}

fn embedding_shape(t: &Tensor) -> Result<(usize, usize), ResizeError> {
    match t.dims() {
        &[1, n, d] => Ok((n, d)),
        dims => Err(ResizeError::Shape(dims.to_vec())),
    }
}

/// Side length of a square grid holding `tokens` entries.
fn grid_side(tokens: usize) -> Result<usize, ResizeError> {
    let side = (tokens as f64).sqrt().floor() as usize;
    if tokens == 0 || side * side != tokens {
        return Err(ResizeError::NotSquare { tokens });
    }
    Ok(side)
}

/// First-order spline zoom of a `[gs_old², D]` grid to `[gs_new², D]`.
///
/// Corner samples map onto corner samples: output index `o` reads input
/// coordinate `o * (gs_old - 1) / (gs_new - 1)`. Channels are independent.
fn zoom_grid(grid: &[Vec<f32>], gs_old: usize, gs_new: usize) -> Vec<f32> {
    let dim = grid.first().map_or(0, Vec::len);
    let scale = if gs_new > 1 {
        (gs_old - 1) as f64 / (gs_new - 1) as f64
    } else {
        0.0
    };
    let sample = |o: usize| {
        let c = o as f64 * scale;
        let i0 = (c.floor() as usize).min(gs_old - 1);
        let i1 = (i0 + 1).min(gs_old - 1);
        let w1 = (c - i0 as f64) as f32;
        (i0, i1, 1.0 - w1, w1)
    };

    let mut out = vec![0f32; gs_new * gs_new * dim];
    for ty in 0..gs_new {
        let (y0, y1, wy0, wy1) = sample(ty);
        for tx in 0..gs_new {
            let (x0, x1, wx0, wx1) = sample(tx);
            let dst = (ty * gs_new + tx) * dim;
            let v00 = &grid[y0 * gs_old + x0];
            let v01 = &grid[y0 * gs_old + x1];
            let v10 = &grid[y1 * gs_old + x0];
            let v11 = &grid[y1 * gs_old + x1];
            for k in 0..dim {
                out[dst + k] =
                    wy0 * (wx0 * v00[k] + wx1 * v01[k]) + wy1 * (wx0 * v10[k] + wx1 * v11[k]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange_embedding(tokens: usize, dim: usize) -> Tensor {
        Tensor::arange(0f32, (tokens * dim) as f32, &Device::Cpu)
            .unwrap()
            .reshape((1, tokens, dim))
            .unwrap()
    }

    fn zeros(tokens: usize, dim: usize) -> Tensor {
        Tensor::zeros((1, tokens, dim), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn same_size_is_identity() {
        let posemb = Tensor::randn(0f32, 1.0, (1, 17, 8), &Device::Cpu).unwrap();
        let out =
            resize_positional_embedding(&posemb, &zeros(17, 8), ClassifierMode::Token).unwrap();
        assert_eq!(out.dims(), &[1, 17, 8]);
        let diff = (out - &posemb)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn upsample_keeps_class_token() {
        let dim = 4;
        let posemb = Tensor::randn(0f32, 1.0, (1, 1 + 16, dim), &Device::Cpu).unwrap();
        let out =
            resize_positional_embedding(&posemb, &zeros(1 + 64, dim), ClassifierMode::Token)
                .unwrap();
        assert_eq!(out.dims(), &[1, 65, dim]);

        let tok_in: Vec<f32> = posemb.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        let tok_out: Vec<f32> = out.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(tok_in, tok_out);
    }

    #[test]
    fn upsample_preserves_corners() {
        // Without a class token, grid corners map onto grid corners.
        let posemb = arange_embedding(16, 2);
        let out = resize_positional_embedding(
            &posemb,
            &zeros(64, 2),
            ClassifierMode::GlobalAveragePool,
        )
        .unwrap();
        let out: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        let inp: Vec<Vec<f32>> = posemb.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(out[0], inp[0]);
        assert_eq!(out[7], inp[3]);
        assert_eq!(out[56], inp[12]);
        assert_eq!(out[63], inp[15]);
    }

    #[test]
    fn linear_ramp_is_reproduced() {
        // Values linear in the grid coordinates are reproduced exactly by
        // first-order interpolation: v(y, x) = 10 * y + x on a 3x3 grid,
        // resampled to 5x5 gives v = 10 * y/2 + x/2.
        let mut data = Vec::new();
        for y in 0..3 {
            for x in 0..3 {
                data.push((10 * y + x) as f32);
            }
        }
        let posemb = Tensor::from_vec(data, (1, 9, 1), &Device::Cpu).unwrap();
        let out = resize_positional_embedding(
            &posemb,
            &zeros(25, 1),
            ClassifierMode::GlobalAveragePool,
        )
        .unwrap();
        let out: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for y in 0..5 {
            for x in 0..5 {
                let expected = 10.0 * y as f32 / 2.0 + x as f32 / 2.0;
                assert!((out[y * 5 + x] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn downsample_to_single_cell_takes_origin() {
        let posemb = arange_embedding(1 + 4, 3);
        let out =
            resize_positional_embedding(&posemb, &zeros(2, 3), ClassifierMode::Token).unwrap();
        let out: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(out, vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]);
    }

    #[test]
    fn non_square_grid_is_rejected() {
        let posemb = zeros(1 + 10, 4);
        let err = resize_positional_embedding(&posemb, &zeros(1 + 16, 4), ClassifierMode::Token)
            .unwrap_err();
        assert!(matches!(err, ResizeError::NotSquare { tokens: 10 }));

        let err = resize_positional_embedding(
            &zeros(16, 4),
            &zeros(10, 4),
            ClassifierMode::GlobalAveragePool,
        )
        .unwrap_err();
        assert!(matches!(err, ResizeError::NotSquare { tokens: 10 }));
    }

    #[test]
    fn bad_shapes_are_rejected() {
        let flat = Tensor::zeros((17, 4), DType::F32, &Device::Cpu).unwrap();
        let err = resize_positional_embedding(&flat, &zeros(17, 4), ClassifierMode::Token)
            .unwrap_err();
        assert!(matches!(err, ResizeError::Shape(_)));

        let err = resize_positional_embedding(&zeros(17, 4), &zeros(17, 8), ClassifierMode::Token)
            .unwrap_err();
        assert!(matches!(err, ResizeError::DimMismatch { old: 4, new: 8 }));
    }

    #[test]
    fn dtype_is_preserved() {
        let posemb = zeros(1 + 4, 2).to_dtype(DType::F16).unwrap();
        let out =
            resize_positional_embedding(&posemb, &zeros(1 + 9, 2), ClassifierMode::Token).unwrap();
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(out.dims(), &[1, 10, 2]);
    }
}
