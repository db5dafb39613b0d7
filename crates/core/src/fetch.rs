//! Checkpoint acquisition: local files, cached URL downloads and the
//! HuggingFace Hub.

use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::Device;
use hf_hub::api::sync::{Api, ApiError};
use hf_hub::{Repo, RepoType};
use thiserror::Error;

use crate::config::WeightsSource;
use crate::state_dict::ParameterSet;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download of {url} failed with HTTP status {status}")]
    Http { url: String, status: u16 },
    #[error("download of {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("cannot derive a cache file name from {0}")]
    InvalidUrl(String),
    #[error("hub error: {0}")]
    Hub(#[from] ApiError),
    #[error("unsupported checkpoint format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("checkpoint decode error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Default directory for downloaded checkpoints.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vit-core")
        .join("checkpoints")
}

/// Fetch (or reuse) and decode the checkpoint behind `source`.
pub fn load_source(
    source: &WeightsSource,
    cache_dir: Option<&Path>,
) -> Result<ParameterSet, FetchError> {
    match source {
        WeightsSource::Url { url } => {
            let dir = cache_dir.map_or_else(default_cache_dir, Path::to_path_buf);
            load_url(url, &dir)
        }
        WeightsSource::Hub { repo, filename } => load_hub(repo, filename),
    }
}

/// Download `url` into `cache_dir` unless already present, then decode it.
pub fn load_url(url: &str, cache_dir: &Path) -> Result<ParameterSet, FetchError> {
    let path = cached_download(url, cache_dir)?;
    load_file(&path)
}

/// Fetch `filename` from a Hub model repository through hf-hub's cache.
pub fn load_hub(repo: &str, filename: &str) -> Result<ParameterSet, FetchError> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(repo.to_string(), RepoType::Model));
    let path = repo.get(filename)?;
    load_file(&path)
}

/// Cache path for `url`: its last path segment inside `cache_dir`.
pub fn cache_path(url: &str, cache_dir: &Path) -> Result<PathBuf, FetchError> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
    Ok(cache_dir.join(name))
}

fn cached_download(url: &str, cache_dir: &Path) -> Result<PathBuf, FetchError> {
    let path = cache_path(url, cache_dir)?;
    if path.exists() {
        tracing::debug!(path = %path.display(), "using cached checkpoint");
        return Ok(path);
    }

    std::fs::create_dir_all(cache_dir)?;
    tracing::info!(url, path = %path.display(), "downloading checkpoint");

    let response = ureq::get(url).call().map_err(|e| match e {
        ureq::Error::Status(status, _) => FetchError::Http {
            url: url.to_string(),
            status,
        },
        ureq::Error::Transport(t) => FetchError::Transport {
            url: url.to_string(),
            message: t.to_string(),
        },
    })?;

    // Write to a sibling file first so an interrupted download never looks cached.
    let partial = partial_path(&path);
    let mut reader = response.into_reader();
    let mut file = File::create(&partial)?;
    if let Err(e) = std::io::copy(&mut reader, &mut file) {
        drop(file);
        let _ = std::fs::remove_file(&partial);
        return Err(e.into());
    }
    file.sync_all()?;
    std::fs::rename(&partial, &path)?;
    Ok(path)
}

/// `<name>.partial` next to the cache file `<name>`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Decode a checkpoint file into a [`ParameterSet`] on the CPU.
///
/// `.safetensors` files are memory-loaded directly; `.pth`, `.pt` and `.bin`
/// are read as PyTorch pickles.
pub fn load_file(path: impl AsRef<Path>) -> Result<ParameterSet, FetchError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FetchError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        )));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let params: ParameterSet = match ext.as_deref() {
        Some("safetensors") => candle_core::safetensors::load(path, &Device::Cpu)?,
        Some("pth") | Some("pt") | Some("bin") => {
            candle_core::pickle::read_all(path)?.into_iter().collect()
        }
        _ => return Err(FetchError::UnsupportedFormat(path.to_path_buf())),
    };

    tracing::debug!(
        path = %path.display(),
        tensors = params.len(),
        "decoded checkpoint"
    );
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use tempfile::tempdir;

    #[test]
    fn cache_path_uses_last_segment() {
        let dir = Path::new("/cache");
        let p = cache_path(
            "https://github.com/lukemelas/PyTorch-Pretrained-ViT/releases/download/0.0.2/B_16.pth",
            dir,
        )
        .unwrap();
        assert_eq!(p, PathBuf::from("/cache/B_16.pth"));

        let p = cache_path("https://example.com/w/model.safetensors?download=1", dir).unwrap();
        assert_eq!(p, PathBuf::from("/cache/model.safetensors"));
    }

    #[test]
    fn cache_path_rejects_directory_urls() {
        let dir = Path::new("/cache");
        assert!(matches!(
            cache_path("https://example.com/weights/", dir),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn partial_download_keeps_full_name() {
        let dir = Path::new("/cache");
        let pth = partial_path(&dir.join("B_16.pth"));
        let st = partial_path(&dir.join("B_16.safetensors"));
        assert_eq!(pth, PathBuf::from("/cache/B_16.pth.partial"));
        assert_eq!(st, PathBuf::from("/cache/B_16.safetensors.partial"));
        assert_ne!(pth, st);
    }

    #[test]
    fn load_safetensors_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let mut tensors = ParameterSet::new();
        tensors.insert(
            "fc.bias".to_string(),
            Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let params = load_file(&path).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(
            params["fc.bias"].to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_file("/nonexistent/B_16.pth").unwrap_err();
        match err {
            FetchError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io error, got: {other}"),
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.npz");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(
            load_file(&path),
            Err(FetchError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn cached_url_skips_download() {
        let dir = tempdir().unwrap();
        let mut tensors = ParameterSet::new();
        tensors.insert(
            "class_token".to_string(),
            Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.path().join("tiny.safetensors")).unwrap();

        // Unroutable host: only the cache can satisfy this.
        let params = load_url("http://invalid.invalid/tiny.safetensors", dir.path()).unwrap();
        assert_eq!(params["class_token"].dims(), &[1, 1, 4]);
    }

    #[test]
    #[ignore] // requires network
    fn download_b16_checkpoint() {
        let dir = tempdir().unwrap();
        let params = load_url(
            "https://github.com/lukemelas/PyTorch-Pretrained-ViT/releases/download/0.0.2/B_16.pth",
            dir.path(),
        )
        .expect("failed to download B_16");
        assert_eq!(params["positional_embedding.pos_embedding"].dims(), &[1, 197, 768]);
        assert!(dir.path().join("B_16.pth").exists());
    }
}
