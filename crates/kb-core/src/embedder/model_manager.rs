//! Automatic embedding model management.
//!
//! Downloads and caches the ONNX embedding model and tokenizer on first
//! use. Models live under the configured cache directory
//! (`<data_root>/models/<model-name>/` by default) and are reused for
//! every subsequent run.
//!
//! ## Model Selection
//!
//! Default model: `all-MiniLM-L6-v2`
//! - General-purpose sentence embeddings, strong on short prose
//! - 384 dimensions, 256-token window, mean pooling
//! - ONNX-compatible, ~90MB download
//!
//! Users should never manually download models. The engine detects a
//! missing model and fetches it with progress reporting; after that the
//! cached files are stable.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{KbError, KbResult};

/// Metadata for a supported embedding model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Human-readable model name (also the cache directory name).
    pub name: &'static str,
    /// HuggingFace model ID.
    pub hf_repo: &'static str,
    /// URL to the ONNX model file.
    pub model_url: &'static str,
    /// URL to the tokenizer.json file.
    pub tokenizer_url: &'static str,
    /// Output embedding dimensions.
    pub dimensions: usize,
    /// Maximum sequence length the model supports.
    pub max_seq_length: usize,
    /// Approximate download size in bytes (for progress display).
    pub approx_size_bytes: u64,
}

/// Default model: MiniLM -- compact sentence embeddings that hold up
/// well on knowledge-base prose while staying fast on CPU.
pub const DEFAULT_MODEL: ModelSpec = ModelSpec {
    name: "all-MiniLM-L6-v2",
    hf_repo: "sentence-transformers/all-MiniLM-L6-v2",
    model_url: "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx",
    tokenizer_url: "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
    dimensions: 384,
    max_seq_length: 256,
    approx_size_bytes: 90_000_000, // ~90MB
};

/// Alternate model: BGE Small -- same dimensions, larger window,
/// for users who ingest longer technical passages.
pub const ALTERNATE_MODEL: ModelSpec = ModelSpec {
    name: "bge-small-en-v1.5",
    hf_repo: "BAAI/bge-small-en-v1.5",
    model_url: "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main/onnx/model.onnx",
    tokenizer_url: "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main/tokenizer.json",
    dimensions: 384,
    max_seq_length: 512,
    approx_size_bytes: 130_000_000, // ~130MB
};

/// Resolve a configured model identifier to a known spec.
///
/// Unknown identifiers fall back to the default model with a warning,
/// so a typo in the config degrades rather than aborts.
pub fn resolve_model_spec(model: &str) -> &'static ModelSpec {
    match model.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "minilm" | "default" => &DEFAULT_MODEL,
        "bge-small-en-v1.5" | "bge-small" | "bge" => &ALTERNATE_MODEL,
        other => {
            tracing::warn!(model = other, "unknown embedding model, using default");
            &DEFAULT_MODEL
        }
    }
}

/// Get the directory for a specific model under the cache root.
pub fn model_dir(cache_dir: &Path, spec: &ModelSpec) -> PathBuf {
    cache_dir.join(spec.name)
}

/// Get the path to the ONNX model file for a given spec.
pub fn model_path(cache_dir: &Path, spec: &ModelSpec) -> PathBuf {
    model_dir(cache_dir, spec).join("model.onnx")
}

/// Get the path to the tokenizer file for a given spec.
pub fn tokenizer_path(cache_dir: &Path, spec: &ModelSpec) -> PathBuf {
    model_dir(cache_dir, spec).join("tokenizer.json")
}

/// Check if the model files exist and are plausibly intact.
pub fn is_model_ready(cache_dir: &Path, spec: &ModelSpec) -> bool {
    let model = model_path(cache_dir, spec);
    let tokenizer = tokenizer_path(cache_dir, spec);

    if !model.exists() || !tokenizer.exists() {
        return false;
    }

    // A model file under 1MB is a truncated download.
    if let Ok(meta) = std::fs::metadata(&model) {
        if meta.len() < 1_000_000 {
            return false;
        }
    }

    true
}

/// Ensure the model is available, downloading if necessary.
///
/// Returns the paths to (model.onnx, tokenizer.json). Setting
/// `KB_SKIP_MODEL_DOWNLOAD` suppresses the download (CI, offline).
pub fn ensure_model(cache_dir: &Path, spec: &ModelSpec) -> KbResult<(PathBuf, PathBuf)> {
    let model = model_path(cache_dir, spec);
    let tokenizer = tokenizer_path(cache_dir, spec);

    if is_model_ready(cache_dir, spec) {
        tracing::debug!(
            model = spec.name,
            path = %model.display(),
            "embedding model already cached"
        );
        return Ok((model, tokenizer));
    }

    if std::env::var("KB_SKIP_MODEL_DOWNLOAD").is_ok() {
        return Err(KbError::ModelUnavailable {
            reason: format!(
                "model {} not cached and KB_SKIP_MODEL_DOWNLOAD is set",
                spec.name
            ),
        });
    }

    let dir = model_dir(cache_dir, spec);
    std::fs::create_dir_all(&dir)?;

    tracing::info!(
        model = spec.name,
        repo = spec.hf_repo,
        "downloading embedding model (first-time setup)"
    );

    if !model.exists()
        || std::fs::metadata(&model)
            .map(|m| m.len() < 1_000_000)
            .unwrap_or(true)
    {
        download_file(
            spec.model_url,
            &model,
            &format!("Downloading {} model", spec.name),
            Some(spec.approx_size_bytes),
        )?;
    }

    if !tokenizer.exists() {
        download_file(
            spec.tokenizer_url,
            &tokenizer,
            &format!("Downloading {} tokenizer", spec.name),
            None,
        )?;
    }

    // Stamp the cache directory for troubleshooting.
    let meta_path = dir.join("meta.json");
    let meta = serde_json::json!({
        "model": spec.name,
        "hf_repo": spec.hf_repo,
        "dimensions": spec.dimensions,
        "max_seq_length": spec.max_seq_length,
        "downloaded_at": chrono::Utc::now().to_rfc3339(),
    });
    if let Ok(content) = serde_json::to_string_pretty(&meta) {
        let _ = std::fs::write(&meta_path, content);
    }

    tracing::info!(
        model = spec.name,
        path = %model.display(),
        "embedding model ready"
    );

    Ok((model, tokenizer))
}

/// Download a file from a URL with a progress bar.
fn download_file(
    url: &str,
    dest: &Path,
    message: &str,
    expected_size: Option<u64>,
) -> KbResult<()> {
    // Stream to a temp file so a crash never leaves a corrupt model behind.
    let temp_path = dest.with_extension("downloading");

    let response = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| KbError::Internal(format!("HTTP client error: {e}")))?
        .get(url)
        .send()
        .map_err(|e| {
            KbError::ModelUnavailable {
                reason: format!(
                    "failed to download model from {url}: {e}\n\
                     Hint: check your internet connection, or pre-populate the model cache."
                ),
            }
        })?;

    if !response.status().is_success() {
        return Err(KbError::ModelUnavailable {
            reason: format!("model download failed: HTTP {} from {url}", response.status()),
        });
    }

    let total_size = response.content_length().or(expected_size).unwrap_or(0);

    let pb = if total_size > 0 {
        let pb = indicatif::ProgressBar::new(total_size);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{msg}\n  [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_message(message.to_string());
        pb
    } else {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_message(message.to_string());
        pb
    };

    let mut file = std::fs::File::create(&temp_path)?;
    let mut downloaded: u64 = 0;

    let bytes = response
        .bytes()
        .map_err(|e| KbError::Internal(format!("download stream error: {e}")))?;

    for chunk in bytes.chunks(8192) {
        file.write_all(chunk)?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }

    file.flush()?;
    drop(file);

    pb.finish_with_message(format!("{message} -- done"));

    // Atomic rename: temp -> final.
    std::fs::rename(&temp_path, dest)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_dir_structure() {
        let cache = Path::new("/tmp/kb-models");
        let dir = model_dir(cache, &DEFAULT_MODEL);
        assert!(dir.ends_with("all-MiniLM-L6-v2"));

        let model = model_path(cache, &DEFAULT_MODEL);
        assert!(model.ends_with("model.onnx"));

        let tokenizer = tokenizer_path(cache, &DEFAULT_MODEL);
        assert!(tokenizer.ends_with("tokenizer.json"));
    }

    #[test]
    fn test_models_do_not_collide_in_cache() {
        let cache = Path::new("/tmp/kb-models");
        assert_ne!(
            model_dir(cache, &DEFAULT_MODEL),
            model_dir(cache, &ALTERNATE_MODEL)
        );
    }

    #[test]
    fn test_resolve_known_names() {
        assert_eq!(resolve_model_spec("all-MiniLM-L6-v2").dimensions, 384);
        assert_eq!(resolve_model_spec("bge-small").name, "bge-small-en-v1.5");
    }

    #[test]
    fn test_resolve_unknown_falls_back_to_default() {
        let spec = resolve_model_spec("no-such-model");
        assert_eq!(spec.name, DEFAULT_MODEL.name);
    }

    #[test]
    fn test_model_not_ready_when_missing() {
        let dir = tempfile::tempdir().expect("create temp dir");
        assert!(!is_model_ready(dir.path(), &DEFAULT_MODEL));
    }

    #[test]
    fn test_default_model_constants() {
        assert_eq!(DEFAULT_MODEL.dimensions, 384);
        assert_eq!(DEFAULT_MODEL.max_seq_length, 256);
        assert!(DEFAULT_MODEL.model_url.starts_with("https://"));
        assert!(DEFAULT_MODEL.tokenizer_url.starts_with("https://"));
    }
}
