//! Local embedding inference over ONNX Runtime.
//!
//! The model is loaded lazily, exactly once per process, on the first
//! embed call. Initialization is guarded so concurrent first callers
//! race safely: one wins and installs the instance, the rest observe
//! it. A failed initialization is reported to the caller and retried on
//! the next call.
//!
//! ## Failure Handling
//!
//! `embed_one` fails on empty input or model errors. `embed_many` never
//! fails as a whole: it returns one `Option<Vec<f32>>` per input,
//! aligned with the input order, with `None` in the positions where
//! embedding failed. The ingestion pipeline drops those chunks and
//! continues; aborting a whole batch over one bad chunk is not
//! acceptable.

pub mod model_manager;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ort::session::Session;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, KbResult};
use crate::vector::l2_normalize;

pub use model_manager::{ModelSpec, ALTERNATE_MODEL, DEFAULT_MODEL};

/// Operations slower than this are logged at warning level.
const SLOW_OP_THRESHOLD: Duration = Duration::from_millis(500);

/// Text-to-vector embedding capability.
///
/// Implemented by [`OnnxEmbedder`] in production and by
/// [`HashingEmbedder`] for deterministic offline tests.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed a single text. Fails on empty input or model errors.
    async fn embed_one(&self, text: &str) -> KbResult<Vec<f32>>;

    /// Embed a batch. Never fails as a whole; the result is aligned
    /// with the input, `None` where embedding failed.
    async fn embed_many(&self, texts: &[String]) -> Vec<Option<Vec<f32>>>;

    /// The fixed output dimension of this embedder.
    fn dimensions(&self) -> usize;
}

/// ONNX Runtime embedder with one-time lazy model loading.
pub struct OnnxEmbedder {
    config: EmbeddingConfig,
    cache_dir: PathBuf,
    /// Installed by whichever caller wins the initialization race.
    /// Load failures leave the cell empty so later calls retry.
    model: tokio::sync::OnceCell<Arc<LoadedModel>>,
}

/// The loaded model plus tokenizer; shared read-only after init.
/// `Session::run` needs `&mut self`, hence the mutex.
struct LoadedModel {
    session: parking_lot::Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    max_seq_length: usize,
    batch_size: usize,
}

impl OnnxEmbedder {
    /// Create an embedder. The model is not touched until the first
    /// embed call.
    pub fn new(config: &EmbeddingConfig, cache_dir: PathBuf) -> Self {
        Self {
            config: config.clone(),
            cache_dir,
            model: tokio::sync::OnceCell::new(),
        }
    }

    /// Load-or-reuse the model instance.
    async fn model(&self) -> KbResult<Arc<LoadedModel>> {
        let config = self.config.clone();
        let cache_dir = self.cache_dir.clone();
        self.model
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || Self::load(&config, &cache_dir))
                    .await
                    .map_err(|e| KbError::Internal(format!("model load task failed: {e}")))?
            })
            .await
            .map(Arc::clone)
    }

    /// Blocking model load: resolve the spec, download if missing,
    /// build the session and tokenizer.
    fn load(config: &EmbeddingConfig, cache_dir: &std::path::Path) -> KbResult<Arc<LoadedModel>> {
        let spec = model_manager::resolve_model_spec(&config.model);
        let (model_path, tokenizer_path) = model_manager::ensure_model(cache_dir, spec)?;

        let session = Session::builder()
            .map_err(|e| KbError::ModelUnavailable {
                reason: format!("failed to create ONNX session builder: {e}"),
            })?
            .commit_from_file(&model_path)
            .map_err(|e| KbError::ModelUnavailable {
                reason: format!("failed to load {}: {e}", model_path.display()),
            })?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            KbError::ModelUnavailable {
                reason: format!("failed to load tokenizer {}: {e}", tokenizer_path.display()),
            }
        })?;

        tracing::info!(
            model = spec.name,
            dimensions = spec.dimensions,
            "loaded ONNX embedding model"
        );

        Ok(Arc::new(LoadedModel {
            session: parking_lot::Mutex::new(session),
            tokenizer,
            max_seq_length: config.max_seq_length.min(spec.max_seq_length),
            batch_size: config.batch_size,
        }))
    }
}

#[async_trait]
impl TextEmbedder for OnnxEmbedder {
    async fn embed_one(&self, text: &str) -> KbResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KbError::Embed {
                message: "cannot embed empty text".into(),
            });
        }

        let model = self.model().await?;
        let owned = text.to_string();
        let start = Instant::now();

        let mut result = tokio::task::spawn_blocking(move || {
            let mut session = model.session.lock();
            model.run_inference(&mut session, &[owned])
        })
        .await
        .map_err(|e| KbError::Internal(format!("embedding task failed: {e}")))??;

        warn_if_slow("embed_one", start.elapsed(), 1);

        result.pop().ok_or_else(|| KbError::Embed {
            message: "inference returned no output".into(),
        })
    }

    async fn embed_many(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let model = match self.model().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, count = texts.len(), "model unavailable, skipping batch");
                return vec![None; texts.len()];
            }
        };

        let owned: Vec<String> = texts.to_vec();
        let count = owned.len();
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let mut session = model.session.lock();
            let mut all = Vec::with_capacity(owned.len());

            for batch in owned.chunks(model.batch_size) {
                match model.run_inference(&mut session, batch) {
                    Ok(embeddings) => all.extend(embeddings.into_iter().map(Some)),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "batch inference failed; retrying inputs individually"
                        );
                        for text in batch {
                            match model.run_inference(&mut session, std::slice::from_ref(text)) {
                                Ok(mut single) => all.push(single.pop()),
                                Err(item_err) => {
                                    tracing::warn!(error = %item_err, "input failed to embed; skipping");
                                    all.push(None);
                                }
                            }
                        }
                    }
                }
            }

            all
        })
        .await;

        warn_if_slow("embed_many", start.elapsed(), count);

        match result {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(error = %e, "embedding task panicked");
                vec![None; count]
            }
        }
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }
}

/// Token matrices for one forward pass: row-major, one fixed-width row
/// per input text, zero-padded past each text's real length.
struct TokenMatrix {
    ids: Vec<i64>,
    attention: Vec<i64>,
    segments: Vec<i64>,
    rows: usize,
    width: usize,
}

impl TokenMatrix {
    fn zeroed(rows: usize, width: usize) -> Self {
        Self {
            ids: vec![0; rows * width],
            attention: vec![0; rows * width],
            segments: vec![0; rows * width],
            rows,
            width,
        }
    }

    fn attention_row(&self, row: usize) -> &[i64] {
        &self.attention[row * self.width..(row + 1) * self.width]
    }
}

impl LoadedModel {
    /// Tokenize a batch into a fixed-width matrix, truncating at the
    /// model window. Padding is implicit: the matrix starts zeroed and
    /// only the real tokens are written.
    fn tokenize(&self, texts: &[String]) -> KbResult<TokenMatrix> {
        let mut matrix = TokenMatrix::zeroed(texts.len(), self.max_seq_length);

        for (row, text) in texts.iter().enumerate() {
            let encoding =
                self.tokenizer
                    .encode(text.as_str(), true)
                    .map_err(|e| KbError::Embed {
                        message: format!("tokenization error: {e}"),
                    })?;

            let base = row * matrix.width;
            let kept = encoding.get_ids().len().min(matrix.width);
            for slot in 0..kept {
                matrix.ids[base + slot] = i64::from(encoding.get_ids()[slot]);
                matrix.attention[base + slot] = i64::from(encoding.get_attention_mask()[slot]);
                matrix.segments[base + slot] = i64::from(encoding.get_type_ids()[slot]);
            }
        }

        Ok(matrix)
    }

    /// One forward pass over a batch, pooled and normalized to a single
    /// vector per input text.
    fn run_inference(&self, session: &mut Session, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
        let matrix = self.tokenize(texts)?;
        let feed_shape = [matrix.rows as i64, matrix.width as i64];

        use std::borrow::Cow;
        let mut feeds: Vec<(Cow<'_, str>, ort::session::SessionInputValue<'_>)> =
            Vec::with_capacity(3);
        feeds.push((
            Cow::Borrowed("input_ids"),
            feed_tensor(&feed_shape, matrix.ids.clone())?,
        ));
        feeds.push((
            Cow::Borrowed("attention_mask"),
            feed_tensor(&feed_shape, matrix.attention.clone())?,
        ));
        // Segment ids exist only in BERT-family graphs; feed them only
        // when the model declares the input.
        if session
            .inputs()
            .iter()
            .any(|input| input.name() == "token_type_ids")
        {
            feeds.push((
                Cow::Borrowed("token_type_ids"),
                feed_tensor(&feed_shape, matrix.segments.clone())?,
            ));
        }

        let first_output = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .ok_or_else(|| KbError::Internal("model declares no outputs".into()))?;

        let run = session.run(feeds).map_err(|e| KbError::Embed {
            message: format!("ONNX inference error: {e}"),
        })?;
        let value = run
            .get(&first_output)
            .ok_or_else(|| KbError::Internal("inference produced no output tensor".into()))?;
        let (raw_shape, hidden) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| KbError::Internal(format!("output extraction error: {e}")))?;
        let shape: Vec<usize> = raw_shape.iter().map(|&d| d as usize).collect();

        let mut vectors: Vec<Vec<f32>> = match shape.as_slice() {
            // Token-level hidden states: pool each row under its mask.
            &[_, seq_len, dim] => {
                let row_stride = seq_len * dim;
                (0..matrix.rows)
                    .map(|row| {
                        attended_mean(
                            &hidden[row * row_stride..(row + 1) * row_stride],
                            matrix.attention_row(row),
                            dim,
                        )
                    })
                    .collect()
            }
            // The graph pooled already; rows come back sentence-level.
            &[_, dim] => hidden.chunks_exact(dim).map(|row| row.to_vec()).collect(),
            _ => {
                return Err(KbError::Internal(format!(
                    "unexpected output tensor shape: {shape:?}"
                )))
            }
        };

        for vector in &mut vectors {
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// Wrap a flat i64 buffer as a session input tensor.
fn feed_tensor(
    shape: &[i64],
    data: Vec<i64>,
) -> KbResult<ort::session::SessionInputValue<'static>> {
    let tensor = ort::value::Tensor::from_array((shape.to_vec(), data))
        .map_err(|e| KbError::Internal(format!("ONNX tensor error: {e}")))?;
    Ok(ort::session::SessionInputValue::from(tensor))
}

/// Mean of the token vectors whose attention flag is set. Rows with no
/// attended tokens (fully padded) pool to zeros rather than NaN.
fn attended_mean(row_states: &[f32], attention: &[i64], dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; dim];
    let mut attended = 0.0f32;

    for (token, &flag) in row_states.chunks_exact(dim).zip(attention) {
        if flag == 0 {
            continue;
        }
        attended += 1.0;
        for (acc, component) in pooled.iter_mut().zip(token) {
            *acc += component;
        }
    }

    if attended > 0.0 {
        for component in &mut pooled {
            *component /= attended;
        }
    }
    pooled
}

/// Log operations that exceed the slow-op threshold.
fn warn_if_slow(op: &str, elapsed: Duration, input_count: usize) {
    if elapsed > SLOW_OP_THRESHOLD {
        tracing::warn!(
            op,
            elapsed_ms = elapsed.as_millis() as u64,
            inputs = input_count,
            "slow embedding operation"
        );
    }
}

// ---------------------------------------------------------------------------
// Deterministic embedder for tests and offline development
// ---------------------------------------------------------------------------

/// Bag-of-words hashing embedder. Deterministic and model-free: each
/// lowercase token hashes into a bucket of the output vector, which is
/// then L2-normalized. Texts sharing words land near each other, which
/// is all pipeline and search tests need.
pub struct HashingEmbedder {
    dimensions: usize,
    /// When set, inputs containing this marker fail to embed. Lets
    /// tests exercise batch-resilience paths.
    poison_marker: Option<String>,
}

impl HashingEmbedder {
    /// Create a hashing embedder with the given output dimension.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            poison_marker: None,
        }
    }

    /// Fail any input containing `marker`, for failure-path tests.
    pub fn with_poison_marker(dimensions: usize, marker: &str) -> Self {
        Self {
            dimensions,
            poison_marker: Some(marker.to_string()),
        }
    }

    fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        if let Some(marker) = &self.poison_marker {
            if text.contains(marker.as_str()) {
                return None;
            }
        }
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket =
                (xxhash_rust::xxh3::xxh3_64(token.to_lowercase().as_bytes()) as usize)
                    % self.dimensions;
            vector[bucket] += 1.0;
        }
        l2_normalize(&mut vector);
        Some(vector)
    }
}

#[async_trait]
impl TextEmbedder for HashingEmbedder {
    async fn embed_one(&self, text: &str) -> KbResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KbError::Embed {
                message: "cannot embed empty text".into(),
            });
        }
        self.embed_text(text).ok_or_else(|| KbError::Embed {
            message: "input rejected".into(),
        })
    }

    async fn embed_many(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed_one("hello world").await.expect("embed");
        let b = embedder.embed_one("hello world").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_hashing_embedder_similar_texts_are_close() {
        let embedder = HashingEmbedder::new(64);
        let hello = embedder.embed_one("hello world").await.expect("embed");
        let hello2 = embedder.embed_one("Hello world again").await.expect("embed");
        let other = embedder.embed_one("entirely unrelated topic").await.expect("embed");
        let close = crate::vector::l2_distance(&hello, &hello2);
        let far = crate::vector::l2_distance(&hello, &other);
        assert!(close < far);
    }

    #[tokio::test]
    async fn test_embed_one_rejects_empty() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_one("   ").await.is_err());
    }

    #[tokio::test]
    async fn test_embed_many_alignment_with_failures() {
        let embedder = HashingEmbedder::with_poison_marker(16, "POISON");
        let texts = vec![
            "good one".to_string(),
            "POISON pill".to_string(),
            "good two".to_string(),
        ];
        let results = embedder.embed_many(&texts).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_some());
    }

    #[tokio::test]
    async fn test_dimensions_are_consistent_across_calls() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed_one("first call").await.expect("embed");
        let b = embedder.embed_one("second call entirely different").await.expect("embed");
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), embedder.dimensions());
    }

    #[test]
    fn test_attended_mean_ignores_padded_tokens() {
        // Two attended tokens, one padding token that must not count.
        let states = [1.0, 3.0, 5.0, 7.0, 100.0, 100.0];
        let attention = [1i64, 1, 0];
        assert_eq!(attended_mean(&states, &attention, 2), vec![3.0, 5.0]);
    }

    #[test]
    fn test_attended_mean_of_fully_padded_row_is_zero() {
        let states = [4.0, 4.0];
        assert_eq!(attended_mean(&states, &[0i64], 2), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_onnx_embedder_reports_unavailable_without_model() {
        // No model cached and downloads suppressed: embed_one must fail
        // with ModelUnavailable, embed_many must yield aligned Nones.
        std::env::set_var("KB_SKIP_MODEL_DOWNLOAD", "1");
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = EmbeddingConfig::default();
        let embedder = OnnxEmbedder::new(&config, dir.path().to_path_buf());

        let single = embedder.embed_one("some text").await;
        assert!(matches!(single, Err(KbError::ModelUnavailable { .. })));

        let many = embedder
            .embed_many(&["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(many, vec![None, None]);
    }
}
