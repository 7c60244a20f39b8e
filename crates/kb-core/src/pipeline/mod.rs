//! Ingestion pipeline orchestrator.
//!
//! Composes Scanner → Converter → Chunker → Embedder → VectorStore
//! with bounded memory, partial-failure resilience, and progress
//! reporting.
//!
//! ## Protocol
//!
//! Re-ingestion replaces: an existing KB table is dropped before the
//! run starts. Files are processed in batches; conversions within a
//! batch run in parallel up to a bounded degree, per-file failures are
//! recorded and never abort the run, chunks whose embedding comes back
//! absent are dropped, and only store-write failures mark the run
//! failed. Cancellation is observed at batch boundaries; in-progress
//! batches run to completion and partial rows stay for the next
//! re-ingestion to clean up.
//!
//! ## Progress
//!
//! Each session owns a lossy broadcast channel: slow observers may miss
//! intermediate events but always see the terminal one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::chunker;
use crate::config::{ChunkerConfig, IngestionConfig};
use crate::convert::DocumentConverter;
use crate::embedder::TextEmbedder;
use crate::error::{KbError, KbResult};
use crate::scanner::{self, ScanOptions};
use crate::store::VectorStore;
use crate::types::{
    ChunkRow, DocChunk, FileEntry, IngestFileError, IngestPhase, IngestReport, ProgressEvent,
};

/// Capacity of each session's progress channel. Slow consumers fall
/// behind and miss intermediate events, which is fine; the channel
/// retains the most recent events so the terminal one gets through.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// A request to ingest one directory into one knowledgebase.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Target knowledgebase name.
    pub kb_name: String,
    /// Directory to ingest.
    pub root: PathBuf,
    /// Pre-created session id to report progress under; a fresh one is
    /// issued when absent.
    pub session_id: Option<String>,
    /// Cooperative cancellation signal, checked at batch boundaries.
    pub cancel: Option<CancellationToken>,
}

impl IngestRequest {
    /// Minimal request with defaults for session and cancellation.
    pub fn new(kb_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            kb_name: kb_name.into(),
            root: root.into(),
            session_id: None,
            cancel: None,
        }
    }
}

struct SessionState {
    sender: tokio::sync::broadcast::Sender<ProgressEvent>,
}

/// Orchestrates the full ingestion of a directory into a KB table.
pub struct IngestionPipeline {
    store: Arc<VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
    converter: Arc<dyn DocumentConverter>,
    ingestion: IngestionConfig,
    chunking: ChunkerConfig,
    /// KB names with an ingestion in flight; a second ingestion of the
    /// same name is a conflict.
    active: DashMap<String, ()>,
    /// Live progress sessions; destroyed on completion.
    sessions: DashMap<String, SessionState>,
    /// Issues strictly monotonic ingestion timestamps.
    last_ts: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl IngestionPipeline {
    /// Wire up a pipeline over explicitly-passed collaborators.
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn TextEmbedder>,
        converter: Arc<dyn DocumentConverter>,
        ingestion: IngestionConfig,
        chunking: ChunkerConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            converter,
            ingestion,
            chunking,
            active: DashMap::new(),
            sessions: DashMap::new(),
            last_ts: parking_lot::Mutex::new(None),
        }
    }

    /// Create a progress session ahead of an ingestion so the observer
    /// can subscribe before the first event fires.
    pub fn create_session(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, _) = tokio::sync::broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        self.sessions.insert(id.clone(), SessionState { sender });
        id
    }

    /// Subscribe to a session's progress events. `None` once the
    /// session has completed (sessions are transient, never persisted).
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> Option<tokio::sync::broadcast::Receiver<ProgressEvent>> {
        self.sessions
            .get(session_id)
            .map(|state| state.sender.subscribe())
    }

    /// Issue a fresh ingestion timestamp: ISO 8601 UTC, microsecond
    /// resolution, strictly greater than every previously issued one.
    fn next_ingestion_ts(&self) -> String {
        let mut last = self.last_ts.lock();
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    }

    /// Run a full ingestion. Always returns a report on completion,
    /// even with per-file errors; only store-write failures and setup
    /// problems surface as `Err`.
    pub async fn ingest(&self, request: IngestRequest) -> KbResult<IngestReport> {
        VectorStore::validate_kb_name(&request.kb_name)?;

        // Two concurrent ingestions of one KB are forbidden.
        if self.active.insert(request.kb_name.clone(), ()).is_some() {
            return Err(KbError::Conflict {
                details: format!(
                    "an ingestion for knowledgebase '{}' is already running",
                    request.kb_name
                ),
            });
        }
        let _guard = ActiveGuard {
            active: &self.active,
            kb_name: request.kb_name.clone(),
        };

        let session_id = match &request.session_id {
            Some(id) if self.sessions.contains_key(id) => id.clone(),
            _ => self.create_session(),
        };
        let cancel = request.cancel.clone().unwrap_or_default();

        let result = self
            .run(&request.kb_name, &request.root, &session_id, &cancel)
            .await;
        self.sessions.remove(&session_id);
        result
    }

    async fn run(
        &self,
        kb_name: &str,
        root: &Path,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> KbResult<IngestReport> {
        let start = Instant::now();
        let mut report = IngestReport::default();

        // Re-ingestion model: no incremental updates, drop and rebuild.
        if self.store.exists(kb_name)? {
            tracing::info!(kb = kb_name, "dropping existing table for re-ingestion");
            self.store.drop_table(kb_name)?;
        }

        let ingestion_ts = self.next_ingestion_ts();

        let scan_options = ScanOptions {
            max_file_bytes: self.ingestion.max_file_bytes,
            follow_symlinks: self.ingestion.follow_symlinks,
            extra_ignores: Vec::new(),
        };
        let scan_root = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || scanner::scan_root(&scan_root, &scan_options))
            .await
            .map_err(|e| KbError::Internal(format!("scan task failed: {e}")))??;

        let total = entries.len();
        self.emit(session_id, IngestPhase::Scanning, 0, total, None);
        tracing::info!(kb = kb_name, files = total, "scan complete");

        let mut table_created = false;
        let mut current = 0usize;

        for batch in entries.chunks(self.ingestion.batch_size.max(1)) {
            if cancel.is_cancelled() {
                tracing::info!(kb = kb_name, "ingestion cancelled at batch boundary");
                report.duration_ms = start.elapsed().as_millis() as u64;
                self.emit(session_id, IngestPhase::Cancelled, current, total, None);
                return Ok(report);
            }

            let outcome = self
                .process_batch(kb_name, root, batch, &ingestion_ts)
                .await;

            current += batch.len();
            report.files_processed += outcome.files_processed;
            report.files_skipped += outcome.files_skipped;
            report.errors.extend(outcome.errors);

            if !outcome.rows.is_empty() {
                let write = if table_created {
                    self.store.insert(kb_name, &outcome.rows)
                } else {
                    self.store.create_with_rows(kb_name, &outcome.rows)
                };
                if let Err(e) = write {
                    tracing::error!(kb = kb_name, error = %e, "store write failed, aborting run");
                    self.emit(session_id, IngestPhase::Failed, current, total, None);
                    return Err(e);
                }
                table_created = true;
                report.chunks_created += outcome.rows.len();
            }

            self.emit(
                session_id,
                IngestPhase::Processing,
                current,
                total,
                batch.last().map(|f| f.rel_path.to_string_lossy().to_string()),
            );
        }

        // Nothing produced rows: fix the schema with a placeholder so
        // the KB exists and searches return empty instead of missing.
        if !table_created {
            self.store
                .create_empty(kb_name, self.embedder.dimensions())?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.emit(session_id, IngestPhase::Completed, current, total, None);
        tracing::info!(
            kb = kb_name,
            files = report.files_processed,
            skipped = report.files_skipped,
            chunks = report.chunks_created,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Convert, chunk, and embed one batch of files. Store writes
    /// happen in the caller so create-vs-insert stays in one place.
    async fn process_batch(
        &self,
        kb_name: &str,
        root: &Path,
        batch: &[FileEntry],
        ingestion_ts: &str,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        // Bounded parallel conversion, order preserved.
        async fn convert_entry(
            entry: &FileEntry,
            converter: Arc<dyn DocumentConverter>,
        ) -> (&FileEntry, KbResult<crate::types::ConvertOutcome>) {
            let outcome = converter.convert(&entry.abs_path).await;
            (entry, outcome)
        }
        type ConvertOutput<'a> = (&'a FileEntry, KbResult<crate::types::ConvertOutcome>);
        let convert_futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = ConvertOutput<'_>> + Send + '_>>,
        > = batch
            .iter()
            .map(|entry| {
                Box::pin(convert_entry(entry, Arc::clone(&self.converter)))
                    as std::pin::Pin<Box<dyn std::future::Future<Output = ConvertOutput<'_>> + Send + '_>>
            })
            .collect();
        let conversions: Vec<_> = futures_util::stream::iter(convert_futures)
            .buffered(self.ingestion.max_concurrent_converts.max(1))
            .collect()
            .await;

        // Chunk each converted file on a worker thread.
        let mut chunked: Vec<(&FileEntry, Vec<DocChunk>)> = Vec::new();
        for (entry, conversion) in conversions {
            let converted = match conversion {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        path = %entry.rel_path.display(),
                        error = %e,
                        "conversion failed, skipping file"
                    );
                    outcome.errors.push(IngestFileError {
                        path: entry.rel_path.to_string_lossy().to_string(),
                        message: e.to_string(),
                    });
                    outcome.files_skipped += 1;
                    continue;
                }
            };

            let options = self.chunking.clone();
            let chunks = tokio::task::spawn_blocking(move || {
                chunker::chunk_document(&converted.markdown, converted.structured.as_ref(), &options)
            })
            .await
            .unwrap_or_default();

            if chunks.is_empty() {
                tracing::debug!(path = %entry.rel_path.display(), "no chunks produced, skipping");
                outcome.files_skipped += 1;
                continue;
            }
            chunked.push((entry, chunks));
        }

        // Embed every chunk text of the batch in one aligned call.
        let texts: Vec<String> = chunked
            .iter()
            .flat_map(|(_, chunks)| chunks.iter().map(|c| c.content.clone()))
            .collect();
        if texts.is_empty() {
            return outcome;
        }
        let embeddings = self.embedder.embed_many(&texts).await;

        // A batch where nothing embedded is a batch-level failure (model
        // unreachable): its files go to errors, the run continues.
        if embeddings.iter().all(Option::is_none) {
            tracing::warn!(
                kb = kb_name,
                files = chunked.len(),
                "no embeddings produced for batch, recording files as failed"
            );
            for (entry, _) in &chunked {
                outcome.errors.push(IngestFileError {
                    path: entry.rel_path.to_string_lossy().to_string(),
                    message: "embedding failed for every chunk in batch".into(),
                });
                outcome.files_skipped += 1;
            }
            return outcome;
        }

        let mut cursor = 0usize;
        for (entry, chunks) in chunked {
            let mut stored_any = false;
            for chunk in chunks {
                let embedding = embeddings.get(cursor).cloned().flatten();
                cursor += 1;
                let Some(vector) = embedding else {
                    tracing::warn!(
                        path = %entry.rel_path.display(),
                        ordinal = chunk.ordinal,
                        "chunk failed to embed, dropping"
                    );
                    continue;
                };
                outcome.rows.push(ChunkRow {
                    id: format!("{kb_name}_{ingestion_ts}_{}", chunk.ordinal),
                    vector,
                    content: chunk.content,
                    source_path: entry.rel_path.to_string_lossy().to_string(),
                    ordinal: chunk.ordinal,
                    token_count: chunk.token_count,
                    chunk_kind: chunk.kind,
                    heading_path: chunk.heading_path,
                    source_kind: entry.kind,
                    is_test: entry.is_test,
                    ingestion_ts: ingestion_ts.to_string(),
                    kb_name: kb_name.to_string(),
                    source_root: root.to_string_lossy().to_string(),
                    is_placeholder: false,
                });
                stored_any = true;
            }
            if stored_any {
                outcome.files_processed += 1;
            } else {
                outcome.files_skipped += 1;
            }
        }

        outcome
    }

    fn emit(
        &self,
        session_id: &str,
        phase: IngestPhase,
        current: usize,
        total: usize,
        current_file: Option<String>,
    ) {
        if let Some(state) = self.sessions.get(session_id) {
            // Send errors just mean nobody is listening.
            let _ = state.sender.send(ProgressEvent {
                session_id: session_id.to_string(),
                phase,
                current,
                total,
                current_file,
            });
        }
    }
}

/// Rows and counters produced by one batch.
#[derive(Default)]
struct BatchOutcome {
    rows: Vec<ChunkRow>,
    files_processed: usize,
    files_skipped: usize,
    errors: Vec<IngestFileError>,
}

/// Removes the KB from the active set even when ingestion errors out.
struct ActiveGuard<'a> {
    active: &'a DashMap<String, ()>,
    kb_name: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.kb_name);
    }
}
