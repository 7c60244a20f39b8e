//! Semantic search over knowledgebase tables.
//!
//! Embeds the query, fans KNN out over the target tables, merges and
//! ranks globally, and shapes the rows into result records. A
//! fingerprint-keyed cache in front of the whole thing absorbs repeat
//! queries; it is a layer over the engine, not a concern of the store.
//!
//! ## Ranking
//!
//! Results come back in strictly descending similarity
//! (`1 / (1 + l2_distance)`, monotonic and order-preserving); ties
//! break by ascending KB name, then source path, then ordinal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::embedder::TextEmbedder;
use crate::error::{KbError, KbResult};
use crate::store::{RowFilter, ScoredRow, VectorStore};
use crate::types::{SearchHit, SearchResponse, SourceKind};

/// Hard ceiling on `max_results`, matching the dispatch schema bound.
pub const MAX_RESULTS_CEILING: usize = 200;

/// A search request after transport-level parsing.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Query text; must be non-empty after trimming.
    pub query: String,
    /// Restrict the search to one knowledgebase.
    pub kb_filter: Option<String>,
    /// Restrict to one source document type.
    pub type_filter: Option<SourceKind>,
    /// Drop chunks from test-looking paths.
    pub exclude_tests: bool,
    /// Result cap; clamped to `[1, 200]`, engine default when absent.
    pub max_results: Option<usize>,
}

struct CacheEntry {
    response: SearchResponse,
    created: Instant,
}

/// Query embedding + vector search + filtering + result cache.
pub struct SearchEngine {
    store: Arc<VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
    default_max_results: usize,
    cache_ttl: Duration,
    cache: DashMap<u64, CacheEntry>,
}

impl SearchEngine {
    /// Wire up a search engine over explicitly-passed collaborators.
    /// A zero TTL disables the cache entirely.
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn TextEmbedder>,
        default_max_results: usize,
        cache_ttl_ms: u64,
    ) -> Self {
        Self {
            store,
            embedder,
            default_max_results,
            cache_ttl: Duration::from_millis(cache_ttl_ms),
            cache: DashMap::new(),
        }
    }

    /// Execute a search.
    pub async fn search(&self, request: &SearchRequest) -> KbResult<SearchResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(KbError::InvalidInput {
                details: "query must not be empty".into(),
            });
        }
        let max_results = request
            .max_results
            .unwrap_or(self.default_max_results)
            .clamp(1, MAX_RESULTS_CEILING);

        let fingerprint = Self::fingerprint(query, request, max_results);
        if let Some(cached) = self.cache_lookup(fingerprint) {
            tracing::debug!(fingerprint, "search cache hit");
            return Ok(cached);
        }

        let start = Instant::now();
        let query_vector = self.embedder.embed_one(query).await?;

        let targets = self.resolve_targets(request.kb_filter.as_deref())?;
        let filter = RowFilter {
            document_type: request.type_filter,
            exclude_tests: request.exclude_tests,
            ..RowFilter::default()
        };

        let mut merged: Vec<ScoredRow> = Vec::new();
        for kb_name in &targets {
            match self.store.knn(kb_name, &query_vector, max_results, &filter) {
                Ok(hits) => merged.extend(hits),
                Err(e) => {
                    tracing::warn!(kb = %kb_name, error = %e, "table search failed, continuing");
                }
            }
        }

        merged.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.row.kb_name.cmp(&b.row.kb_name))
                .then_with(|| a.row.source_path.cmp(&b.row.source_path))
                .then_with(|| a.row.ordinal.cmp(&b.row.ordinal))
        });

        let total = merged.len();
        merged.truncate(max_results);

        let results: Vec<SearchHit> = merged
            .into_iter()
            .map(|scored| SearchHit {
                source_path: scored.row.source_path,
                ordinal: scored.row.ordinal,
                content: scored.row.content,
                chunk_kind: scored.row.chunk_kind,
                source_kind: scored.row.source_kind,
                heading_path: scored.row.heading_path,
                is_test: scored.row.is_test,
                similarity: 1.0 / (1.0 + scored.distance),
                kb_name: scored.row.kb_name,
            })
            .collect();

        let response = SearchResponse {
            results,
            total,
            query_ms: start.elapsed().as_millis() as u64,
        };

        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                fingerprint,
                CacheEntry {
                    response: response.clone(),
                    created: Instant::now(),
                },
            );
        }

        Ok(response)
    }

    /// Drop every cached entry. Callers that mutate the store out of
    /// band use this; after it returns no search serves a pre-clear
    /// entry.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of live cache entries (for tests and diagnostics).
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Stable fingerprint of the full input tuple.
    fn fingerprint(query: &str, request: &SearchRequest, max_results: usize) -> u64 {
        let key = format!(
            "{query}\u{1}{}\u{1}{}\u{1}{}\u{1}{max_results}",
            request.kb_filter.as_deref().unwrap_or(""),
            request.type_filter.map(|t| t.as_str()).unwrap_or(""),
            request.exclude_tests,
        );
        xxhash_rust::xxh3::xxh3_64(key.as_bytes())
    }

    /// Return a cached response within TTL; expired entries are evicted
    /// lazily here.
    fn cache_lookup(&self, fingerprint: u64) -> Option<SearchResponse> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let expired = match self.cache.get(&fingerprint) {
            Some(entry) if entry.created.elapsed() <= self.cache_ttl => {
                let mut response = entry.response.clone();
                response.query_ms = 0;
                return Some(response);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cache.remove(&fingerprint);
        }
        None
    }

    /// The logical KB names to search: just the filter when set (an
    /// unknown name yields no targets, hence empty results), otherwise
    /// every current-version table.
    fn resolve_targets(&self, kb_filter: Option<&str>) -> KbResult<Vec<String>> {
        if let Some(kb) = kb_filter {
            return if self.store.open(kb)?.is_some() {
                Ok(vec![kb.to_string()])
            } else {
                Ok(Vec::new())
            };
        }
        let mut targets = Vec::new();
        for table in self.store.list_tables()? {
            if let Some(name) = self.store.logical_name(&table)? {
                targets.push(name);
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;
    use crate::types::{ChunkKind, ChunkRow};

    const DIM: usize = 48;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<VectorStore>,
        embedder: Arc<HashingEmbedder>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = Arc::new(VectorStore::open_at(dir.path()).expect("open store"));
            Self {
                _dir: dir,
                store,
                embedder: Arc::new(HashingEmbedder::new(DIM)),
            }
        }

        fn engine(&self, ttl_ms: u64) -> SearchEngine {
            SearchEngine::new(
                Arc::clone(&self.store),
                Arc::clone(&self.embedder) as Arc<dyn TextEmbedder>,
                50,
                ttl_ms,
            )
        }

        async fn row(&self, kb: &str, path: &str, ordinal: u32, content: &str) -> ChunkRow {
            let vector = self.embedder.embed_one(content).await.expect("embed");
            ChunkRow {
                id: format!("{kb}_2025-06-01T00:00:00.000000Z_{path}_{ordinal}"),
                vector,
                content: content.to_string(),
                source_path: path.to_string(),
                ordinal,
                token_count: 5,
                chunk_kind: ChunkKind::Section,
                heading_path: vec![],
                source_kind: if path.ends_with(".pdf") {
                    SourceKind::Pdf
                } else {
                    SourceKind::Markdown
                },
                is_test: crate::scanner::is_test_path(std::path::Path::new(path)),
                ingestion_ts: "2025-06-01T00:00:00.000000Z".into(),
                kb_name: kb.to_string(),
                source_root: "/root".into(),
                is_placeholder: false,
            }
        }
    }

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            ..SearchRequest::default()
        }
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let fx = Fixture::new();
        let engine = fx.engine(0);
        let err = engine.search(&request("   ")).await.expect_err("must fail");
        assert!(matches!(err, KbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_best_match_ranks_first() {
        let fx = Fixture::new();
        let rows = vec![
            fx.row("demo", "a.md", 0, "hello world greeting text").await,
            fx.row("demo", "b.md", 0, "entirely unrelated database tuning notes")
                .await,
        ];
        fx.store.create_with_rows("demo", &rows).expect("create");

        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "hello".into(),
                kb_filter: Some("demo".into()),
                ..SearchRequest::default()
            })
            .await
            .expect("search");

        assert_eq!(response.total, 2);
        assert_eq!(response.results[0].source_path, "a.md");
        assert!(response.results[0].similarity > response.results[1].similarity);
        assert!(response.results.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));
    }

    #[tokio::test]
    async fn test_results_strictly_ordered_with_tie_breaks() {
        let fx = Fixture::new();
        // Identical content in two KBs: similarity ties, kb name breaks.
        let a = vec![fx.row("aaa", "z.md", 1, "alpha beta gamma").await];
        let b = vec![fx.row("bbb", "a.md", 0, "alpha beta gamma").await];
        fx.store.create_with_rows("aaa", &a).expect("create");
        fx.store.create_with_rows("bbb", &b).expect("create");

        let engine = fx.engine(0);
        let response = engine.search(&request("alpha beta gamma")).await.expect("search");
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].kb_name, "aaa");
        assert_eq!(response.results[1].kb_name, "bbb");
        for pair in response.results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[tokio::test]
    async fn test_exclude_tests_filter() {
        let fx = Fixture::new();
        let rows = vec![
            fx.row("kb", "src/foo.md", 0, "alpha content for searching").await,
            fx.row("kb", "tests/bar.md", 0, "alpha content for searching").await,
        ];
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "alpha".into(),
                exclude_tests: true,
                ..SearchRequest::default()
            })
            .await
            .expect("search");

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].source_path, "src/foo.md");
        assert!(!response.results[0].is_test);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let fx = Fixture::new();
        let rows = vec![
            fx.row("kb", "doc.pdf", 0, "quarterly report numbers").await,
            fx.row("kb", "doc.md", 0, "quarterly report numbers").await,
        ];
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "quarterly report".into(),
                type_filter: Some(SourceKind::Pdf),
                ..SearchRequest::default()
            })
            .await
            .expect("search");

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].source_kind, SourceKind::Pdf);
    }

    #[tokio::test]
    async fn test_max_results_clamped() {
        let fx = Fixture::new();
        let mut rows = Vec::new();
        for i in 0..5 {
            rows.push(fx.row("kb", &format!("f{i}.md"), 0, "common words everywhere").await);
        }
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "common words".into(),
                max_results: Some(2),
                ..SearchRequest::default()
            })
            .await
            .expect("search");
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.total, 5);

        // A request over the ceiling is clamped, not rejected.
        let response = engine
            .search(&SearchRequest {
                query: "common words".into(),
                max_results: Some(100_000),
                ..SearchRequest::default()
            })
            .await
            .expect("search");
        assert_eq!(response.results.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_kb_filter_returns_empty() {
        let fx = Fixture::new();
        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "anything".into(),
                kb_filter: Some("ghost".into()),
                ..SearchRequest::default()
            })
            .await
            .expect("search");
        assert!(response.results.is_empty());
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn test_placeholders_never_surface() {
        let fx = Fixture::new();
        fx.store.create_empty("empty", DIM).expect("create empty");

        let engine = fx.engine(0);
        let response = engine
            .search(&SearchRequest {
                query: "anything at all".into(),
                kb_filter: Some("empty".into()),
                ..SearchRequest::default()
            })
            .await
            .expect("search");
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let fx = Fixture::new();
        let rows = vec![fx.row("kb", "a.md", 0, "cached content body").await];
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(60_000);
        let first = engine.search(&request("cached content")).await.expect("search");
        assert_eq!(engine.cache_len(), 1);

        let second = engine.search(&request("cached content")).await.expect("search");
        assert_eq!(second.results, first.results);
        assert_eq!(second.query_ms, 0);

        // Different inputs miss.
        let _ = engine
            .search(&SearchRequest {
                query: "cached content".into(),
                exclude_tests: true,
                ..SearchRequest::default()
            })
            .await
            .expect("search");
        assert_eq!(engine.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_cache_expires_and_clear_cache_works() {
        let fx = Fixture::new();
        let rows = vec![fx.row("kb", "a.md", 0, "expiring content body").await];
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(30);
        engine.search(&request("expiring content")).await.expect("search");
        assert_eq!(engine.cache_len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Expired entry is evicted lazily on the next read.
        let recomputed = engine.search(&request("expiring content")).await.expect("search");
        assert_eq!(recomputed.results.len(), 1);

        engine.clear_cache();
        assert_eq!(engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let fx = Fixture::new();
        let rows = vec![fx.row("kb", "a.md", 0, "uncached content").await];
        fx.store.create_with_rows("kb", &rows).expect("create");

        let engine = fx.engine(0);
        engine.search(&request("uncached content")).await.expect("search");
        assert_eq!(engine.cache_len(), 0);
    }
}
