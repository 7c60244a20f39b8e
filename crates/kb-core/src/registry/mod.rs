//! Knowledgebase enumeration and lifecycle management.
//!
//! Thin layer over the store: lists known tables with their summary
//! counts, computes per-KB statistics in one scan, and implements
//! rename (copy rows, drop old), delete, and per-ingestion deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::store::{Projection, RowFilter, VectorStore};

/// Row cap for the bounded distinct-file sample in `list`.
const FILE_COUNT_SAMPLE_LIMIT: usize = 10_000;

/// Summary line for one knowledgebase, as shown in listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseSummary {
    /// Logical knowledgebase name.
    pub name: String,
    /// Non-placeholder row count.
    pub chunk_count: usize,
    /// Distinct source files (bounded sample on large tables).
    pub file_count: usize,
    /// Most recent ingestion timestamp, if any rows exist.
    pub last_ingestion: Option<String>,
    /// Physical table name backing this KB.
    pub path: String,
}

/// Full statistics for one knowledgebase, computed in a single scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    /// Logical knowledgebase name.
    pub name: String,
    /// Non-placeholder row count.
    pub chunk_count: usize,
    /// Distinct source files.
    pub file_count: usize,
    /// Total content payload in bytes.
    pub total_content_bytes: usize,
    /// Chunk count per chunk kind.
    pub chunk_kinds: BTreeMap<String, usize>,
    /// Most recent ingestion timestamp, if any rows exist.
    pub latest_ingestion: Option<String>,
}

/// Enumerates and manages knowledgebases.
pub struct KnowledgeBaseRegistry {
    store: Arc<VectorStore>,
}

impl KnowledgeBaseRegistry {
    /// Wire up a registry over the shared store.
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self { store }
    }

    /// List all knowledgebases under the current schema version with
    /// summary counts.
    pub fn list(&self) -> KbResult<Vec<KnowledgeBaseSummary>> {
        let mut out = Vec::new();
        for table in self.store.list_tables()? {
            let Some(name) = self.store.logical_name(&table)? else {
                continue;
            };
            let chunk_count = self.store.count(&name, &RowFilter::default())?;
            let file_count = self
                .store
                .source_file_count(&name, FILE_COUNT_SAMPLE_LIMIT)?;
            let last_ingestion = self.store.latest_ingestion(&name)?;
            out.push(KnowledgeBaseSummary {
                name,
                chunk_count,
                file_count,
                last_ingestion,
                path: table,
            });
        }
        Ok(out)
    }

    /// Full statistics for one knowledgebase.
    pub fn stats(&self, kb_name: &str) -> KbResult<KnowledgeBaseStats> {
        let rows = self
            .store
            .scan(kb_name, &RowFilter::default(), Projection::Metadata)?;

        let mut chunk_kinds: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_content_bytes = 0usize;
        let mut files: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut latest_ingestion: Option<String> = None;

        for row in &rows {
            *chunk_kinds
                .entry(row.chunk_kind.as_str().to_string())
                .or_insert(0) += 1;
            total_content_bytes += row.content.len();
            files.insert(row.source_path.as_str());
            if latest_ingestion.as_deref() < Some(row.ingestion_ts.as_str()) {
                latest_ingestion = Some(row.ingestion_ts.clone());
            }
        }

        Ok(KnowledgeBaseStats {
            name: kb_name.to_string(),
            chunk_count: rows.len(),
            file_count: files.len(),
            total_content_bytes,
            chunk_kinds,
            latest_ingestion,
        })
    }

    /// Rename a knowledgebase: copy every row (placeholders included)
    /// into a table under the new name with the owner field rewritten,
    /// then drop the old table. Fails when the new name is taken.
    pub fn rename(&self, old: &str, new: &str) -> KbResult<()> {
        VectorStore::validate_kb_name(new)?;
        if self.store.open(old)?.is_none() {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{old}'"),
            });
        }
        if self.store.open(new)?.is_some() {
            return Err(KbError::Conflict {
                details: format!("knowledgebase '{new}' already exists"),
            });
        }

        let mut rows = self.store.scan(
            old,
            &RowFilter {
                include_placeholders: true,
                ..RowFilter::default()
            },
            Projection::All,
        )?;
        for row in &mut rows {
            row.kb_name = new.to_string();
        }

        self.store.create_with_rows(new, &rows)?;
        self.store.drop_table(old)?;
        tracing::info!(from = old, to = new, rows = rows.len(), "renamed knowledgebase");
        Ok(())
    }

    /// Delete a knowledgebase and all its chunks.
    pub fn delete(&self, kb_name: &str) -> KbResult<()> {
        if self.store.open(kb_name)?.is_none() {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        self.store.drop_table(kb_name)?;
        tracing::info!(kb = kb_name, "deleted knowledgebase");
        Ok(())
    }

    /// Remove every row of one ingestion; returns the removed count.
    pub fn delete_ingestion(&self, kb_name: &str, ingestion_ts: &str) -> KbResult<usize> {
        self.store.delete_where(
            kb_name,
            &RowFilter {
                ingestion_ts: Some(ingestion_ts.to_string()),
                ..RowFilter::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkKind, ChunkRow, SourceKind};

    fn sample_row(kb: &str, path: &str, ordinal: u32, kind: ChunkKind, ts: &str) -> ChunkRow {
        ChunkRow {
            id: format!("{kb}_{ts}_{path}_{ordinal}"),
            vector: vec![0.5, 0.5],
            content: format!("content of {path} #{ordinal}"),
            source_path: path.to_string(),
            ordinal,
            token_count: 4,
            chunk_kind: kind,
            heading_path: vec![],
            source_kind: SourceKind::Markdown,
            is_test: false,
            ingestion_ts: ts.to_string(),
            kb_name: kb.to_string(),
            source_root: "/root".into(),
            is_placeholder: false,
        }
    }

    fn fixture() -> (tempfile::TempDir, Arc<VectorStore>, KnowledgeBaseRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(VectorStore::open_at(dir.path()).expect("open store"));
        let registry = KnowledgeBaseRegistry::new(Arc::clone(&store));
        (dir, store, registry)
    }

    #[test]
    fn test_list_counts_exclude_placeholders() {
        let (_dir, store, registry) = fixture();
        let ts = "2025-06-01T00:00:00.000000Z";
        store
            .create_with_rows(
                "docs",
                &[
                    sample_row("docs", "a.md", 0, ChunkKind::Section, ts),
                    sample_row("docs", "a.md", 1, ChunkKind::Paragraph, ts),
                    sample_row("docs", "b.md", 0, ChunkKind::Section, ts),
                ],
            )
            .expect("create");
        store.create_empty("blank", 2).expect("create empty");

        let mut listing = registry.list().expect("list");
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(listing.len(), 2);

        assert_eq!(listing[0].name, "blank");
        assert_eq!(listing[0].chunk_count, 0);
        assert_eq!(listing[0].file_count, 0);
        assert_eq!(listing[0].last_ingestion, None);

        assert_eq!(listing[1].name, "docs");
        assert_eq!(listing[1].chunk_count, 3);
        assert_eq!(listing[1].file_count, 2);
        assert_eq!(listing[1].last_ingestion.as_deref(), Some(ts));
        assert_eq!(listing[1].path, "kb_docs_1_0_0");
    }

    #[test]
    fn test_stats_distribution() {
        let (_dir, store, registry) = fixture();
        let ts1 = "2025-06-01T00:00:00.000000Z";
        let ts2 = "2025-06-02T00:00:00.000000Z";
        store
            .create_with_rows(
                "docs",
                &[
                    sample_row("docs", "a.md", 0, ChunkKind::Section, ts1),
                    sample_row("docs", "a.md", 1, ChunkKind::Table, ts1),
                    sample_row("docs", "b.md", 0, ChunkKind::Section, ts2),
                ],
            )
            .expect("create");

        let stats = registry.stats("docs").expect("stats");
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.chunk_kinds["section"], 2);
        assert_eq!(stats.chunk_kinds["table"], 1);
        assert_eq!(stats.latest_ingestion.as_deref(), Some(ts2));
        assert!(stats.total_content_bytes > 0);
    }

    #[test]
    fn test_stats_unknown_kb() {
        let (_dir, _store, registry) = fixture();
        assert!(matches!(
            registry.stats("ghost"),
            Err(KbError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rename_moves_rows_and_drops_old() {
        let (_dir, store, registry) = fixture();
        let ts = "2025-06-01T00:00:00.000000Z";
        store
            .create_with_rows("old-name", &[sample_row("old-name", "a.md", 0, ChunkKind::Section, ts)])
            .expect("create");

        registry.rename("old-name", "new-name").expect("rename");

        assert!(store.open("old-name").expect("open").is_none());
        let rows = store
            .scan("new-name", &RowFilter::default(), Projection::All)
            .expect("scan");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kb_name, "new-name");
        assert_eq!(rows[0].content, "content of a.md #0");

        let listing = registry.list().expect("list");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "new-name");
    }

    #[test]
    fn test_rename_collision_fails() {
        let (_dir, store, registry) = fixture();
        let ts = "2025-06-01T00:00:00.000000Z";
        store
            .create_with_rows("a", &[sample_row("a", "x.md", 0, ChunkKind::Section, ts)])
            .expect("create");
        store
            .create_with_rows("b", &[sample_row("b", "y.md", 0, ChunkKind::Section, ts)])
            .expect("create");

        assert!(matches!(
            registry.rename("a", "b"),
            Err(KbError::Conflict { .. })
        ));
        // Both survive untouched.
        assert!(store.open("a").expect("open").is_some());
        assert!(store.open("b").expect("open").is_some());
    }

    #[test]
    fn test_rename_empty_kb_keeps_placeholder() {
        let (_dir, store, registry) = fixture();
        store.create_empty("blank", 2).expect("create empty");
        registry.rename("blank", "renamed").expect("rename");
        assert!(store.exists("renamed").expect("exists"));
        assert_eq!(
            store.count("renamed", &RowFilter::default()).expect("count"),
            0
        );
    }

    #[test]
    fn test_delete() {
        let (_dir, store, registry) = fixture();
        let ts = "2025-06-01T00:00:00.000000Z";
        store
            .create_with_rows("gone", &[sample_row("gone", "a.md", 0, ChunkKind::Section, ts)])
            .expect("create");

        registry.delete("gone").expect("delete");
        assert!(registry.list().expect("list").is_empty());
        assert!(matches!(
            registry.delete("gone"),
            Err(KbError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_ingestion_counts() {
        let (_dir, store, registry) = fixture();
        let ts1 = "2025-06-01T00:00:00.000000Z";
        let ts2 = "2025-06-02T00:00:00.000000Z";
        store
            .create_with_rows(
                "docs",
                &[
                    sample_row("docs", "a.md", 0, ChunkKind::Section, ts1),
                    sample_row("docs", "a.md", 1, ChunkKind::Section, ts1),
                    sample_row("docs", "b.md", 0, ChunkKind::Section, ts2),
                ],
            )
            .expect("create");

        let removed = registry.delete_ingestion("docs", ts1).expect("delete");
        assert_eq!(removed, 2);
        let stats = registry.stats("docs").expect("stats");
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.latest_ingestion.as_deref(), Some(ts2));
    }
}
