//! SQLite-backed vector store.
//!
//! Each knowledgebase owns exactly one table named
//! `kb_{sanitized_name}_{schema_version}` inside a single database file
//! under the configured store directory. A `kb_tables` metadata table
//! records the logical name, schema version, vector dimension, and
//! creation time of every KB table, which makes the inverse parse from
//! physical to logical name exact.
//!
//! ## Concurrency
//!
//! SQLite runs in WAL mode behind a single shared connection. Callers
//! may assume single-writer-per-table discipline; the ingestion
//! pipeline enforces it.
//!
//! ## Schema versioning
//!
//! The schema version is a process-wide constant. Tables written by a
//! different release are detected at startup and warned about, never
//! silently migrated; re-ingestion is the migration path.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{KbError, KbResult};
use crate::types::{ChunkKind, ChunkRow, SourceKind};
use crate::vector::{from_blob, l2_distance, to_blob};

/// Current store schema version. Embedded in every table name and in
/// the `kb_tables` metadata; binary compatibility is declared only
/// within one version.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// A row returned from a KNN query, carrying its L2 distance.
#[derive(Debug, Clone)]
pub struct ScoredRow {
    /// The matching row.
    pub row: ChunkRow,
    /// L2 distance to the query vector.
    pub distance: f64,
}

/// Metadata filter applied to reads and deletes.
///
/// Placeholder rows are always excluded unless `include_placeholders`
/// is set (only the store's own bookkeeping ever sets it).
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Restrict to one source document type.
    pub document_type: Option<SourceKind>,
    /// Drop rows whose source path looks like test material.
    pub exclude_tests: bool,
    /// Restrict to a single ingestion.
    pub ingestion_ts: Option<String>,
    /// Let placeholder rows through (internal use).
    pub include_placeholders: bool,
}

impl RowFilter {
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if !self.include_placeholders {
            clauses.push("_is_placeholder = 0".into());
        }
        if self.exclude_tests {
            clauses.push("is_test = 0".into());
        }
        if let Some(kind) = self.document_type {
            clauses.push("source_kind = ?".into());
            params.push(kind.as_str().to_string());
        }
        if let Some(ts) = &self.ingestion_ts {
            clauses.push("ingestion_ts = ?".into());
            params.push(ts.clone());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_clause, params)
    }
}

/// Column projection for scans. `Metadata` skips the vector blob,
/// which is the expensive column to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Every column, vector included.
    All,
    /// Everything except the vector (returned empty).
    Metadata,
}

/// SQLite-backed store of per-knowledgebase vector tables.
pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl VectorStore {
    /// Open or create the store database under the given directory.
    ///
    /// Enumerates existing tables on startup and warns about any whose
    /// embedded schema version differs from the current constant.
    pub fn open_at(dir: &Path) -> KbResult<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("store.db");
        let conn = Connection::open(&db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", "-64000")?; // 64MB cache
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kb_tables (
                table_name     TEXT PRIMARY KEY,
                kb_name        TEXT NOT NULL,
                schema_version TEXT NOT NULL,
                vector_dim     INTEGER NOT NULL,
                created_at     TEXT NOT NULL
            )",
            [],
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.warn_version_mismatches()?;
        Ok(store)
    }

    /// Physical table name for a logical KB name under the current
    /// schema version. Hyphens become underscores in both the name and
    /// the dotted version.
    pub fn table_name(kb_name: &str) -> String {
        format!(
            "kb_{}_{}",
            kb_name.replace('-', "_"),
            SCHEMA_VERSION.replace('.', "_")
        )
    }

    /// Validate a user-supplied KB name: non-empty, `[A-Za-z0-9_-]+`.
    pub fn validate_kb_name(kb_name: &str) -> KbResult<()> {
        let ok = !kb_name.is_empty()
            && kb_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if ok {
            Ok(())
        } else {
            Err(KbError::Config {
                details: format!(
                    "invalid knowledgebase name {kb_name:?}: must match [A-Za-z0-9_-]+"
                ),
            })
        }
    }

    /// Inverse parse: recover `(name_part, dotted_version)` from a
    /// physical table name. The version is the trailing three segments.
    pub fn parse_table_name(table: &str) -> Option<(String, String)> {
        let rest = table.strip_prefix("kb_")?;
        let segments: Vec<&str> = rest.split('_').collect();
        if segments.len() < 4 {
            return None;
        }
        let (name_segs, ver_segs) = segments.split_at(segments.len() - 3);
        if !ver_segs.iter().all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())) {
            return None;
        }
        Some((name_segs.join("_"), ver_segs.join(".")))
    }

    /// Recover the logical KB name for a physical table, preferring the
    /// metadata record (exact) over the parsed name (hyphens lost).
    pub fn logical_name(&self, table: &str) -> KbResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT kb_name FROM kb_tables WHERE table_name = ?")?;
        let mut rows = stmt.query([table])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(row.get(0)?));
        }
        Ok(Self::parse_table_name(table).map(|(name, _)| name))
    }

    /// List physical table names matching the current-version pattern.
    pub fn list_tables(&self) -> KbResult<Vec<String>> {
        let suffix = format!("_{}", SCHEMA_VERSION.replace('.', "_"));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name LIKE 'kb\\_%' ESCAPE '\\' AND name != 'kb_tables'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| n.ends_with(&suffix))
            .collect())
    }

    /// Whether a table for this KB exists under the current version.
    pub fn exists(&self, kb_name: &str) -> KbResult<bool> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        Self::table_exists(&conn, &table)
    }

    /// Returns the physical table name when the KB exists, `None`
    /// otherwise.
    pub fn open(&self, kb_name: &str) -> KbResult<Option<String>> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        if Self::table_exists(&conn, &table)? {
            Ok(Some(table))
        } else {
            Ok(None)
        }
    }

    /// Create the KB table and insert the initial rows, inferring the
    /// vector dimension from the first row. Fails with a conflict if
    /// the table already exists and is fully constructed; a table with
    /// no metadata record (crash mid-create) is dropped and recreated.
    pub fn create_with_rows(&self, kb_name: &str, rows: &[ChunkRow]) -> KbResult<()> {
        Self::validate_kb_name(kb_name)?;
        let first = rows.first().ok_or_else(|| {
            KbError::Internal("create_with_rows requires at least one row".into())
        })?;
        let dim = first.vector.len();
        let table = Self::table_name(kb_name);

        let mut conn = self.conn.lock();

        if Self::table_exists(&conn, &table)? {
            let has_meta: bool = conn
                .prepare("SELECT 1 FROM kb_tables WHERE table_name = ?")?
                .exists([&table])?;
            if has_meta {
                return Err(KbError::Conflict {
                    details: format!("table for knowledgebase '{kb_name}' already exists"),
                });
            }
            tracing::warn!(
                table = %table,
                "found partially-constructed table, dropping and recreating"
            );
            conn.execute(&format!("DROP TABLE IF EXISTS \"{table}\""), [])?;
        }

        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "CREATE TABLE \"{table}\" (
                    id              TEXT NOT NULL,
                    vector          BLOB NOT NULL,
                    content         TEXT NOT NULL,
                    source_path     TEXT NOT NULL,
                    ordinal         INTEGER NOT NULL,
                    token_count     INTEGER NOT NULL,
                    chunk_kind      TEXT NOT NULL,
                    heading_path    TEXT NOT NULL,
                    source_kind     TEXT NOT NULL,
                    is_test         INTEGER NOT NULL,
                    ingestion_ts    TEXT NOT NULL,
                    _kb_name        TEXT NOT NULL,
                    _source_root    TEXT NOT NULL,
                    _is_placeholder INTEGER NOT NULL
                )"
            ),
            [],
        )?;
        tx.execute(
            "INSERT INTO kb_tables (table_name, kb_name, schema_version, vector_dim, created_at)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                table,
                kb_name,
                SCHEMA_VERSION,
                dim as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Self::insert_rows(&tx, &table, dim, rows)?;
        tx.commit()?;

        tracing::debug!(table = %table, rows = rows.len(), dim, "created knowledgebase table");
        Ok(())
    }

    /// Create an empty KB by inserting a single placeholder row. The
    /// store infers schema from the first insertion and cannot create
    /// empty typed tables, so the placeholder fixes the schema; all
    /// readers filter it out.
    pub fn create_empty(&self, kb_name: &str, dimensions: usize) -> KbResult<()> {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        let placeholder = ChunkRow::placeholder(kb_name, dimensions, &ts);
        self.create_with_rows(kb_name, std::slice::from_ref(&placeholder))
    }

    /// Append rows to an existing KB table.
    pub fn insert(&self, kb_name: &str, rows: &[ChunkRow]) -> KbResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = Self::table_name(kb_name);
        let mut conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        let dim: i64 = conn.query_row(
            "SELECT vector_dim FROM kb_tables WHERE table_name = ?",
            [&table],
            |row| row.get(0),
        )?;
        let tx = conn.transaction()?;
        Self::insert_rows(&tx, &table, dim as usize, rows)?;
        tx.commit()?;
        Ok(())
    }

    /// K-nearest-neighbor search by L2 distance over rows satisfying
    /// the filter. Distance ties break toward the lower ordinal.
    pub fn knn(
        &self,
        kb_name: &str,
        query: &[f32],
        k: usize,
        filter: &RowFilter,
    ) -> KbResult<Vec<ScoredRow>> {
        let table = Self::table_name(kb_name);
        let (where_clause, params) = filter.to_sql();
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }

        let sql = format!("SELECT {} FROM \"{table}\"{where_clause}", Self::ALL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut scored: Vec<ScoredRow> = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let chunk = Self::row_to_chunk(row, Projection::All)?;
            let distance = l2_distance(query, &chunk.vector);
            scored.push(ScoredRow {
                row: chunk,
                distance,
            });
        }

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.row.ordinal.cmp(&b.row.ordinal))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Return all rows matching the filter, with the requested
    /// projection (the vector column is the expensive one to skip).
    pub fn scan(
        &self,
        kb_name: &str,
        filter: &RowFilter,
        projection: Projection,
    ) -> KbResult<Vec<ChunkRow>> {
        let table = Self::table_name(kb_name);
        let (where_clause, params) = filter.to_sql();
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }

        let columns = match projection {
            Projection::All => Self::ALL_COLUMNS,
            Projection::Metadata => Self::METADATA_COLUMNS,
        };
        let sql = format!("SELECT {columns} FROM \"{table}\"{where_clause} ORDER BY source_path, ordinal");
        let mut stmt = conn.prepare(&sql)?;
        let mut out = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            out.push(Self::row_to_chunk(row, projection)?);
        }
        Ok(out)
    }

    /// Count rows matching the filter.
    pub fn count(&self, kb_name: &str, filter: &RowFilter) -> KbResult<usize> {
        let table = Self::table_name(kb_name);
        let (where_clause, params) = filter.to_sql();
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        let sql = format!("SELECT COUNT(*) FROM \"{table}\"{where_clause}");
        let count: i64 = conn.query_row(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Count distinct source files over at most `sample_limit` rows.
    /// Large tables get a bounded sample rather than a full pass.
    pub fn source_file_count(&self, kb_name: &str, sample_limit: usize) -> KbResult<usize> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        let sql = format!(
            "SELECT COUNT(DISTINCT source_path) FROM (
                 SELECT source_path FROM \"{table}\" WHERE _is_placeholder = 0 LIMIT ?
             )"
        );
        let count: i64 = conn.query_row(&sql, [sample_limit as i64], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// The most recent ingestion timestamp in the table, placeholder
    /// rows excluded.
    pub fn latest_ingestion(&self, kb_name: &str) -> KbResult<Option<String>> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        let sql = format!(
            "SELECT MAX(ingestion_ts) FROM \"{table}\" WHERE _is_placeholder = 0"
        );
        let latest: Option<String> = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(latest)
    }

    /// Delete rows matching the filter; returns the number removed.
    pub fn delete_where(&self, kb_name: &str, filter: &RowFilter) -> KbResult<usize> {
        let table = Self::table_name(kb_name);
        let (where_clause, params) = filter.to_sql();
        let conn = self.conn.lock();
        if !Self::table_exists(&conn, &table)? {
            return Err(KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            });
        }
        let sql = format!("DELETE FROM \"{table}\"{where_clause}");
        let removed = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(removed)
    }

    /// Remove the KB's backing table entirely.
    pub fn drop_table(&self, kb_name: &str) -> KbResult<()> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        conn.execute(&format!("DROP TABLE IF EXISTS \"{table}\""), [])?;
        conn.execute("DELETE FROM kb_tables WHERE table_name = ?", [&table])?;
        tracing::debug!(table = %table, "dropped knowledgebase table");
        Ok(())
    }

    /// The vector dimension recorded for a KB at creation time.
    pub fn vector_dimension(&self, kb_name: &str) -> KbResult<usize> {
        let table = Self::table_name(kb_name);
        let conn = self.conn.lock();
        let dim: i64 = conn
            .query_row(
                "SELECT vector_dim FROM kb_tables WHERE table_name = ?",
                [&table],
                |row| row.get(0),
            )
            .map_err(|_| KbError::NotFound {
                entity: format!("knowledgebase '{kb_name}'"),
            })?;
        Ok(dim as usize)
    }

    // -- internals ---------------------------------------------------------

    const ALL_COLUMNS: &'static str = "id, vector, content, source_path, ordinal, token_count, \
         chunk_kind, heading_path, source_kind, is_test, ingestion_ts, _kb_name, _source_root, \
         _is_placeholder";

    const METADATA_COLUMNS: &'static str = "id, NULL, content, source_path, ordinal, token_count, \
         chunk_kind, heading_path, source_kind, is_test, ingestion_ts, _kb_name, _source_root, \
         _is_placeholder";

    fn table_exists(conn: &Connection, table: &str) -> KbResult<bool> {
        let exists = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")?
            .exists([table])?;
        Ok(exists)
    }

    fn insert_rows(
        tx: &rusqlite::Transaction<'_>,
        table: &str,
        dim: usize,
        rows: &[ChunkRow],
    ) -> KbResult<()> {
        let sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            Self::ALL_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        for row in rows {
            if row.vector.len() != dim {
                return Err(KbError::Internal(format!(
                    "vector dimension mismatch: table expects {dim}, row '{}' has {}",
                    row.id,
                    row.vector.len()
                )));
            }
            let heading_json = serde_json::to_string(&row.heading_path)
                .map_err(|e| KbError::Serialization(e.to_string()))?;
            stmt.execute(rusqlite::params![
                row.id,
                to_blob(&row.vector),
                row.content,
                row.source_path,
                row.ordinal,
                row.token_count,
                row.chunk_kind.as_str(),
                heading_json,
                row.source_kind.as_str(),
                row.is_test as i64,
                row.ingestion_ts,
                row.kb_name,
                row.source_root,
                row.is_placeholder as i64,
            ])?;
        }
        Ok(())
    }

    fn row_to_chunk(row: &rusqlite::Row<'_>, projection: Projection) -> KbResult<ChunkRow> {
        let vector = match projection {
            Projection::All => {
                let blob: Vec<u8> = row.get(1)?;
                from_blob(&blob)?
            }
            Projection::Metadata => Vec::new(),
        };
        let heading_json: String = row.get(7)?;
        let heading_path: Vec<String> = serde_json::from_str(&heading_json)
            .map_err(|e| KbError::Serialization(e.to_string()))?;
        let chunk_kind: String = row.get(6)?;
        let source_kind: String = row.get(8)?;

        Ok(ChunkRow {
            id: row.get(0)?,
            vector,
            content: row.get(2)?,
            source_path: row.get(3)?,
            ordinal: row.get::<_, i64>(4)? as u32,
            token_count: row.get::<_, i64>(5)? as u32,
            chunk_kind: ChunkKind::from_str_lossy(&chunk_kind),
            heading_path,
            source_kind: SourceKind::from_str_lossy(&source_kind),
            is_test: row.get::<_, i64>(9)? != 0,
            ingestion_ts: row.get(10)?,
            kb_name: row.get(11)?,
            source_root: row.get(12)?,
            is_placeholder: row.get::<_, i64>(13)? != 0,
        })
    }

    /// Warn about tables written by a different release of the store.
    fn warn_version_mismatches(&self) -> KbResult<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name LIKE 'kb\\_%' ESCAPE '\\' AND name != 'kb_tables'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for table in names {
            if let Some((name, version)) = Self::parse_table_name(&table) {
                if version != SCHEMA_VERSION {
                    tracing::warn!(
                        knowledgebase = %name,
                        table_version = %version,
                        current_version = SCHEMA_VERSION,
                        "knowledgebase table was written by a different schema version; \
                         re-ingest to migrate"
                    );
                }
            }
        }
        Ok(())
    }
}
