//! Core domain types shared across all kb-core subsystems.
//!
//! These types form the API contract between modules. Changing them
//! requires updating all consumers, so they should be stable and minimal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source kinds
// ---------------------------------------------------------------------------

/// Supported source document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// PDF document (.pdf)
    Pdf,
    /// Word document (.docx)
    Docx,
    /// PowerPoint presentation (.pptx)
    Pptx,
    /// Excel spreadsheet (.xlsx)
    Xlsx,
    /// HTML page (.html, .htm)
    Html,
    /// Markdown (.md, .mdx, .markdown)
    Markdown,
    /// Plain text (.txt)
    Text,
    /// Audio recording (.mp3, .wav, .m4a)
    Audio,
    /// Unknown / unsupported
    Unknown,
}

impl SourceKind {
    /// Detect the source kind from a file extension (lowercase, no dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "pdf" => Self::Pdf,
            "docx" | "doc" => Self::Docx,
            "pptx" | "ppt" => Self::Pptx,
            "xlsx" | "xls" => Self::Xlsx,
            "html" | "htm" => Self::Html,
            "md" | "mdx" | "markdown" => Self::Markdown,
            "txt" => Self::Text,
            "mp3" | "wav" | "m4a" => Self::Audio,
            _ => Self::Unknown,
        }
    }

    /// Returns the document type identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Pptx => "pptx",
            Self::Xlsx => "xlsx",
            Self::Html => "html",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from a stored document-type string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            "xlsx" => Self::Xlsx,
            "html" => Self::Html,
            "markdown" => Self::Markdown,
            "text" => Self::Text,
            "audio" => Self::Audio,
            _ => Self::Unknown,
        }
    }

    /// Returns true if files of this kind can be read directly as text,
    /// without going through the external converter.
    pub fn is_plain_text(&self) -> bool {
        matches!(self, Self::Markdown | Self::Text | Self::Html)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Chunk types
// ---------------------------------------------------------------------------

/// The kind of structural unit a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Free-standing paragraph of prose.
    Paragraph,
    /// A heading plus the body under it.
    Section,
    /// A bare heading.
    Heading,
    /// A table.
    Table,
    /// A bulleted or numbered list.
    List,
    /// A code block.
    Code,
    /// Synthetic schema-fixing row; filtered from all reads.
    Placeholder,
}

impl ChunkKind {
    /// Convert to the stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Section => "section",
            Self::Heading => "heading",
            Self::Table => "table",
            Self::List => "list",
            Self::Code => "code",
            Self::Placeholder => "placeholder",
        }
    }

    /// Parse from the stored string form.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "section" => Self::Section,
            "heading" => Self::Heading,
            "table" => Self::Table,
            "list" => Self::List,
            "code" => Self::Code,
            "placeholder" => Self::Placeholder,
            _ => Self::Paragraph,
        }
    }
}

/// A chunk of document text produced by the chunker, before embedding.
///
/// `ordinal` is the 0-based position within the source file, assigned in
/// emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocChunk {
    /// The textual payload (UTF-8), bounded by chunker policy.
    pub content: String,
    /// What kind of structural unit this is.
    pub kind: ChunkKind,
    /// Ordered heading texts from document root to this chunk (possibly empty).
    pub heading_path: Vec<String>,
    /// 0-based position within the source file.
    pub ordinal: u32,
    /// Estimated token count (characters / 4, at least 1).
    pub token_count: u32,
    /// Whether this chunk's creation preserved structural grouping.
    pub has_context: bool,
}

/// A fully-assembled row as persisted in a knowledgebase table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    /// Stable id within an ingestion: `{kb_name}_{ingestion_ts}_{ordinal}`.
    /// The ordinal is per-file, so the id alone does not distinguish
    /// rows from different files of the same ingestion.
    pub id: String,
    /// Fixed-dimensional embedding vector.
    pub vector: Vec<f32>,
    /// The chunk text.
    pub content: String,
    /// Path relative to the ingestion root.
    pub source_path: String,
    /// 0-based position within the source file.
    pub ordinal: u32,
    /// Estimated token count.
    pub token_count: u32,
    /// Structural kind of this chunk.
    pub chunk_kind: ChunkKind,
    /// Ordered heading texts from document root.
    pub heading_path: Vec<String>,
    /// Source document format.
    pub source_kind: SourceKind,
    /// Whether the source path looks like test material.
    pub is_test: bool,
    /// ISO 8601 UTC timestamp shared by all chunks of one ingestion.
    pub ingestion_ts: String,
    /// Owning knowledgebase name (bookkeeping).
    pub kb_name: String,
    /// Root path the ingestion ran against (bookkeeping).
    pub source_root: String,
    /// Synthetic schema-fixing row marker (bookkeeping).
    pub is_placeholder: bool,
}

impl ChunkRow {
    /// Build the synthetic placeholder row that fixes a new table's schema.
    ///
    /// All readers must filter rows with `is_placeholder = true`.
    pub fn placeholder(kb_name: &str, dimensions: usize, ingestion_ts: &str) -> Self {
        Self {
            id: format!("{kb_name}_{ingestion_ts}_placeholder"),
            vector: vec![0.0; dimensions],
            content: String::new(),
            source_path: String::new(),
            ordinal: 0,
            token_count: 0,
            chunk_kind: ChunkKind::Placeholder,
            heading_path: Vec::new(),
            source_kind: SourceKind::Unknown,
            is_test: false,
            ingestion_ts: ingestion_ts.to_string(),
            kb_name: kb_name.to_string(),
            source_root: String::new(),
            is_placeholder: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Scanner types
// ---------------------------------------------------------------------------

/// A candidate file discovered by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute path on disk.
    pub abs_path: PathBuf,
    /// Path relative to the scan root.
    pub rel_path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Detected document format.
    pub kind: SourceKind,
    /// Whether any path segment matches test naming conventions.
    pub is_test: bool,
}

// ---------------------------------------------------------------------------
// Converter types
// ---------------------------------------------------------------------------

/// Metadata reported by the document converter for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document title, if one could be determined.
    pub title: Option<String>,
    /// Source document format.
    pub format: String,
    /// Whitespace-split token count of the markdown output.
    pub word_count: usize,
    /// Whether the document contains images.
    pub has_images: bool,
    /// Whether the document contains tables.
    pub has_tables: bool,
    /// Page count for paginated formats.
    pub page_count: Option<u32>,
    /// Wall-clock conversion time in milliseconds.
    pub conversion_ms: u64,
}

/// One pre-identified structural element of a converted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredElement {
    /// What kind of structural unit this is.
    pub kind: ChunkKind,
    /// Heading texts enclosing this element, root first.
    #[serde(default)]
    pub heading_path: Vec<String>,
    /// The element's text.
    pub text: String,
}

/// A structured document as returned by converters that identify sections,
/// tables, and headings themselves. Consumed by the chunker's structured
/// path; the markdown text path is the fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredDocument {
    /// Ordered structural elements.
    pub elements: Vec<StructuredElement>,
}

impl StructuredDocument {
    /// Flatten all element texts into a single markdown-ish string,
    /// used when falling back to the text chunking path.
    pub fn flattened_text(&self) -> String {
        let mut out = String::new();
        for element in &self.elements {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&element.text);
        }
        out
    }
}

/// The full outcome of converting one file.
#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    /// Markdown-normalized text of the whole document.
    pub markdown: String,
    /// Conversion metadata.
    pub metadata: DocumentMetadata,
    /// Pre-identified structure, when the converter provides one.
    pub structured: Option<StructuredDocument>,
}

// ---------------------------------------------------------------------------
// Search types
// ---------------------------------------------------------------------------

/// A single shaped search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Path relative to the ingestion root.
    pub source_path: String,
    /// 0-based position within the source file.
    pub ordinal: u32,
    /// The chunk text.
    pub content: String,
    /// Structural kind of the chunk.
    pub chunk_kind: ChunkKind,
    /// Source document format.
    pub source_kind: SourceKind,
    /// Ordered heading texts from document root.
    pub heading_path: Vec<String>,
    /// Whether the source path looks like test material.
    pub is_test: bool,
    /// Similarity score in [0, 1]; larger is closer.
    pub similarity: f64,
    /// Knowledgebase the hit came from.
    pub kb_name: String,
}

/// A complete search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Ranked hits, best first.
    pub results: Vec<SearchHit>,
    /// Post-filter candidate count before clipping to `max_results`.
    pub total: usize,
    /// Wall-clock query time in milliseconds (0 on cache hits).
    pub query_ms: u64,
}

// ---------------------------------------------------------------------------
// Ingestion types
// ---------------------------------------------------------------------------

/// A per-file error recorded during an ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFileError {
    /// Path relative to the ingestion root.
    pub path: String,
    /// What went wrong.
    pub message: String,
}

/// The result object returned by every ingestion, including partial failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    /// Files converted, chunked, and stored.
    pub files_processed: usize,
    /// Files excluded mid-run (conversion failure, zero chunks).
    pub files_skipped: usize,
    /// Rows written across all batches.
    pub chunks_created: usize,
    /// Per-file errors; never aborts the run.
    pub errors: Vec<IngestFileError>,
    /// Total wall-clock time in milliseconds.
    pub duration_ms: u64,
}

/// The phase an ingestion session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPhase {
    /// Enumerating candidate files under the root.
    Scanning,
    /// Converting, chunking, embedding, and storing batches.
    Processing,
    /// Terminal: the run finished (possibly with per-file errors).
    Completed,
    /// Terminal: a store-level failure aborted the run.
    Failed,
    /// Terminal: the run was cancelled at a batch boundary.
    Cancelled,
}

impl IngestPhase {
    /// Whether this phase ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A progress event published by an ingestion session.
///
/// The observer stream is lossy: slow consumers may miss intermediate
/// events but never the terminal one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The ingestion session this event belongs to.
    pub session_id: String,
    /// Current phase.
    pub phase: IngestPhase,
    /// Files handled so far.
    pub current: usize,
    /// Total candidate files.
    pub total: usize,
    /// The file being worked on, when one is.
    pub current_file: Option<String>,
}
