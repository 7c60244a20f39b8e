//! Boundary to document-to-markdown conversion.
//!
//! The core depends only on the [`DocumentConverter`] capability; the
//! facade implements it two ways. Plain-text formats (markdown, text,
//! HTML) are read directly and returned as-is. Binary formats go to an
//! out-of-process converter under a wall-clock deadline; on timeout a
//! degraded plain-text extraction is attempted before giving up.
//!
//! No chunking happens here. Degraded outputs are still full markdown
//! that the chunker handles uniformly.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{KbError, KbResult};
use crate::types::{ConvertOutcome, DocumentMetadata, SourceKind, StructuredDocument};

/// Document-to-markdown conversion capability.
///
/// Swappable for testing without touching the pipeline.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert one file to markdown plus metadata.
    async fn convert(&self, path: &Path) -> KbResult<ConvertOutcome>;
}

/// What an external converter process writes to stdout. Plain text
/// output (not JSON) is accepted as bare markdown.
#[derive(Debug, serde::Deserialize)]
struct ExternalPayload {
    markdown: String,
    #[serde(default)]
    metadata: Option<DocumentMetadata>,
    #[serde(default)]
    structured: Option<StructuredDocument>,
}

/// Production converter: direct reads for text formats, external
/// process for binary ones.
pub struct ConverterFacade {
    timeout: Duration,
    /// Program plus leading args; the file path is appended per call.
    external_command: Option<Vec<String>>,
}

impl ConverterFacade {
    /// Create a facade with the given per-file deadline.
    pub fn new(timeout_ms: u64, external_command: Option<Vec<String>>) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            external_command,
        }
    }

    async fn convert_external(&self, path: &Path, kind: SourceKind) -> KbResult<ConvertOutcome> {
        let Some(command) = &self.external_command else {
            return Err(KbError::Convert {
                path: path.to_path_buf(),
                message: format!(
                    "no external converter configured for {} files",
                    kind.as_str()
                ),
            });
        };
        let (program, args) = command.split_first().ok_or_else(|| KbError::Config {
            details: "ingestion.converter_command must name a program".into(),
        })?;

        let start = Instant::now();
        let child = tokio::process::Command::new(program)
            .args(args)
            .arg(path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KbError::Convert {
                path: path.to_path_buf(),
                message: format!("failed to spawn converter '{program}': {e}"),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| KbError::Convert {
                path: path.to_path_buf(),
                message: format!("converter I/O error: {e}"),
            })?,
            Err(_elapsed) => {
                tracing::warn!(
                    path = %path.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "converter timed out, attempting degraded text extraction"
                );
                return self.degraded_extraction(path, kind, start);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KbError::Convert {
                path: path.to_path_buf(),
                message: format!(
                    "converter exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let conversion_ms = start.elapsed().as_millis() as u64;

        // Prefer the structured JSON contract; accept bare markdown.
        if let Ok(payload) = serde_json::from_str::<ExternalPayload>(&stdout) {
            let mut metadata = payload
                .metadata
                .unwrap_or_else(|| metadata_from_content(&payload.markdown, kind));
            metadata.format = kind.as_str().to_string();
            metadata.conversion_ms = conversion_ms;
            return Ok(ConvertOutcome {
                markdown: payload.markdown,
                metadata,
                structured: payload.structured,
            });
        }

        let mut metadata = metadata_from_content(&stdout, kind);
        metadata.conversion_ms = conversion_ms;
        Ok(ConvertOutcome {
            markdown: stdout,
            metadata,
            structured: None,
        })
    }

    /// Last-ditch extraction after a timeout: salvage printable runs
    /// from the raw bytes. Fails with the timeout error when nothing
    /// legible comes out.
    fn degraded_extraction(
        &self,
        path: &Path,
        kind: SourceKind,
        start: Instant,
    ) -> KbResult<ConvertOutcome> {
        let bytes = std::fs::read(path)?;
        let text = salvage_printable(&bytes);
        if text.trim().is_empty() {
            return Err(KbError::ConvertTimeout {
                path: path.to_path_buf(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        let mut metadata = metadata_from_content(&text, kind);
        metadata.conversion_ms = start.elapsed().as_millis() as u64;
        Ok(ConvertOutcome {
            markdown: text,
            metadata,
            structured: None,
        })
    }
}

#[async_trait]
impl DocumentConverter for ConverterFacade {
    async fn convert(&self, path: &Path) -> KbResult<ConvertOutcome> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let kind = SourceKind::from_extension(&ext);

        match kind {
            SourceKind::Unknown => Err(KbError::UnsupportedFormat { extension: ext }),
            k if k.is_plain_text() => {
                let start = Instant::now();
                let content = tokio::fs::read_to_string(path).await?;
                let mut metadata = metadata_from_content(&content, k);
                metadata.conversion_ms = start.elapsed().as_millis() as u64;
                Ok(ConvertOutcome {
                    markdown: content,
                    metadata,
                    structured: None,
                })
            }
            k => self.convert_external(path, k).await,
        }
    }
}

/// Fill metadata from markdown content: whitespace-split word count,
/// first ATX heading as title, cheap image/table sniffing.
pub fn metadata_from_content(markdown: &str, kind: SourceKind) -> DocumentMetadata {
    let title = markdown.lines().find_map(|line| {
        let trimmed = line.trim();
        trimmed
            .strip_prefix('#')
            .map(|rest| rest.trim_start_matches('#').trim().to_string())
            .filter(|t| !t.is_empty())
    });

    DocumentMetadata {
        title,
        format: kind.as_str().to_string(),
        word_count: markdown.split_whitespace().count(),
        has_images: markdown.contains("!["),
        has_tables: markdown.lines().any(|l| {
            let t = l.trim();
            t.starts_with('|') && t.ends_with('|')
        }),
        page_count: None,
        conversion_ms: 0,
    }
}

/// Keep printable runs of at least four characters from raw bytes.
fn salvage_printable(bytes: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(bytes);
    let mut out = String::new();
    let mut run = String::new();
    for c in lossy.chars() {
        if c == '\n' || c == '\t' || (!c.is_control() && c != '\u{FFFD}') {
            run.push(c);
        } else {
            if run.trim().chars().count() >= 4 {
                out.push_str(run.trim());
                out.push('\n');
            }
            run.clear();
        }
    }
    if run.trim().chars().count() >= 4 {
        out.push_str(run.trim());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).expect("write file");
    }

    #[tokio::test]
    async fn test_markdown_short_circuit() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("notes.md");
        write(&path, "# Title\n\nSome body with five words.");

        let facade = ConverterFacade::new(30_000, None);
        let outcome = facade.convert(&path).await.expect("convert");
        assert_eq!(outcome.markdown, "# Title\n\nSome body with five words.");
        assert_eq!(outcome.metadata.title.as_deref(), Some("Title"));
        assert_eq!(outcome.metadata.format, "markdown");
        assert_eq!(outcome.metadata.word_count, 7);
        assert!(outcome.structured.is_none());
    }

    #[tokio::test]
    async fn test_html_read_verbatim() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("page.html");
        write(&path, "<h1>Hi</h1><p>there</p>");

        let facade = ConverterFacade::new(30_000, None);
        let outcome = facade.convert(&path).await.expect("convert");
        assert_eq!(outcome.markdown, "<h1>Hi</h1><p>there</p>");
        assert_eq!(outcome.metadata.format, "html");
    }

    #[tokio::test]
    async fn test_unsupported_extension_names_it() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("data.sqlite3");
        write(&path, "x");

        let facade = ConverterFacade::new(30_000, None);
        let err = facade.convert(&path).await.expect_err("must fail");
        match err {
            KbError::UnsupportedFormat { extension } => assert_eq!(extension, "sqlite3"),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_binary_without_converter_fails_per_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("deck.pptx");
        write(&path, "fake");

        let facade = ConverterFacade::new(30_000, None);
        let err = facade.convert(&path).await.expect_err("must fail");
        assert!(matches!(err, KbError::Convert { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_converter_json_contract() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("fake-convert.sh");
        write(
            &script,
            "#!/bin/sh\necho '{\"markdown\": \"# Converted\\n\\nbody\", \"structured\": {\"elements\": [{\"kind\": \"section\", \"heading_path\": [\"Converted\"], \"text\": \"body\"}]}}'\n",
        );
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let path = dir.path().join("report.pdf");
        write(&path, "%PDF-fake");

        let facade = ConverterFacade::new(
            30_000,
            Some(vec![script.to_string_lossy().to_string()]),
        );
        let outcome = facade.convert(&path).await.expect("convert");
        assert!(outcome.markdown.starts_with("# Converted"));
        assert_eq!(outcome.metadata.format, "pdf");
        let structured = outcome.structured.expect("structured");
        assert_eq!(structured.elements.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_converter_plain_stdout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("fake-convert.sh");
        write(&script, "#!/bin/sh\necho 'just plain markdown output'\n");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let path = dir.path().join("sheet.xlsx");
        write(&path, "fake");

        let facade = ConverterFacade::new(
            30_000,
            Some(vec![script.to_string_lossy().to_string()]),
        );
        let outcome = facade.convert(&path).await.expect("convert");
        assert!(outcome.markdown.contains("just plain markdown output"));
        assert!(outcome.structured.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_salvages_printable_content() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("slow.sh");
        write(&script, "#!/bin/sh\nsleep 30\n");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let path = dir.path().join("doc.docx");
        write(&path, "Readable words embedded in the file body here");

        let facade = ConverterFacade::new(
            200,
            Some(vec![script.to_string_lossy().to_string()]),
        );
        let outcome = facade.convert(&path).await.expect("degraded convert");
        assert!(outcome.markdown.contains("Readable words"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_with_nothing_salvageable_errors() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("create temp dir");
        let script = dir.path().join("slow.sh");
        write(&script, "#!/bin/sh\nsleep 30\n");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let path = dir.path().join("doc.docx");
        std::fs::write(&path, [0u8, 1, 2, 3, 0, 1, 2, 3]).expect("write binary");

        let facade = ConverterFacade::new(
            200,
            Some(vec![script.to_string_lossy().to_string()]),
        );
        let err = facade.convert(&path).await.expect_err("must time out");
        assert!(matches!(err, KbError::ConvertTimeout { .. }));
    }

    #[test]
    fn test_metadata_table_sniffing() {
        let md = "intro\n\n| a | b |\n|---|---|\n| 1 | 2 |\n";
        let meta = metadata_from_content(md, SourceKind::Markdown);
        assert!(meta.has_tables);
        assert!(!meta.has_images);
        assert_eq!(meta.title, None);
    }

    #[test]
    fn test_salvage_printable() {
        let bytes = b"\x00\x01Hello salvage\x02\x03ok\x04world of text\x05";
        let text = salvage_printable(bytes);
        assert!(text.contains("Hello salvage"));
        assert!(text.contains("world of text"));
        // Runs shorter than four characters are dropped.
        assert!(!text.contains("ok\n"));
    }
}
