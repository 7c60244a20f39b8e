//! Structure-aware document chunker.
//!
//! Transforms a single document's markdown-normalized text into an
//! ordered sequence of size-bounded chunks preserving heading context.
//! Chunking is a pure function of `(text, options)` with no side
//! effects, so properties can be checked by enumerating inputs.
//!
//! ## Strategy
//!
//! 1. Detect headings (ATX, setext, ALL-CAPS, numbered, structural markers)
//! 2. Partition into heading-delimited sections
//! 3. Sections that fit become one `section` chunk with heading context
//! 4. Oversized sections fall to recursive separator splitting with overlap
//! 5. Documents without headings are recursively split wholesale
//!
//! Converters that pre-identify structure bypass detection entirely via
//! [`chunk_document`]'s structured path; any failure there falls back to
//! the markdown path.

mod headings;
mod split;

pub use headings::{detect_headings, DetectedHeading};
pub use split::{char_len, char_tail, recursive_split, SplitPiece, SEPARATORS};

use crate::config::ChunkerConfig;
use crate::types::{ChunkKind, DocChunk, StructuredDocument};

/// Chunk one converted document.
///
/// When the converter supplied a structured document, its elements are
/// consumed directly; otherwise (or when the structure is unusable) the
/// markdown text path runs.
pub fn chunk_document(
    markdown: &str,
    structured: Option<&StructuredDocument>,
    options: &ChunkerConfig,
) -> Vec<DocChunk> {
    if let Some(doc) = structured {
        match chunk_structured(doc, options) {
            Some(chunks) => return chunks,
            None => {
                tracing::debug!("structured document unusable, falling back to markdown path");
            }
        }
    }
    chunk_markdown(markdown, options)
}

/// Chunk markdown-normalized text. Pure: same input, same output.
///
/// Empty or whitespace-only input yields an empty sequence. `ordinal`
/// is assigned in emission order, 0-based.
pub fn chunk_markdown(text: &str, options: &ChunkerConfig) -> Vec<DocChunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = text.lines().collect();
    let found = detect_headings(&lines);

    let mut emitter = ChunkEmitter::default();

    if found.is_empty() {
        emitter.emit_split(text, &[], options);
        return emitter.finish();
    }

    // Content before the first heading belongs to no section but is not
    // dropped.
    let preamble = lines[..found[0].line].join("\n");
    if !preamble.trim().is_empty() {
        emitter.emit_split(&preamble, &[], options);
    }

    for (idx, heading) in found.iter().enumerate() {
        let section_end = found
            .get(idx + 1)
            .map_or(lines.len(), |next| next.line);
        let section_text = lines[heading.line..section_end].join("\n");
        let heading_path = vec![heading.text.clone()];

        if char_len(&section_text) <= options.max_chars {
            emitter.emit(
                section_text,
                ChunkKind::Section,
                heading_path,
                true,
            );
        } else {
            let body = lines[heading.body_start.min(section_end)..section_end].join("\n");
            emitter.emit_split(&body, &heading_path, options);
        }
    }

    emitter.finish()
}

/// Consume pre-identified structure directly, one chunk per element.
///
/// Returns `None` when the structure carries no usable text, which
/// sends the caller down the markdown fallback.
fn chunk_structured(doc: &StructuredDocument, options: &ChunkerConfig) -> Option<Vec<DocChunk>> {
    if doc.elements.iter().all(|e| e.text.trim().is_empty()) {
        return None;
    }

    let hard_cap = options.max_chars + options.max_chars / 2;
    let mut emitter = ChunkEmitter::default();

    for element in &doc.elements {
        if element.text.trim().is_empty() {
            continue;
        }
        if char_len(&element.text) <= hard_cap {
            emitter.emit(
                element.text.clone(),
                element.kind,
                element.heading_path.clone(),
                true,
            );
        } else {
            // Oversized elements still honor the size bound; sub-chunks
            // keep the element's kind and heading context.
            for piece in recursive_split(&element.text, options.max_chars, options.overlap_chars) {
                emitter.emit(
                    piece.content,
                    element.kind,
                    element.heading_path.clone(),
                    piece.has_context,
                );
            }
        }
    }

    let chunks = emitter.finish();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks)
    }
}

/// Rough token estimation: ~4 characters per token.
/// Actual tokenization happens in the embedder; placeholders aside,
/// every chunk reports at least one token.
pub fn estimate_tokens(content: &str) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let estimate = (char_len(content) / 4) as u32;
    estimate.max(1)
}

/// Assigns ordinals in emission order and builds `DocChunk`s.
#[derive(Default)]
struct ChunkEmitter {
    chunks: Vec<DocChunk>,
}

impl ChunkEmitter {
    fn emit(&mut self, content: String, kind: ChunkKind, heading_path: Vec<String>, has_context: bool) {
        if content.trim().is_empty() {
            return;
        }
        let token_count = estimate_tokens(&content);
        #[allow(clippy::cast_possible_truncation)]
        let ordinal = self.chunks.len() as u32;
        self.chunks.push(DocChunk {
            content,
            kind,
            heading_path,
            ordinal,
            token_count,
            has_context,
        });
    }

    fn emit_split(&mut self, text: &str, heading_path: &[String], options: &ChunkerConfig) {
        for piece in recursive_split(text, options.max_chars, options.overlap_chars) {
            self.emit(
                piece.content,
                ChunkKind::Paragraph,
                heading_path.to_vec(),
                piece.has_context,
            );
        }
    }

    fn finish(self) -> Vec<DocChunk> {
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructuredElement;

    fn opts() -> ChunkerConfig {
        ChunkerConfig::default()
    }

    fn small_opts() -> ChunkerConfig {
        ChunkerConfig {
            max_chars: 100,
            overlap_chars: 20,
            max_tokens: 512,
        }
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chunk_markdown("", &opts()).is_empty());
        assert!(chunk_markdown("   \n\n \t ", &opts()).is_empty());
    }

    #[test]
    fn test_two_sections_two_chunks() {
        let text = "# Intro\nHello world.\n\n## Details\nMore here.\n";
        let chunks = chunk_markdown(text, &opts());
        assert_eq!(chunks.len(), 2);

        assert!(chunks[0].content.starts_with("# Intro"));
        assert_eq!(chunks[0].kind, ChunkKind::Section);
        assert_eq!(chunks[0].heading_path, vec!["Intro".to_string()]);
        assert!(chunks[0].has_context);
        assert_eq!(chunks[0].ordinal, 0);

        assert_eq!(chunks[1].heading_path, vec!["Details".to_string()]);
        assert_eq!(chunks[1].ordinal, 1);
    }

    #[test]
    fn test_unbroken_run_falls_through_to_char_slicing() {
        let text = "A".repeat(6000);
        let chunks = chunk_markdown(&text, &opts());
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(char_len(&chunk.content) <= 3000);
            assert!(chunk.heading_path.is_empty());
            assert!(!chunk.has_context);
        }
    }

    #[test]
    fn test_ordinals_are_contiguous() {
        let text = "# One\nbody one\n\n# Two\nbody two\n\n# Three\nbody three\n";
        let chunks = chunk_markdown(text, &opts());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal as usize, i);
        }
    }

    #[test]
    fn test_every_chunk_is_nonempty_with_positive_tokens() {
        let text = "# A\n\n\n\nscattered\n\n\n\ncontent\n\n# B\nmore";
        let chunks = chunk_markdown(text, &opts());
        for chunk in &chunks {
            assert!(!chunk.content.trim().is_empty());
            assert!(chunk.token_count > 0);
        }
    }

    #[test]
    fn test_oversized_section_splits_under_its_heading() {
        let mut text = String::from("# Big Section\n");
        for _ in 0..40 {
            text.push_str("This paragraph pads the section well past the cap.\n\n");
        }
        let chunks = chunk_markdown(&text, &small_opts());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.heading_path, vec!["Big Section".to_string()]);
            assert_eq!(chunk.kind, ChunkKind::Paragraph);
            assert!(char_len(&chunk.content) <= 150);
        }
    }

    #[test]
    fn test_preamble_before_first_heading_is_kept() {
        let text = "leading prose without a heading\n\n# Later\nbody";
        let chunks = chunk_markdown(text, &opts());
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].heading_path.is_empty());
        assert!(chunks[0].content.contains("leading prose"));
        assert_eq!(chunks[1].heading_path, vec!["Later".to_string()]);
    }

    #[test]
    fn test_size_bound_property() {
        let options = small_opts();
        let inputs = [
            "plain short text".to_string(),
            "word ".repeat(300),
            format!("# H\n{}", "sentence goes here. ".repeat(100)),
            "é".repeat(1000),
            format!("{}\n\n{}", "x".repeat(400), "y".repeat(400)),
        ];
        for input in &inputs {
            for chunk in chunk_markdown(input, &options) {
                assert!(
                    char_len(&chunk.content) <= 150,
                    "chunk of {} chars exceeds bound",
                    char_len(&chunk.content)
                );
            }
        }
    }

    #[test]
    fn test_setext_section() {
        let text = "Title\n=====\nunder the title\n\nSecond\n------\nunder second";
        let chunks = chunk_markdown(text, &opts());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading_path, vec!["Title".to_string()]);
        assert_eq!(chunks[1].heading_path, vec!["Second".to_string()]);
    }

    #[test]
    fn test_structured_path_emits_one_chunk_per_element() {
        let doc = StructuredDocument {
            elements: vec![
                StructuredElement {
                    kind: ChunkKind::Heading,
                    heading_path: vec!["Results".into()],
                    text: "Results".into(),
                },
                StructuredElement {
                    kind: ChunkKind::Table,
                    heading_path: vec!["Results".into()],
                    text: "| a | b |\n|---|---|\n| 1 | 2 |".into(),
                },
                StructuredElement {
                    kind: ChunkKind::Paragraph,
                    heading_path: vec!["Results".into()],
                    text: "Numbers went up.".into(),
                },
            ],
        };
        let chunks = chunk_document("ignored markdown", Some(&doc), &opts());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].kind, ChunkKind::Heading);
        assert_eq!(chunks[1].kind, ChunkKind::Table);
        assert_eq!(chunks[2].kind, ChunkKind::Paragraph);
        assert!(chunks.iter().all(|c| c.heading_path == vec!["Results".to_string()]));
    }

    #[test]
    fn test_structured_empty_falls_back_to_markdown() {
        let doc = StructuredDocument { elements: vec![] };
        let chunks = chunk_document("# Intro\nHello world.", Some(&doc), &opts());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading_path, vec!["Intro".to_string()]);
    }

    #[test]
    fn test_structured_oversized_element_respects_bound() {
        let doc = StructuredDocument {
            elements: vec![StructuredElement {
                kind: ChunkKind::Code,
                heading_path: vec!["Listing".into()],
                text: "let x = 1;\n".repeat(50),
            }],
        };
        let chunks = chunk_document("", Some(&doc), &small_opts());
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.kind, ChunkKind::Code);
            assert!(char_len(&chunk.content) <= 150);
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(2000)), 500);
    }
}
