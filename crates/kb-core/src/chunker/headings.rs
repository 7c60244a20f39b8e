//! Heading detection over markdown-normalized text.
//!
//! Scans lines and emits detected headings with a level (1..6) and
//! position. Five patterns are tried in order per line; the first match
//! wins. Converted documents frequently lose markdown syntax, so the
//! later patterns catch ALL-CAPS titles, numbered sections, and
//! "Chapter N" style markers that survive conversion as plain text.

use std::sync::LazyLock;

use regex::Regex;

static ATX: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^(#{1,6})\s+(.+)$").unwrap()
});

static SETEXT_EQUALS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^=+$").unwrap()
});

static SETEXT_DASHES: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^-+$").unwrap()
});

static ALL_CAPS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[A-Z][A-Z\s\d:'-]{2,}$").unwrap()
});

static NUMBERED: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^(\d+(\.\d+)*)\.?\s+([A-Z].{2,60})$").unwrap()
});

static STRUCTURAL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)^(Chapter|Section|Part|Article)\s+(\d+|[IVX]+):?\s*(.*)$").unwrap()
});

/// A heading found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedHeading {
    /// 0-based line index of the heading text.
    pub line: usize,
    /// 0-based line index where the section body starts (past any
    /// setext underline).
    pub body_start: usize,
    /// Heading depth, 1..=6.
    pub level: u8,
    /// Heading text, preserved verbatim (hash markers stripped for ATX).
    pub text: String,
}

/// Scan the document's lines and return all detected headings in order.
pub fn detect_headings(lines: &[&str]) -> Vec<DetectedHeading> {
    let mut headings: Vec<DetectedHeading> = Vec::new();

    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();

        // 1. Markdown ATX
        if let Some(caps) = ATX.captures(line) {
            let level = caps[1].len().min(6) as u8;
            headings.push(DetectedHeading {
                line: i,
                body_start: i + 1,
                level,
                text: caps[2].trim().to_string(),
            });
            continue;
        }

        // 2. Markdown setext: this line underlines the previous one.
        if i > 0 && is_setext_candidate(lines[i - 1].trim_end()) {
            let already_heading = headings.last().is_some_and(|h| h.line == i - 1);
            if !already_heading {
                if SETEXT_EQUALS.is_match(line) {
                    headings.push(DetectedHeading {
                        line: i - 1,
                        body_start: i + 1,
                        level: 1,
                        text: lines[i - 1].trim().to_string(),
                    });
                    continue;
                }
                if SETEXT_DASHES.is_match(line) {
                    headings.push(DetectedHeading {
                        line: i - 1,
                        body_start: i + 1,
                        level: 2,
                        text: lines[i - 1].trim().to_string(),
                    });
                    continue;
                }
            }
        }

        // 3. ALL-CAPS heading
        if is_all_caps_heading(lines, i) {
            headings.push(DetectedHeading {
                line: i,
                body_start: i + 1,
                level: 1,
                text: line.to_string(),
            });
            continue;
        }

        // 4. Numbered section
        if let Some(caps) = NUMBERED.captures(line) {
            let dots = caps[1].matches('.').count();
            let level = (dots + 1).min(6) as u8;
            headings.push(DetectedHeading {
                line: i,
                body_start: i + 1,
                level,
                text: line.to_string(),
            });
            continue;
        }

        // 5. Structural marker
        if STRUCTURAL.is_match(line) {
            headings.push(DetectedHeading {
                line: i,
                body_start: i + 1,
                level: 1,
                text: line.to_string(),
            });
        }
    }

    headings
}

/// Setext heading text lines are 3-99 characters and non-blank.
fn is_setext_candidate(prev: &str) -> bool {
    let len = prev.trim().chars().count();
    (3..=99).contains(&len)
}

/// ALL-CAPS titles: 3-60 chars, preceded by a blank line (or document
/// start), followed by a non-blank line, and not serving as a setext
/// underline for the line above.
fn is_all_caps_heading(lines: &[&str], i: usize) -> bool {
    let line = lines[i].trim_end();
    let len = line.chars().count();
    if !(3..=60).contains(&len) || !ALL_CAPS.is_match(line) {
        return false;
    }
    let preceded_by_blank = i == 0 || lines[i - 1].trim().is_empty();
    let followed_by_non_blank = lines
        .get(i + 1)
        .is_some_and(|next| !next.trim().is_empty());
    preceded_by_blank && followed_by_non_blank
}
