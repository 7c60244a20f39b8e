//! Recursive directory scanner.
//!
//! Enumerates candidate files under a root: depth-first, lexicographic
//! within each directory. Files are excluded when they exceed the size
//! cap, match an ignore pattern, or carry an unrecognized extension.
//! Oversize and ignored exclusions log at warning level; unrecognized
//! extensions are quietly common and log at debug.
//!
//! Ignore patterns combine built-in defaults with a project-local
//! `.kbignore` file (one glob per line, `#` comments). Symbolic links
//! are followed only when requested, with visited canonical paths
//! tracked to break cycles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use crate::error::{KbError, KbResult};
use crate::types::{FileEntry, SourceKind};

/// Name of the project-local ignore file read from the scan root.
pub const IGNORE_FILE: &str = ".kbignore";

static TEST_PATH: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(?i)(test|spec|__tests__)").unwrap()
});

/// Scanner options.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files larger than this are excluded.
    pub max_file_bytes: u64,
    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
    /// Additional ignore patterns beyond defaults and `.kbignore`.
    pub extra_ignores: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            follow_symlinks: false,
            extra_ignores: Vec::new(),
        }
    }
}

/// Directory names and globs excluded from every scan.
fn default_ignores() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "node_modules",
        "target",
        "__pycache__",
        ".venv",
        "venv",
        "dist",
        "build",
        ".next",
        "*.lock",
        "*.min.js",
        "*.map",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

/// Whether any path segment matches test naming conventions.
pub fn is_test_path(rel_path: &Path) -> bool {
    rel_path
        .components()
        .any(|c| TEST_PATH.is_match(&c.as_os_str().to_string_lossy()))
}

/// Enumerate candidate files under `root` in depth-first lexicographic
/// order.
pub fn scan_root(root: &Path, options: &ScanOptions) -> KbResult<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(KbError::NotFound {
            entity: format!("ingestion root '{}'", root.display()),
        });
    }

    let ignores = build_ignore_set(root, options)?;
    let mut entries = Vec::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    if let Ok(canonical) = root.canonicalize() {
        visited.insert(canonical);
    }
    walk(root, root, options, &ignores, &mut visited, &mut entries)?;
    Ok(entries)
}

/// Compile built-in defaults, `.kbignore` contents, and extra patterns
/// into one matcher. Bare patterns match at any depth.
fn build_ignore_set(root: &Path, options: &ScanOptions) -> KbResult<GlobSet> {
    let mut patterns = default_ignores();
    patterns.extend(options.extra_ignores.iter().cloned());

    let ignore_file = root.join(IGNORE_FILE);
    if ignore_file.is_file() {
        let content = std::fs::read_to_string(&ignore_file)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(line.to_string());
        }
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in &patterns {
        for expanded in expand_pattern(pattern) {
            let glob = Glob::new(&expanded).map_err(|e| KbError::Config {
                details: format!("invalid ignore pattern {pattern:?}: {e}"),
            })?;
            builder.add(glob);
        }
    }
    builder.build().map_err(|e| KbError::Config {
        details: format!("failed to compile ignore patterns: {e}"),
    })
}

/// A bare name like `.git` must match at any depth and swallow its
/// contents; an anchored or globbed pattern is taken as written.
fn expand_pattern(pattern: &str) -> Vec<String> {
    if pattern.contains('/') || pattern.starts_with("**") {
        vec![pattern.to_string()]
    } else {
        vec![
            pattern.to_string(),
            format!("**/{pattern}"),
            format!("**/{pattern}/**"),
            format!("{pattern}/**"),
        ]
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    options: &ScanOptions,
    ignores: &GlobSet,
    visited: &mut HashSet<PathBuf>,
    out: &mut Vec<FileEntry>,
) -> KbResult<()> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    children.sort();

    for path in children {
        let rel_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let rel_str = rel_path.to_string_lossy();

        let file_type = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta.file_type(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                continue;
            }
        };

        if file_type.is_symlink() && !options.follow_symlinks {
            tracing::debug!(path = %rel_str, "skipping symlink");
            continue;
        }

        if ignores.is_match(rel_path.as_path()) {
            tracing::warn!(path = %rel_str, "excluded by ignore pattern");
            continue;
        }

        if path.is_dir() {
            if options.follow_symlinks {
                // Cycle prevention: never revisit a canonical directory.
                match path.canonicalize() {
                    Ok(canonical) => {
                        if !visited.insert(canonical) {
                            tracing::debug!(path = %rel_str, "symlink cycle, skipping");
                            continue;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %rel_str, error = %e, "cannot canonicalize, skipping");
                        continue;
                    }
                }
            }
            walk(root, &path, options, ignores, visited, out)?;
            continue;
        }

        if !path.is_file() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let kind = SourceKind::from_extension(&ext);
        if kind == SourceKind::Unknown {
            tracing::debug!(path = %rel_str, "unrecognized extension, skipping");
            continue;
        }

        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size > options.max_file_bytes {
            tracing::warn!(
                path = %rel_str,
                size,
                cap = options.max_file_bytes,
                "file exceeds size cap, skipping"
            );
            continue;
        }

        out.push(FileEntry {
            is_test: is_test_path(&rel_path),
            abs_path: path,
            rel_path,
            size,
            kind,
        });
    }

    Ok(())
}
