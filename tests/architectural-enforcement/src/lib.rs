//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the engine's production code:
//! - No sleep() calls outside reconnect backoff
//! - No blocking I/O inside async functions
//!
//! The helpers here walk the production source trees and hand each test the
//! lines that matter. Unit test modules (everything from the first
//! `#[cfg(test)]` in a file) are not production code and are left out.

use std::path::{Path, PathBuf};

/// Source trees checked by every rule, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["engine/core/src", "engine/cli/src"];

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Production part of one source file
#[derive(Debug)]
pub struct SourceFile {
    /// Path of the file
    pub path: PathBuf,
    /// Lines up to the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Build from file content
    #[must_use]
    pub fn from_content(path: PathBuf, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| line.trim() != "#[cfg(test)]")
            .map(str::to_string)
            .collect();
        Self { path, lines }
    }

    /// Lines as string slices
    #[must_use]
    pub fn line_refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }

    /// Format a violation at `idx`
    #[must_use]
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {}: {}",
            self.path.display(),
            idx + 1,
            what,
            self.lines[idx].trim()
        )
    }
}

/// Every `.rs` file under `dir` (relative to the workspace root)
///
/// Panics if the directory is missing, so a moved crate cannot silently
/// escape the rules.
#[must_use]
pub fn production_sources(dir: &str) -> Vec<SourceFile> {
    let root = workspace_root().join(dir);
    assert!(root.exists(), "source directory {} not found", root.display());

    walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|entry| {
            let content = std::fs::read_to_string(entry.path()).ok()?;
            Some(SourceFile::from_content(entry.path().to_path_buf(), &content))
        })
        .collect()
}

/// Code part of a line, without a trailing `//` comment
#[must_use]
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether a line opens a function, and if so whether it is async
#[must_use]
pub fn fn_signature(line: &str) -> Option<bool> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") || rest.starts_with("const fn ") {
        Some(false)
    } else {
        None
    }
}

/// Whether the closest enclosing function of `idx` is async
///
/// `None` when the line is outside any function.
#[must_use]
pub fn enclosing_fn_is_async(lines: &[&str], idx: usize) -> Option<bool> {
    (0..=idx).rev().find_map(|i| fn_signature(lines[i]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature() {
        assert_eq!(fn_signature("    pub async fn connect(&mut self) {"), Some(true));
        assert_eq!(fn_signature("fn read_config_file(path: &Path) {"), Some(false));
        assert_eq!(fn_signature("    pub(crate) fn helper() {"), Some(false));
        assert_eq!(fn_signature("    let f = fn_pointer;"), None);
    }

    #[test]
    fn test_test_modules_are_dropped() {
        let file = SourceFile::from_content(
            PathBuf::from("x.rs"),
            "fn a() {}\n#[cfg(test)]\nmod tests {\n}\n",
        );
        assert_eq!(file.lines, vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_enclosing_fn() {
        let lines = [
            "fn sync_one() {",
            "}",
            "async fn async_one() {",
            "    body();",
            "}",
        ];
        assert_eq!(enclosing_fn_is_async(&lines, 3), Some(true));
        assert_eq!(enclosing_fn_is_async(&lines, 1), Some(false));
    }
}
