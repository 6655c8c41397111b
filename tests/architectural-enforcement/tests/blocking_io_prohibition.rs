//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Engine production code MUST NOT block the runtime.
//! **Required**: Use `tokio::fs`, `tokio::net`, `tokio::io`, and async
//! `reqwest`, not their `std` counterparts, inside async functions.
//!
//! Blocking calls in plain `fn`s are allowed: configuration is read before
//! the runtime does any work.

use architectural_enforcement::{
    enclosing_fn_is_async, production_sources, strip_comment, SourceFile, PRODUCTION_DIRS,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| production_sources(dir))
        .flat_map(|file| find_blocking_io(&file))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O calls found in async production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nForbidden inside async fns:");
        eprintln!("  - std::fs::*, std::net::*, std::process::Command");
        eprintln!("  - std::io::stdin(), std::io::stdout()");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\nUse instead:");
        eprintln!("  - tokio::fs, tokio::net, tokio::process, tokio::io::stdin()");
        eprintln!("  - async reqwest::Client");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

/// Blocking patterns and what they are
const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    ("std::thread::sleep", "Blocking sleep"),
];

fn find_blocking_io(file: &SourceFile) -> Vec<String> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = strip_comment(line);

        // Never acceptable, async or not
        if code.contains("reqwest::blocking") {
            violations.push(file.violation(idx, "Blocking HTTP client"));
            continue;
        }

        // A module-level import would make every later call look innocent
        if code.trim_start().starts_with("use std::fs") || code.trim_start().starts_with("use std::net") {
            violations.push(file.violation(idx, "Blocking I/O import"));
            continue;
        }

        if enclosing_fn_is_async(&lines, idx) != Some(true) {
            continue;
        }
        for (pattern, what) in BLOCKING_PATTERNS {
            if code.contains(pattern) {
                violations.push(file.violation(idx, what));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scan(code: &str) -> Vec<String> {
        find_blocking_io(&SourceFile::from_content(PathBuf::from("x.rs"), code))
    }

    #[test]
    fn test_blocking_io_detection() {
        let violations = scan(
            "async fn bad_function() {\n    let contents = std::fs::read_to_string(\"file.txt\")?;\n}\n",
        );
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("Blocking file I/O"));
    }

    #[test]
    fn test_non_async_function_is_allowed() {
        let violations = scan(
            "fn read_config_file() {\n    let contents = std::fs::read_to_string(\"engine.toml\")?;\n}\n",
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_blocking_client_always_flagged() {
        let violations = scan("fn fetch() {\n    reqwest::blocking::get(\"http://x\");\n}\n");
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_unit_test_module_is_ignored() {
        let violations = scan(
            "#[cfg(test)]\nmod tests {\n    async fn helper() {\n        std::fs::remove_file(\"x\");\n    }\n}\n",
        );
        assert!(violations.is_empty());
    }
}
