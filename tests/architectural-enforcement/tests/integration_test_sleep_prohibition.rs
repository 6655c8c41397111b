//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Engine production code MUST NOT call sleep methods. Waiting
//! happens on I/O, channels, `tokio::time::timeout` and `tokio::time::interval`.
//! **Exception**: the reconnect backoff wait between connection attempts.

use architectural_enforcement::{production_sources, strip_comment, SourceFile, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let policy = SleepPolicy { allow_backoff: true };
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| production_sources(dir))
        .flat_map(|file| find_sleeps(&file, &policy))
        .collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable:");
        eprintln!("  - Reconnect backoff waits");
        eprintln!("  - Periodic work via tokio::time::interval()");
        eprintln!("  - Test code");
        eprintln!("\nForbidden:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

struct SleepPolicy {
    allow_backoff: bool,
}

fn find_sleeps(file: &SourceFile, policy: &SleepPolicy) -> Vec<String> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = strip_comment(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            continue;
        }
        if code.contains("std::thread::sleep") {
            violations.push(file.violation(idx, "Thread sleep"));
            continue;
        }
        if policy.allow_backoff && is_backoff_context(&lines, idx) {
            continue;
        }
        violations.push(file.violation(idx, "Sleep"));
    }
    violations
}

/// Check if sleep waits out a computed reconnect delay
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..=current_idx;

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for line in &lines[context_range] {
        let line = line.to_lowercase();

        if line.contains("next_delay")
            || line.contains("delay_for_attempt")
            || line.contains("<<")
            || line.contains("pow")
        {
            has_backoff_calc = true;
        }

        if line.contains("reconnect") || line.contains("backoff") || line.contains("attempt") {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scan(code: &str) -> Vec<String> {
        let file = SourceFile::from_content(PathBuf::from("x.rs"), code);
        find_sleeps(&file, &SleepPolicy { allow_backoff: true })
    }

    #[test]
    fn test_sleep_violation_detection() {
        let violations = scan(
            "async fn poll() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n",
        );
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_backoff_detection() {
        let lines = [
            "async fn reconnect(&mut self) {",
            "    let Some(delay) = self.backoff.next_delay() else { return };",
            "    tracing::info!(attempt, \"Reconnect scheduled\");",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&lines, 3));
    }

    #[test]
    fn test_thread_sleep_never_allowed() {
        let violations = scan(
            "fn reconnect() {\n    let delay = backoff.next_delay();\n    std::thread::sleep(delay);\n}\n",
        );
        assert_eq!(violations.len(), 1);
    }
}
