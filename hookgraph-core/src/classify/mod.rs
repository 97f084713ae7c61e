//! Pure enrichment functions
//!
//! Everything here is total and stateless: no I/O, no shared mutable state,
//! and an explicit default for every classifier. Callers may use these from
//! any thread without synchronization.

pub mod files;

use crate::types::{ErrorType, Intent, ToolCategory, ToolContext};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;

pub use files::extract_file_accesses;

/// Marker substituted for sensitive input values
pub const REDACTED: &str = "[REDACTED]";

/// Max length of a normalized error signature
const SIGNATURE_LIMIT: usize = 200;

/// Max length of an error excerpt pulled from tool output
const ERROR_EXCERPT_LIMIT: usize = 500;

// ============================================
// Intent
// ============================================

/// Keyword buckets, checked in order; first hit wins.
const INTENT_BUCKETS: &[(Intent, &[&str])] = &[
    (
        Intent::Debug,
        &["fix", "bug", "error", "broken", "issue", "not working", "crash", "fail"],
    ),
    (
        Intent::Refactor,
        &["refactor", "clean", "reorganize", "restructure", "simplify", "improve"],
    ),
    (
        Intent::Search,
        &["find", "search", "where", "locate", "which file", "look for"],
    ),
    (
        Intent::Explain,
        &["explain", "what does", "how does", "why", "understand", "what is"],
    ),
    (
        Intent::Review,
        &["review", "check", "look at", "analyze", "examine", "inspect"],
    ),
];

/// Classify what a prompt asks for.
pub fn classify_intent(text: &str) -> Intent {
    let text = text.to_lowercase();
    INTENT_BUCKETS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| text.contains(kw)))
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::Implement)
}

// ============================================
// Tools
// ============================================

/// Classify a tool into its coarse family.
pub fn classify_tool_category(tool_name: &str) -> ToolCategory {
    if tool_name.starts_with("mcp__") {
        return ToolCategory::Mcp;
    }
    match tool_name {
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => ToolCategory::FileOps,
        "Grep" | "Glob" => ToolCategory::Search,
        "Bash" | "BashOutput" | "KillShell" => ToolCategory::Bash,
        "WebFetch" | "WebSearch" => ToolCategory::Web,
        "Task" | "TodoWrite" | "TodoRead" | "Agent" | "Subagent" => ToolCategory::Task,
        "AskUserQuestion" => ToolCategory::Question,
        "EnterPlanMode" | "ExitPlanMode" => ToolCategory::Plan,
        _ => ToolCategory::Other,
    }
}

static VERIFY_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(test|tests|pytest|jest|vitest|mocha|rspec|build|make|lint|clippy|check|tsc|mypy|ruff|eslint|flake8|vet)\b",
    )
    .expect("hardcoded regex")
});

/// Classify the role a tool call plays.
///
/// Shell commands mentioning test/build tooling count as verification.
pub fn classify_tool_context(tool_name: &str, input: &Value) -> ToolContext {
    match tool_name {
        "Read" | "Glob" | "Grep" | "LS" | "WebFetch" | "WebSearch" | "TodoRead"
        | "NotebookRead" => ToolContext::Exploration,
        "Bash" => {
            let command = input.get("command").and_then(Value::as_str).unwrap_or("");
            if VERIFY_COMMAND.is_match(command) {
                ToolContext::Verification
            } else {
                ToolContext::Implementation
            }
        }
        _ => ToolContext::Implementation,
    }
}

// ============================================
// Errors
// ============================================

const ERROR_TYPE_RULES: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::Permission,
        &[
            "permission denied",
            "access denied",
            "not permitted",
            "eacces",
            "eperm",
            "forbidden",
            "unauthorized",
        ],
    ),
    (
        ErrorType::NotFound,
        &[
            "not found",
            "no such file",
            "does not exist",
            "enoent",
            "cannot find",
            "could not find",
        ],
    ),
    (
        ErrorType::Timeout,
        &["timed out", "timeout", "deadline exceeded"],
    ),
    (
        ErrorType::Syntax,
        &[
            "syntaxerror",
            "syntax error",
            "parse error",
            "unexpected token",
            "invalid syntax",
            "indentationerror",
        ],
    ),
    (
        ErrorType::Validation,
        &[
            "invalid",
            "validation",
            "must be",
            "expected",
            "required",
            "typeerror",
            "valueerror",
        ],
    ),
];

/// Classify an error message; ordered substring checks, default runtime.
pub fn classify_error_type(message: &str) -> ErrorType {
    let message = message.to_lowercase();
    ERROR_TYPE_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| message.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorType::Runtime)
}

static DATETIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}(?:[t ]\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?)?")
        .expect("hardcoded regex")
});
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?\b").expect("hardcoded regex")
});
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[a-z]:)?[\w.~-]*(?:[\\/][\w.-]+)+[\\/]?").expect("hardcoded regex")
});
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(line|ln|col|column)\s*:?\s*\d+").expect("hardcoded regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("hardcoded regex"));
static SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("hardcoded regex"));

/// Reduce an error message to a dedup key.
///
/// Paths, dates, times and line numbers become placeholders so the same
/// kind of failure on different files yields the same signature.
pub fn normalize_error_signature(message: &str, tool_name: &str) -> String {
    let text = message.to_lowercase();
    let text = DATETIME_RE.replace_all(&text, "<DATE>");
    let text = TIME_RE.replace_all(&text, "<TIME>");
    let text = PATH_RE.replace_all(&text, "<PATH>");
    let text = LINE_RE.replace_all(&text, "$1 <N>");
    let text = NUMBER_RE.replace_all(&text, "<N>");
    let text = SPACE_RE.replace_all(text.trim(), " ");
    truncate(&format!("{}: {}", tool_name, text), SIGNATURE_LIMIT)
}

/// Result of scanning a tool response for failure signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub error: Option<String>,
    pub interrupted: bool,
}

const OUTPUT_ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "traceback",
    "fatal",
    "denied",
];

fn mentions_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    OUTPUT_ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Infer success from a tool response when the host gives no explicit flag.
pub fn detect_outcome(response: &Value) -> Outcome {
    match response {
        Value::Null => Outcome {
            success: true,
            error: None,
            interrupted: false,
        },
        Value::Object(map) => {
            let interrupted = map
                .get("interrupted")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let explicit_error = map
                .get("error")
                .and_then(Value::as_str)
                .filter(|e| !e.trim().is_empty());
            let flagged = map.get("success").and_then(Value::as_bool) == Some(false)
                || map.get("is_error").and_then(Value::as_bool) == Some(true);
            if explicit_error.is_some() || flagged {
                return Outcome {
                    success: false,
                    error: explicit_error.map(|e| truncate(e.trim(), ERROR_EXCERPT_LIMIT)),
                    interrupted,
                };
            }

            let stdout = map.get("stdout").and_then(Value::as_str).unwrap_or("");
            let stderr = map.get("stderr").and_then(Value::as_str).unwrap_or("");
            let has_error = mentions_error(stdout) || mentions_error(stderr);

            let error = if !has_error {
                None
            } else if !stderr.trim().is_empty() {
                Some(truncate(stderr.trim(), ERROR_EXCERPT_LIMIT))
            } else {
                let lines: Vec<&str> = stdout.lines().filter(|l| mentions_error(l)).take(5).collect();
                Some(truncate(&lines.join("\n"), ERROR_EXCERPT_LIMIT))
            };

            Outcome {
                success: !has_error && !interrupted,
                error,
                interrupted,
            }
        }
        Value::String(text) => {
            let has_error = mentions_error(text);
            Outcome {
                success: !has_error,
                error: has_error.then(|| truncate(text, ERROR_EXCERPT_LIMIT)),
                interrupted: false,
            }
        }
        _ => Outcome {
            success: true,
            error: None,
            interrupted: false,
        },
    }
}

// ============================================
// Paths, text and keywords
// ============================================

/// Canonicalize separators and drop empty or `.` segments.
///
/// Idempotent: `normalize_path(&normalize_path(p)) == normalize_path(p)`.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    if unified.is_empty() {
        return String::new();
    }
    let absolute = unified.starts_with('/');
    let joined = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "him", "his", "how", "its", "may", "new", "now", "old",
    "see", "two", "way", "who", "did", "get", "got", "let", "put", "say", "she", "too", "use",
    "this", "that", "with", "from", "into", "onto", "then", "than", "them", "they", "there",
    "their", "these", "those", "what", "when", "where", "which", "while", "will", "would",
    "should", "could", "about", "after", "before", "also", "just", "like", "make", "some",
    "such", "very", "want", "need", "please", "thanks", "your", "yours", "been", "being",
    "does", "doing", "done", "each", "here", "more", "most", "only", "other", "over", "same",
    "so", "to", "of", "in", "on", "at", "by", "is", "it", "be", "as", "an", "or", "if", "do",
    "we", "my", "me", "up", "no", "can't", "don't", "i'm", "it's",
];

/// Tokenize, drop stop words, dedupe in first-seen order, cap at `limit`.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '\''))
        .map(|token| token.trim_matches('\''))
        .filter(|token| token.chars().count() >= 3)
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .filter(|token| !STOP_WORDS.contains(token))
        .filter(|token| seen.insert(token.to_string()))
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// |a ∩ b| / |a ∪ b|; two empty sets overlap fully.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Truncate on a char boundary.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// sha256 hex digest
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

// ============================================
// Input sanitizing
// ============================================

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "api_key",
    "token",
    "secret",
    "auth",
    "credential",
    "key",
];

/// Replace values under sensitive-looking keys with a marker.
pub fn sanitize_input(input: &Value) -> Value {
    match input {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), sanitize_input(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_input).collect()),
        other => other.clone(),
    }
}

/// Render a response value as text for storage.
pub fn response_text(response: &Value) -> Option<String> {
    match response {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let stdout = map.get("stdout").and_then(Value::as_str);
            let stderr = map.get("stderr").and_then(Value::as_str);
            match (stdout, stderr) {
                (Some(out), Some(err)) if !err.is_empty() => Some(format!("{}\n{}", out, err)),
                (Some(out), _) => Some(out.to_string()),
                _ => Some(response.to_string()),
            }
        }
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_intent_buckets() {
        assert_eq!(classify_intent("fix the login bug"), Intent::Debug);
        assert_eq!(classify_intent("Please refactor the parser"), Intent::Refactor);
        assert_eq!(classify_intent("where is the config loaded"), Intent::Search);
        assert_eq!(classify_intent("explain this function"), Intent::Explain);
        assert_eq!(classify_intent("review my changes"), Intent::Review);
        assert_eq!(classify_intent("add a signup form"), Intent::Implement);
        assert_eq!(classify_intent(""), Intent::Implement);
    }

    #[test]
    fn test_classify_intent_first_bucket_wins() {
        // "fix" (debug) beats "refactor"
        assert_eq!(classify_intent("refactor and fix the parser"), Intent::Debug);
    }

    #[test]
    fn test_tool_category() {
        assert_eq!(classify_tool_category("Read"), ToolCategory::FileOps);
        assert_eq!(classify_tool_category("Glob"), ToolCategory::Search);
        assert_eq!(classify_tool_category("mcp__neo4j__query"), ToolCategory::Mcp);
        assert_eq!(classify_tool_category("Task"), ToolCategory::Task);
        assert_eq!(classify_tool_category("Unknown"), ToolCategory::Other);
    }

    #[test]
    fn test_tool_context() {
        assert_eq!(
            classify_tool_context("Read", &json!({})),
            ToolContext::Exploration
        );
        assert_eq!(
            classify_tool_context("Edit", &json!({})),
            ToolContext::Implementation
        );
        assert_eq!(
            classify_tool_context("Bash", &json!({"command": "cargo test --all"})),
            ToolContext::Verification
        );
        assert_eq!(
            classify_tool_context("Bash", &json!({"command": "npm run build"})),
            ToolContext::Verification
        );
        assert_eq!(
            classify_tool_context("Bash", &json!({"command": "mkdir out"})),
            ToolContext::Implementation
        );
    }

    #[test]
    fn test_error_type_order() {
        assert_eq!(classify_error_type("not found"), ErrorType::NotFound);
        assert_eq!(
            classify_error_type("Permission denied: file not found"),
            ErrorType::Permission
        );
        assert_eq!(classify_error_type("Request timed out"), ErrorType::Timeout);
        assert_eq!(
            classify_error_type("SyntaxError: unexpected token"),
            ErrorType::Syntax
        );
        assert_eq!(
            classify_error_type("invalid value for field"),
            ErrorType::Validation
        );
        assert_eq!(classify_error_type("segfault"), ErrorType::Runtime);
    }

    #[test]
    fn test_error_signature_strips_variable_parts() {
        let a = normalize_error_signature(
            "File /home/a/src/auth.py line 42: not found at 2024-01-02 10:11:12",
            "Read",
        );
        let b = normalize_error_signature(
            "File /tmp/other/db.py line 7: not found at 2025-06-30 01:02:03",
            "Read",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("Read: "));
        assert!(a.contains("<PATH>"));
        assert!(!a.contains("42"));
    }

    #[test]
    fn test_error_signature_truncated() {
        let long = "x".repeat(1000);
        assert!(normalize_error_signature(&long, "Bash").chars().count() <= SIGNATURE_LIMIT);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(r"C:\Users\a\file.rs"), "C:/Users/a/file.rs");
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_normalize_path_idempotent() {
        let samples = [
            r"C:\a\\b\.\c",
            "/a/b/../c",
            "//server/share",
            "./.",
            "a /b/",
            r"\\",
            ".",
            " spaced / path ",
            "",
        ];
        for p in samples {
            let once = normalize_path(p);
            assert_eq!(normalize_path(&once), once, "not idempotent for {:?}", p);
        }
    }

    #[test]
    fn test_extract_keywords() {
        let kws = extract_keywords("Fix the login bug in the login form, login is broken", 20);
        assert_eq!(kws, vec!["fix", "login", "bug", "form", "broken"]);

        let capped = extract_keywords("alpha beta gamma delta epsilon", 2);
        assert_eq!(capped, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_jaccard() {
        let a = vec!["login".to_string(), "bug".to_string()];
        let b = vec!["login".to_string(), "form".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&[], &[]), 1.0);
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_sanitize_input() {
        let input = json!({
            "command": "curl",
            "api_key": "sk-123",
            "nested": {"password": "hunter2", "path": "/a"},
            "list": [{"token": "t"}]
        });
        let clean = sanitize_input(&input);
        assert_eq!(clean["command"], "curl");
        assert_eq!(clean["api_key"], REDACTED);
        assert_eq!(clean["nested"]["password"], REDACTED);
        assert_eq!(clean["nested"]["path"], "/a");
        assert_eq!(clean["list"][0]["token"], REDACTED);
    }

    #[test]
    fn test_detect_outcome() {
        assert!(detect_outcome(&Value::Null).success);

        let ok = detect_outcome(&json!({"stdout": "all good", "stderr": ""}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = detect_outcome(&json!({"stdout": "", "stderr": "fatal: not a git repository"}));
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("fatal: not a git repository"));

        let interrupted = detect_outcome(&json!({"stdout": "", "interrupted": true}));
        assert!(!interrupted.success);
        assert!(interrupted.interrupted);

        let explicit = detect_outcome(&json!({"error": "File does not exist."}));
        assert!(!explicit.success);

        let text = detect_outcome(&json!("Traceback (most recent call last)"));
        assert!(!text.success);

        // File contents are not scanned for keywords
        let read = detect_outcome(&json!({"file": {"content": "error handling code"}}));
        assert!(read.success);
    }

    #[test]
    fn test_content_hash_and_words() {
        assert_eq!(content_hash("abc").len(), 64);
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_eq!(word_count("fix the  login bug"), 4);
    }
}
