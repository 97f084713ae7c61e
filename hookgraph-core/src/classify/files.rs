//! File access extraction
//!
//! Finds every path a tool call touched: the tool's own target, paths named
//! in shell commands, and the files a Glob or Grep returned.

use super::normalize_path;
use crate::types::{AccessMode, FileAccess};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Upper bound on expansion results kept per call
const MAX_EXPANSIONS: usize = 100;

/// Shell command patterns: (regex, mode of each capture group)
static BASH_PATTERNS: LazyLock<Vec<(Regex, &'static [AccessMode])>> = LazyLock::new(|| {
    let rules: &[(&str, &'static [AccessMode])] = &[
        (r"^find\s+([^\s|;&]+)", &[AccessMode::Search]),
        (r"^ls\s+(?:-[a-zA-Z]+\s+)*([^\s|>;&]+)", &[AccessMode::Search]),
        (
            r"^(?:cat|head|tail|less|wc)\s+(?:-[a-zA-Z0-9]+\s+)*([^\s|>;&]+)",
            &[AccessMode::Read],
        ),
        (
            r"^cp\s+(?:-[a-zA-Z]+\s+)*([^\s]+)\s+([^\s;&|]+)",
            &[AccessMode::Read, AccessMode::Write],
        ),
        (
            r"^mv\s+(?:-[a-zA-Z]+\s+)*([^\s]+)\s+([^\s;&|]+)",
            &[AccessMode::Modify, AccessMode::Write],
        ),
        (r"^rm\s+(?:-[a-zA-Z]+\s+)*([^\s;&|]+)", &[AccessMode::Modify]),
        (r"^mkdir\s+(?:-[a-zA-Z]+\s+)*([^\s;&|]+)", &[AccessMode::Write]),
        (r"^touch\s+([^\s;&|]+)", &[AccessMode::Write]),
        (
            r"^python3?\s+(?:-[a-zA-Z]+\s+)*([^\s]+\.py)",
            &[AccessMode::Execute],
        ),
        (r"^git\s+add\s+([^\s;&|]+)", &[AccessMode::Read]),
        (r"^(?:chmod|chown)\s+[^\s]+\s+([^\s;&|]+)", &[AccessMode::Modify]),
        (r"^cd\s+([^\s;&|]+)", &[AccessMode::Search]),
    ];
    rules
        .iter()
        .map(|(pattern, modes)| {
            (
                Regex::new(&format!("(?i){}", pattern)).expect("hardcoded regex"),
                *modes,
            )
        })
        .collect()
});

static COMMAND_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&&|\|\||;|\n").expect("hardcoded regex"));

/// Access mode a tool implies for its own target
fn tool_access_mode(tool_name: &str) -> Option<AccessMode> {
    match tool_name {
        "Read" | "NotebookRead" => Some(AccessMode::Read),
        "Write" => Some(AccessMode::Write),
        "Edit" | "MultiEdit" | "NotebookEdit" => Some(AccessMode::Modify),
        "Glob" | "Grep" => Some(AccessMode::Search),
        "Bash" | "BashOutput" => Some(AccessMode::Execute),
        _ => None,
    }
}

fn input_path(input: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| input.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Paths named by a shell command, with the mode each is used in.
pub fn extract_bash_paths(command: &str) -> Vec<(String, AccessMode)> {
    let mut found = Vec::new();
    for segment in COMMAND_SPLIT.split(command) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        for (pattern, modes) in BASH_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(segment) {
                for (i, mode) in modes.iter().enumerate() {
                    if let Some(m) = caps.get(i + 1) {
                        let raw = m.as_str().trim_matches(|c| c == '"' || c == '\'');
                        if raw.is_empty() || raw.starts_with('-') || raw.contains('*') {
                            continue;
                        }
                        found.push((raw.to_string(), *mode));
                    }
                }
                break;
            }
        }
    }
    found
}

/// File names listed in a Glob or Grep response.
///
/// Accepts a `filenames` array, or text with one path per line
/// (Grep's `file:line:content` form is reduced to the file part).
pub fn extract_result_paths(response: &Value) -> Vec<String> {
    if let Some(names) = response.get("filenames").and_then(Value::as_array) {
        return names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    let text = match response {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map
            .get("content")
            .or_else(|| map.get("output"))
            .or_else(|| map.get("stdout"))
            .and_then(Value::as_str)
            .unwrap_or(""),
        _ => "",
    };

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(grep_line_path)
        .collect()
}

fn grep_line_path(line: &str) -> Option<String> {
    // Windows drive letters carry a colon of their own
    let search_from = if line.len() > 2 && line.as_bytes()[1] == b':' { 2 } else { 0 };
    let path = match line[search_from..].find(':') {
        Some(idx) => {
            let rest = &line[search_from + idx + 1..];
            if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                &line[..search_from + idx]
            } else {
                line
            }
        }
        None => line,
    };
    let looks_like_path = path.contains('/') || path.contains('\\') || path.contains('.');
    (looks_like_path && !path.contains(' ') && !path.starts_with("Found ")).then(|| path.to_string())
}

/// Every file a tool call touched, primary targets first, deduplicated.
pub fn extract_file_accesses(
    tool_name: &str,
    input: &Value,
    response: Option<&Value>,
) -> Vec<FileAccess> {
    let mut accesses = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |path: &str, mode: AccessMode, is_primary: bool, is_expansion: bool| {
        let normalized = normalize_path(path);
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            return;
        }
        accesses.push(FileAccess {
            path: normalized,
            mode,
            is_primary,
            is_expansion,
        });
    };

    match tool_name {
        "Bash" | "BashOutput" => {
            if let Some(command) = input.get("command").and_then(Value::as_str) {
                for (path, mode) in extract_bash_paths(command) {
                    push(&path, mode, true, false);
                }
            }
        }
        _ => {
            if let Some(mode) = tool_access_mode(tool_name) {
                if let Some(path) =
                    input_path(input, &["file_path", "filePath", "notebook_path", "path"])
                {
                    push(&path, mode, true, false);
                }
            }
        }
    }

    if matches!(tool_name, "Glob" | "Grep") {
        if let Some(response) = response {
            for path in extract_result_paths(response).iter().take(MAX_EXPANSIONS) {
                push(path, AccessMode::Search, false, true);
            }
        }
    }

    accesses
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primary_path_from_input() {
        let files = extract_file_accesses("Read", &json!({"file_path": "/a/auth.py"}), None);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/a/auth.py");
        assert_eq!(files[0].mode, AccessMode::Read);
        assert!(files[0].is_primary);

        let files = extract_file_accesses("Edit", &json!({"filePath": "C:\\src\\main.rs"}), None);
        assert_eq!(files[0].path, "C:/src/main.rs");
        assert_eq!(files[0].mode, AccessMode::Modify);
    }

    #[test]
    fn test_unknown_tool_has_no_files() {
        let files = extract_file_accesses("WebFetch", &json!({"url": "https://x"}), None);
        assert!(files.is_empty());
    }

    #[test]
    fn test_bash_paths() {
        let paths = extract_bash_paths("cat README.md && cp src/a.rs backup/a.rs; rm -rf target");
        assert_eq!(
            paths,
            vec![
                ("README.md".to_string(), AccessMode::Read),
                ("src/a.rs".to_string(), AccessMode::Read),
                ("backup/a.rs".to_string(), AccessMode::Write),
                ("target".to_string(), AccessMode::Modify),
            ]
        );
        assert!(extract_bash_paths("rm *.tmp").is_empty());
        assert_eq!(
            extract_bash_paths("python3 scripts/run.py --fast"),
            vec![("scripts/run.py".to_string(), AccessMode::Execute)]
        );
    }

    #[test]
    fn test_glob_expansion() {
        let response = json!({"filenames": ["/p/a.rs", "/p/b.rs", "/p/a.rs"]});
        let files = extract_file_accesses("Glob", &json!({"pattern": "**/*.rs", "path": "/p"}), Some(&response));
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, "/p");
        assert!(files[0].is_primary);
        assert!(files[1].is_expansion);
        assert!(!files[1].is_primary);
        assert_eq!(files[2].path, "/p/b.rs");
    }

    #[test]
    fn test_grep_output_lines() {
        let response = json!("src/lib.rs:12:fn main()\nsrc/db.rs:3:use x;\nFound 2 files");
        let paths = extract_result_paths(&response);
        assert_eq!(paths, vec!["src/lib.rs", "src/db.rs"]);

        let windows = extract_result_paths(&json!("C:\\p\\a.rs:4:let x"));
        assert_eq!(windows, vec!["C:\\p\\a.rs"]);
    }
}
