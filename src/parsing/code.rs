//! Code response parsing (§4.4, §6): `### Summary`, `### Files
//! Modified`/`Created`/`Changed`, fenced code blocks paired with the nearest
//! preceding back-quoted filename, `### Tests Created`/`Written`/`Added`,
//! `### Commands Run`, `### Status COMPLETE|BLOCKED`, and the
//! `STEP BLOCKED: <reason>` sentinel.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{CodeOutput, FileAction, FileChange};

static BLOCKED_SENTINEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"STEP BLOCKED:\s*(.+)").unwrap());
static FILENAME_BACKTICK: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+\.[A-Za-z0-9_]+)`").unwrap());
static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)\n(.*?)```").unwrap());
static COMMAND_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[$#>]\s*(.+)$").unwrap());

const FILE_HEADERS: [&str; 3] = ["### Files Modified", "### Files Created", "### Files Changed"];
const TEST_HEADERS: [&str; 3] = ["### Tests Created", "### Tests Written", "### Tests Added"];

fn section_after(text: &str, header: &str) -> Option<String> {
    let start = text.find(header)? + header.len();
    let rest = &text[start..];
    let end = rest.find("\n### ").unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn first_present_section<'a>(text: &str, headers: &'a [&'a str]) -> Option<(String, &'a str)> {
    headers.iter().find_map(|h| section_after(text, h).map(|body| (body, *h)))
}

/// Extracts `{path -> content}` pairs from a section: for each fenced block,
/// finds the nearest preceding back-quoted filename within the same
/// section.
fn extract_files(section_text: &str) -> Vec<FileChange> {
    let mut files = Vec::new();
    let mut last_filename: Option<String> = None;
    let mut cursor = 0usize;

    loop {
        let Some(fence_match) = FENCE.find(&section_text[cursor..]) else {
            break;
        };
        let abs_start = cursor + fence_match.start();
        let preceding = &section_text[cursor..abs_start];
        if let Some(name_match) = FILENAME_BACKTICK.find_iter(preceding).last() {
            last_filename = Some(name_match.as_str().trim_matches('`').to_string());
        }

        let caps = FENCE.captures(&section_text[abs_start..]).unwrap();
        let language = caps.get(1).map(|m| m.as_str().to_string()).filter(|s| !s.is_empty());
        let content = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();

        if let Some(path) = last_filename.clone() {
            files.push(FileChange {
                path,
                action: FileAction::Modified,
                content,
                language,
            });
        }

        cursor = abs_start + fence_match.end();
    }

    files
}

fn extract_commands(section_text: &str) -> Vec<String> {
    section_text
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                return None;
            }
            COMMAND_LINE.captures(trimmed).map(|c| c[1].trim().to_string())
        })
        .collect()
}

/// Parses a Coder/Tester LLM response into a [`CodeOutput`].
pub fn parse_code_response(response: &str) -> CodeOutput {
    if let Some(caps) = BLOCKED_SENTINEL.captures(response) {
        return CodeOutput::blocked(caps[1].trim().to_string());
    }

    let summary = section_after(response, "### Summary")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let mut output = CodeOutput::new(summary);

    if let Some((files_section, header)) = first_present_section(response, &FILE_HEADERS) {
        let action = if header.contains("Created") {
            FileAction::Created
        } else {
            FileAction::Modified
        };
        for mut file in extract_files(&files_section) {
            file.action = action;
            output.push_file(file);
        }
    }

    if let Some((tests_section, _)) = first_present_section(response, &TEST_HEADERS) {
        let test_files = extract_files(&tests_section);
        output.test_coverage.has_tests = !test_files.is_empty();
        output.test_coverage.test_count = test_files.len() as u32;
        output.tests = test_files.into_iter().map(|f| f.path).collect();
    }

    if let Some(commands_section) = section_after(response, "### Commands Run") {
        output.commands = extract_commands(&commands_section);
    }

    output.implementation_quality.score = output.compute_quality_score();
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "### Summary\nImplemented the todo storage layer with an in-memory map.\n\n### Files Created\n`src/storage.rs`\n```rust\npub struct Storage;\n```\n\n### Tests Created\n`tests/storage_test.rs`\n```rust\n#[test]\nfn it_works() {}\n```\n\n### Commands Run\n$ cargo fmt\n\n### Status\nCOMPLETE\n";

    #[test]
    fn parses_files_and_tests() {
        let out = parse_code_response(SAMPLE);
        assert!(!out.blocked);
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].path, "src/storage.rs");
        assert!(out.test_coverage.has_tests);
        assert_eq!(out.commands, vec!["cargo fmt".to_string()]);
    }

    #[test]
    fn blocked_sentinel_short_circuits_parsing() {
        let out = parse_code_response("I looked into this.\nSTEP BLOCKED: missing dependency on auth module\n### Summary\nnever reached");
        assert!(out.blocked);
        assert_eq!(out.block_reason.as_deref(), Some("missing dependency on auth module"));
    }
}
