//! Structured-field extraction from agent output
//!
//! Agents end their responses with a sentinel header followed by
//! `key: value` lines. A long response may contain the sentinel several
//! times (retried reasoning); only the final block is authoritative, so
//! extraction always starts from the last occurrence.

use crate::manifest::PipelineCommand;
use crate::taxonomy::ErrorCategory;

/// Header that introduces the structured status block
pub const STATUS_SENTINEL: &str = "## STEWARD_STATUS";

/// Header that introduces the always-emitted structured error block
pub const ERROR_SENTINEL: &str = "## STEWARD_ERROR";

/// Extract `key: value` fields following the LAST occurrence of `sentinel`
///
/// Parsing runs until a blank line (after at least one field), a new
/// markdown-style header, or end of text. Lines that do not look like
/// `key: value` are skipped, never errors. Field order is preserved.
pub fn extract_fields(text: &str, sentinel: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();

    let Some(start) = find_last_sentinel(text, sentinel) else {
        return fields;
    };

    let after = &text[start + sentinel.len()..];
    for line in after.lines().skip(1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            // Blank lines before the first field are tolerated; a blank
            // after fields began ends the block.
            if fields.is_empty() {
                continue;
            }
            break;
        }
        if trimmed.starts_with('#') {
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        fields.push((key.to_string(), value.trim().to_string()));
    }

    fields
}

/// Look up a field by key in an extracted field list
pub fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Byte offset of the last sentinel occurrence that starts a line
fn find_last_sentinel(text: &str, sentinel: &str) -> Option<usize> {
    let mut found = None;
    let mut from = 0;
    while let Some(idx) = text[from..].find(sentinel) {
        let absolute = from + idx;
        let at_line_start = absolute == 0 || text.as_bytes()[absolute - 1] == b'\n';
        if at_line_start {
            found = Some(absolute);
        }
        from = absolute + sentinel.len();
    }
    found
}

/// Render the structured error block emitted whenever a pipeline stage fails
pub fn render_error_block(
    category: ErrorCategory,
    command: PipelineCommand,
    phase: u32,
    details: &str,
    retry_eligible: bool,
    retries_remaining: u32,
    checkpoint: Option<&str>,
) -> String {
    let mut block = String::new();
    block.push_str(ERROR_SENTINEL);
    block.push('\n');
    block.push_str(&format!("category: {}\n", category));
    block.push_str(&format!("command: {}\n", command));
    block.push_str(&format!("phase: {}\n", phase));
    block.push_str(&format!("details: {}\n", details.replace('\n', " ")));
    block.push_str(&format!("retry_eligible: {}\n", retry_eligible));
    block.push_str(&format!("retries_remaining: {}\n", retries_remaining));
    block.push_str(&format!("checkpoint: {}\n", checkpoint.unwrap_or("none")));
    block
}
