//! Shared utility functions for turnflow.

use regex::Regex;
use std::sync::LazyLock;

static TRAILING_COMMA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid trailing comma regex"));

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, ignoring braces
/// inside string literals.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Extract JSON from a response that may contain markdown or other text.
///
/// Looks for a ```json fence first, then any fence containing a brace, then a
/// raw brace-balanced object.
pub fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            let content = after_marker[json_start..end].trim();
            if !content.is_empty() {
                return Some(content.to_string());
            }
        }
    }

    extract_json_object(response)
}

/// Repair the structural slips models commonly make in JSON output:
/// trailing commas, and single-quoted strings when no double quotes exist.
pub fn repair_json(json: &str) -> String {
    let mut repaired = TRAILING_COMMA_REGEX.replace_all(json, "$1").into_owned();
    if !repaired.contains('"') && repaired.contains('\'') {
        repaired = repaired.replace('\'', "\"");
    }
    repaired
}

/// Extract, repair and parse the JSON object in `response`.
pub fn parse_json_lenient(response: &str) -> Option<serde_json::Value> {
    let json = extract_json(response)?;
    match serde_json::from_str::<serde_json::Value>(&json) {
        Ok(value) if value.is_object() => Some(value),
        _ => serde_json::from_str::<serde_json::Value>(&repair_json(&json))
            .ok()
            .filter(|v| v.is_object()),
    }
}

/// Whether `text` looks like a raw structured payload rather than prose.
pub fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || trimmed.starts_with("```json")
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
