use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::NormalizeError;

/// Markdown code fences, with or without a language tag.
static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*([A-Za-z]*)[ \t]*\r?\n?(.*?)```").unwrap());

/// Locate the verdict object inside free-form LLM output.
///
/// Fenced blocks are tried first (```json before untagged fences), then every
/// balanced top-level `{...}` span of the whole text, in order. The first
/// candidate that parses as a JSON object wins.
pub fn extract_json_object(raw: &str) -> Result<Map<String, Value>, NormalizeError> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    for caps in FENCED_BLOCK.captures_iter(raw) {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str()).trim();
        if lang.eq_ignore_ascii_case("json") {
            tagged.push(body);
        } else if lang.is_empty() {
            untagged.push(body);
        }
    }

    for candidate in tagged.into_iter().chain(untagged) {
        if let Some(object) = parse_object(candidate) {
            return Ok(object);
        }
        // A fence may hold prose around the object.
        if let Some(object) = brace_spans(candidate).into_iter().find_map(parse_object) {
            return Ok(object);
        }
    }

    if let Some(object) = brace_spans(raw).into_iter().find_map(parse_object) {
        return Ok(object);
    }

    let preview: String = raw.trim().chars().take(80).collect();
    Err(NormalizeError::UnparsableResponse(if preview.is_empty() {
        "empty response".to_string()
    } else {
        format!("no JSON object found in response starting {preview:?}")
    }))
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Top-level `{...}` spans, found by brace counting that skips string literals.
///
/// Scanning stops at the first opening brace that never closes: everything
/// after it belongs to that unfinished object, so nested objects are never
/// returned as top-level candidates.
fn brace_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        match matching_close(bytes, start) {
            Some(end) => {
                spans.push(&text[start..=end]);
                cursor = end + 1;
            }
            None => break,
        }
    }
    spans
}

fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
