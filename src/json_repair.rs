//! Pulls a JSON value out of model output.
//!
//! Models wrap JSON in code fences, add prose around it, or stop mid-object.
//! Extraction tries, in order: a fenced block, the whole text, the outermost
//! balanced `{...}` / `[...]` span, and finally closing unbalanced structures.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("Invalid fence regex");
}

/// Unclosed openers in nesting order.
#[derive(Debug, Default, Clone)]
struct Balance {
    open: Vec<char>,
    in_string: bool,
    mismatched: bool,
}

fn scan(text: &str) -> Balance {
    let mut state = Balance::default();
    let mut escape_next = false;
    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if state.in_string => escape_next = true,
            '"' => state.in_string = !state.in_string,
            '{' | '[' if !state.in_string => state.open.push(ch),
            '}' | ']' if !state.in_string => {
                let expected = if ch == '}' { '{' } else { '[' };
                if state.open.pop() != Some(expected) {
                    state.mismatched = true;
                    return state;
                }
            }
            _ => {}
        }
    }
    state
}

/// Detects if a JSON string is incomplete (unbalanced braces/quotes)
pub fn is_json_complete(json_str: &str) -> bool {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return false;
    }
    let state = scan(trimmed);
    !state.in_string && !state.mismatched && state.open.is_empty()
}

/// Attempts to repair incomplete JSON by closing unclosed structures innermost first
pub fn repair_json(json_str: &str) -> String {
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }

    let state = scan(trimmed);
    let mut result = trimmed.to_string();
    if state.in_string {
        result.push('"');
    } else {
        let kept = result.trim_end().trim_end_matches(',').len();
        result.truncate(kept);
    }
    for opener in state.open.iter().rev() {
        result.push(if *opener == '{' { '}' } else { ']' });
    }
    result
}

/// Attempts to parse JSON, with fallback to repair and retry
pub fn parse_json_with_repair(json_str: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Ok(value);
    }

    let repaired = repair_json(json_str);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            tracing::debug!(
                "[JSON-REPAIR] Successfully repaired JSON: {} -> {} chars",
                json_str.len(),
                repaired.len()
            );
            Ok(value)
        }
        Err(e) => Err(format!(
            "Failed to parse JSON even after repair: {} (original: {} chars, repaired: {} chars)",
            e,
            json_str.len(),
            repaired.len()
        )),
    }
}

/// The outermost balanced object or array, starting at the first opener.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (offset, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// First successful strategy wins; `None` when nothing parses.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(inner) = FENCED_BLOCK
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
    {
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(value);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(span) = balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            return Some(value);
        }
    }

    // Unterminated output: repair from the first opener onwards.
    let start = trimmed.find(['{', '['])?;
    let candidate = trimmed[start..].trim_end_matches("```").trim();
    if is_json_complete(candidate) {
        return None;
    }
    parse_json_with_repair(candidate).ok()
}
