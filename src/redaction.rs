use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::io::Write;

use crate::str_utils::prefix_chars;

const LARGE_BLOB_CHARS: usize = 100;

lazy_static! {
    static ref SECRET_PATTERN: Regex = Regex::new(
        r"(?i)(AIza[0-9A-Za-z_\-]{20,}|Bearer\s+[^\s]+|x-goog-api-key:\s*[^\s]+|[?&]key=[^&\s]+)"
    )
    .expect("Invalid redaction regex");
}

/// Replaces credential-looking substrings in free text.
pub fn scrub_secrets(input: &str) -> Cow<'_, str> {
    SECRET_PATTERN.replace_all(input, "[REDACTED]")
}

/// Log writer that scrubs credentials before they reach disk.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = scrub_secrets(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    Strict,  // secrets, inline media and conversation text
    Normal,  // secrets and large blobs
    Minimal, // known secret keys only
}

impl Default for RedactionLevel {
    fn default() -> Self {
        match std::env::var("REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            "minimal" => RedactionLevel::Minimal,
            _ => RedactionLevel::Normal,
        }
    }
}

fn is_secret_key(k_lower: &str) -> bool {
    k_lower.contains("key")
        || k_lower.contains("auth")
        || k_lower == "token"
        || k_lower.ends_with("_token")
        || k_lower.contains("secret")
        || k_lower.contains("password")
        || k_lower == "cookie"
}

pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();

                if is_secret_key(&k_lower) {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                match level {
                    RedactionLevel::Strict => {
                        if k_lower == "text" || k_lower == "data" {
                            *val = Value::String("[REDACTED-STRICT]".to_string());
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Normal => {
                        let is_large = val
                            .as_str()
                            .map(|s| s.len() > LARGE_BLOB_CHARS)
                            .unwrap_or(false);
                        if k_lower == "data" && is_large {
                            let len = val.as_str().map(str::len).unwrap_or(0);
                            *val = Value::String(format!("[REDACTED-DATA {} chars]", len));
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Minimal => {
                        redact_value(val, level);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

/// Redacts an upstream body for inclusion in a client-visible error.
/// Non-JSON bodies pass through with any long base64-looking runs cut down.
pub fn redact_raw_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            redact_value(&mut value, RedactionLevel::Normal);
            match serde_json::to_string(&value) {
                Ok(out) => scrub_secrets(&out).into_owned(),
                Err(_) => scrub_secrets(body).into_owned(),
            }
        }
        Err(_) => scrub_secrets(body)
            .split_inclusive(char::is_whitespace)
            .map(|word| {
                if word.trim_end().len() > 512 {
                    format!("{}[REDACTED-BLOB] ", prefix_chars(word, 16))
                } else {
                    word.to_string()
                }
            })
            .collect(),
    }
}
