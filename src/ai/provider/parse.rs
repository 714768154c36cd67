//! Model output → JSON
//!
//! Chat models wrap JSON in fences, prose, or cut it off mid-object. The
//! parser peels those layers in order and reports a [`LlmError::parse`] when
//! nothing usable remains, which agents treat as retryable.

use serde_json::Value;
use tracing::debug;

use crate::types::{LlmError, truncate_chars};

/// Parse a JSON value out of raw model text.
pub fn extract_json(raw: &str) -> Result<Value, LlmError> {
    let cleaned = strip_fences(raw.trim().trim_start_matches('\u{feff}'));

    let first_error = match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let candidate = embedded_json(cleaned).unwrap_or(cleaned);
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        debug!("Recovered JSON embedded in surrounding text");
        return Ok(value);
    }

    let patched = close_open_scopes(&drop_trailing_commas(candidate));
    if let Ok(value) = serde_json::from_str::<Value>(&patched) {
        debug!("Recovered JSON after structural patching");
        return Ok(value);
    }

    Err(LlmError::parse(format!(
        "{} (output starts with: {})",
        first_error,
        truncate_chars(cleaned, 160)
    )))
}

fn strip_fences(s: &str) -> &str {
    let mut body = s;
    if body.starts_with("```") {
        body = match body.find('\n') {
            Some(idx) => &body[idx + 1..],
            None => body.trim_start_matches('`'),
        };
    }
    body.trim_end().trim_end_matches("```").trim()
}

/// Tracks string/escape state while walking JSON text.
#[derive(Default)]
struct Lexer {
    in_string: bool,
    escaped: bool,
}

impl Lexer {
    /// Feed one char; returns true when the char is structural (outside a string).
    fn step(&mut self, ch: char) -> bool {
        if self.escaped {
            self.escaped = false;
            return false;
        }
        match ch {
            '\\' if self.in_string => {
                self.escaped = true;
                false
            }
            '"' => {
                self.in_string = !self.in_string;
                false
            }
            _ => !self.in_string,
        }
    }
}

/// First balanced `{...}` or `[...]` span in `s`.
fn embedded_json(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut lexer = Lexer::default();
    let mut depth = 0usize;

    for (offset, ch) in s[start..].char_indices() {
        if !lexer.step(ch) {
            continue;
        }
        match ch {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&s[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn drop_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut lexer = Lexer::default();

    for (i, &ch) in chars.iter().enumerate() {
        let structural = lexer.step(ch);
        if structural && ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Close an unterminated string and any open brackets, innermost first.
fn close_open_scopes(s: &str) -> String {
    let mut lexer = Lexer::default();
    let mut open: Vec<char> = Vec::new();

    for ch in s.chars() {
        if !lexer.step(ch) {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }

    let mut out = if lexer.in_string {
        format!("{}\"", s)
    } else {
        s.trim_end().trim_end_matches(',').to_string()
    };
    while let Some(closer) = open.pop() {
        out.push(closer);
    }
    out
}
