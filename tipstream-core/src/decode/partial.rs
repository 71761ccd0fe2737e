//! Stateless decode attempts over a growing completion buffer.
//!
//! Both functions are pure: the caller re-runs them on every increment with
//! the whole buffer so far. A `None` is the normal "not ready yet" answer for
//! a syntactically open prefix, never an error.

use serde_json::Value;
use tracing::trace;

use crate::ipc::events::TipDocument;

/// Strict decode: succeeds only on a syntactically complete JSON object.
///
/// Surrounding whitespace and a Markdown code fence are tolerated.
pub fn decode(buffer: &str) -> Option<TipDocument> {
    let body = strip_fence(buffer);
    if body.is_empty() {
        return None;
    }
    // Only an object counts; serde would also accept a positional array.
    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => serde_json::from_value(value)
            .map_err(|e| trace!(error = %e, "tip object has unexpected field types"))
            .ok(),
        Ok(_) => None,
        Err(e) => {
            trace!(error = %e, chars = buffer.len(), "buffer not decodable yet");
            None
        }
    }
}

/// Best-effort decode of an incomplete prefix.
///
/// Closes an open string value, drops a dangling key / comma / colon, closes
/// open containers and then runs [`decode`] on the repaired text.
pub fn decode_lenient(buffer: &str) -> Option<TipDocument> {
    if let Some(doc) = decode(buffer) {
        return Some(doc);
    }
    let repaired = close_prefix(strip_fence(buffer))?;
    decode(&repaired)
}

fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline.
    let Some(newline) = rest.find('\n') else {
        return "";
    };
    rest[newline + 1..].trim_end().trim_end_matches('`').trim()
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    closer: char,
    expect_key: bool,
}

fn close_prefix(prefix: &str) -> Option<String> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut string_start = 0usize;
    let mut string_is_key = false;
    // Start offset of a completed key still waiting for its ':'.
    let mut pending_key: Option<usize> = None;

    for (i, c) in prefix.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                if string_is_key {
                    pending_key = Some(string_start);
                }
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_start = i;
                string_is_key = matches!(
                    stack.last(),
                    Some(Frame {
                        closer: '}',
                        expect_key: true
                    })
                );
            }
            '{' => stack.push(Frame {
                closer: '}',
                expect_key: true,
            }),
            '[' => stack.push(Frame {
                closer: ']',
                expect_key: false,
            }),
            '}' | ']' => {
                let frame = stack.pop()?;
                if frame.closer != c {
                    return None;
                }
            }
            ':' => {
                pending_key = None;
                if let Some(frame) = stack.last_mut() {
                    frame.expect_key = false;
                }
            }
            ',' => {
                if let Some(frame) = stack.last_mut() {
                    frame.expect_key = frame.closer == '}';
                }
            }
            _ => {}
        }
    }

    // Nothing open means strict decode already had its chance.
    if stack.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(prefix.len() + stack.len() + 1);
    if in_string && string_is_key {
        out.push_str(&prefix[..string_start]);
    } else if in_string {
        let mut value = prefix;
        if escaped {
            value = &value[..value.len() - 1];
        }
        out.push_str(trim_partial_unicode_escape(value));
        out.push('"');
    } else if let Some(start) = pending_key {
        out.push_str(&prefix[..start]);
    } else {
        out.push_str(prefix);
    }

    loop {
        let len = out.trim_end().len();
        out.truncate(len);
        if out.ends_with(',') {
            out.pop();
        } else if out.ends_with(':') {
            out.pop();
            drop_trailing_key(&mut out);
        } else {
            break;
        }
    }

    for frame in stack.iter().rev() {
        out.push(frame.closer);
    }
    Some(out)
}

/// Remove a `"key"` that ends the buffer (its colon already removed).
fn drop_trailing_key(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if !out.ends_with('"') {
        return;
    }
    let body = &out[..out.len() - 1];
    let mut start = None;
    for (i, c) in body.char_indices().rev() {
        if c == '"' && !is_escaped_at(body, i) {
            start = Some(i);
            break;
        }
    }
    if let Some(start) = start {
        out.truncate(start);
    }
}

fn is_escaped_at(s: &str, idx: usize) -> bool {
    s[..idx].chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

/// Cut a `\uXX` escape that has not received all four hex digits yet.
fn trim_partial_unicode_escape(value: &str) -> &str {
    let Some(backslash) = value.rfind("\\u") else {
        return value;
    };
    let digits = &value[backslash + 2..];
    if digits.len() < 4
        && digits.chars().all(|c| c.is_ascii_hexdigit())
        && !is_escaped_at(value, backslash)
    {
        &value[..backslash]
    } else {
        value
    }
}
