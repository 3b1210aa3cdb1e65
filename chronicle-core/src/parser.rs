//! Tolerant extraction of one JSON object from generated text.
//!
//! Models wrap JSON in fences, leave raw newlines inside strings, embed
//! unescaped quotes in narrative text and leave trailing commas. Three
//! candidate slices are tried in order, each through the same sanitizer:
//!
//! 1. the body of the first fenced code block
//! 2. the span from the first `{` to the last `}`
//! 3. the same span with typographic quotes turned into escaped straight quotes
//!
//! Either a whole object comes back or a [`ParseFailure`]; never a partial one.

use serde_json::{Map, Value};
use thiserror::Error;

/// No strategy produced a JSON object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no JSON object could be recovered from model output ({last_error})")]
pub struct ParseFailure {
    /// The error from the last strategy that had a candidate.
    pub last_error: String,
}

/// Parse the single JSON object contained in `raw`.
pub fn parse_object(raw: &str) -> Result<Map<String, Value>, ParseFailure> {
    let mut last_error = String::from("no candidate JSON found");

    let braced = brace_span(raw);
    let candidates = [
        fenced_block(raw).map(str::to_string),
        braced.map(str::to_string),
        braced.map(normalize_smart_quotes),
    ];

    for candidate in candidates.into_iter().flatten() {
        let cleaned = strip_trailing_commas(&sanitize(&candidate));
        match serde_json::from_str::<Value>(&cleaned) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(other) => last_error = format!("expected an object, found {}", kind(&other)),
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(ParseFailure { last_error })
}

/// Convenience wrapper matching the nullable contract: `None` on failure.
pub fn parse(raw: &str) -> Option<Value> {
    parse_object(raw).ok().map(Value::Object)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Body of the first ``` fenced block, skipping an optional language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // The language tag runs to the end of the fence line.
    let body_start = match after_fence.find('\n') {
        Some(nl) if after_fence[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => nl + 1,
        _ => 0,
    };
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    let inner = body[..end].trim();
    (!inner.is_empty()).then_some(inner)
}

/// From the first `{` to the last `}` inclusive.
fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn normalize_smart_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => out.push_str("\\\""),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => out.push('\''),
            _ => out.push(c),
        }
    }
    out
}

/// True if `rest` opens a JSON value (or is empty).
fn starts_value(rest: &str) -> bool {
    let rest = rest.trim_start();
    match rest.chars().next() {
        None => true,
        Some('"' | '{' | '[' | '-') => true,
        Some(c) if c.is_ascii_digit() => true,
        Some(_) => ["true", "false", "null"].iter().any(|lit| rest.starts_with(lit)),
    }
}

/// True if a quote followed by `rest` ends a JSON string.
///
/// `}` and `]` always close. `:` must be followed by a value. `,` must be
/// followed by a value, a key, or a closing bracket.
fn closes_string(rest: &str) -> bool {
    let rest = rest.trim_start();
    let mut chars = rest.chars();
    match chars.next() {
        None | Some('}' | ']') => true,
        Some(':') => starts_value(chars.as_str()),
        Some(',') => {
            let after = chars.as_str();
            matches!(after.trim_start().chars().next(), Some('}' | ']')) || starts_value(after)
        }
        Some(_) => false,
    }
}

/// Single left-to-right scan repairing string contents.
///
/// Inside a string, raw control characters are escaped, and a bare `"` only
/// closes the string when the next non-whitespace character is structural
/// (or the input ends); otherwise it is escaped as content.
fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }

        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                if closes_string(&text[i + 1..]) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }

    out
}

/// Remove commas that directly precede `}` or `]`, ignoring string contents.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}
