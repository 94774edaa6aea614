//! Key scanner for the handful of small, fixed-shape JSON bodies the matchmaking API uses.
//!
//! Looks for the first `"key":` token and reads the value right after it. This is not a
//! JSON parser and must not be used as one: nesting, duplicate keys and key names that
//! also appear inside string values are not handled.

use std::{borrow::Cow, fmt::Write, str::FromStr};

fn skip_ws(s: &str) -> &str {
    s.trim_start_matches(|c: char| c.is_ascii_whitespace())
}

// Everything right after `"key":`.
fn value_after_key<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let bytes = json.as_bytes();
    let mut from = 0;
    while let Some(pos) = json[from..].find(key) {
        let start = from + pos;
        let end = start + key.len();
        from = end;
        if start == 0 || bytes[start - 1] != b'"' || bytes.get(end) != Some(&b'"') {
            continue;
        }
        let rest = skip_ws(&json[end + 1..]);
        if let Some(rest) = rest.strip_prefix(':') {
            return Some(skip_ws(rest));
        }
    }
    None
}

// Length of a quoted string body (without the quotes), honoring backslash escapes.
fn string_body_len(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return Some(i),
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    Cow::Owned(out)
}

/// The string value of `key`. Borrowed unless it contains escapes.
pub fn find_str<'a>(json: &'a str, key: &str) -> Option<Cow<'a, str>> {
    let rest = value_after_key(json, key)?.strip_prefix('"')?;
    let len = string_body_len(rest)?;
    Some(unescape(&rest[..len]))
}

/// The bare numeric value of `key`, read while digit, `.` or `-`.
pub fn find_number<T: FromStr>(json: &str, key: &str) -> Option<T> {
    let rest = value_after_key(json, key)?;
    let len = rest
        .bytes()
        .take_while(|b| b.is_ascii_digit() || *b == b'.' || *b == b'-')
        .count();
    rest[..len].parse().ok()
}

pub fn find_bool(json: &str, key: &str) -> Option<bool> {
    let rest = value_after_key(json, key)?;
    if rest.starts_with("true") {
        Some(true)
    } else if rest.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

/// The `{...}` elements of an array: the top level one if `key` is None, else the value of `key`.
pub fn objects_in_array<'a>(json: &'a str, key: Option<&str>) -> Vec<&'a str> {
    let array = match key {
        Some(key) => value_after_key(json, key),
        None => Some(skip_ws(json)),
    };
    let Some(array) = array.and_then(|a| a.strip_prefix('[')) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in array.bytes().enumerate() {
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
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start.take() {
                        out.push(&array[s..=i]);
                    }
                }
            }
            b']' if depth == 0 => break,
            _ => {}
        }
    }
    out
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}

/// Builds one flat JSON object.
#[derive(Debug, Default)]
pub struct ObjectWriter {
    buf: String,
}

impl ObjectWriter {
    pub fn new() -> Self {
        Self {
            buf: String::from("{"),
        }
    }

    fn key(&mut self, key: &str) {
        if self.buf.len() > 1 {
            self.buf.push(',');
        }
        self.buf.push('"');
        escape_into(&mut self.buf, key);
        self.buf.push_str("\":");
    }

    pub fn str(mut self, key: &str, value: &str) -> Self {
        self.key(key);
        self.buf.push('"');
        escape_into(&mut self.buf, value);
        self.buf.push('"');
        self
    }

    pub fn number(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.key(key);
        let _ = write!(self.buf, "{value}");
        self
    }

    pub fn bool(mut self, key: &str, value: bool) -> Self {
        self.key(key);
        self.buf.push_str(if value { "true" } else { "false" });
        self
    }

    pub fn finish(mut self) -> String {
        self.buf.push('}');
        self.buf
    }
}

/// `[a,b,...]` from already serialized objects.
pub fn array_of(objects: impl IntoIterator<Item = String>) -> String {
    let mut out = String::from("[");
    for (i, o) in objects.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&o);
    }
    out.push(']');
    out
}
