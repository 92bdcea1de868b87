//! Typed setting values and their storage representation.
//!
//! Settings are persisted as a `(type, value)` column pair: the type is a short type signature
//! (`s`, `i`, `u`, `x`, `t`, `b`, `y`, `as`) and the value is the textual form of the value.

use serde::{Deserialize, Serialize};

/// A typed setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::From)]
pub enum Value {
    /// A UTF-8 string.
    Str(String),
    /// A signed 32 bit integer.
    I32(i32),
    /// An unsigned 32 bit integer.
    U32(u32),
    /// A signed 64 bit integer.
    I64(i64),
    /// An unsigned 64 bit integer.
    U64(u64),
    /// A boolean.
    Bool(bool),
    /// A single byte.
    Byte(u8),
    /// A list of strings.
    StringList(Vec<String>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl Value {
    /// Returns the type signature used in the `type` column of the settings table.
    pub fn type_signature(&self) -> &'static str {
        match self {
            Value::Str(_) => "s",
            Value::I32(_) => "i",
            Value::U32(_) => "u",
            Value::I64(_) => "x",
            Value::U64(_) => "t",
            Value::Bool(_) => "b",
            Value::Byte(_) => "y",
            Value::StringList(_) => "as",
        }
    }

    /// Returns the string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as a signed 64 bit integer, if it is any integer type that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(i64::from(*v)),
            Value::U32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            Value::Byte(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Returns the string list, if this is a string list value.
    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(l) => Some(l),
            _ => None,
        }
    }

    /// Renders the value in its storage text form.
    pub fn to_db(&self) -> String {
        match self {
            Value::Str(s) => quote(s),
            Value::I32(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Byte(v) => format!("0x{v:02x}"),
            Value::StringList(l) => {
                let items: Vec<String> = l.iter().map(|s| quote(s)).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    /// Parses a value from its storage type signature and text form.
    ///
    /// A string typed value which is not enclosed in quotes is taken verbatim. Returns `None`
    /// if the text does not parse as the given type.
    pub fn from_db(signature: &str, text: &str) -> Option<Self> {
        let text = text.trim();
        match signature {
            "s" => match text.chars().next() {
                Some('\'') | Some('"') => unquote(text).map(Value::Str),
                _ => Some(Value::Str(text.to_string())),
            },
            "i" => text.parse().ok().map(Value::I32),
            "u" => text.parse().ok().map(Value::U32),
            "x" => text.parse().ok().map(Value::I64),
            "t" => text.parse().ok().map(Value::U64),
            "b" => match text {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            "y" => parse_byte(text).map(Value::Byte),
            "as" => parse_string_list(text).map(Value::StringList),
            _ => None,
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Parses one quoted string from the start of `text`, returning it and the remaining input.
fn parse_quoted(text: &str) -> Option<(String, &str)> {
    let mut chars = text.char_indices();
    let (_, delim) = chars.next()?;
    if delim != '\'' && delim != '"' {
        return None;
    }
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars.next()?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == delim => return Some((out, &text[i + c.len_utf8()..])),
            c => out.push(c),
        }
    }
    None
}

fn unquote(text: &str) -> Option<String> {
    match parse_quoted(text)? {
        (s, rest) if rest.trim().is_empty() => Some(s),
        _ => None,
    }
}

fn parse_byte(text: &str) -> Option<u8> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_string_list(text: &str) -> Option<Vec<String>> {
    let text = text.strip_prefix("@as").unwrap_or(text).trim();
    let mut rest = text.strip_prefix('[')?.trim_start();
    let mut items = Vec::new();
    loop {
        if let Some(tail) = rest.strip_prefix(']') {
            return tail.trim().is_empty().then_some(items);
        }
        let (item, tail) = parse_quoted(rest)?;
        items.push(item);
        rest = tail.trim_start();
        if let Some(tail) = rest.strip_prefix(',') {
            rest = tail.trim_start();
        } else if !rest.starts_with(']') {
            return None;
        }
    }
}
