//! `key=value` line codec for tabular learning state (Q-tables)
//!
//! Keys may themselves contain `=`; each line is split at its last `=`.
//! Keys are kept byte for byte, so whatever `encode` writes decodes to the
//! same key. Only the value side is trimmed.
//! Entries are written in key order so identical tables encode identically.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

/// Encode entries as one `key=value` line each
pub fn encode<'a, K, V, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: fmt::Display + 'a + ?Sized,
    V: fmt::Display + 'a,
{
    let mut lines: Vec<String> = entries
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    lines.sort();

    let mut out = String::new();
    for line in lines {
        let _ = writeln!(out, "{}", line);
    }
    out
}

/// Malformed line in a `key=value` document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

/// Decode a `key=value` document
///
/// Blank lines and lines starting with `#` are skipped.
pub fn decode<V>(text: &str) -> Result<HashMap<String, V>, ParseError>
where
    V: FromStr,
    V::Err: fmt::Display,
{
    let mut table = HashMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let content = raw.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        let (key, value) = raw.rsplit_once('=').ok_or_else(|| ParseError {
            line: idx + 1,
            reason: "missing '='".to_string(),
        })?;
        let value = value.trim().parse::<V>().map_err(|e| ParseError {
            line: idx + 1,
            reason: format!("bad value {:?}: {}", value, e),
        })?;
        table.insert(key.to_string(), value);
    }
    Ok(table)
}
