//! File reads and format detection
//!
//! Dispatch order for a file's format:
//! 1. `.zip` extension or archive header: model archive
//! 2. kind the caller asked for, or the kind last written this session
//! 3. valid JSON: structured
//! 4. anything else: raw

use super::payload::{LoadedPayload, ModelArchive, PayloadKind, ARCHIVE_MAGIC};
use std::io;
use std::path::Path;
use tdm_common::{Error, Result};

pub(crate) fn is_model_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Read `path`; absent or empty files yield `None`
pub(crate) async fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn read_file_blocking(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn looks_like_json(bytes: &[u8]) -> bool {
    matches!(
        bytes.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

/// Decode file contents according to the dispatch order above
pub(crate) fn decode(
    path: &Path,
    bytes: Vec<u8>,
    hint: Option<PayloadKind>,
) -> Result<LoadedPayload> {
    let has_header = bytes.starts_with(&ARCHIVE_MAGIC);
    let kind = if is_model_file(path) || has_header {
        PayloadKind::ModelStream
    } else if let Some(kind) = hint {
        kind
    } else if looks_like_json(&bytes) {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => return Ok(LoadedPayload::Structured(value)),
            Err(_) => PayloadKind::Raw,
        }
    } else {
        PayloadKind::Raw
    };

    match kind {
        PayloadKind::ModelStream => {
            if !has_header {
                return Err(Error::decode(path, "missing model archive header"));
            }
            Ok(LoadedPayload::Model(ModelArchive::new(bytes)))
        }
        PayloadKind::Structured => serde_json::from_slice(&bytes)
            .map(LoadedPayload::Structured)
            .map_err(|e| Error::decode(path, e.to_string())),
        PayloadKind::Raw => Ok(LoadedPayload::Raw(bytes)),
    }
}
