//! Payload variants accepted by the persistence manager
//!
//! The caller tags each save with its shape instead of the manager inferring
//! it from the value:
//! - [`Payload::Raw`]: bytes or text, written as-is
//! - [`Payload::Structured`]: a collection snapshotted right before encoding
//! - [`Payload::ModelStream`]: a model archive streamed by its own serializer

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex, RwLock};
use tdm_common::{Error, Result};

use super::keyvalue;

/// First four bytes of a ZIP local file header
pub const ARCHIVE_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Raw,
    Structured,
    ModelStream,
}

/// Source of a structured value
///
/// Implementations copy the container under whatever lock protects it and
/// encode the copy, so the producing subsystem can keep mutating its
/// collection while serialization runs.
pub trait Snapshot: Send + Sync {
    fn snapshot(&self) -> Result<serde_json::Value>;
}

impl Snapshot for serde_json::Value {
    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(self.clone())
    }
}

impl<T> Snapshot for RwLock<T>
where
    T: Serialize + Clone + Send + Sync,
{
    fn snapshot(&self) -> Result<serde_json::Value> {
        let copy = self.read().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(serde_json::to_value(&copy)?)
    }
}

impl<T> Snapshot for Mutex<T>
where
    T: Serialize + Clone + Send,
{
    fn snapshot(&self) -> Result<serde_json::Value> {
        let copy = self.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(serde_json::to_value(&copy)?)
    }
}

/// Handle to a structured value
#[derive(Clone)]
pub struct StructuredPayload {
    source: Arc<dyn Snapshot>,
}

impl StructuredPayload {
    /// Share a live collection; it is copied each time it is written
    pub fn shared<S: Snapshot + 'static>(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Encode `value` now and keep the encoded form
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(Self {
            source: Arc::new(value),
        })
    }

    pub fn snapshot(&self) -> Result<serde_json::Value> {
        self.source.snapshot()
    }
}

/// Legacy model serialization routine
///
/// `write_to` writes the archive incrementally into `out`; the manager
/// backs `out` with a channel to the async file writer, so the whole archive
/// is never buffered in memory.
pub trait ModelSerializer: Send + Sync {
    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()>;

    /// Cheap identity of the model's current weights, if the model has one
    ///
    /// Enables duplicate suppression for model archives; without it only the
    /// model debounce applies.
    fn fingerprint(&self) -> Option<u64> {
        None
    }
}

#[derive(Clone)]
pub struct ModelPayload {
    model: Arc<dyn ModelSerializer>,
}

impl ModelPayload {
    pub fn new<M: ModelSerializer + 'static>(model: Arc<M>) -> Self {
        Self { model }
    }

    pub fn fingerprint(&self) -> Option<u64> {
        self.model.fingerprint()
    }

    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.model.write_to(out)
    }
}

/// Value a subsystem wants persisted
#[derive(Clone)]
pub enum Payload {
    Raw(Arc<[u8]>),
    Structured(StructuredPayload),
    ModelStream(ModelPayload),
}

impl Payload {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Raw(Arc::from(bytes.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Payload::raw(text.into().into_bytes())
    }

    /// Tabular state in `key=value` lines
    pub fn key_value<'a, K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: fmt::Display + 'a + ?Sized,
        V: fmt::Display + 'a,
    {
        Payload::text(keyvalue::encode(entries))
    }

    pub fn structured<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Structured(StructuredPayload::from_serialize(value)?))
    }

    pub fn shared<S: Snapshot + 'static>(source: Arc<S>) -> Self {
        Payload::Structured(StructuredPayload::shared(source))
    }

    pub fn model<M: ModelSerializer + 'static>(model: Arc<M>) -> Self {
        Payload::ModelStream(ModelPayload::new(model))
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::Structured(_) => PayloadKind::Structured,
            Payload::ModelStream(_) => PayloadKind::ModelStream,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Raw(bytes) => write!(f, "Payload::Raw({} bytes)", bytes.len()),
            Payload::Structured(_) => f.write_str("Payload::Structured"),
            Payload::ModelStream(_) => f.write_str("Payload::ModelStream"),
        }
    }
}

/// Model archive bytes as read from disk
///
/// Handed to the subsystem's restore routine via [`ModelArchive::reader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArchive {
    bytes: Vec<u8>,
}

impl ModelArchive {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn has_archive_header(&self) -> bool {
        self.bytes.starts_with(&ARCHIVE_MAGIC)
    }

    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Decoded file contents
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedPayload {
    Raw(Vec<u8>),
    Structured(serde_json::Value),
    Model(ModelArchive),
}

impl LoadedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            LoadedPayload::Raw(_) => PayloadKind::Raw,
            LoadedPayload::Structured(_) => PayloadKind::Structured,
            LoadedPayload::Model(_) => PayloadKind::ModelStream,
        }
    }

    /// Deserialize a structured (or JSON raw) payload into `T`
    pub fn into_structured<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            LoadedPayload::Structured(value) => Ok(serde_json::from_value(value)?),
            LoadedPayload::Raw(bytes) => Ok(serde_json::from_slice(&bytes)?),
            LoadedPayload::Model(_) => Err(Error::Internal(
                "model archive cannot be read as a structured value".to_string(),
            )),
        }
    }

    /// Raw payload as UTF-8 text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            LoadedPayload::Raw(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn into_model(self) -> Option<ModelArchive> {
        match self {
            LoadedPayload::Model(archive) => Some(archive),
            _ => None,
        }
    }

    /// Size of the decoded content in bytes (the JSON length for structured)
    pub fn len(&self) -> usize {
        match self {
            LoadedPayload::Raw(bytes) => bytes.len(),
            LoadedPayload::Structured(value) => value.to_string().len(),
            LoadedPayload::Model(archive) => archive.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
