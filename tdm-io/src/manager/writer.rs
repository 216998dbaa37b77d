//! Physical file writes
//!
//! All writes land in `<file>.tmp` and are renamed over the target once
//! complete, so a reader sees either the previous contents or the new ones.
//!
//! Model archives are produced by a blocking serializer. It runs on the
//! blocking pool and writes into [`ChannelWriter`], which forwards fixed-size
//! chunks over a bounded channel to the async file writer.

use super::payload::{ModelPayload, Payload, PayloadKind};
use super::store::ContentHash;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tdm_common::Result;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Chunk size handed from the serializer to the file writer
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Chunks in flight between serializer and file writer
const STREAM_CHANNEL_DEPTH: usize = 8;

/// Payload ready for the disk
pub(crate) enum Prepared {
    Bytes {
        bytes: Vec<u8>,
        hash: ContentHash,
        kind: PayloadKind,
    },
    Model {
        model: ModelPayload,
        hash: Option<ContentHash>,
    },
}

impl Prepared {
    pub fn hash(&self) -> Option<&ContentHash> {
        match self {
            Prepared::Bytes { hash, .. } => Some(hash),
            Prepared::Model { hash, .. } => hash.as_ref(),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Prepared::Bytes { kind, .. } => *kind,
            Prepared::Model { .. } => PayloadKind::ModelStream,
        }
    }
}

pub(crate) fn content_hash(bytes: &[u8]) -> ContentHash {
    Sha256::digest(bytes).into()
}

/// Encode `payload`, snapshotting structured sources now
pub(crate) fn prepare(payload: &Payload) -> Result<Prepared> {
    match payload {
        Payload::Raw(bytes) => Ok(Prepared::Bytes {
            hash: content_hash(bytes),
            bytes: bytes.to_vec(),
            kind: PayloadKind::Raw,
        }),
        Payload::Structured(source) => {
            let value = source.snapshot()?;
            let bytes = serde_json::to_vec(&value)?;
            Ok(Prepared::Bytes {
                hash: content_hash(&bytes),
                bytes,
                kind: PayloadKind::Structured,
            })
        }
        Payload::ModelStream(model) => Ok(Prepared::Model {
            hash: model.fingerprint().map(|f| content_hash(&f.to_le_bytes())),
            model: model.clone(),
        }),
    }
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}

async fn discard_temp(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {:?}: {}", tmp, e);
        }
    }
}

/// Write prepared content to `path`, returning bytes written
pub(crate) async fn write_prepared(path: &Path, prepared: Prepared) -> io::Result<u64> {
    match prepared {
        Prepared::Bytes { bytes, .. } => write_atomic(path, &bytes).await,
        Prepared::Model { model, .. } => stream_model(path, model).await,
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<u64> {
    ensure_parent(path).await?;
    let tmp = temp_path(path);

    let result = async {
        let mut file = File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        discard_temp(&tmp).await;
        return Err(e);
    }
    debug!("Wrote {} bytes to {:?}", bytes.len(), path);
    Ok(bytes.len() as u64)
}

/// `std::io::Write` end of the serializer-to-file channel
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "model file writer stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stream a model archive to `path` without buffering it whole
pub(crate) async fn stream_model(path: &Path, model: ModelPayload) -> io::Result<u64> {
    ensure_parent(path).await?;
    let tmp = temp_path(path);

    let result = async {
        let mut file = File::create(&tmp).await?;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_DEPTH);

        let producer = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut out = BufWriter::with_capacity(STREAM_CHUNK_BYTES, ChannelWriter { tx });
            model.write_to(&mut out)?;
            out.flush()
        });

        let mut written = 0u64;
        let mut write_error = None;
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = file.write_all(&chunk).await {
                write_error = Some(e);
                break;
            }
            written += chunk.len() as u64;
        }
        // Unblocks the serializer if the file side failed first
        drop(rx);

        let produced = producer.await.map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("model serializer panicked: {}", e))
        })?;
        if let Some(e) = write_error {
            return Err(e);
        }
        produced?;

        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            debug!("Streamed {} bytes to {:?}", written, path);
            Ok(written)
        }
        Err(e) => {
            discard_temp(&tmp).await;
            Err(e)
        }
    }
}

/// Blocking write used when the async path is unavailable
pub(crate) fn write_blocking(path: &Path, payload: &Payload) -> Result<u64> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = temp_path(path);

    let result = (|| -> Result<u64> {
        let file = std::fs::File::create(&tmp)?;
        let mut out = BufWriter::new(file);
        let written = match prepare(payload)? {
            Prepared::Bytes { bytes, .. } => {
                out.write_all(&bytes)?;
                bytes.len() as u64
            }
            Prepared::Model { model, .. } => {
                let mut counter = CountingWriter { inner: &mut out, count: 0 };
                model.write_to(&mut counter)?;
                counter.count
            }
        };
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        std::fs::rename(&tmp, path)?;
        Ok(written)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
