// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry-oriented archive writers.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Bytes of one entry, as they arrive.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error while writing archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive already has an entry named {0:?}")]
    DuplicateEntry(String),
    #[error("content of entry {name:?} could not be read: {source}")]
    Source {
        name: String,
        source: std::io::Error,
    },
    #[error("archive writer is finished or unusable after an earlier failure")]
    Poisoned,
    #[error("entry was abandoned before it was complete")]
    Superseded,
    #[error("archive writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Sequential writer for one archive.
#[async_trait]
pub trait ArchiveWriter: Send {
    /// Write all of `content` as entry `name`, returning its size.
    ///
    /// If `content` fails partway, the entry is dropped from the archive.
    async fn add_entry(&mut self, name: &str, content: ByteStream) -> Result<u64, ArchiveError>;

    /// Finalize the archive and return where it was written.
    async fn finish(self: Box<Self>) -> Result<PathBuf, ArchiveError>;
}

/// Opens [`ArchiveWriter`]s.
#[async_trait]
pub trait ArchiveFormat: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn ArchiveWriter>, ArchiveError>;
}

/// Deflate-compressed zip archives.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZipFormat;

#[async_trait]
impl ArchiveFormat for ZipFormat {
    async fn open(&self, path: &Path) -> Result<Box<dyn ArchiveWriter>, ArchiveError> {
        Ok(Box::new(ZipArchiveWriter::create(path.to_owned()).await?))
    }
}

type Zip = ZipWriter<BufWriter<File>>;

/// The zip writer plus the bookkeeping that has to change in step with it.
struct ZipState {
    /// `None` once finished.
    zip: Option<Zip>,
    names: HashSet<String>,
    /// Started but not yet committed: `(entry, name)`.
    open: Option<(u64, String)>,
}

impl ZipState {
    fn zip(&mut self) -> Result<&mut Zip, ArchiveError> {
        self.zip.as_mut().ok_or(ArchiveError::Poisoned)
    }

    /// Drop the entry left open by a write that never completed, if any.
    fn abort_open(&mut self) -> Result<(), ArchiveError> {
        if let Some((_, name)) = self.open.take() {
            self.names.remove(&name);
            self.zip()?.abort_file()?;
            warn!("Dropped unfinished entry {name:?}");
        }
        Ok(())
    }

    fn start(&mut self, entry: u64, name: String) -> Result<(), ArchiveError> {
        self.abort_open()?;
        if self.names.contains(&name) {
            return Err(ArchiveError::DuplicateEntry(name));
        }
        self.zip()?.start_file(name.as_str(), ZipArchiveWriter::options())?;
        self.names.insert(name.clone());
        self.open = Some((entry, name));
        Ok(())
    }

    fn commit(&mut self) {
        self.open = None;
    }

    fn finish(&mut self) -> Result<(), ArchiveError> {
        self.abort_open()?;
        let zip = self.zip.take().ok_or(ArchiveError::Poisoned)?;
        let buffered = zip.finish()?;
        let file = buffered.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

struct Shared {
    /// The only entry whose steps may still run. Steps spawned for an entry whose
    /// `add_entry` was dropped see a newer value here and do nothing.
    current: AtomicU64,
    state: Mutex<ZipState>,
}

/// Streams entries into a zip file on disk.
///
/// All file I/O happens on tokio's blocking pool, one step at a time, so a slow disk never
/// stalls the runtime. Dropping an [`add_entry`](ArchiveWriter::add_entry) future partway
/// leaves nothing behind: its entry is dropped before the next entry starts or the archive
/// is finished.
pub struct ZipArchiveWriter {
    path: PathBuf,
    shared: Arc<Shared>,
    last_entry: u64,
}

impl ZipArchiveWriter {
    /// Create (or truncate) the archive at `path`, creating parent directories as needed.
    pub async fn create(path: PathBuf) -> Result<Self, ArchiveError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?.into_std().await;
        let state = ZipState {
            zip: Some(ZipWriter::new(BufWriter::new(file))),
            names: HashSet::new(),
            open: None,
        };
        Ok(Self {
            path,
            shared: Arc::new(Shared {
                current: AtomicU64::new(0),
                state: Mutex::new(state),
            }),
            last_entry: 0,
        })
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644)
            .large_file(true)
    }

    /// Make `entry` the only one allowed to touch the zip from now on.
    fn begin(&mut self) -> u64 {
        self.last_entry += 1;
        self.shared.current.store(self.last_entry, Ordering::SeqCst);
        self.last_entry
    }

    /// Run one blocking step on behalf of `entry`.
    ///
    /// The step keeps running if the returned future is dropped, and the writer stays in
    /// `self.shared` either way.
    async fn with_zip<T>(
        &self,
        entry: u64,
        step: impl FnOnce(&mut ZipState) -> Result<T, ArchiveError> + Send + 'static,
    ) -> Result<T, ArchiveError>
    where
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = shared.state.lock().map_err(|_| ArchiveError::Poisoned)?;
            if shared.current.load(Ordering::SeqCst) != entry {
                return Err(ArchiveError::Superseded);
            }
            step(&mut *state)
        })
        .await?
    }

    async fn write_entry(
        &self,
        entry: u64,
        name: &str,
        mut content: ByteStream,
    ) -> Result<u64, ArchiveError> {
        let mut size = 0;
        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(|source| ArchiveError::Source {
                name: name.to_owned(),
                source,
            })?;
            size += chunk.len() as u64;
            self.with_zip(entry, move |state| Ok(state.zip()?.write_all(&chunk)?))
                .await?;
        }
        self.with_zip(entry, |state| {
            state.commit();
            Ok(())
        })
        .await?;
        Ok(size)
    }
}

#[async_trait]
impl ArchiveWriter for ZipArchiveWriter {
    async fn add_entry(&mut self, name: &str, content: ByteStream) -> Result<u64, ArchiveError> {
        let entry = self.begin();
        let start = name.to_owned();
        self.with_zip(entry, move |state| state.start(entry, start))
            .await?;
        match self.write_entry(entry, name, content).await {
            Ok(size) => {
                debug!("Wrote entry {name:?} ({size} bytes) to {}", self.path.display());
                Ok(size)
            }
            Err(err) => {
                if let Err(abort_err) = self.with_zip(entry, ZipState::abort_open).await {
                    warn!("Could not drop failed entry {name:?}: {abort_err}");
                }
                Err(err)
            }
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<PathBuf, ArchiveError> {
        let entry = self.begin();
        self.with_zip(entry, ZipState::finish).await?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::time::Duration;

    use zip::ZipArchive;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let parts: Vec<_> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part)))
            .collect();
        futures::stream::iter(parts).boxed()
    }

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut content = vec![];
                entry.read_to_end(&mut content).unwrap();
                (entry.name().to_owned(), content)
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn writes_streamed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/a.zip");

        let mut writer = ZipFormat.open(&path).await.unwrap();
        let size = writer
            .add_entry("readme.txt", chunks(&[b"hel", b"lo"]))
            .await
            .unwrap();
        assert_eq!(size, 5);
        let size = writer
            .add_entry("remote.bin", chunks(&[&[0xde, 0xad], &[0xbe, 0xef]]))
            .await
            .unwrap();
        assert_eq!(size, 4);
        assert_eq!(writer.finish().await.unwrap(), path);

        assert_eq!(
            read_entries(&path),
            vec![
                ("readme.txt".to_owned(), b"hello".to_vec()),
                ("remote.bin".to_owned(), vec![0xde, 0xad, 0xbe, 0xef]),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_sources_leave_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");

        let mut writer = ZipFormat.open(&path).await.unwrap();
        let failing = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ])
        .boxed();
        let err = writer.add_entry("broken.bin", failing).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Source { ref name, .. } if name == "broken.bin"));

        // the name is free again, and the writer still works
        writer
            .add_entry("broken.bin", chunks(&[b"whole"]))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        assert_eq!(
            read_entries(&path),
            vec![("broken.bin".to_owned(), b"whole".to_vec())]
        );
    }

    /// One chunk, then nothing, forever.
    fn stalled(first: &'static [u8]) -> ByteStream {
        futures::stream::once(async move { Ok(Bytes::from_static(first)) })
            .chain(futures::stream::pending())
            .boxed()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn cancelled_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");

        let mut writer = ZipFormat.open(&path).await.unwrap();
        writer
            .add_entry("readme.txt", chunks(&[b"hello"]))
            .await
            .unwrap();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            writer.add_entry("big.bin", stalled(b"partial")),
        )
        .await;
        assert!(cancelled.is_err());

        // the name is free again, and later entries don't inherit the partial one
        writer
            .add_entry("big.bin", chunks(&[b"whole"]))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        assert_eq!(
            read_entries(&path),
            vec![
                ("readme.txt".to_owned(), b"hello".to_vec()),
                ("big.bin".to_owned(), b"whole".to_vec()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn finishing_drops_a_cancelled_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");

        let mut writer = ZipFormat.open(&path).await.unwrap();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            writer.add_entry("big.bin", stalled(b"partial")),
        )
        .await;
        assert!(cancelled.is_err());
        writer.finish().await.unwrap();

        assert!(read_entries(&path).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ZipFormat.open(&dir.path().join("a.zip")).await.unwrap();
        writer.add_entry("x", chunks(&[b"1"])).await.unwrap();
        let err = writer.add_entry("x", chunks(&[b"2"])).await.unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateEntry(name) if name == "x"));
    }
}
