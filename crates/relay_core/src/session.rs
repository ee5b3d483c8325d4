// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Open archives, by id.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::archive::{ArchiveFormat, ArchiveWriter, ByteStream};
use crate::error::RelayError;
use crate::paths::{validate_entry_name, ConfinedRoot};

/// Server-assigned identifier of an open archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveId(Uuid);

impl ArchiveId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArchiveId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What [`ArchiveSessionStore::list`] reports about an open archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub id: ArchiveId,
    pub path: PathBuf,
}

struct Session {
    path: PathBuf,
    /// `None` once closed. Held for the whole of an entry write, so entries go in one at a time.
    writer: AsyncMutex<Option<Box<dyn ArchiveWriter>>>,
}

#[derive(Default)]
struct Sessions {
    open: HashMap<ArchiveId, Arc<Session>>,
    /// Output paths of open archives, plus those still being opened.
    claimed: HashSet<PathBuf>,
}

/// Every archive currently accepting entries.
pub struct ArchiveSessionStore {
    root: ConfinedRoot,
    format: Arc<dyn ArchiveFormat>,
    sessions: Mutex<Sessions>,
}

impl ArchiveSessionStore {
    pub fn new(root: ConfinedRoot, format: Arc<dyn ArchiveFormat>) -> Self {
        Self {
            root,
            format,
            sessions: Mutex::default(),
        }
    }

    pub fn root(&self) -> &ConfinedRoot {
        &self.root
    }

    /// Open a new archive at `relative` beneath the root.
    pub async fn create(&self, relative: &str) -> Result<ArchiveInfo, RelayError> {
        let path = self.root.resolve(relative)?;
        if !self.sessions().claimed.insert(path.clone()) {
            return Err(RelayError::PathInUse(relative.to_owned()));
        }

        let writer = match self.format.open(&path).await {
            Ok(writer) => writer,
            Err(err) => {
                self.sessions().claimed.remove(&path);
                return Err(err.into());
            }
        };

        let id = ArchiveId::random();
        let session = Arc::new(Session {
            path: path.clone(),
            writer: AsyncMutex::new(Some(writer)),
        });
        self.sessions().open.insert(id, session);
        info!("Opened archive {id} at {}", path.display());
        Ok(ArchiveInfo { id, path })
    }

    pub fn contains(&self, id: &ArchiveId) -> bool {
        self.sessions().open.contains_key(id)
    }

    pub fn list(&self) -> Vec<ArchiveInfo> {
        let mut archives: Vec<_> = self
            .sessions()
            .open
            .iter()
            .map(|(id, session)| ArchiveInfo {
                id: *id,
                path: session.path.clone(),
            })
            .collect();
        archives.sort_by(|a, b| a.path.cmp(&b.path));
        archives
    }

    /// Write `content` as entry `name` of archive `id`, waiting for any entry already being
    /// written to that archive. Returns the entry's size once it is completely written.
    pub async fn add_entry(
        &self,
        id: &ArchiveId,
        name: &str,
        content: ByteStream,
    ) -> Result<u64, RelayError> {
        let name = validate_entry_name(name)?;
        let session = self.session(id)?;
        let mut writer = session.writer.lock().await;
        // the archive may have been closed while we waited for the lock
        let writer = writer.as_mut().ok_or(RelayError::ArchiveNotFound(*id))?;
        Ok(writer.add_entry(name, content).await?)
    }

    /// Finalize archive `id` and forget about it. Waits for an entry in progress to finish.
    pub async fn close(&self, id: &ArchiveId) -> Result<ArchiveInfo, RelayError> {
        let session = self
            .sessions()
            .open
            .remove(id)
            .ok_or(RelayError::ArchiveNotFound(*id))?;
        let writer = session.writer.lock().await.take();
        let result = match writer {
            Some(writer) => writer.finish().await.map_err(RelayError::from),
            None => Err(RelayError::ArchiveNotFound(*id)),
        };
        self.sessions().claimed.remove(&session.path);
        let path = result?;
        info!("Closed archive {id} at {}", path.display());
        Ok(ArchiveInfo { id: *id, path })
    }

    /// Finalize every open archive, e.g. on shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<ArchiveId> = self.sessions().open.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.close(&id).await {
                error!("Could not finalize archive {id}: {err}");
            }
        }
    }

    fn session(&self, id: &ArchiveId) -> Result<Arc<Session>, RelayError> {
        self.sessions()
            .open
            .get(id)
            .cloned()
            .ok_or(RelayError::ArchiveNotFound(*id))
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
