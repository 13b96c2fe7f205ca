//! In-memory upload session registry
//!
//! Tracks which chunk indices of each (user, filename) upload have been
//! written. Chunk bytes never pass through here: the caller reserves an
//! index with `begin_chunk`, writes to disk without holding the lock, then
//! reports back with `finish_chunk`, which also performs the completion test.
//! Sessions are ephemeral and lost on restart; clients restart from chunk 1.

use crate::types::{UploadKey, UserId};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Reasons the registry refuses a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no active upload session for {0}")]
    NoActiveSession(UploadKey),

    #[error("{0}")]
    InvalidChunk(String),

    #[error("chunk {index} of {key} is still being written")]
    ChunkInFlight { key: UploadKey, index: u32 },
}

/// State for an in-progress upload
struct UploadSession {
    id: Uuid,
    temp_path: PathBuf,
    expected_chunks: u32,
    chunk_size: u64,
    received: BTreeSet<u32>,
    writing: BTreeSet<u32>,
    created_at: Instant,
    touched_at: Instant,
}

/// What the caller should do with a chunk after `begin_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSlot {
    /// Write the bytes at `offset` in `temp_path`, then call `finish_chunk`.
    Write {
        session_id: Uuid,
        temp_path: PathBuf,
        offset: u64,
    },
    /// The index is already received.
    Duplicate,
}

/// A session removed from the registry because every chunk arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub key: UploadKey,
    pub session_id: Uuid,
    pub temp_path: PathBuf,
    pub expected_chunks: u32,
}

/// Result of `finish_chunk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Pending { received: usize, total: u32 },
    /// Returned to exactly one caller per upload.
    Complete(CompletedUpload),
}

/// A session evicted by `evict_expired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredUpload {
    pub key: UploadKey,
    pub temp_path: PathBuf,
    pub received: usize,
    pub expected_chunks: u32,
}

/// Marker left for a key whose session has been removed on completion.
#[derive(Debug, Clone, Copy)]
enum Tombstone {
    /// The completion run is still in progress.
    Completing,
    /// The object was stored at this instant.
    Stored(Instant),
}

struct RegistryState {
    sessions: HashMap<UploadKey, UploadSession>,
    completed: HashMap<UploadKey, Tombstone>,
}

/// Thread-safe registry of in-flight uploads.
pub struct UploadRegistry {
    state: Mutex<RegistryState>,
    temp_root: PathBuf,
    completed_grace: Duration,
}

impl UploadRegistry {
    pub fn new(temp_root: PathBuf, completed_grace: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                completed: HashMap::new(),
            }),
            temp_root,
            completed_grace,
        }
    }

    /// Root directory for raw and processed temp files.
    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Per-user temp directory: `<temp_root>/user_<id>`.
    pub fn user_dir(&self, user: UserId) -> PathBuf {
        self.temp_root.join(format!("user_{}", user))
    }

    /// Reserve a chunk index for writing, creating the session on first contact.
    ///
    /// The first chunk seen for a key fixes the session's total and chunk
    /// size; later chunks must declare the same values. An index another
    /// request is still writing is refused with `ChunkInFlight`, since that
    /// write may yet fail.
    pub fn begin_chunk(
        &self,
        key: &UploadKey,
        index: u32,
        total: u32,
        chunk_size: u64,
    ) -> Result<ChunkSlot, RegistryError> {
        if total == 0 {
            return Err(RegistryError::InvalidChunk(
                "total chunks must be at least 1".to_string(),
            ));
        }
        if chunk_size == 0 {
            return Err(RegistryError::InvalidChunk(
                "chunk size must be at least 1".to_string(),
            ));
        }

        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.completed.get(key).copied() {
            Some(Tombstone::Completing) => {
                return Err(RegistryError::NoActiveSession(key.clone()));
            }
            Some(Tombstone::Stored(done_at)) => {
                if now.duration_since(done_at) < self.completed_grace {
                    return Err(RegistryError::NoActiveSession(key.clone()));
                }
                state.completed.remove(key);
            }
            None => {}
        }

        let session = match state.sessions.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let session = entry.into_mut();
                if session.expected_chunks != total {
                    return Err(RegistryError::InvalidChunk(format!(
                        "declared total {} does not match session total {}",
                        total, session.expected_chunks
                    )));
                }
                if session.chunk_size != chunk_size {
                    return Err(RegistryError::InvalidChunk(format!(
                        "declared chunk size {} does not match session chunk size {}",
                        chunk_size, session.chunk_size
                    )));
                }
                session
            }
            Entry::Vacant(entry) => {
                // Validate before creating so a bad first chunk leaves no session behind.
                if !(1..=total).contains(&index) {
                    return Err(out_of_range(index, total));
                }
                let id = Uuid::new_v4();
                let temp_path = self
                    .user_dir(key.user)
                    .join(format!("{}_{}", id.simple(), key.filename));
                entry.insert(UploadSession {
                    id,
                    temp_path,
                    expected_chunks: total,
                    chunk_size,
                    received: BTreeSet::new(),
                    writing: BTreeSet::new(),
                    created_at: now,
                    touched_at: now,
                })
            }
        };

        if !(1..=total).contains(&index) {
            return Err(out_of_range(index, total));
        }

        session.touched_at = now;
        if session.received.contains(&index) {
            return Ok(ChunkSlot::Duplicate);
        }
        if session.writing.contains(&index) {
            return Err(RegistryError::ChunkInFlight {
                key: key.clone(),
                index,
            });
        }
        session.writing.insert(index);

        Ok(ChunkSlot::Write {
            session_id: session.id,
            temp_path: session.temp_path.clone(),
            offset: u64::from(index - 1) * session.chunk_size,
        })
    }

    /// Release a reserved index and run the completion test.
    ///
    /// A failed write leaves the index unrecorded so a retry of the same
    /// chunk can complete the upload. When the last index is recorded the
    /// session is removed before the lock is released, so exactly one caller
    /// observes `ChunkOutcome::Complete`. Chunks for the key are refused until
    /// the caller reports back with `mark_stored` or `release_failed`.
    pub fn finish_chunk(
        &self,
        key: &UploadKey,
        session_id: Uuid,
        index: u32,
        write_ok: bool,
    ) -> Result<ChunkOutcome, RegistryError> {
        let mut state = self.state.lock();

        let session = match state.sessions.get_mut(key) {
            Some(session) if session.id == session_id => session,
            _ => return Err(RegistryError::NoActiveSession(key.clone())),
        };

        session.writing.remove(&index);
        session.touched_at = Instant::now();
        if write_ok {
            session.received.insert(index);
        }

        let received = session.received.len();
        let total = session.expected_chunks;
        if received != total as usize {
            return Ok(ChunkOutcome::Pending { received, total });
        }

        let session = state
            .sessions
            .remove(key)
            .ok_or_else(|| RegistryError::NoActiveSession(key.clone()))?;
        state.completed.insert(key.clone(), Tombstone::Completing);
        Ok(ChunkOutcome::Complete(CompletedUpload {
            key: key.clone(),
            session_id: session.id,
            temp_path: session.temp_path,
            expected_chunks: session.expected_chunks,
        }))
    }

    /// Give back a reserved index whose writer went away without reporting.
    ///
    /// Nothing is recorded, so a retry of the chunk writes it again. A
    /// reservation from a session that has since been replaced is ignored.
    pub fn release_slot(&self, key: &UploadKey, session_id: Uuid, index: u32) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(key) {
            if session.id == session_id && session.writing.remove(&index) {
                session.touched_at = Instant::now();
            }
        }
    }

    /// Mark a completed upload as successfully stored.
    ///
    /// Late duplicates of its chunks are rejected with `NoActiveSession`
    /// for the grace period instead of opening a new session.
    pub fn mark_stored(&self, key: &UploadKey) {
        self.state
            .lock()
            .completed
            .insert(key.clone(), Tombstone::Stored(Instant::now()));
    }

    /// Forget a completion run that failed, so the client can start over.
    pub fn release_failed(&self, key: &UploadKey) {
        let mut state = self.state.lock();
        if matches!(state.completed.get(key), Some(Tombstone::Completing)) {
            state.completed.remove(key);
        }
    }

    /// Number of in-flight sessions.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Received indices of an in-flight session, in ascending order.
    pub fn received_chunks(&self, key: &UploadKey) -> Option<Vec<u32>> {
        self.state
            .lock()
            .sessions
            .get(key)
            .map(|s| s.received.iter().copied().collect())
    }

    /// Remove sessions idle for longer than `max_idle` and expired tombstones.
    ///
    /// Sessions with a write in progress are kept. The caller deletes the
    /// returned temp files outside the lock.
    pub fn evict_expired(&self, max_idle: Duration) -> Vec<ExpiredUpload> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let grace = self.completed_grace;
        state.completed.retain(|_, tombstone| match tombstone {
            Tombstone::Completing => true,
            Tombstone::Stored(done_at) => now.duration_since(*done_at) < grace,
        });

        let stale: Vec<UploadKey> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.writing.is_empty() && now.duration_since(s.touched_at) >= max_idle)
            .map(|(k, _)| k.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| {
                state.sessions.remove(&key).map(|s| {
                    tracing::debug!(
                        "Evicting upload {} after {:?} ({} of {} chunks)",
                        key,
                        now.duration_since(s.created_at),
                        s.received.len(),
                        s.expected_chunks
                    );
                    ExpiredUpload {
                        key,
                        temp_path: s.temp_path,
                        received: s.received.len(),
                        expected_chunks: s.expected_chunks,
                    }
                })
            })
            .collect()
    }
}

fn out_of_range(index: u32, total: u32) -> RegistryError {
    RegistryError::InvalidChunk(format!(
        "chunk index {} is outside 1..={}",
        index, total
    ))
}
