//! Chunk ingestion and the completion pipeline
//!
//! Every chunk goes through the registry and the chunk writer. The chunk
//! that completes an upload then runs transform, intent, upload, commit and
//! reclaim in that order, returning the object reference or the first
//! failing stage.

use crate::chunk_writer;
use crate::config::Config;
use crate::error::IngestError;
use crate::metadata::{MetadataError, MetadataStore};
use crate::reclaim::{self, Reclaimer};
use crate::registry::{ChunkOutcome, ChunkSlot, CompletedUpload, RegistryError, UploadRegistry};
use crate::storage::{keys, ObjectStore, StorageError};
use crate::transform::{self, CancelOnDrop, TransformError};
use crate::types::{
    ChunkAccepted, ChunkRequest, FileListing, NewFileRecord, Stage, StoredObject, UploadKey,
    UserId,
};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Pipeline tunables, taken from `Config`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub key_prefix: String,
    pub max_chunk_size: u64,
    pub max_upload_size: u64,
    pub stage_timeout: Duration,
    pub session_ttl: Duration,
    pub completed_grace: Duration,
    pub presign_ttl: Duration,
    pub reconcile_after: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            key_prefix: config.key_prefix.clone(),
            max_chunk_size: config.max_chunk_size,
            max_upload_size: config.max_upload_size,
            stage_timeout: config.stage_timeout,
            session_ttl: config.session_ttl,
            completed_grace: config.completed_grace,
            presign_ttl: config.presign_ttl,
            reconcile_after: config.reconcile_after,
        }
    }
}

/// Errors from listing and background maintenance
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Object store client is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

type SharedStore = Arc<Box<dyn ObjectStore>>;

/// The ingestion pipeline shared by all request handlers.
pub struct IngestPipeline {
    registry: UploadRegistry,
    store: ArcSwapOption<Box<dyn ObjectStore>>,
    metadata: Arc<dyn MetadataStore>,
    settings: PipelineSettings,
}

impl IngestPipeline {
    /// Create a pipeline with no object store installed yet.
    pub fn new(settings: PipelineSettings, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            registry: UploadRegistry::new(settings.temp_dir.clone(), settings.completed_grace),
            store: ArcSwapOption::empty(),
            metadata,
            settings,
        }
    }

    /// Install the object store. Until this is called every upload fails
    /// with `NotInitialized`.
    pub fn install_store(&self, store: Box<dyn ObjectStore>) {
        info!("Object store '{}' installed", store.name());
        self.store.store(Some(Arc::new(store)));
    }

    pub fn store_ready(&self) -> bool {
        self.store.load().is_some()
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Number of committed file records, or `None` if the database fails.
    pub async fn stored_files(&self) -> Option<u64> {
        match self.metadata.count_files().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Could not count stored files: {}", e);
                None
            }
        }
    }

    fn store(&self) -> Option<SharedStore> {
        self.store.load_full()
    }

    /// Accept one chunk.
    ///
    /// Returns `Stored` only to the request whose chunk completed the
    /// upload, after the image has been transformed, uploaded and recorded.
    #[instrument(
        skip(self, request),
        fields(user = %request.user, filename = %request.filename, index = request.index, total = request.total)
    )]
    pub async fn upload_chunk(&self, request: ChunkRequest) -> Result<ChunkAccepted, IngestError> {
        let store = self.store().ok_or(IngestError::NotInitialized)?;
        let key = self.validate(&request)?;

        let slot = self
            .registry
            .begin_chunk(&key, request.index, request.total, request.chunk_size)
            .map_err(registry_error)?;

        let (session_id, temp_path, offset) = match slot {
            ChunkSlot::Duplicate => {
                debug!("Chunk {} already received", request.chunk_status());
                return Ok(ChunkAccepted::Duplicate);
            }
            ChunkSlot::Write {
                session_id,
                temp_path,
                offset,
            } => (session_id, temp_path, offset),
        };

        let reservation = ChunkReservation {
            registry: &self.registry,
            key: &key,
            session_id,
            index: request.index,
            armed: true,
        };
        let written = chunk_writer::write_chunk(&temp_path, offset, &request.data).await;
        let outcome = reservation
            .finish(written.is_ok())
            .map_err(registry_error)?;

        if let Err(source) = written {
            warn!("Chunk {} write failed: {}", request.chunk_status(), source);
            return Err(IngestError::ChunkWrite {
                user: key.user,
                filename: key.filename,
                index: request.index,
                source,
            });
        }

        match outcome {
            ChunkOutcome::Pending { received, total } => {
                debug!("Received {} of {} chunks", received, total);
                Ok(ChunkAccepted::Pending { received, total })
            }
            ChunkOutcome::Complete(done) => {
                info!("All {} chunks received, processing", done.expected_chunks);
                self.complete(&**store, done)
                    .await
                    .map(ChunkAccepted::Stored)
            }
        }
    }

    fn validate(&self, request: &ChunkRequest) -> Result<UploadKey, IngestError> {
        let key = UploadKey::new(request.user, &request.filename)
            .map_err(|e| IngestError::InvalidRequest(e.to_string()))?;
        if request.total == 0 {
            return Err(IngestError::InvalidRequest(
                "total chunks must be at least 1".to_string(),
            ));
        }
        if request.chunk_size == 0 {
            return Err(IngestError::InvalidRequest(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if request.chunk_size > self.settings.max_chunk_size {
            return Err(IngestError::InvalidChunk(format!(
                "declared chunk size {} exceeds limit {}",
                request.chunk_size, self.settings.max_chunk_size
            )));
        }
        let declared = u64::from(request.total).checked_mul(request.chunk_size);
        if !declared.is_some_and(|size| size <= self.settings.max_upload_size) {
            return Err(IngestError::InvalidChunk(format!(
                "declared upload of {} chunks of {} bytes exceeds limit {}",
                request.total, request.chunk_size, self.settings.max_upload_size
            )));
        }
        chunk_writer::check_chunk_len(
            request.index,
            request.total,
            request.chunk_size,
            request.data.len() as u64,
        )
        .map_err(IngestError::InvalidChunk)?;
        Ok(key)
    }

    /// Run the completion pipeline for a finished session.
    ///
    /// Local files are reclaimed on every path, including a dropped request.
    /// The registry refuses chunks for the key until the outcome is reported
    /// back to it.
    async fn complete(
        &self,
        store: &dyn ObjectStore,
        done: CompletedUpload,
    ) -> Result<StoredObject, IngestError> {
        let outcome = CompletionGuard {
            registry: &self.registry,
            key: &done.key,
            stored: false,
        };
        let processed = transform::processed_path(&done.temp_path);
        let mut reclaimer = Reclaimer::new();
        reclaimer.track(&done.temp_path);
        reclaimer.track(&processed);

        let result = self
            .run_stages(store, &done.key, &done.temp_path, &processed)
            .await;
        reclaimer.finish().await;

        match &result {
            Ok(stored) => {
                outcome.stored();
                info!(
                    "Stored {} for user {} at {}",
                    done.key.filename, done.key.user, stored.object_reference
                );
            }
            Err(e) => warn!("Completion of {} failed: {}", done.key, e),
        }
        result
    }

    async fn run_stages(
        &self,
        store: &dyn ObjectStore,
        key: &UploadKey,
        raw: &Path,
        processed: &Path,
    ) -> Result<StoredObject, IngestError> {
        let format = self.transform_stage(key, raw, processed).await?;

        let data = tokio::fs::read(processed)
            .await
            .map(Bytes::from)
            .map_err(|e| IngestError::Transform {
                user: key.user,
                filename: key.filename.clone(),
                source: TransformError::Io(e),
            })?;
        let sha256 = hex::encode(Sha256::digest(&data));

        let object_key = keys::object_key(&self.settings.key_prefix, key.user, &key.filename);
        let persistence = |source: MetadataError| IngestError::Persistence {
            user: key.user,
            filename: key.filename.clone(),
            object_key: object_key.clone(),
            source,
        };

        // The intent outlives a failed or timed-out put; reconciliation
        // deletes whatever the put may have left.
        let intent_id = self
            .metadata
            .record_intent(key.user, &key.filename, &object_key)
            .await
            .map_err(persistence)?;

        let size_bytes = data.len() as u64;
        self.upload_stage(store, key, &object_key, data, format.to_mime_type())
            .await?;
        let object_reference = store.object_url(&object_key);

        let record = NewFileRecord {
            user_id: key.user,
            file_name: key.filename.clone(),
            object_key: object_key.clone(),
            object_reference: object_reference.clone(),
            size_bytes,
            sha256,
            uploaded_at: Utc::now(),
        };
        self.metadata
            .commit_file(intent_id, record)
            .await
            .map_err(persistence)?;

        Ok(StoredObject {
            object_key,
            object_reference,
        })
    }

    #[instrument(skip(self, key, raw, processed), fields(key = %key))]
    async fn transform_stage(
        &self,
        key: &UploadKey,
        raw: &Path,
        processed: &Path,
    ) -> Result<image::ImageFormat, IngestError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_exit = CancelOnDrop(Arc::clone(&cancel));
        let job = transform::grayscale(
            raw.to_path_buf(),
            processed.to_path_buf(),
            Arc::clone(&cancel),
        );

        match tokio::time::timeout(self.settings.stage_timeout, job).await {
            Ok(Ok(format)) => Ok(format),
            Ok(Err(source)) => Err(IngestError::Transform {
                user: key.user,
                filename: key.filename.clone(),
                source,
            }),
            Err(_) => Err(IngestError::Timeout {
                stage: Stage::Transform,
                user: key.user,
                filename: key.filename.clone(),
            }),
        }
    }

    #[instrument(skip(self, store, key, data), fields(key = %key, len = data.len()))]
    async fn upload_stage(
        &self,
        store: &dyn ObjectStore,
        key: &UploadKey,
        object_key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), IngestError> {
        let put = store.put_object(object_key, data, content_type);
        match tokio::time::timeout(self.settings.stage_timeout, put).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(IngestError::StorageUpload {
                user: key.user,
                filename: key.filename.clone(),
                source,
            }),
            Err(_) => Err(IngestError::Timeout {
                stage: Stage::StorageUpload,
                user: key.user,
                filename: key.filename.clone(),
            }),
        }
    }

    /// File records of `user` with download URLs.
    ///
    /// A URL that cannot be presigned falls back to the stored reference.
    pub async fn list_files(&self, user: UserId) -> Result<Vec<FileListing>, MaintenanceError> {
        let records = self.metadata.list_files(user).await?;
        let store = self.store();

        let mut listings = Vec::with_capacity(records.len());
        for record in records {
            let url = match &store {
                Some(store) => store
                    .presigned_url(&record.object_key, self.settings.presign_ttl)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Could not presign {}: {}", record.object_key, e);
                        record.object_reference.clone()
                    }),
                None => record.object_reference.clone(),
            };
            listings.push(FileListing { record, url });
        }
        Ok(listings)
    }

    /// Resolve intents older than `older_than` by deleting their objects.
    ///
    /// Returns the keys whose intents were resolved. An object that cannot
    /// be deleted keeps its intent for the next run.
    pub async fn reconcile_intents(
        &self,
        older_than: Duration,
    ) -> Result<Vec<String>, MaintenanceError> {
        let store = self.store().ok_or(MaintenanceError::NotInitialized)?;
        let cutoff = match chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return Ok(Vec::new()),
        };

        let mut resolved = Vec::new();
        for intent in self.metadata.stale_intents(cutoff).await? {
            if let Err(e) = store.delete_object(&intent.object_key).await {
                warn!("Could not delete orphan {}: {}", intent.object_key, e);
                continue;
            }
            self.metadata.discard_intent(intent.id).await?;
            info!(
                "Reconciled upload intent {} for user {} ({})",
                intent.id, intent.user_id, intent.object_key
            );
            resolved.push(intent.object_key);
        }
        Ok(resolved)
    }

    /// Delete objects under the user's prefix that no file record or
    /// intent accounts for.
    #[instrument(skip(self))]
    pub async fn sweep_user_orphans(&self, user: UserId) -> Result<Vec<String>, MaintenanceError> {
        let store = self.store().ok_or(MaintenanceError::NotInitialized)?;
        let prefix = keys::user_prefix(&self.settings.key_prefix, user);

        // List first. Every listed object had its intent written before its
        // put, and intents are read before records, so a commit racing the
        // sweep is seen on one side or the other.
        let listed = store.list_prefix(&prefix).await?;
        let mut known: HashSet<String> = self
            .metadata
            .user_intents(user)
            .await?
            .into_iter()
            .map(|i| i.object_key)
            .collect();
        known.extend(
            self.metadata
                .list_files(user)
                .await?
                .into_iter()
                .map(|r| r.object_key),
        );

        let mut removed = Vec::new();
        for object_key in listed {
            if known.contains(&object_key) {
                continue;
            }
            store.delete_object(&object_key).await?;
            info!("Removed orphaned object {}", object_key);
            removed.push(object_key);
        }
        Ok(removed)
    }

    /// Evict sessions idle past the session TTL and delete their temp files.
    pub async fn evict_expired(&self) -> usize {
        let expired = self.registry.evict_expired(self.settings.session_ttl);
        for upload in &expired {
            info!(
                "Abandoned upload {} expired with {} of {} chunks",
                upload.key, upload.received, upload.expected_chunks
            );
            reclaim::remove_quietly(&upload.temp_path);
        }
        expired.len()
    }

    /// Remove leftovers of a previous process from the temp root.
    pub async fn sweep_temp_root(&self) -> std::io::Result<usize> {
        reclaim::sweep_temp_root(self.registry.temp_root()).await
    }
}

/// Reports a completion run's outcome to the registry, releasing the key
/// unless `stored` was called.
/// A reserved chunk index. Released unrecorded if the request is dropped
/// before `finish` reports the write back to the registry.
struct ChunkReservation<'a> {
    registry: &'a UploadRegistry,
    key: &'a UploadKey,
    session_id: Uuid,
    index: u32,
    armed: bool,
}

impl ChunkReservation<'_> {
    fn finish(mut self, write_ok: bool) -> Result<ChunkOutcome, RegistryError> {
        self.armed = false;
        self.registry
            .finish_chunk(self.key, self.session_id, self.index, write_ok)
    }
}

impl Drop for ChunkReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Chunk {} of {} abandoned mid-write", self.index, self.key);
            self.registry
                .release_slot(self.key, self.session_id, self.index);
        }
    }
}

struct CompletionGuard<'a> {
    registry: &'a UploadRegistry,
    key: &'a UploadKey,
    stored: bool,
}

impl CompletionGuard<'_> {
    fn stored(mut self) {
        self.registry.mark_stored(self.key);
        self.stored = true;
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if !self.stored {
            self.registry.release_failed(self.key);
        }
    }
}

fn registry_error(err: RegistryError) -> IngestError {
    match err {
        RegistryError::NoActiveSession(key) => IngestError::NoActiveSession {
            user: key.user,
            filename: key.filename,
        },
        RegistryError::InvalidChunk(msg) => IngestError::InvalidChunk(msg),
        RegistryError::ChunkInFlight { key, index } => IngestError::ChunkInFlight {
            user: key.user,
            filename: key.filename,
            index,
        },
    }
}
