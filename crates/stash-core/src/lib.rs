//! Orchestration core: coordinates metadata writes with backend byte
//! transfers for upload, read, and delete.
//!
//! The consistency model is deliberately best-effort. Uploads insert metadata
//! and write bytes inside one unit of work, so a failed backend write rolls
//! the metadata back. Deletes commit the metadata removal first and then fire
//! backend deletes; a failing backend delete leaves an orphaned remote object
//! behind rather than resurrecting metadata. There is no two-phase commit
//! across the relational store and the remote backend.

use std::{io, pin::Pin, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{future, stream, Stream, TryStreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use stash_db::{Database, FileRecord, NewFile, NewStorage, StorageKind, StorageRecord};
use stash_store::{BackendHandle, ByteChunks, CipherError, ParamsCipher, S3Params, StoreError};

/// Backend writes on the single-file path run strictly one at a time.
pub const SINGLE_UPLOAD_SLOTS: usize = 1;
/// Batch uploads and deletes keep at most this many backend calls in flight;
/// excess work waits for a slot. This is backpressure against the backend,
/// not against the caller.
pub const BATCH_SLOTS: usize = 4;

/// Caller-supplied byte source for an upload. Consumed exactly once.
pub type ByteReader = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// One file in an upload request: declared metadata plus the byte source.
/// Size and content type are taken at face value; they are not verified
/// against the bytes actually written.
pub struct FileUpload {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub reader: ByteReader,
}

impl FileUpload {
    /// Wraps an already-buffered body, the common case at the HTTP boundary
    /// where multipart fields arrive fully read.
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: Option<String>,
        body: Bytes,
    ) -> Self {
        Self {
            name: name.into(),
            size: body.len() as u64,
            content_type,
            reader: Box::pin(stream::once(async move { Ok(body) })),
        }
    }

    fn acceptable(&self) -> bool {
        !self.name.is_empty() && self.size > 0
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file must have a name and a non-zero size")]
    InvalidUpload,
    #[error("file '{0}' not found")]
    NotFound(Uuid),
    #[error("upload of '{name}' failed: {source}")]
    UploadFailed { name: String, source: StoreError },
    #[error("batch upload failed on '{name}': {source}")]
    BatchUploadFailed { name: String, source: StoreError },
    #[error("backend delete of '{path}' failed: {source}")]
    DeleteFailed { path: String, source: StoreError },
    #[error("read of '{0}' failed: {1}")]
    ReadFailed(Uuid, StoreError),
    #[error(transparent)]
    Metadata(#[from] anyhow::Error),
}

/// Coordinates file metadata with backend byte transfers. Request-scoped: the
/// connector handle it holds belongs to a single call chain and must not be
/// shared across concurrent orchestrations.
pub struct FileService {
    db: Database,
    backend: BackendHandle,
}

impl FileService {
    pub fn new(db: Database, backend: BackendHandle) -> Self {
        Self { db, backend }
    }

    /// Backend object path for a file record. One record maps to exactly one
    /// remote object.
    pub fn path_for(file_id: Uuid) -> String {
        format!("/files/{file_id}")
    }

    /// Uploads a single file: insert metadata, stream bytes to the backend,
    /// commit only once the write succeeded.
    #[instrument(skip(self, upload), fields(name = %upload.name, size = upload.size))]
    pub async fn upload(
        &self,
        storage_id: Uuid,
        upload: FileUpload,
    ) -> Result<FileRecord, FileError> {
        if !upload.acceptable() {
            return Err(FileError::InvalidUpload);
        }

        let mut uow = self.db.begin().await?;
        let record = self
            .db
            .insert_file(
                &mut uow,
                NewFile {
                    name: &upload.name,
                    size: upload.size,
                    content_type: upload.content_type.as_deref(),
                    storage_id,
                },
            )
            .await?;

        let slots = Arc::new(Semaphore::new(SINGLE_UPLOAD_SLOTS));
        self.write_with_slot(&slots, Self::path_for(record.id), upload.reader)
            .await
            .map_err(|source| FileError::UploadFailed {
                name: record.name.clone(),
                source,
            })?;

        uow.commit().await.map_err(anyhow::Error::from)?;
        info!(file_id = %record.id, "file uploaded");
        Ok(record)
    }

    /// Uploads a batch. Items without a name or with zero size are silently
    /// excluded. Metadata for all accepted items is inserted in input order in
    /// one unit of work; backend writes fan out with at most [`BATCH_SLOTS`]
    /// in flight. One failing write fails the whole batch and rolls every
    /// insert back. The returned records pair with the accepted inputs by
    /// index, regardless of the order writes completed in.
    #[instrument(skip(self, uploads), fields(submitted = uploads.len()))]
    pub async fn upload_many(
        &self,
        storage_id: Uuid,
        uploads: Vec<FileUpload>,
    ) -> Result<Vec<FileRecord>, FileError> {
        let accepted: Vec<FileUpload> = uploads
            .into_iter()
            .filter(FileUpload::acceptable)
            .collect();

        let mut uow = self.db.begin().await?;
        let mut records = Vec::with_capacity(accepted.len());
        for upload in &accepted {
            let record = self
                .db
                .insert_file(
                    &mut uow,
                    NewFile {
                        name: &upload.name,
                        size: upload.size,
                        content_type: upload.content_type.as_deref(),
                        storage_id,
                    },
                )
                .await?;
            records.push(record);
        }

        let slots = Arc::new(Semaphore::new(BATCH_SLOTS));
        let writes = accepted
            .into_iter()
            .zip(records.iter())
            .map(|(upload, record)| {
                let slots = Arc::clone(&slots);
                let path = Self::path_for(record.id);
                let name = record.name.clone();
                async move {
                    self.write_with_slot(&slots, path, upload.reader)
                        .await
                        .map_err(|source| FileError::BatchUploadFailed { name, source })
                }
            });
        future::try_join_all(writes).await?;

        uow.commit().await.map_err(anyhow::Error::from)?;
        info!(created = records.len(), "batch uploaded");
        Ok(records)
    }

    /// Looks up a file record, failing before any backend call is attempted.
    pub async fn get(&self, file_id: Uuid) -> Result<FileRecord, FileError> {
        self.db
            .fetch_file(file_id)
            .await?
            .ok_or(FileError::NotFound(file_id))
    }

    /// Opens a streaming read of a file's bytes. The returned sequence is
    /// single-pass and not restartable; a mid-stream backend failure surfaces
    /// as an error item and already-yielded chunks are not retracted.
    #[instrument(skip(self))]
    pub async fn read_stream(
        &self,
        file_id: Uuid,
    ) -> Result<(FileRecord, ByteChunks), FileError> {
        let record = self.get(file_id).await?;
        let chunks = self
            .backend
            .read(&Self::path_for(record.id))
            .await
            .map_err(|source| FileError::ReadFailed(file_id, source))?;
        Ok((record, chunks))
    }

    /// Deletes files by id. Unknown ids are silently ignored. Metadata rows
    /// are removed and committed first; backend deletes then fan out with at
    /// most [`BATCH_SLOTS`] in flight. A failing backend delete is surfaced
    /// but never re-inserts metadata, so the remote object is orphaned.
    #[instrument(skip(self, file_ids), fields(requested = file_ids.len()))]
    pub async fn delete_many(&self, file_ids: &[Uuid]) -> Result<(), FileError> {
        let records = self.db.fetch_files(file_ids).await?;
        if records.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
        let mut uow = self.db.begin().await?;
        self.db.delete_files(&mut uow, &ids).await?;
        uow.commit().await.map_err(anyhow::Error::from)?;

        let slots = Arc::new(Semaphore::new(BATCH_SLOTS));
        let deletes = records.iter().map(|record| {
            let slots = Arc::clone(&slots);
            let path = Self::path_for(record.id);
            async move {
                let _permit = slots
                    .acquire()
                    .await
                    .expect("delete slot semaphore is never closed");
                match self.backend.delete(&path).await {
                    Ok(()) => Ok(()),
                    Err(source) => {
                        warn!(%path, error = %source, "backend delete failed; remote object orphaned");
                        Err(FileError::DeleteFailed { path, source })
                    }
                }
            }
        });
        future::try_join_all(deletes).await?;

        info!(deleted = ids.len(), "files deleted");
        Ok(())
    }

    /// Drains the reader and hands the buffered body to the backend, holding
    /// a concurrency slot for the duration of the backend call.
    async fn write_with_slot(
        &self,
        slots: &Semaphore,
        path: String,
        reader: ByteReader,
    ) -> Result<(), StoreError> {
        let _permit = slots
            .acquire()
            .await
            .expect("upload slot semaphore is never closed");

        let mut reader = reader;
        let mut body = BytesMut::new();
        while let Some(chunk) = reader
            .try_next()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?
        {
            body.extend_from_slice(&chunk);
        }

        if let Err(source) = self.backend.write(&path, body.freeze()).await {
            // A partially written remote object, if any, is left in place.
            warn!(%path, error = %source, "backend write failed");
            return Err(source);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported storage kind '{0}'")]
    UnsupportedKind(String),
    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),
    #[error("parameter encryption failed: {0}")]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Metadata(#[from] anyhow::Error),
}

/// CRUD over backend registrations: validates connection parameters against
/// the schema for the requested kind, seals them, and persists the result.
pub struct StorageService {
    db: Database,
    cipher: Arc<ParamsCipher>,
}

impl StorageService {
    pub fn new(db: Database, cipher: Arc<ParamsCipher>) -> Self {
        Self { db, cipher }
    }

    /// Registers a backend. Unsupported kinds are rejected before any
    /// persistence or encryption happens.
    #[instrument(skip(self, params))]
    pub async fn add_storage(
        &self,
        kind: &str,
        params: serde_json::Value,
    ) -> Result<StorageRecord, RegistryError> {
        let kind: StorageKind = kind
            .parse()
            .map_err(|_| RegistryError::UnsupportedKind(kind.to_owned()))?;

        let canonical = match kind {
            StorageKind::S3 => {
                let parsed: S3Params = serde_json::from_value(params)
                    .map_err(|err| RegistryError::InvalidParams(err.to_string()))?;
                parsed.validate().map_err(RegistryError::InvalidParams)?;
                serde_json::to_string(&parsed)
                    .map_err(|err| RegistryError::InvalidParams(err.to_string()))?
            }
        };

        let sealed = self.cipher.encrypt(&canonical)?;
        let record = self
            .db
            .create_storage(NewStorage {
                kind,
                params: &sealed,
            })
            .await?;
        info!(storage_id = %record.id, kind = kind.as_str(), "storage registered");
        Ok(record)
    }

    /// Lists registrations, optionally filtered by the active flag.
    pub async fn list(&self, active: Option<bool>) -> Result<Vec<StorageRecord>, RegistryError> {
        Ok(self.db.list_storages(active).await?)
    }
}
