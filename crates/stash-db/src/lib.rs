//! Stash persistence layer for storage registrations and file metadata.
//!
//! This crate offers an async API around SQLite (sqlx) for the two relational
//! tables the service owns: registered object-storage backends (with their
//! encrypted connection parameters) and the file records whose bytes live in
//! those backends. Multi-row mutations go through explicit transactions so the
//! orchestration layer can tie metadata commits to backend I/O outcomes.

use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool, Transaction,
};
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// A unit of work: metadata mutations applied through it commit or roll back
/// together. Dropping it without committing rolls everything back.
pub type UnitOfWork = Transaction<'static, Sqlite>;

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located
    /// at the given URL (e.g. `sqlite:///var/lib/stash/stash.db`) and runs the
    /// embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Exposes the underlying pool for callers that need to compose queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a unit of work owned exclusively by the caller.
    pub async fn begin(&self) -> Result<UnitOfWork> {
        Ok(self.pool.begin().await?)
    }

    /// Persists a new storage registration and returns the stored record.
    pub async fn create_storage(&self, data: NewStorage<'_>) -> Result<StorageRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO storages (id, kind, params, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.kind.as_str())
        .bind(data.params)
        .bind(1_i32)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(StorageRecord {
            id,
            kind: data.kind,
            params: data.params.to_owned(),
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Retrieves a storage registration by its identifier.
    pub async fn fetch_storage(&self, id: Uuid) -> Result<Option<StorageRecord>> {
        let row = sqlx::query("SELECT * FROM storages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_storage).transpose()
    }

    /// Lists storage registrations, optionally filtered by the active flag,
    /// ordered by creation time descending.
    pub async fn list_storages(&self, active: Option<bool>) -> Result<Vec<StorageRecord>> {
        let query = match active {
            Some(flag) => sqlx::query(
                "SELECT * FROM storages WHERE is_active = ? ORDER BY created_at DESC",
            )
            .bind(flag as i32),
            None => sqlx::query("SELECT * FROM storages ORDER BY created_at DESC"),
        };

        let mut rows = query.fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_storage(row)?);
        }
        Ok(out)
    }

    /// Flips the soft-disable flag on a registration. Registrations are never
    /// hard-deleted; inactive ones simply stop showing up in active listings.
    pub async fn set_storage_active(&self, id: Uuid, active: bool) -> Result<()> {
        sqlx::query("UPDATE storages SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active as i32)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Retrieves a file record by its identifier.
    pub async fn fetch_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_file).transpose()
    }

    /// Retrieves the file records matching the given identifiers. Identifiers
    /// with no matching row are simply absent from the result.
    pub async fn fetch_files(&self, ids: &[Uuid]) -> Result<Vec<FileRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT * FROM files WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }

        let mut rows = query.fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_file(row)?);
        }
        Ok(out)
    }

    /// Lists all file records owned by a storage, newest first.
    pub async fn list_files(&self, storage_id: Uuid) -> Result<Vec<FileRecord>> {
        let mut rows =
            sqlx::query("SELECT * FROM files WHERE storage_id = ? ORDER BY created_at DESC")
                .bind(storage_id.to_string())
                .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_file(row)?);
        }
        Ok(out)
    }

    /// Inserts a file record inside the given unit of work. The identifier is
    /// generated here so the caller can derive the backend object path before
    /// the transaction commits.
    pub async fn insert_file(&self, uow: &mut UnitOfWork, data: NewFile<'_>) -> Result<FileRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO files (id, name, size, content_type, storage_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.name)
        .bind(data.size as i64)
        .bind(data.content_type)
        .bind(data.storage_id.to_string())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut **uow)
        .await?;

        Ok(FileRecord {
            id,
            name: data.name.to_owned(),
            size: data.size,
            content_type: data.content_type.map(str::to_owned),
            storage_id: data.storage_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Deletes the given file rows inside the unit of work and returns how many
    /// rows were removed.
    pub async fn delete_files(&self, uow: &mut UnitOfWork, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM files WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }

        let result = query.execute(&mut **uow).await?;
        Ok(result.rows_affected())
    }
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_storage(row: SqliteRow) -> Result<StorageRecord> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let is_active: i32 = row.try_get("is_active")?;

    Ok(StorageRecord {
        id: Uuid::parse_str(&id)?,
        kind: StorageKind::from_str(&kind)?,
        params: row.try_get("params")?,
        is_active: is_active != 0,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

fn map_file(row: SqliteRow) -> Result<FileRecord> {
    let id: String = row.try_get("id")?;
    let storage_id: String = row.try_get("storage_id")?;

    Ok(FileRecord {
        id: Uuid::parse_str(&id)?,
        name: row.try_get("name")?,
        size: row.try_get::<i64, _>("size")? as u64,
        content_type: row.try_get("content_type")?,
        storage_id: Uuid::parse_str(&storage_id)?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

/// Closed set of supported backend kinds. Adding a kind means adding a variant
/// here and handling it in the connector factory's exhaustive match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    S3,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
        }
    }
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s3" => Ok(StorageKind::S3),
            other => Err(anyhow!("unknown storage kind: {}", other)),
        }
    }
}

/// Input payload for storage registration. `params` is the already-encrypted
/// connection-parameter blob.
#[derive(Debug, Clone)]
pub struct NewStorage<'a> {
    pub kind: StorageKind,
    pub params: &'a str,
}

/// Persisted storage registration row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageRecord {
    pub id: Uuid,
    pub kind: StorageKind,
    /// Encrypted connection parameters, opaque to this layer.
    pub params: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input payload for file record creation.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub name: &'a str,
    pub size: u64,
    pub content_type: Option<&'a str>,
    pub storage_id: Uuid,
}

/// Persisted file metadata row. Size and content type are caller-declared and
/// not verified against the bytes actually written to the backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub storage_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(TEST_DB_URL).await.unwrap()
    }

    async fn seed_storage(db: &Database) -> StorageRecord {
        db.create_storage(NewStorage {
            kind: StorageKind::S3,
            params: "sealed-blob",
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_storage_roundtrip() {
        let db = setup_db().await;
        let record = seed_storage(&db).await;

        assert_eq!(record.kind, StorageKind::S3);
        assert!(record.is_active);

        let fetched = db.fetch_storage(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.params, "sealed-blob");
    }

    #[tokio::test]
    async fn list_storages_honors_active_filter() {
        let db = setup_db().await;
        let first = seed_storage(&db).await;
        let second = seed_storage(&db).await;

        db.set_storage_active(second.id, false).await.unwrap();

        let active = db.list_storages(Some(true)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first.id);

        let all = db.list_storages(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn insert_commit_and_fetch_file() {
        let db = setup_db().await;
        let storage = seed_storage(&db).await;

        let mut uow = db.begin().await.unwrap();
        let record = db
            .insert_file(
                &mut uow,
                NewFile {
                    name: "report.pdf",
                    size: 2048,
                    content_type: Some("application/pdf"),
                    storage_id: storage.id,
                },
            )
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let fetched = db.fetch_file(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "report.pdf");
        assert_eq!(fetched.size, 2048);
        assert_eq!(fetched.storage_id, storage.id);
    }

    #[tokio::test]
    async fn dropped_unit_of_work_rolls_back_inserts() {
        let db = setup_db().await;
        let storage = seed_storage(&db).await;

        let id = {
            let mut uow = db.begin().await.unwrap();
            let record = db
                .insert_file(
                    &mut uow,
                    NewFile {
                        name: "ghost.bin",
                        size: 1,
                        content_type: None,
                        storage_id: storage.id,
                    },
                )
                .await
                .unwrap();
            record.id
            // uow dropped here without commit
        };

        assert!(db.fetch_file(id).await.unwrap().is_none());
        assert!(db.list_files(storage.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_files_skips_unknown_ids() {
        let db = setup_db().await;
        let storage = seed_storage(&db).await;

        let mut uow = db.begin().await.unwrap();
        let kept = db
            .insert_file(
                &mut uow,
                NewFile {
                    name: "kept.txt",
                    size: 10,
                    content_type: Some("text/plain"),
                    storage_id: storage.id,
                },
            )
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let found = db.fetch_files(&[Uuid::new_v4(), kept.id]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, kept.id);

        assert!(db.fetch_files(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_files_removes_only_named_rows() {
        let db = setup_db().await;
        let storage = seed_storage(&db).await;

        let mut uow = db.begin().await.unwrap();
        let first = db
            .insert_file(
                &mut uow,
                NewFile {
                    name: "a.txt",
                    size: 1,
                    content_type: None,
                    storage_id: storage.id,
                },
            )
            .await
            .unwrap();
        let second = db
            .insert_file(
                &mut uow,
                NewFile {
                    name: "b.txt",
                    size: 2,
                    content_type: None,
                    storage_id: storage.id,
                },
            )
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let mut uow = db.begin().await.unwrap();
        let removed = db.delete_files(&mut uow, &[first.id]).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(removed, 1);
        assert!(db.fetch_file(first.id).await.unwrap().is_none());
        assert!(db.fetch_file(second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removing_a_registration_cascades_to_its_files() {
        let db = setup_db().await;
        let storage = seed_storage(&db).await;

        let mut uow = db.begin().await.unwrap();
        let file = db
            .insert_file(
                &mut uow,
                NewFile {
                    name: "orphan-to-be.txt",
                    size: 5,
                    content_type: None,
                    storage_id: storage.id,
                },
            )
            .await
            .unwrap();
        uow.commit().await.unwrap();

        // No hard-delete flow is modeled in the API; go through the pool to
        // confirm the schema-level cascade holds.
        sqlx::query("DELETE FROM storages WHERE id = ?")
            .bind(storage.id.to_string())
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db.fetch_file(file.id).await.unwrap().is_none());
    }

    #[test]
    fn storage_kind_string_roundtrip() {
        assert_eq!(StorageKind::from_str("s3").unwrap(), StorageKind::S3);
        assert_eq!(StorageKind::S3.as_str(), "s3");
        assert!(StorageKind::from_str("glacier").is_err());
    }
}
