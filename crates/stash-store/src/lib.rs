//! Backend connectors for registered object storages.
//!
//! A registration stores an encrypted parameter blob; this crate decrypts it
//! and turns it into a live, request-scoped connector implementing streaming
//! write, streaming read, and delete against the remote endpoint. Currently
//! one backend kind exists (S3-compatible); the factory dispatches on the
//! closed [`StorageKind`] enum so a new kind is one variant plus one match arm.

mod crypto;
mod s3;

use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stash_db::{Database, StorageKind};

pub use crypto::{CipherError, ParamsCipher};
pub use s3::S3Backend;

/// Lazy, forward-only sequence of byte chunks. Chunk boundaries carry no
/// meaning; consuming the stream drives the network read and it cannot be
/// rewound.
pub type ByteChunks = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// A connector handle scoped to one request chain. It must not be shared
/// across concurrent orchestrator calls; release happens on drop.
pub type BackendHandle = Box<dyn ObjectBackend>;

/// Session object for one remote object-storage endpoint.
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn write(&self, path: &str, body: Bytes) -> Result<(), StoreError>;
    async fn read(&self, path: &str) -> Result<ByteChunks, StoreError>;
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage '{0}' is not registered")]
    UnknownStorage(Uuid),
    #[error("stored connection parameters could not be decrypted: {0}")]
    Decrypt(#[from] CipherError),
    #[error("stored connection parameters are malformed: {0}")]
    InvalidParams(String),
    #[error("no object at '{0}' in the backend")]
    ObjectMissing(String),
    #[error("backend call exceeded the {0:?} timeout")]
    Timeout(Duration),
    #[error("backend I/O failed: {0}")]
    Backend(String),
    #[error("metadata lookup failed: {0}")]
    Metadata(String),
}

fn default_port() -> u16 {
    443
}

fn default_secure() -> bool {
    true
}

/// Connection parameters for the S3-compatible backend kind. The wire names
/// follow the registration API (`awsAccessKeyId`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Params {
    pub endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub bucket: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_secure")]
    pub secure: bool,
}

impl S3Params {
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("endpoint must not be empty".into());
        }
        if self.bucket.trim().is_empty() {
            return Err("bucket must not be empty".into());
        }
        if self.aws_access_key_id.is_empty() || self.aws_secret_access_key.is_empty() {
            return Err("credentials must not be empty".into());
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.endpoint, self.port)
    }
}

/// Builds request-scoped connectors from stored registrations.
pub struct ConnectorFactory {
    db: Database,
    cipher: Arc<ParamsCipher>,
    op_timeout: Duration,
}

impl ConnectorFactory {
    pub fn new(db: Database, cipher: Arc<ParamsCipher>, op_timeout: Duration) -> Self {
        Self {
            db,
            cipher,
            op_timeout,
        }
    }

    /// Resolves a registration id into a live connector: fetch, decrypt,
    /// dispatch on the backend kind.
    pub async fn resolve(&self, storage_id: Uuid) -> Result<BackendHandle, StoreError> {
        let registration = self
            .db
            .fetch_storage(storage_id)
            .await
            .map_err(|err| StoreError::Metadata(err.to_string()))?
            .ok_or(StoreError::UnknownStorage(storage_id))?;

        let plaintext = self.cipher.decrypt(&registration.params)?;

        match registration.kind {
            StorageKind::S3 => {
                let params: S3Params = serde_json::from_str(&plaintext)
                    .map_err(|err| StoreError::InvalidParams(err.to_string()))?;
                Ok(Box::new(S3Backend::open(&params, self.op_timeout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_db::NewStorage;

    fn sample_params() -> S3Params {
        S3Params {
            endpoint: "minio.internal".into(),
            aws_access_key_id: "access".into(),
            aws_secret_access_key: "secret".into(),
            bucket: "stash".into(),
            port: 9000,
            secure: false,
        }
    }

    #[test]
    fn params_defaults_apply() {
        let params: S3Params = serde_json::from_str(
            r#"{
                "endpoint": "s3.example.com",
                "awsAccessKeyId": "access",
                "awsSecretAccessKey": "secret",
                "bucket": "stash"
            }"#,
        )
        .unwrap();

        assert_eq!(params.port, 443);
        assert!(params.secure);
        assert_eq!(params.endpoint_url(), "https://s3.example.com:443");
    }

    #[test]
    fn params_validation_rejects_blanks() {
        let mut params = sample_params();
        assert!(params.validate().is_ok());

        params.bucket = "  ".into();
        assert!(params.validate().is_err());
    }

    #[test]
    fn insecure_endpoint_url_uses_http() {
        assert_eq!(
            sample_params().endpoint_url(),
            "http://minio.internal:9000"
        );
    }

    #[tokio::test]
    async fn resolve_unknown_registration_fails() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let factory = ConnectorFactory::new(
            db,
            Arc::new(ParamsCipher::from_secret("secret")),
            Duration::from_secs(5),
        );

        let missing = Uuid::new_v4();
        // `resolve`'s Ok type is a boxed `dyn ObjectBackend`, which is not
        // `Debug`, so `Result::unwrap_err` cannot be used here.
        let err = match factory.resolve(missing).await {
            Ok(_) => panic!("expected resolve of unknown registration to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::UnknownStorage(id) if id == missing));
    }

    #[tokio::test]
    async fn resolve_builds_connector_from_sealed_params() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let cipher = Arc::new(ParamsCipher::from_secret("secret"));

        let sealed = cipher
            .encrypt(&serde_json::to_string(&sample_params()).unwrap())
            .unwrap();
        let registration = db
            .create_storage(NewStorage {
                kind: StorageKind::S3,
                params: &sealed,
            })
            .await
            .unwrap();

        let factory = ConnectorFactory::new(db, cipher, Duration::from_secs(5));
        assert!(factory.resolve(registration.id).await.is_ok());
    }

    #[tokio::test]
    async fn resolve_with_wrong_cipher_key_reports_decrypt_failure() {
        let db = Database::connect("sqlite::memory:").await.unwrap();

        let sealed = ParamsCipher::from_secret("old-secret")
            .encrypt(&serde_json::to_string(&sample_params()).unwrap())
            .unwrap();
        let registration = db
            .create_storage(NewStorage {
                kind: StorageKind::S3,
                params: &sealed,
            })
            .await
            .unwrap();

        let factory = ConnectorFactory::new(
            db,
            Arc::new(ParamsCipher::from_secret("new-secret")),
            Duration::from_secs(5),
        );
        // `resolve`'s Ok type is a boxed `dyn ObjectBackend`, which is not
        // `Debug`, so `Result::unwrap_err` cannot be used here.
        let err = match factory.resolve(registration.id).await {
            Ok(_) => panic!("expected resolve with wrong cipher key to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Decrypt(_)));
    }
}
