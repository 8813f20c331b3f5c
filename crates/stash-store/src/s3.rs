//! S3-compatible backend connector built on the AWS SDK.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use bytes::Bytes;
use futures::stream;
use tracing::debug;

use crate::{ByteChunks, ObjectBackend, S3Params, StoreError};

/// Region placeholder for S3-compatible endpoints that ignore it (MinIO etc.).
const DEFAULT_REGION: &str = "us-east-1";

/// Live session against one S3-compatible endpoint, scoped to a single
/// request chain. Dropping it releases the underlying HTTP resources.
pub struct S3Backend {
    client: Client,
    bucket: String,
    op_timeout: Duration,
}

impl S3Backend {
    pub fn open(params: &S3Params, op_timeout: Duration) -> Self {
        let credentials = Credentials::new(
            params.aws_access_key_id.clone(),
            params.aws_secret_access_key.clone(),
            None,
            None,
            "storage-registration",
        );

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .endpoint_url(params.endpoint_url())
            .credentials_provider(credentials)
            // Path-style addressing: MinIO and most self-hosted endpoints
            // do not resolve bucket-name subdomains.
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: params.bucket.clone(),
            op_timeout,
        }
    }

    /// Object keys must not start with '/' even though the service-level
    /// paths do.
    fn key(path: &str) -> &str {
        path.trim_start_matches('/')
    }
}

#[async_trait::async_trait]
impl ObjectBackend for S3Backend {
    async fn write(&self, path: &str, body: Bytes) -> Result<(), StoreError> {
        debug!(path, bytes = body.len(), bucket = %self.bucket, "writing object");
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .body(ByteStream::from(body))
            .send();

        match tokio::time::timeout(self.op_timeout, request).await {
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
            Ok(Err(err)) => Err(StoreError::Backend(err.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn read(&self, path: &str) -> Result<ByteChunks, StoreError> {
        debug!(path, bucket = %self.bucket, "opening object read stream");
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .send();

        let response = match tokio::time::timeout(self.op_timeout, request).await {
            Err(_) => return Err(StoreError::Timeout(self.op_timeout)),
            Ok(Err(err)) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Err(StoreError::ObjectMissing(path.to_owned()));
                }
                return Err(StoreError::Backend(service.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        // Forward-only, single-pass: each poll pulls the next chunk off the
        // network, and a mid-stream failure surfaces at that point.
        let chunks = stream::try_unfold(response.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(err) => Err(StoreError::Backend(err.to_string())),
            }
        });

        Ok(Box::pin(chunks))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        debug!(path, bucket = %self.bucket, "deleting object");
        let request = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .send();

        match tokio::time::timeout(self.op_timeout, request).await {
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
            Ok(Err(err)) => Err(StoreError::Backend(err.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_paths_map_to_bare_object_keys() {
        assert_eq!(S3Backend::key("/files/abc"), "files/abc");
        assert_eq!(S3Backend::key("files/abc"), "files/abc");
    }
}
