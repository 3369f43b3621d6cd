//! Upstream object store access.
//!
//! The proxy talks to the origin through the [`ObjectStore`] trait so the
//! HTTP layer can be exercised against a mock. The production
//! implementation wraps the AWS S3 SDK pointed at any S3-compatible
//! endpoint (MinIO included).

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::config::OriginConfig;

/// Streamed object body.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Metadata returned by both GetObject and HeadObject.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_range: Option<String>,
    pub accept_ranges: Option<String>,
}

pub struct FetchedObject {
    pub metadata: ObjectMetadata,
    pub body: BodyStream,
}

/// Origin failures, discriminated the way the request handler maps them
/// to HTTP statuses.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("no such object: {0}")]
    NoSuchKey(String),
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, passing any `Range` header through verbatim.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError>;

    /// Fetch metadata only.
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(config: &OriginConfig) -> Self {
        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.use_ssl { "https" } else { "http" };
            format!("{scheme}://{}", config.endpoint)
        };

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "environment",
        );
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(config.request_timeout)
            .build();
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .timeout_config(timeouts)
            .build();

        info!(endpoint = %endpoint, region = %config.region, "origin client configured");
        Self {
            client: Client::from_conf(s3_config),
        }
    }
}

fn smithy_datetime(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single()
}

/// Map a GetObject failure to the origin discriminators.
fn classify_get(err: SdkError<GetObjectError>, what: String) -> OriginError {
    match &err {
        SdkError::ServiceError(service) => {
            let e = service.err();
            if e.is_no_such_key() {
                return OriginError::NoSuchKey(what);
            }
            match e.code() {
                Some("NoSuchBucket") => OriginError::NoSuchBucket(what),
                Some("AccessDenied") | Some("Forbidden") => OriginError::AccessDenied(what),
                _ => OriginError::Other(format!("{what}: {err}")),
            }
        }
        SdkError::TimeoutError(_) => OriginError::Other(format!("{what}: request timed out")),
        _ => OriginError::Other(format!("{what}: {err}")),
    }
}

/// Map a HeadObject failure. HEAD responses carry no error body, so the
/// raw status stands in where no error code was parsed.
fn classify_head(err: SdkError<HeadObjectError>, what: String) -> OriginError {
    match &err {
        SdkError::ServiceError(service) => {
            let e = service.err();
            if e.is_not_found() {
                return OriginError::NoSuchKey(what);
            }
            match e.code() {
                Some("NoSuchBucket") => OriginError::NoSuchBucket(what),
                Some("AccessDenied") | Some("Forbidden") => OriginError::AccessDenied(what),
                _ if service.raw().status().as_u16() == 403 => OriginError::AccessDenied(what),
                _ => OriginError::Other(format!("{what}: {err}")),
            }
        }
        SdkError::TimeoutError(_) => OriginError::Other(format!("{what}: request timed out")),
        _ => OriginError::Other(format!("{what}: {err}")),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            request = request.range(range);
        }
        let output = request
            .send()
            .await
            .map_err(|e| classify_get(e, format!("{bucket}/{key}")))?;

        let metadata = ObjectMetadata {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|l| u64::try_from(l).ok()),
            etag: output.e_tag().map(str::to_string),
            last_modified: output.last_modified().and_then(smithy_datetime),
            content_range: output.content_range().map(str::to_string),
            accept_ranges: output.accept_ranges().map(str::to_string),
        };
        let body: BodyStream = Box::pin(ReaderStream::new(output.body.into_async_read()));
        Ok(FetchedObject { metadata, body })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_head(e, format!("{bucket}/{key}")))?;

        Ok(ObjectMetadata {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|l| u64::try_from(l).ok()),
            etag: output.e_tag().map(str::to_string),
            last_modified: output.last_modified().and_then(smithy_datetime),
            content_range: None,
            accept_ranges: output.accept_ranges().map(str::to_string),
        })
    }
}
