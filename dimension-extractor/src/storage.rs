//! Object storage access: where a file lives and how to fetch it.

use std::fmt;

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::Client as AwsS3SdkClient;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

const S3_SCHEME: &str = "s3";
const AWS_DOMAIN: &str = ".amazonaws.com";
const SSE_CUSTOMER_ALGORITHM: &str = "AES256";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("file url {0:?} could not be parsed")]
    Unparseable(String),
    #[error("file url {0:?} is neither s3:// nor an https S3 url")]
    UnsupportedScheme(String),
    #[error("file url {0:?} does not point at an S3 endpoint")]
    NotS3Host(String),
    #[error("file url {0:?} has no bucket")]
    MissingBucket(String),
    #[error("file url {0:?} has no object key")]
    MissingKey(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("S3 operation failed: {0}")]
    OperationFailed(String),
}

/// Bucket and key of a file, displayed in its canonical `s3://bucket/key` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    /// Accepts `s3://bucket/key` and path-style
    /// `https://s3[-.]<region>.amazonaws.com/bucket/key` urls.
    pub fn parse(file_url: &str) -> Result<Self, LocationError> {
        let url = Url::parse(file_url).map_err(|_| LocationError::Unparseable(file_url.to_owned()))?;

        let (bucket, key) = match url.scheme() {
            S3_SCHEME => {
                let bucket = url.host_str().unwrap_or_default();
                (bucket, url.path().trim_start_matches('/'))
            }
            "https" | "http" => {
                let host = url.host_str().unwrap_or_default();
                if !is_s3_host(host) {
                    return Err(LocationError::NotS3Host(file_url.to_owned()));
                }
                url.path()
                    .trim_start_matches('/')
                    .split_once('/')
                    .unwrap_or((url.path().trim_start_matches('/'), ""))
            }
            _ => return Err(LocationError::UnsupportedScheme(file_url.to_owned())),
        };

        if bucket.is_empty() {
            return Err(LocationError::MissingBucket(file_url.to_owned()));
        }
        if key.is_empty() {
            return Err(LocationError::MissingKey(file_url.to_owned()));
        }
        Ok(Self::new(&decode(bucket, file_url)?, &decode(key, file_url)?))
    }
}

/// Bucket and key as S3 knows them, not as they are escaped in the url.
fn decode(component: &str, file_url: &str) -> Result<String, LocationError> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| LocationError::Unparseable(file_url.to_owned()))
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// `s3.amazonaws.com`, `s3-eu-west-1.amazonaws.com` or `s3.eu-west-1.amazonaws.com`.
fn is_s3_host(host: &str) -> bool {
    match host.strip_suffix(AWS_DOMAIN) {
        Some("s3") => true,
        Some(prefix) => prefix.starts_with("s3-") || prefix.starts_with("s3."),
        None => false,
    }
}

/// Fetches whole objects, decrypting with a customer provided key when given.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(
        &self,
        location: &S3Location,
        customer_key: Option<&[u8]>,
    ) -> Result<Bytes, StorageError>;
}

pub struct S3ObjectStore {
    client: AwsS3SdkClient,
}

impl S3ObjectStore {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(
        &self,
        location: &S3Location,
        customer_key: Option<&[u8]>,
    ) -> Result<Bytes, StorageError> {
        let mut request = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key);

        // S3 decrypts server side with the key we hand it (SSE-C)
        if let Some(key) = customer_key {
            request = request
                .sse_customer_algorithm(SSE_CUSTOMER_ALGORITHM)
                .sse_customer_key(STANDARD.encode(key))
                .sse_customer_key_md5(STANDARD.encode(md5::compute(key).0));
        }

        let output = request.send().await.map_err(|e| {
            let error_message = format!("failed to get {location}: {e}");
            if let GetObjectError::NoSuchKey(_) = e.into_service_error() {
                StorageError::NotFound(location.to_string())
            } else {
                StorageError::OperationFailed(error_message)
            }
        })?;

        let body = output.body.collect().await.map_err(|e| {
            StorageError::OperationFailed(format!("failed to read body of {location}: {e}"))
        })?;
        Ok(body.into_bytes())
    }
}
