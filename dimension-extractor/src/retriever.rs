use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{LocationError, ObjectStore, S3Location, StorageError};
use crate::vault::{SecretError, SecretReader};

const KEY_FIELD: &str = "key";

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("decryption key for {location} is not valid hex: {source}")]
    KeyDecode {
        location: String,
        source: hex::FromHexError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Contents of a file and the canonical location they were read from.
#[derive(Debug, Clone)]
pub struct RetrievedFile {
    pub body: Bytes,
    pub location: S3Location,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, file_url: &str) -> Result<RetrievedFile, RetrieveError>;
}

/// Where per-file decryption keys are kept.
pub struct KeyStore {
    pub secrets: Arc<dyn SecretReader>,
    pub vault_path: String,
}

/// Reads files from S3, decrypting them with a per-file key when a key store
/// is configured.
pub struct FileRetriever {
    store: Arc<dyn ObjectStore>,
    keys: Option<KeyStore>,
    expected_buckets: Vec<String>,
}

impl FileRetriever {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            keys: None,
            expected_buckets: Vec::new(),
        }
    }

    pub fn with_encryption(mut self, keys: KeyStore) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Buckets files normally come from. Others are still read, with a warning.
    pub fn expected_buckets(mut self, buckets: Vec<String>) -> Self {
        self.expected_buckets = buckets;
        self
    }

    async fn decryption_key(
        &self,
        keys: &KeyStore,
        location: &S3Location,
    ) -> Result<Vec<u8>, RetrieveError> {
        let path = format!("{}/{}", keys.vault_path.trim_end_matches('/'), location.key);
        let encoded = keys.secrets.read_secret(&path, KEY_FIELD).await?;
        hex::decode(encoded.trim()).map_err(|source| RetrieveError::KeyDecode {
            location: location.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Retriever for FileRetriever {
    async fn retrieve(&self, file_url: &str) -> Result<RetrievedFile, RetrieveError> {
        let location = S3Location::parse(file_url)?;

        if !self.expected_buckets.is_empty() && !self.expected_buckets.contains(&location.bucket)
        {
            warn!(
                bucket = %location.bucket,
                expected = ?self.expected_buckets,
                "retrieving file from an unexpected bucket"
            );
        }

        let body = match &self.keys {
            Some(keys) => {
                let key = self.decryption_key(keys, &location).await?;
                self.store.get_object(&location, Some(key.as_slice())).await?
            }
            None => self.store.get_object(&location, None).await?,
        };

        info!(
            bucket = %location.bucket,
            key = %location.key,
            bytes = body.len(),
            encrypted = self.keys.is_some(),
            "retrieved file"
        );
        Ok(RetrievedFile { body, location })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockObjectStore;
    use std::collections::HashMap;

    struct StaticSecrets(HashMap<String, String>);

    #[async_trait]
    impl SecretReader for StaticSecrets {
        async fn read_secret(&self, path: &str, field: &str) -> Result<String, SecretError> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| SecretError::MissingField {
                    path: path.to_owned(),
                    field: field.to_owned(),
                })
        }
    }

    fn store() -> MockObjectStore {
        MockObjectStore::new().get_object_ret(
            "csv-exported",
            "v4/file.csv",
            Ok(Bytes::from_static(b"V4_0,Year\n")),
        )
    }

    #[tokio::test]
    async fn reads_plain_file_from_either_url_form() {
        let store = store();
        let retriever = FileRetriever::new(Arc::new(store.clone()));

        for url in [
            "s3://csv-exported/v4/file.csv",
            "https://s3-eu-west-1.amazonaws.com/csv-exported/v4/file.csv",
        ] {
            let file = retriever.retrieve(url).await.unwrap();
            assert_eq!(file.location.to_string(), "s3://csv-exported/v4/file.csv");
            assert_eq!(file.body, Bytes::from_static(b"V4_0,Year\n"));
        }
        assert!(store.fetches().iter().all(|(_, key)| key.is_none()));
    }

    #[tokio::test]
    async fn decrypts_with_the_key_from_vault() {
        let store = store();
        let secrets = StaticSecrets(HashMap::from([(
            "secret/shared/psk/v4/file.csv".to_owned(),
            "00ff10".to_owned(),
        )]));
        let retriever = FileRetriever::new(Arc::new(store.clone())).with_encryption(KeyStore {
            secrets: Arc::new(secrets),
            vault_path: "secret/shared/psk/".to_owned(),
        });

        retriever
            .retrieve("s3://csv-exported/v4/file.csv")
            .await
            .unwrap();
        assert_eq!(
            store.fetches()[0].1.as_deref(),
            Some(&[0x00u8, 0xff, 0x10][..])
        );
    }

    #[tokio::test]
    async fn key_problems_are_fatal() {
        let secrets = StaticSecrets(HashMap::from([(
            "psk/v4/file.csv".to_owned(),
            "not hex".to_owned(),
        )]));
        let retriever = FileRetriever::new(Arc::new(store())).with_encryption(KeyStore {
            secrets: Arc::new(secrets),
            vault_path: "psk".to_owned(),
        });

        assert!(matches!(
            retriever.retrieve("s3://csv-exported/v4/file.csv").await,
            Err(RetrieveError::KeyDecode { .. })
        ));
        assert!(matches!(
            retriever.retrieve("s3://csv-exported/other.csv").await,
            Err(RetrieveError::Secret(_))
        ));
    }

    #[tokio::test]
    async fn bad_location_and_missing_object() {
        let retriever =
            FileRetriever::new(Arc::new(store())).expected_buckets(vec!["csv-exported".to_owned()]);

        assert!(matches!(
            retriever.retrieve("file:///tmp/file.csv").await,
            Err(RetrieveError::Location(_))
        ));
        assert!(matches!(
            retriever.retrieve("s3://elsewhere/file.csv").await,
            Err(RetrieveError::Storage(StorageError::NotFound(_)))
        ));
    }
}
