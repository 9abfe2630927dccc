use std::time;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("invalid vault address {0:?}")]
    InvalidUrl(String),
    #[error("failed to build vault client: {0}")]
    Client(reqwest::Error),
    #[error("failed to read secret {path}: {source}")]
    Request { path: String, source: reqwest::Error },
    #[error("vault returned {status} for secret {path}")]
    Status { path: String, status: StatusCode },
    #[error("secret {path} has no string field {field:?}")]
    MissingField { path: String, field: String },
}

/// Reads one field of a secret.
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read_secret(&self, path: &str, field: &str) -> Result<String, SecretError>;
}

pub struct VaultClient {
    client: reqwest::Client,
    address: Url,
    token: String,
}

impl VaultClient {
    pub fn new(
        address: &str,
        token: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, SecretError> {
        let address = Url::parse(address)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| SecretError::InvalidUrl(address.to_owned()))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(SecretError::Client)?;

        Ok(Self {
            client,
            address,
            token: token.to_owned(),
        })
    }

    fn secret_url(&self, path: &str) -> Url {
        let mut url = self.address.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("v1")
                .extend(path.split('/').filter(|s| !s.is_empty()));
        }
        url
    }
}

/// KV version 2 nests the secret under `data.data`, version 1 under `data`.
fn secret_field<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    let data = body.get("data")?;
    data.get("data")
        .and_then(|nested| nested.get(field))
        .or_else(|| data.get(field))
        .and_then(Value::as_str)
}

#[async_trait]
impl SecretReader for VaultClient {
    async fn read_secret(&self, path: &str, field: &str) -> Result<String, SecretError> {
        let url = self.secret_url(path);
        debug!(path, "reading secret from vault");

        let request_error = |source| SecretError::Request {
            path: path.to_owned(),
            source,
        };
        let response = self
            .client
            .get(url)
            .header(VAULT_TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SecretError::Status {
                path: path.to_owned(),
                status,
            });
        }

        let body: Value = response.json().await.map_err(request_error)?;
        secret_field(&body, field)
            .map(str::to_owned)
            .ok_or_else(|| SecretError::MissingField {
                path: path.to_owned(),
                field: field.to_owned(),
            })
    }
}
