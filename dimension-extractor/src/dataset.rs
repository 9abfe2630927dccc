use std::time;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::extract::{CodelistMap, DimensionOption};
use crate::retry::{RetryPolicy, Retryable};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("invalid dataset API url {0:?}")]
    InvalidUrl(String),
    #[error("failed to build dataset API client: {0}")]
    Client(reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("dataset API returned {status} for {method} {url}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },
    #[error("invalid response body from {url}: {source}")]
    Body { url: String, source: reqwest::Error },
}

impl Retryable for DatasetError {
    fn is_retryable(&self) -> bool {
        match self {
            DatasetError::Transport { .. } => true,
            DatasetError::Status { status, .. } => status.is_server_error(),
            DatasetError::InvalidUrl(_) | DatasetError::Client(_) | DatasetError::Body { .. } => {
                false
            }
        }
    }
}

/// Header row and observation count of a file, stored on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub headers: Vec<String>,
    pub total_observations: u64,
}

/// The calls made to the dataset API while processing one file.
#[async_trait]
pub trait DatasetClient: Send + Sync {
    /// Code list of every dimension of the instance, keyed by lower-cased name.
    async fn get_codelists(&self, instance_id: &str) -> Result<CodelistMap, DatasetError>;

    /// Deliver one batch: a single option is posted on its own, anything
    /// larger goes out as one patch.
    async fn send_options(
        &self,
        instance_id: &str,
        batch: &[DimensionOption],
    ) -> Result<(), DatasetError>;

    async fn submit_summary(
        &self,
        instance_id: &str,
        summary: &InstanceSummary,
    ) -> Result<(), DatasetError>;
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    #[serde(default)]
    dimensions: Vec<InstanceDimension>,
}

#[derive(Debug, Deserialize)]
struct InstanceDimension {
    name: String,
    id: String,
}

#[derive(Debug, Serialize)]
struct OptionPost<'a> {
    dimension: &'a str,
    code_list: &'a str,
    code: &'a str,
    label: &'a str,
    option: &'a str,
}

impl<'a> From<&'a DimensionOption> for OptionPost<'a> {
    fn from(option: &'a DimensionOption) -> Self {
        Self {
            dimension: &option.dimension_name,
            code_list: &option.code_list_id,
            code: &option.code,
            label: &option.label,
            option: &option.value,
        }
    }
}

#[derive(Debug, Serialize)]
struct PatchOperation<'a> {
    op: &'static str,
    path: &'static str,
    value: Vec<OptionPost<'a>>,
}

/// Dataset API over HTTP, every call wrapped in the retry policy.
pub struct HttpDatasetClient {
    client: reqwest::Client,
    base_url: Url,
    auth_token: String,
    retry_policy: RetryPolicy,
}

impl HttpDatasetClient {
    pub fn new(
        base_url: &str,
        auth_token: &str,
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, DatasetError> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| DatasetError::InvalidUrl(base_url.to_owned()))?;

        let client = reqwest::Client::builder()
            .user_agent("dp-dimension-extractor")
            .timeout(request_timeout)
            .build()
            .map_err(DatasetError::Client)?;

        Ok(Self {
            client,
            base_url,
            auth_token: auth_token.to_owned(),
            retry_policy,
        })
    }

    /// `{base}/instances/{id}` with `extra` segments appended, each one
    /// percent-encoded.
    fn instance_url(&self, instance_id: &str, extra: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("instances")
                .push(instance_id)
                .extend(extra);
        }
        url
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DatasetError> {
        let request = request
            .bearer_auth(&self.auth_token)
            .build()
            .map_err(DatasetError::Client)?;
        let method = request.method().clone();
        let url = request.url().to_string();
        debug!(%method, %url, "calling dataset API");

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|source| DatasetError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DatasetError::Status {
                method,
                url,
                status,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl DatasetClient for HttpDatasetClient {
    async fn get_codelists(&self, instance_id: &str) -> Result<CodelistMap, DatasetError> {
        let url = &self.instance_url(instance_id, &[]);

        let instance: InstanceResponse = self
            .retry_policy
            .run("get_instance", move |_| async move {
                let response = self.execute(self.client.get(url.clone())).await?;
                response
                    .json::<InstanceResponse>()
                    .await
                    .map_err(|source| DatasetError::Body {
                        url: url.to_string(),
                        source,
                    })
            })
            .await?;

        Ok(instance
            .dimensions
            .into_iter()
            .map(|dimension| (dimension.name.to_lowercase(), dimension.id))
            .collect())
    }

    async fn send_options(
        &self,
        instance_id: &str,
        batch: &[DimensionOption],
    ) -> Result<(), DatasetError> {
        let url = &self.instance_url(instance_id, &["dimensions"]);

        match batch {
            [] => return Ok(()),
            [option] => {
                let body = &OptionPost::from(option);
                self.retry_policy
                    .run("post_option", move |_| async move {
                        self.execute(self.client.post(url.clone()).json(body))
                            .await
                            .map(|_| ())
                    })
                    .await?;
            }
            options => {
                let body = &[PatchOperation {
                    op: "add",
                    path: "/-",
                    value: options.iter().map(OptionPost::from).collect(),
                }];
                self.retry_policy
                    .run("patch_options", move |_| async move {
                        self.execute(self.client.patch(url.clone()).json(body))
                            .await
                            .map(|_| ())
                    })
                    .await?;
            }
        }

        metrics::counter!("dimension_extractor_options_delivered_total")
            .increment(batch.len() as u64);
        debug!(instance_id, options = batch.len(), "delivered dimension options");
        Ok(())
    }

    async fn submit_summary(
        &self,
        instance_id: &str,
        summary: &InstanceSummary,
    ) -> Result<(), DatasetError> {
        let url = &self.instance_url(instance_id, &[]);

        self.retry_policy
            .run("put_instance", move |_| async move {
                self.execute(self.client.put(url.clone()).json(summary))
                    .await
                    .map(|_| ())
            })
            .await?;

        info!(
            instance_id,
            total_observations = summary.total_observations,
            "stored file summary on instance"
        );
        Ok(())
    }
}
