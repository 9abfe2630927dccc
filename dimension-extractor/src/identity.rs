use std::time;

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to build identity client: {0}")]
    Client(reqwest::Error),
    #[error("identity request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("service token rejected by {url} with {status}")]
    Rejected { url: String, status: StatusCode },
}

/// Confirm the service token with the identity endpoint before any message is
/// consumed.
pub async fn check_identity(
    zebedee_url: &str,
    service_token: &str,
    request_timeout: time::Duration,
) -> Result<(), IdentityError> {
    let url = format!("{}/identity", zebedee_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(IdentityError::Client)?;

    let response = client
        .get(&url)
        .header(AUTHORIZATION, service_token)
        .send()
        .await
        .map_err(|source| IdentityError::Request {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(IdentityError::Rejected { url, status });
    }

    info!("service identity validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    #[tokio::test]
    async fn accepted_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/identity")
                .header("authorization", "service-token");
            then.status(200).body(r#"{"identifier": "dp-dimension-extractor"}"#);
        });

        check_identity(&server.base_url(), "service-token", time::Duration::from_secs(5))
            .await
            .unwrap();
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn rejected_token() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/identity");
            then.status(401);
        });

        let err = check_identity(&server.url("/"), "bad", time::Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Rejected {
                status: StatusCode::UNAUTHORIZED,
                ..
            }
        ));
    }
}
