use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Where upstream auth headers come from.
#[derive(Debug, Clone)]
pub enum Credentials {
    Anonymous,
    Bearer(String),
    /// Token minted by the GCE / Cloud Run metadata server.
    MetadataServer { token_url: String },
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl Credentials {
    pub async fn headers(&self, http: &Client) -> RelayResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let token = match self {
            Credentials::Anonymous => return Ok(headers),
            Credentials::Bearer(token) => token.clone(),
            Credentials::MetadataServer { token_url } => fetch_metadata_token(http, token_url).await?,
        };

        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RelayError::Auth(e.to_string()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}

async fn fetch_metadata_token(http: &Client, token_url: &str) -> RelayResult<String> {
    debug!("Fetching access token from {}", token_url);
    let response = http
        .get(token_url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| RelayError::Auth(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Auth(format!(
            "metadata server returned {} - {}",
            status, body
        )));
    }

    let token: MetadataToken = response
        .json()
        .await
        .map_err(|e| RelayError::Auth(e.to_string()))?;
    Ok(token.access_token)
}
