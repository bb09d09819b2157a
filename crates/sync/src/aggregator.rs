//! Client side of the aggregator's cursor-based change feed.

use std::time::Duration;

use async_trait::async_trait;
use penny_core::{ConnectionId, DeltaPage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AggregatorConfig;

/// Error code the aggregator uses when the bank login has expired.
const LOGIN_REQUIRED_CODE: &str = "ITEM_LOGIN_REQUIRED";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Bank connection requires reauthentication: {0}")]
    ReauthRequired(String),
    #[error("Aggregator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Aggregator returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Aggregator request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to decode aggregator response: {0}")]
    Decode(String),
}

impl FeedError {
    pub fn requires_reauth(&self) -> bool {
        matches!(self, FeedError::ReauthRequired(_))
    }
}

#[async_trait]
pub trait AggregatorFeed: Send + Sync {
    /// Fetches the page of changes after `cursor`; `None` starts from the
    /// beginning of the connection's history.
    async fn fetch_page(
        &self,
        connection: &ConnectionId,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, FeedError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest<'a> {
    connection_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ErrorBody {
    error_code: Option<String>,
    message: Option<String>,
    requires_reauth: bool,
}

pub struct HttpAggregatorFeed {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpAggregatorFeed {
    pub fn new(config: &AggregatorConfig) -> Result<Self, FeedError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/transactions/sync", self.base_url)
    }
}

#[async_trait]
impl AggregatorFeed for HttpAggregatorFeed {
    async fn fetch_page(
        &self,
        connection: &ConnectionId,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, FeedError> {
        let url = self.endpoint();
        let mut request = self.client.post(&url).json(&SyncRequest {
            connection_id: connection.as_str(),
            cursor,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FeedError::Timeout(self.timeout))??;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let error: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let message = error
                .message
                .clone()
                .or_else(|| error.error_code.clone())
                .unwrap_or_else(|| body.clone());
            if error.requires_reauth || error.error_code.as_deref() == Some(LOGIN_REQUIRED_CODE) {
                warn!(%connection, %message, "aggregator requires reauthentication");
                return Err(FeedError::ReauthRequired(message));
            }
            return Err(FeedError::Status { status: status.as_u16(), message });
        }

        let page: DeltaPage =
            serde_json::from_str(&body).map_err(|e| FeedError::Decode(e.to_string()))?;
        debug!(
            %connection,
            added = page.added.len(),
            modified = page.modified.len(),
            removed = page.removed.len(),
            has_more = page.has_more,
            "fetched delta page"
        );
        Ok(page)
    }
}
