//! Tier-2 verification: uncertain pairs are sent, in bounded batches, to an
//! external semantic-matching service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penny_core::TransactionId;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::matcher::UncertainPair;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Verification request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Verification service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Verification request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to decode verification response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedMatch {
    pub candidate_id: TransactionId,
    pub new_transaction_ref: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    #[serde(default)]
    pub matches: Vec<VerifiedMatch>,
    #[serde(default)]
    pub non_matches: Vec<String>,
}

/// Merged result of every batch, plus one message per failed batch.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub outcome: VerificationOutcome,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn verify_batch(&self, pairs: &[UncertainPair]) -> Result<VerificationOutcome, VerifyError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    pairs: &'a [UncertainPair],
}

pub struct HttpVerificationService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpVerificationService {
    pub fn new(config: &VerifierConfig) -> Result<Self, VerifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl VerificationService for HttpVerificationService {
    async fn verify_batch(&self, pairs: &[UncertainPair]) -> Result<VerificationOutcome, VerifyError> {
        let mut request = self.client.post(&self.endpoint).json(&VerifyRequest { pairs });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(VerifyError::Status { status: status.as_u16(), message: body });
        }
        serde_json::from_str(&body).map_err(|e| VerifyError::Decode(e.to_string()))
    }
}

/// Splits pairs into batches no larger than the service limit and submits
/// them one after another. A failed batch never stops the remaining ones.
#[derive(Clone)]
pub struct VerifierClient {
    service: Arc<dyn VerificationService>,
    batch_size: usize,
    timeout: Duration,
}

impl VerifierClient {
    pub fn new(service: Arc<dyn VerificationService>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            service,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn from_config(service: Arc<dyn VerificationService>, config: &VerifierConfig) -> Self {
        Self::new(service, config.batch_size, Duration::from_secs(config.timeout_secs))
    }

    pub async fn verify(&self, pairs: &[UncertainPair]) -> VerificationReport {
        let mut report = VerificationReport::default();
        if pairs.is_empty() {
            return report;
        }

        let total = pairs.len().div_ceil(self.batch_size);
        for (idx, batch) in pairs.chunks(self.batch_size).enumerate() {
            let result = tokio::time::timeout(self.timeout, self.service.verify_batch(batch))
                .await
                .unwrap_or(Err(VerifyError::Timeout(self.timeout)));

            match result {
                Ok(outcome) => {
                    debug!(
                        batch = idx + 1,
                        total,
                        pairs = batch.len(),
                        matches = outcome.matches.len(),
                        "verification batch done"
                    );
                    report.outcome.matches.extend(outcome.matches);
                    report.outcome.non_matches.extend(outcome.non_matches);
                }
                Err(e) => {
                    warn!(batch = idx + 1, total, pairs = batch.len(), error = %e, "verification batch failed");
                    report.errors.push(format!(
                        "Verification batch {} of {} ({} pairs) failed: {e}",
                        idx + 1,
                        total,
                        batch.len()
                    ));
                }
            }
        }

        report
    }
}
