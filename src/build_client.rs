//! `BuildClient`: the remote visual-testing API. Treated as an external
//! collaborator whose exact wire contract this crate doesn't own, but a
//! runnable crate needs at least one implementation; this one uses
//! `reqwest`, already part of the teacher's dependency stack (there for
//! URL validation, here for the wire client).

use crate::error::{PercyError, RetryPolicy};
use crate::model::{Build, Resource};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

#[async_trait]
pub trait BuildClient: Send + Sync {
    async fn create_build(&self) -> Result<Build, PercyError>;
    async fn create_snapshot(
        &self,
        build_id: &str,
        name: &str,
        widths: &[u32],
        resources: &[Resource],
    ) -> Result<String, PercyError>;
    async fn finalize_build(&self, build_id: &str) -> Result<(), PercyError>;
}

#[derive(Serialize)]
struct ResourceAttributes<'a> {
    #[serde(rename = "resource-url")]
    resource_url: &'a str,
    mimetype: &'a str,
    #[serde(rename = "is-root")]
    is_root: bool,
}

pub struct HttpBuildClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
    parallel_nonce: Option<String>,
    parallel_total: Option<u32>,
}

impl HttpBuildClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            retry: RetryPolicy::default(),
            parallel_nonce: None,
            parallel_total: None,
        }
    }

    /// Carries `PERCY_PARALLEL_NONCE`/`PERCY_PARALLEL_TOTAL` as request
    /// headers on `create_build`, so the remote API can group this build
    /// with the other shards sharing the same nonce.
    pub fn with_parallel(mut self, nonce: Option<String>, total: Option<u32>) -> Self {
        self.parallel_nonce = nonce;
        self.parallel_total = total;
        self
    }

    /// Runs `op`, retrying with exponential backoff on the retryable 5xx /
    /// network branch of APIError, up to `retry.max_attempts`.
    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T, PercyError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PercyError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!("build API call failed (attempt {attempt}), retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BuildClient for HttpBuildClient {
    async fn create_build(&self) -> Result<Build, PercyError> {
        self.with_retry(|| async {
            let mut request = self
                .client
                .post(format!("{}/builds", self.base_url))
                .bearer_auth(&self.token);
            if let Some(nonce) = &self.parallel_nonce {
                request = request.header("X-PERCY-PARALLEL-NONCE", nonce);
            }
            if let Some(total) = self.parallel_total {
                request = request.header("X-PERCY-PARALLEL-TOTAL", total.to_string());
            }
            let response = request
                .send()
                .await
                .map_err(|e| PercyError::ApiError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(PercyError::ApiError(format!(
                    "create_build returned {}",
                    response.status()
                )));
            }
            response
                .json::<Build>()
                .await
                .map_err(|e| PercyError::ApiError(e.to_string()))
        })
        .await
    }

    async fn create_snapshot(
        &self,
        build_id: &str,
        name: &str,
        widths: &[u32],
        resources: &[Resource],
    ) -> Result<String, PercyError> {
        let payload: Vec<_> = resources
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.sha,
                    "attributes": ResourceAttributes {
                        resource_url: &r.url,
                        mimetype: &r.mimetype,
                        is_root: r.root,
                    }
                })
            })
            .collect();

        debug!("uploading snapshot {name} with {} resources", resources.len());

        self.with_retry(|| async {
            let response = self
                .client
                .post(format!("{}/builds/{build_id}/snapshots", self.base_url))
                .bearer_auth(&self.token)
                .json(&serde_json::json!({
                    "name": name,
                    "widths": widths,
                    "resources": payload,
                }))
                .send()
                .await
                .map_err(|e| PercyError::ApiError(e.to_string()))?;

            if response.status().is_client_error() {
                return Err(PercyError::ApiError(format!(
                    "create_snapshot rejected: {}",
                    response.status()
                )));
            }
            if !response.status().is_success() {
                return Err(PercyError::ApiError(format!(
                    "create_snapshot returned {}",
                    response.status()
                )));
            }

            #[derive(serde::Deserialize)]
            struct SnapshotCreated {
                id: String,
            }
            let created: SnapshotCreated = response
                .json()
                .await
                .map_err(|e| PercyError::ApiError(e.to_string()))?;
            Ok(created.id)
        })
        .await
    }

    async fn finalize_build(&self, build_id: &str) -> Result<(), PercyError> {
        self.with_retry(|| async {
            let response = self
                .client
                .post(format!("{}/builds/{build_id}/finalize", self.base_url))
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| PercyError::ApiError(e.to_string()))?;
            if !response.status().is_success() {
                return Err(PercyError::ApiError(format!(
                    "finalize_build returned {}",
                    response.status()
                )));
            }
            Ok(())
        })
        .await
    }
}
