//! Model inference clients
//!
//! `ModelClient` is the seam between the engine and the learned models.
//! The HTTP implementation posts JSON feature batches to a scoring
//! endpoint; tests substitute in-process mocks.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const USER_AGENT: &str = concat!("flowsentry/", env!("CARGO_PKG_VERSION"));

/// Errors from a model scoring call
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("model returned {got} scores for {expected} inputs")]
    ScoreCountMismatch { expected: usize, got: usize },
}

/// Health probe result
#[derive(Debug, Clone, Serialize)]
pub struct ModelHealth {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// Scoring interface implemented by each learned model endpoint
#[async_trait]
pub trait ModelClient: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<ModelHealth, ModelError>;

    /// Score a feature batch. The response must carry exactly one score
    /// per input row.
    async fn score(&self, features: &[Vec<f32>]) -> Result<Vec<f32>, ModelError>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    features: &'a [Vec<f32>],
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

/// HTTP client for one scoring endpoint
#[derive(Debug)]
pub struct HttpModelClient {
    name: String,
    score_url: String,
    health_url: String,
    client: Client,
    timeout_secs: u64,
}

impl HttpModelClient {
    pub fn new(name: impl Into<String>, score_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let score_url = score_url.into();

        let mut health = reqwest::Url::parse(&score_url)
            .with_context(|| format!("invalid model endpoint: {}", score_url))?;
        health.set_path("/health");
        health.set_query(None);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build model http client")?;

        Ok(Self {
            name: name.into(),
            score_url,
            health_url: health.to_string(),
            client,
            timeout_secs,
        })
    }

    fn map_request_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            ModelError::Connection(e.to_string())
        } else if e.is_status() {
            ModelError::Unavailable(e.to_string())
        } else if e.is_decode() {
            ModelError::InvalidResponse(e.to_string())
        } else {
            ModelError::Connection(e.to_string())
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<ModelHealth, ModelError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        Ok(ModelHealth {
            healthy: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn score(&self, features: &[Vec<f32>]) -> Result<Vec<f32>, ModelError> {
        let response = self
            .client
            .post(&self.score_url)
            .json(&ScoreRequest { features })
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?
            .error_for_status()
            .map_err(|e| self.map_request_error(e))?;

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| self.map_request_error(e))?;

        if body.scores.len() != features.len() {
            return Err(ModelError::ScoreCountMismatch {
                expected: features.len(),
                got: body.scores.len(),
            });
        }
        if body.scores.iter().any(|s| !s.is_finite()) {
            return Err(ModelError::InvalidResponse(
                "non-finite score in response".to_string(),
            ));
        }

        Ok(body.scores)
    }
}
