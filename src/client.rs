//! HTTP client the CLI subcommands use to talk to a running scheduler.

use reqwest::StatusCode;

use crate::error::{Result, ScootError};
use crate::scheduler::{JobDefinition, JobStatusReport};

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn schedule(&self, definition: &JobDefinition) -> Result<String> {
        let response = self
            .client
            .post(self.url("/jobs"))
            .json(definition)
            .send()
            .await
            .map_err(|e| ScootError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScootError::Http(e.to_string()))?;
        body.get("job_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ScootError::Http("missing job_id in response".to_string()))
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatusReport> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}", job_id)))
            .send()
            .await
            .map_err(|e| ScootError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ScootError::Http(e.to_string()))
    }

    pub async fn kill(&self, job_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/kill", job_id)))
            .send()
            .await
            .map_err(|e| ScootError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }
}

async fn error_from_response(response: reqwest::Response) -> ScootError {
    let status = response.status();
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::BAD_REQUEST => ScootError::InvalidJob(message),
        StatusCode::NOT_FOUND => ScootError::JobNotFound(message),
        StatusCode::CONFLICT => ScootError::AlreadyTerminal(message),
        _ => ScootError::Http(message),
    }
}
