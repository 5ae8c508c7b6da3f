//! Client for the external competition API.
//!
//! All endpoints take basic auth from the configured key pair and speak JSON.
//! Every create carries a client-minted `reference_id` so a crashed submitter
//! can find an already-accepted artifact instead of re-POSTing it.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crucible_types::{FailureKind, SubmissionStatus};

use crate::config::ExternalApiConfig;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("competition api transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("competition api returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl ApiError {
    /// Classify per the failure taxonomy: transport and 5xx are transient,
    /// 4xx is terminal for the submission it belongs to.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ApiError::Transport(_) => FailureKind::Transient,
            ApiError::Status { status, .. } if *status >= 500 => FailureKind::Transient,
            ApiError::Status { .. } => FailureKind::ExternalApi,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

/// Server response to a successful create.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedResponse {
    pub id: String,
    #[serde(default)]
    pub status: SubmissionStatus,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: SubmissionStatus,
}

#[derive(Debug, Serialize)]
pub struct PovSubmissionRequest {
    pub harness_name: String,
    pub sanitizer: String,
    /// Base64-encoded crashing input.
    pub testcase: String,
    pub reference_id: String,
}

#[derive(Debug, Serialize)]
pub struct PatchSubmissionRequest {
    pub patch: String,
    pub reference_id: String,
}

#[derive(Debug, Serialize)]
pub struct BundleRequest {
    pub competition_pov_id: String,
    pub competition_patch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competition_sarif_id: Option<String>,
    /// Client reference for create idempotence; absent on PATCH updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SarifAssessmentRequest {
    pub sarif_id: String,
    /// `correct` or `incorrect`, with supporting detail.
    pub assessment: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct CompetitionClient {
    http: Client,
    endpoint: String,
    auth_header: String,
}

impl CompetitionClient {
    pub fn new(config: &ExternalApiConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("crucible/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        let credentials = format!("{}:{}", config.key_id, config.key_token);
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            auth_header: format!("Basic {}", BASE64.encode(credentials)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()?;
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(response.json()?);
        }
        let body = response.text().unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    pub fn submit_pov(
        &self,
        task_id: &str,
        request: &PovSubmissionRequest,
    ) -> Result<CreatedResponse, ApiError> {
        self.execute(
            self.http
                .post(self.url(&format!("/v1/task/{task_id}/pov")))
                .json(request),
        )
    }

    pub fn pov_status(&self, task_id: &str, pov_id: &str) -> Result<SubmissionStatus, ApiError> {
        let response: StatusResponse = self.execute(
            self.http
                .get(self.url(&format!("/v1/task/{task_id}/pov/{pov_id}"))),
        )?;
        Ok(response.status)
    }

    /// Look up a PoV by the client reference id sent with its create.
    /// Returns None when the server has never accepted it.
    pub fn find_pov_by_reference(
        &self,
        task_id: &str,
        reference_id: &str,
    ) -> Result<Option<CreatedResponse>, ApiError> {
        self.find_by_reference(&format!("/v1/task/{task_id}/pov/by-reference/{reference_id}"))
    }

    pub fn submit_patch(
        &self,
        task_id: &str,
        request: &PatchSubmissionRequest,
    ) -> Result<CreatedResponse, ApiError> {
        self.execute(
            self.http
                .post(self.url(&format!("/v1/task/{task_id}/patch")))
                .json(request),
        )
    }

    pub fn patch_status(
        &self,
        task_id: &str,
        patch_id: &str,
    ) -> Result<SubmissionStatus, ApiError> {
        let response: StatusResponse = self.execute(
            self.http
                .get(self.url(&format!("/v1/task/{task_id}/patch/{patch_id}"))),
        )?;
        Ok(response.status)
    }

    pub fn find_patch_by_reference(
        &self,
        task_id: &str,
        reference_id: &str,
    ) -> Result<Option<CreatedResponse>, ApiError> {
        self.find_by_reference(&format!(
            "/v1/task/{task_id}/patch/by-reference/{reference_id}"
        ))
    }

    pub fn create_bundle(
        &self,
        task_id: &str,
        request: &BundleRequest,
    ) -> Result<CreatedResponse, ApiError> {
        self.execute(
            self.http
                .post(self.url(&format!("/v1/task/{task_id}/bundle")))
                .json(request),
        )
    }

    pub fn find_bundle_by_reference(
        &self,
        task_id: &str,
        reference_id: &str,
    ) -> Result<Option<CreatedResponse>, ApiError> {
        self.find_by_reference(&format!(
            "/v1/task/{task_id}/bundle/by-reference/{reference_id}"
        ))
    }

    pub fn update_bundle(
        &self,
        task_id: &str,
        bundle_id: &str,
        request: &BundleRequest,
    ) -> Result<CreatedResponse, ApiError> {
        self.execute(
            self.http
                .patch(self.url(&format!("/v1/task/{task_id}/bundle/{bundle_id}")))
                .json(request),
        )
    }

    pub fn submit_sarif_assessment(
        &self,
        task_id: &str,
        request: &SarifAssessmentRequest,
    ) -> Result<CreatedResponse, ApiError> {
        self.execute(
            self.http
                .post(self.url(&format!("/v1/task/{task_id}/sarif-assessment")))
                .json(request),
        )
    }

    fn find_by_reference(&self, path: &str) -> Result<Option<CreatedResponse>, ApiError> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json()?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }
}
