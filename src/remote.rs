//! HTTP contract with the remote processing service.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client, Response};
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::error::{names, RawError};
use crate::{InputFile, JobKind, ProcessingOptions};

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL the `/processing/...` routes hang off, e.g. `http://host:8080/api`.
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub job_id: String,
    #[serde(default)]
    pub message: String,
    pub estimated_time_seconds: Option<f64>,
    pub status_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Completed | RemoteStatus::Failed | RemoteStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub filename: Option<String>,
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: f64,
    pub processing_time_ms: Option<f64>,
    pub estimated_remaining_seconds: Option<f64>,
    pub file_size_bytes: Option<u64>,
    pub error: Option<String>,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub success: bool,
    #[serde(default)]
    pub pages_processed: u32,
    #[serde(default)]
    pub operation_performed: String,
    #[serde(default)]
    pub engine_used: String,
    pub size_reduction_bytes: Option<i64>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub processing_time_ms: Option<f64>,
    pub target_time_ms: Option<f64>,
    pub performance_rating: Option<String>,
    pub compared_to_adobe: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub job_id: String,
    pub result: ResultSummary,
    pub performance: Performance,
    pub download_url: Option<String>,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn upload(
        &self,
        file: &InputFile,
        kind: JobKind,
        options: &ProcessingOptions,
    ) -> Result<UploadResponse, RawError>;

    async fn status(&self, job_id: &str) -> Result<StatusResponse, RawError>;

    async fn result(&self, job_id: &str) -> Result<ResultResponse, RawError>;

    async fn download(&self, job_id: &str) -> Result<Bytes, RawError>;
}

pub struct RemoteClient {
    http: Client,
    base_url: String,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RawError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/processing/{}", self.base_url, path)
    }
}

/// Multipart string fields describing the requested processing.
pub fn form_fields(kind: JobKind, options: &ProcessingOptions) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("operation", kind.as_str().to_string()),
        ("quality", options.quality.as_str().to_string()),
        (
            "require_enterprise_compliance",
            options.require_enterprise_compliance.to_string(),
        ),
        ("preserve_metadata", options.preserve_metadata.to_string()),
        ("optimize_for_web", options.optimize_for_web.to_string()),
    ];
    if let Some(format) = &options.output_format {
        fields.push(("output_format", format.clone()));
    }
    if let Some(range) = &options.page_range {
        fields.push(("page_range", range.clone()));
    }
    if let Some(level) = options.compression_level {
        fields.push(("compression_level", level.to_string()));
    }
    if let Some(text) = &options.watermark_text {
        fields.push(("watermark_text", text.clone()));
    }
    if let Some(degrees) = options.rotation_degrees {
        fields.push(("rotation_degrees", degrees.to_string()));
    }
    fields
}

async fn check(response: Response) -> Result<Response, RawError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RawError::new(format!("remote service answered {status}: {body}")).with_status(status.as_u16()))
}

fn part(file: &InputFile) -> multipart::Part {
    multipart::Part::bytes(file.data.to_vec()).file_name(file.name.clone())
}

#[async_trait]
impl RemoteBackend for RemoteClient {
    async fn upload(
        &self,
        file: &InputFile,
        kind: JobKind,
        options: &ProcessingOptions,
    ) -> Result<UploadResponse, RawError> {
        let mut form = multipart::Form::new().part("file", part(file));
        for extra in &options.merge_with {
            form = form.part("merge_files", part(extra));
        }
        for (name, value) in form_fields(kind, options) {
            form = form.text(name, value);
        }

        debug!(filename = %file.name, size = file.size(), %kind, "uploading");
        let response = self.http.post(self.url("upload")).multipart(form).send().await?;
        let upload: UploadResponse = check(response).await?.json().await?;
        if !upload.success {
            return Err(RawError::named(names::PROCESSING, upload.message));
        }
        info!(remote_job_id = %upload.job_id, "upload accepted");
        Ok(upload)
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, RawError> {
        let response = self.http.get(self.url(&format!("status/{job_id}"))).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn result(&self, job_id: &str) -> Result<ResultResponse, RawError> {
        let response = self.http.get(self.url(&format!("result/{job_id}"))).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn download(&self, job_id: &str) -> Result<Bytes, RawError> {
        let response = self.http.get(self.url(&format!("download/{job_id}"))).send().await?;
        Ok(check(response).await?.bytes().await?)
    }
}
