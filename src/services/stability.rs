use crate::error::JobError;
use crate::models::{MotionParams, PollOutcome};
use crate::services::image::{ImageBackend, ImageRequest};
use crate::services::video::VideoBackend;
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const IMAGE_PATH: &str = "/v2beta/stable-image/generate/core";
const VIDEO_PATH: &str = "/v2beta/image-to-video";

/// Stability AI REST client backing both the image and the video job clients.
#[derive(Clone)]
pub struct StabilityClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Option<Arc<DirectRateLimiter>>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: Option<String>,
}

/// Error payload the v2beta endpoints return on failure.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
}

impl StabilityClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        StabilityClient {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            limiter: None,
        }
    }

    /// Share one request budget across every call made through this client
    /// and its clones.
    pub fn with_rate_limit(mut self, requests_per_minute: NonZeroU32) -> Self {
        self.limiter = Some(Arc::new(RateLimiter::direct(Quota::per_minute(
            requests_per_minute,
        ))));
        self
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ImageBackend for StabilityClient {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, JobError> {
        self.throttle().await;

        let form = Form::new()
            .text("prompt", request.prompt.clone())
            .text("style_preset", request.style_preset.clone())
            .text("output_format", request.output_format.clone());

        let response = self
            .client
            .post(self.url(IMAGE_PATH))
            .bearer_auth(&self.api_key)
            .header("accept", "image/*")
            .multipart(form)
            .send()
            .await
            .map_err(|e| JobError::Submission(format!("image request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| JobError::Generation(format!("failed to read image body: {}", e)))?;
        classify_image(status, &body)
    }
}

#[async_trait]
impl VideoBackend for StabilityClient {
    async fn submit(&self, image: Vec<u8>, params: MotionParams) -> Result<String, JobError> {
        self.throttle().await;

        let part = Part::bytes(image)
            .file_name("image.png")
            .mime_str("image/png")
            .map_err(|e| JobError::Submission(format!("failed to build multipart part: {}", e)))?;
        let form = Form::new()
            .part("image", part)
            .text("seed", "0")
            .text("cfg_scale", params.cfg_scale().to_string())
            .text("motion_bucket_id", params.motion_bucket_id().to_string());

        let response = self
            .client
            .post(self.url(VIDEO_PATH))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| JobError::Submission(format!("video request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| JobError::Submission(format!("failed to read submission body: {}", e)))?;
        parse_submission(status, &body)
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome, JobError> {
        self.throttle().await;

        let response = self
            .client
            .get(self.url(&format!("{}/result/{}", VIDEO_PATH, job_id)))
            .bearer_auth(&self.api_key)
            .header("accept", "video/*")
            .send()
            .await
            .map_err(|e| JobError::Generation(format!("status request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| JobError::Generation(format!("failed to read video body: {}", e)))?;
        classify_poll(status, &body)
    }
}

fn classify_image(status: StatusCode, body: &[u8]) -> Result<Vec<u8>, JobError> {
    if status == StatusCode::OK {
        Ok(body.to_vec())
    } else {
        Err(JobError::Generation(describe_error(status, body)))
    }
}

fn parse_submission(status: StatusCode, body: &[u8]) -> Result<String, JobError> {
    if !status.is_success() {
        return Err(JobError::Submission(describe_error(status, body)));
    }
    let parsed: SubmitResponse = serde_json::from_slice(body)
        .map_err(|e| JobError::Submission(format!("malformed submission response: {}", e)))?;
    parsed
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| JobError::Submission("submission response has no job id".to_string()))
}

/// 200 carries the finished clip, 202 means still rendering; nothing else is
/// worth retrying.
fn classify_poll(status: StatusCode, body: &[u8]) -> Result<PollOutcome, JobError> {
    match status {
        StatusCode::OK => Ok(PollOutcome::Ready(body.to_vec())),
        StatusCode::ACCEPTED => Ok(PollOutcome::InProgress),
        _ => Err(JobError::Generation(describe_error(status, body))),
    }
}

fn describe_error(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { name, errors }) if name.is_some() || !errors.is_empty() => {
            let name = name.unwrap_or_else(|| "error".to_string());
            if errors.is_empty() {
                format!("{} ({})", name, status)
            } else {
                format!("{} ({}): {}", name, status, errors.join("; "))
            }
        }
        _ => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, text)
            }
        }
    }
}
