use crate::error::{ChapterError, JobError, ParamsError};
use crate::models::Artifact;
use async_trait::async_trait;
use image::ImageFormat;
use image::imageops::FilterType;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_STYLE_PRESET: &str = "cinematic";

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub style_preset: String,
    pub output_format: String,
}

impl ImageRequest {
    pub fn new(prompt: &str, style_preset: &str) -> Result<Self, ParamsError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ParamsError::EmptyPrompt);
        }
        Ok(ImageRequest {
            prompt: prompt.to_string(),
            style_preset: style_preset.to_string(),
            output_format: "png".to_string(),
        })
    }
}

/// Text-to-image endpoint. Answers in the same call, there is no job to poll.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, JobError>;
}

#[derive(Clone)]
pub struct ImageJobClient {
    backend: Arc<dyn ImageBackend>,
    style_preset: String,
    /// Square edge the image is resized to; `None` keeps the service's size.
    size: Option<u32>,
}

impl ImageJobClient {
    pub fn new(backend: Arc<dyn ImageBackend>, size: Option<u32>) -> Self {
        ImageJobClient {
            backend,
            style_preset: DEFAULT_STYLE_PRESET.to_string(),
            size,
        }
    }

    /// Build a request for `prompt` in this client's style.
    pub fn request(&self, prompt: &str) -> Result<ImageRequest, ParamsError> {
        ImageRequest::new(prompt, &self.style_preset)
    }

    /// Generate and normalize an image for a validated request.
    pub async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>, JobError> {
        let bytes = self.backend.generate(request).await?;
        tracing::debug!("Received {} image bytes", bytes.len());

        match self.size {
            Some(edge) => tokio::task::spawn_blocking(move || resize_png(&bytes, edge, edge))
                .await
                .map_err(|e| JobError::Generation(format!("resize task failed: {}", e)))?
                .map_err(|e| JobError::Generation(format!("undecodable image: {}", e))),
            None => Ok(bytes),
        }
    }

    /// An empty prompt fails with `ChapterError::Params` before the service
    /// is called.
    pub async fn generate_to(&self, prompt: &str, dest: &Path) -> Result<Artifact, ChapterError> {
        let request = self.request(prompt)?;
        let bytes = self.generate(&request).await.map_err(ChapterError::Image)?;
        let artifact = Artifact::new(dest, bytes);
        artifact.persist().await?;
        Ok(artifact)
    }
}

/// Decode any supported image and re-encode it as a `width`×`height` PNG.
pub fn resize_png(bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let resized = if img.width() == width && img.height() == height {
        img
    } else {
        img.resize_exact(width, height, FilterType::CatmullRom)
    };
    let mut out = Vec::new();
    resized.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}
