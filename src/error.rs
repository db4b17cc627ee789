/// Terminal failure of one remote generation job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The remote service rejected the request or the transport failed before
    /// a usable job (or image) came back.
    #[error("submission failed: {0}")]
    Submission(String),

    /// The remote service reported a definitive failure. Not retryable here.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The polling budget ran out while the job was still in progress.
    #[error("job {job_id} still in progress after {attempts} poll attempts")]
    Timeout { job_id: String, attempts: u32 },
}

impl JobError {
    /// Whether resubmitting (or polling longer) could still succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout { .. })
    }
}

/// Caller supplied values outside the documented bounds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("cfg_scale must be within [1, 10], got {0}")]
    CfgScale(f32),

    #[error("motion_bucket_id must be within [1, 255], got {0}")]
    MotionBucket(u32),

    #[error("prompt must not be empty")]
    EmptyPrompt,
}

#[derive(Debug, thiserror::Error)]
pub enum EpubError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing archive entry: {0}")]
    MissingEntry(String),

    #[error("malformed package: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("summarizer returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("summarizer returned no content")]
    EmptyResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no clips to merge")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ffmpeg exited with {status}: {stderr}")]
    Ffmpeg { status: String, stderr: String },
}

/// Why a single chapter produced no clip.
#[derive(Debug, thiserror::Error)]
pub enum ChapterError {
    #[error("summary: {0}")]
    Summary(#[from] SummaryError),

    #[error("parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("image: {0}")]
    Image(JobError),

    #[error("video: {0}")]
    Video(JobError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Another run already owns this book's output directory.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("book {0} is already being processed")]
pub struct BookBusy(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing credential {0}; add it to the environment or .env file")]
    MissingCredential(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_job() {
        let e = JobError::Timeout {
            job_id: "abc123".into(),
            attempts: 6,
        };
        let msg = e.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains('6'));
        assert!(e.is_timeout());
    }

    #[test]
    fn test_generation_is_not_timeout() {
        assert!(!JobError::Generation("bad_request".into()).is_timeout());
        assert!(!JobError::Submission("refused".into()).is_timeout());
    }

    #[test]
    fn test_chapter_error_wraps_job_error() {
        let e = ChapterError::Video(JobError::Generation("content_moderation".into()));
        assert_eq!(e.to_string(), "video: generation failed: content_moderation");
    }

    #[test]
    fn test_missing_credential_display() {
        let e = ConfigError::MissingCredential("OPENAI_API_KEY");
        assert!(e.to_string().contains("OPENAI_API_KEY"));
    }
}
