use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ParamsError;

/// One content section of a book, in reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based position among the chapters kept after filtering.
    pub index: usize,
    pub title: Option<String>,
    /// Archive path of the content document this text came from.
    pub source: String,
    pub text: String,
}

/// Knobs for the image-to-video job, bounded as the remote service documents them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionParams {
    cfg_scale: f32,
    motion_bucket_id: u8,
}

impl MotionParams {
    pub const DEFAULT_CFG_SCALE: f32 = 5.0;
    pub const DEFAULT_MOTION_BUCKET_ID: u32 = 50;

    /// `cfg_scale` in [1, 10]: lower lets the clip drift from the source
    /// image, higher sticks to it. `motion_bucket_id` in [1, 255]: lower means
    /// less motion.
    pub fn new(cfg_scale: f32, motion_bucket_id: u32) -> Result<Self, ParamsError> {
        if !(1.0..=10.0).contains(&cfg_scale) {
            return Err(ParamsError::CfgScale(cfg_scale));
        }
        if !(1..=255).contains(&motion_bucket_id) {
            return Err(ParamsError::MotionBucket(motion_bucket_id));
        }
        Ok(MotionParams {
            cfg_scale,
            motion_bucket_id: motion_bucket_id as u8,
        })
    }

    pub fn cfg_scale(&self) -> f32 {
        self.cfg_scale
    }

    pub fn motion_bucket_id(&self) -> u8 {
        self.motion_bucket_id
    }
}

impl Default for MotionParams {
    fn default() -> Self {
        MotionParams {
            cfg_scale: Self::DEFAULT_CFG_SCALE,
            motion_bucket_id: Self::DEFAULT_MOTION_BUCKET_ID as u8,
        }
    }
}

/// How long to wait on an asynchronous job before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        PollPolicy {
            max_attempts,
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::new(6, Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Complete,
    Failed,
}

/// A submitted remote video job. Owned by the poll loop until it reaches a
/// terminal status, then dropped.
#[derive(Debug)]
pub struct GenerationJob {
    pub job_id: String,
    pub submitted_at: Instant,
    pub status: JobStatus,
}

impl GenerationJob {
    pub fn submitted(job_id: impl Into<String>) -> Self {
        GenerationJob {
            job_id: job_id.into(),
            submitted_at: Instant::now(),
            status: JobStatus::Pending,
        }
    }
}

/// What one status check of a pending job returned.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Ready(Vec<u8>),
    InProgress,
}

/// Generated bytes bound to the file they are written to.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Artifact {
            path: path.into(),
            bytes,
        }
    }

    /// Write the bytes next to the destination first and rename into place,
    /// so a reader never sees a half-written file.
    pub async fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = self.path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, &self.bytes).await?;
        tokio::fs::rename(&partial, &self.path).await
    }
}

/// The files one chapter produced.
#[derive(Debug, Clone, Serialize)]
pub struct ChapterClip {
    pub image: PathBuf,
    pub video: PathBuf,
}

/// Per-chapter result as exposed by reports and the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChapterReport {
    pub chapter_index: usize,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub clip: Option<ChapterClip>,
    pub error: Option<String>,
}

impl ChapterReport {
    pub fn succeeded(&self) -> bool {
        self.clip.is_some()
    }
}

/// Outcome of running one whole book.
#[derive(Debug, Clone, Serialize)]
pub struct BookReport {
    pub book_name: String,
    pub chapters: Vec<ChapterReport>,
    pub merged_video: Option<PathBuf>,
    pub merge_error: Option<String>,
}

impl BookReport {
    pub fn failures(&self) -> usize {
        self.chapters.iter().filter(|c| !c.succeeded()).count()
    }

    pub fn clips(&self) -> usize {
        self.chapters.iter().filter(|c| c.succeeded()).count()
    }
}

/// Lifecycle of a book job started from the web front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Extracting,
    Rendering,
    Merging,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub book_name: String,
    pub state: RunState,
    pub chapters_total: usize,
    pub chapters: Vec<ChapterReport>,
    pub messages: Vec<String>,
    pub video_url: Option<String>,
    /// Set once the run reaches `Done` or `Failed`.
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl JobRecord {
    pub fn new(id: impl Into<String>, book_name: impl Into<String>) -> Self {
        JobRecord {
            id: id.into(),
            book_name: book_name.into(),
            state: RunState::Queued,
            chapters_total: 0,
            chapters: Vec::new(),
            messages: Vec::new(),
            video_url: None,
            finished_at: None,
        }
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Instant::now());
    }

    /// Finished more than `ttl` before `now`. Running jobs never expire.
    pub fn expired(&self, now: Instant, ttl: Duration) -> bool {
        self.finished_at
            .is_some_and(|done| now.saturating_duration_since(done) > ttl)
    }
}
