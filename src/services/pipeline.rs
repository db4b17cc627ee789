use crate::config::Config;
use crate::error::{BookBusy, ChapterError, MergeError};
use crate::models::{BookReport, Chapter, ChapterClip, ChapterReport, MotionParams};
use crate::services::epub::EpubExtractor;
use crate::services::image::ImageJobClient;
use crate::services::llm::{LLMClient, Summarizer};
use crate::services::merger::{ClipManifest, ClipMerger, FfmpegMerger};
use crate::services::stability::StabilityClient;
use crate::services::video::VideoJobClient;
use crate::utils::BookLayout;
use anyhow::{Context, bail};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use tracing::{error, info, warn};

/// Milestones of a book run, reported as they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Extracted { chapters: usize },
    ChapterSummarized { index: usize, summary: String },
    ChapterRendered { index: usize, video: PathBuf },
    ChapterFailed { index: usize, error: String },
    Merging { clips: usize },
    Merged { path: PathBuf },
    MergeFailed { error: String },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for () {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Book output directories currently owned by a run in this process.
static ACTIVE_BOOKS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive hold on one book's input file and output tree. Released on drop.
#[derive(Debug)]
pub struct BookClaim {
    book: String,
    layout: BookLayout,
    key: PathBuf,
}

impl BookClaim {
    pub fn book(&self) -> &str {
        &self.book
    }

    pub fn layout(&self) -> &BookLayout {
        &self.layout
    }
}

impl Drop for BookClaim {
    fn drop(&mut self) {
        ACTIVE_BOOKS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Book → chapters → summary → image → clip → merged video.
pub struct Pipeline {
    extractor: EpubExtractor,
    summarizer: Arc<dyn Summarizer>,
    images: ImageJobClient,
    videos: VideoJobClient,
    merger: Arc<dyn ClipMerger>,
    output_root: PathBuf,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        extractor: EpubExtractor,
        summarizer: Arc<dyn Summarizer>,
        images: ImageJobClient,
        videos: VideoJobClient,
        merger: Arc<dyn ClipMerger>,
        output_root: impl Into<PathBuf>,
        concurrency: usize,
    ) -> Self {
        Pipeline {
            extractor,
            summarizer,
            images,
            videos,
            merger,
            output_root: output_root.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Wire the real OpenAI, Stability and ffmpeg collaborators.
    pub fn from_config(config: &Config) -> Self {
        let mut stability = StabilityClient::new(&config.stability_url, &config.stability_api_key);
        if let Some(rpm) = config.stability_rpm {
            stability = stability.with_rate_limit(rpm);
        }
        let stability = Arc::new(stability);

        let summarizer = LLMClient::new(
            &config.openai_url,
            &config.openai_api_key,
            &config.openai_model,
            config.summary_max_chars,
        );

        Pipeline::new(
            EpubExtractor::new(config.min_chapter_chars),
            Arc::new(summarizer),
            ImageJobClient::new(stability.clone(), Some(config.image_size)),
            VideoJobClient::new(stability, config.poll),
            Arc::new(FfmpegMerger::new(&config.ffmpeg)),
            &config.output_dir,
            config.concurrency,
        )
    }

    pub fn layout(&self, book_name: &str) -> BookLayout {
        BookLayout::new(&self.output_root, book_name)
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Reserve `book_name` for one run. Fails while another claim on the same
    /// output directory is alive, even one taken through another `Pipeline`.
    pub fn claim(&self, book_name: &str) -> Result<BookClaim, BookBusy> {
        let root = self.output_root.join(book_name);
        let key = std::path::absolute(&root).unwrap_or(root);
        let mut active = ACTIVE_BOOKS.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(BookBusy(book_name.to_string()));
        }
        Ok(BookClaim {
            book: book_name.to_string(),
            layout: self.layout(book_name),
            key,
        })
    }

    /// Run every stage for one book. Chapter failures are recorded in the
    /// report; only a book that cannot be read at all is an error.
    pub async fn run_book(
        &self,
        claim: &BookClaim,
        epub_path: &Path,
        params: MotionParams,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<BookReport> {
        let book_name = claim.book();
        let extractor = self.extractor.clone();
        let path = epub_path.to_path_buf();
        let chapters = tokio::task::spawn_blocking(move || extractor.extract_path(&path))
            .await
            .context("chapter extraction task failed")?
            .with_context(|| format!("failed to read {}", epub_path.display()))?;

        if chapters.is_empty() {
            bail!("no content chapters found in {}", epub_path.display());
        }
        info!("Extracted {} chapters from {}", chapters.len(), book_name);
        sink.emit(ProgressEvent::Extracted {
            chapters: chapters.len(),
        });

        let layout = claim.layout();
        layout
            .create()
            .await
            .with_context(|| format!("failed to create output directories for {}", book_name))?;

        let reports = self.render_chapters(layout, &chapters, params, sink).await;

        let mut manifest = ClipManifest::new();
        for report in &reports {
            if let Some(clip) = &report.clip {
                manifest.push(report.chapter_index, clip.video.clone());
            }
        }

        let mut book = BookReport {
            book_name: book_name.to_string(),
            chapters: reports,
            merged_video: None,
            merge_error: None,
        };

        if manifest.is_empty() {
            warn!("No chapter of {} produced a clip, nothing to merge", book_name);
            let message = MergeError::Empty.to_string();
            sink.emit(ProgressEvent::MergeFailed {
                error: message.clone(),
            });
            book.merge_error = Some(message);
            return Ok(book);
        }

        sink.emit(ProgressEvent::Merging {
            clips: manifest.len(),
        });
        match self.merger.merge(&manifest, &layout.final_video_path()).await {
            Ok(path) => {
                sink.emit(ProgressEvent::Merged { path: path.clone() });
                book.merged_video = Some(path);
            }
            Err(e) => {
                error!("Merging {} failed: {}", book_name, e);
                sink.emit(ProgressEvent::MergeFailed {
                    error: e.to_string(),
                });
                book.merge_error = Some(e.to_string());
            }
        }

        info!(
            "Finished {}: {} clips, {} failed chapters",
            book_name,
            book.clips(),
            book.failures()
        );
        Ok(book)
    }

    /// Render all chapters, at most `concurrency` at a time. Reports come back
    /// in chapter order regardless of completion order.
    pub async fn render_chapters(
        &self,
        layout: &BookLayout,
        chapters: &[Chapter],
        params: MotionParams,
        sink: &dyn ProgressSink,
    ) -> Vec<ChapterReport> {
        let jobs: Vec<_> = chapters
            .iter()
            .map(|chapter| self.render_chapter(layout, chapter, params, sink))
            .collect();
        let mut reports: Vec<ChapterReport> = stream::iter(jobs)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        reports.sort_by_key(|r| r.chapter_index);
        reports
    }

    async fn render_chapter(
        &self,
        layout: &BookLayout,
        chapter: &Chapter,
        params: MotionParams,
        sink: &dyn ProgressSink,
    ) -> ChapterReport {
        let mut report = ChapterReport {
            chapter_index: chapter.index,
            title: chapter.title.clone(),
            summary: None,
            clip: None,
            error: None,
        };

        let result = async {
            let summary = self.summarizer.summarize(&layout.book, chapter).await?;
            report.summary = Some(summary.clone());
            sink.emit(ProgressEvent::ChapterSummarized {
                index: chapter.index,
                summary: summary.clone(),
            });

            let image_path = layout.image_path(chapter.index);
            let image = self.images.generate_to(&summary, &image_path).await?;

            let video_path = layout.video_path(chapter.index);
            self.videos
                .render_to(image.bytes, params, &video_path)
                .await?;

            Ok::<_, ChapterError>(ChapterClip {
                image: image_path,
                video: video_path,
            })
        }
        .await;

        match result {
            Ok(clip) => {
                info!("Chapter {} rendered to {}", chapter.index, clip.video.display());
                sink.emit(ProgressEvent::ChapterRendered {
                    index: chapter.index,
                    video: clip.video.clone(),
                });
                report.clip = Some(clip);
            }
            Err(e) => {
                warn!("Chapter {} failed: {}", chapter.index, e);
                if matches!(&e, ChapterError::Video(job) if job.is_timeout()) {
                    let policy = self.videos.policy();
                    warn!(
                        "Gave up after {} polls {:?} apart; raise MOVIEFY_POLL_ATTEMPTS to wait longer",
                        policy.max_attempts, policy.interval
                    );
                }
                sink.emit(ProgressEvent::ChapterFailed {
                    index: chapter.index,
                    error: e.to_string(),
                });
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Merge whatever clips a book already has on disk, ordered by the chapter
    /// number in their file names.
    pub async fn remerge(&self, claim: &BookClaim) -> Result<PathBuf, MergeError> {
        let layout = claim.layout();
        let manifest = ClipManifest::scan_dir(&layout.videos).await?;
        self.merger.merge(&manifest, &layout.final_video_path()).await
    }
}
