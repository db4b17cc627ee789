use crate::error::MergeError;
use crate::utils::chapter_index_from_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipEntry {
    pub chapter_index: usize,
    pub path: PathBuf,
}

/// Chapter clips in the order they are concatenated, always sorted by
/// chapter index.
#[derive(Debug, Clone, Default)]
pub struct ClipManifest {
    entries: Vec<ClipEntry>,
}

impl ClipManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a clip, replacing any earlier clip for the same chapter.
    pub fn push(&mut self, chapter_index: usize, path: impl Into<PathBuf>) {
        let entry = ClipEntry {
            chapter_index,
            path: path.into(),
        };
        match self
            .entries
            .binary_search_by_key(&chapter_index, |e| e.chapter_index)
        {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Build a manifest from clip files named `<book>_chapter_<n>.mp4`.
    /// Files without a chapter number are skipped.
    pub fn from_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut manifest = Self::new();
        for path in paths {
            match chapter_index_from_path(&path) {
                Some(index) => manifest.push(index, path),
                None => warn!("Skipping clip without chapter number: {}", path.display()),
            }
        }
        manifest
    }

    /// Collect the `.mp4` clips already on disk in `videos_dir`.
    pub async fn scan_dir(videos_dir: &Path) -> std::io::Result<Self> {
        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(videos_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_clip = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
            if is_clip && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        Ok(Self::from_paths(paths))
    }

    pub fn entries(&self) -> &[ClipEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Contents of an ffmpeg concat demuxer list, one `file '<path>'` line
    /// per clip.
    pub fn concat_list(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                let path = e.path.to_string_lossy().replace('\'', r"'\''");
                format!("file '{}'\n", path)
            })
            .collect()
    }
}

#[async_trait]
pub trait ClipMerger: Send + Sync {
    /// Concatenate the manifest's clips into `output` and return its path.
    async fn merge(&self, manifest: &ClipManifest, output: &Path) -> Result<PathBuf, MergeError>;
}

/// Lossless concatenation through ffmpeg's concat demuxer.
pub struct FfmpegMerger {
    binary: PathBuf,
}

impl FfmpegMerger {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        FfmpegMerger {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ClipMerger for FfmpegMerger {
    async fn merge(&self, manifest: &ClipManifest, output: &Path) -> Result<PathBuf, MergeError> {
        if manifest.is_empty() {
            return Err(MergeError::Empty);
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // the list file is resolved relative to itself, so hand ffmpeg absolute paths
        let mut absolute = ClipManifest::new();
        for entry in manifest.entries() {
            absolute.push(
                entry.chapter_index,
                tokio::fs::canonicalize(&entry.path).await?,
            );
        }

        let list_path = output.with_extension("concat.txt");
        tokio::fs::write(&list_path, absolute.concat_list()).await?;

        info!(
            "Merging {} clips into {} with {}",
            absolute.len(),
            output.display(),
            self.binary.display()
        );

        let result = Command::new(&self.binary)
            .arg("-y")
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output)
            .output()
            .await;

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            warn!("Failed to remove concat list {}: {}", list_path.display(), e);
        }

        let out = result?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(MergeError::Ffmpeg {
                status: out.status.to_string(),
                stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }

        info!("Merged video written to {}", output.display());
        Ok(output.to_path_buf())
    }
}
