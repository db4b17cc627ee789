use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CHAPTER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_chapter_(\d+)$").expect("static regex"));

/// Decode UTF-8, skipping a leading byte order mark if present.
pub fn decode_utf8(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Reduce an uploaded file name to a stem that is safe as a directory and
/// file name prefix.
pub fn book_stem(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_name);
    let stem = match base.len().checked_sub(".epub".len()) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".epub") => {
            &base[..cut]
        }
        _ => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "book".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn chapter_name(book: &str, index: usize) -> String {
    format!("{}_chapter_{}", book, index)
}

/// Chapter number encoded in a clip file name such as `book_chapter_10.mp4`.
pub fn chapter_index_from_path(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    CHAPTER_NUMBER.captures(stem)?.get(1)?.as_str().parse().ok()
}

/// Cut `text` to at most `max_chars` characters, preferring a word boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => cut[..pos].trim_end().to_string(),
        _ => cut,
    }
}

/// Per-book output directories.
#[derive(Debug, Clone)]
pub struct BookLayout {
    pub book: String,
    pub images: PathBuf,
    pub videos: PathBuf,
    pub merged: PathBuf,
}

impl BookLayout {
    pub fn new(output_root: &Path, book: &str) -> Self {
        let root = output_root.join(book);
        BookLayout {
            book: book.to_string(),
            images: root.join("Images"),
            videos: root.join("Videos"),
            merged: root.join("Merged_videos"),
        }
    }

    pub async fn create(&self) -> std::io::Result<()> {
        for dir in [&self.images, &self.videos, &self.merged] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn image_path(&self, index: usize) -> PathBuf {
        self.images
            .join(format!("{}.png", chapter_name(&self.book, index)))
    }

    pub fn video_path(&self, index: usize) -> PathBuf {
        self.videos
            .join(format!("{}.mp4", chapter_name(&self.book, index)))
    }

    pub fn final_video_path(&self) -> PathBuf {
        self.merged.join(format!("{}_final_video.mp4", self.book))
    }
}
