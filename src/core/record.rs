use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff", "tif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    /// Classify a path by its extension (case-insensitive).
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return MediaKind::Other,
        };

        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }

    pub fn is_media(self) -> bool {
        !matches!(self, MediaKind::Other)
    }
}

/// Lowercase hex SHA-256 of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExactDigest(pub String);

impl ExactDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One 64-bit perceptual hash per sampled frame. Images carry a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerceptualDigest {
    pub frames: Vec<u64>,
}

impl PerceptualDigest {
    pub fn single(hash: u64) -> Self {
        Self { frames: vec![hash] }
    }

    /// Summed Hamming distance across frames, `None` when frame counts differ.
    pub fn distance(&self, other: &PerceptualDigest) -> Option<u32> {
        if self.frames.len() != other.frames.len() || self.frames.is_empty() {
            return None;
        }

        Some(
            self.frames
                .iter()
                .zip(&other.frames)
                .map(|(a, b)| hamming_distance(*a, *b))
                .sum(),
        )
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Fingerprinted,
    Unfingerprintable,
    Removed,
    Moved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub exact_digest: Option<ExactDigest>,
    pub perceptual_digest: Option<PerceptualDigest>,
    pub media_kind: MediaKind,
    pub status: RecordStatus,
}

impl FileRecord {
    /// A record for a file that could not be read at all.
    pub fn unfingerprintable(path: &Path, media_kind: MediaKind) -> Self {
        Self {
            path: path.to_path_buf(),
            size: 0,
            modified: DateTime::<Utc>::from(std::time::UNIX_EPOCH),
            exact_digest: None,
            perceptual_digest: None,
            media_kind,
            status: RecordStatus::Unfingerprintable,
        }
    }

    pub fn is_groupable(&self) -> bool {
        self.status == RecordStatus::Fingerprinted && self.exact_digest.is_some()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}
