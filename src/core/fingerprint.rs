use crate::core::hash::{HashError, HashService};
use crate::core::perceptual::PerceptualService;
use crate::core::record::{FileRecord, MediaKind, RecordStatus};
use crate::core::scanner::ScanMode;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Frame extraction failed for {}: {message}", .path.display())]
    FrameExtraction { path: PathBuf, message: String },

    #[error("No perceptual hash for non-media file {}", .path.display())]
    Unsupported { path: PathBuf },
}

impl From<HashError> for FingerprintError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Io(e) => FingerprintError::Io(e),
        }
    }
}

impl FingerprintError {
    /// True when the file itself could not be read, as opposed to its media content.
    pub fn is_io(&self) -> bool {
        matches!(self, FingerprintError::Io(_))
    }
}

/// Result of fingerprinting one file: always a record, plus the failure if any.
#[derive(Debug)]
pub struct Fingerprint {
    pub record: FileRecord,
    pub warning: Option<FingerprintError>,
}

/// Computes the digests required by a scan mode for a single file
pub struct FingerprintService {
    hash_service: HashService,
    perceptual_service: PerceptualService,
    perceptual: bool,
}

impl FingerprintService {
    pub fn new(mode: ScanMode) -> Self {
        Self::with_perceptual_service(mode, PerceptualService::new())
    }

    pub fn with_perceptual_service(mode: ScanMode, perceptual_service: PerceptualService) -> Self {
        Self {
            hash_service: HashService::new(),
            perceptual_service,
            perceptual: mode == ScanMode::Visual,
        }
    }

    /// Fingerprint `path`. Read failures yield an unfingerprintable record,
    /// media decode failures keep the exact digest and drop the perceptual one.
    pub fn fingerprint(&self, path: &Path, media_kind: MediaKind) -> Fingerprint {
        let metadata = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return unreadable(
                    path,
                    media_kind,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file").into(),
                    None,
                );
            }
            Err(e) => return unreadable(path, media_kind, e.into(), None),
        };

        let exact_digest = match self.hash_service.compute_content_hash(path) {
            Ok(digest) => digest,
            Err(e) => return unreadable(path, media_kind, e.into(), Some(&metadata)),
        };

        let mut record = FileRecord {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: modified_at(&metadata),
            exact_digest: Some(exact_digest),
            perceptual_digest: None,
            media_kind,
            status: RecordStatus::Fingerprinted,
        };

        let mut warning = None;
        if self.perceptual && media_kind.is_media() {
            match self
                .perceptual_service
                .compute_perceptual_hash(path, media_kind)
            {
                Ok(digest) => record.perceptual_digest = Some(digest),
                Err(e) => {
                    log::warn!("Perceptual hash failed for {}: {}", path.display(), e);
                    warning = Some(e);
                }
            }
        }

        Fingerprint { record, warning }
    }
}

fn modified_at(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

/// Content could not be read; size and mtime are kept when the stat worked.
fn unreadable(
    path: &Path,
    media_kind: MediaKind,
    error: FingerprintError,
    metadata: Option<&fs::Metadata>,
) -> Fingerprint {
    log::warn!("Cannot fingerprint {}: {}", path.display(), error);
    let mut record = FileRecord::unfingerprintable(path, media_kind);
    if let Some(metadata) = metadata {
        record.size = metadata.len();
        record.modified = modified_at(metadata);
    }
    Fingerprint {
        record,
        warning: Some(error),
    }
}
