use crate::core::fingerprint::FingerprintError;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Source of decoded still frames for a video file.
///
/// Frame decoding is an external capability; the engine only needs a few
/// representative frames at relative positions (0.0..=1.0) of the duration.
pub trait FrameExtractor: Send + Sync {
    fn extract_frames(
        &self,
        path: &Path,
        positions: &[f64],
    ) -> Result<Vec<DynamicImage>, FingerprintError>;
}

/// Extracts frames by running `ffprobe` and `ffmpeg` from `PATH`.
pub struct FfmpegFrameExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    fn duration_secs(&self, path: &Path) -> Result<f64, FingerprintError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .map_err(|e| extraction_error(path, format!("ffprobe unavailable: {}", e)))?;

        if !output.status.success() {
            return Err(extraction_error(
                path,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let duration: f64 = text
            .trim()
            .parse()
            .map_err(|_| extraction_error(path, format!("unreadable duration {:?}", text.trim())))?;

        if duration.is_finite() && duration > 0.0 {
            Ok(duration)
        } else {
            Err(extraction_error(path, "video has no duration".to_string()))
        }
    }

    fn frame_at(&self, path: &Path, seconds: f64) -> Result<DynamicImage, FingerprintError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-ss", &format!("{:.3}", seconds), "-i"])
            .arg(path)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
            .output()
            .map_err(|e| extraction_error(path, format!("ffmpeg unavailable: {}", e)))?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(extraction_error(
                path,
                format!("no frame at {:.3}s", seconds),
            ));
        }

        image::load_from_memory(&output.stdout).map_err(|e| FingerprintError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl Default for FfmpegFrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract_frames(
        &self,
        path: &Path,
        positions: &[f64],
    ) -> Result<Vec<DynamicImage>, FingerprintError> {
        let duration = self.duration_secs(path)?;
        positions
            .iter()
            .map(|position| self.frame_at(path, duration * position.clamp(0.0, 1.0)))
            .collect()
    }
}

fn extraction_error(path: &Path, message: String) -> FingerprintError {
    FingerprintError::FrameExtraction {
        path: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binaries_report_extraction_error() {
        let extractor = FfmpegFrameExtractor::with_binaries(
            PathBuf::from("/nonexistent/ffmpeg"),
            PathBuf::from("/nonexistent/ffprobe"),
        );

        let result = extractor.extract_frames(Path::new("clip.mp4"), &[0.5]);
        assert!(matches!(result, Err(FingerprintError::FrameExtraction { .. })));
    }
}
