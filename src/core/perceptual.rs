use crate::core::fingerprint::FingerprintError;
use crate::core::record::{MediaKind, PerceptualDigest};
use crate::core::video::{FfmpegFrameExtractor, FrameExtractor};
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use std::path::Path;
use std::sync::Arc;

/// Relative positions in a video's duration that are sampled for hashing.
pub const VIDEO_SAMPLE_POSITIONS: [f64; 3] = [0.1, 0.5, 0.9];

const HASH_WIDTH: u32 = 8;
const HASH_HEIGHT: u32 = 8;

/// DCT-based perceptual hashing for images and sampled video frames
pub struct PerceptualService {
    frame_extractor: Arc<dyn FrameExtractor>,
}

impl PerceptualService {
    pub fn new() -> Self {
        Self {
            frame_extractor: Arc::new(FfmpegFrameExtractor::new()),
        }
    }

    pub fn with_frame_extractor(frame_extractor: Arc<dyn FrameExtractor>) -> Self {
        Self { frame_extractor }
    }

    pub fn compute_perceptual_hash(
        &self,
        path: &Path,
        media_kind: MediaKind,
    ) -> Result<PerceptualDigest, FingerprintError> {
        match media_kind {
            MediaKind::Image => {
                let image = decode_image(path)?;
                Ok(PerceptualDigest::single(self.hash_image(&image)))
            }
            MediaKind::Video => {
                let frames = self
                    .frame_extractor
                    .extract_frames(path, &VIDEO_SAMPLE_POSITIONS)?;
                if frames.len() != VIDEO_SAMPLE_POSITIONS.len() {
                    return Err(FingerprintError::FrameExtraction {
                        path: path.to_path_buf(),
                        message: format!(
                            "expected {} frames, got {}",
                            VIDEO_SAMPLE_POSITIONS.len(),
                            frames.len()
                        ),
                    });
                }

                let hashes = frames.iter().map(|frame| self.hash_image(frame)).collect();
                Ok(PerceptualDigest { frames: hashes })
            }
            MediaKind::Other => Err(FingerprintError::Unsupported {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Hash one decoded frame into 64 bits.
    pub fn hash_image(&self, image: &DynamicImage) -> u64 {
        let hash = build_hasher().hash_image(image);
        hash.as_bytes()
            .iter()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, byte)| acc | (u64::from(*byte) << (8 * i)))
    }
}

impl Default for PerceptualService {
    fn default() -> Self {
        Self::new()
    }
}

// Median over the low-frequency DCT block, the classic pHash construction.
fn build_hasher() -> Hasher {
    HasherConfig::new()
        .hash_size(HASH_WIDTH, HASH_HEIGHT)
        .hash_alg(HashAlg::Median)
        .preproc_dct()
        .to_hasher()
}

fn decode_image(path: &Path) -> Result<DynamicImage, FingerprintError> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;

    reader.decode().map_err(|e| FingerprintError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{imageops::FilterType, Rgb, RgbImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Smooth scene: warm radial blob on a diagonal gradient.
    fn scene(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let fx = x as f32 / width as f32;
            let fy = y as f32 / height as f32;
            let dx = fx - 0.35;
            let dy = fy - 0.4;
            let blob = (1.0 - (dx * dx + dy * dy).sqrt() * 2.5).max(0.0);
            let base = (fx + fy) * 0.5;
            let r = ((base * 0.4 + blob * 0.6) * 255.0) as u8;
            let g = ((base * 0.7) * 255.0) as u8;
            let b = (((1.0 - base) * 0.8) * 255.0) as u8;
            Rgb([r, g, b])
        })
    }

    fn stripes(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if ((x + 2 * y) / 40) % 2 == 0 {
                Rgb([240, 240, 240])
            } else {
                Rgb([15, 15, 15])
            }
        })
    }

    struct StaticFrames(Vec<DynamicImage>);

    impl FrameExtractor for StaticFrames {
        fn extract_frames(
            &self,
            _path: &Path,
            positions: &[f64],
        ) -> Result<Vec<DynamicImage>, FingerprintError> {
            Ok(self.0.iter().take(positions.len()).cloned().collect())
        }
    }

    #[test]
    fn test_identical_images_same_hash() {
        let temp_dir = TempDir::new().unwrap();
        let path_a = temp_dir.path().join("a.png");
        let path_b = temp_dir.path().join("b.png");
        scene(128, 128).save(&path_a).unwrap();
        scene(128, 128).save(&path_b).unwrap();

        let service = PerceptualService::new();
        let a = service.compute_perceptual_hash(&path_a, MediaKind::Image).unwrap();
        let b = service.compute_perceptual_hash(&path_b, MediaKind::Image).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.frame_count(), 1);
    }

    #[test]
    fn test_resized_image_within_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let original = temp_dir.path().join("original.png");
        let resized = temp_dir.path().join("resized.png");

        let image = scene(256, 256);
        image.save(&original).unwrap();
        image::imageops::resize(&image, 128, 128, FilterType::Lanczos3)
            .save(&resized)
            .unwrap();

        let service = PerceptualService::new();
        let a = service.compute_perceptual_hash(&original, MediaKind::Image).unwrap();
        let b = service.compute_perceptual_hash(&resized, MediaKind::Image).unwrap();
        let distance = a.distance(&b).unwrap();
        assert!(distance <= 10, "resize moved the hash by {distance} bits");
    }

    #[test]
    fn test_unrelated_images_far_apart() {
        let temp_dir = TempDir::new().unwrap();
        let path_a = temp_dir.path().join("scene.png");
        let path_b = temp_dir.path().join("stripes.png");
        scene(256, 256).save(&path_a).unwrap();
        stripes(256, 256).save(&path_b).unwrap();

        let service = PerceptualService::new();
        let a = service.compute_perceptual_hash(&path_a, MediaKind::Image).unwrap();
        let b = service.compute_perceptual_hash(&path_b, MediaKind::Image).unwrap();
        assert!(a.distance(&b).unwrap() > 10);
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.jpg");
        std::fs::write(&path, b"this is not a jpeg").unwrap();

        let result = PerceptualService::new().compute_perceptual_hash(&path, MediaKind::Image);
        assert!(matches!(result, Err(FingerprintError::Decode { .. })));
    }

    #[test]
    fn test_missing_image_is_io_error() {
        let result = PerceptualService::new()
            .compute_perceptual_hash(&PathBuf::from("/nonexistent/a.png"), MediaKind::Image);
        assert!(matches!(result, Err(FingerprintError::Io(_))));
    }

    #[test]
    fn test_video_digest_uses_every_sampled_frame() {
        let frames = vec![
            DynamicImage::ImageRgb8(scene(64, 64)),
            DynamicImage::ImageRgb8(stripes(64, 64)),
            DynamicImage::ImageRgb8(scene(64, 64)),
        ];
        let service = PerceptualService::with_frame_extractor(Arc::new(StaticFrames(frames)));

        let digest = service
            .compute_perceptual_hash(Path::new("clip.mp4"), MediaKind::Video)
            .unwrap();
        assert_eq!(digest.frame_count(), 3);
        assert_eq!(digest.frames[0], digest.frames[2]);
    }

    #[test]
    fn test_short_video_rejected() {
        let frames = vec![DynamicImage::ImageRgb8(scene(64, 64))];
        let service = PerceptualService::with_frame_extractor(Arc::new(StaticFrames(frames)));

        let result = service.compute_perceptual_hash(Path::new("clip.mp4"), MediaKind::Video);
        assert!(matches!(result, Err(FingerprintError::FrameExtraction { .. })));
    }

    #[test]
    fn test_other_kind_unsupported() {
        let result = PerceptualService::new()
            .compute_perceptual_hash(Path::new("notes.txt"), MediaKind::Other);
        assert!(matches!(result, Err(FingerprintError::Unsupported { .. })));
    }
}
