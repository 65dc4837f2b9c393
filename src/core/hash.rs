use crate::core::record::ExactDigest;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streams whole files through SHA-256 for exact duplicate detection
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    /// Compute the SHA-256 digest over the complete file content
    pub fn compute_content_hash(&self, file_path: &Path) -> Result<ExactDigest, HashError> {
        let file = File::open(file_path)?;
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        let result = hasher.finalize();
        Ok(ExactDigest(format!("{:x}", result)))
    }

    /// Compute content hashes for multiple files in parallel
    pub fn compute_content_hashes_batch<'a>(
        &self,
        file_paths: &[&'a Path],
    ) -> Vec<(&'a Path, Result<ExactDigest, HashError>)> {
        use rayon::prelude::*;

        file_paths
            .par_iter()
            .map(|path| (*path, self.compute_content_hash(path)))
            .collect()
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}
