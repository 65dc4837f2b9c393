pub mod duplicate;
pub mod fingerprint;
pub mod hash;
pub mod history;
pub mod merge;
pub mod perceptual;
pub mod record;
pub mod scanner;
pub mod scoring;
pub mod video;
