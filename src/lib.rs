//! Duplicate and near-duplicate file detection with reversible cleanup.
//!
//! The [`commands::Engine`] is the entry point: it scans a tree, groups exact
//! and visually similar files, suggests keepers, merges folders, and routes
//! every move or delete through an undoable operation log.

pub mod commands;
pub mod config;
pub mod core;

pub use commands::{Engine, EngineError, ScanSummary};
pub use config::Settings;
