use crate::core::duplicate::{ClusterPolicy, DEFAULT_SIMILARITY_THRESHOLD};
use crate::core::merge::{ConflictPolicy, DuplicateAction, MergeOptions, TransferMode};
use crate::core::scanner::{CancelPolicy, IgnoreRules, ScanMode, ScanOptions};
use crate::core::scoring::{ScoringService, SelectionRule, DEFAULT_RULES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "dedupr";
const SETTINGS_FILE: &str = "settings.json";
const JOURNAL_FILE: &str = "history.jsonl";
pub const MAX_MOVE_TARGETS: usize = 10;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No configuration directory on this platform")]
    NoConfigDir,
}

/// Operator settings persisted between runs. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scan_mode: ScanMode,
    pub threshold: u32,
    pub workers: usize,
    pub ignore_extensions: Vec<String>,
    pub ignore_folders: Vec<String>,
    pub ignore_prefixes: Vec<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub cluster_policy: ClusterPolicy,
    pub cancel_policy: CancelPolicy,
    pub quarantine_dir: PathBuf,
    pub conflict_policy: ConflictPolicy,
    pub transfer_mode: TransferMode,
    pub duplicate_action: DuplicateAction,
    /// Smart Select keeper preference, most significant first
    pub selection_rules: Vec<SelectionRule>,
    /// Most recent first
    pub move_targets: Vec<PathBuf>,
    pub last_scan_root: Option<PathBuf>,
    pub last_merge_master: Option<PathBuf>,
    pub last_merge_incoming: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::Exact,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            workers: num_cpus::get(),
            ignore_extensions: Vec::new(),
            ignore_folders: Vec::new(),
            ignore_prefixes: Vec::new(),
            ignore_patterns: Vec::new(),
            cluster_policy: ClusterPolicy::default(),
            cancel_policy: CancelPolicy::default(),
            quarantine_dir: default_quarantine_dir(),
            conflict_policy: ConflictPolicy::default(),
            transfer_mode: TransferMode::default(),
            duplicate_action: DuplicateAction::default(),
            selection_rules: DEFAULT_RULES.to_vec(),
            move_targets: Vec::new(),
            last_scan_root: None,
            last_merge_master: None,
            last_merge_incoming: None,
        }
    }
}

fn default_quarantine_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("quarantine")
}

impl Settings {
    /// `<config dir>/dedupr/settings.json`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                log::warn!("{}; using default settings", e);
                Self::default()
            }
        }
    }

    /// A missing file yields defaults; a malformed one is logged and ignored.
    pub fn load_from(path: &Path) -> Self {
        match Self::try_load_from(path) {
            Ok(Some(settings)) => settings,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn try_load_from(path: &Path) -> Result<Option<Self>, SettingsError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        let path = Self::default_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::debug!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Put `target` at the front of the remembered move targets.
    pub fn remember_move_target(&mut self, target: &Path) {
        self.move_targets.retain(|existing| existing != target);
        self.move_targets.insert(0, target.to_path_buf());
        self.move_targets.truncate(MAX_MOVE_TARGETS);
    }

    /// Undo journal, kept beside the quarantine directory.
    pub fn journal_path(&self) -> PathBuf {
        match self.quarantine_dir.parent() {
            Some(parent) => parent.join(JOURNAL_FILE),
            None => self.quarantine_dir.join(JOURNAL_FILE),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            mode: self.scan_mode,
            ignore: IgnoreRules {
                extensions: self.ignore_extensions.clone(),
                path_prefixes: self.ignore_prefixes.clone(),
                folder_names: self.ignore_folders.clone(),
                patterns: self.ignore_patterns.clone(),
            },
            threshold: self.threshold,
            workers: self.workers.max(1),
            cluster_policy: self.cluster_policy,
            cancel_policy: self.cancel_policy,
            quarantine_dir: Some(self.quarantine_dir.clone()),
        }
    }

    pub fn scoring(&self) -> ScoringService {
        ScoringService::with_rules(self.selection_rules.clone())
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            conflict_policy: self.conflict_policy,
            transfer_mode: self.transfer_mode,
            duplicate_action: self.duplicate_action,
            quarantine_dir: Some(self.quarantine_dir.clone()),
        }
    }
}
