use crate::core::duplicate::{
    ClusterPolicy, DuplicateDetector, DuplicateGroup, DEFAULT_SIMILARITY_THRESHOLD,
};
use crate::core::fingerprint::{Fingerprint, FingerprintError, FingerprintService};
use crate::core::perceptual::PerceptualService;
use crate::core::record::{FileRecord, MediaKind};
use crate::core::video::FrameExtractor;
use glob::Pattern;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid scan root: {}", .path.display())]
    InvalidRoot { path: PathBuf },

    #[error("Invalid ignore pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Cannot build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Exact digest only
    #[default]
    Exact,
    /// Exact digest plus perceptual digest for images and videos
    Visual,
}

/// What happens to files already being fingerprinted when a scan is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Finish in-flight files and keep their records
    #[default]
    Drain,
    /// Finish in-flight files but discard their records
    Abandon,
}

/// Operator-facing ignore rules, applied before any fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreRules {
    /// Extensions, with or without a leading dot, case-insensitive
    pub extensions: Vec<String>,
    /// Absolute prefixes, or prefixes relative to the scan root
    pub path_prefixes: Vec<PathBuf>,
    /// Directory names pruned anywhere in the tree, case-insensitive
    pub folder_names: Vec<String>,
    /// Glob patterns matched against the full path
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub ignore: IgnoreRules,
    pub threshold: u32,
    pub workers: usize,
    pub cluster_policy: ClusterPolicy,
    pub cancel_policy: CancelPolicy,
    /// Always skipped when it lies inside the scan root
    pub quarantine_dir: Option<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Exact,
            ignore: IgnoreRules::default(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            workers: num_cpus::get(),
            cluster_policy: ClusterPolicy::default(),
            cancel_policy: CancelPolicy::default(),
            quarantine_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub files_processed: usize,
    pub total_discovered: usize,
    pub current_file: String,
    pub phase: ScanPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanPhase {
    Fingerprinting,
    Grouping,
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    /// File could not be read; excluded from grouping
    Io,
    /// Media could not be decoded; exact digest still used
    Fingerprint,
    /// Directory entry could not be listed
    Traversal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: WarningKind,
    pub message: String,
}

impl ScanWarning {
    fn from_fingerprint(path: &Path, error: &FingerprintError) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: if error.is_io() {
                WarningKind::Io
            } else {
                WarningKind::Fingerprint
            },
            message: error.to_string(),
        }
    }
}

/// Everything a finished (or cancelled) scan produced.
pub struct ScanOutcome {
    pub groups: Vec<DuplicateGroup>,
    /// Every fingerprinted file, including unfingerprintable ones, sorted by path
    pub records: Vec<FileRecord>,
    pub warnings: Vec<ScanWarning>,
    pub discovered: usize,
    pub processed: usize,
    pub cancelled: bool,
    detector: DuplicateDetector,
}

impl ScanOutcome {
    /// Grouper state, kept for Find Similar queries after the scan.
    pub fn detector(&self) -> &DuplicateDetector {
        &self.detector
    }

    pub fn record(&self, path: &Path) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.path == path)
    }
}

/// State for one scan, shared by reference with the workers.
struct ScanSession {
    detector: Mutex<DuplicateDetector>,
    records: Mutex<Vec<FileRecord>>,
    warnings: Mutex<Vec<ScanWarning>>,
    discovered: AtomicUsize,
    processed: AtomicUsize,
}

impl ScanSession {
    fn new(detector: DuplicateDetector) -> Self {
        Self {
            detector: Mutex::new(detector),
            records: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            discovered: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
        }
    }

    fn ingest(&self, record: FileRecord) {
        lock(&self.detector).ingest(record.clone());
        lock(&self.records).push(record);
    }

    fn warn(&self, warning: ScanWarning) {
        lock(&self.warnings).push(warning);
    }

    fn into_outcome(self, cancelled: bool) -> ScanOutcome {
        let detector = into_inner(self.detector);
        let groups = detector.finalize();
        let mut records = into_inner(self.records);
        records.sort_by(|a, b| a.path.cmp(&b.path));
        let mut warnings = into_inner(self.warnings);
        warnings.sort_by(|a, b| a.path.cmp(&b.path));

        ScanOutcome {
            groups,
            records,
            warnings,
            discovered: self.discovered.into_inner(),
            processed: self.processed.into_inner(),
            cancelled,
            detector,
        }
    }
}

// A worker panicking mid-insert cannot leave a partial record behind, so a
// poisoned lock still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn into_inner<T>(mutex: Mutex<T>) -> T {
    mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ignore rules resolved against a scan root.
struct IgnoreMatcher {
    extensions: HashSet<String>,
    prefixes: Vec<PathBuf>,
    folder_names: HashSet<String>,
    patterns: Vec<Pattern>,
    quarantine: Option<PathBuf>,
}

impl IgnoreMatcher {
    fn compile(rules: &IgnoreRules, root: &Path, quarantine: Option<&Path>) -> Result<Self, ScanError> {
        let patterns = rules
            .patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|e| ScanError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            extensions: rules
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            prefixes: rules
                .path_prefixes
                .iter()
                .map(|prefix| {
                    if prefix.is_absolute() {
                        prefix.clone()
                    } else {
                        root.join(prefix)
                    }
                })
                .collect(),
            folder_names: rules.folder_names.iter().map(|name| name.to_lowercase()).collect(),
            patterns,
            quarantine: quarantine.and_then(|q| quarantine_under_root(root, q)),
        })
    }

    fn skips_dir(&self, path: &Path) -> bool {
        if self.quarantine.as_deref() == Some(path) {
            return true;
        }
        let named = path
            .file_name()
            .map(|name| self.folder_names.contains(&name.to_string_lossy().to_lowercase()))
            .unwrap_or(false);
        named || self.matches_prefix_or_pattern(path)
    }

    fn skips_file(&self, path: &Path) -> bool {
        let ignored_ext = path
            .extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false);
        ignored_ext || self.matches_prefix_or_pattern(path)
    }

    fn matches_prefix_or_pattern(&self, path: &Path) -> bool {
        if self.prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            return true;
        }
        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|pattern| pattern.matches(&path_str))
    }
}

/// The quarantine directory expressed under `root` as walkdir will report it,
/// or `None` when it lies elsewhere.
pub(crate) fn quarantine_under_root(root: &Path, quarantine: &Path) -> Option<PathBuf> {
    if quarantine.starts_with(root) {
        return Some(quarantine.to_path_buf());
    }
    let canonical_root = fs::canonicalize(root).ok()?;
    let canonical_quarantine = fs::canonicalize(quarantine).ok()?;
    canonical_quarantine
        .strip_prefix(&canonical_root)
        .ok()
        .map(|relative| root.join(relative))
}

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ScannerService {
    progress_sender: Option<mpsc::UnboundedSender<ScanProgress>>,
    cancellation_token: Arc<AtomicBool>,
    pause_token: Arc<AtomicBool>,
    frame_extractor: Option<Arc<dyn FrameExtractor>>,
}

impl ScannerService {
    pub fn new() -> Self {
        Self {
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            pause_token: Arc::new(AtomicBool::new(false)),
            frame_extractor: None,
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    /// While the token is set, workers hold before starting their next file.
    pub fn with_pause_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.pause_token = token;
        self
    }

    pub fn with_frame_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.frame_extractor = Some(extractor);
        self
    }

    pub fn cancel_scan(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn pause_scan(&self) {
        self.pause_token.store(true, Ordering::Relaxed);
    }

    pub fn resume_scan(&self) {
        self.pause_token.store(false, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    // Cancellation also releases paused workers
    fn wait_while_paused(&self) {
        while self.pause_token.load(Ordering::Relaxed) && !self.is_cancelled() {
            thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }

    /// Walk `root`, fingerprint every non-ignored file on a bounded pool and
    /// group the results. Per-file failures become warnings.
    pub fn scan(&self, root: &Path, options: &ScanOptions) -> Result<ScanOutcome, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidRoot {
                path: root.to_path_buf(),
            });
        }

        let matcher = IgnoreMatcher::compile(&options.ignore, root, options.quarantine_dir.as_deref())?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .build()?;
        let fingerprinter = self.fingerprint_service(options.mode);
        let session = ScanSession::new(DuplicateDetector::new(
            options.mode,
            options.threshold,
            options.cluster_policy,
        ));

        log::info!(
            "Scanning {} in {:?} mode with {} workers",
            root.display(),
            options.mode,
            options.workers.max(1)
        );

        pool.install(|| {
            self.discover(root, &matcher, &session)
                .par_bridge()
                .for_each(|path| self.process_file(&path, &fingerprinter, &session, options.cancel_policy));
        });

        let cancelled = self.is_cancelled();
        let discovered = session.discovered.load(Ordering::Relaxed);
        let processed = session.processed.load(Ordering::Relaxed);

        self.send_progress(ScanProgress {
            files_processed: processed,
            total_discovered: discovered,
            current_file: String::new(),
            phase: ScanPhase::Grouping,
        });

        let outcome = session.into_outcome(cancelled);

        if cancelled {
            log::info!("Scan cancelled after {} of {} files", processed, discovered);
        } else {
            log::info!(
                "Scan complete: {} files, {} groups, {} warnings",
                processed,
                outcome.groups.len(),
                outcome.warnings.len()
            );
        }

        self.send_progress(ScanProgress {
            files_processed: processed,
            total_discovered: discovered,
            current_file: String::new(),
            phase: if cancelled {
                ScanPhase::Cancelled
            } else {
                ScanPhase::Complete
            },
        });

        Ok(outcome)
    }

    /// Sorted, pruned traversal. Stops yielding once cancellation is requested.
    fn discover<'a>(
        &'a self,
        root: &Path,
        matcher: &'a IgnoreMatcher,
        session: &'a ScanSession,
    ) -> impl Iterator<Item = PathBuf> + Send + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !is_ignored_dir(entry, matcher))
            .filter_map(move |entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    log::warn!("Cannot read {}: {}", path.display(), e);
                    session.warn(ScanWarning {
                        path,
                        kind: WarningKind::Traversal,
                        message: e.to_string(),
                    });
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(move |entry| {
                let skip = matcher.skips_file(entry.path());
                if skip {
                    log::debug!("Ignoring {}", entry.path().display());
                }
                !skip
            })
            .take_while(move |_| !self.is_cancelled())
            .map(move |entry| {
                session.discovered.fetch_add(1, Ordering::Relaxed);
                entry.into_path()
            })
    }

    fn process_file(
        &self,
        path: &Path,
        fingerprinter: &FingerprintService,
        session: &ScanSession,
        cancel_policy: CancelPolicy,
    ) {
        self.wait_while_paused();
        if self.is_cancelled() {
            log::debug!("Not starting {} after cancellation", path.display());
            return;
        }

        let Fingerprint { record, warning } = fingerprinter.fingerprint(path, MediaKind::from_path(path));

        if cancel_policy == CancelPolicy::Abandon && self.is_cancelled() {
            log::debug!("Discarding in-flight result for {}", path.display());
            return;
        }

        if let Some(error) = warning {
            session.warn(ScanWarning::from_fingerprint(path, &error));
        }
        session.ingest(record);

        let files_processed = session.processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.send_progress(ScanProgress {
            files_processed,
            total_discovered: session.discovered.load(Ordering::Relaxed),
            current_file: path.to_string_lossy().to_string(),
            phase: ScanPhase::Fingerprinting,
        });
    }

    fn fingerprint_service(&self, mode: ScanMode) -> FingerprintService {
        match &self.frame_extractor {
            Some(extractor) => FingerprintService::with_perceptual_service(
                mode,
                PerceptualService::with_frame_extractor(extractor.clone()),
            ),
            None => FingerprintService::new(mode),
        }
    }

    fn send_progress(&self, progress: ScanProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}

impl Default for ScannerService {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ignored_dir(entry: &DirEntry, matcher: &IgnoreMatcher) -> bool {
    entry.depth() > 0 && entry.file_type().is_dir() && {
        let skip = matcher.skips_dir(entry.path());
        if skip {
            log::debug!("Pruning {}", entry.path().display());
        }
        skip
    }
}
