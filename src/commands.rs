use crate::core::{
    duplicate::{detach_member, DuplicateGroup, SimilarMatch},
    history::{OperationError, OperationLog, PurgeReport, UndoEntry, UndoError},
    merge::{MergeError, MergeOptions, MergePlan, MergeReconciler, MergeReport},
    record::RecordStatus,
    scanner::{ScanError, ScanOptions, ScanOutcome, ScanProgress, ScanWarning, ScannerService},
    scoring::{ScoringService, Selection},
    video::FrameExtractor,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No scan results; run a scan first")]
    NoScan,

    #[error("A scan or merge is already running")]
    Busy,

    #[error("No duplicate group at index {0}")]
    UnknownGroup(usize),

    #[error("{} was not part of the last scan", .path.display())]
    NotScanned { path: PathBuf },

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Undo(#[from] UndoError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Serializable view of a finished scan for the UI or report layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub root: PathBuf,
    pub groups: Vec<DuplicateGroup>,
    pub warnings: Vec<ScanWarning>,
    pub discovered: usize,
    pub processed: usize,
    pub cancelled: bool,
}

/// Operator command surface over the engine components. One instance owns
/// the operation log; every move or delete is serialized through it.
pub struct Engine {
    scan_options: ScanOptions,
    merge_options: MergeOptions,
    scan_state: Mutex<Option<ScanOutcome>>,
    operation_log: Arc<Mutex<OperationLog>>,
    cancellation_token: Arc<AtomicBool>,
    pause_token: Arc<AtomicBool>,
    running: AtomicBool,
    progress_sender: Option<mpsc::UnboundedSender<ScanProgress>>,
    frame_extractor: Option<Arc<dyn FrameExtractor>>,
    scoring: ScoringService,
}

impl Engine {
    pub fn new(mut scan_options: ScanOptions, mut merge_options: MergeOptions, operation_log: OperationLog) -> Self {
        let quarantine = operation_log.quarantine_dir().to_path_buf();
        scan_options.quarantine_dir.get_or_insert_with(|| quarantine.clone());
        merge_options.quarantine_dir.get_or_insert(quarantine);

        Self {
            scan_options,
            merge_options,
            scan_state: Mutex::new(None),
            operation_log: Arc::new(Mutex::new(operation_log)),
            cancellation_token: Arc::new(AtomicBool::new(false)),
            pause_token: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            progress_sender: None,
            frame_extractor: None,
            scoring: ScoringService::new(),
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_frame_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.frame_extractor = Some(extractor);
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringService) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn scan_options(&self) -> &ScanOptions {
        &self.scan_options
    }

    /// Only one scan or merge runs at a time; a second request gets `Busy`
    /// and leaves the running one's cancel and pause state alone.
    fn begin_run(&self) -> Result<RunGuard<'_>, EngineError> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::Busy)?;
        self.cancellation_token.store(false, Ordering::Relaxed);
        self.pause_token.store(false, Ordering::Relaxed);
        Ok(RunGuard(&self.running))
    }

    pub async fn start_scan(&self, root: &Path) -> Result<ScanSummary, EngineError> {
        let _run = self.begin_run()?;

        let mut scanner = ScannerService::new()
            .with_cancellation_token(self.cancellation_token.clone())
            .with_pause_token(self.pause_token.clone());
        if let Some(sender) = &self.progress_sender {
            scanner = scanner.with_progress_sender(sender.clone());
        }
        if let Some(extractor) = &self.frame_extractor {
            scanner = scanner.with_frame_extractor(extractor.clone());
        }

        let scan_root = root.to_path_buf();
        let options = self.scan_options.clone();
        let outcome = tokio::task::spawn_blocking(move || scanner.scan(&scan_root, &options)).await??;

        let summary = ScanSummary {
            root: root.to_path_buf(),
            groups: outcome.groups.clone(),
            warnings: outcome.warnings.clone(),
            discovered: outcome.discovered,
            processed: outcome.processed,
            cancelled: outcome.cancelled,
        };
        *self.scan_state.lock().await = Some(outcome);
        Ok(summary)
    }

    pub fn cancel_scan(&self) {
        log::info!("Cancellation requested");
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    /// Hold scan workers before their next file until `resume_scan`.
    pub fn pause_scan(&self) {
        log::info!("Scan paused");
        self.pause_token.store(true, Ordering::Relaxed);
    }

    pub fn resume_scan(&self) {
        log::info!("Scan resumed");
        self.pause_token.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_token.load(Ordering::Relaxed)
    }

    /// Current groups, reflecting moves and deletes since the scan.
    pub async fn groups(&self) -> Result<Vec<DuplicateGroup>, EngineError> {
        let state = self.scan_state.lock().await;
        let state = state.as_ref().ok_or(EngineError::NoScan)?;
        Ok(state.groups.clone())
    }

    pub async fn apply_smart_select(&self, group_index: usize) -> Result<Selection, EngineError> {
        let state = self.scan_state.lock().await;
        let state = state.as_ref().ok_or(EngineError::NoScan)?;
        let group = state
            .groups
            .get(group_index)
            .ok_or(EngineError::UnknownGroup(group_index))?;
        self.scoring
            .select(group)
            .ok_or(EngineError::UnknownGroup(group_index))
    }

    pub async fn move_file(&self, path: &Path, destination: &Path) -> Result<UndoEntry, EngineError> {
        let entry = self.operation_log.lock().await.move_file(path, destination)?;
        self.forget(path, RecordStatus::Moved).await;
        Ok(entry)
    }

    pub async fn delete_file(&self, path: &Path) -> Result<UndoEntry, EngineError> {
        let entry = self.operation_log.lock().await.delete_file(path)?;
        self.forget(path, RecordStatus::Removed).await;
        Ok(entry)
    }

    /// Reverse the latest operation. The restored file is not regrouped
    /// until the next scan.
    pub async fn undo(&self) -> Result<UndoEntry, EngineError> {
        let entry = self.operation_log.lock().await.undo()?;
        if let Some(state) = self.scan_state.lock().await.as_mut() {
            if let Some(record) = state.records.iter_mut().find(|r| r.path == entry.original_path) {
                record.status = RecordStatus::Fingerprinted;
            }
        }
        Ok(entry)
    }

    pub async fn discard_last(&self) -> Option<UndoEntry> {
        self.operation_log.lock().await.discard_last()
    }

    pub async fn purge(&self) -> PurgeReport {
        self.operation_log.lock().await.purge()
    }

    pub async fn history(&self) -> Vec<UndoEntry> {
        self.operation_log.lock().await.entries().to_vec()
    }

    pub async fn find_similar(&self, path: &Path) -> Result<Vec<SimilarMatch>, EngineError> {
        let state = self.scan_state.lock().await;
        let state = state.as_ref().ok_or(EngineError::NoScan)?;
        let record = state
            .record(path)
            .filter(|r| r.is_groupable())
            .ok_or_else(|| EngineError::NotScanned {
                path: path.to_path_buf(),
            })?;

        Ok(state
            .detector()
            .find_similar(record)
            .into_iter()
            .filter(|m| {
                state
                    .record(&m.record.path)
                    .is_some_and(|r| r.status == RecordStatus::Fingerprinted)
            })
            .collect())
    }

    pub async fn start_merge(&self, master_root: &Path, incoming_root: &Path, dry_run: bool) -> Result<MergePlan, EngineError> {
        let reconciler = MergeReconciler::new(self.merge_options.clone());
        let (master, incoming) = (master_root.to_path_buf(), incoming_root.to_path_buf());
        let plan = tokio::task::spawn_blocking(move || reconciler.plan(&master, &incoming, dry_run)).await??;
        Ok(plan)
    }

    pub async fn execute_merge(&self, plan: MergePlan) -> Result<MergeReport, EngineError> {
        let _run = self.begin_run()?;
        let reconciler = MergeReconciler::new(self.merge_options.clone());
        let mut operation_log = self.operation_log.clone().lock_owned().await;
        let cancel = self.cancellation_token.clone();

        let report =
            tokio::task::spawn_blocking(move || reconciler.execute(&plan, &mut operation_log, &cancel)).await??;
        Ok(report)
    }

    /// Drop a file that left its location from the current groups.
    async fn forget(&self, path: &Path, status: RecordStatus) {
        if let Some(state) = self.scan_state.lock().await.as_mut() {
            detach_member(&mut state.groups, path);
            if let Some(record) = state.records.iter_mut().find(|r| r.path == path) {
                record.status = status;
            }
        }
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::ScanMode;
    use crate::core::scoring::SelectionRule;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(temp_dir: &TempDir) -> Engine {
        let options = ScanOptions {
            workers: 2,
            ..ScanOptions::default()
        };
        Engine::new(
            options,
            MergeOptions::default(),
            OperationLog::new(temp_dir.path().join("quarantine")),
        )
    }

    fn populate(root: &Path) {
        fs::create_dir_all(root).unwrap();
        fs::write(root.join("a.txt"), b"duplicate content").unwrap();
        fs::write(root.join("b.txt"), b"duplicate content").unwrap();
        fs::write(root.join("longer_name.txt"), b"duplicate content").unwrap();
        fs::write(root.join("unique.txt"), b"unique").unwrap();
    }

    #[tokio::test]
    async fn test_commands_require_scan() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir);

        assert!(matches!(engine.groups().await, Err(EngineError::NoScan)));
        assert!(matches!(engine.apply_smart_select(0).await, Err(EngineError::NoScan)));
        assert!(matches!(
            engine.find_similar(Path::new("/x")).await,
            Err(EngineError::NoScan)
        ));
    }

    #[tokio::test]
    async fn test_delete_detaches_and_undo_restores() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        populate(&root);
        let engine = engine(&temp_dir);

        let summary = engine.start_scan(&root).await.unwrap();
        assert_eq!(summary.groups.len(), 1);
        assert_eq!(summary.groups[0].len(), 3);

        let selection = engine.apply_smart_select(0).await.unwrap();
        assert!(summary.groups[0].contains(&selection.keep));
        assert_eq!(selection.discard.len(), 2);
        assert!(!selection.discard.contains(&selection.keep));

        for path in &selection.discard {
            engine.delete_file(path).await.unwrap();
        }
        assert!(engine.groups().await.unwrap().is_empty());
        assert_eq!(engine.history().await.len(), 2);

        let restored = engine.undo().await.unwrap();
        assert!(restored.original_path.exists());
        assert_eq!(engine.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_move_updates_groups() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        populate(&root);
        let engine = engine(&temp_dir);
        engine.start_scan(&root).await.unwrap();

        let entry = engine
            .move_file(&root.join("b.txt"), &temp_dir.path().join("elsewhere"))
            .await
            .unwrap();
        assert!(entry.new_path.exists());

        let groups = engine.groups().await.unwrap();
        assert_eq!(groups[0].len(), 2);
        assert!(!groups[0].contains(&root.join("b.txt")));
    }

    #[tokio::test]
    async fn test_find_similar_skips_removed_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        populate(&root);
        let engine = engine(&temp_dir);
        engine.start_scan(&root).await.unwrap();

        assert_eq!(engine.find_similar(&root.join("a.txt")).await.unwrap().len(), 2);
        engine.delete_file(&root.join("b.txt")).await.unwrap();
        let similar = engine.find_similar(&root.join("a.txt")).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].record.path, root.join("longer_name.txt"));

        assert!(matches!(
            engine.find_similar(&root.join("missing.txt")).await,
            Err(EngineError::NotScanned { .. })
        ));
    }

    #[tokio::test]
    async fn test_quarantine_not_rescanned() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        populate(&root);
        let engine = Engine::new(
            ScanOptions::default(),
            MergeOptions::default(),
            OperationLog::new(root.join(".quarantine")),
        );

        engine.start_scan(&root).await.unwrap();
        engine.delete_file(&root.join("b.txt")).await.unwrap();

        let summary = engine.start_scan(&root).await.unwrap();
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.groups[0].len(), 2);
    }

    #[tokio::test]
    async fn test_merge_through_engine() {
        let temp_dir = TempDir::new().unwrap();
        let master = temp_dir.path().join("master");
        let incoming = temp_dir.path().join("incoming");
        fs::create_dir_all(&master).unwrap();
        fs::create_dir_all(&incoming).unwrap();
        fs::write(master.join("keep.txt"), b"same").unwrap();
        fs::write(incoming.join("dup.txt"), b"same").unwrap();
        fs::write(incoming.join("new.txt"), b"new").unwrap();

        let engine = engine(&temp_dir);
        let dry = engine.start_merge(&master, &incoming, true).await.unwrap();
        let plan = engine.start_merge(&master, &incoming, false).await.unwrap();
        assert_eq!(dry.decisions(), plan.decisions());

        let report = engine.execute_merge(plan).await.unwrap();
        assert_eq!(report.failures(), 0);
        assert!(master.join("new.txt").exists());
    }

    /// Blocks inside frame extraction until released.
    #[derive(Default)]
    struct GatedExtractor {
        entered: AtomicBool,
        release: AtomicBool,
    }

    impl FrameExtractor for GatedExtractor {
        fn extract_frames(
            &self,
            _path: &Path,
            positions: &[f64],
        ) -> Result<Vec<image::DynamicImage>, crate::core::fingerprint::FingerprintError> {
            self.entered.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(positions.iter().map(|_| image::DynamicImage::new_rgb8(16, 16)).collect())
        }
    }

    fn gated_engine(temp_dir: &TempDir, gate: Arc<GatedExtractor>) -> (Arc<Engine>, PathBuf) {
        let root = temp_dir.path().join("clips");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.mp4"), b"first clip").unwrap();
        fs::write(root.join("b.mp4"), b"second clip").unwrap();

        let options = ScanOptions {
            mode: ScanMode::Visual,
            workers: 1,
            ..ScanOptions::default()
        };
        let engine = Engine::new(
            options,
            MergeOptions::default(),
            OperationLog::new(temp_dir.path().join("quarantine")),
        )
        .with_frame_extractor(gate);
        (Arc::new(engine), root)
    }

    async fn wait_for(flag: &AtomicBool) {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_scan_rejected_without_clearing_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let gate = Arc::new(GatedExtractor::default());
        let (engine, root) = gated_engine(&temp_dir, gate.clone());

        let running = {
            let (engine, root) = (engine.clone(), root.clone());
            tokio::spawn(async move { engine.start_scan(&root).await })
        };
        wait_for(&gate.entered).await;

        engine.cancel_scan();
        assert!(matches!(engine.start_scan(&root).await, Err(EngineError::Busy)));
        assert!(engine.cancellation_token().load(Ordering::Relaxed));

        gate.release.store(true, Ordering::SeqCst);
        let summary = running.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert!(summary.processed < 2);

        let rerun = engine.start_scan(&root).await.unwrap();
        assert!(!rerun.cancelled);
        assert_eq!(rerun.processed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_resume_scan() {
        let temp_dir = TempDir::new().unwrap();
        let gate = Arc::new(GatedExtractor::default());
        let (engine, root) = gated_engine(&temp_dir, gate.clone());

        let running = {
            let (engine, root) = (engine.clone(), root.clone());
            tokio::spawn(async move { engine.start_scan(&root).await })
        };
        wait_for(&gate.entered).await;

        engine.pause_scan();
        assert!(engine.is_paused());
        gate.release.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!running.is_finished());

        engine.resume_scan();
        let summary = running.await.unwrap().unwrap();
        assert!(!summary.cancelled);
        assert_eq!(summary.processed, 2);
    }

    #[tokio::test]
    async fn test_custom_selection_rules() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("photos");
        populate(&root);
        let engine = engine(&temp_dir).with_scoring(ScoringService::with_rules(vec![SelectionRule::ShorterPath]));
        engine.start_scan(&root).await.unwrap();

        let selection = engine.apply_smart_select(0).await.unwrap();
        assert_eq!(selection.keep, root.join("a.txt"));
        assert_eq!(
            selection.discard,
            vec![root.join("b.txt"), root.join("longer_name.txt")]
        );
    }
}
