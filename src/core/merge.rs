// Folder merge: reconcile an Incoming tree into a Master tree without
// overwriting anything. Planning is read-only; execution routes every
// destructive step through the operation log.

use crate::core::hash::HashService;
use crate::core::history::{collision_free_path, Operation, OperationError, OperationLog};
use crate::core::record::ExactDigest;
use crate::core::scanner::quarantine_under_root;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Invalid merge root: {}", .path.display())]
    InvalidRoot { path: PathBuf },

    #[error("Master {} and incoming {} overlap", .master.display(), .incoming.display())]
    OverlappingRoots { master: PathBuf, incoming: PathBuf },

    #[error("Dry-run plans cannot be executed")]
    DryRunPlan,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an action was flagged instead of carried out.
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Target already exists: {}", .path.display())]
    TargetExists { path: PathBuf },

    #[error("Target occupied, manual review needed: {}", .path.display())]
    ManualReview { path: PathBuf },

    #[error("Cannot read {}: {message}", .path.display())]
    Unreadable { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeActionKind {
    CopyNew,
    SkipDuplicate,
    RenameOnConflict,
    FlagManual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAction {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MergeActionKind,
    pub dry_run: bool,
    /// Set for flag-manual actions
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub master_root: PathBuf,
    pub incoming_root: PathBuf,
    pub actions: Vec<MergeAction>,
    pub dry_run: bool,
}

impl MergePlan {
    /// The plan's decisions with the dry-run flag stripped.
    pub fn decisions(&self) -> Vec<(&Path, &Path, MergeActionKind)> {
        self.actions
            .iter()
            .map(|a| (a.source.as_path(), a.target.as_path(), a.kind))
            .collect()
    }

    pub fn count(&self, kind: MergeActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Place the file under a `_N` suffixed name
    #[default]
    Rename,
    /// Leave the file for the operator
    Flag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    #[default]
    Leave,
    Quarantine,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub conflict_policy: ConflictPolicy,
    pub transfer_mode: TransferMode,
    pub duplicate_action: DuplicateAction,
    /// Skipped on both sides when it lies under a merge root
    pub quarantine_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "kebab-case")]
pub enum ActionOutcome {
    Succeeded,
    Skipped,
    Flagged,
    Failed(String),
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action: MergeAction,
    pub outcome: ActionOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub actions: Vec<ActionReport>,
}

impl MergeReport {
    pub fn count(&self, matches: impl Fn(&ActionOutcome) -> bool) -> usize {
        self.actions.iter().filter(|r| matches(&r.outcome)).count()
    }

    pub fn failures(&self) -> usize {
        self.count(|o| matches!(o, ActionOutcome::Failed(_)))
    }
}

pub struct MergeReconciler {
    hash_service: HashService,
    options: MergeOptions,
}

impl MergeReconciler {
    pub fn new(options: MergeOptions) -> Self {
        Self {
            hash_service: HashService::new(),
            options,
        }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Classify every Incoming file. Only reads the filesystem.
    pub fn plan(&self, master_root: &Path, incoming_root: &Path, dry_run: bool) -> Result<MergePlan, MergeError> {
        for root in [master_root, incoming_root] {
            if !root.is_dir() {
                return Err(MergeError::InvalidRoot {
                    path: root.to_path_buf(),
                });
            }
        }
        let (master_canon, incoming_canon) = (fs::canonicalize(master_root)?, fs::canonicalize(incoming_root)?);
        if master_canon.starts_with(&incoming_canon) || incoming_canon.starts_with(&master_canon) {
            return Err(MergeError::OverlappingRoots {
                master: master_root.to_path_buf(),
                incoming: incoming_root.to_path_buf(),
            });
        }

        log::info!(
            "Planning merge of {} into {}{}",
            incoming_root.display(),
            master_root.display(),
            if dry_run { " (dry run)" } else { "" }
        );

        let master_files = self.list_files(master_root);
        let incoming_files = self.list_files(incoming_root);

        let mut master_by_size: HashMap<u64, Vec<PathBuf>> = HashMap::new();
        for (path, size) in master_files {
            master_by_size.entry(size).or_default().push(path);
        }

        // Only hash master files whose size matches something incoming
        let master_candidates: Vec<&Path> = incoming_files
            .iter()
            .map(|(_, size)| *size)
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|size| master_by_size.get(&size))
            .flatten()
            .map(PathBuf::as_path)
            .collect();
        let mut master_by_digest: HashMap<ExactDigest, PathBuf> = HashMap::new();
        for (path, result) in self.hash_service.compute_content_hashes_batch(&master_candidates) {
            match result {
                Ok(digest) => {
                    let slot = master_by_digest.entry(digest).or_insert_with(|| path.to_path_buf());
                    if path < slot.as_path() {
                        *slot = path.to_path_buf();
                    }
                }
                Err(e) => log::warn!("Cannot hash master file {}: {}", path.display(), e),
            }
        }

        let sized_incoming: Vec<&Path> = incoming_files
            .iter()
            .filter(|(_, size)| master_by_size.contains_key(size))
            .map(|(path, _)| path.as_path())
            .collect();
        let incoming_digests: HashMap<&Path, Result<ExactDigest, String>> = self
            .hash_service
            .compute_content_hashes_batch(&sized_incoming)
            .into_iter()
            .map(|(path, result)| (path, result.map_err(|e| e.to_string())))
            .collect();

        // Renames must never land on a path another incoming file maps to
        let reserved: HashSet<PathBuf> = incoming_files
            .iter()
            .map(|(source, _)| mapped_target(source, master_root, incoming_root))
            .collect();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut actions = Vec::with_capacity(incoming_files.len());

        for (source, _) in &incoming_files {
            let mapped = mapped_target(source, master_root, incoming_root);
            let digest = incoming_digests.get(source.as_path());

            let unreadable = match digest {
                Some(Err(message)) => Some(message.clone()),
                Some(Ok(_)) => None,
                // Not hashed because no master file has its size
                None => fs::File::open(source).err().map(|e| e.to_string()),
            };
            let duplicate_of = match digest {
                Some(Ok(digest)) => master_by_digest.get(digest),
                _ => None,
            };

            let action = if let Some(message) = unreadable {
                log::warn!("Cannot read incoming file {}: {}", source.display(), message);
                MergeAction {
                    source: source.clone(),
                    target: mapped,
                    kind: MergeActionKind::FlagManual,
                    dry_run,
                    reason: Some(
                        ConflictError::Unreadable {
                            path: source.clone(),
                            message,
                        }
                        .to_string(),
                    ),
                }
            } else if let Some(existing) = duplicate_of {
                MergeAction {
                    source: source.clone(),
                    target: existing.clone(),
                    kind: MergeActionKind::SkipDuplicate,
                    dry_run,
                    reason: None,
                }
            } else {
                self.place(source, mapped, &mut claimed, &reserved, dry_run)
            };
            actions.push(action);
        }

        let plan = MergePlan {
            master_root: master_root.to_path_buf(),
            incoming_root: incoming_root.to_path_buf(),
            actions,
            dry_run,
        };
        log::info!(
            "Merge plan: {} new, {} duplicate, {} renamed, {} flagged",
            plan.count(MergeActionKind::CopyNew),
            plan.count(MergeActionKind::SkipDuplicate),
            plan.count(MergeActionKind::RenameOnConflict),
            plan.count(MergeActionKind::FlagManual)
        );
        Ok(plan)
    }

    fn place(
        &self,
        source: &Path,
        mapped: PathBuf,
        claimed: &mut HashSet<PathBuf>,
        reserved: &HashSet<PathBuf>,
        dry_run: bool,
    ) -> MergeAction {
        let (kind, target, reason) = if !mapped.exists() && !claimed.contains(&mapped) {
            (MergeActionKind::CopyNew, mapped, None)
        } else {
            match self.options.conflict_policy {
                ConflictPolicy::Rename => {
                    let renamed = collision_free_path(&mapped, |p| {
                        p.exists() || claimed.contains(p) || reserved.contains(p)
                    });
                    (MergeActionKind::RenameOnConflict, renamed, None)
                }
                ConflictPolicy::Flag => {
                    let reason = ConflictError::ManualReview { path: mapped.clone() }.to_string();
                    (MergeActionKind::FlagManual, mapped, Some(reason))
                }
            }
        };

        if kind != MergeActionKind::FlagManual {
            claimed.insert(target.clone());
        }
        MergeAction {
            source: source.to_path_buf(),
            target,
            kind,
            dry_run,
            reason,
        }
    }

    /// Apply a real-run plan in order. Per-action failures are reported, not
    /// propagated; cancellation or a vanished master root stops further work.
    pub fn execute(
        &self,
        plan: &MergePlan,
        operation_log: &mut OperationLog,
        cancel: &AtomicBool,
    ) -> Result<MergeReport, MergeError> {
        if plan.dry_run {
            return Err(MergeError::DryRunPlan);
        }

        let mut report = MergeReport::default();
        let mut halted = false;

        for action in &plan.actions {
            if !halted && (cancel.load(Ordering::Relaxed) || !plan.master_root.is_dir()) {
                log::warn!("Merge halted; remaining actions not attempted");
                halted = true;
            }

            let (outcome, detail) = if halted {
                (ActionOutcome::NotAttempted, None)
            } else {
                self.execute_action(action, operation_log)
            };

            if let ActionOutcome::Failed(ref message) = outcome {
                log::warn!("Merge action for {} failed: {}", action.source.display(), message);
            }
            report.actions.push(ActionReport {
                action: action.clone(),
                outcome,
                detail,
            });
        }

        log::info!(
            "Merge finished: {} succeeded, {} failed",
            report.count(|o| *o == ActionOutcome::Succeeded),
            report.failures()
        );
        Ok(report)
    }

    fn execute_action(&self, action: &MergeAction, operation_log: &mut OperationLog) -> (ActionOutcome, Option<String>) {
        match action.kind {
            MergeActionKind::FlagManual => (ActionOutcome::Flagged, action.reason.clone()),
            MergeActionKind::SkipDuplicate => match self.options.duplicate_action {
                DuplicateAction::Leave => (ActionOutcome::Skipped, None),
                DuplicateAction::Quarantine => match operation_log.delete_file(&action.source) {
                    Ok(entry) => (ActionOutcome::Succeeded, Some(entry.new_path.display().to_string())),
                    Err(e) => (ActionOutcome::Failed(e.to_string()), None),
                },
            },
            MergeActionKind::CopyNew | MergeActionKind::RenameOnConflict => {
                if action.target.exists() {
                    let conflict = ConflictError::TargetExists {
                        path: action.target.clone(),
                    };
                    return (ActionOutcome::Flagged, Some(conflict.to_string()));
                }
                match self.transfer(&action.source, &action.target, operation_log) {
                    Ok(()) => (ActionOutcome::Succeeded, None),
                    Err(OperationError::TargetExists { path }) => (
                        ActionOutcome::Flagged,
                        Some(ConflictError::TargetExists { path }.to_string()),
                    ),
                    Err(e) => (ActionOutcome::Failed(e.to_string()), None),
                }
            }
        }
    }

    fn transfer(&self, source: &Path, target: &Path, operation_log: &mut OperationLog) -> Result<(), OperationError> {
        match self.options.transfer_mode {
            TransferMode::Move => operation_log
                .apply(Operation::MoveTo {
                    from: source.to_path_buf(),
                    to: target.to_path_buf(),
                })
                .map(|_| ()),
            TransferMode::Copy => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|source| OperationError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                fs::copy(source, target).map_err(|e| OperationError::Io {
                    path: source.to_path_buf(),
                    source: e,
                })?;
                log::info!("Copied {} -> {}", source.display(), target.display());
                Ok(())
            }
        }
    }

    /// Regular files under `root` with their sizes, in path order.
    fn list_files(&self, root: &Path) -> Vec<(PathBuf, u64)> {
        let quarantine = self
            .options
            .quarantine_dir
            .as_deref()
            .and_then(|q| quarantine_under_root(root, q));
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| quarantine.as_deref() != Some(entry.path()))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let size = entry.metadata().ok()?.len();
                Some((entry.into_path(), size))
            })
            .collect()
    }
}

/// Where `source` lands in master when kept at its relative path.
fn mapped_target(source: &Path, master_root: &Path, incoming_root: &Path) -> PathBuf {
    master_root.join(source.strip_prefix(incoming_root).unwrap_or(source))
}

impl Default for MergeReconciler {
    fn default() -> Self {
        Self::new(MergeOptions::default())
    }
}
