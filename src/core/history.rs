use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Source does not exist: {}", .path.display())]
    SourceMissing { path: PathBuf },

    #[error("Not a regular file: {}", .path.display())]
    NotAFile { path: PathBuf },

    #[error("{} is already in {}", .path.display(), .dir.display())]
    SameLocation { path: PathBuf, dir: PathBuf },

    #[error("Destination already exists: {}", .path.display())]
    TargetExists { path: PathBuf },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum UndoError {
    #[error("Nothing to undo")]
    Empty,

    #[error("Cannot undo: {} no longer exists", .path.display())]
    Missing { path: PathBuf },

    #[error("Cannot undo: {} is occupied", .path.display())]
    Occupied { path: PathBuf },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Move,
    Delete,
}

/// A destructive request. Delete never removes data; it quarantines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Move into a directory, suffixing the name on collision
    Move { from: PathBuf, to_dir: PathBuf },
    /// Move to an exact path; fails if it exists
    MoveTo { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub id: Uuid,
    pub kind: OperationKind,
    pub original_path: PathBuf,
    /// Destination for moves, quarantine location for deletes
    pub new_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl UndoEntry {
    fn new(kind: OperationKind, original_path: PathBuf, new_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            original_path,
            new_path,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PurgeReport {
    pub removed: usize,
    pub bytes: u64,
    pub failed: Vec<(PathBuf, String)>,
}

/// LIFO record of every move and delete, able to reverse the latest one.
#[derive(Debug)]
pub struct OperationLog {
    quarantine_dir: PathBuf,
    entries: Vec<UndoEntry>,
}

impl OperationLog {
    pub fn new(quarantine_dir: impl Into<PathBuf>) -> Self {
        Self::from_entries(quarantine_dir, Vec::new())
    }

    /// Resume a log persisted by a previous session.
    pub fn from_entries(quarantine_dir: impl Into<PathBuf>, entries: Vec<UndoEntry>) -> Self {
        Self {
            quarantine_dir: quarantine_dir.into(),
            entries,
        }
    }

    pub fn quarantine_dir(&self) -> &Path {
        &self.quarantine_dir
    }

    pub fn entries(&self) -> &[UndoEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&UndoEntry> {
        self.entries.last()
    }

    pub fn apply(&mut self, operation: Operation) -> Result<UndoEntry, OperationError> {
        let entry = match operation {
            Operation::Move { from, to_dir } => {
                check_source(&from)?;
                if from.parent() == Some(to_dir.as_path()) {
                    return Err(OperationError::SameLocation { path: from, dir: to_dir });
                }

                ensure_dir(&to_dir)?;
                let destination = collision_free_path(&to_dir.join(file_name(&from)), |p| p.exists());
                relocate(&from, &destination)?;
                log::info!("Moved {} -> {}", from.display(), destination.display());
                UndoEntry::new(OperationKind::Move, from, destination)
            }
            Operation::MoveTo { from, to } => {
                check_source(&from)?;
                if to.exists() {
                    return Err(OperationError::TargetExists { path: to });
                }
                if let Some(parent) = to.parent() {
                    ensure_dir(parent)?;
                }
                relocate(&from, &to)?;
                log::info!("Moved {} -> {}", from.display(), to.display());
                UndoEntry::new(OperationKind::Move, from, to)
            }
            Operation::Delete { path } => {
                check_source(&path)?;
                ensure_dir(&self.quarantine_dir)?;

                // A fresh uuid prefix keeps same-named files apart
                let quarantined = self
                    .quarantine_dir
                    .join(format!("{}_{}", Uuid::new_v4().simple(), file_name(&path)));
                relocate(&path, &quarantined)?;
                log::info!("Quarantined {} -> {}", path.display(), quarantined.display());
                UndoEntry::new(OperationKind::Delete, path, quarantined)
            }
        };

        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn move_file(&mut self, from: &Path, to_dir: &Path) -> Result<UndoEntry, OperationError> {
        self.apply(Operation::Move {
            from: from.to_path_buf(),
            to_dir: to_dir.to_path_buf(),
        })
    }

    pub fn delete_file(&mut self, path: &Path) -> Result<UndoEntry, OperationError> {
        self.apply(Operation::Delete {
            path: path.to_path_buf(),
        })
    }

    /// Reverse the most recent entry. On failure the entry stays on the stack.
    pub fn undo(&mut self) -> Result<UndoEntry, UndoError> {
        let entry = self.entries.last().ok_or(UndoError::Empty)?;

        if !entry.new_path.exists() {
            return Err(UndoError::Missing {
                path: entry.new_path.clone(),
            });
        }
        if entry.original_path.exists() {
            return Err(UndoError::Occupied {
                path: entry.original_path.clone(),
            });
        }

        if let Some(parent) = entry.original_path.parent() {
            fs::create_dir_all(parent).map_err(|source| UndoError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        relocate(&entry.new_path, &entry.original_path).map_err(|e| match e {
            OperationError::Io { path, source } => UndoError::Io { path, source },
            other => UndoError::Io {
                path: entry.new_path.clone(),
                source: io::Error::other(other.to_string()),
            },
        })?;

        log::info!(
            "Undid {:?}: {} restored",
            entry.kind,
            entry.original_path.display()
        );
        self.entries.pop().ok_or(UndoError::Empty)
    }

    /// Drop the most recent entry without touching the filesystem.
    pub fn discard_last(&mut self) -> Option<UndoEntry> {
        let entry = self.entries.pop();
        if let Some(ref entry) = entry {
            log::warn!("Discarded undo entry for {}", entry.original_path.display());
        }
        entry
    }

    /// Permanently remove quarantined files. Their entries leave the stack;
    /// moves and files that fail to delete stay.
    pub fn purge(&mut self) -> PurgeReport {
        let mut report = PurgeReport::default();

        self.entries.retain(|entry| {
            if entry.kind != OperationKind::Delete {
                return true;
            }

            let size = fs::metadata(&entry.new_path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&entry.new_path) {
                Ok(()) => {
                    report.removed += 1;
                    report.bytes += size;
                    false
                }
                // Already gone; nothing left to restore
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => {
                    log::warn!("Cannot purge {}: {}", entry.new_path.display(), e);
                    report.failed.push((entry.new_path.clone(), e.to_string()));
                    true
                }
            }
        });

        log::info!("Purged {} quarantined files ({} bytes)", report.removed, report.bytes);
        report
    }
}

/// `path` if not taken, otherwise the first free `stem_N.ext` with N >= 1.
pub fn collision_free_path(path: &Path, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !is_taken(path) {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().to_string());

    (1u32..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| path.to_path_buf())
}

/// Rename, falling back to copy-then-remove across filesystems.
pub(crate) fn relocate(from: &Path, to: &Path) -> Result<(), OperationError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            log::debug!("Cross-device move of {}, copying", from.display());
            fs::copy(from, to).map_err(|source| OperationError::Io {
                path: to.to_path_buf(),
                source,
            })?;
            fs::remove_file(from).map_err(|source| OperationError::Io {
                path: from.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(OperationError::Io {
            path: from.to_path_buf(),
            source,
        }),
    }
}

fn check_source(path: &Path) -> Result<(), OperationError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => Err(OperationError::NotAFile {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(OperationError::SourceMissing {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(OperationError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), OperationError> {
    fs::create_dir_all(dir).map_err(|source| OperationError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::HashService;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OperationLog) {
        let temp_dir = TempDir::new().unwrap();
        let log = OperationLog::new(temp_dir.path().join("quarantine"));
        (temp_dir, log)
    }

    #[test]
    fn test_delete_quarantines_and_undo_restores() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.jpg");
        fs::write(&file, b"picture bytes").unwrap();
        let before = HashService::new().compute_content_hash(&file).unwrap();

        let entry = log.delete_file(&file).unwrap();
        assert_eq!(entry.kind, OperationKind::Delete);
        assert!(!file.exists());
        assert!(entry.new_path.exists());
        assert!(entry.new_path.starts_with(log.quarantine_dir()));

        let undone = log.undo().unwrap();
        assert_eq!(undone.id, entry.id);
        assert!(file.exists());
        assert!(log.is_empty());
        assert_eq!(HashService::new().compute_content_hash(&file).unwrap(), before);
    }

    #[test]
    fn test_move_never_overwrites() {
        let (temp_dir, mut log) = setup();
        let src_dir = temp_dir.path().join("src");
        let dest_dir = temp_dir.path().join("dest");
        fs::create_dir_all(&src_dir).unwrap();
        fs::create_dir_all(&dest_dir).unwrap();
        fs::write(src_dir.join("photo.jpg"), b"incoming").unwrap();
        fs::write(dest_dir.join("photo.jpg"), b"existing").unwrap();
        fs::write(dest_dir.join("photo_1.jpg"), b"existing too").unwrap();

        let entry = log.move_file(&src_dir.join("photo.jpg"), &dest_dir).unwrap();
        assert_eq!(entry.new_path, dest_dir.join("photo_2.jpg"));
        assert_eq!(fs::read(dest_dir.join("photo.jpg")).unwrap(), b"existing");
        assert_eq!(fs::read(&entry.new_path).unwrap(), b"incoming");

        log.undo().unwrap();
        assert_eq!(fs::read(src_dir.join("photo.jpg")).unwrap(), b"incoming");
        assert!(!dest_dir.join("photo_2.jpg").exists());
    }

    #[test]
    fn test_move_to_exact_path_refuses_existing() {
        let (temp_dir, mut log) = setup();
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("sub/b.txt");
        fs::write(&a, b"a").unwrap();

        let entry = log
            .apply(Operation::MoveTo { from: a.clone(), to: b.clone() })
            .unwrap();
        assert_eq!(entry.new_path, b);

        fs::write(&a, b"again").unwrap();
        let result = log.apply(Operation::MoveTo { from: a.clone(), to: b.clone() });
        assert!(matches!(result, Err(OperationError::TargetExists { .. })));
        assert_eq!(fs::read(&b).unwrap(), b"a");
    }

    #[test]
    fn test_move_creates_destination() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let entry = log.move_file(&file, &temp_dir.path().join("new/dir")).unwrap();
        assert_eq!(entry.new_path, temp_dir.path().join("new/dir/a.txt"));
    }

    #[test]
    fn test_move_into_own_directory_rejected() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let result = log.move_file(&file, temp_dir.path());
        assert!(matches!(result, Err(OperationError::SameLocation { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn test_missing_source_rejected() {
        let (temp_dir, mut log) = setup();
        let result = log.delete_file(&temp_dir.path().join("ghost.txt"));
        assert!(matches!(result, Err(OperationError::SourceMissing { .. })));

        let result = log.delete_file(temp_dir.path());
        assert!(matches!(result, Err(OperationError::NotAFile { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn test_undo_is_lifo() {
        let (temp_dir, mut log) = setup();
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        log.delete_file(&a).unwrap();
        log.delete_file(&b).unwrap();

        assert_eq!(log.undo().unwrap().original_path, b);
        assert!(b.exists() && !a.exists());
        assert_eq!(log.undo().unwrap().original_path, a);
        assert!(matches!(log.undo(), Err(UndoError::Empty)));
    }

    #[test]
    fn test_undo_refuses_occupied_original() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"original").unwrap();
        log.delete_file(&file).unwrap();
        fs::write(&file, b"someone else").unwrap();

        assert!(matches!(log.undo(), Err(UndoError::Occupied { .. })));
        assert_eq!(log.len(), 1);
        assert_eq!(fs::read(&file).unwrap(), b"someone else");

        assert!(log.discard_last().is_some());
        assert!(log.is_empty());
    }

    #[test]
    fn test_undo_reports_missing_quarantine_file() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let entry = log.delete_file(&file).unwrap();
        fs::remove_file(&entry.new_path).unwrap();

        assert!(matches!(log.undo(), Err(UndoError::Missing { .. })));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_purge_removes_only_quarantined_files() {
        let (temp_dir, mut log) = setup();
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs::write(&a, b"12345").unwrap();
        fs::write(&b, b"b").unwrap();

        let deleted = log.delete_file(&a).unwrap();
        let moved = log.move_file(&b, &temp_dir.path().join("elsewhere")).unwrap();

        let report = log.purge();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes, 5);
        assert!(report.failed.is_empty());
        assert!(!deleted.new_path.exists());
        assert!(moved.new_path.exists());
        assert_eq!(log.entries(), &[moved]);
    }

    #[test]
    fn test_same_name_deletes_do_not_collide() {
        let (temp_dir, mut log) = setup();
        let one = temp_dir.path().join("one");
        let two = temp_dir.path().join("two");
        fs::create_dir_all(&one).unwrap();
        fs::create_dir_all(&two).unwrap();
        fs::write(one.join("img.jpg"), b"1").unwrap();
        fs::write(two.join("img.jpg"), b"2").unwrap();

        let first = log.delete_file(&one.join("img.jpg")).unwrap();
        let second = log.delete_file(&two.join("img.jpg")).unwrap();
        assert_ne!(first.new_path, second.new_path);
    }

    #[test]
    fn test_collision_free_path_suffixes() {
        let taken = [PathBuf::from("/d/a.txt"), PathBuf::from("/d/a_1.txt")];
        let is_taken = |p: &Path| taken.iter().any(|t| t == p);

        assert_eq!(collision_free_path(Path::new("/d/b.txt"), is_taken), PathBuf::from("/d/b.txt"));
        assert_eq!(collision_free_path(Path::new("/d/a.txt"), is_taken), PathBuf::from("/d/a_2.txt"));
        assert_eq!(
            collision_free_path(Path::new("/d/README"), |p| p == Path::new("/d/README")),
            PathBuf::from("/d/README_1")
        );
    }

    #[test]
    fn test_entries_serialize() {
        let (temp_dir, mut log) = setup();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();
        let entry = log.delete_file(&file).unwrap();

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"delete\""));
        let parsed: UndoEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
