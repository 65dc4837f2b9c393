use crate::core::duplicate::DuplicateGroup;
use crate::core::record::FileRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;

/// One comparator in the Smart Select ordering. `Ordering::Less` means the
/// first record is the better keeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    LargerSize,
    NewerModified,
    ShorterPath,
}

impl SelectionRule {
    pub fn compare(self, a: &FileRecord, b: &FileRecord) -> Ordering {
        match self {
            SelectionRule::LargerSize => b.size.cmp(&a.size),
            SelectionRule::NewerModified => b.modified.cmp(&a.modified),
            SelectionRule::ShorterPath => path_len(a).cmp(&path_len(b)),
        }
    }
}

fn path_len(record: &FileRecord) -> usize {
    record.path.as_os_str().len()
}

pub const DEFAULT_RULES: [SelectionRule; 3] = [
    SelectionRule::LargerSize,
    SelectionRule::NewerModified,
    SelectionRule::ShorterPath,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMember {
    pub record: FileRecord,
    /// Higher is a better keeper; the top member scores `len - 1`, the last 0
    pub keep_score: usize,
}

/// Advisory keep/discard split for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub keep: PathBuf,
    pub discard: Vec<PathBuf>,
}

pub struct ScoringService {
    rules: Vec<SelectionRule>,
}

impl ScoringService {
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }

    pub fn with_rules(rules: Vec<SelectionRule>) -> Self {
        Self { rules }
    }

    /// Order group members best keeper first. Rules apply lexicographically,
    /// with the full path as the final tie-break.
    pub fn rank(&self, group: &DuplicateGroup) -> Vec<RankedMember> {
        let mut members: Vec<&FileRecord> = group.members.iter().collect();
        members.sort_by(|a, b| self.compare(a, b));

        let count = members.len();
        members
            .into_iter()
            .enumerate()
            .map(|(i, record)| RankedMember {
                record: record.clone(),
                keep_score: count - 1 - i,
            })
            .collect()
    }

    pub fn select(&self, group: &DuplicateGroup) -> Option<Selection> {
        let mut ranked = self.rank(group).into_iter();
        let keep = ranked.next()?.record.path;
        Some(Selection {
            keep,
            discard: ranked.map(|member| member.record.path).collect(),
        })
    }

    fn compare(&self, a: &FileRecord, b: &FileRecord) -> Ordering {
        self.rules
            .iter()
            .map(|rule| rule.compare(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.path.cmp(&b.path))
    }
}

impl Default for ScoringService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::duplicate::GroupKind;
    use crate::core::record::{ExactDigest, MediaKind, RecordStatus};
    use chrono::{DateTime, TimeZone, Utc};

    fn record(path: &str, size: u64, modified: DateTime<Utc>) -> FileRecord {
        FileRecord {
            path: PathBuf::from(path),
            size,
            modified,
            exact_digest: Some(ExactDigest("d".to_string())),
            perceptual_digest: None,
            media_kind: MediaKind::Other,
            status: RecordStatus::Fingerprinted,
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_larger_size_wins() {
        let group = DuplicateGroup::new(
            GroupKind::Visual,
            vec![record("/a/small.jpg", 10, day(5)), record("/a/large.jpg", 99, day(1))],
        );

        let selection = ScoringService::new().select(&group).unwrap();
        assert_eq!(selection.keep, PathBuf::from("/a/large.jpg"));
        assert_eq!(selection.discard, vec![PathBuf::from("/a/small.jpg")]);
    }

    #[test]
    fn test_newer_then_shorter_path_break_ties() {
        let group = DuplicateGroup::new(
            GroupKind::Exact,
            vec![
                record("/photos/deep/nested/copy.jpg", 10, day(9)),
                record("/photos/old.jpg", 10, day(1)),
                record("/photos/new.jpg", 10, day(9)),
            ],
        );

        let ranked = ScoringService::new().rank(&group);
        let order: Vec<&str> = ranked.iter().map(|m| m.record.path.to_str().unwrap()).collect();
        assert_eq!(
            order,
            vec!["/photos/new.jpg", "/photos/deep/nested/copy.jpg", "/photos/old.jpg"]
        );
        assert_eq!(ranked[0].keep_score, 2);
        assert_eq!(ranked[2].keep_score, 0);
    }

    #[test]
    fn test_full_path_is_final_tiebreak() {
        let group = DuplicateGroup::new(
            GroupKind::Exact,
            vec![record("/x/b.jpg", 1, day(1)), record("/x/a.jpg", 1, day(1))],
        );

        let selection = ScoringService::new().select(&group).unwrap();
        assert_eq!(selection.keep, PathBuf::from("/x/a.jpg"));
    }

    #[test]
    fn test_rank_is_independent_of_member_order() {
        let members = vec![
            record("/r/1.jpg", 5, day(2)),
            record("/r/22.jpg", 5, day(2)),
            record("/r/3.jpg", 7, day(1)),
        ];
        let mut reversed = members.clone();
        reversed.reverse();

        let service = ScoringService::new();
        let a = service.rank(&DuplicateGroup { kind: GroupKind::Exact, members });
        let b = service.rank(&DuplicateGroup { kind: GroupKind::Exact, members: reversed });
        assert_eq!(a, b);
    }

    #[test]
    fn test_custom_rule_order() {
        let group = DuplicateGroup::new(
            GroupKind::Exact,
            vec![record("/r/big.jpg", 100, day(1)), record("/r/newer.jpg", 1, day(2))],
        );

        let service = ScoringService::with_rules(vec![SelectionRule::NewerModified]);
        assert_eq!(service.select(&group).unwrap().keep, PathBuf::from("/r/newer.jpg"));
    }

    #[test]
    fn test_empty_group_has_no_selection() {
        let group = DuplicateGroup { kind: GroupKind::Exact, members: Vec::new() };
        assert!(ScoringService::new().select(&group).is_none());
    }
}
