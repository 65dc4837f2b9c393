// Duplicate detection and similarity clustering
// - Exact duplicates: partition by exact digest
// - Visual duplicates: cluster remaining media by perceptual distance
// - Find Similar: threshold query against every ingested record

use crate::core::record::{ExactDigest, FileRecord, PerceptualDigest};
use crate::core::scanner::ScanMode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Default Hamming distance for visual grouping over a 64-bit digest.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Exact,  // Identical bytes (same exact digest)
    Visual, // Perceptually similar content
}

/// How visual clusters are formed from pairwise matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPolicy {
    /// Connected components: A~B and B~C put A, B, C together even if A and C are far apart.
    #[default]
    Transitive,
    /// Every member is within threshold of the cluster's representative (first by path).
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub kind: GroupKind,
    pub members: Vec<FileRecord>,
}

impl DuplicateGroup {
    /// Build a group with members ordered by descending size, then path.
    pub fn new(kind: GroupKind, mut members: Vec<FileRecord>) -> Self {
        members.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
        Self { kind, members }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.members.iter().any(|m| m.path == path)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Bytes freed if every member but the largest were removed.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.members.iter().skip(1).map(|m| m.size).sum()
    }
}

/// Remove `path` from whichever group holds it, dissolving groups left with
/// fewer than two members. Returns true if a member was removed.
pub fn detach_member(groups: &mut Vec<DuplicateGroup>, path: &Path) -> bool {
    let mut removed = false;
    for group in groups.iter_mut() {
        let before = group.members.len();
        group.members.retain(|m| m.path != path);
        removed |= group.members.len() != before;
    }
    groups.retain(|g| g.members.len() >= 2);
    removed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub record: FileRecord,
    pub distance: u32,
}

/// Streaming grouper: records are ingested one at a time, groups are
/// computed on demand.
pub struct DuplicateDetector {
    mode: ScanMode,
    threshold: u32,
    policy: ClusterPolicy,
    records: Vec<FileRecord>,
    paths: HashSet<PathBuf>,
    by_digest: HashMap<ExactDigest, Vec<usize>>,
}

impl DuplicateDetector {
    pub fn new(mode: ScanMode, threshold: u32, policy: ClusterPolicy) -> Self {
        Self {
            mode,
            threshold,
            policy,
            records: Vec::new(),
            paths: HashSet::new(),
            by_digest: HashMap::new(),
        }
    }

    /// Add a record. Unfingerprintable records and repeated paths are ignored.
    pub fn ingest(&mut self, record: FileRecord) -> bool {
        if !record.is_groupable() || self.paths.contains(&record.path) {
            return false;
        }
        let Some(digest) = record.exact_digest.clone() else {
            return false;
        };

        let index = self.records.len();
        self.paths.insert(record.path.clone());
        self.by_digest.entry(digest).or_default().push(index);
        self.records.push(record);
        true
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn finalize(&self) -> Vec<DuplicateGroup> {
        let mut groups = Vec::new();
        let mut exact_grouped = vec![false; self.records.len()];

        for indices in self.by_digest.values() {
            if indices.len() < 2 {
                continue;
            }
            for &i in indices {
                exact_grouped[i] = true;
            }
            groups.push(DuplicateGroup::new(GroupKind::Exact, self.collect(indices)));
        }

        if self.mode == ScanMode::Visual {
            let mut candidates: Vec<usize> = (0..self.records.len())
                .filter(|&i| !exact_grouped[i] && self.records[i].perceptual_digest.is_some())
                .collect();
            candidates.sort_by(|&a, &b| self.records[a].path.cmp(&self.records[b].path));

            // Digests only compare within the same frame count
            let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for i in candidates {
                if let Some(digest) = &self.records[i].perceptual_digest {
                    buckets.entry(digest.frame_count()).or_default().push(i);
                }
            }

            for bucket in buckets.values() {
                let clusters = match self.policy {
                    ClusterPolicy::Transitive => self.cluster_transitive(bucket),
                    ClusterPolicy::Strict => self.cluster_strict(bucket),
                };
                for cluster in clusters.into_iter().filter(|c| c.len() >= 2) {
                    groups.push(DuplicateGroup::new(GroupKind::Visual, self.collect(&cluster)));
                }
            }
        }

        groups.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.members[0].path.cmp(&b.members[0].path))
        });

        log::debug!(
            "Grouped {} records into {} groups",
            self.records.len(),
            groups.len()
        );
        groups
    }

    /// Every ingested record within threshold of `query`, nearest first.
    /// Records without a perceptual digest match on identical exact digest.
    pub fn find_similar(&self, query: &FileRecord) -> Vec<SimilarMatch> {
        let mut matches: Vec<SimilarMatch> = self
            .records
            .iter()
            .filter(|candidate| candidate.path != query.path)
            .filter_map(|candidate| {
                let distance = match (&query.perceptual_digest, &candidate.perceptual_digest) {
                    (Some(q), Some(c)) => q.distance(c)?,
                    (None, _) => {
                        if query.exact_digest.is_some() && query.exact_digest == candidate.exact_digest {
                            0
                        } else {
                            return None;
                        }
                    }
                    (Some(_), None) => return None,
                };
                (distance <= self.threshold).then(|| SimilarMatch {
                    record: candidate.clone(),
                    distance,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.record.path.cmp(&b.record.path))
        });
        matches
    }

    fn collect(&self, indices: &[usize]) -> Vec<FileRecord> {
        indices.iter().map(|&i| self.records[i].clone()).collect()
    }

    fn digest(&self, index: usize) -> Option<&PerceptualDigest> {
        self.records[index].perceptual_digest.as_ref()
    }

    fn build_tree(&self, indices: &[usize]) -> BkTree {
        let mut tree = BkTree::new();
        for &i in indices {
            if let Some(digest) = self.digest(i) {
                tree.insert(digest.clone(), i);
            }
        }
        tree
    }

    fn neighbours(&self, tree: &BkTree, index: usize) -> Vec<(usize, u32)> {
        self.digest(index)
            .map(|digest| tree.find_within(digest, self.threshold))
            .unwrap_or_default()
    }

    fn cluster_transitive(&self, indices: &[usize]) -> Vec<Vec<usize>> {
        let tree = self.build_tree(indices);
        let mut sets = UnionFind::new(self.records.len());

        for &i in indices {
            for (j, _) in self.neighbours(&tree, i) {
                sets.union(i, j);
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &i in indices {
            components.entry(sets.find(i)).or_default().push(i);
        }
        components.into_values().collect()
    }

    fn cluster_strict(&self, indices: &[usize]) -> Vec<Vec<usize>> {
        let tree = self.build_tree(indices);
        let mut assigned: HashSet<usize> = HashSet::new();
        let mut clusters = Vec::new();

        // `indices` is path-ordered, so representatives are chosen deterministically
        for &representative in indices {
            if assigned.contains(&representative) {
                continue;
            }
            assigned.insert(representative);

            let mut cluster = vec![representative];
            let mut neighbours = self.neighbours(&tree, representative);
            neighbours.sort_unstable();
            for (j, _) in neighbours {
                if assigned.insert(j) {
                    cluster.push(j);
                }
            }
            clusters.push(cluster);
        }
        clusters
    }
}

/// BK-tree over perceptual digests for threshold neighbour queries.
struct BkTree {
    root: Option<BkNode>,
}

struct BkNode {
    digest: PerceptualDigest,
    index: usize,
    children: HashMap<u32, BkNode>,
}

impl BkTree {
    fn new() -> Self {
        Self { root: None }
    }

    fn insert(&mut self, digest: PerceptualDigest, index: usize) {
        match self.root {
            None => {
                self.root = Some(BkNode {
                    digest,
                    index,
                    children: HashMap::new(),
                });
            }
            Some(ref mut root) => Self::insert_into(root, digest, index),
        }
    }

    fn insert_into(node: &mut BkNode, digest: PerceptualDigest, index: usize) {
        let Some(dist) = node.digest.distance(&digest) else {
            return;
        };
        if let Some(child) = node.children.get_mut(&dist) {
            Self::insert_into(child, digest, index);
        } else {
            node.children.insert(
                dist,
                BkNode {
                    digest,
                    index,
                    children: HashMap::new(),
                },
            );
        }
    }

    /// All `(index, distance)` pairs within `max_distance` of `query`.
    fn find_within(&self, query: &PerceptualDigest, max_distance: u32) -> Vec<(usize, u32)> {
        let mut results = Vec::new();
        if let Some(ref root) = self.root {
            Self::search(root, query, max_distance, &mut results);
        }
        results
    }

    fn search(node: &BkNode, query: &PerceptualDigest, max_distance: u32, results: &mut Vec<(usize, u32)>) {
        let Some(dist) = node.digest.distance(query) else {
            return;
        };
        if dist <= max_distance {
            results.push((node.index, dist));
        }
        let low = dist.saturating_sub(max_distance);
        let high = dist.saturating_add(max_distance);
        for (d, child) in &node.children {
            if (low..=high).contains(d) {
                Self::search(child, query, max_distance, results);
            }
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so component roots are stable
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}
