// 🧩 Cluster Builder - partition a catalog snapshot into duplicate groups
//
// Phase 1 scores every ordered pair (i < j) and keeps the accepted
// candidates. It only reads the snapshot, so it runs on rayon.
// Phase 2 walks the candidate graph sequentially and claims records:
//   Leader     - each unclaimed record collects its later unclaimed matches
//                (star around the leader, NOT transitive closure)
//   Transitive - connected components of the candidate graph

use crate::error::{EngineError, Result};
use crate::matcher::{CandidateMatcher, DuplicateCandidate, MatchKey, MatchOptions};
use crate::record::CatalogRecord;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Greedy single pass, members are similar to the leader
    #[default]
    Leader,

    /// Union-find over all accepted pairs
    Transitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub matching: MatchOptions,

    pub strategy: GroupingStrategy,

    /// Score pairs on the rayon pool
    pub parallel: bool,

    /// Below this many records the serial path is used even when `parallel`
    pub parallel_min_records: usize,

    /// Id pairs an operator marked as "not a duplicate"; order does not matter
    pub dismissed: BTreeSet<(String, String)>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            matching: MatchOptions::default(),
            strategy: GroupingStrategy::Leader,
            parallel: true,
            parallel_min_records: 64,
            dismissed: BTreeSet::new(),
        }
    }
}

impl ScanOptions {
    pub fn with_strategy(mut self, strategy: GroupingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Exclude a pair from matching
    pub fn dismiss(mut self, a: &str, b: &str) -> Self {
        self.dismissed.insert(canonical_pair(a, b));
        self
    }
}

fn canonical_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

// ============================================================================
// DUPLICATE GROUP
// ============================================================================

/// Presentation bucket derived from a group's confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskTier {
    High,
    Medium,
    Low,
}

impl RiskTier {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.90 {
            RiskTier::High
        } else if confidence >= 0.75 {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::High => "High",
            RiskTier::Medium => "Medium",
            RiskTier::Low => "Low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    /// Record whose descriptive fields and id survive a merge
    pub representative: CatalogRecord,

    /// Every other record of the group (never empty)
    pub members: Vec<CatalogRecord>,

    /// Mean confidence of the candidates that formed the group
    pub confidence: f64,

    /// Short explanation
    pub reason: String,

    /// Accepted pairs behind the group
    pub candidates: Vec<DuplicateCandidate>,
}

impl DuplicateGroup {
    /// All ids in the group, representative first
    pub fn member_ids(&self) -> Vec<String> {
        std::iter::once(&self.representative)
            .chain(self.members.iter())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Number of records including the representative. Always at least 2,
    /// a group is only built around an accepted pair.
    pub fn record_count(&self) -> usize {
        self.members.len() + 1
    }

    pub fn contains(&self, id: &str) -> bool {
        self.representative.id == id || self.members.iter().any(|m| m.id == id)
    }

    pub fn record(&self, id: &str) -> Option<&CatalogRecord> {
        std::iter::once(&self.representative)
            .chain(self.members.iter())
            .find(|r| r.id == id)
    }

    pub fn tier(&self) -> RiskTier {
        RiskTier::from_confidence(self.confidence)
    }

    /// Compact badge text: "3 records · 87% · Medium"
    pub fn badge(&self) -> String {
        format!(
            "{} records · {:.0}% · {}",
            self.record_count(),
            self.confidence * 100.0,
            self.tier().as_str()
        )
    }

    /// Long explanation, one line per accepted pair
    pub fn details(&self) -> String {
        self.candidates
            .iter()
            .map(|c| {
                format!(
                    "{} ↔ {} ({:.0}%): {}",
                    c.record_a,
                    c.record_b,
                    c.confidence * 100.0,
                    c.reason()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// CLUSTER BUILDER
// ============================================================================

/// Accepted pair with snapshot positions
#[derive(Debug, Clone)]
struct Edge {
    left: usize,
    right: usize,
    candidate: DuplicateCandidate,
}

pub struct ClusterBuilder {
    matcher: CandidateMatcher,
    options: ScanOptions,
}

impl ClusterBuilder {
    /// Create a builder; malformed thresholds fail here, before any scoring
    pub fn new(options: ScanOptions) -> Result<Self> {
        let matcher = CandidateMatcher::new(options.matching.clone())?;
        Ok(ClusterBuilder { matcher, options })
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Partition `records` into duplicate groups, in leader order
    pub fn build_groups(&self, records: &[CatalogRecord]) -> Result<Vec<DuplicateGroup>> {
        ensure_unique_ids(records)?;

        let edges = self.candidate_edges(records);
        let edge_count = edges.len();

        let groups = match self.options.strategy {
            GroupingStrategy::Leader => leader_groups(records, edges),
            GroupingStrategy::Transitive => transitive_groups(records, edges),
        };

        log::debug!(
            "scan: {} records, {} candidate pairs, {} groups ({:?})",
            records.len(),
            edge_count,
            groups.len(),
            self.options.strategy
        );

        Ok(groups)
    }

    /// Phase 1: every accepted (i, j) with i < j, sorted by (i, j)
    fn candidate_edges(&self, records: &[CatalogRecord]) -> Vec<Edge> {
        let n = records.len();
        let keys: Vec<MatchKey> = records.iter().map(MatchKey::from_record).collect();
        let dismissed: HashSet<(String, String)> = self
            .options
            .dismissed
            .iter()
            .map(|(a, b)| canonical_pair(a, b))
            .collect();

        let row = |i: usize| -> Vec<Edge> {
            ((i + 1)..n)
                .filter(|&j| {
                    dismissed.is_empty()
                        || !dismissed.contains(&canonical_pair(&records[i].id, &records[j].id))
                })
                .filter_map(|j| {
                    self.matcher
                        .evaluate_keys(&records[i], &keys[i], &records[j], &keys[j])
                        .map(|candidate| Edge {
                            left: i,
                            right: j,
                            candidate,
                        })
                })
                .collect()
        };

        let mut edges: Vec<Edge> =
            if self.options.parallel && n >= self.options.parallel_min_records {
                (0..n).into_par_iter().flat_map_iter(row).collect()
            } else {
                (0..n).flat_map(row).collect()
            };

        edges.sort_by_key(|e| (e.left, e.right));
        edges
    }
}

/// Scan a snapshot with the given options
pub fn scan(records: &[CatalogRecord], options: &ScanOptions) -> Result<Vec<DuplicateGroup>> {
    ClusterBuilder::new(options.clone())?.build_groups(records)
}

fn ensure_unique_ids(records: &[CatalogRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(EngineError::validation(format!(
                "snapshot contains record id {} more than once",
                record.id
            )));
        }
    }
    Ok(())
}

/// Phase 2, leader strategy
fn leader_groups(records: &[CatalogRecord], edges: Vec<Edge>) -> Vec<DuplicateGroup> {
    let n = records.len();
    let mut by_leader: Vec<Vec<Edge>> = (0..n).map(|_| Vec::new()).collect();
    for edge in edges {
        by_leader[edge.left].push(edge);
    }

    let mut claimed = vec![false; n];
    let mut groups = Vec::new();

    for leader in 0..n {
        if claimed[leader] {
            continue;
        }

        let accepted: Vec<Edge> = std::mem::take(&mut by_leader[leader])
            .into_iter()
            .filter(|e| !claimed[e.right])
            .collect();
        if accepted.is_empty() {
            continue;
        }

        claimed[leader] = true;
        for edge in &accepted {
            claimed[edge.right] = true;
        }

        let member_indexes: Vec<usize> = accepted.iter().map(|e| e.right).collect();
        groups.push(make_group(records, leader, &member_indexes, accepted));
    }

    groups
}

/// Phase 2, transitive strategy
fn transitive_groups(records: &[CatalogRecord], edges: Vec<Edge>) -> Vec<DuplicateGroup> {
    let mut dsu = DisjointSet::new(records.len());
    for edge in &edges {
        dsu.union(edge.left, edge.right);
    }

    let mut components: HashMap<usize, (Vec<usize>, Vec<Edge>)> = HashMap::new();
    for edge in edges {
        let root = dsu.find(edge.left);
        components.entry(root).or_default().1.push(edge);
    }
    for (root, (indexes, component_edges)) in components.iter_mut() {
        let mut members: BTreeSet<usize> = BTreeSet::new();
        for edge in component_edges.iter() {
            members.insert(edge.left);
            members.insert(edge.right);
        }
        debug_assert!(members.contains(root));
        indexes.extend(members);
    }

    let mut ordered: Vec<(Vec<usize>, Vec<Edge>)> = components.into_values().collect();
    ordered.sort_by_key(|(indexes, _)| indexes[0]);

    ordered
        .into_iter()
        .map(|(indexes, component_edges)| {
            let (representative, rest) = (indexes[0], &indexes[1..]);
            make_group(records, representative, rest, component_edges)
        })
        .collect()
}

fn make_group(
    records: &[CatalogRecord],
    representative: usize,
    member_indexes: &[usize],
    edges: Vec<Edge>,
) -> DuplicateGroup {
    let confidence =
        edges.iter().map(|e| e.candidate.confidence).sum::<f64>() / edges.len() as f64;

    let reason = if member_indexes.len() == 1 {
        edges[0].candidate.reason()
    } else {
        format!("{} potential duplicates", member_indexes.len())
    };

    DuplicateGroup {
        representative: records[representative].clone(),
        members: member_indexes.iter().map(|&i| records[i].clone()).collect(),
        confidence: confidence.clamp(0.0, 1.0),
        reason,
        candidates: edges.into_iter().map(|e| e.candidate).collect(),
    }
}

// ============================================================================
// DISJOINT SET
// ============================================================================

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Union by rank; the smaller index wins ties so roots stay stable
    fn union(&mut self, left: usize, right: usize) {
        let left_root = self.find(left);
        let right_root = self.find(right);
        if left_root == right_root {
            return;
        }

        match self.rank[left_root].cmp(&self.rank[right_root]) {
            std::cmp::Ordering::Less => self.parent[left_root] = right_root,
            std::cmp::Ordering::Greater => self.parent[right_root] = left_root,
            std::cmp::Ordering::Equal => {
                self.parent[right_root] = left_root;
                self.rank[left_root] += 1;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
