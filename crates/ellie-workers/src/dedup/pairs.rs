use std::collections::{BTreeMap, BTreeSet, HashSet};

use ellie_core::{Memory, MemoryId, cosine_similarity};

/// Two near-duplicate memories. Always stored with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPair {
    pub a: MemoryId,
    pub b: MemoryId,
    pub similarity: f32,
}

impl DedupPair {
    pub fn new(x: MemoryId, y: MemoryId, similarity: f32) -> Self {
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Self { a, b, similarity }
    }

    pub fn key(&self) -> (MemoryId, MemoryId) {
        (self.a, self.b)
    }
}

/// All pairs of active, embedded memories at or above `threshold`, ordered by key.
pub fn detect_candidate_pairs(memories: &[Memory], threshold: f32) -> Vec<DedupPair> {
    let eligible: Vec<&Memory> = memories.iter().filter(|m| m.is_active() && m.has_embedding()).collect();
    let mut pairs = Vec::new();
    for (i, left) in eligible.iter().enumerate() {
        let Some(lv) = left.embedding.as_deref() else { continue };
        for right in &eligible[i + 1..] {
            if left.id == right.id {
                continue;
            }
            let Some(rv) = right.embedding.as_deref() else { continue };
            let similarity = cosine_similarity(lv, rv);
            if similarity >= threshold {
                pairs.push(DedupPair::new(left.id, right.id, similarity));
            }
        }
    }
    pairs.sort_by_key(|p| p.key());
    pairs
}

/// Connected components of the pair graph.
///
/// Traversal is an iterative DFS from sorted start nodes with neighbors pushed
/// in reverse order, so nodes are visited in ascending order. Each cluster is
/// sorted and the list is ordered by first member.
pub fn cluster_pairs(pairs: &[DedupPair]) -> Vec<Vec<MemoryId>> {
    let mut adjacency: BTreeMap<MemoryId, BTreeSet<MemoryId>> = BTreeMap::new();
    for p in pairs {
        if p.a == p.b {
            continue;
        }
        adjacency.entry(p.a).or_default().insert(p.b);
        adjacency.entry(p.b).or_default().insert(p.a);
    }

    let mut visited: HashSet<MemoryId> = HashSet::new();
    let mut clusters = Vec::new();
    for &start in adjacency.keys() {
        if visited.contains(&start) {
            continue;
        }
        let mut cluster = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            cluster.push(node);
            if let Some(neighbors) = adjacency.get(&node) {
                stack.extend(neighbors.iter().rev().filter(|n| !visited.contains(*n)).copied());
            }
        }
        cluster.sort();
        clusters.push(cluster);
    }
    clusters.sort_by_key(|c| c.first().copied());
    clusters
}

/// Pairs whose both ends lie inside `cluster`.
pub fn pairs_within<'a>(pairs: &'a [DedupPair], cluster: &[MemoryId]) -> Vec<&'a DedupPair> {
    let members: HashSet<&MemoryId> = cluster.iter().collect();
    pairs
        .iter()
        .filter(|p| members.contains(&p.a) && members.contains(&p.b))
        .collect()
}
