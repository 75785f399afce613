use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use ellie_core::{EllieError, Result, TaxonomyNode};

/// Canonical path (slash-joined slugs, root first) of every node.
///
/// A cycle in the parent pointers, a parent outside `nodes`, or two nodes
/// resolving to the same path is a configuration error.
pub fn build_path_index(nodes: &[TaxonomyNode]) -> Result<BTreeMap<String, Uuid>> {
    let by_id: HashMap<Uuid, &TaxonomyNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut resolved: HashMap<Uuid, String> = HashMap::new();

    for node in nodes {
        if resolved.contains_key(&node.id) {
            continue;
        }
        // Walk up until a resolved ancestor or the root.
        let mut chain: Vec<&TaxonomyNode> = Vec::new();
        let mut in_progress: HashSet<Uuid> = HashSet::new();
        let mut cursor = Some(node);
        let mut prefix = None;
        while let Some(current) = cursor {
            if let Some(path) = resolved.get(&current.id) {
                prefix = Some(path.clone());
                break;
            }
            if !in_progress.insert(current.id) {
                return Err(EllieError::Config(format!("taxonomy cycle through node '{}'", current.slug)));
            }
            chain.push(current);
            cursor = match current.parent_id {
                Some(parent) => Some(*by_id.get(&parent).ok_or_else(|| {
                    EllieError::Config(format!("taxonomy node '{}' has unknown parent {}", current.slug, parent))
                })?),
                None => None,
            };
        }

        let mut path = prefix.unwrap_or_default();
        for current in chain.iter().rev() {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(current.slug.trim_matches('/'));
            resolved.insert(current.id, path.clone());
        }
    }

    let mut index = BTreeMap::new();
    for (id, path) in resolved {
        if index.insert(path.clone(), id).is_some() {
            return Err(EllieError::Config(format!("taxonomy path '{path}' names more than one node")));
        }
    }
    Ok(index)
}
