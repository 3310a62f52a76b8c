//! Traversal of ref graphs.
//!
//! All walks use an explicit work-list, so graph depth never grows the call
//! stack. Apart from [`find_missing`] they only follow directly held values
//! and never consult a store; a hash-only ref is counted but not entered.
//! Walks are linear in the number of refs visited: [`total_ref_count`] counts
//! shared subgraphs once per occurrence and is exponential on adversarial
//! DAGs, while the deduplicating walks are linear in distinct cells.

use std::collections::HashSet;

use accord_types::Hash;

use crate::error::DataResult;
use crate::reference::Ref;
use crate::traits::Store;

/// Every distinct ref reachable from `root`, including `root` itself.
pub fn accumulate_ref_set(root: &Ref) -> HashSet<Ref> {
    let mut set = HashSet::new();
    visit_all_refs(root, |r| {
        set.insert(r.clone());
    });
    set
}

/// Visit each distinct ref reachable from `root` once, parents before
/// children and children in encoding order.
pub fn visit_all_refs(root: &Ref, mut visitor: impl FnMut(&Ref)) {
    let mut seen: HashSet<Hash> = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(r) = stack.pop() {
        if !seen.insert(*r.hash()) {
            continue;
        }
        visitor(&r);
        if let Some(value) = r.direct_value() {
            for child in value.child_refs().into_iter().rev() {
                if !seen.contains(child.hash()) {
                    stack.push(child.clone());
                }
            }
        }
    }
}

/// Number of ref occurrences in the tree rooted at `root`, counting `root`
/// and every repeated occurrence of a shared child.
pub fn total_ref_count(root: &Ref) -> u64 {
    let mut count = 0u64;
    let mut stack = vec![root.clone()];
    while let Some(r) = stack.pop() {
        count += 1;
        if let Some(value) = r.direct_value() {
            stack.extend(value.child_refs().into_iter().cloned());
        }
    }
    count
}

/// Number of distinct refs reachable from `root`, including `root`.
pub fn unique_ref_count(root: &Ref) -> usize {
    let mut count = 0;
    visit_all_refs(root, |_| count += 1);
    count
}

/// Summary of the refs reachable from a root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefTreeStats {
    /// Distinct refs visited.
    pub total: usize,
    /// Of those, refs that are embedded.
    pub embedded: usize,
    /// Of those, non-embedded refs already marked persisted.
    pub persisted: usize,
    /// Of those, refs that hold their value directly.
    pub direct: usize,
}

/// Count distinct reachable refs by status.
pub fn ref_tree_stats(root: &Ref) -> RefTreeStats {
    let mut stats = RefTreeStats::default();
    visit_all_refs(root, |r| {
        stats.total += 1;
        if r.is_embedded() {
            stats.embedded += 1;
        } else if r.is_persisted() {
            stats.persisted += 1;
        }
        if r.is_direct() {
            stats.direct += 1;
        }
    });
    stats
}

/// Hashes of cells reachable from `root` that are neither held directly nor
/// present in `store`. Missing cells are not entered, so their own children
/// only show up once the cells themselves arrive. Cells the store holds as
/// persisted are not entered either.
pub fn find_missing(store: &dyn Store, root: &Ref) -> DataResult<Vec<Hash>> {
    let mut missing = Vec::new();
    let mut seen: HashSet<Hash> = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(r) = stack.pop() {
        if !seen.insert(*r.hash()) {
            continue;
        }
        let value = match r.direct_value() {
            Some(value) => value.clone(),
            None => match store.get(r.hash())? {
                // Everything below a persisted cell is already stored.
                Some(stored) if stored.is_persisted() => continue,
                Some(stored) => match stored.direct_value() {
                    Some(value) => value.clone(),
                    None => {
                        missing.push(*r.hash());
                        continue;
                    }
                },
                None => {
                    missing.push(*r.hash());
                    continue;
                }
            },
        };
        for child in value.child_refs().into_iter().rev() {
            if !child.is_embedded() && !seen.contains(child.hash()) {
                stack.push(child.clone());
            }
        }
    }
    Ok(missing)
}
