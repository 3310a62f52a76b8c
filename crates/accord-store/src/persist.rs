//! Writing cell graphs to a store.
//!
//! [`persist`] walks a graph iteratively, children before parents, so no
//! parent is ever recorded as persisted before everything it references is
//! retrievable from the same store.

use std::collections::HashSet;

use accord_types::Hash;

use crate::error::{DataError, DataResult};
use crate::reference::{Ref, RefStatus};
use crate::traits::Store;

/// Receives each cell that a persist operation newly adds to a store.
pub trait NoveltyVisitor {
    fn visit(&mut self, novel: &Ref);
}

impl<F: FnMut(&Ref)> NoveltyVisitor for F {
    fn visit(&mut self, novel: &Ref) {
        self(novel)
    }
}

/// Discards novelty.
pub struct IgnoreNovelty;

impl NoveltyVisitor for IgnoreNovelty {
    fn visit(&mut self, _novel: &Ref) {}
}

/// Store `root` and every non-embedded descendant with status `Persisted`.
///
/// `visitor` is called exactly once for each cell that was not previously
/// known to the store, children before parents. Subgraphs the store already
/// records as persisted are not walked again. Fails with
/// [`DataError::MissingData`] if a descendant is neither held directly nor
/// available from the store; cells written before the failure stay written
/// but nothing above the missing cell is marked persisted.
pub fn persist(
    store: &dyn Store,
    root: &Ref,
    visitor: &mut dyn NoveltyVisitor,
) -> DataResult<Ref> {
    if root.is_persisted() && !root.is_embedded() {
        return Ok(root.clone());
    }
    if store.status_of(root.hash())? >= RefStatus::Persisted {
        return root.resolve(store).map(|r| r.with_min_status(RefStatus::Persisted));
    }

    enum Step {
        Enter(Ref),
        Exit(Ref),
    }

    let mut done: HashSet<Hash> = HashSet::new();
    let mut stack = vec![Step::Enter(root.clone())];
    let mut result = None;

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(r) => {
                if done.contains(r.hash()) {
                    continue;
                }
                let is_root = r.hash() == root.hash();
                // Embedded children are inline in their parent, and so are
                // all of their own children.
                if !is_root
                    && (r.is_embedded() || store.status_of(r.hash())? >= RefStatus::Persisted)
                {
                    done.insert(*r.hash());
                    continue;
                }
                let direct = r.to_direct(store)?;
                let value = direct
                    .direct_value()
                    .cloned()
                    .ok_or(DataError::MissingData(*r.hash()))?;
                stack.push(Step::Exit(direct));
                for child in value.child_refs().into_iter().rev() {
                    if !done.contains(child.hash()) {
                        stack.push(Step::Enter(child.clone()));
                    }
                }
            }
            Step::Exit(r) => {
                if !done.insert(*r.hash()) {
                    continue;
                }
                let (stored, novel) = store.put(&r, RefStatus::Persisted)?;
                if novel {
                    visitor.visit(&stored);
                }
                if r.hash() == root.hash() {
                    result = Some(stored);
                }
            }
        }
    }

    result.ok_or(DataError::MissingData(*root.hash()))
}

/// Store only the top cell of `r`, with status `Stored`. Children are not
/// touched and may remain unresolvable.
pub fn persist_shallow(store: &dyn Store, r: &Ref) -> DataResult<Ref> {
    let (stored, _) = store.put(r, RefStatus::Stored)?;
    Ok(stored)
}

/// Persist `root` and collect every newly stored cell, children first.
///
/// The collected novelty is exactly what a peer that already holds
/// everything this store held before needs to resolve `root`.
pub fn announce(store: &dyn Store, root: &Ref) -> DataResult<(Ref, Vec<Ref>)> {
    let mut novelty = Vec::new();
    let persisted = persist(store, root, &mut |r: &Ref| novelty.push(r.clone()))?;
    Ok((persisted, novelty))
}
