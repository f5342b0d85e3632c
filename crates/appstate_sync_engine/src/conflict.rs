//! Merging remote mutations with unacknowledged local ones.
//!
//! For an index present on both sides the greater timestamp wins; on a tie
//! the remote mutation wins. Remote winners keep their arrival order.

use appstate_protocol::{Mutation, MutationIndex};
use std::collections::{HashMap, HashSet};

/// Which side won for a position in the merged list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<R> {
    /// A remote mutation to dispatch.
    Remote(R),
    /// A local mutation (position in the local slice) that beat the remote
    /// one at this index, or had no remote counterpart.
    Local(usize),
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<R> {
    /// Merged list: remote arrival order, then local-only mutations in
    /// queue order.
    pub merged: Vec<Resolved<R>>,
    /// Local positions that lost to a remote mutation.
    pub superseded_local: Vec<usize>,
    /// Number of remote mutations that lost to a local one.
    pub discarded_remote: usize,
}

impl<R> Resolution<R> {
    /// Number of index collisions that were decided.
    pub fn conflicts(&self) -> usize {
        self.superseded_local.len() + self.discarded_remote
    }

    /// Remote winners in arrival order.
    pub fn into_remote(self) -> Vec<R> {
        self.merged
            .into_iter()
            .filter_map(|r| match r {
                Resolved::Remote(m) => Some(m),
                Resolved::Local(_) => None,
            })
            .collect()
    }
}

/// Resolves `remote` against `local`.
///
/// A remote mutation survives iff no local mutation at its index is strictly
/// newer. A local mutation survives iff every remote mutation at its index is
/// strictly older.
pub fn resolve<R, L>(remote: Vec<R>, local: &[L]) -> Resolution<R>
where
    R: AsRef<Mutation>,
    L: AsRef<Mutation>,
{
    let mut local_by_index: HashMap<&MutationIndex, (usize, u64)> = HashMap::new();
    for (pos, m) in local.iter().enumerate() {
        let m = m.as_ref();
        local_by_index.insert(&m.index, (pos, m.timestamp()));
    }

    let mut newest_remote: HashMap<MutationIndex, u64> = HashMap::new();
    for m in &remote {
        let m = m.as_ref();
        if local_by_index.contains_key(&m.index) {
            let ts = newest_remote.entry(m.index.clone()).or_insert(0);
            *ts = (*ts).max(m.timestamp());
        }
    }

    let superseded: HashSet<usize> = local_by_index
        .values()
        .filter(|(pos, ts)| {
            let index = &local[*pos].as_ref().index;
            newest_remote.get(index).is_some_and(|remote_ts| remote_ts >= ts)
        })
        .map(|(pos, _)| *pos)
        .collect();

    let mut merged = Vec::with_capacity(remote.len());
    let mut emitted_local = HashSet::new();
    let mut discarded_remote = 0;

    for m in remote {
        match local_by_index.get(&m.as_ref().index) {
            Some(&(pos, local_ts)) if local_ts > m.as_ref().timestamp() => {
                discarded_remote += 1;
                if !superseded.contains(&pos) && emitted_local.insert(pos) {
                    merged.push(Resolved::Local(pos));
                }
            }
            _ => merged.push(Resolved::Remote(m)),
        }
    }

    for (pos, _) in local.iter().enumerate() {
        let live = local_by_index
            .get(&local[pos].as_ref().index)
            .is_some_and(|(p, _)| *p == pos);
        if live && !superseded.contains(&pos) && !emitted_local.contains(&pos) {
            merged.push(Resolved::Local(pos));
        }
    }

    let mut superseded_local: Vec<usize> = superseded.into_iter().collect();
    superseded_local.sort_unstable();

    Resolution {
        merged,
        superseded_local,
        discarded_remote,
    }
}
