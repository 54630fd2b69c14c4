//! Single-pass duplicate detection over the full store record collection.

use std::collections::HashMap;

use chatsync_core::Record;
use serde::Serialize;

use crate::ranker::rank;

/// Records sharing one identity key: the survivor and everything it superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub identity_key: String,
    pub kept: Record,
    pub superseded: Vec<Record>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateResolution {
    /// One record per identity key, in first-seen order.
    pub survivors: Vec<Record>,
    /// Records to archive, in the order they lost.
    pub losers: Vec<Record>,
}

impl DuplicateResolution {
    /// Group the losers under the survivor that finally outranked them.
    pub fn groups(&self) -> Vec<DuplicateGroup> {
        let mut groups = self
            .survivors
            .iter()
            .map(|kept| DuplicateGroup {
                identity_key: kept.identity_key(),
                kept: kept.clone(),
                superseded: Vec::new(),
            })
            .collect::<Vec<_>>();
        let index = groups
            .iter()
            .enumerate()
            .map(|(i, group)| (group.identity_key.clone(), i))
            .collect::<HashMap<_, _>>();
        for loser in &self.losers {
            if let Some(&i) = index.get(&loser.identity_key()) {
                groups[i].superseded.push(loser.clone());
            }
        }
        groups.retain(|group| !group.superseded.is_empty());
        groups
    }
}

pub fn resolve_duplicates(records: &[Record]) -> DuplicateResolution {
    let mut best_by_key: HashMap<String, usize> = HashMap::new();
    let mut out = DuplicateResolution::default();

    for record in records {
        let key = record.identity_key();
        match best_by_key.get(&key) {
            None => {
                best_by_key.insert(key, out.survivors.len());
                out.survivors.push(record.clone());
            }
            Some(&slot) => {
                let ranked = rank(&out.survivors[slot], record);
                let (better, worse) = (ranked.better.clone(), ranked.worse.clone());
                out.losers.push(worse);
                out.survivors[slot] = better;
            }
        }
    }
    out
}

/// Records that should be archived because a more complete same-named record exists.
pub fn find_duplicates(records: &[Record]) -> Vec<Record> {
    resolve_duplicates(records).losers
}
