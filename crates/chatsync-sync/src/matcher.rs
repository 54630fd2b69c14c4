//! Set difference between source chats and store records by identity key.

use std::collections::HashSet;

use chatsync_core::{Record, SourceEntity};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityMatch {
    pub new: Vec<SourceEntity>,
    pub existing: Vec<SourceEntity>,
}

/// Split `entities` into those missing from the store and those already present,
/// keeping input order in both halves.
pub fn partition_entities(store_records: &[Record], entities: &[SourceEntity]) -> IdentityMatch {
    let known = store_records
        .iter()
        .map(Record::identity_key)
        .collect::<HashSet<_>>();

    let mut out = IdentityMatch::default();
    for entity in entities {
        if known.contains(&entity.identity_key()) {
            out.existing.push(entity.clone());
        } else {
            out.new.push(entity.clone());
        }
    }
    out
}

pub fn find_new(store_records: &[Record], entities: &[SourceEntity]) -> Vec<SourceEntity> {
    partition_entities(store_records, entities).new
}
