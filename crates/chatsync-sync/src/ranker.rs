//! Completeness policy for choosing which of two same-named records to keep.

use std::cmp::Ordering;

use chatsync_core::Record;

/// Status value that marks an untriaged record; it carries no information.
pub const PLACEHOLDER_STATUS: &str = "New Leads";

/// Ordered tie-break key. Fields compare in declaration order, so the derived
/// `Ord` applies fill count, owner, status and tag count in that precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletenessKey {
    pub fill_count: usize,
    pub has_owner: bool,
    pub informative_status: bool,
    pub tag_count: usize,
}

impl CompletenessKey {
    pub fn of(record: &Record) -> Self {
        Self {
            fill_count: record.fill_count(),
            has_owner: record.has_owner(),
            informative_status: record.status.as_deref().map(str::trim)
                != Some(PLACEHOLDER_STATUS),
            tag_count: record.tag_count(),
        }
    }
}

pub fn completeness_cmp(a: &Record, b: &Record) -> Ordering {
    CompletenessKey::of(a).cmp(&CompletenessKey::of(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranked<'a> {
    pub better: &'a Record,
    pub worse: &'a Record,
}

/// Pick the more informative record. On a full tie `a` is the worse one.
pub fn rank<'a>(a: &'a Record, b: &'a Record) -> Ranked<'a> {
    match completeness_cmp(a, b) {
        Ordering::Greater => Ranked {
            better: a,
            worse: b,
        },
        Ordering::Less | Ordering::Equal => Ranked {
            better: b,
            worse: a,
        },
    }
}
