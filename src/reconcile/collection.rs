//! Set/List Reconciler
//!
//! Computes the target contents of a collection field from its current
//! contents and the operator's instruction, which is either a full
//! replacement or a list of per-element present/absent tags.

use serde::{Deserialize, Serialize};

// =============================================================================
// Membership Instructions
// =============================================================================

/// Per-element tag in merge mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    #[serde(alias = "present-in-export", alias = "present-in-share", alias = "add")]
    Present,
    #[serde(alias = "absent-in-export", alias = "absent-in-share", alias = "remove")]
    Absent,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Present => "present",
            MemberState::Absent => "absent",
        }
    }
}

/// Whether element order is significant under replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Ordered,
    Unordered,
}

/// A desired element and its tag
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<T> {
    pub item: T,
    pub state: MemberState,
}

impl<T> Tagged<T> {
    pub fn present(item: T) -> Self {
        Self {
            item,
            state: MemberState::Present,
        }
    }

    pub fn absent(item: T) -> Self {
        Self {
            item,
            state: MemberState::Absent,
        }
    }
}

/// What the operator asked for on a collection field
#[derive(Debug, Clone, PartialEq)]
pub enum Members<T> {
    /// Make the collection exactly this (an empty list clears it)
    Replace(Vec<T>),
    /// Add or remove individual elements, keeping the rest
    Merge(Vec<Tagged<T>>),
}

/// Result of reconciling one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<T> {
    pub items: Vec<T>,
    pub changed: bool,
}

impl<T: Clone> Reconciled<T> {
    fn unchanged(current: &[T]) -> Self {
        Self {
            items: current.to_vec(),
            changed: false,
        }
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile `current` against an optional instruction
///
/// `None` means the operator did not touch the field. `key` extracts the
/// identity used to match elements in merge mode; elements with the same key
/// but different content are replaced in place.
pub fn reconcile<T, K, F>(
    current: &[T],
    desired: Option<&Members<T>>,
    sequence: Sequence,
    key: F,
) -> Reconciled<T>
where
    T: Clone + PartialEq,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    match desired {
        None => Reconciled::unchanged(current),
        Some(Members::Replace(items)) => replace(current, Some(items.as_slice()), sequence),
        Some(Members::Merge(entries)) => merge(current, entries, key),
    }
}

/// Full replacement
pub fn replace<T>(current: &[T], desired: Option<&[T]>, sequence: Sequence) -> Reconciled<T>
where
    T: Clone + PartialEq,
{
    let Some(desired) = desired else {
        return Reconciled::unchanged(current);
    };

    let mut items: Vec<T> = Vec::with_capacity(desired.len());
    for item in desired {
        if sequence == Sequence::Ordered || !items.contains(item) {
            items.push(item.clone());
        }
    }

    let same = match sequence {
        Sequence::Ordered => items.as_slice() == current,
        Sequence::Unordered => same_members(current, &items),
    };

    if same {
        Reconciled::unchanged(current)
    } else {
        Reconciled {
            items,
            changed: true,
        }
    }
}

/// Incremental add/remove
pub fn merge<T, K, F>(current: &[T], entries: &[Tagged<T>], key: F) -> Reconciled<T>
where
    T: Clone + PartialEq,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut items: Vec<T> = current.to_vec();

    for entry in entries {
        let wanted = key(&entry.item);
        match entry.state {
            MemberState::Present => {
                match items.iter().position(|existing| key(existing) == wanted) {
                    Some(index) => {
                        if items[index] != entry.item {
                            items[index] = entry.item.clone();
                        }
                    }
                    None => items.push(entry.item.clone()),
                }
            }
            MemberState::Absent => items.retain(|existing| key(existing) != wanted),
        }
    }

    let changed = items.as_slice() != current;
    Reconciled { items, changed }
}

/// Set equality ignoring order and duplicates
pub fn same_members<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}
