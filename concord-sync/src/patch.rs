//! Patch history of one document.
//!
//! Patches are totally ordered by `(time, user_id)`; a patch may carry a
//! snapshot of the full content at that point. Content at any point of the
//! history is the [`fold`] of the nearest snapshot and every later patch.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentError};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a patch in the history. Orders by time, then user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchId {
    pub time: Timestamp,
    pub user_id: u32,
}

impl PatchId {
    pub fn new(time: u64, user_id: u32) -> Self {
        Self {
            time: Timestamp(time),
            user_id,
        }
    }

    /// Largest id at `time`, used as an inclusive upper bound.
    fn last_at(time: Timestamp) -> Self {
        Self {
            time,
            user_id: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patch<P> {
    pub id: PatchId,
    pub patch: P,
    pub snapshot: Option<String>,
}

/// Apply `patches` to `base` in iteration order.
pub fn fold<'a, D, I>(base: D, patches: I) -> D
where
    D: Document,
    I: IntoIterator<Item = &'a Patch<D::Patch>>,
{
    patches
        .into_iter()
        .fold(base, |content, patch| content.apply_patch(&patch.patch))
}

/// Append-only, totally ordered history.
#[derive(Debug, Clone)]
pub struct PatchLog<P> {
    patches: BTreeMap<PatchId, Patch<P>>,
}

impl<P> Default for PatchLog<P> {
    fn default() -> Self {
        Self {
            patches: BTreeMap::new(),
        }
    }
}

impl<P: Clone> PatchLog<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a patch. An id already present keeps its payload; only a missing
    /// snapshot is filled in. Returns whether the log changed.
    pub fn insert(&mut self, patch: Patch<P>) -> bool {
        match self.patches.get_mut(&patch.id) {
            Some(existing) => {
                if existing.snapshot.is_none() && patch.snapshot.is_some() {
                    existing.snapshot = patch.snapshot;
                    true
                } else {
                    false
                }
            }
            None => {
                self.patches.insert(patch.id, patch);
                true
            }
        }
    }

    /// Attach a snapshot to an existing patch.
    pub fn set_snapshot(&mut self, id: &PatchId, snapshot: String) -> bool {
        match self.patches.get_mut(id) {
            Some(patch) if patch.snapshot.is_none() => {
                patch.snapshot = Some(snapshot);
                true
            }
            _ => false,
        }
    }

    /// Drop a patch that was never accepted upstream.
    pub fn remove(&mut self, id: &PatchId) -> Option<Patch<P>> {
        self.patches.remove(id)
    }

    pub fn get(&self, id: &PatchId) -> Option<&Patch<P>> {
        self.patches.get(id)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn ids(&self) -> Vec<PatchId> {
        self.patches.keys().copied().collect()
    }

    pub fn latest(&self) -> Option<PatchId> {
        self.patches.keys().next_back().copied()
    }

    /// The newest patch carrying a snapshot, at or before `upto`.
    pub fn nearest_snapshot(&self, upto: Option<PatchId>) -> Option<&Patch<P>> {
        let bound = upto.unwrap_or(PatchId::last_at(Timestamp(u64::MAX)));
        self.patches
            .range(..=bound)
            .rev()
            .find(|(_, patch)| patch.snapshot.is_some())
            .map(|(_, patch)| patch)
    }

    /// Patches after the newest snapshot.
    pub fn since_snapshot(&self) -> usize {
        match self.nearest_snapshot(None) {
            Some(snapshot) => self.patches.range(snapshot.id..).count() - 1,
            None => self.patches.len(),
        }
    }

    /// Content after every patch with `time <= upto` (all patches for `None`).
    pub fn content<D>(&self, options: &D::Options, upto: Option<Timestamp>) -> Result<D, DocumentError>
    where
        D: Document<Patch = P>,
    {
        let bound = upto.map(PatchId::last_at);
        match self.nearest_snapshot(bound) {
            Some(snapshot) => {
                let text = snapshot.snapshot.as_deref().unwrap_or_default();
                let base = D::from_str(text, options)?;
                let after = self
                    .patches
                    .range(snapshot.id..)
                    .skip(1)
                    .map(|(_, patch)| patch)
                    .take_while(|patch| bound.map_or(true, |b| patch.id <= b));
                Ok(fold(base, after))
            }
            None => {
                let patches = self
                    .patches
                    .values()
                    .take_while(|patch| bound.map_or(true, |b| patch.id <= b));
                Ok(fold(D::empty(options), patches))
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch<P>> {
        self.patches.values()
    }
}
