//! Hash-check admission queue.
//!
//! # Design
//! - FIFO of discovered content ids plus a side-table holding each queued
//!   descriptor; the single `current` slot is the one verification allowed to
//!   run.
//! - Every operation is a pure data-structure edit and a no-op when the id is
//!   unknown, so callers never handle queue errors.

use std::collections::{HashMap, VecDeque};

use driftwood_core::{ContentId, Descriptor};

/// Where an id was found when it was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The id was waiting and has been dropped.
    WasQueued,
    /// The id held the current slot, which is now empty.
    WasCurrent,
    /// The id was not known to the queue.
    Absent,
}

/// Single-flight admission for verification work.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    queue: VecDeque<ContentId>,
    pending: HashMap<ContentId, Descriptor>,
    current: Option<ContentId>,
}

impl AdmissionQueue {
    /// Empty queue with no current job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` unless it is already queued or current.
    pub fn push(&mut self, id: ContentId, descriptor: Descriptor) -> bool {
        if self.current == Some(id) || self.pending.contains_key(&id) {
            return false;
        }
        self.queue.push_back(id);
        self.pending.insert(id, descriptor);
        true
    }

    /// Pop the head of the queue into the current slot. Returns `None` while a
    /// job is current or nothing is queued.
    pub fn next_admission(&mut self) -> Option<(ContentId, Descriptor)> {
        if self.current.is_some() {
            return None;
        }
        while let Some(id) = self.queue.pop_front() {
            if let Some(descriptor) = self.pending.remove(&id) {
                self.current = Some(id);
                return Some((id, descriptor));
            }
        }
        None
    }

    /// Clear the current slot if it holds `id`.
    pub fn finish(&mut self, id: ContentId) -> bool {
        if self.current == Some(id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Drop `id` from wherever it sits.
    pub fn remove(&mut self, id: ContentId) -> Removal {
        if self.current == Some(id) {
            self.current = None;
            return Removal::WasCurrent;
        }
        if self.pending.remove(&id).is_some() {
            self.queue.retain(|queued| *queued != id);
            return Removal::WasQueued;
        }
        Removal::Absent
    }

    /// Id currently admitted for verification.
    #[must_use]
    pub const fn current(&self) -> Option<ContentId> {
        self.current
    }

    /// Whether `id` is waiting for admission.
    #[must_use]
    pub fn is_queued(&self, id: ContentId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Ids waiting for admission, head first.
    pub fn queued(&self) -> impl Iterator<Item = ContentId> + '_ {
        self.queue.iter().copied()
    }

    /// Number of ids waiting for admission.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue and side-table hold the same ids and `current` is not queued.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.queue.len() == self.pending.len()
            && self.queue.iter().all(|id| self.pending.contains_key(id))
            && self
                .current
                .is_none_or(|current| !self.pending.contains_key(&current))
    }
}
