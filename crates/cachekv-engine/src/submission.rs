//! Pending backend operations awaiting a `SubmitWorker`
//!
//! Design note: a submission is a tagged union of "queued, not yet being
//! worked" and "claimed by a worker, in flight" rather than a shared enum
//! field flipped in place — a worker claiming an item moves it between
//! the two states so two workers can never observe (and retry) the same
//! item concurrently.

use crate::key::{Key, TransId};
use std::collections::{HashMap, VecDeque};

/// What kind of backend operation a submission represents.
#[derive(Debug, Clone)]
pub enum SubmissionKind {
    /// Upload a newly written or modified block.
    Dirty { memfile_backed: bool },
    /// Evict a clean block from local storage after confirming the
    /// backend already has it.
    Evict,
    /// Delete a block both locally and at the backend.
    Delete,
    /// Recompress a block already at the backend with a different method.
    Compress,
}

/// A submission queue entry: either waiting to be claimed, or claimed by
/// a worker and in flight.
#[derive(Debug, Clone)]
pub enum SubmissionItem {
    Queued(SubmissionKind),
    Working(SubmissionKind),
}

impl SubmissionItem {
    pub fn kind(&self) -> &SubmissionKind {
        match self {
            SubmissionItem::Queued(k) | SubmissionItem::Working(k) => k,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self, SubmissionItem::Working(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ItemId {
    transid: TransId,
    key_slot: usize,
}

/// FIFO queue of pending submissions, indexed by `(transid, key)` so a
/// caller can look up or cancel a specific item without a linear scan,
/// plus a fast-path pointer (`memfile_head`) to the front-most
/// memfile-backed dirty entry since those are preferred for eviction
/// under memory pressure.
pub struct SubmissionQueue {
    order: VecDeque<ItemId>,
    items: HashMap<ItemId, SubmissionItem>,
    keys: Vec<Key>,
    key_index: HashMap<(TransId, Key), usize>,
    memfile_head: Option<ItemId>,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            items: HashMap::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
            memfile_head: None,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn slot_for(&mut self, transid: TransId, key: &Key) -> usize {
        if let Some(&slot) = self.key_index.get(&(transid, key.clone())) {
            return slot;
        }
        let slot = self.keys.len();
        self.keys.push(key.clone());
        self.key_index.insert((transid, key.clone()), slot);
        slot
    }

    /// Enqueue a new submission. Replaces any existing queued (but not
    /// in-flight) item for the same `(transid, key)`.
    pub fn push(&mut self, transid: TransId, key: &Key, kind: SubmissionKind) {
        let slot = self.slot_for(transid, key);
        let id = ItemId { transid, key_slot: slot };
        let is_memfile_dirty = matches!(kind, SubmissionKind::Dirty { memfile_backed: true });

        if let Some(existing) = self.items.get(&id) {
            if existing.is_working() {
                // Let the in-flight submission finish; the caller should
                // re-push after it completes if a newer write superseded it.
                return;
            }
        } else {
            self.order.push_back(id);
        }
        self.items.insert(id, SubmissionItem::Queued(kind));
        if is_memfile_dirty && self.memfile_head.is_none() {
            self.memfile_head = Some(id);
        }
    }

    /// Claim the next queued item for a worker, marking it `Working`.
    pub fn claim_next(&mut self) -> Option<(TransId, Key, SubmissionKind)> {
        while let Some(&id) = self.order.front() {
            match self.items.get(&id) {
                Some(SubmissionItem::Queued(kind)) => {
                    let kind = kind.clone();
                    self.items.insert(id, SubmissionItem::Working(kind.clone()));
                    self.order.pop_front();
                    if self.memfile_head == Some(id) {
                        self.memfile_head = None;
                    }
                    let key = self.keys[id.key_slot].clone();
                    return Some((id.transid, key, kind));
                }
                Some(SubmissionItem::Working(_)) => {
                    // Shouldn't normally be at the front while queued order
                    // tracks only queued entries, but guard against it.
                    self.order.pop_front();
                }
                None => {
                    self.order.pop_front();
                }
            }
        }
        None
    }

    /// Mark a claimed item as finished, removing it from the queue entirely.
    pub fn complete(&mut self, transid: TransId, key: &Key) {
        if let Some(&slot) = self.key_index.get(&(transid, key.clone())) {
            let id = ItemId { transid, key_slot: slot };
            self.items.remove(&id);
            self.key_index.remove(&(transid, key.clone()));
        }
    }

    /// Return a claimed item to the queue (e.g. after a retryable failure).
    pub fn requeue(&mut self, transid: TransId, key: &Key) {
        if let Some(&slot) = self.key_index.get(&(transid, key.clone())) {
            let id = ItemId { transid, key_slot: slot };
            if let Some(SubmissionItem::Working(kind)) = self.items.get(&id).cloned() {
                self.items.insert(id, SubmissionItem::Queued(kind));
                self.order.push_back(id);
            }
        }
    }

    /// Fast-path lookup of a memfile-backed dirty entry near the front of
    /// the queue, used when the engine is under memfile pressure and
    /// wants to prioritize draining those first.
    pub fn peek_memfile_head(&self) -> bool {
        self.memfile_head.is_some()
    }

    pub fn contains(&self, transid: TransId, key: &Key) -> bool {
        self.key_index.contains_key(&(transid, key.clone()))
    }
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Key {
        Key::from(vec![n])
    }

    #[test]
    fn push_then_claim_in_fifo_order() {
        let mut q = SubmissionQueue::new();
        q.push(TransId(1), &key(1), SubmissionKind::Dirty { memfile_backed: false });
        q.push(TransId(1), &key(2), SubmissionKind::Evict);

        let (transid, claimed_key, kind) = q.claim_next().unwrap();
        assert_eq!(transid, TransId(1));
        assert_eq!(claimed_key, key(1));
        assert!(matches!(kind, SubmissionKind::Dirty { .. }));

        let (_, claimed_key, kind) = q.claim_next().unwrap();
        assert_eq!(claimed_key, key(2));
        assert!(matches!(kind, SubmissionKind::Evict));
    }

    #[test]
    fn complete_removes_item_entirely() {
        let mut q = SubmissionQueue::new();
        q.push(TransId(1), &key(1), SubmissionKind::Delete);
        q.claim_next();
        assert!(q.contains(TransId(1), &key(1)));
        q.complete(TransId(1), &key(1));
        assert!(!q.contains(TransId(1), &key(1)));
    }

    #[test]
    fn requeue_puts_working_item_back_at_the_end() {
        let mut q = SubmissionQueue::new();
        q.push(TransId(1), &key(1), SubmissionKind::Dirty { memfile_backed: false });
        q.claim_next();
        q.requeue(TransId(1), &key(1));
        assert_eq!(q.len(), 1);
        let (_, k, _) = q.claim_next().unwrap();
        assert_eq!(k, key(1));
    }

    #[test]
    fn push_while_working_does_not_duplicate() {
        let mut q = SubmissionQueue::new();
        q.push(TransId(1), &key(1), SubmissionKind::Dirty { memfile_backed: false });
        q.claim_next();
        q.push(TransId(1), &key(1), SubmissionKind::Dirty { memfile_backed: false });
        assert_eq!(q.len(), 0, "still in flight, not re-queued");
    }

    #[test]
    fn memfile_head_tracks_presence_of_memfile_dirty_entries() {
        let mut q = SubmissionQueue::new();
        assert!(!q.peek_memfile_head());
        q.push(TransId(1), &key(1), SubmissionKind::Dirty { memfile_backed: true });
        assert!(q.peek_memfile_head());
        q.claim_next();
        assert!(!q.peek_memfile_head());
    }
}
