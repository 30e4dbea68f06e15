//! Generic indexed binary heap.
//!
//! An array-backed binary heap that additionally maintains a key → slot index,
//! enabling O(log n) removal and priority update of an arbitrary element by
//! identity. The scheduler's heap-ordered advance strategy uses this to keep
//! started alarms ordered by due time while still supporting `stop`/`remove`
//! on any handle.
//!
//! Ordering is deterministic: ties on priority break on key order (ascending),
//! so equal priorities pop in a stable order on every peer. This matters for
//! the cross-strategy trigger-count equality the scheduler guarantees.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

/// Whether the heap pops the smallest or the largest priority first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum HeapOrder {
    /// Pop the smallest priority first (e.g. earliest due time).
    #[default]
    Min,
    /// Pop the largest priority first (e.g. widest sight radius).
    Max,
}

/// An indexed binary heap over `(key, priority)` pairs.
///
/// Keys are unique identities; pushing an existing key updates its priority
/// in place. Priorities only need `PartialOrd` (due times are floats);
/// incomparable priorities (NaN) compare as equal, falling through to the
/// key tiebreaker.
///
/// # Example
///
/// ```
/// use rampart::{HeapOrder, IndexedHeap};
///
/// let mut heap: IndexedHeap<u64, f64> = IndexedHeap::new(HeapOrder::Min);
/// heap.push(1, 0.5);
/// heap.push(2, 0.25);
/// heap.push(3, 0.75);
///
/// assert_eq!(heap.peek(), Some((&2, &0.25)));
/// assert_eq!(heap.remove(&1), Some(0.5)); // arbitrary removal by identity
/// assert_eq!(heap.pop(), Some((2, 0.25)));
/// assert_eq!(heap.pop(), Some((3, 0.75)));
/// assert!(heap.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct IndexedHeap<K, P>
where
    K: Copy + Eq + Ord + Hash,
    P: PartialOrd,
{
    order: HeapOrder,
    entries: Vec<(K, P)>,
    positions: HashMap<K, usize>,
}

impl<K, P> Default for IndexedHeap<K, P>
where
    K: Copy + Eq + Ord + Hash,
    P: PartialOrd,
{
    fn default() -> Self {
        Self::new(HeapOrder::Min)
    }
}

impl<K, P> IndexedHeap<K, P>
where
    K: Copy + Eq + Ord + Hash,
    P: PartialOrd,
{
    /// Creates an empty heap with the given ordering.
    #[must_use]
    pub fn new(order: HeapOrder) -> Self {
        Self {
            order,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Creates an empty heap with the given ordering and capacity.
    #[must_use]
    pub fn with_capacity(order: HeapOrder, capacity: usize) -> Self {
        Self {
            order,
            entries: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    /// Returns the number of elements in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the heap contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if the heap contains the given key.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Inserts a `(key, priority)` pair, or updates the priority of an
    /// existing key in place.
    pub fn push(&mut self, key: K, priority: P) {
        if let Some(&slot) = self.positions.get(&key) {
            self.entries[slot].1 = priority;
            // The updated priority may need to move either direction.
            let slot = self.sift_up(slot);
            self.sift_down(slot);
            return;
        }
        let slot = self.entries.len();
        self.entries.push((key, priority));
        self.positions.insert(key, slot);
        self.sift_up(slot);
    }

    /// Returns the top element without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.entries.first().map(|(k, p)| (k, p))
    }

    /// Removes and returns the top element.
    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let (key, priority) = self.entries.pop()?;
        self.positions.remove(&key);
        if !self.entries.is_empty() {
            self.positions.insert(self.entries[0].0, 0);
            self.sift_down(0);
        }
        Some((key, priority))
    }

    /// Removes an arbitrary element by identity, returning its priority.
    ///
    /// Returns `None` if the key is not present.
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let slot = self.positions.remove(key)?;
        let last = self.entries.len() - 1;
        if slot == last {
            return self.entries.pop().map(|(_, p)| p);
        }
        self.entries.swap(slot, last);
        let (_, priority) = self.entries.pop()?;
        self.positions.insert(self.entries[slot].0, slot);
        // The swapped-in element may need to move either direction.
        let slot = self.sift_up(slot);
        self.sift_down(slot);
        Some(priority)
    }

    /// Returns the priority associated with a key, if present.
    #[must_use]
    pub fn priority(&self, key: &K) -> Option<&P> {
        self.positions.get(key).map(|&slot| &self.entries[slot].1)
    }

    /// Iterates over the keys currently in the heap, in arbitrary order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Removes all elements.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    // Returns true when the entry at `a` must sort before the entry at `b`.
    fn before(&self, a: usize, b: usize) -> bool {
        let (key_a, pri_a) = &self.entries[a];
        let (key_b, pri_b) = &self.entries[b];
        let by_priority = pri_a.partial_cmp(pri_b).unwrap_or(Ordering::Equal);
        let ordering = match self.order {
            HeapOrder::Min => by_priority,
            HeapOrder::Max => by_priority.reverse(),
        };
        ordering.then_with(|| key_a.cmp(key_b)) == Ordering::Less
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.before(slot, parent) {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = 2 * slot + 2;
            let mut best = slot;
            if left < self.entries.len() && self.before(left, best) {
                best = left;
            }
            if right < self.entries.len() && self.before(right, best) {
                best = right;
            }
            if best == slot {
                break;
            }
            self.swap_slots(slot, best);
            slot = best;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].0, a);
        self.positions.insert(self.entries[b].0, b);
    }
}

// #########
// # TESTS #
// #########
