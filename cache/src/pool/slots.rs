//! The slot arena and the index-linked lists threaded through it.

use super::{metrics::Metrics, Owner, OwnerId, SlotId, Stats};
use crate::Error;
use std::{ops::Range, sync::Arc};
use tracing::{debug, trace, warn};

/// Number of sub-blocks tracked by a slot's wanted mask.
pub(super) const WANTED_BITS: usize = u64::BITS as usize;

/// The list (if any) a slot is currently linked into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Membership {
    /// Locked or wanted. Not eligible for eviction.
    None,
    /// Unowned and ready to be handed to any line.
    Free,
    /// Owned, resident, unlocked, and unwanted. Eligible for eviction.
    Reusable,
    /// Released back to the allocator by `shrink`. Its index may be reused on growth.
    Vacant,
}

/// The residency of a slot's line, as observed by a locker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Residency {
    /// A read of the line is in flight.
    Loading,
    /// The line's bytes are in the slot.
    Resident,
    /// The last read of the line failed and nothing is in flight.
    Failed,
}

/// The result of locking the slot holding a line.
pub(crate) enum Lookup {
    /// The line was already mapped to a slot.
    Hit { slot: SlotId, residency: Residency },
    /// The line was assigned a new slot that must be filled with `buffer`.
    ///
    /// The slot carries two locks: one for the caller and one for the read.
    Miss { slot: SlotId, buffer: Vec<u8> },
}

struct Slot {
    /// The handle whose line occupies this slot.
    owner: Option<Arc<dyn Owner>>,
    /// The line occupying this slot (meaningless when `owner` is `None`).
    line: u64,
    locks: u32,
    wanted: u64,
    /// Pool tick at which the slot was last unlocked or reassigned.
    last_used: u64,
    /// Whether a read into this slot is in flight.
    loading: bool,
    /// The resident bytes of `line`, shared with any views reading them.
    data: Option<Arc<Vec<u8>>>,
    /// A recycled buffer for the next read into this slot.
    spare: Option<Vec<u8>>,
    list: Membership,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn new(line_size: usize) -> Self {
        Self {
            owner: None,
            line: 0,
            locks: 0,
            wanted: 0,
            last_used: 0,
            loading: false,
            data: None,
            spare: Some(Vec::with_capacity(line_size)),
            list: Membership::None,
            prev: None,
            next: None,
        }
    }

    const fn pinned(&self) -> bool {
        self.locks > 0 || self.wanted != 0
    }
}

#[derive(Default)]
struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// An arena of slots, all linked into at most one of two lists:
///
/// - `free`: slots with no owner. Freshly evicted slots are pushed to the head so they are
///   reused before older ones.
/// - `reusable`: owned slots with no locks and no wanted bits, least recently unlocked at the
///   head.
///
/// # Invariants
///
/// - A slot is on `reusable` if and only if it has an owner, resident data, zero locks, and zero
///   wanted bits.
/// - A slot with an owner is mapped by that owner's line table at exactly its `line`, and the
///   owner maps that line to no other slot.
pub(super) struct Slots {
    slots: Vec<Slot>,
    free: List,
    reusable: List,
    /// Indices of slots released by `shrink`.
    vacant: Vec<usize>,
    /// Number of non-vacant slots.
    allocated: usize,
    min: usize,
    max: usize,
    line_size: usize,
    sub_block: usize,
    idle_ticks: u64,
    tick: u64,
    metrics: Metrics,
}

impl Slots {
    /// Return an arena with `min` slots on the free list that may grow to `max` slots.
    pub(super) fn new(
        line_size: usize,
        min: usize,
        max: usize,
        idle_ticks: u64,
        metrics: Metrics,
    ) -> Self {
        let mut arena = Self {
            slots: Vec::with_capacity(min),
            free: List::default(),
            reusable: List::default(),
            vacant: Vec::new(),
            allocated: 0,
            min,
            max,
            line_size,
            sub_block: line_size.div_ceil(WANTED_BITS),
            idle_ticks,
            tick: 0,
            metrics,
        };
        for _ in 0..min {
            let index = arena.grow();
            arena.push_back(Membership::Free, index);
        }
        arena
    }

    /// Return a locked slot assigned to `line` of `owner`.
    ///
    /// Unowned slots are used first, then the least recently unlocked slot is evicted, and only
    /// then does the arena grow.
    pub(super) fn acquire_and_lock(
        &mut self,
        owner: &Arc<dyn Owner>,
        line: u64,
    ) -> Result<SlotId, Error> {
        let index = if let Some(index) = self.pop_front(Membership::Free) {
            index
        } else if let Some(index) = self.pop_front(Membership::Reusable) {
            self.evict(index);
            index
        } else if self.allocated < self.max {
            self.grow()
        } else {
            self.metrics.exhausted.inc();
            warn!(
                owner = owner.id(),
                line,
                slots = self.allocated,
                "cache exhausted"
            );
            return Err(Error::Exhausted(self.allocated));
        };

        let slot = &mut self.slots[index];
        assert!(slot.owner.is_none(), "acquired slot still owned");
        assert_eq!(slot.locks, 0);
        assert_eq!(slot.wanted, 0);
        slot.owner = Some(owner.clone());
        slot.line = line;
        slot.locks = 1;
        slot.last_used = self.tick;
        owner.claim(line, SlotId(index));
        trace!(owner = owner.id(), line, slot = index, "assigned slot");
        Ok(SlotId(index))
    }

    /// Lock the slot holding `line` of `owner`, assigning (and locking for the read) a new one if
    /// the line is not mapped.
    pub(super) fn lookup_and_lock(
        &mut self,
        owner: &Arc<dyn Owner>,
        line: u64,
    ) -> Result<Lookup, Error> {
        if let Some(slot) = owner.lookup(line) {
            self.assert_holds(slot, owner.id(), line);
            self.lock(slot);
            self.metrics.hits.inc();
            let entry = &self.slots[slot.0];
            let residency = if entry.loading {
                Residency::Loading
            } else if entry.data.is_some() {
                Residency::Resident
            } else {
                Residency::Failed
            };
            return Ok(Lookup::Hit { slot, residency });
        }

        let slot = self.acquire_and_lock(owner, line)?;
        let buffer = self.begin_load(slot);
        self.lock(slot);
        self.metrics.misses.inc();
        Ok(Lookup::Miss { slot, buffer })
    }

    /// Lock a slot whose previous read failed for a new read, returning the buffer to read into.
    pub(super) fn retry(&mut self, slot: SlotId) -> Vec<u8> {
        self.lock(slot);
        self.begin_load(slot)
    }

    fn begin_load(&mut self, slot: SlotId) -> Vec<u8> {
        let line_size = self.line_size;
        let entry = &mut self.slots[slot.0];
        assert!(!entry.loading, "slot already loading");
        assert!(entry.data.is_none(), "slot already resident");
        assert!(entry.locks > 0, "loading unlocked slot");
        entry.loading = true;
        let mut buffer = entry
            .spare
            .take()
            .unwrap_or_else(|| Vec::with_capacity(line_size));
        buffer.clear();
        buffer
    }

    /// Store the bytes read into `slot` and release the read's lock.
    pub(super) fn install(&mut self, slot: SlotId, owner: OwnerId, line: u64, buffer: Vec<u8>) {
        self.assert_holds(slot, owner, line);
        let entry = &mut self.slots[slot.0];
        assert!(entry.loading, "installing into idle slot");
        entry.loading = false;
        entry.data = Some(Arc::new(buffer));
        self.unlock(slot);
    }

    /// Record a failed read of `slot` and release the read's lock.
    pub(super) fn fail(&mut self, slot: SlotId, owner: OwnerId, line: u64) {
        self.assert_holds(slot, owner, line);
        let entry = &mut self.slots[slot.0];
        assert!(entry.loading, "failing idle slot");
        entry.loading = false;
        self.unlock(slot);
    }

    /// Return the resident bytes of `slot`, if its read has completed.
    pub(super) fn data(&self, slot: SlotId, owner: OwnerId, line: u64) -> Option<Arc<Vec<u8>>> {
        self.assert_holds(slot, owner, line);
        self.slots[slot.0].data.clone()
    }

    pub(super) fn lock(&mut self, slot: SlotId) {
        let entry = &self.slots[slot.0];
        assert!(entry.owner.is_some(), "locking unowned slot");
        if !entry.pinned() {
            assert_eq!(entry.list, Membership::Reusable);
            self.unlink(slot.0);
        }
        self.slots[slot.0].locks += 1;
    }

    pub(super) fn unlock(&mut self, slot: SlotId) {
        let entry = &mut self.slots[slot.0];
        assert!(entry.locks > 0, "double unlock of slot {}", slot.0);
        entry.locks -= 1;
        entry.last_used = self.tick;
        if !entry.pinned() {
            self.release(slot.0);
        }
    }

    /// Mark the sub-blocks of `slot` covering `range` as wanted.
    pub(super) fn mark_wanted(&mut self, slot: SlotId, range: Range<usize>) {
        let bits = self.mask(range);
        if bits == 0 {
            return;
        }
        let entry = &self.slots[slot.0];
        assert!(entry.owner.is_some(), "marking unowned slot");
        assert!(entry.locks > 0, "marking unlocked slot {}", slot.0);
        self.slots[slot.0].wanted |= bits;
    }

    /// Clear the wanted sub-blocks of `slot` covering `range`.
    pub(super) fn clear_wanted(&mut self, slot: SlotId, range: Range<usize>) {
        let bits = self.mask(range);
        let entry = &mut self.slots[slot.0];
        if bits == 0 || entry.wanted == 0 {
            return;
        }
        entry.wanted &= !bits;
        entry.last_used = self.tick;
        if !entry.pinned() {
            self.release(slot.0);
        }
    }

    /// Clear the wanted sub-blocks covering `range` of the slot holding `line`, if any.
    pub(super) fn clear_wanted_line(
        &mut self,
        owner: &Arc<dyn Owner>,
        line: u64,
        range: Range<usize>,
    ) {
        if let Some(slot) = owner.lookup(line) {
            self.assert_holds(slot, owner.id(), line);
            self.clear_wanted(slot, range);
        }
    }

    /// Evict every unlocked slot of `owner` (or of every owner), dropping any wanted marks.
    ///
    /// Returns whether any slot was skipped because it was locked.
    pub(super) fn evict_all(&mut self, owner: Option<OwnerId>) -> bool {
        let mut skipped = false;
        let mut evicted = 0;
        for index in 0..self.slots.len() {
            let entry = &self.slots[index];
            let Some(current) = &entry.owner else {
                continue;
            };
            if owner.is_some_and(|owner| current.id() != owner) {
                continue;
            }
            if entry.locks > 0 {
                skipped = true;
                continue;
            }
            if entry.list == Membership::Reusable {
                self.unlink(index);
            }
            self.evict(index);
            self.push_front(Membership::Free, index);
            evicted += 1;
        }
        debug!(?owner, evicted, skipped, "evicted all");
        skipped
    }

    /// Release up to `n` idle slots back to the allocator while the arena is above its floor.
    ///
    /// Unowned slots go first, then the least recently unlocked ones. Returns the number of
    /// slots released.
    pub(super) fn shrink(&mut self, n: usize) -> usize {
        let mut released = 0;
        while released < n && self.allocated > self.min {
            let candidate = self
                .free
                .tail
                .filter(|&index| self.idle(index))
                .or_else(|| self.reusable.head.filter(|&index| self.idle(index)));
            let Some(index) = candidate else {
                break;
            };
            self.unlink(index);
            if self.slots[index].owner.is_some() {
                self.evict(index);
            }
            self.vacate(index);
            released += 1;
        }
        if released > 0 {
            debug!(released, allocated = self.allocated, "shrunk pool");
        }
        released
    }

    /// Advance the pool clock.
    pub(super) fn tick(&mut self) {
        self.tick += 1;
    }

    pub(super) const fn allocated(&self) -> usize {
        self.allocated
    }

    pub(super) const fn reusable(&self) -> usize {
        self.reusable.len
    }

    pub(super) fn stats(&self) -> Stats {
        let mut stats = Stats {
            allocated: self.allocated,
            free: self.free.len,
            reusable: self.reusable.len,
            locked: 0,
            wanted: 0,
        };
        for slot in &self.slots {
            if slot.locks > 0 {
                stats.locked += 1;
            }
            if slot.wanted != 0 {
                stats.wanted += 1;
            }
        }
        stats
    }

    /// Convert a byte range within a slot to the wanted bits covering it.
    fn mask(&self, range: Range<usize>) -> u64 {
        if range.is_empty() {
            return 0;
        }
        assert!(range.end <= self.line_size, "range exceeds slot");
        let first = range.start / self.sub_block;
        let last = (range.end - 1) / self.sub_block;
        let width = last - first + 1;
        let ones = if width >= WANTED_BITS {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        ones << first
    }

    fn idle(&self, index: usize) -> bool {
        self.tick.saturating_sub(self.slots[index].last_used) >= self.idle_ticks
    }

    /// Put a slot that just became unpinned back on a list.
    ///
    /// Slots without data (their read failed) or whose owner has closed are evicted straight to
    /// the free list.
    fn release(&mut self, index: usize) {
        let entry = &self.slots[index];
        let closed = entry.owner.as_ref().is_some_and(|owner| owner.is_closed());
        if closed || entry.data.is_none() {
            self.evict(index);
            self.push_front(Membership::Free, index);
        } else {
            self.push_back(Membership::Reusable, index);
        }
    }

    /// Forget the line held by an unlinked, unlocked slot.
    fn evict(&mut self, index: usize) {
        let entry = &mut self.slots[index];
        assert_eq!(entry.locks, 0, "evicting locked slot {index}");
        assert!(!entry.loading, "evicting loading slot {index}");
        assert_eq!(entry.list, Membership::None);
        let Some(owner) = entry.owner.take() else {
            panic!("evicting unowned slot {index}");
        };
        entry.wanted = 0;
        if let Some(data) = entry.data.take() {
            // Views drop their references before unlocking, so the buffer is usually ours again.
            entry.spare = Arc::try_unwrap(data).ok();
        }
        let line = entry.line;
        owner.evict(line, SlotId(index));
        self.metrics.evictions.inc();
        debug!(owner = owner.id(), line, slot = index, "evicted slot");
    }

    fn grow(&mut self) -> usize {
        self.allocated += 1;
        if let Some(index) = self.vacant.pop() {
            let slot = &mut self.slots[index];
            assert_eq!(slot.list, Membership::Vacant);
            *slot = Slot::new(self.line_size);
            return index;
        }
        self.slots.push(Slot::new(self.line_size));
        self.slots.len() - 1
    }

    fn vacate(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        assert!(slot.owner.is_none());
        slot.spare = None;
        slot.last_used = self.tick;
        slot.list = Membership::Vacant;
        self.vacant.push(index);
        self.allocated -= 1;
    }

    fn assert_holds(&self, slot: SlotId, owner: OwnerId, line: u64) {
        let entry = &self.slots[slot.0];
        let holder = entry.owner.as_ref().map(|owner| owner.id());
        assert_eq!(holder, Some(owner), "slot {} owner mismatch", slot.0);
        assert_eq!(entry.line, line, "slot {} line mismatch", slot.0);
    }

    fn list_mut(&mut self, which: Membership) -> &mut List {
        match which {
            Membership::Free => &mut self.free,
            Membership::Reusable => &mut self.reusable,
            Membership::None | Membership::Vacant => unreachable!("not a list"),
        }
    }

    fn push_front(&mut self, which: Membership, index: usize) {
        let head = self.list_mut(which).head;
        let slot = &mut self.slots[index];
        assert_eq!(slot.list, Membership::None);
        slot.list = which;
        slot.prev = None;
        slot.next = head;
        match head {
            Some(head) => self.slots[head].prev = Some(index),
            None => self.list_mut(which).tail = Some(index),
        }
        let list = self.list_mut(which);
        list.head = Some(index);
        list.len += 1;
    }

    fn push_back(&mut self, which: Membership, index: usize) {
        let tail = self.list_mut(which).tail;
        let slot = &mut self.slots[index];
        assert_eq!(slot.list, Membership::None);
        slot.list = which;
        slot.prev = tail;
        slot.next = None;
        match tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.list_mut(which).head = Some(index),
        }
        let list = self.list_mut(which);
        list.tail = Some(index);
        list.len += 1;
    }

    fn pop_front(&mut self, which: Membership) -> Option<usize> {
        let head = self.list_mut(which).head?;
        self.unlink(head);
        Some(head)
    }

    fn unlink(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let which = slot.list;
        let (prev, next) = (slot.prev.take(), slot.next.take());
        slot.list = Membership::None;
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.list_mut(which).head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.list_mut(which).tail = prev,
        }
        self.list_mut(which).len -= 1;
    }

    /// Panic if any arena invariant is broken.
    #[cfg(test)]
    pub(super) fn check(&self) {
        let mut linked = 0;
        for (which, list) in [
            (Membership::Free, &self.free),
            (Membership::Reusable, &self.reusable),
        ] {
            let mut len = 0;
            let mut prev = None;
            let mut cursor = list.head;
            while let Some(index) = cursor {
                let slot = &self.slots[index];
                assert_eq!(slot.list, which);
                assert_eq!(slot.prev, prev);
                prev = Some(index);
                cursor = slot.next;
                len += 1;
            }
            assert_eq!(list.tail, prev);
            assert_eq!(list.len, len);
            linked += len;
        }

        let vacant = self
            .slots
            .iter()
            .filter(|slot| slot.list == Membership::Vacant)
            .count();
        assert_eq!(vacant, self.vacant.len());
        assert_eq!(self.allocated + vacant, self.slots.len());
        assert!(linked <= self.allocated);

        for (index, slot) in self.slots.iter().enumerate() {
            match &slot.owner {
                None => assert!(matches!(slot.list, Membership::Free | Membership::Vacant)),
                Some(owner) => {
                    assert_eq!(owner.lookup(slot.line), Some(SlotId(index)));
                    let reusable = !slot.pinned() && slot.data.is_some();
                    assert_eq!(slot.list == Membership::Reusable, reusable);
                    if slot.pinned() {
                        assert_eq!(slot.list, Membership::None);
                    }
                    if slot.loading {
                        assert!(slot.locks > 0);
                    }
                }
            }
        }
    }
}
