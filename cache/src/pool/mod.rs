//! A bounded pool of fixed-size memory slots shared by many files.
//!
//! The pool is the only place eviction decisions are made. Each slot records which line of which
//! [Owner] occupies it, how many lockers reference it, and which of its sub-blocks are _wanted_
//! (see [PoolRef::mark_wanted]). Unlocked, unwanted slots sit on an LRU-ordered reusable list and
//! are reassigned, least recently unlocked first, when a new line needs a slot.
//!
//! # Consistency
//!
//! An owner's line table and the pool's record of which line occupies each slot always agree. The
//! pool updates both sides while holding its mutex: it calls [Owner::claim] when assigning a slot
//! and [Owner::evict] when taking one away, and it only consults [Owner::lookup] while holding the
//! same mutex.
//!
//! # Sizing
//!
//! The pool starts with `min_slots` slots and grows lazily, one slot at a time, up to `max_slots`
//! when every existing slot is locked or wanted. Slots above the floor that have been idle for
//! `idle_ticks` [PoolRef::tick]s are released back to the allocator by [PoolRef::shrink].

use crate::{Error, Priority};
use prometheus_client::registry::Registry;
use std::{
    num::NonZeroUsize,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

mod metrics;
pub use metrics::Metrics;
mod slots;
pub(crate) use slots::{Lookup, Residency};
use slots::Slots;

/// Identifies one [Owner] registered with a pool.
pub type OwnerId = u64;

/// Identifies one slot of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// The index of the slot in the pool's arena.
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// A line table that the pool keeps consistent with its slots.
///
/// Every method is called while the pool's mutex is held, so implementations must not call back
/// into the pool.
pub trait Owner: Send + Sync {
    /// A unique id obtained from [PoolRef::next_id].
    fn id(&self) -> OwnerId;

    /// Return the slot currently holding `line`, if any.
    fn lookup(&self, line: u64) -> Option<SlotId>;

    /// Record that `slot` now holds `line`.
    fn claim(&self, line: u64, slot: SlotId);

    /// Forget that `slot` holds `line`.
    fn evict(&self, line: u64, slot: SlotId);

    /// Whether the owner has been torn down. Slots of a closed owner are evicted as soon as they
    /// are unlocked.
    fn is_closed(&self) -> bool;
}

/// Configuration for a [PoolRef].
#[derive(Clone, Debug)]
pub struct Config {
    /// The size of every line and slot in bytes.
    pub line_size: NonZeroUsize,

    /// The number of slots allocated up front, below which the pool never shrinks.
    pub min_slots: usize,

    /// The maximum number of slots the pool may grow to.
    pub max_slots: NonZeroUsize,

    /// The number of ticks an unlocked slot must sit idle before [PoolRef::shrink] may release
    /// it.
    pub idle_ticks: u64,

    /// The maximum number of slots released by an opportunistic shrink.
    pub shrink_batch: usize,

    /// The priority of reads issued by handles using the pool.
    pub priority: Priority,
}

const fn nz(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(value) => value,
        None => panic!("value must be non-zero"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line_size: nz(64 * 1024),
            min_slots: 64,
            max_slots: nz(256),
            idle_ticks: 60,
            shrink_batch: 8,
            priority: Priority::Normal,
        }
    }
}

/// A snapshot of the slots of a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Slots currently allocated.
    pub allocated: usize,
    /// Slots not holding any line.
    pub free: usize,
    /// Slots holding a line that are eligible for eviction.
    pub reusable: usize,
    /// Slots with at least one lock.
    pub locked: usize,
    /// Slots with at least one wanted sub-block.
    pub wanted: usize,
}

/// A reference to a slot pool that can be shared across threads via cloning.
///
/// All slot state lives behind a single mutex that is only ever held for constant-time list
/// operations (never across I/O).
#[derive(Clone)]
pub struct PoolRef {
    line_size: usize,
    priority: Priority,
    shrink_batch: usize,
    next_id: Arc<AtomicU64>,
    metrics: Metrics,
    slots: Arc<Mutex<Slots>>,
}

impl PoolRef {
    /// Returns a new [PoolRef] with `cfg.min_slots` slots allocated.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        if cfg.min_slots > cfg.max_slots.get() {
            return Err(Error::InvalidConfig("min_slots exceeds max_slots"));
        }
        let metrics = Metrics::default();
        let slots = Slots::new(
            cfg.line_size.get(),
            cfg.min_slots,
            cfg.max_slots.get(),
            cfg.idle_ticks,
            metrics.clone(),
        );
        metrics.slots.set(cfg.min_slots as i64);
        Ok(Self {
            line_size: cfg.line_size.get(),
            priority: cfg.priority,
            shrink_batch: cfg.shrink_batch,
            next_id: Arc::new(AtomicU64::new(0)),
            metrics,
            slots: Arc::new(Mutex::new(slots)),
        })
    }

    /// Register the pool's metrics in the provided registry.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// The size of every line and slot in bytes.
    #[inline]
    pub const fn line_size(&self) -> usize {
        self.line_size
    }

    /// The priority of reads issued by handles using this pool.
    #[inline]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns a unique id for the next [Owner] that will use this pool.
    pub fn next_id(&self) -> OwnerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Convert an offset into the line it belongs to and the offset within that line.
    pub const fn offset_to_line(&self, offset: u64) -> (u64, usize) {
        let line_size = self.line_size as u64;
        (offset / line_size, (offset % line_size) as usize)
    }

    /// Return a slot assigned to `line` of `owner` with a lock count of 1.
    ///
    /// An unlocked slot may be evicted from its current owner to satisfy the request. Fails with
    /// [Error::Exhausted] if the pool is at capacity and every slot is locked or wanted.
    pub fn acquire_and_lock(&self, owner: &Arc<dyn Owner>, line: u64) -> Result<SlotId, Error> {
        self.with(|slots| slots.acquire_and_lock(owner, line))
    }

    /// Increment the lock count of an owned slot.
    pub fn lock(&self, slot: SlotId) {
        self.with(|slots| slots.lock(slot))
    }

    /// Decrement the lock count of a slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not locked.
    pub fn unlock(&self, slot: SlotId) {
        self.with(|slots| slots.unlock(slot))
    }

    /// Mark the sub-blocks of `slot` covering the byte `range` as wanted, exempting the slot from
    /// eviction even when it is not locked.
    ///
    /// The caller must hold a lock on `slot`.
    pub fn mark_wanted(&self, slot: SlotId, range: Range<usize>) {
        self.with(|slots| slots.mark_wanted(slot, range))
    }

    /// Clear the wanted sub-blocks covering the byte `range` of the slot holding `line` of
    /// `owner`. Does nothing if the line is no longer mapped.
    pub fn clear_wanted(&self, owner: &Arc<dyn Owner>, line: u64, range: Range<usize>) {
        self.with(|slots| slots.clear_wanted_line(owner, line, range))
    }

    /// Evict every unlocked slot belonging to `owner`, or every unlocked slot if no owner is
    /// provided. Wanted marks do not protect a slot from this.
    ///
    /// Returns whether any slot was skipped because it was locked.
    pub fn evict_all(&self, owner: Option<OwnerId>) -> bool {
        self.with(|slots| slots.evict_all(owner))
    }

    /// Release up to `n` idle, unlocked, unwanted slots back to the allocator, never going below
    /// the configured floor. Returns the number of slots released.
    pub fn shrink(&self, n: usize) -> usize {
        self.with(|slots| slots.shrink(n))
    }

    /// Advance the pool clock and opportunistically shrink the pool.
    pub fn tick(&self) -> usize {
        let batch = self.shrink_batch;
        self.with(|slots| {
            slots.tick();
            slots.shrink(batch)
        })
    }

    /// Returns a snapshot of the pool's slots.
    pub fn stats(&self) -> Stats {
        self.with(|slots| slots.stats())
    }

    pub(crate) const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn shrink_batch(&self) -> usize {
        self.shrink_batch
    }

    pub(crate) fn lookup_and_lock(
        &self,
        owner: &Arc<dyn Owner>,
        line: u64,
    ) -> Result<Lookup, Error> {
        self.with(|slots| slots.lookup_and_lock(owner, line))
    }

    pub(crate) fn retry(&self, slot: SlotId) -> Vec<u8> {
        self.with(|slots| slots.retry(slot))
    }

    pub(crate) fn install(&self, slot: SlotId, owner: OwnerId, line: u64, buffer: Vec<u8>) {
        self.with(|slots| slots.install(slot, owner, line, buffer))
    }

    pub(crate) fn fail(&self, slot: SlotId, owner: OwnerId, line: u64) {
        self.with(|slots| slots.fail(slot, owner, line))
    }

    pub(crate) fn data(&self, slot: SlotId, owner: OwnerId, line: u64) -> Option<Arc<Vec<u8>>> {
        self.with(|slots| slots.data(slot, owner, line))
    }

    /// Unlock every slot in `releases`, first clearing the wanted sub-blocks of any that carry a
    /// range.
    pub(crate) fn release(&self, releases: impl IntoIterator<Item = (SlotId, Option<Range<usize>>)>) {
        self.with(|slots| {
            for (slot, wanted) in releases {
                if let Some(range) = wanted {
                    slots.clear_wanted(slot, range);
                }
                slots.unlock(slot);
            }
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut Slots) -> R) -> R {
        let mut slots = self.slots.lock().unwrap();
        let result = f(&mut slots);
        self.metrics.slots.set(slots.allocated() as i64);
        self.metrics.reusable.set(slots.reusable() as i64);
        result
    }

    #[cfg(test)]
    pub(crate) fn check(&self) {
        self.slots.lock().unwrap().check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{
        collections::HashMap,
        sync::atomic::AtomicBool,
    };

    /// A minimal line table.
    struct Table {
        id: OwnerId,
        lines: Mutex<HashMap<u64, SlotId>>,
        closed: AtomicBool,
    }

    impl Table {
        fn new(pool: &PoolRef) -> Arc<Self> {
            Arc::new(Self {
                id: pool.next_id(),
                lines: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn mapped(&self) -> usize {
            self.lines.lock().unwrap().len()
        }
    }

    impl Owner for Table {
        fn id(&self) -> OwnerId {
            self.id
        }

        fn lookup(&self, line: u64) -> Option<SlotId> {
            self.lines.lock().unwrap().get(&line).copied()
        }

        fn claim(&self, line: u64, slot: SlotId) {
            assert!(self.lines.lock().unwrap().insert(line, slot).is_none());
        }

        fn evict(&self, line: u64, slot: SlotId) {
            assert_eq!(self.lines.lock().unwrap().remove(&line), Some(slot));
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    fn config(line_size: usize, min_slots: usize, max_slots: usize) -> Config {
        Config {
            line_size: NonZeroUsize::new(line_size).unwrap(),
            min_slots,
            max_slots: NonZeroUsize::new(max_slots).unwrap(),
            idle_ticks: 0,
            shrink_batch: 8,
            priority: Priority::Normal,
        }
    }

    /// Acquire a slot for `line` and mark its read complete, leaving it locked once.
    fn load(pool: &PoolRef, owner: &Arc<dyn Owner>, line: u64) -> SlotId {
        let Lookup::Miss { slot, buffer } = pool.lookup_and_lock(owner, line).unwrap() else {
            panic!("expected miss");
        };
        let mut buffer = buffer;
        buffer.resize(pool.line_size(), line as u8);
        pool.install(slot, owner.id(), line, buffer);
        slot
    }

    #[test]
    fn test_pool_invalid_config() {
        assert!(matches!(
            PoolRef::new(config(4, 3, 2)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_acquire_lock_unlock() {
        let pool = PoolRef::new(config(4, 2, 2)).unwrap();
        let table = Table::new(&pool);
        let owner: Arc<dyn Owner> = table.clone();

        let slot = load(&pool, &owner, 0);
        assert_eq!(table.lookup(0), Some(slot));
        assert_eq!(
            pool.stats(),
            Stats {
                allocated: 2,
                free: 1,
                reusable: 0,
                locked: 1,
                wanted: 0,
            }
        );
        pool.check();

        pool.unlock(slot);
        assert_eq!(pool.stats().reusable, 1);
        pool.check();

        // Relocking a reusable slot takes it off the list.
        pool.lock(slot);
        assert_eq!(pool.stats().reusable, 0);
        pool.unlock(slot);
        pool.check();
    }

    #[test]
    fn test_pool_evicts_least_recently_unlocked() {
        let pool = PoolRef::new(config(4, 3, 3)).unwrap();
        let table = Table::new(&pool);
        let owner: Arc<dyn Owner> = table.clone();

        let slots: Vec<_> = (0..3).map(|line| load(&pool, &owner, line)).collect();
        pool.unlock(slots[1]);
        pool.unlock(slots[0]);
        pool.unlock(slots[2]);

        // Line 1 was unlocked first, so its slot is reused first.
        let slot = pool.acquire_and_lock(&owner, 3).unwrap();
        assert_eq!(slot, slots[1]);
        assert_eq!(table.lookup(1), None);
        assert_eq!(table.lookup(3), Some(slot));

        let slot = pool.acquire_and_lock(&owner, 4).unwrap();
        assert_eq!(slot, slots[0]);
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.mapped(), 3);
        pool.check();
    }

    #[test]
    fn test_pool_exhausted() {
        let pool = PoolRef::new(config(4, 2, 2)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let first = load(&pool, &owner, 0);
        let second = load(&pool, &owner, 1);

        // Both slots are locked, so a third line cannot be placed.
        let other: Arc<dyn Owner> = Table::new(&pool);
        assert!(matches!(
            pool.acquire_and_lock(&other, 0),
            Err(Error::Exhausted(2))
        ));
        assert_eq!(owner.lookup(0), Some(first));
        assert_eq!(owner.lookup(1), Some(second));
        assert_eq!(pool.metrics().exhausted.get(), 1);

        // Unlocking one slot makes room.
        pool.unlock(first);
        let slot = pool.acquire_and_lock(&other, 0).unwrap();
        assert_eq!(slot, first);
        assert_eq!(owner.lookup(0), None);
        pool.check();
    }

    #[test]
    fn test_pool_grows_to_capacity() {
        let pool = PoolRef::new(config(4, 1, 3)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slots: Vec<_> = (0..3).map(|line| load(&pool, &owner, line)).collect();
        assert_eq!(pool.stats().allocated, 3);
        assert!(matches!(
            pool.acquire_and_lock(&owner, 3),
            Err(Error::Exhausted(3))
        ));

        // An unlocked slot is reused before the pool grows.
        pool.unlock(slots[2]);
        assert_eq!(pool.acquire_and_lock(&owner, 3).unwrap(), slots[2]);
        assert_eq!(pool.stats().allocated, 3);
        pool.check();
    }

    #[test]
    fn test_pool_wanted_pins_slot() {
        let pool = PoolRef::new(config(128, 1, 1)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slot = load(&pool, &owner, 0);

        // A wanted slot stays off the reusable list even once unlocked.
        pool.mark_wanted(slot, 0..64);
        pool.unlock(slot);
        assert_eq!(pool.stats().reusable, 0);
        assert_eq!(pool.stats().wanted, 1);
        assert!(matches!(
            pool.acquire_and_lock(&owner, 1),
            Err(Error::Exhausted(1))
        ));
        pool.check();

        // Clearing a disjoint range leaves the mark in place.
        pool.clear_wanted(&owner, 0, 64..128);
        assert_eq!(pool.stats().wanted, 1);

        // Clearing the marked range releases it.
        pool.clear_wanted(&owner, 0, 0..64);
        assert_eq!(pool.stats().wanted, 0);
        assert_eq!(pool.stats().reusable, 1);
        assert_eq!(pool.acquire_and_lock(&owner, 1).unwrap(), slot);
        pool.check();
    }

    #[test]
    fn test_pool_evict_all() {
        let pool = PoolRef::new(config(4, 4, 4)).unwrap();
        let first = Table::new(&pool);
        let second = Table::new(&pool);
        let first_owner: Arc<dyn Owner> = first.clone();
        let second_owner: Arc<dyn Owner> = second.clone();

        let locked = load(&pool, &first_owner, 0);
        let unlocked = load(&pool, &first_owner, 1);
        pool.unlock(unlocked);
        let wanted = load(&pool, &second_owner, 0);
        pool.mark_wanted(wanted, 0..4);
        pool.unlock(wanted);

        // Evicting one owner leaves the other alone and reports the locked slot.
        assert!(pool.evict_all(Some(first.id)));
        assert_eq!(first.mapped(), 1);
        assert_eq!(first.lookup(0), Some(locked));
        assert_eq!(second.mapped(), 1);
        pool.check();

        // Evicting everything drops wanted marks too.
        assert!(pool.evict_all(None));
        assert_eq!(second.mapped(), 0);
        pool.unlock(locked);
        assert!(!pool.evict_all(None));
        assert_eq!(first.mapped(), 0);
        assert_eq!(pool.stats().free, 4);
        pool.check();
    }

    #[test]
    fn test_pool_evicted_slots_reused_first() {
        let pool = PoolRef::new(config(4, 3, 3)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slots: Vec<_> = (0..2).map(|line| load(&pool, &owner, line)).collect();
        for slot in &slots {
            pool.unlock(*slot);
        }
        pool.evict_all(None);

        // The most recently evicted slot sits at the head of the free list.
        let slot = pool.acquire_and_lock(&owner, 7).unwrap();
        assert_eq!(slot, slots[1]);
        pool.check();
    }

    #[test]
    fn test_pool_closed_owner_evicted_on_unlock() {
        let pool = PoolRef::new(config(4, 2, 2)).unwrap();
        let table = Table::new(&pool);
        let owner: Arc<dyn Owner> = table.clone();
        let slot = load(&pool, &owner, 0);

        table.closed.store(true, Ordering::Release);
        pool.unlock(slot);
        assert_eq!(table.mapped(), 0);
        assert_eq!(pool.stats().free, 2);
        pool.check();
    }

    #[test]
    fn test_pool_failed_read_evicted_on_unlock() {
        let pool = PoolRef::new(config(4, 1, 1)).unwrap();
        let table = Table::new(&pool);
        let owner: Arc<dyn Owner> = table.clone();
        let Lookup::Miss { slot, .. } = pool.lookup_and_lock(&owner, 0).unwrap() else {
            panic!("expected miss");
        };
        pool.fail(slot, owner.id(), 0);

        // Relocking a failed line reports it so the caller can retry.
        let Lookup::Hit { residency, .. } = pool.lookup_and_lock(&owner, 0).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(residency, Residency::Failed);
        pool.unlock(slot);
        pool.unlock(slot);
        assert_eq!(table.mapped(), 0);
        assert_eq!(pool.stats().free, 1);
        pool.check();
    }

    #[test]
    fn test_pool_unbounded_capacity() {
        let pool = PoolRef::new(config(4, 1, usize::MAX)).unwrap();
        assert_eq!(pool.stats().allocated, 1);

        // Slots are only allocated as lines need them.
        let owner: Arc<dyn Owner> = Table::new(&pool);
        for line in 0..3 {
            load(&pool, &owner, line);
        }
        assert_eq!(pool.stats().allocated, 3);
        pool.check();
    }

    #[test]
    fn test_pool_register_metrics() {
        let pool = PoolRef::new(config(4, 1, 1)).unwrap();
        let mut registry = Registry::default();
        pool.register(&mut registry);

        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slot = load(&pool, &owner, 0);
        pool.lock(slot);
        assert!(matches!(pool.lookup_and_lock(&owner, 0), Ok(Lookup::Hit { .. })));
        assert!(pool.acquire_and_lock(&owner, 1).is_err());

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("hits_total 1"));
        assert!(buffer.contains("misses_total 1"));
        assert!(buffer.contains("exhausted_total 1"));
        assert!(buffer.contains("slots 1"));
    }

    #[test]
    fn test_pool_clear_wanted_after_reassignment() {
        let pool = PoolRef::new(config(4, 1, 1)).unwrap();
        let first: Arc<dyn Owner> = Table::new(&pool);
        let second: Arc<dyn Owner> = Table::new(&pool);
        let slot = load(&pool, &first, 0);
        pool.mark_wanted(slot, 0..4);
        pool.unlock(slot);

        // The slot moves to another owner, which marks it in turn.
        pool.evict_all(None);
        let reassigned = load(&pool, &second, 0);
        assert_eq!(reassigned, slot);
        pool.mark_wanted(reassigned, 0..4);
        pool.unlock(reassigned);

        // Clearing on behalf of the previous owner leaves the new mark alone.
        pool.clear_wanted(&first, 0, 0..4);
        assert_eq!(pool.stats().wanted, 1);
        assert_eq!(pool.stats().reusable, 0);

        pool.clear_wanted(&second, 0, 0..4);
        assert_eq!(pool.stats().wanted, 0);
        assert_eq!(pool.stats().reusable, 1);
        pool.check();
    }

    #[test]
    #[should_panic(expected = "marking unlocked slot")]
    fn test_pool_mark_unlocked() {
        let pool = PoolRef::new(config(4, 1, 1)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slot = load(&pool, &owner, 0);
        pool.unlock(slot);
        pool.mark_wanted(slot, 0..4);
    }

    #[test]
    #[should_panic(expected = "double unlock")]
    fn test_pool_double_unlock() {
        let pool = PoolRef::new(config(4, 1, 1)).unwrap();
        let owner: Arc<dyn Owner> = Table::new(&pool);
        let slot = load(&pool, &owner, 0);
        pool.unlock(slot);
        pool.unlock(slot);
    }

    #[test]
    fn test_pool_shrink() {
        let mut cfg = config(4, 1, 4);
        cfg.idle_ticks = 2;
        let pool = PoolRef::new(cfg).unwrap();
        let table = Table::new(&pool);
        let owner: Arc<dyn Owner> = table.clone();
        let slots: Vec<_> = (0..4).map(|line| load(&pool, &owner, line)).collect();
        assert_eq!(pool.stats().allocated, 4);
        for slot in &slots[..3] {
            pool.unlock(*slot);
        }

        // Nothing has been idle long enough yet.
        assert_eq!(pool.tick(), 0);
        assert_eq!(pool.stats().allocated, 4);

        // Idle slots are released, but never the locked one and never below the floor.
        assert_eq!(pool.tick(), 3);
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(table.mapped(), 1);
        assert_eq!(table.lookup(3), Some(slots[3]));
        pool.check();

        // Released indices are reused on growth.
        let slot = load(&pool, &owner, 9);
        assert!(slots[..3].contains(&slot));
        assert_eq!(pool.stats().allocated, 2);
        pool.check();
    }

    #[test]
    fn test_pool_randomized_invariants() {
        let pool = PoolRef::new(config(64, 2, 8)).unwrap();
        let tables: Vec<_> = (0..3).map(|_| Table::new(&pool)).collect();
        let owners: Vec<Arc<dyn Owner>> = tables
            .iter()
            .map(|table| table.clone() as Arc<dyn Owner>)
            .collect();
        let mut locked: Vec<(SlotId, usize, u64)> = Vec::new();
        let mut wanted: Vec<(usize, u64, Range<usize>)> = Vec::new();
        let mut rng = StdRng::seed_from_u64(0);

        for _ in 0..2_000 {
            match rng.gen_range(0..6) {
                0 | 1 => {
                    let index = rng.gen_range(0..owners.len());
                    let owner = &owners[index];
                    let line = rng.gen_range(0..16);
                    match pool.lookup_and_lock(owner, line) {
                        Ok(Lookup::Miss { slot, mut buffer }) => {
                            buffer.resize(64, 0);
                            pool.install(slot, owner.id(), line, buffer);
                            locked.push((slot, index, line));
                        }
                        Ok(Lookup::Hit { slot, .. }) => locked.push((slot, index, line)),
                        Err(Error::Exhausted(_)) => {}
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
                2 if !locked.is_empty() => {
                    let (slot, _, _) = locked.swap_remove(rng.gen_range(0..locked.len()));
                    pool.unlock(slot);
                }
                3 if !locked.is_empty() => {
                    let (slot, index, line) = locked[rng.gen_range(0..locked.len())];
                    let start = rng.gen_range(0..64);
                    let range = start..rng.gen_range(start..=64);
                    pool.mark_wanted(slot, range.clone());
                    wanted.push((index, line, range));
                }
                4 if !wanted.is_empty() => {
                    let (index, line, range) = wanted.swap_remove(rng.gen_range(0..wanted.len()));
                    pool.clear_wanted(&owners[index], line, range);
                }
                5 => {
                    pool.tick();
                    if rng.gen_bool(0.05) {
                        pool.evict_all(None);
                        wanted.clear();
                    }
                }
                _ => {}
            }
            pool.check();
        }

        for (slot, _, _) in locked {
            pool.unlock(slot);
        }
        pool.evict_all(None);
        pool.check();
        assert!(tables.iter().all(|table| table.mapped() == 0));
    }
}
