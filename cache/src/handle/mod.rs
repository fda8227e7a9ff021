//! A logical file whose lines are cached in a shared [PoolRef].

use crate::{
    pool::{Lookup, Owner, OwnerId, PoolRef, Residency, SlotId},
    signal::{Signal, Signaler},
    Error, Priority, Source, Spawner,
};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    future::join_all,
};
use std::{
    collections::{hash_map::Entry, HashMap},
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, error, trace, warn};

mod view;
pub use view::MemoryView;

/// The line table of a [Handle], kept consistent with the pool by the pool itself.
struct Lines {
    id: OwnerId,
    slots: Mutex<HashMap<u64, SlotId>>,
    closed: AtomicBool,
}

impl Owner for Lines {
    fn id(&self) -> OwnerId {
        self.id
    }

    fn lookup(&self, line: u64) -> Option<SlotId> {
        self.slots.lock().unwrap().get(&line).copied()
    }

    fn claim(&self, line: u64, slot: SlotId) {
        let previous = self.slots.lock().unwrap().insert(line, slot);
        assert!(previous.is_none(), "line {line} already mapped");
    }

    fn evict(&self, line: u64, slot: SlotId) {
        let previous = self.slots.lock().unwrap().remove(&line);
        assert_eq!(previous, Some(slot), "line {line} not mapped to evicted slot");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An outstanding read of one line.
struct Pending {
    /// Distinguishes this read from an earlier, failed read of the same line.
    ticket: u64,
    signal: Signal<()>,
}

struct State {
    pending: HashMap<u64, Pending>,
    next_ticket: u64,
    /// Reads push `(line, ticket)` here once they have finished with their slot.
    completed: UnboundedReceiver<(u64, u64)>,
    notify: UnboundedSender<(u64, u64)>,
}

/// The read lock of a slot whose line is being fetched.
///
/// Dropping it before [Loading::install] (including when the read task is dropped without being
/// run to completion) fails the read, so the slot is released with its other locks.
struct Loading {
    pool: PoolRef,
    slot: SlotId,
    owner: OwnerId,
    line: u64,
    armed: bool,
}

impl Loading {
    fn install(mut self, buffer: Vec<u8>) {
        self.armed = false;
        self.pool.install(self.slot, self.owner, self.line, buffer);
    }
}

impl Drop for Loading {
    fn drop(&mut self) {
        if self.armed {
            self.pool.fail(self.slot, self.owner, self.line);
        }
    }
}

/// A logical file read through a shared [PoolRef].
///
/// Byte ranges of the file are split into lines of [PoolRef::line_size] bytes. Each line is read
/// from the [Source] at most once while it stays cached, regardless of how many requests touch it,
/// and concurrent requests for a line that is still being read share that read's [Signal].
///
/// # Teardown
///
/// Only [Handle::close] waits for every outstanding read, so that no slot references the handle
/// once it returns. Dropping a [Handle] does not block: it releases every slot that is not locked
/// right away, and each slot still held by an in-flight read only once that read finishes (or its
/// task is dropped).
pub struct Handle<S: Source, E: Spawner> {
    pool: PoolRef,
    source: S,
    spawner: E,
    lines: Arc<Lines>,
    size: Signal<u64>,
    priority: Priority,
    state: Mutex<State>,
}

impl<S: Source, E: Spawner> Handle<S, E> {
    /// Open `source` for cached reads, fetching its size in the background.
    ///
    /// Reads issued before the size is known are deferred until it is.
    pub fn open(pool: PoolRef, source: S, spawner: E) -> Self {
        let (signaler, size) = Signaler::new();
        let fetcher = source.clone();
        spawner.spawn_detached(async move {
            let result = fetcher.size().await;
            if let Err(err) = &result {
                error!(?err, "failed to fetch size");
            }
            signaler.signal(result);
        });
        Self::init(pool, source, spawner, size)
    }

    /// Open `source` for cached reads when its size is already known.
    pub fn open_with_size(pool: PoolRef, source: S, spawner: E, size: u64) -> Self {
        Self::init(pool, source, spawner, Signal::ready(size))
    }

    fn init(pool: PoolRef, source: S, spawner: E, size: Signal<u64>) -> Self {
        let (notify, completed) = mpsc::unbounded();
        let lines = Arc::new(Lines {
            id: pool.next_id(),
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        debug!(handle = lines.id, "opened handle");
        Self {
            priority: pool.priority(),
            pool,
            source,
            spawner,
            lines,
            size,
            state: Mutex::new(State {
                pending: HashMap::new(),
                next_ticket: 0,
                completed,
                notify,
            }),
        }
    }

    /// The id of this handle in its pool.
    pub fn id(&self) -> OwnerId {
        self.lines.id
    }

    /// The pool caching this handle's lines.
    pub const fn pool(&self) -> &PoolRef {
        &self.pool
    }

    /// Wait for the size of the file.
    pub async fn size(&self) -> Result<u64, Error> {
        self.size.clone().await
    }

    /// The size of the file, if it is already known.
    pub fn size_known(&self) -> Option<u64> {
        self.size.peek().and_then(Result::ok)
    }

    /// Return a view of `size` bytes starting at `offset`, issuing reads for any lines that are
    /// not cached.
    ///
    /// This never waits for I/O: the returned view lists the completion signals of every line
    /// still being read (see [MemoryView::wait]). Every slot the view touches stays locked until
    /// it is dropped.
    ///
    /// Fails with [Error::Exhausted] if a slot could not be found for some line, in which case no
    /// slot remains locked on behalf of this request.
    pub fn read(&self, offset: u64, size: usize) -> Result<MemoryView<'_>, Error> {
        self.request(offset, size, false)
    }

    /// Like [Handle::read], but the returned view also marks its range wanted until it is dropped.
    pub fn read_pinned(&self, offset: u64, size: usize) -> Result<MemoryView<'_>, Error> {
        self.request(offset, size, true)
    }

    /// Fetch and pin the given `ranges` (relative to `offset`) without returning a view.
    ///
    /// The touched lines are marked wanted and stay cached until [Handle::release_preload] is
    /// called with the same ranges. Returns the completion signals of every line still being read.
    /// On failure, marks made by this call are cleared.
    pub fn preload(&self, offset: u64, ranges: &[Range<u64>]) -> Result<Vec<Signal<()>>, Error> {
        let bounds = ranges
            .iter()
            .map(|range| self.absolute(offset, range))
            .collect::<Result<Vec<_>, _>>()?;
        let owner: Arc<dyn Owner> = self.lines.clone();
        let mut state = self.state.lock().unwrap();
        self.drain(&mut state);
        let mut completions = Vec::new();
        let mut marked = Vec::new();
        for (start, end) in bounds {
            for (line, bytes) in self.segments(start, end) {
                let slot = match self.attach(&mut state, line, &mut completions) {
                    Ok(slot) => slot,
                    Err(err) => {
                        for (line, bytes) in marked {
                            self.pool.clear_wanted(&owner, line, bytes);
                        }
                        return Err(err);
                    }
                };
                self.pool.mark_wanted(slot, bytes.clone());
                self.pool.unlock(slot);
                marked.push((line, bytes));
            }
        }
        trace!(handle = self.id(), ranges = ranges.len(), "preloaded");
        Ok(completions)
    }

    /// Clear the wanted marks set by [Handle::preload] for `ranges` (relative to `offset`) and
    /// give the pool a chance to shrink.
    pub fn release_preload(&self, offset: u64, ranges: &[Range<u64>]) -> Result<(), Error> {
        let owner: Arc<dyn Owner> = self.lines.clone();
        for range in ranges {
            let (start, end) = self.absolute(offset, range)?;
            for (line, bytes) in self.segments(start, end) {
                self.pool.clear_wanted(&owner, line, bytes);
            }
        }
        self.pool.shrink(self.pool.shrink_batch());
        Ok(())
    }

    /// Evict every unlocked line of this handle from the pool.
    ///
    /// Returns whether any line was skipped because it was locked.
    pub fn evict_all(&self) -> bool {
        self.pool.evict_all(Some(self.id()))
    }

    /// Wait for every read issued by this handle to complete.
    pub async fn wait_all(&self) {
        let signals: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            self.drain(&mut state);
            state
                .pending
                .values()
                .map(|pending| pending.signal.clone())
                .collect()
        };
        join_all(signals).await;
        let mut state = self.state.lock().unwrap();
        self.drain(&mut state);
    }

    /// Wait for every outstanding read and release all of this handle's slots.
    pub async fn close(self) {
        self.wait_all().await;
    }

    fn request(&self, offset: u64, size: usize, pinned: bool) -> Result<MemoryView<'_>, Error> {
        let end = offset
            .checked_add(size as u64)
            .ok_or(Error::OffsetOverflow)?;
        if let Some(len) = self.size_known() {
            if end > len {
                return Err(Error::OutOfBounds { offset, size, len });
            }
        }

        let mut state = self.state.lock().unwrap();
        self.drain(&mut state);
        let mut view = MemoryView::new(&self.pool, self.id(), offset, size, pinned);
        for (line, bytes) in self.segments(offset, end) {
            let slot = self.attach(&mut state, line, view.completions_mut())?;
            view.push(slot, line, bytes.clone());
            if pinned {
                self.pool.mark_wanted(slot, bytes);
            }
        }
        trace!(
            handle = self.id(),
            offset,
            size,
            pending = view.completions().len(),
            "read"
        );
        Ok(view)
    }

    /// Lock the slot holding `line`, issuing a read if the line is not cached and adding the
    /// completion signal of any read in flight to `completions`.
    fn attach(
        &self,
        state: &mut State,
        line: u64,
        completions: &mut Vec<Signal<()>>,
    ) -> Result<SlotId, Error> {
        let owner: Arc<dyn Owner> = self.lines.clone();
        match self.pool.lookup_and_lock(&owner, line)? {
            Lookup::Miss { slot, buffer } => {
                completions.push(self.fetch(state, line, slot, buffer));
                Ok(slot)
            }
            Lookup::Hit {
                slot,
                residency: Residency::Loading,
            } => {
                let Some(pending) = state.pending.get(&line) else {
                    panic!("line {line} loading without a pending read");
                };
                self.pool.metrics().coalesced.inc();
                trace!(handle = self.id(), line, "joined read in flight");
                completions.push(pending.signal.clone());
                Ok(slot)
            }
            Lookup::Hit {
                slot,
                residency: Residency::Resident,
            } => Ok(slot),
            Lookup::Hit {
                slot,
                residency: Residency::Failed,
            } => {
                debug!(handle = self.id(), line, "retrying failed line");
                let buffer = self.pool.retry(slot);
                completions.push(self.fetch(state, line, slot, buffer));
                Ok(slot)
            }
        }
    }

    /// Read `line` into `buffer` in the background and install it into `slot`.
    fn fetch(&self, state: &mut State, line: u64, slot: SlotId, buffer: Vec<u8>) -> Signal<()> {
        let (signaler, signal) = Signaler::new();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.insert(
            line,
            Pending {
                ticket,
                signal: signal.clone(),
            },
        );

        let source = self.source.clone();
        let size = self.size.clone();
        let notify = state.notify.clone();
        let priority = self.priority;
        let line_size = self.pool.line_size() as u64;
        let loading = Loading {
            pool: self.pool.clone(),
            slot,
            owner: self.id(),
            line,
            armed: true,
        };
        self.pool.metrics().reads.inc();
        self.spawner.spawn_detached(async move {
            let result = read_line(&source, size, buffer, line, line_size, priority).await;
            let outcome = match result {
                Ok(buffer) => {
                    loading.install(buffer);
                    Ok(())
                }
                Err(err) => {
                    error!(handle = loading.owner, line, ?err, "line read failed");
                    loading.pool.metrics().read_failures.inc();
                    drop(loading);
                    Err(err)
                }
            };
            signaler.signal(outcome);

            // The handle may already be gone.
            let _ = notify.unbounded_send((line, ticket));
        });
        signal
    }

    /// Forget the pending records of reads that have completed.
    fn drain(&self, state: &mut State) {
        while let Ok(Some((line, ticket))) = state.completed.try_next() {
            if let Entry::Occupied(pending) = state.pending.entry(line) {
                if pending.get().ticket == ticket {
                    pending.remove();
                }
            }
        }
    }

    fn absolute(&self, offset: u64, range: &Range<u64>) -> Result<(u64, u64), Error> {
        let start = offset
            .checked_add(range.start)
            .ok_or(Error::OffsetOverflow)?;
        let end = offset.checked_add(range.end).ok_or(Error::OffsetOverflow)?;
        Ok((start, end.max(start)))
    }

    /// Split the byte range `[start, end)` into the lines covering it and the range of bytes
    /// within each line.
    fn segments(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, Range<usize>)> {
        let line_size = self.pool.line_size() as u64;
        let lines = if start < end {
            start / line_size..(end - 1) / line_size + 1
        } else {
            0..0
        };
        lines.map(move |line| {
            let base = line * line_size;
            let first = start.max(base) - base;
            let last = end.min(base.saturating_add(line_size)) - base;
            (line, first as usize..last as usize)
        })
    }
}

impl<S: Source, E: Spawner> Drop for Handle<S, E> {
    fn drop(&mut self) {
        self.lines.closed.store(true, Ordering::Release);
        if self.pool.evict_all(Some(self.id())) {
            warn!(
                handle = self.id(),
                "dropped handle with reads in flight, their slots are evicted once released"
            );
        }
        debug!(handle = self.id(), "closed handle");
    }
}

/// Read `line` into `buffer` once the size of the file is known.
async fn read_line<S: Source>(
    source: &S,
    size: Signal<u64>,
    mut buffer: Vec<u8>,
    line: u64,
    line_size: u64,
    priority: Priority,
) -> Result<Vec<u8>, Error> {
    let len = size.await?;
    let start = line.checked_mul(line_size).ok_or(Error::OffsetOverflow)?;
    if start >= len {
        return Err(Error::OutOfBounds {
            offset: start,
            size: line_size as usize,
            len,
        });
    }
    let expected = (len - start).min(line_size) as usize;
    buffer.resize(expected, 0);
    let buffer = source.read_at(buffer, start, priority).await?;
    if buffer.len() != expected {
        error!(
            line,
            expected,
            actual = buffer.len(),
            "source returned partial line"
        );
        return Err(Error::ReadFailed);
    }
    Ok(buffer)
}
