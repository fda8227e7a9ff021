use crate::{
    pool::{OwnerId, PoolRef, SlotId},
    signal::Signal,
    Error,
};
use futures::future::join_all;
use std::{
    ops::Range,
    sync::{Arc, OnceLock},
};

/// The part of a view that falls within one line.
struct Segment {
    slot: SlotId,
    line: u64,
    /// The bytes of the line covered by the view.
    range: Range<usize>,
    /// The line's bytes, fetched from the pool the first time they are found resident.
    data: OnceLock<Arc<Vec<u8>>>,
}

/// A contiguous byte range of a [super::Handle] that may span several slots.
///
/// Every slot the view touches stays locked (and, for [super::Handle::read_pinned], wanted) until
/// the view is dropped, so its bytes can neither be evicted nor replaced while it is alive.
pub struct MemoryView<'a> {
    pool: &'a PoolRef,
    owner: OwnerId,
    offset: u64,
    size: usize,
    pinned: bool,
    segments: Vec<Segment>,
    completions: Vec<Signal<()>>,
}

impl<'a> MemoryView<'a> {
    pub(super) const fn new(
        pool: &'a PoolRef,
        owner: OwnerId,
        offset: u64,
        size: usize,
        pinned: bool,
    ) -> Self {
        Self {
            pool,
            owner,
            offset,
            size,
            pinned,
            segments: Vec::new(),
            completions: Vec::new(),
        }
    }

    /// Record a slot locked on behalf of this view.
    pub(super) fn push(&mut self, slot: SlotId, line: u64, range: Range<usize>) {
        self.segments.push(Segment {
            slot,
            line,
            range,
            data: OnceLock::new(),
        });
    }

    pub(super) fn completions_mut(&mut self) -> &mut Vec<Signal<()>> {
        &mut self.completions
    }

    /// The offset of the view in its file.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The number of bytes covered by the view.
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the view covers no bytes.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The completion signals of every line that was still being read when the view was created.
    pub fn completions(&self) -> &[Signal<()>] {
        &self.completions
    }

    /// Whether every byte of the view is available.
    pub fn is_ready(&self) -> bool {
        (0..self.segments.len()).all(|index| self.resident(index).is_some())
    }

    /// Wait for every line of the view to be read.
    ///
    /// Returns the first error reported by any of them.
    pub async fn wait(&self) -> Result<(), Error> {
        join_all(self.completions.iter().cloned())
            .await
            .into_iter()
            .collect()
    }

    /// Return the bytes starting at `offset` (relative to the start of the view), up to `max`
    /// bytes and never past the end of the slot holding them.
    ///
    /// Returns an empty slice if `offset` is past the end of the view or the line holding it has
    /// not been read (or failed to be read). Callers wanting more than one slot's worth of bytes
    /// call this in a loop.
    pub fn read(&self, offset: usize, max: usize) -> &[u8] {
        let mut start = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            let len = segment.range.len();
            if offset < start + len {
                let Some(data) = self.resident(index) else {
                    return &[];
                };
                let from = segment.range.start + (offset - start);
                let to = segment.range.end.min(from.saturating_add(max)).min(data.len());
                return data.get(from..to).unwrap_or_default();
            }
            start += len;
        }
        &[]
    }

    /// Copy the leading bytes of the view into `out`, stopping at the first line that is not
    /// available. Returns the number of bytes copied.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let chunk = self.read(copied, out.len() - copied);
            if chunk.is_empty() {
                break;
            }
            out[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
        }
        copied
    }

    fn resident(&self, index: usize) -> Option<&Arc<Vec<u8>>> {
        let segment = &self.segments[index];
        if let Some(data) = segment.data.get() {
            return Some(data);
        }
        let data = self.pool.data(segment.slot, self.owner, segment.line)?;
        Some(segment.data.get_or_init(|| data))
    }
}

impl Drop for MemoryView<'_> {
    fn drop(&mut self) {
        // Let go of the line buffers first so evicted slots can recycle them.
        let pinned = self.pinned;
        let releases: Vec<_> = self
            .segments
            .drain(..)
            .map(|mut segment| {
                drop(segment.data.take());
                (segment.slot, pinned.then_some(segment.range))
            })
            .collect();
        self.pool.release(releases);
    }
}
