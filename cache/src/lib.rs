//! Share a bounded pool of fixed-size memory slots across asynchronously read files.
//!
//! A [pool::PoolRef] owns every byte of cache memory as a fixed set of equally sized _slots_.
//! Any number of [Handle]s (one per open logical file) map fixed-size byte ranges of their file,
//! called _lines_, onto those slots. Reading a range of a file locks every slot it touches and
//! issues at most one read per missing line against the file's [Source], no matter how many
//! readers are waiting on that line.
//!
//! Reads never block. [Handle::read] returns a [MemoryView] immediately, along with the
//! completion [signal::Signal]s of any lines still being fetched. Callers may poll
//! [MemoryView::is_ready], await [MemoryView::wait], or proceed speculatively. When the view is
//! dropped, its slots are unlocked and become eligible for eviction again.
//!
//! # Eviction
//!
//! Unlocked slots are kept on an LRU-ordered _reusable_ list. When a line must be fetched and no
//! free slot exists, the least recently unlocked slot is evicted and handed to the new line. A
//! slot that is locked, or that has been marked _wanted_ by [Handle::preload], is never evicted.
//! When nothing is evictable and the pool has reached its capacity, the request fails with
//! [Error::Exhausted] instead of handing out another file's bytes.
//!
//! # Example
//!
//! ```rust
//! use streamcache::{pool::{Config, PoolRef}, source::memory::Memory, Handle};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! runtime.block_on(async {
//!     let pool = PoolRef::new(Config::default()).unwrap();
//!     let source = Memory::new(b"hello, streaming world".to_vec());
//!     let handle = Handle::open(pool, source, tokio::runtime::Handle::current());
//!
//!     // Read a range, wait for it to be fetched, and consume it.
//!     let view = handle.read(7, 9).unwrap();
//!     view.wait().await.unwrap();
//!     assert_eq!(view.read(0, 9), b"streaming");
//!     drop(view);
//!
//!     // Wait for outstanding reads and release all cached lines.
//!     handle.close().await;
//! });
//! ```
//!
//! # Status
//!
//! `streamcache` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

use std::{future::Future, io::Error as IoError, sync::Arc};
use thiserror::Error;

mod handle;
pub use handle::{Handle, MemoryView};
pub mod pool;
pub mod signal;
pub mod source;

/// Errors that can occur when interacting with the cache.
///
/// Errors are [Clone] so that a single failed fetch can be reported to every reader waiting on
/// it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("cache exhausted: all {0} slots are locked or wanted")]
    Exhausted(usize),
    #[error("out of bounds: offset={offset} size={size} len={len}")]
    OutOfBounds { offset: u64, size: usize, len: u64 },
    #[error("read failed")]
    ReadFailed,
    #[error("canceled")]
    Canceled,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("io error: {0}")]
    Io(Arc<IoError>),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Priority attached to every request issued against a [Source].
///
/// Sources are free to ignore it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Interface to the asynchronous byte store backing a [Handle].
///
/// Reads use owned buffers: the cache hands a buffer to the source and only gets it back once
/// the read completes, so a late completion can never write into memory the cache has since
/// given to another line.
pub trait Source: Clone + Send + Sync + 'static {
    /// Return the length of the underlying data in bytes.
    fn size(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Fill `buf` with the bytes starting at `offset` and return it.
    ///
    /// `read_at` only returns once the entire buffer has been filled.
    fn read_at(
        &self,
        buf: Vec<u8>,
        offset: u64,
        priority: Priority,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;
}

/// Interface used to drive requests issued against a [Source] in the background.
///
/// Each request runs as its own task, so its completion may arrive on any thread.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Run `future` to completion without waiting for it.
    fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

impl Spawner for tokio::runtime::Handle {
    fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Dropping the join handle detaches the task.
        drop(tokio::runtime::Handle::spawn(self, future));
    }
}
