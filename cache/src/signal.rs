//! One-shot notifications that many tasks can await.

use crate::Error;
use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A one-time broadcast of an outcome that can be awaited by many tasks.
///
/// Every reader of a line that is still being fetched holds a clone of the same [Signal], so all
/// of them observe the same outcome (and, on success, the same bytes) once the fetch finishes.
///
/// # Example
///
/// ```rust
/// use streamcache::signal::Signaler;
///
/// futures::executor::block_on(async {
///     let (signaler, signal) = Signaler::<u64>::new();
///     let waiter = signal.clone();
///     assert!(!signal.is_fired());
///
///     signaler.signal(Ok(7));
///     assert_eq!(waiter.await.unwrap(), 7);
///     assert!(signal.is_fired());
/// });
/// ```
#[derive(Clone)]
pub enum Signal<T: Clone> {
    /// A signal that will resolve when its [Signaler] fires (or is dropped).
    Open(Shared<oneshot::Receiver<Result<T, Error>>>),
    /// A signal that has been resolved with a known outcome.
    Closed(Result<T, Error>),
}

impl<T: Clone + Unpin> Signal<T> {
    /// Return a signal that has already resolved to `value`.
    pub fn ready(value: T) -> Self {
        Self::Closed(Ok(value))
    }

    /// Return the outcome of the signal if it has fired, without waiting.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        match self {
            Self::Open(_) => self.clone().now_or_never(),
            Self::Closed(outcome) => Some(outcome.clone()),
        }
    }

    /// Returns whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        self.peek().is_some()
    }
}

impl<T: Clone + Unpin> Future for Signal<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            Self::Open(live) => Pin::new(live)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(Error::Canceled))),
            Self::Closed(outcome) => Poll::Ready(outcome.clone()),
        }
    }
}

/// Fires a one-time [Signal] for all of its waiters.
///
/// Dropping a [Signaler] without firing it resolves its [Signal]s to [Error::Canceled].
pub struct Signaler<T> {
    tx: oneshot::Sender<Result<T, Error>>,
}

impl<T: Clone> Signaler<T> {
    /// Create a new [Signaler].
    ///
    /// Returns a [Signaler] and a [Signal] that will resolve when [Signaler::signal] is called.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, Signal<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Signal::Open(rx.shared()))
    }

    /// Resolve all [Signal]s associated with this [Signaler].
    pub fn signal(self, outcome: Result<T, Error>) {
        let _ = self.tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, future::join_all};

    #[test]
    fn test_signal_many_waiters() {
        let (signaler, signal) = Signaler::<()>::new();
        let waiters: Vec<_> = (0..4).map(|_| signal.clone()).collect();
        signaler.signal(Ok(()));
        for outcome in block_on(join_all(waiters)) {
            assert!(outcome.is_ok());
        }
    }

    #[test]
    fn test_signal_failure_shared() {
        let (signaler, signal) = Signaler::<()>::new();
        let waiter = signal.clone();
        signaler.signal(Err(Error::ReadFailed));
        assert!(matches!(block_on(waiter), Err(Error::ReadFailed)));
        assert!(matches!(signal.peek(), Some(Err(Error::ReadFailed))));
    }

    #[test]
    fn test_signal_dropped_signaler() {
        let (signaler, signal) = Signaler::<u64>::new();
        assert!(signal.peek().is_none());
        drop(signaler);
        assert!(matches!(block_on(signal), Err(Error::Canceled)));
    }

    #[test]
    fn test_signal_ready() {
        let signal = Signal::ready(42u64);
        assert!(signal.is_fired());
        assert_eq!(block_on(signal).unwrap(), 42);
    }
}
