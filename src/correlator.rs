// Copyright 2026 Commlink Contributors

//! Request/response correlation.
//!
//! Outbound requests are assigned a message id and recorded in a pending
//! table keyed by that id.  When a response frame arrives, the entry is
//! removed and the stored target receives the event; when the deadline
//! passes or the connection breaks, the entry is removed and the target
//! receives an error event instead.  Each entry is removed exactly once,
//! so a target sees exactly one of {response, timeout, broken connection}.
//!
//! There is one delivery path: blocking callers are just a
//! [`DispatchHandler`] that feeds a channel the caller waits on
//! ([`ResponseWaiter`]).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

use crate::error::ErrorCode;
use crate::event::Event;

/// Receives events: decoded messages, connection-state changes, and
/// request-level errors.  Handlers run on the reactor thread that produced
/// the event and must not block for long.
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: Event);
}

/// Adapter turning a closure into a [`DispatchHandler`].
pub struct HandlerFn<F>(pub F);

impl<F> DispatchHandler for HandlerFn<F>
where
    F: Fn(Event) + Send + Sync,
{
    fn handle(&self, event: Event) {
        (self.0)(event)
    }
}

struct Pending {
    addr: SocketAddr,
    target: Arc<dyn DispatchHandler>,
    deadline: Instant,
}

/// Table of requests awaiting a response, plus the message-id allocator.
///
/// The lock guards only table mutation; event delivery happens after the
/// lock is released.
pub(crate) struct Correlator {
    pending: Mutex<HashMap<u32, Pending>>,
    next_id: AtomicU32,
}

impl Correlator {
    pub fn new() -> Correlator {
        Correlator {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocates a message id, skipping 0 (which means "no response
    /// expected" on the wire).
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn register(
        &self,
        id: u32,
        addr: SocketAddr,
        target: Arc<dyn DispatchHandler>,
        deadline: Instant,
    ) {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        let prior = pending.insert(
            id,
            Pending {
                addr,
                target,
                deadline,
            },
        );
        debug_assert!(prior.is_none(), "message id {} reused while pending", id);
    }

    /// Removes and returns the target for `id`, if still pending.  A stale
    /// response (already timed out or failed) finds nothing here.
    pub fn resolve(&self, id: u32) -> Option<Arc<dyn DispatchHandler>> {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        pending.remove(&id).map(|p| p.target)
    }

    /// Fails every pending request on `addr` in one pass, delivering
    /// `error` to each target after the lock is released.
    pub fn fail_address(&self, addr: SocketAddr, error: ErrorCode) -> usize {
        let failed: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| p.addr == addr)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        let count = failed.len();
        for p in failed {
            p.target.handle(Event::error(addr, error));
        }
        count
    }

    /// Expires entries past their deadline, delivering a request-timeout
    /// error to each target.  Driven by the reactor housekeeping tick.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let ids: Vec<u32> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        let count = expired.len();
        for p in expired {
            p.target.handle(Event::error(p.addr, ErrorCode::RequestTimeout));
        }
        count
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }
}

/// A dispatch target that forwards the event into a channel so a blocking
/// caller can wait on it.  The synchronous send path is just this callback
/// plus a `recv_timeout`.
pub struct ResponseWaiter {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl ResponseWaiter {
    pub fn pair() -> (Arc<ResponseWaiter>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ResponseWaiter { tx: Mutex::new(tx) }), rx)
    }
}

impl DispatchHandler for ResponseWaiter {
    fn handle(&self, event: Event) {
        // the waiter may already have given up; a failed send is fine
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let correlator = Correlator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = correlator.next_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn resolve_removes_the_entry_exactly_once() {
        let correlator = Correlator::new();
        let (waiter, _rx) = ResponseWaiter::pair();
        let id = correlator.next_id();
        correlator.register(id, addr(1), waiter, Instant::now() + Duration::from_secs(5));
        assert!(correlator.resolve(id).is_some());
        assert!(correlator.resolve(id).is_none());
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn fail_address_resolves_all_pending_on_that_connection() {
        let correlator = Correlator::new();
        let (waiter, rx) = ResponseWaiter::pair();
        let deadline = Instant::now() + Duration::from_secs(5);
        for _ in 0..3 {
            let id = correlator.next_id();
            correlator.register(id, addr(1), waiter.clone(), deadline);
        }
        let other = correlator.next_id();
        correlator.register(other, addr(2), waiter.clone(), deadline);

        assert_eq!(correlator.fail_address(addr(1), ErrorCode::BrokenConnection), 3);
        for _ in 0..3 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.kind, EventKind::Error);
            assert_eq!(event.error, ErrorCode::BrokenConnection);
            assert_eq!(event.addr, addr(1));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn sweep_expires_only_past_deadline_entries() {
        let correlator = Correlator::new();
        let (waiter, rx) = ResponseWaiter::pair();
        let now = Instant::now();
        let stale = correlator.next_id();
        correlator.register(stale, addr(1), waiter.clone(), now);
        let fresh = correlator.next_id();
        correlator.register(fresh, addr(1), waiter.clone(), now + Duration::from_secs(60));

        assert_eq!(correlator.sweep(now + Duration::from_millis(1)), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.error, ErrorCode::RequestTimeout);
        assert_eq!(correlator.outstanding(), 1);
        // the expired entry is gone; a stale response resolves nothing
        assert!(correlator.resolve(stale).is_none());
        assert!(correlator.resolve(fresh).is_some());
    }
}
