// Copyright 2026 Commlink Contributors

//! Connection manager: one reusable place for connect-with-retry instead
//! of ad-hoc reconnection loops in every client.
//!
//! Each managed address runs the state machine `Connecting -> Connected`,
//! falling back to `Connecting` on disconnect while retries remain and
//! ending in a terminal `Failed` state once the retry budget is exhausted.
//! Callers block on [`ConnectionManager::wait_for_connection`] until the
//! connection is up or the wait gives up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, error, info, Logger};

use crate::comm::Comm;
use crate::correlator::DispatchHandler;
use crate::error::CommError;
use crate::event::{Event, EventKind};

/// Bounded-retry policy: a fixed delay between attempts and a fixed number
/// of reconnection attempts after the initial one.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            limit: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedState {
    Connecting,
    Connected,
    Failed,
}

struct Managed {
    state: ManagedState,
    retries_left: u32,
}

struct ManagedConn {
    service: String,
    inner: Mutex<Managed>,
    cond: Condvar,
}

struct ManagerInner {
    comm: Arc<Comm>,
    policy: RetryPolicy,
    conns: Mutex<HashMap<SocketAddr, Arc<ManagedConn>>>,
    log: Logger,
}

/// Owns the lifecycle of outbound connections: connect, retry with a fixed
/// delay, readiness signaling, reconnection on failure.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

/// The dispatch handler registered with the comm layer for every managed
/// connection.
struct ManagerHandler(Arc<ManagerInner>);

impl ConnectionManager {
    pub fn new(comm: Arc<Comm>, policy: RetryPolicy, log: Logger) -> ConnectionManager {
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                comm,
                policy,
                conns: Mutex::new(HashMap::new()),
                log,
            }),
        }
    }

    /// Starts managing a connection to `addr`.  Idempotent: adding an
    /// address already under management does nothing.  `service_name` only
    /// labels log records.
    pub fn add(&self, addr: SocketAddr, service_name: &str) {
        {
            let mut conns = self.inner.conns.lock().expect("manager map poisoned");
            if conns.contains_key(&addr) {
                return;
            }
            conns.insert(
                addr,
                Arc::new(ManagedConn {
                    service: String::from(service_name),
                    inner: Mutex::new(Managed {
                        state: ManagedState::Connecting,
                        retries_left: self.inner.policy.limit,
                    }),
                    cond: Condvar::new(),
                }),
            );
        }
        self.inner.send_connect(addr);
    }

    /// Blocks the calling thread until the connection to `addr` is up,
    /// returning `true`, or until the wait times out or the connection
    /// permanently fails, returning `false`.
    pub fn wait_for_connection(&self, addr: SocketAddr, max_wait: Duration) -> bool {
        let conn = {
            let conns = self.inner.conns.lock().expect("manager map poisoned");
            match conns.get(&addr) {
                Some(c) => Arc::clone(c),
                None => return false,
            }
        };

        let deadline = Instant::now() + max_wait;
        let mut guard = conn.inner.lock().expect("managed state poisoned");
        loop {
            match guard.state {
                ManagedState::Connected => return true,
                ManagedState::Failed => return false,
                ManagedState::Connecting => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (g, _) = conn
                        .cond
                        .wait_timeout(guard, deadline - now)
                        .expect("managed state poisoned");
                    guard = g;
                }
            }
        }
    }

    /// Current lifecycle state of a managed address.
    pub fn state(&self, addr: SocketAddr) -> Option<ManagedState> {
        let conns = self.inner.conns.lock().expect("manager map poisoned");
        conns
            .get(&addr)
            .map(|c| c.inner.lock().expect("managed state poisoned").state)
    }

    /// Stops managing `addr` and closes its connection.
    pub fn remove(&self, addr: SocketAddr) {
        let removed = {
            let mut conns = self.inner.conns.lock().expect("manager map poisoned");
            conns.remove(&addr)
        };
        if let Some(conn) = removed {
            // unblock any waiter; removal is terminal
            let mut guard = conn.inner.lock().expect("managed state poisoned");
            guard.state = ManagedState::Failed;
            conn.cond.notify_all();
            drop(guard);
            self.inner.comm.close(addr);
        }
    }
}

impl ManagerInner {
    fn lookup(&self, addr: SocketAddr) -> Option<Arc<ManagedConn>> {
        let conns = self.conns.lock().expect("manager map poisoned");
        conns.get(&addr).map(Arc::clone)
    }

    fn send_connect(self: &Arc<Self>, addr: SocketAddr) {
        let handler: Arc<dyn DispatchHandler> =
            Arc::new(ManagerHandler(Arc::clone(self)));
        match self.comm.connect(addr, handler) {
            Ok(()) => {}
            Err(CommError::AlreadyConnected(_)) => self.mark_connected(addr),
            Err(e) => {
                error!(self.log, "connect request failed";
                       "peer" => %addr, "err" => %e);
                self.schedule_retry(addr);
            }
        }
    }

    fn mark_connected(&self, addr: SocketAddr) {
        if let Some(conn) = self.lookup(addr) {
            let mut guard = conn.inner.lock().expect("managed state poisoned");
            guard.state = ManagedState::Connected;
            guard.retries_left = self.policy.limit;
            conn.cond.notify_all();
            debug!(self.log, "connection established";
                   "service" => %conn.service, "peer" => %addr);
        }
    }

    /// Reschedules a connect attempt after the policy delay, or marks the
    /// connection permanently failed when the budget is spent.
    fn schedule_retry(self: &Arc<Self>, addr: SocketAddr) {
        let conn = match self.lookup(addr) {
            Some(c) => c,
            None => return,
        };
        let mut guard = conn.inner.lock().expect("managed state poisoned");
        if guard.state == ManagedState::Failed {
            return;
        }
        if guard.retries_left == 0 {
            guard.state = ManagedState::Failed;
            conn.cond.notify_all();
            error!(self.log, "giving up on connection";
                   "service" => %conn.service, "peer" => %addr);
            return;
        }
        guard.retries_left -= 1;
        guard.state = ManagedState::Connecting;
        drop(guard);

        info!(self.log, "will retry connection";
              "service" => %conn.service, "peer" => %addr,
              "delay_ms" => self.policy.interval.as_millis() as u64);
        let inner = Arc::clone(self);
        let interval = self.policy.interval;
        self.comm.handle().spawn(async move {
            tokio::time::sleep(interval).await;
            inner.send_connect(addr);
        });
    }
}

impl DispatchHandler for ManagerHandler {
    fn handle(&self, event: Event) {
        match event.kind {
            EventKind::Connected => self.0.mark_connected(event.addr),
            EventKind::Disconnected => {
                info!(self.0.log, "{}", event);
                self.0.schedule_retry(event.addr);
            }
            EventKind::Message => {
                // unsolicited server push; managed clients only log it
                debug!(self.0.log, "unhandled message"; "event" => %event);
            }
            EventKind::Error => {
                debug!(self.0.log, "unhandled error event"; "event" => %event);
            }
        }
    }
}
