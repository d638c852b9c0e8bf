// Copyright 2026 Commlink Contributors

//! The comm facade: reactor pool ownership, the connection map, and the
//! send paths.
//!
//! A [`Comm`] owns a fixed-size tokio runtime (the reactor pool, sized at
//! startup) plus the request correlator and the map of live connections.
//! All public operations are callable from ordinary threads; the blocking
//! variants suspend the calling thread, never a reactor thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use slog::{error, info, o, Logger};
use tokio::net::TcpListener;
use tokio::runtime;

use crate::connection::{
    run_connect, run_connection, ConnMap, ConnectionHandle, ConnectionState,
};
use crate::correlator::{Correlator, DispatchHandler, ResponseWaiter};
use crate::error::CommError;
use crate::event::{Event, EventKind};
use crate::protocol::{Frame, FLAG_IGNORE_RESPONSE, FLAG_REQUEST};

/// Housekeeping cadence for expiring request deadlines.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed sizing and defaults for a [`Comm`] instance.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Number of reactor threads multiplexing connection I/O.
    pub reactor_threads: usize,
    /// Deadline applied to requests whose caller does not supply one.
    pub default_timeout: Duration,
}

impl Default for CommConfig {
    fn default() -> CommConfig {
        CommConfig {
            reactor_threads: 2,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Produces the dispatch handler for each accepted server-side connection.
pub trait HandlerFactory: Send + Sync {
    fn make_handler(&self, addr: SocketAddr) -> Arc<dyn DispatchHandler>;
}

pub struct Comm {
    runtime: runtime::Runtime,
    connections: Arc<ConnMap>,
    correlator: Arc<Correlator>,
    default_timeout: Duration,
    log: Logger,
}

impl Comm {
    pub fn new(config: CommConfig, log: Logger) -> Result<Comm, CommError> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.reactor_threads.max(1))
            .thread_name("commlink-reactor")
            .enable_all()
            .build()?;

        let correlator = Arc::new(Correlator::new());
        let sweeper = Arc::clone(&correlator);
        runtime.spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                sweeper.sweep(Instant::now());
            }
        });

        Ok(Comm {
            runtime,
            connections: Arc::new(ConnMap::default()),
            correlator,
            default_timeout: config.default_timeout,
            log,
        })
    }

    /// Initiates an outbound connection to `addr`.  Connection-state events
    /// (established, disconnect) are delivered to `handler`; inbound
    /// requests on the connection go there as well.  Frames sent before the
    /// connection completes are queued and written once it does.
    pub fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<(), CommError> {
        let (handle, rx) = ConnectionHandle::new();
        let conn_id = handle.id;
        let state = Arc::clone(&handle.state);
        {
            let mut map = self.connections.lock().expect("connection map poisoned");
            if map.contains_key(&addr) {
                return Err(CommError::AlreadyConnected(addr));
            }
            map.insert(addr, handle);
        }
        self.runtime.spawn(run_connect(
            addr,
            conn_id,
            rx,
            state,
            handler,
            Arc::clone(&self.correlator),
            Arc::clone(&self.connections),
            self.log.new(o!("peer" => addr.to_string())),
        ));
        Ok(())
    }

    /// Binds `addr` and accepts connections until the `Comm` is dropped.
    /// Each accepted connection gets its own reactor task and a dispatch
    /// handler from `factory`.  Returns the bound local address, which is
    /// useful when binding port 0.
    pub fn listen(
        &self,
        addr: SocketAddr,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<SocketAddr, CommError> {
        let listener = self.runtime.block_on(TcpListener::bind(addr))?;
        let local = listener.local_addr()?;
        info!(self.log, "listening"; "address" => %local);

        let connections = Arc::clone(&self.connections);
        let correlator = Arc::clone(&self.correlator);
        let log = self.log.clone();
        self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let (handle, rx) = ConnectionHandle::new();
                        let conn_id = handle.id;
                        let state = Arc::clone(&handle.state);
                        connections
                            .lock()
                            .expect("connection map poisoned")
                            .insert(peer, handle);
                        tokio::spawn(run_connection(
                            stream,
                            peer,
                            conn_id,
                            rx,
                            state,
                            factory.make_handler(peer),
                            Arc::clone(&correlator),
                            Arc::clone(&connections),
                            log.new(o!("peer" => peer.to_string())),
                        ));
                    }
                    Err(e) => {
                        error!(log, "accept failed"; "err" => %e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Sends a request frame to `addr`.
    ///
    /// With a handler, a fresh message id is assigned, the request is
    /// recorded against its deadline, and the handler later receives
    /// exactly one of: the response message, a timeout error, or a
    /// broken-connection error.  Without a handler the frame is marked
    /// fire-and-forget (id 0) and nothing is recorded.
    ///
    /// Returns the assigned message id (0 for fire-and-forget).
    pub fn send_request(
        &self,
        addr: SocketAddr,
        mut frame: Frame,
        handler: Option<Arc<dyn DispatchHandler>>,
        timeout: Option<Duration>,
    ) -> Result<u32, CommError> {
        frame.header.flags |= FLAG_REQUEST;
        let id = match handler {
            Some(target) => {
                let id = self.correlator.next_id();
                frame.header.id = id;
                frame.header.flags &= !FLAG_IGNORE_RESPONSE;
                let deadline =
                    Instant::now() + timeout.unwrap_or(self.default_timeout);
                self.correlator.register(id, addr, target, deadline);
                id
            }
            None => {
                frame.header.id = 0;
                frame.header.flags |= FLAG_IGNORE_RESPONSE;
                0
            }
        };
        if let Err(e) = self.send_frame(addr, frame) {
            if id != 0 {
                let _ = self.correlator.resolve(id);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Synchronous request: suspends the calling thread until the
    /// correlator delivers a result.  A message event becomes `Ok`; timeout
    /// and connection errors become the corresponding `CommError`.
    pub fn send_request_blocking(
        &self,
        addr: SocketAddr,
        frame: Frame,
        timeout: Option<Duration>,
    ) -> Result<Event, CommError> {
        let (waiter, rx) = ResponseWaiter::pair();
        self.send_request(addr, frame, Some(waiter), timeout)?;
        // the sweep delivers the timeout; the local wait is only a backstop
        let wait = timeout.unwrap_or(self.default_timeout) + SWEEP_INTERVAL * 4;
        let event = rx.recv_timeout(wait).map_err(|_| CommError::Timeout)?;
        match event.kind {
            EventKind::Message => Ok(event),
            _ => Err(CommError::from_code(event.error, addr)),
        }
    }

    /// Sends a response frame back to `addr`.  The caller supplies the
    /// message id taken from the request event; the request flag is
    /// cleared here.
    pub fn send_response(
        &self,
        addr: SocketAddr,
        mut frame: Frame,
    ) -> Result<(), CommError> {
        frame.header.flags &= !FLAG_REQUEST;
        self.send_frame(addr, frame)
    }

    fn send_frame(&self, addr: SocketAddr, frame: Frame) -> Result<(), CommError> {
        let map = self.connections.lock().expect("connection map poisoned");
        let handle = map.get(&addr).ok_or(CommError::NotConnected(addr))?;
        handle
            .tx
            .send(frame)
            .map_err(|_| CommError::BrokenConnection(addr))
    }

    /// Closes the connection to `addr`, if any.  Pending requests on it are
    /// failed with a broken-connection error.
    pub fn close(&self, addr: SocketAddr) {
        let removed = self
            .connections
            .lock()
            .expect("connection map poisoned")
            .remove(&addr);
        // dropping the handle's sender makes the reactor task wind down
        drop(removed);
    }

    /// Current state of the connection to `addr`, if one exists.
    pub fn connection_state(&self, addr: SocketAddr) -> Option<ConnectionState> {
        self.connections
            .lock()
            .expect("connection map poisoned")
            .get(&addr)
            .map(|h| h.state())
    }

    /// Handle to the reactor runtime, for scheduling auxiliary work such as
    /// the connection manager's retry timers.
    pub fn handle(&self) -> &runtime::Handle {
        self.runtime.handle()
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    /// Convenience for a request whose payload is a single string.
    pub fn build_request(command: u16, arg: &str) -> Frame {
        let mut payload = bytes::BytesMut::with_capacity(crate::serialize::string_len(arg));
        crate::serialize::encode_string(&mut payload, arg);
        Frame::request(command, payload.freeze())
    }

    /// Convenience for a request with an empty payload.
    pub fn build_request_empty(command: u16) -> Frame {
        Frame::request(command, Bytes::new())
    }
}
