// Copyright 2026 Commlink Contributors

//! Connection tasks.
//!
//! Exactly one reactor task owns a connection's socket and buffers.  All
//! other components refer to the connection by address through a
//! [`ConnectionHandle`] and communicate with the task by message passing:
//! outbound frames go through the handle's FIFO queue and are written in
//! order.  This removes any need for locking on the read/write path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use slog::{debug, info, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::correlator::{Correlator, DispatchHandler};
use crate::error::{CommError, ErrorCode};
use crate::event::Event;
use crate::protocol::{Frame, FrameCodec};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Broken,
    Closed,
}

/// Shared reference to a connection owned by a reactor task.
pub(crate) struct ConnectionHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<Frame>,
    pub state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn new() -> (ConnectionHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            state: Arc::new(Mutex::new(ConnectionState::Connecting)),
        };
        (handle, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state poisoned")
    }

    fn set_state(state: &Arc<Mutex<ConnectionState>>, value: ConnectionState) {
        *state.lock().expect("connection state poisoned") = value;
    }
}

pub(crate) type ConnMap = Mutex<HashMap<SocketAddr, ConnectionHandle>>;

/// Removes `addr` from the map only if it still refers to this task's
/// connection; a reconnect may already have replaced the entry.
fn remove_if_current(connections: &ConnMap, addr: SocketAddr, conn_id: u64) {
    let mut map = connections.lock().expect("connection map poisoned");
    if map.get(&addr).map(|h| h.id) == Some(conn_id) {
        map.remove(&addr);
    }
}

/// Dials `addr` and, on success, drives the connection until it closes.
/// A failed dial fails pending requests and reports a connect error to the
/// registered handler.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_connect(
    addr: SocketAddr,
    conn_id: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
    state: Arc<Mutex<ConnectionState>>,
    handler: Arc<dyn DispatchHandler>,
    correlator: Arc<Correlator>,
    connections: Arc<ConnMap>,
    log: Logger,
) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            run_connection(
                stream, addr, conn_id, rx, state, handler, correlator, connections,
                log,
            )
            .await
        }
        Err(e) => {
            info!(log, "connect failed"; "peer" => %addr, "err" => %e);
            ConnectionHandle::set_state(&state, ConnectionState::Broken);
            remove_if_current(&connections, addr, conn_id);
            correlator.fail_address(addr, ErrorCode::ConnectError);
            handler.handle(Event::disconnected(addr, ErrorCode::ConnectError));
        }
    }
}

/// How the writer half finished draining the outbound queue.
enum WriterExit {
    /// All senders dropped: the connection was explicitly closed.
    Drained,
    /// A write failed; the socket is unusable.
    Failed,
}

/// Drives one established connection: delivers inbound frames and tears
/// the connection down on failure.  The socket is split so the outbound
/// queue drains on its own task; a write that cannot complete never stops
/// the read side from being polled.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    state: Arc<Mutex<ConnectionState>>,
    handler: Arc<dyn DispatchHandler>,
    correlator: Arc<Correlator>,
    connections: Arc<ConnMap>,
    log: Logger,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec);
    ConnectionHandle::set_state(&state, ConnectionState::Connected);
    debug!(log, "connection up"; "peer" => %addr);
    handler.handle(Event::connected(addr));

    let mut writer = FramedWrite::new(write_half, FrameCodec);
    let writer_log = log.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                warn!(writer_log, "write failed"; "peer" => %addr, "err" => %e);
                return WriterExit::Failed;
            }
        }
        // explicitly closed: flush what we have and stop quietly
        let _ = writer.flush().await;
        WriterExit::Drained
    });

    let error = loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(frame)) => {
                    deliver_frame(addr, frame, &handler, &correlator, &log)
                }
                Some(Err(e)) => {
                    warn!(log, "read failed"; "peer" => %addr, "err" => %e);
                    break match e {
                        CommError::Protocol(_) => ErrorCode::ProtocolError,
                        _ => ErrorCode::BrokenConnection,
                    };
                }
                None => break ErrorCode::BrokenConnection,
            },
            exit = &mut writer_task => match exit {
                Ok(WriterExit::Drained) => {
                    ConnectionHandle::set_state(&state, ConnectionState::Closed);
                    remove_if_current(&connections, addr, conn_id);
                    correlator.fail_address(addr, ErrorCode::BrokenConnection);
                    debug!(log, "connection closed"; "peer" => %addr);
                    return;
                }
                _ => break ErrorCode::BrokenConnection,
            },
        }
    };
    writer_task.abort();

    ConnectionHandle::set_state(&state, ConnectionState::Broken);
    remove_if_current(&connections, addr, conn_id);
    let failed = correlator.fail_address(addr, ErrorCode::BrokenConnection);
    if failed > 0 {
        debug!(log, "failed pending requests on broken connection";
               "peer" => %addr, "count" => failed);
    }
    handler.handle(Event::disconnected(addr, error));
}

/// Routes one decoded frame: responses go to the pending request's target,
/// requests to the connection's registered handler.
fn deliver_frame(
    addr: SocketAddr,
    frame: Frame,
    handler: &Arc<dyn DispatchHandler>,
    correlator: &Correlator,
    log: &Logger,
) {
    if frame.header.is_request() {
        handler.handle(Event::message(addr, frame.header, frame.payload));
    } else {
        match correlator.resolve(frame.header.id) {
            Some(target) => {
                target.handle(Event::message(addr, frame.header, frame.payload))
            }
            None => {
                // response for a request that already timed out or failed
                debug!(log, "dropping response with no pending request";
                       "peer" => %addr, "id" => frame.header.id);
            }
        }
    }
}
