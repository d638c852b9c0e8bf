// Copyright 2026 Commlink Contributors

//! Protocol base shared by client and server sides of a service: the
//! per-service command table, response building and extraction, and the
//! server-side dispatcher that feeds the work queue.
//!
//! Response payloads always begin with a 4-byte little-endian response
//! code.  A success carries [`ErrorCode::Ok`] followed by the result body;
//! an error carries the code followed by a length-prefixed message string.
//! Application errors therefore travel as ordinary response payloads, not
//! transport faults.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use slog::{debug, info, warn, Logger};

use crate::comm::{Comm, HandlerFactory};
use crate::correlator::DispatchHandler;
use crate::error::{CommError, ErrorCode};
use crate::event::{Event, EventKind};
use crate::protocol::Frame;
use crate::queue::WorkQueue;
use crate::serialize;

/// Immutable mapping from command code to display name, built once at
/// service construction.  Codes are dense: valid codes are exactly
/// `[0, len)`, so an out-of-range code is rejected with a protocol error
/// instead of crashing the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct CommandTable {
    service: &'static str,
    commands: &'static [&'static str],
}

impl CommandTable {
    pub const fn new(
        service: &'static str,
        commands: &'static [&'static str],
    ) -> CommandTable {
        CommandTable { service, commands }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn command_name(&self, code: u16) -> Option<&'static str> {
        self.commands.get(code as usize).copied()
    }

    pub fn valid(&self, code: u16) -> bool {
        (code as usize) < self.commands.len()
    }

    pub fn command_max(&self) -> u16 {
        self.commands.len() as u16
    }
}

/// Completion target handed to a command handler.  Exactly one of
/// [`ok`](ResponseCallback::ok), [`ok_with`](ResponseCallback::ok_with) or
/// [`error`](ResponseCallback::error) must be called; consuming `self`
/// enforces the at-most-once half of that contract.
pub struct ResponseCallback {
    comm: Arc<Comm>,
    addr: SocketAddr,
    id: u32,
    command: u16,
}

impl ResponseCallback {
    /// Builds the callback for a request message event.
    pub fn new(comm: Arc<Comm>, event: &Event) -> Result<ResponseCallback, CommError> {
        let header = event
            .header
            .ok_or_else(|| CommError::Protocol(String::from("event has no header")))?;
        Ok(ResponseCallback {
            comm,
            addr: event.addr,
            id: header.id,
            command: header.command,
        })
    }

    /// Responds with a bare success code.
    pub fn ok(self) -> Result<(), CommError> {
        self.ok_with(Bytes::new())
    }

    /// Responds with the success code followed by `body`.
    pub fn ok_with(self, body: Bytes) -> Result<(), CommError> {
        let mut payload = BytesMut::with_capacity(4 + body.len());
        payload.put_i32_le(ErrorCode::Ok as i32);
        payload.extend_from_slice(&body);
        self.send(payload.freeze())
    }

    /// Responds with an error code and message.
    pub fn error(self, code: i32, message: &str) -> Result<(), CommError> {
        let mut payload =
            BytesMut::with_capacity(4 + serialize::string_len(message));
        payload.put_i32_le(code);
        serialize::encode_string(&mut payload, message);
        self.send(payload.freeze())
    }

    fn send(self, payload: Bytes) -> Result<(), CommError> {
        if self.id == 0 {
            // fire-and-forget request: the sender is not listening
            return Ok(());
        }
        self.comm
            .send_response(self.addr, Frame::response(self.id, self.command, payload))
    }
}

/// Reads the leading response code from a response event's payload.
pub fn response_code(event: &Event) -> Result<i32, CommError> {
    if event.kind != EventKind::Message {
        return Err(CommError::Protocol(String::from("event is not a message")));
    }
    let mut payload = event.payload.clone();
    if payload.remaining() < 4 {
        return Err(CommError::Truncated("response code"));
    }
    Ok(payload.get_i32_le())
}

/// Splits a response event into its result body, turning a non-zero
/// response code into [`CommError::Remote`] with the carried message.
pub fn check_response(event: &Event) -> Result<Bytes, CommError> {
    let code = response_code(event)?;
    let mut body = event.payload.slice(4..);
    if code == ErrorCode::Ok as i32 {
        return Ok(body);
    }
    let message = if body.has_remaining() {
        serialize::decode_string(&mut body)?
    } else {
        String::from("unspecified error")
    };
    Err(CommError::Remote { code, message })
}

/// Group key derived from a peer address, so commands from one peer are
/// serialized while different peers proceed independently.
pub fn group_for_addr(addr: &SocketAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish()
}

/// A service's command handlers.  The substrate decodes the command code
/// and hands over the argument payload; the handler must complete the
/// callback exactly once, successfully or not.  Blocking I/O inside `run`
/// blocks only that peer's group, not the worker pool.
pub trait ServiceHandler: Send + Sync {
    fn table(&self) -> &CommandTable;
    fn run(&self, command: u16, cb: ResponseCallback, payload: Bytes);
}

/// Server-side connection dispatcher.
///
/// Registered as the dispatch handler for each accepted connection.  For
/// message events it validates the command code against the service's
/// table and enqueues the handler invocation on the work queue, keyed by
/// the peer address.  Unknown codes get a protocol-error response naming
/// the code.  Disconnects and errors are logged.
#[derive(Clone)]
pub struct ServiceDispatcher {
    comm: Arc<Comm>,
    queue: Arc<WorkQueue>,
    service: Arc<dyn ServiceHandler>,
    log: Logger,
}

impl ServiceDispatcher {
    pub fn new(
        comm: Arc<Comm>,
        queue: Arc<WorkQueue>,
        service: Arc<dyn ServiceHandler>,
        log: Logger,
    ) -> ServiceDispatcher {
        ServiceDispatcher {
            comm,
            queue,
            service,
            log,
        }
    }
}

impl DispatchHandler for ServiceDispatcher {
    fn handle(&self, event: Event) {
        match event.kind {
            EventKind::Message => {
                let cb = match ResponseCallback::new(Arc::clone(&self.comm), &event) {
                    Ok(cb) => cb,
                    Err(e) => {
                        warn!(self.log, "unusable message event"; "err" => %e);
                        return;
                    }
                };
                let command = match event.command() {
                    Some(c) => c,
                    None => return,
                };
                let table = self.service.table();
                if !table.valid(command) {
                    warn!(self.log, "command code not implemented";
                          "service" => table.service(), "command" => command,
                          "peer" => %event.addr);
                    let message =
                        format!("command code {} not implemented", command);
                    if let Err(e) =
                        cb.error(ErrorCode::ProtocolError as i32, &message)
                    {
                        warn!(self.log, "failed to send protocol error";
                              "err" => %e);
                    }
                    return;
                }
                let service = Arc::clone(&self.service);
                let payload = event.payload.clone();
                let group = group_for_addr(&event.addr);
                self.queue.submit(Some(group), move || {
                    service.run(command, cb, payload);
                });
            }
            EventKind::Disconnected => {
                info!(self.log, "{}", event);
            }
            EventKind::Connected => {
                debug!(self.log, "{}", event);
            }
            EventKind::Error => {
                warn!(self.log, "{}", event);
            }
        }
    }
}

impl HandlerFactory for ServiceDispatcher {
    fn make_handler(&self, _addr: SocketAddr) -> Arc<dyn DispatchHandler> {
        Arc::new(self.clone())
    }
}
