// Copyright 2026 Commlink Contributors

//! Events: decoded units of activity delivered to dispatch targets.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::ErrorCode;
use crate::protocol::Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A complete inbound frame.
    Message,
    /// The connection to the peer was established.
    Connected,
    /// The connection to the peer went away; `error` says why.
    Disconnected,
    /// A request-level failure such as a timeout.
    Error,
}

/// One decoded unit of activity.
///
/// Constructed by the reactor task that completed a read or observed a
/// connection-state change, then consumed exactly once by a dispatch
/// target.  For `Message` events the header is present and the payload is
/// positioned just past it.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub addr: SocketAddr,
    pub error: ErrorCode,
    pub header: Option<Header>,
    pub payload: Bytes,
}

impl Event {
    pub fn message(addr: SocketAddr, header: Header, payload: Bytes) -> Event {
        Event {
            kind: EventKind::Message,
            addr,
            error: ErrorCode::Ok,
            header: Some(header),
            payload,
        }
    }

    pub fn connected(addr: SocketAddr) -> Event {
        Event {
            kind: EventKind::Connected,
            addr,
            error: ErrorCode::Ok,
            header: None,
            payload: Bytes::new(),
        }
    }

    pub fn disconnected(addr: SocketAddr, error: ErrorCode) -> Event {
        Event {
            kind: EventKind::Disconnected,
            addr,
            error,
            header: None,
            payload: Bytes::new(),
        }
    }

    pub fn error(addr: SocketAddr, error: ErrorCode) -> Event {
        Event {
            kind: EventKind::Error,
            addr,
            error,
            header: None,
            payload: Bytes::new(),
        }
    }

    /// Command code of a message event.
    pub fn command(&self) -> Option<u16> {
        self.header.map(|h| h.command)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Message => match self.header {
                Some(h) => write!(
                    f,
                    "MESSAGE from {} (id={}, command={})",
                    self.addr, h.id, h.command
                ),
                None => write!(f, "MESSAGE from {}", self.addr),
            },
            EventKind::Connected => write!(f, "CONNECTION ESTABLISHED {}", self.addr),
            EventKind::Disconnected => {
                write!(f, "DISCONNECT {} - {}", self.addr, self.error)
            }
            EventKind::Error => write!(f, "ERROR {} - {}", self.addr, self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_kind_and_peer() {
        let addr: SocketAddr = "127.0.0.1:3800".parse().unwrap();
        let mut header = Header::new(4);
        header.id = 9;
        let event = Event::message(addr, header, Bytes::new());
        assert_eq!(
            event.to_string(),
            "MESSAGE from 127.0.0.1:3800 (id=9, command=4)"
        );
        let event = Event::disconnected(addr, ErrorCode::BrokenConnection);
        assert_eq!(
            event.to_string(),
            "DISCONNECT 127.0.0.1:3800 - COMM broken connection"
        );
    }
}
