// Copyright 2026 Commlink Contributors

//! Commlink: an asynchronous comm substrate for distributed services
//!
//! Commlink is the transport layer that server-side components (lock
//! services, filesystem brokers, master clients) are built on: framed
//! binary messages over TCP, a fixed pool of reactor threads multiplexing
//! connection I/O, message-id correlation between outbound requests and
//! their responses (blocking and callback delivery), managed connections
//! with bounded retry, and a work-dispatch queue that serializes commands
//! per peer while running unrelated work concurrently.
//!
//! Protocol definition
//!
//! Commlink frames have the following structure:
//!
//! * VERSION          1-byte integer.  The only supported value is "1".
//!
//! * TOTALLEN0...3    4-byte little-endian unsigned integer: the total
//!                    frame length in bytes, including this header.
//!
//! * FLAGS            1-byte flag field:
//!
//!     * FLAG_REQUEST          0x1  set on requests, clear on responses
//!
//!     * FLAG_IGNORE_RESPONSE  0x2  the sender expects no response
//!
//! * MSGID0...3       4-byte little-endian unsigned integer identifying
//!                    the message on its connection.  0 means no response
//!                    is expected.  Ids are allocated sequentially from a
//!                    circular 32-bit space, skipping 0.
//!
//! * COMMAND0...1     2-byte little-endian command code, interpreted by
//!                    the target service's command table.
//!
//! * DATA0...DATAN    Payload bytes.  Strings inside payloads are encoded
//!                    as a vint byte length followed by UTF-8 data with no
//!                    terminator; all multi-byte integers are
//!                    little-endian.
//!
//! Response payloads begin with a 4-byte little-endian response code (0 on
//! success) so that application errors travel as ordinary data, not
//! transport faults.

pub mod comm;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod event;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod serialize;
pub mod service;

pub use comm::{Comm, CommConfig, HandlerFactory};
pub use connection::ConnectionState;
pub use correlator::{DispatchHandler, HandlerFn, ResponseWaiter};
pub use error::{CommError, ErrorCode};
pub use event::{Event, EventKind};
pub use manager::{ConnectionManager, ManagedState, RetryPolicy};
pub use protocol::{Frame, FrameCodec, Header};
pub use queue::WorkQueue;
pub use service::{
    check_response, group_for_addr, response_code, CommandTable,
    ResponseCallback, ServiceDispatcher, ServiceHandler,
};
