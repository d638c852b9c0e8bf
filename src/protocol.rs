// Copyright 2026 Commlink Contributors

//! Framing codec: the fixed 12-byte header and the restartable
//! [`FrameCodec`].
//!
//! Every frame is `[header][payload]`.  The declared total length always
//! includes the header itself.  A buffer holding fewer bytes than the
//! declared length is treated as truncated, not malformed: the decoder
//! leaves the buffer untouched and decodes from the same logical start once
//! more bytes arrive.  Only a bad version byte or an impossible length is a
//! protocol error, because after either the stream can no longer be
//! realigned.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use byteorder::{ByteOrder, LittleEndian};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CommError;

const OFF_VERSION: usize = 0x0;
const OFF_TOTAL_LEN: usize = 0x1;
const OFF_FLAGS: usize = 0x5;
const OFF_ID: usize = 0x6;
const OFF_COMMAND: usize = 0xa;

/// Size of the fixed frame header in bytes.
pub const HEADER_LENGTH: usize = 0xc;

/// The only supported protocol version.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Largest frame the codec will produce or accept, header included.
/// A declared length beyond this is a protocol error rather than a reason
/// to buffer without bound.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Set on requests; clear on responses.
pub const FLAG_REQUEST: u8 = 0x01;

/// Set when the sender does not expect a response (message id is 0).
pub const FLAG_IGNORE_RESPONSE: u8 = 0x02;

/// Fixed-width header carried at the start of every frame.
///
/// * VERSION        1-byte protocol identifier.  The only supported value
///                  is "1".
/// * TOTALLEN0..3   4-byte little-endian unsigned integer: the total frame
///                  length in bytes, header included.
/// * FLAGS          1-byte flag field; see [`FLAG_REQUEST`] and
///                  [`FLAG_IGNORE_RESPONSE`].
/// * MSGID0..3      4-byte little-endian unsigned integer identifying the
///                  message on its connection.  0 means no response is
///                  expected.
/// * COMMAND0..1    2-byte little-endian command code, interpreted by the
///                  service's command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub total_len: u32,
    pub flags: u8,
    pub id: u32,
    pub command: u16,
}

impl Header {
    pub fn new(command: u16) -> Header {
        Header {
            version: PROTOCOL_VERSION,
            total_len: 0,
            flags: FLAG_REQUEST,
            id: 0,
            command,
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }

    pub fn expects_response(&self) -> bool {
        self.flags & FLAG_IGNORE_RESPONSE == 0 && self.id != 0
    }

    fn parse(buf: &[u8]) -> Header {
        Header {
            version: buf[OFF_VERSION],
            total_len: LittleEndian::read_u32(
                &buf[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 4],
            ),
            flags: buf[OFF_FLAGS],
            id: LittleEndian::read_u32(&buf[OFF_ID..OFF_ID + 4]),
            command: LittleEndian::read_u16(&buf[OFF_COMMAND..OFF_COMMAND + 2]),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u32_le(self.total_len);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.id);
        buf.put_u16_le(self.command);
    }
}

/// One header+payload unit exchanged over a connection.
///
/// The payload is the bytes after the header; the command code has already
/// been consumed into the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// A request frame.  The message id is assigned when the frame is
    /// handed to the comm layer for sending.
    pub fn request(command: u16, payload: Bytes) -> Frame {
        Frame {
            header: Header::new(command),
            payload,
        }
    }

    /// A response frame carrying the id of the request it answers.
    pub fn response(id: u32, command: u16, payload: Bytes) -> Frame {
        let mut header = Header::new(command);
        header.flags &= !FLAG_REQUEST;
        header.id = id;
        Frame { header, payload }
    }
}

/// Restartable frame codec.
///
/// Decoding is purely a function of the bytes available: with fewer bytes
/// than a complete frame it returns `None` and retries from the same
/// position on the next call.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CommError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = Header::parse(&src[..HEADER_LENGTH]);
        if header.version != PROTOCOL_VERSION {
            return Err(CommError::Protocol(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }
        let total = header.total_len as usize;
        if total < HEADER_LENGTH || total > MAX_FRAME_LEN {
            return Err(CommError::Protocol(format!(
                "declared frame length {} out of range",
                total
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        frame.advance(HEADER_LENGTH);
        Ok(Some(Frame {
            header,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CommError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CommError> {
        let total = HEADER_LENGTH + item.payload.len();
        if total > MAX_FRAME_LEN {
            return Err(CommError::Protocol(format!(
                "frame length {} exceeds maximum",
                total
            )));
        }
        let mut header = item.header;
        header.total_len = total as u32;
        dst.reserve(total);
        header.write(dst);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut buf = BytesMut::new();
        for frame in frames {
            FrameCodec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = FrameCodec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::request(0, Bytes::new()),
            Frame::request(3, Bytes::from_static(b"open /lock/a")),
            Frame::response(7, 3, Bytes::from_static(&[0, 0, 0, 0])),
        ]
    }

    #[test]
    fn total_length_includes_header() {
        let mut buf = BytesMut::new();
        let frame = Frame::request(1, Bytes::from_static(b"abc"));
        FrameCodec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LENGTH + 3);
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header.total_len as usize, HEADER_LENGTH + 3);
        assert_eq!(decoded.payload.as_ref(), b"abc");
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let full = encode_all(&sample_frames());
        let mut buf = BytesMut::from(&full[..HEADER_LENGTH - 1]);
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_LENGTH - 1);
    }

    #[test]
    fn partial_payload_waits_for_more_bytes() {
        let full = encode_all(&sample_frames());
        let mut buf = BytesMut::from(&full[..HEADER_LENGTH + 2]);
        // first frame is empty, so one frame decodes and the next waits
        assert!(FrameCodec.decode(&mut buf).unwrap().is_some());
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_version_is_a_protocol_error() {
        let mut buf = encode_all(&sample_frames());
        buf[OFF_VERSION] = 9;
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CommError::Protocol(_))
        ));
    }

    #[test]
    fn undersized_declared_length_is_a_protocol_error() {
        let mut buf = encode_all(&[Frame::request(0, Bytes::new())]);
        buf[OFF_TOTAL_LEN] = (HEADER_LENGTH - 1) as u8;
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CommError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_declared_length_is_a_protocol_error() {
        let mut buf = encode_all(&[Frame::request(0, Bytes::new())]);
        LittleEndian::write_u32(
            &mut buf[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 4],
            (MAX_FRAME_LEN + 1) as u32,
        );
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(CommError::Protocol(_))
        ));
    }

    #[test]
    fn response_round_trip_recovers_message_id() {
        let mut buf = BytesMut::new();
        let request = Frame::request(2, Bytes::from_static(b"payload"));
        let mut framed = request;
        framed.header.id = 77;
        FrameCodec.encode(framed, &mut buf).unwrap();

        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.header.is_request());
        let response =
            Frame::response(decoded.header.id, decoded.header.command, Bytes::new());
        FrameCodec.encode(response, &mut buf).unwrap();
        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.header.is_request());
        assert_eq!(decoded.header.id, 77);
        assert_eq!(decoded.header.command, 2);
    }

    quickcheck! {
        /// Feeding the stream in arbitrarily small chunks decodes the same
        /// frame sequence as decoding it in one shot.
        fn chunked_decode_matches_one_shot(
            messages: Vec<(u16, u32, Vec<u8>)>,
            splits: Vec<u8>
        ) -> bool {
            let frames: Vec<Frame> = messages
                .into_iter()
                .map(|(command, id, payload)| {
                    let mut frame = Frame::request(command, Bytes::from(payload));
                    frame.header.id = id;
                    frame
                })
                .collect();
            let full = encode_all(&frames);

            let mut one_shot = full.clone();
            let expected = decode_all(&mut one_shot);

            let mut chunked = BytesMut::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut split_iter = splits.into_iter();
            while offset < full.len() {
                let step = (split_iter.next().unwrap_or(1) as usize % 7) + 1;
                let end = usize::min(offset + step, full.len());
                chunked.extend_from_slice(&full[offset..end]);
                offset = end;
                decoded.extend(decode_all(&mut chunked));
            }

            decoded == expected
        }
    }
}
