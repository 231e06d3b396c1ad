//! Frame codec for the log-shipping transport.
//!
//! Every frame opens with a two-byte header: the protocol version `2` and a
//! frame type. Clients announce a window size (`W`), then stream events as
//! keyed records (`D`), JSON records (`J`), or a zlib-compressed run of
//! those (`C`). The server acknowledges with `A` carrying the highest
//! sequence number handed off downstream.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use bytes::{BufMut, BytesMut};
use cidrwatch_common::CidrwatchError;
use flate2::read::ZlibDecoder;

pub const VERSION: u8 = b'2';

pub const FRAME_WINDOW: u8 = b'W';
pub const FRAME_DATA: u8 = b'D';
pub const FRAME_JSON: u8 = b'J';
pub const FRAME_COMPRESSED: u8 = b'C';
pub const FRAME_ACK: u8 = b'A';

/// Upper bound for any length field; beyond this the stream is corrupt.
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;
/// Upper bound for the key/value pair count of one data frame.
const MAX_PAIRS: u32 = 1024;

/// One shipped event. `message` is absent for records missing the field;
/// such events are skipped, not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub seq: u32,
    pub message: Option<String>,
}

/// One decoded frame. Compressed frames arrive pre-flattened.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    WindowSize(u32),
    Events(Vec<Event>),
}

/// Read a single frame from the stream.
pub fn read_frame(reader: &mut impl Read) -> Result<Frame, CidrwatchError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;
    decode_frame(header, reader, true)
}

fn decode_frame(
    header: [u8; 2],
    reader: &mut impl Read,
    allow_compressed: bool,
) -> Result<Frame, CidrwatchError> {
    if header[0] != VERSION {
        return Err(CidrwatchError::Protocol(format!(
            "unsupported protocol version 0x{:02x}",
            header[0]
        )));
    }
    match header[1] {
        FRAME_WINDOW => Ok(Frame::WindowSize(read_u32(reader)?)),
        FRAME_DATA => Ok(Frame::Events(vec![read_data_event(reader)?])),
        FRAME_JSON => Ok(Frame::Events(vec![read_json_event(reader)?])),
        FRAME_COMPRESSED if allow_compressed => read_compressed(reader),
        FRAME_COMPRESSED => Err(CidrwatchError::Protocol(
            "nested compressed frame".to_string(),
        )),
        other => Err(CidrwatchError::Protocol(format!(
            "unknown frame type 0x{:02x}",
            other
        ))),
    }
}

fn read_data_event(reader: &mut impl Read) -> Result<Event, CidrwatchError> {
    let seq = read_u32(reader)?;
    let pairs = read_u32(reader)?;
    if pairs > MAX_PAIRS {
        return Err(CidrwatchError::Protocol(format!(
            "data frame with {} pairs",
            pairs
        )));
    }

    let mut fields: HashMap<String, String> = HashMap::with_capacity(pairs as usize);
    for _ in 0..pairs {
        let key = read_string(reader)?;
        let value = read_string(reader)?;
        fields.insert(key, value);
    }

    Ok(Event {
        seq,
        message: fields.remove("message"),
    })
}

fn read_json_event(reader: &mut impl Read) -> Result<Event, CidrwatchError> {
    let seq = read_u32(reader)?;
    let payload = read_bytes(reader)?;
    // A record that is not a JSON object (or lacks "message") is a skipped
    // event, not a framing error.
    let message = serde_json::from_slice::<serde_json::Value>(&payload)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });
    Ok(Event { seq, message })
}

fn read_compressed(reader: &mut impl Read) -> Result<Frame, CidrwatchError> {
    let payload = read_bytes(reader)?;
    let mut inflated = Vec::new();
    ZlibDecoder::new(payload.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|e| CidrwatchError::Protocol(format!("bad zlib payload: {}", e)))?;

    let mut cursor = Cursor::new(inflated);
    let mut events = Vec::new();
    loop {
        let mut header = [0u8; 2];
        match cursor.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        match decode_frame(header, &mut cursor, false)? {
            Frame::Events(mut inner) => events.append(&mut inner),
            Frame::WindowSize(_) => {
                return Err(CidrwatchError::Protocol(
                    "window frame inside compressed payload".to_string(),
                ))
            }
        }
    }
    Ok(Frame::Events(events))
}

/// Acknowledge everything up to and including `seq`.
pub fn write_ack(writer: &mut impl Write, seq: u32) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(VERSION);
    buf.put_u8(FRAME_ACK);
    buf.put_u32(seq);
    writer.write_all(&buf)?;
    writer.flush()
}

fn read_u32(reader: &mut impl Read) -> Result<u32, CidrwatchError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_bytes(reader: &mut impl Read) -> Result<Vec<u8>, CidrwatchError> {
    let len = read_u32(reader)?;
    if len > MAX_PAYLOAD {
        return Err(CidrwatchError::Protocol(format!(
            "length field {} exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string(reader: &mut impl Read) -> Result<String, CidrwatchError> {
    let bytes = read_bytes(reader)?;
    String::from_utf8(bytes)
        .map_err(|_| CidrwatchError::Protocol("non-UTF-8 string field".to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_frame() {
        let bytes = encode::window(250);
        let frame = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(frame, Frame::WindowSize(250));
    }

    #[test]
    fn data_frame_extracts_message() {
        let bytes = encode::data(7, &[("host", "web-1"), ("message", "10.0.0.1 - - ...")]);
        let frame = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            frame,
            Frame::Events(vec![Event {
                seq: 7,
                message: Some("10.0.0.1 - - ...".to_string()),
            }])
        );
    }

    #[test]
    fn data_frame_without_message_is_skippable() {
        let bytes = encode::data(8, &[("host", "web-1")]);
        let frame = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            frame,
            Frame::Events(vec![Event {
                seq: 8,
                message: None,
            }])
        );
    }

    #[test]
    fn json_frame_extracts_message() {
        let bytes = encode::json(3, r#"{"message":"a log line","beat":"x"}"#);
        let frame = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            frame,
            Frame::Events(vec![Event {
                seq: 3,
                message: Some("a log line".to_string()),
            }])
        );
    }

    #[test]
    fn malformed_json_payload_yields_skippable_event() {
        let bytes = encode::json(4, "{not json");
        let frame = read_frame(&mut bytes.as_slice()).unwrap();
        assert_eq!(
            frame,
            Frame::Events(vec![Event {
                seq: 4,
                message: None,
            }])
        );
    }

    #[test]
    fn compressed_frame_flattens_events() {
        let inner = vec![
            encode::data(1, &[("message", "one")]),
            encode::data(2, &[("message", "two")]),
            encode::json(3, r#"{"message":"three"}"#),
        ];
        let bytes = encode::compressed(&inner);
        let frame = read_frame(&mut bytes.as_slice()).unwrap();

        match frame {
            Frame::Events(events) => {
                assert_eq!(events.len(), 3);
                assert_eq!(events[2].message.as_deref(), Some("three"));
                assert_eq!(events[2].seq, 3);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn bad_version_is_protocol_error() {
        let bytes = [b'1', FRAME_WINDOW, 0, 0, 0, 1];
        let err = read_frame(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CidrwatchError::Protocol(_)));
    }

    #[test]
    fn unknown_frame_type_is_protocol_error() {
        let bytes = [VERSION, b'Z'];
        let err = read_frame(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CidrwatchError::Protocol(_)));
    }

    #[test]
    fn oversized_length_is_protocol_error() {
        let mut bytes = vec![VERSION, FRAME_JSON];
        bytes.extend(7u32.to_be_bytes());
        bytes.extend(u32::MAX.to_be_bytes());
        let err = read_frame(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CidrwatchError::Protocol(_)));
    }

    #[test]
    fn corrupt_zlib_is_protocol_error() {
        let mut bytes = vec![VERSION, FRAME_COMPRESSED];
        bytes.extend(4u32.to_be_bytes());
        bytes.extend([0xDE, 0xAD, 0xBE, 0xEF]);
        let err = read_frame(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, CidrwatchError::Protocol(_)));
    }

    #[test]
    fn ack_wire_form() {
        let mut out = Vec::new();
        write_ack(&mut out, 0x0102_0304).unwrap();
        assert_eq!(out, [VERSION, FRAME_ACK, 0x01, 0x02, 0x03, 0x04]);
    }
}
