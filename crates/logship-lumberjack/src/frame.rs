use bytes::{Buf, BufMut, BytesMut};
use flate2::write::{DeflateDecoder, DeflateEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use logship_core::config::CompressionWrapper;
use logship_core::Event;
use serde_json::Value;
use std::io::{self, Write};
use tokio_util::codec::Decoder;

/// Upper bound on any length field read off the wire. Connections sending
/// larger frames are protocol-broken and get closed.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const CODE_WINDOW: u8 = b'W';
const CODE_DATA: u8 = b'D';
const CODE_JSON: u8 = b'J';
const CODE_COMPRESSED: u8 = b'C';
const CODE_ACK: u8 = b'A';

fn version_byte(version: u8) -> u8 {
    b'0' + version
}

/// A decoded Lumberjack frame. `Compressed` carries its already-parsed
/// sub-frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Window(u32),
    Data { seq: u32, pairs: Vec<(String, String)> },
    Json { seq: u32, payload: Value },
    Compressed(Vec<Frame>),
    Ack(u32),
}

impl Frame {
    /// Convert a data-bearing frame into its sequence and event. Window,
    /// ack and compressed frames return `None`.
    pub fn into_event(self) -> Option<(u32, Event)> {
        match self {
            Frame::Data { seq, pairs } => {
                let mut map = serde_json::Map::with_capacity(pairs.len());
                for (k, v) in pairs {
                    map.insert(k, Value::String(v));
                }
                Some((seq, Event::from_json_map(map)))
            }
            Frame::Json { seq, payload } => match payload {
                Value::Object(map) => Some((seq, Event::from_json_map(map))),
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("line".to_string(), Value::String(other.to_string()));
                    Some((seq, Event::from_json_map(map)))
                }
            },
            _ => None,
        }
    }
}

/// Append a `W` frame announcing the batch window size.
pub fn encode_window(buf: &mut BytesMut, version: u8, size: u32) {
    buf.reserve(6);
    buf.put_u8(version_byte(version));
    buf.put_u8(CODE_WINDOW);
    buf.put_u32(size);
}

/// Append an `A` frame acknowledging `seq`.
pub fn encode_ack(buf: &mut BytesMut, version: u8, seq: u32) {
    buf.reserve(6);
    buf.put_u8(version_byte(version));
    buf.put_u8(CODE_ACK);
    buf.put_u32(seq);
}

/// Append a version 1 `D` frame with length-prefixed key/value pairs.
pub fn encode_data(buf: &mut BytesMut, seq: u32, pairs: &[(String, String)]) {
    buf.put_u8(version_byte(1));
    buf.put_u8(CODE_DATA);
    buf.put_u32(seq);
    buf.put_u32(pairs.len() as u32);
    for (key, value) in pairs {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

/// Append a version 2 `J` frame carrying one JSON document.
pub fn encode_json(buf: &mut BytesMut, seq: u32, json: &str) {
    buf.put_u8(version_byte(2));
    buf.put_u8(CODE_JSON);
    buf.put_u32(seq);
    buf.put_u32(json.len() as u32);
    buf.put_slice(json.as_bytes());
}

/// Append a `C` frame wrapping an already-encoded frame stream.
pub fn encode_compressed(
    buf: &mut BytesMut,
    version: u8,
    body: &[u8],
    wrapper: CompressionWrapper,
) -> io::Result<()> {
    let compressed = compress(body, wrapper)?;
    buf.put_u8(version_byte(version));
    buf.put_u8(CODE_COMPRESSED);
    buf.put_u32(compressed.len() as u32);
    buf.put_slice(&compressed);
    Ok(())
}

pub fn compress(data: &[u8], wrapper: CompressionWrapper) -> io::Result<Vec<u8>> {
    match wrapper {
        CompressionWrapper::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionWrapper::Raw => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

pub fn decompress(data: &[u8], wrapper: CompressionWrapper) -> io::Result<Vec<u8>> {
    match wrapper {
        CompressionWrapper::Zlib => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder.write_all(data)?;
            decoder.finish()
        }
        CompressionWrapper::Raw => {
            let mut decoder = DeflateDecoder::new(Vec::new());
            decoder.write_all(data)?;
            decoder.finish()
        }
    }
}

/// Frame decoder over a growable socket buffer. Also used, via
/// [`parse_buffer`], on the fixed decompressed payload of a `C` frame.
pub struct FrameDecoder {
    wrapper: CompressionWrapper,
}

impl FrameDecoder {
    pub fn new(wrapper: CompressionWrapper) -> Self {
        Self { wrapper }
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn checked_len(len: u32, what: &str) -> io::Result<usize> {
    let len = len as usize;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("{} length {} exceeds limit", what, len)));
    }
    Ok(len)
}

fn read_string(src: &[u8], at: usize, len: usize, what: &str) -> io::Result<String> {
    String::from_utf8(src[at..at + len].to_vec())
        .map_err(|_| invalid(format!("{} is not valid UTF-8", what)))
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let version = src[0];
        if version != b'1' && version != b'2' {
            return Err(invalid(format!("unknown protocol version byte 0x{:02x}", version)));
        }

        match src[1] {
            CODE_WINDOW => {
                if src.len() < 6 {
                    return Ok(None);
                }
                let size = read_u32(src, 2);
                src.advance(6);
                Ok(Some(Frame::Window(size)))
            }
            CODE_ACK => {
                if src.len() < 6 {
                    return Ok(None);
                }
                let seq = read_u32(src, 2);
                src.advance(6);
                Ok(Some(Frame::Ack(seq)))
            }
            CODE_JSON => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let seq = read_u32(src, 2);
                let plen = checked_len(read_u32(src, 6), "json payload")?;
                if src.len() < 10 + plen {
                    return Ok(None);
                }
                let payload: Value = serde_json::from_slice(&src[10..10 + plen])
                    .map_err(|e| invalid(format!("bad json payload: {}", e)))?;
                src.advance(10 + plen);
                Ok(Some(Frame::Json { seq, payload }))
            }
            CODE_COMPRESSED => {
                if src.len() < 6 {
                    return Ok(None);
                }
                let clen = checked_len(read_u32(src, 2), "compressed payload")?;
                if src.len() < 6 + clen {
                    return Ok(None);
                }
                let inflated = decompress(&src[6..6 + clen], self.wrapper)?;
                src.advance(6 + clen);
                let frames = parse_buffer(&inflated, self.wrapper)?;
                Ok(Some(Frame::Compressed(frames)))
            }
            CODE_DATA => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let seq = read_u32(src, 2);
                let count = read_u32(src, 6) as usize;
                // Each pair takes at least 8 bytes of length prefixes.
                if count > MAX_PAYLOAD / 8 {
                    return Err(invalid(format!("pair count {} exceeds limit", count)));
                }
                let mut pos = 10;
                let mut pairs = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    if src.len() < pos + 4 {
                        return Ok(None);
                    }
                    let klen = checked_len(read_u32(src, pos), "key")?;
                    pos += 4;
                    if src.len() < pos + klen + 4 {
                        return Ok(None);
                    }
                    let key = read_string(src, pos, klen, "key")?;
                    pos += klen;
                    let vlen = checked_len(read_u32(src, pos), "value")?;
                    pos += 4;
                    if src.len() < pos + vlen {
                        return Ok(None);
                    }
                    let value = read_string(src, pos, vlen, "value")?;
                    pos += vlen;
                    pairs.push((key, value));
                }
                src.advance(pos);
                Ok(Some(Frame::Data { seq, pairs }))
            }
            other => Err(invalid(format!("unknown frame code 0x{:02x}", other))),
        }
    }
}

/// Parse a fixed buffer (the decompressed body of a `C` frame) into frames.
/// A truncated trailing frame is an error here: the sub-stream is complete
/// by construction.
pub fn parse_buffer(data: &[u8], wrapper: CompressionWrapper) -> io::Result<Vec<Frame>> {
    let mut buf = BytesMut::from(data);
    let mut decoder = FrameDecoder::new(wrapper);
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match decoder.decode(&mut buf)? {
            Some(frame) => frames.push(frame),
            None => return Err(invalid("truncated frame in compressed payload".to_string())),
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8], wrapper: CompressionWrapper) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut decoder = FrameDecoder::new(wrapper);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_window_wire_bytes() {
        let mut buf = BytesMut::new();
        encode_window(&mut buf, 1, 3);
        assert_eq!(&buf[..], b"1W\x00\x00\x00\x03");
    }

    #[test]
    fn test_ack_wire_bytes() {
        let mut buf = BytesMut::new();
        encode_ack(&mut buf, 1, 3);
        assert_eq!(&buf[..], b"1A\x00\x00\x00\x03");
    }

    #[test]
    fn test_data_roundtrip() {
        let pairs = vec![
            ("line".to_string(), "hello world".to_string()),
            ("type".to_string(), "app".to_string()),
        ];
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 7, &pairs);

        let frames = decode_all(&buf, CompressionWrapper::Zlib);
        assert_eq!(frames, vec![Frame::Data { seq: 7, pairs }]);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut buf = BytesMut::new();
        encode_json(&mut buf, 9, r#"{"line":"x","type":"app"}"#);

        let frames = decode_all(&buf, CompressionWrapper::Zlib);
        match &frames[0] {
            Frame::Json { seq, payload } => {
                assert_eq!(*seq, 9);
                assert_eq!(payload["line"], "x");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_compressed_batch_roundtrip() {
        for wrapper in [CompressionWrapper::Zlib, CompressionWrapper::Raw] {
            let mut body = BytesMut::new();
            encode_data(&mut body, 1, &[("line".to_string(), "L1".to_string())]);
            encode_data(&mut body, 2, &[("line".to_string(), "L2".to_string())]);

            let mut wire = BytesMut::new();
            encode_window(&mut wire, 1, 2);
            encode_compressed(&mut wire, 1, &body, wrapper).unwrap();

            let frames = decode_all(&wire, wrapper);
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0], Frame::Window(2));
            match &frames[1] {
                Frame::Compressed(inner) => {
                    assert_eq!(inner.len(), 2);
                    match &inner[0] {
                        Frame::Data { seq, pairs } => {
                            assert_eq!(*seq, 1);
                            assert_eq!(pairs[0].1, "L1");
                        }
                        other => panic!("unexpected frame {:?}", other),
                    }
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[test]
    fn test_nested_compressed_tolerated() {
        let mut inner_body = BytesMut::new();
        encode_data(&mut inner_body, 4, &[("line".to_string(), "deep".to_string())]);

        let mut outer_body = BytesMut::new();
        encode_compressed(&mut outer_body, 1, &inner_body, CompressionWrapper::Zlib).unwrap();

        let mut wire = BytesMut::new();
        encode_compressed(&mut wire, 1, &outer_body, CompressionWrapper::Zlib).unwrap();

        let frames = decode_all(&wire, CompressionWrapper::Zlib);
        match &frames[0] {
            Frame::Compressed(level1) => match &level1[0] {
                Frame::Compressed(level2) => {
                    assert!(matches!(level2[0], Frame::Data { seq: 4, .. }));
                }
                other => panic!("unexpected frame {:?}", other),
            },
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_frame_waits() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 1, &[("line".to_string(), "partial".to_string())]);
        let cut = buf.len() - 3;
        let mut partial = BytesMut::from(&buf[..cut]);

        let mut decoder = FrameDecoder::new(CompressionWrapper::Zlib);
        assert_eq!(decoder.decode(&mut partial).unwrap(), None);
        // Nothing may be consumed until the frame is complete.
        assert_eq!(partial.len(), cut);
    }

    #[test]
    fn test_unknown_code_is_fatal() {
        let mut buf = BytesMut::from(&b"1X\x00\x00\x00\x00"[..]);
        let mut decoder = FrameDecoder::new(CompressionWrapper::Zlib);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let mut buf = BytesMut::from(&b"3W\x00\x00\x00\x01"[..]);
        let mut decoder = FrameDecoder::new(CompressionWrapper::Zlib);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_into_event() {
        let frame = Frame::Data {
            seq: 5,
            pairs: vec![
                ("line".to_string(), "payload".to_string()),
                ("type".to_string(), "app".to_string()),
                ("region".to_string(), "eu".to_string()),
            ],
        };
        let (seq, event) = frame.into_event().unwrap();
        assert_eq!(seq, 5);
        assert_eq!(event.line, "payload");
        assert_eq!(event.event_type, "app");
        assert_eq!(event.field_str("region"), Some("eu"));
        assert!(Frame::Window(5).into_event().is_none());
    }
}
