//! Binary codec for requests and responses.
//!
//! Transports deliver whole messages, so one buffer is always one message.
//! Every request starts with a one-byte [`RequestKind`] tag followed by
//! little-endian fixed-offset fields. Responses carry no tag; their layout is
//! implied by the request they answer.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{DataRequest, FileChunkRequest, Request, RequestKind};

const DATA_BODY_LEN: usize = 4 + 8 + 4;
const FILE_HEADER_LEN: usize = 8 + 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty message")]
    Empty,
    #[error("unknown request tag {0}")]
    UnknownTag(u8),
    #[error("truncated {kind:?} message: need {need} bytes, got {got}")]
    Truncated {
        kind: RequestKind,
        need: usize,
        got: usize,
    },
    #[error("malformed response: expected {expected} bytes, got {got}")]
    ResponseSize { expected: usize, got: usize },
    #[error("filename is not valid UTF-8")]
    Filename(#[source] std::string::FromUtf8Error),
    #[error("channel name is not valid UTF-8")]
    ChannelName(#[source] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encoder/decoder for [`Request`] messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestCodec;

impl RequestCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<&Request> for RequestCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.kind().tag());
        match item {
            Request::Data(req) => {
                dst.reserve(DATA_BODY_LEN);
                dst.put_i32_le(req.entity_id);
                dst.put_f64_le(req.timestamp);
                dst.put_i32_le(req.sub_stream);
            }
            Request::FileChunk(req) => {
                dst.reserve(FILE_HEADER_LEN + req.filename.len());
                dst.put_i64_le(req.offset);
                dst.put_i32_le(req.length);
                dst.put_slice(req.filename.as_bytes());
            }
            Request::NewChannel | Request::Quit => {}
        }
        Ok(())
    }
}

impl Encoder<Request> for RequestCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Request>::encode(self, &item, dst)
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut msg = src.split().freeze();
        decode_message(&mut msg).map(Some)
    }
}

fn decode_message(msg: &mut Bytes) -> Result<Request, CodecError> {
    let tag = msg.get_u8();
    let kind = RequestKind::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;
    let need = |need: usize, got: usize| CodecError::Truncated { kind, need, got };

    match kind {
        RequestKind::Data => {
            if msg.remaining() < DATA_BODY_LEN {
                return Err(need(DATA_BODY_LEN, msg.remaining()));
            }
            let entity_id = msg.get_i32_le();
            let timestamp = msg.get_f64_le();
            let sub_stream = msg.get_i32_le();
            Ok(Request::Data(DataRequest::new(entity_id, timestamp, sub_stream)))
        }
        RequestKind::FileChunk => {
            if msg.remaining() < FILE_HEADER_LEN {
                return Err(need(FILE_HEADER_LEN, msg.remaining()));
            }
            let offset = msg.get_i64_le();
            let length = msg.get_i32_le();
            let filename = String::from_utf8(msg.to_vec()).map_err(CodecError::Filename)?;
            Ok(Request::FileChunk(FileChunkRequest {
                offset,
                length,
                filename,
            }))
        }
        RequestKind::NewChannel => Ok(Request::NewChannel),
        RequestKind::Quit => Ok(Request::Quit),
    }
}

pub fn encode_request(req: &Request) -> Bytes {
    let mut buf = BytesMut::new();
    // Encoding into BytesMut cannot fail.
    let _ = RequestCodec.encode(req, &mut buf);
    buf.freeze()
}

pub fn decode_request(msg: &[u8]) -> Result<Request, CodecError> {
    if msg.is_empty() {
        return Err(CodecError::Empty);
    }
    decode_message(&mut Bytes::copy_from_slice(msg))
}

pub fn encode_sample(value: f64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub fn decode_sample(msg: &[u8]) -> Result<f64, CodecError> {
    let raw: [u8; 8] = msg.try_into().map_err(|_| CodecError::ResponseSize {
        expected: 8,
        got: msg.len(),
    })?;
    Ok(f64::from_le_bytes(raw))
}

pub fn encode_file_size(size: i64) -> Bytes {
    Bytes::copy_from_slice(&size.to_le_bytes())
}

pub fn decode_file_size(msg: &[u8]) -> Result<i64, CodecError> {
    let raw: [u8; 8] = msg.try_into().map_err(|_| CodecError::ResponseSize {
        expected: 8,
        got: msg.len(),
    })?;
    Ok(i64::from_le_bytes(raw))
}

pub fn decode_channel_name(msg: Bytes) -> Result<String, CodecError> {
    String::from_utf8(msg.to_vec()).map_err(CodecError::ChannelName)
}

/// Byte-stream framing for transports without native message boundaries.
///
/// 4-byte length prefix; frames above `max_frame` are rejected on both ends.
pub fn frame_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_request_layout() {
        let req = Request::Data(DataRequest::new(2, 0.5, 1));
        let bytes = encode_request(&req);
        assert_eq!(bytes.len(), 1 + DATA_BODY_LEN);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &2i32.to_le_bytes());
        assert_eq!(&bytes[5..13], &0.5f64.to_le_bytes());
        assert_eq!(&bytes[13..17], &1i32.to_le_bytes());
        assert_eq!(decode_request(&bytes).unwrap(), req);
    }

    #[test]
    fn file_chunk_carries_filename_suffix() {
        let req = Request::FileChunk(FileChunkRequest::chunk("1.csv", 256, 128));
        let bytes = encode_request(&req);
        assert_eq!(bytes.len(), 1 + FILE_HEADER_LEN + 5);
        assert_eq!(&bytes[13..], b"1.csv");
        assert_eq!(decode_request(&bytes).unwrap(), req);
    }

    #[test]
    fn control_requests_are_tag_only() {
        insta::assert_snapshot!(format!("{:?}", encode_request(&Request::NewChannel)), @r#"b"\x03""#);
        insta::assert_snapshot!(format!("{:?}", encode_request(&Request::Quit)), @r#"b"\x04""#);
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(decode_request(&[]), Err(CodecError::Empty)));
        assert!(matches!(decode_request(&[9]), Err(CodecError::UnknownTag(9))));
        assert!(matches!(
            decode_request(&[1, 0, 0]),
            Err(CodecError::Truncated {
                kind: RequestKind::Data,
                need: DATA_BODY_LEN,
                got: 2
            })
        ));
        assert!(matches!(
            decode_request(&[2, 0xff, 0xfe]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn decoder_consumes_whole_buffer() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Request::FileChunk(FileChunkRequest::size_query("x")), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Request::FileChunk(FileChunkRequest::size_query("x")));
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn response_scalars() {
        assert_eq!(decode_sample(&encode_sample(-0.125)).unwrap(), -0.125);
        assert_eq!(decode_file_size(&encode_file_size(10)).unwrap(), 10);
        assert!(matches!(
            decode_sample(&[0; 4]),
            Err(CodecError::ResponseSize {
                expected: 8,
                got: 4
            })
        ));
    }

    #[test]
    fn frame_codec_roundtrip_and_limit() {
        let mut codec = frame_codec(8);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"abc");

        let mut big = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"123456789"), &mut big).is_err());
    }
}
