/// Document codecs
///
/// The dispatcher treats encoding as opaque: a [`Codec`] turns a command
/// document into the bytes handed to a channel and a reply back into a
/// document. [`BsonCodec`] produces bare BSON; [`OpMsgCodec`] frames the BSON
/// body as an OP_MSG wire message so the bytes can go straight to a server.
use crate::error::CodecError;
use bson::Document;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};

pub trait Codec: Send + Sync {
    fn encode(&self, document: &Document) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError>;
}

/// Plain BSON documents
#[derive(Debug, Default, Clone, Copy)]
pub struct BsonCodec;

impl Codec for BsonCodec {
    fn encode(&self, document: &Document) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        document
            .to_writer(&mut buf)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError> {
        let mut reader = bytes;
        Document::from_reader(&mut reader).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

pub const OP_MSG: i32 = 2013;
const HEADER_LEN: usize = 16;
const CHECKSUM_PRESENT: u32 = 1;
const SECTION_BODY: u8 = 0;

/// OP_MSG framing around a single body section
#[derive(Debug, Default)]
pub struct OpMsgCodec {
    next_request_id: AtomicI32,
}

impl OpMsgCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for OpMsgCodec {
    fn encode(&self, document: &Document) -> Result<Vec<u8>, CodecError> {
        let body = BsonCodec.encode(document)?;
        let length = HEADER_LEN + 4 + 1 + body.len();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let mut buf = BytesMut::with_capacity(length);
        buf.put_i32_le(length as i32);
        buf.put_i32_le(request_id);
        buf.put_i32_le(0); // responseTo
        buf.put_i32_le(OP_MSG);
        buf.put_u32_le(0); // flag bits
        buf.put_u8(SECTION_BODY);
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document, CodecError> {
        if bytes.len() < HEADER_LEN + 5 {
            return Err(CodecError::Malformed(format!(
                "message of {} bytes is shorter than an OP_MSG header",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let length = buf.get_i32_le();
        if length as usize != bytes.len() {
            return Err(CodecError::Malformed(format!(
                "declared length {length} does not match {} received bytes",
                bytes.len()
            )));
        }
        let _request_id = buf.get_i32_le();
        let _response_to = buf.get_i32_le();
        let op_code = buf.get_i32_le();
        if op_code != OP_MSG {
            return Err(CodecError::Malformed(format!("unsupported opcode {op_code}")));
        }

        let flags = buf.get_u32_le();
        if flags & CHECKSUM_PRESENT != 0 {
            if buf.remaining() < 4 {
                return Err(CodecError::Malformed("missing checksum".to_string()));
            }
            buf = &buf[..buf.len() - 4];
        }

        if !buf.has_remaining() {
            return Err(CodecError::Malformed("missing section kind".to_string()));
        }
        let kind = buf.get_u8();
        if kind != SECTION_BODY {
            return Err(CodecError::Malformed(format!("unsupported section kind {kind}")));
        }
        BsonCodec.decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson, DateTime};

    fn corpus() -> Vec<Document> {
        vec![
            doc! {},
            doc! { "ping": 1 },
            doc! {
                "_id": ObjectId::new(),
                "name": "ada",
                "nested": { "a": [1, 2, { "b": [[], {}] }], "m": { "k": "v" } },
            },
            doc! {
                "big": i64::MAX,
                "small": i64::MIN,
                "i32": i32::MAX,
                "ratio": 2.5,
            },
            doc! { "nothing": Bson::Null, "list": [Bson::Null, 1, "two"] },
            doc! {
                "when": DateTime::from_millis(1_700_000_000_000),
                "blob": Binary { subtype: BinarySubtype::Generic, bytes: vec![0, 1, 2, 255] },
                "flag": true,
            },
        ]
    }

    #[test]
    fn test_bson_codec_round_trip() {
        let codec = BsonCodec;
        for document in corpus() {
            let bytes = codec.encode(&document).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), document);
        }
    }

    #[test]
    fn test_op_msg_codec_round_trip() {
        let codec = OpMsgCodec::new();
        for document in corpus() {
            let bytes = codec.encode(&document).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), document);
        }
    }

    #[test]
    fn test_op_msg_header() {
        let codec = OpMsgCodec::new();
        let first = codec.encode(&doc! { "hello": 1 }).unwrap();
        let second = codec.encode(&doc! { "hello": 1 }).unwrap();

        let mut header = &first[..];
        assert_eq!(header.get_i32_le() as usize, first.len());
        let first_id = header.get_i32_le();
        assert_eq!(header.get_i32_le(), 0);
        assert_eq!(header.get_i32_le(), OP_MSG);

        let mut header = &second[..4 + 4];
        header.advance(4);
        assert_ne!(header.get_i32_le(), first_id);
    }

    #[test]
    fn test_op_msg_rejects_malformed_input() {
        let codec = OpMsgCodec::new();
        assert!(matches!(codec.decode(&[1, 2, 3]), Err(CodecError::Malformed(_))));

        let mut bytes = codec.encode(&doc! { "ok": 1 }).unwrap();
        bytes[12] = 1; // opcode
        assert!(matches!(codec.decode(&bytes), Err(CodecError::Malformed(_))));

        let bytes = codec.encode(&doc! { "ok": 1 }).unwrap();
        assert!(codec.decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_op_msg_checksum_without_section() {
        let mut bytes = BytesMut::new();
        bytes.put_i32_le(24);
        bytes.put_i32_le(1);
        bytes.put_i32_le(0);
        bytes.put_i32_le(OP_MSG);
        bytes.put_u32_le(CHECKSUM_PRESENT);
        bytes.put_u32_le(0);

        let result = OpMsgCodec::new().decode(&bytes);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_bson_codec_rejects_garbage() {
        assert!(matches!(BsonCodec.decode(&[5, 0, 0]), Err(CodecError::Decode(_))));
    }
}
