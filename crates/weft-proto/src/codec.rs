//! Implementation for encoding and decoding of weft frames.
//!
//! The wire format is one length-prefixed frame per message:
//!
//! ```ignore
//!     u32 total_len;   // counts every byte after itself
//!     u32 mtype;
//!     u32 id_len;
//!     u8  id[id_len];
//!     u8  body[total_len - 8 - id_len];
//! ```
//!
//! All integers are big-endian. The body is a UTF-8 JSON object whose
//! shape is selected by `mtype`.

use bytes::{BufMut, BytesMut};

use crate::msg::{AnyMsg, Envelope, MsgType, RequestId};
use crate::{Error, Result};

/// Default cap on the size of a single frame, in bytes.
pub const DEFAULT_MAX_FRAME: usize = 65536;

/// Smallest configurable frame-size cap.
pub const MIN_MAX_FRAME: usize = 4 * 1024;

/// Largest configurable frame-size cap.
///
/// The format itself would permit frames up to `u32::MAX`; this ceiling
/// exists so that a single peer cannot make us buffer gigabytes.
pub const MAX_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Number of bytes in a frame before the id begins.
const HEADER_LEN: usize = 12;

/// Number of header bytes counted by `total_len` (the mtype and id_len
/// fields).
const COUNTED_HEADER_LEN: u32 = 8;

/// This object can be used to encode and decode weft frames.
///
/// It holds no connection state beyond the configured frame-size cap,
/// and works only on byte buffers; wrapping it around an actual socket
/// is the transport layer's job.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    /// Hard cap on `total_len` for both directions.
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    /// Create a new FrameCodec with the given frame-size cap.
    ///
    /// The cap is clamped to [`MIN_MAX_FRAME`]..=[`MAX_MAX_FRAME`].
    pub fn new(max_frame_bytes: usize) -> Self {
        FrameCodec {
            max_frame: max_frame_bytes.clamp(MIN_MAX_FRAME, MAX_MAX_FRAME),
        }
    }

    /// Return the frame-size cap this codec enforces.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Write `env` as one frame into the provided BytesMut object.
    ///
    /// Refuses to emit a frame larger than the configured cap: a frame
    /// we would refuse to parse must not be sent either.
    pub fn write_frame(&self, env: &Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = env.msg.encode()?;
        let id = env.id.as_str().as_bytes();
        if id.is_empty() {
            return Err(Error::BadRequestId);
        }
        let total_len = COUNTED_HEADER_LEN as usize + id.len() + body.len();
        if total_len > self.max_frame {
            return Err(Error::BadFrameLen(u32::try_from(total_len).unwrap_or(u32::MAX)));
        }
        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        dst.put_u32(env.msg.mtype().into());
        dst.put_u32(id.len() as u32);
        dst.put_slice(id);
        dst.put_slice(&body);
        Ok(())
    }

    /// Try to decode one frame from the provided BytesMut object.
    ///
    /// On a frame that might just be truncated, return `Ok(None)` and
    /// consume nothing. On a definite protocol violation, return
    /// `Err(_)`; the caller is expected to close the connection, so no
    /// attempt is made to resynchronize.
    ///
    /// The two length fields are validated independently, and always
    /// before any buffer arithmetic uses them: checking `total_len`
    /// alone would still let a forged `id_len` push the implied body
    /// length out of range.
    pub fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes(
            src[0..4]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        );
        if total_len < COUNTED_HEADER_LEN || total_len as usize > self.max_frame {
            return Err(Error::BadFrameLen(total_len));
        }
        let frame_len = 4 + total_len as usize;
        if src.len() < frame_len {
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        let mtype: MsgType = u32::from_be_bytes(
            frame[4..8]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        )
        .into();
        let id_len = u32::from_be_bytes(
            frame[8..12]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        );
        if id_len > total_len - COUNTED_HEADER_LEN {
            return Err(Error::BadIdLen { id_len, total_len });
        }

        let id_end = HEADER_LEN + id_len as usize;
        let id = std::str::from_utf8(&frame[HEADER_LEN..id_end]).map_err(|_| Error::BadRequestId)?;
        if id.is_empty() {
            return Err(Error::BadRequestId);
        }
        let id = RequestId::from(id);
        let msg = AnyMsg::decode(mtype, &frame[id_end..])?;
        Ok(Some(Envelope { id, msg }))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    use super::*;
    use crate::msg::{
        HostAddr, JsonMap, ResultCode, RpcRequest, RpcResponse, ServiceRequest, TopicRequest,
    };
    use hex_literal::hex;

    /// Encode `env` into a fresh buffer with the default codec.
    fn encode(env: &Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().write_frame(env, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let codec = FrameCodec::default();
        let mut params = JsonMap::new();
        params.insert("num1".into(), 11.into());
        params.insert("num2".into(), 22.into());
        let envelopes = vec![
            Envelope::new("req-1", RpcRequest::new("Add", params)),
            Envelope::new("req-1", RpcResponse::ok(33.into())),
            Envelope::new("req-2", RpcResponse::error(ResultCode::INVALID_PARAMS)),
            Envelope::new("req-3", TopicRequest::publish("daily.news", "msg-0")),
            Envelope::new(
                "req-4",
                ServiceRequest::registry("Add", HostAddr::new("127.0.0.1", 18081)),
            ),
        ];

        let mut buf = BytesMut::new();
        for env in &envelopes {
            codec.write_frame(env, &mut buf).unwrap();
        }
        for env in &envelopes {
            let got = codec.decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(&got, env);
        }
        assert!(buf.is_empty());
        assert!(codec.decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn header_layout() {
        let env = Envelope::new("abcd", RpcResponse::error(ResultCode::INVALID_MSG));
        let buf = encode(&env);
        // total_len counts everything after itself.
        assert_eq!(buf.len() - 4, u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize);
        // mtype and id_len fields, then the id itself.
        assert_eq!(buf[4..8], hex!("00000001"));
        assert_eq!(buf[8..12], hex!("00000004"));
        assert_eq!(&buf[12..16], b"abcd");
    }

    #[test]
    fn truncated_frames_need_more() {
        let codec = FrameCodec::default();
        let full = encode(&Envelope::new("id-1", TopicRequest::publish("t", "x")));
        // Every proper prefix decodes to "need more bytes".
        for cut in [0, 1, 4, 11, 12, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(codec.decode_frame(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut, "nothing may be consumed at {cut}");
        }
    }

    #[test]
    fn forged_id_len_is_rejected() {
        // total_len=12, mtype=REQ_SERVICE, id_len=100: the id cannot fit
        // in a frame whose body region is only 4 bytes.
        let mut buf = BytesMut::from(&hex!("0000000c 00000004 00000064 41424344")[..]);
        let err = FrameCodec::default().decode_frame(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::BadIdLen {
                id_len: 100,
                total_len: 12
            }
        ));
    }

    #[test]
    fn total_len_bounds_are_enforced() {
        let codec = FrameCodec::default();

        // Too short to hold even the counted header fields.
        let mut buf = BytesMut::from(&hex!("00000007 00000000 00000000")[..]);
        assert!(matches!(
            codec.decode_frame(&mut buf).unwrap_err(),
            Error::BadFrameLen(7)
        ));

        // Larger than the configured cap. Only the header needs to
        // arrive for this to be rejected; we never wait for (or
        // allocate) the claimed megabytes.
        let mut buf = BytesMut::from(&hex!("7fffffff 00000000 00000001")[..]);
        assert!(matches!(
            codec.decode_frame(&mut buf).unwrap_err(),
            Error::BadFrameLen(0x7fff_ffff)
        ));
    }

    #[test]
    fn oversized_frames_are_not_encoded() {
        let codec = FrameCodec::new(MIN_MAX_FRAME);
        let big = "x".repeat(MIN_MAX_FRAME);
        let env = Envelope::new("id-1", TopicRequest::publish("t", big));
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.write_frame(&env, &mut buf).unwrap_err(),
            Error::BadFrameLen(_)
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_mtype_is_rejected() {
        // total_len=11, mtype=99, id_len=1, id="a", body="{}"
        let mut buf = BytesMut::new();
        buf.put_u32(11);
        buf.put_u32(99);
        buf.put_u32(1);
        buf.put_slice(b"a{}");
        assert!(matches!(
            FrameCodec::default().decode_frame(&mut buf).unwrap_err(),
            Error::UnknownMsgType(t) if u32::from(t) == 99
        ));
    }

    #[test]
    fn empty_or_binary_ids_are_rejected() {
        let codec = FrameCodec::default();

        // id_len = 0: in-range for the framing, but ids must be non-empty.
        let mut buf = BytesMut::new();
        buf.put_u32(8 + 0 + 11); // total_len
        buf.put_u32(3); // RSP_TOPIC
        buf.put_u32(0);
        buf.put_slice(br#"{"rcode":0}"#);
        assert!(matches!(
            codec.decode_frame(&mut buf).unwrap_err(),
            Error::BadRequestId
        ));

        // An id that is not UTF-8.
        let mut buf = BytesMut::new();
        buf.put_u32(8 + 2 + 11);
        buf.put_u32(3);
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        buf.put_slice(br#"{"rcode":0}"#);
        assert!(matches!(
            codec.decode_frame(&mut buf).unwrap_err(),
            Error::BadRequestId
        ));
    }

    #[test]
    fn garbage_body_is_rejected() {
        let mut buf = BytesMut::new();
        let body = b"this is not json";
        buf.put_u32(8 + 2 + body.len() as u32);
        buf.put_u32(0); // REQ_RPC
        buf.put_u32(2);
        buf.put_slice(b"id");
        buf.put_slice(body);
        assert!(matches!(
            FrameCodec::default().decode_frame(&mut buf).unwrap_err(),
            Error::BodyDecode(_)
        ));
    }

    #[test]
    fn semantically_invalid_body_is_rejected() {
        // Structurally fine JSON, but a successful rpc response with no
        // result fails check() inside the codec.
        let mut buf = BytesMut::new();
        let body = br#"{"rcode":0}"#;
        buf.put_u32(8 + 2 + body.len() as u32);
        buf.put_u32(1); // RSP_RPC
        buf.put_u32(2);
        buf.put_slice(b"id");
        buf.put_slice(&body[..]);
        assert!(matches!(
            FrameCodec::default().decode_frame(&mut buf).unwrap_err(),
            Error::BadMsg(_)
        ));
    }

    #[test]
    fn cap_is_clamped() {
        assert_eq!(FrameCodec::new(1).max_frame(), MIN_MAX_FRAME);
        assert_eq!(FrameCodec::new(usize::MAX).max_frame(), MAX_MAX_FRAME);
        assert_eq!(FrameCodec::new(65536).max_frame(), 65536);
    }
}
