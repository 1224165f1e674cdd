//! Define an error type for the weft-proto crate.

use std::sync::Arc;
use thiserror::Error;

use crate::msg::MsgType;

/// An error that occurred while encoding or decoding a weft frame.
///
/// Every variant here is fatal to the connection that produced it: a
/// peer that sends one malformed frame cannot be trusted to frame the
/// bytes that follow it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A frame declared a total length outside the legal range.
    ///
    /// Either it was too short to contain the fixed header fields, or it
    /// exceeded the configured frame-size cap.
    #[error("frame length {0} outside legal range")]
    BadFrameLen(u32),
    /// A frame declared an id length that does not fit in its body.
    #[error("id length {id_len} invalid for frame of {total_len} bytes")]
    BadIdLen {
        /// The id length the peer declared.
        id_len: u32,
        /// The total length the peer declared.
        total_len: u32,
    },
    /// A frame carried a message type we do not implement.
    #[error("unrecognized message type {0}")]
    UnknownMsgType(MsgType),
    /// A message body was not valid JSON, or lacked a required field.
    #[error("failed to decode message body")]
    BodyDecode(#[source] Arc<serde_json::Error>),
    /// A message body could not be encoded as JSON.
    ///
    /// This is likely to be a bug in the calling code: every message
    /// this crate can represent has a JSON encoding.
    #[error("failed to encode message body")]
    BodyEncode(#[source] Arc<serde_json::Error>),
    /// A message decoded cleanly but failed its semantic checks.
    #[error("message failed semantic checks: {0}")]
    BadMsg(&'static str),
    /// A frame carried an empty or non-textual request id.
    #[error("request id was empty or not UTF-8")]
    BadRequestId,
}
