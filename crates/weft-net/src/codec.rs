//! Wrap `weft_proto`'s byte-level FrameCodec for use with the
//! tokio-util codec machinery.

use std::io::Error as IoError;

use bytes::BytesMut;
use tokio_util::codec;

use weft_proto::codec::FrameCodec;
use weft_proto::msg::Envelope;

/// An error from an EnvelopeCodec.
///
/// This is a separate error type so that the connection reactor can
/// distinguish transport failures from protocol violations when it
/// decides what to log.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An error from the underlying IO stream underneath a codec.
    #[error("Io error reading or writing a frame")]
    Io(#[from] IoError),
    /// An error from the frame decoding logic.
    #[error("Error decoding an incoming frame")]
    Dec(#[source] weft_proto::Error),
    /// An error from the frame encoding logic.
    #[error("Error encoding an outgoing frame")]
    Enc(#[source] weft_proto::Error),
}

/// Adapter giving [`FrameCodec`] the tokio-util `Encoder`/`Decoder`
/// interface.
///
/// This lets us wrap a TCP stream (or any AsyncRead+AsyncWrite type) as
/// a Sink and a Stream of [`Envelope`], so the connection reactor can
/// forget about byte-oriented communication.
pub struct EnvelopeCodec(FrameCodec);

impl EnvelopeCodec {
    /// Create a new EnvelopeCodec with the given frame-size cap.
    pub fn new(max_frame_bytes: usize) -> Self {
        EnvelopeCodec(FrameCodec::new(max_frame_bytes))
    }
}

impl codec::Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_frame(&item, dst).map_err(CodecError::Enc)
    }
}

impl codec::Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_frame(src).map_err(CodecError::Dec)
    }
}
