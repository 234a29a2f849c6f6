//! Framed codec for the control channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization,
//! one envelope per frame. Works over any AsyncRead/AsyncWrite (unix sockets,
//! in-memory duplex pairs in tests).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames messages with a 4-byte length prefix and serializes
/// with JSON.
///
/// Log records travel through frames encoded here, so this codec must never
/// call `tracing` itself: an event emitted while encoding would be shipped as
/// another frame, which would emit another event.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::envelope::{Envelope, EnvelopeKind};
    use serde_json::json;

    #[test]
    fn codec_roundtrip_envelope() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let env = Envelope::request(1.into(), "ping", json!({"seq": 1}));
        codec.encode(env, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::Request);
        assert_eq!(decoded.command, "ping");
        assert_eq!(decoded.data, json!({"seq": 1}));
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let env = Envelope::notification("url", json!("http://127.0.0.1:1"));
        codec.encode(env, &mut buf).unwrap();
        let truncated = buf.split_to(buf.len() - 3);

        let mut partial = truncated;
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_an_error() {
        let mut codec = FrameCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let mut inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        inner
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        assert!(codec.decode(&mut buf).is_err());
    }
}
