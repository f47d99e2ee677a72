//! Framed codec for supervisor-worker envelopes.
//!
//! `LengthDelimitedCodec` supplies the 4-byte big-endian frame boundaries;
//! serde_json supplies the body encoding. Works over any
//! AsyncRead/AsyncWrite (child stdio, in-memory duplexes in tests).
//!
//! Framing is authoritative about where an envelope ends: the decoder
//! takes the first JSON value in a frame and ignores trailing bytes.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames envelopes with a length prefix and serialises the
/// body with JSON.
pub struct EnvelopeCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for EnvelopeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EnvelopeCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for EnvelopeCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let mut values = serde_json::Deserializer::from_slice(&bytes).into_iter::<T>();
                match values.next() {
                    Some(Ok(item)) => Ok(Some(item)),
                    Some(Err(e)) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    None => Err(io::Error::new(io::ErrorKind::InvalidData, "empty frame")),
                }
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for EnvelopeCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(body_size_bytes = body.len(), "encoding frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}
