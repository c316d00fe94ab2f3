use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

use crate::error::DbspError;

/// Upper bound for a single encoded payload.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Length-delimited JSON frames: writes `Enc`, reads `Dec`.
#[derive(Debug)]
pub struct PayloadCodec<Enc, Dec> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Enc) -> Dec>,
}

impl<Enc, Dec> PayloadCodec<Enc, Dec> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Enc, Dec> Default for PayloadCodec<Enc, Dec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Enc: Serialize, Dec> Encoder<Enc> for PayloadCodec<Enc, Dec> {
    type Error = DbspError;

    fn encode(&mut self, item: Enc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

impl<Enc, Dec: DeserializeOwned> Decoder for PayloadCodec<Enc, Dec> {
    type Item = Dec;
    type Error = DbspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Dec>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

/// A byte stream framed for exchanging payloads.
pub type PayloadTransport<T, Out, In> = Framed<T, PayloadCodec<Out, In>>;

pub fn framed<T, Out, In>(io: T) -> PayloadTransport<T, Out, In>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, PayloadCodec::new())
}
