// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-delimited CBOR framing for byte-stream transports.
//!
//! Message-oriented adapters can carry [`Envelope`](crate::message::Envelope)
//! values directly; byte-stream adapters frame them with this codec: a
//! 32-bit big-endian length prefix followed by the CBOR encoding, so frames
//! split across reads reassemble cleanly.
use std::marker::PhantomData;

use futures::{AsyncRead, AsyncWrite, Sink, Stream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::compat::{FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt};

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct CborCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        CborCodec {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Encoder<T> for CborCodec<T>
where
    T: Serialize,
{
    type Error = CodecError;

    fn encode(
        &mut self,
        item: T,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&item, &mut bytes)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl<T> Decoder for CborCodec<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = CodecError;

    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            // Wait for the rest of the frame.
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(len);
        let item =
            ciborium::from_reader(frame.as_ref()).map_err(|err: ciborium::de::Error<std::io::Error>| {
                CodecError::Decode(err.to_string())
            })?;
        Ok(Some(item))
    }
}

pub fn into_cbor_stream<'a, M>(
    rx: &'a mut (dyn AsyncRead + Send + Unpin),
) -> impl Stream<Item = Result<M, CodecError>> + Send + Unpin + 'a
where
    M: DeserializeOwned + Send + 'a,
{
    FramedRead::new(rx.compat(), CborCodec::<M>::new())
}

pub fn into_cbor_sink<'a, M>(
    tx: &'a mut (dyn AsyncWrite + Send + Unpin),
) -> impl Sink<M, Error = CodecError> + Send + Unpin + 'a
where
    M: Serialize + Send + 'a,
{
    FramedWrite::new(tx.compat_write(), CborCodec::<M>::new())
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("input/output error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode message: {0}")]
    Encode(String),

    #[error("could not decode message: {0}")]
    Decode(String),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use crate::message::{Envelope, Message};

    use super::CborCodec;

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let (client, server) = tokio::io::duplex(4096);

        let mut sink = FramedWrite::new(client, CborCodec::<Envelope>::new());
        let mut stream = FramedRead::new(server, CborCodec::<Envelope>::new());

        let envelope = Envelope {
            sender: "alice-laptop".to_string(),
            recipient: "bob-laptop".to_string(),
            index: 0,
            payload: Message::Disconnect,
        };
        sink.send(envelope.clone()).await.unwrap();
        sink.send(Envelope {
            index: 1,
            ..envelope.clone()
        })
        .await
        .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first, envelope);
        assert_eq!(second.index, 1);
    }
}
