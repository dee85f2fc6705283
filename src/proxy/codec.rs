//! Pass-through gRPC codec.
//!
//! The proxy forwards methods whose schemas it never compiles against, so the
//! message body is carried as an opaque [`Frame`] and copied verbatim. Typed
//! messages go through prost via [`Proto`].

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Values the codec knows how to put on and take off the wire.
pub trait Payload: Sized + Send + 'static {
    fn marshal<B: BufMut>(self, dst: &mut B) -> Result<(), Status>;

    fn unmarshal<B: Buf>(src: &mut B) -> Result<Self, Status>;
}

/// One raw message body, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame(pub Bytes);

impl Frame {
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Frame(bytes)
    }
}

impl Payload for Frame {
    fn marshal<B: BufMut>(self, dst: &mut B) -> Result<(), Status> {
        dst.put(self.0);
        Ok(())
    }

    fn unmarshal<B: Buf>(src: &mut B) -> Result<Self, Status> {
        Ok(Frame(src.copy_to_bytes(src.remaining())))
    }
}

/// A typed protobuf message, encoded and decoded by prost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proto<M>(pub M);

impl<M> Payload for Proto<M>
where
    M: prost::Message + Default + 'static,
{
    fn marshal<B: BufMut>(self, dst: &mut B) -> Result<(), Status> {
        self.0
            .encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {}", e)))
    }

    fn unmarshal<B: Buf>(src: &mut B) -> Result<Self, Status> {
        M::decode(src)
            .map(Proto)
            .map_err(|e| Status::internal(format!("failed to decode message: {}", e)))
    }
}

/// Codec sending `E` and receiving `D`.
#[derive(Debug)]
pub struct PassThroughCodec<E, D> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> Default for PassThroughCodec<E, D> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<E, D> Clone for PassThroughCodec<E, D> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

/// The codec used on both legs of a proxied call.
pub type FrameCodec = PassThroughCodec<Frame, Frame>;

impl<E: Payload, D: Payload> Codec for PassThroughCodec<E, D> {
    type Encode = E;
    type Decode = D;
    type Encoder = PayloadEncoder<E>;
    type Decoder = PayloadDecoder<D>;

    fn encoder(&mut self) -> Self::Encoder {
        PayloadEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        PayloadDecoder(PhantomData)
    }
}

#[derive(Debug)]
pub struct PayloadEncoder<T>(PhantomData<fn(T)>);

impl<T: Payload> Encoder for PayloadEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.marshal(dst)
    }
}

#[derive(Debug)]
pub struct PayloadDecoder<T>(PhantomData<fn() -> T>);

impl<T: Payload> Decoder for PayloadDecoder<T> {
    type Item = T;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        T::unmarshal(src).map(Some)
    }
}
