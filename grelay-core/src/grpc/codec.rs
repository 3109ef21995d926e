//! # Raw Frame Codecs
//!
//! This module implements `tonic::codec::Codec` so that `tonic` transports serialized gRPC
//! messages as uninterpreted byte buffers.
//!
//! ## How it works
//!
//! 1. **[`FrameCodec`]**: Used on both legs of a proxied call.
//!    - The decoder copies the message body handed over by the transport into a fresh [`Frame`].
//!    - The encoder copies the [`Frame`] bytes verbatim into the outgoing buffer.
//!
//! 2. **[`FallbackCodec`]**: Used by callers that mix proxied and locally handled traffic.
//!    - Items are [`Payload`]s: either a raw [`Frame`] or a structured message.
//!    - Frames are always copied verbatim, messages are delegated to the wrapped codec.
//!    - Whether the decoder yields frames or messages is decided once, when the codec is built.
//!
//! 3. **[`RelayCodec`]**: Used on the outbound leg of a proxied call.
//!    - Items are [`Relay`]s: a [`Frame`] to forward, or the order to abort the call.
//!    - An abort fails the request body instead of ending it, so the peer never mistakes an
//!      aborted call for a completed one.
//!
//! None of the codecs change what goes on the wire besides the message bodies: `tonic` always
//! advertises `application/grpc`, the same content type used by the default Protobuf codec,
//! so proxied traffic stays compatible with any gRPC peer.
use bytes::{Buf, BufMut, Bytes};
use std::ops::Deref;
use tonic::{
    Status,
    codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};
use tonic_prost::ProstCodec;

/// Content-subtype reported by every codec in this module.
pub const CODEC_NAME: &str = "proto";

/// One serialized gRPC message, forwarded without interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self(payload.into())
    }
}

/// A Codec that treats every gRPC message as an opaque [`Frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn name(&self) -> &'static str {
        CODEC_NAME
    }
}

impl Codec for FrameCodec {
    type Encode = Frame;
    type Decode = Frame;

    type Encoder = FrameEncoder;
    type Decoder = FrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        FrameEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        FrameDecoder
    }
}

/// Writes a [`Frame`] into the outgoing message buffer.
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder for FrameEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

/// Reads the whole message buffer into a new [`Frame`].
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        // The transport reuses its buffer once we return, so the bytes are copied out.
        Ok(Some(Frame(src.copy_to_bytes(src.remaining()))))
    }
}

/// An item of an outbound request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relay {
    Frame(Frame),
    /// Fails the request body, which resets the outbound stream.
    Abort,
}

/// A Codec writing [`Relay`] items and reading back raw [`Frame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayCodec;

impl Codec for RelayCodec {
    type Encode = Relay;
    type Decode = Frame;

    type Encoder = RelayEncoder;
    type Decoder = FrameDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RelayEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        FrameDecoder
    }
}

#[derive(Debug, Default)]
pub struct RelayEncoder;

impl Encoder for RelayEncoder {
    type Item = Relay;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Relay::Frame(frame) => FrameEncoder.encode(frame, dst),
            Relay::Abort => Err(Status::cancelled("Outbound stream aborted")),
        }
    }
}

/// An item handled by [`FallbackCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<M> {
    /// Raw message bytes, forwarded verbatim.
    Frame(Frame),
    /// A structured message, (de)serialized by the fallback codec.
    Message(M),
}

/// A Codec that forwards [`Frame`]s untouched and delegates structured messages to `C`.
#[derive(Debug, Clone)]
pub struct FallbackCodec<C> {
    inner: C,
    decode_frames: bool,
}

/// [`FallbackCodec`] backed by the Protobuf codec from `tonic-prost`.
pub type ProtoFallbackCodec<E, D> = FallbackCodec<ProstCodec<E, D>>;

impl<C> FallbackCodec<C> {
    /// Creates a codec that decodes inbound messages with `inner`.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            decode_frames: false,
        }
    }

    /// Creates a codec that decodes inbound messages as [`Payload::Frame`].
    ///
    /// `inner` is still used to encode any [`Payload::Message`] handed to it.
    pub fn frames(inner: C) -> Self {
        Self {
            inner,
            decode_frames: true,
        }
    }

    pub fn name(&self) -> &'static str {
        CODEC_NAME
    }
}

impl<E, D> Default for ProtoFallbackCodec<E, D>
where
    E: prost::Message + Send + 'static,
    D: prost::Message + Default + Send + 'static,
{
    fn default() -> Self {
        Self::new(ProstCodec::default())
    }
}

impl<C: Codec> Codec for FallbackCodec<C> {
    type Encode = Payload<C::Encode>;
    type Decode = Payload<C::Decode>;

    type Encoder = FallbackEncoder<C::Encoder>;
    type Decoder = FallbackDecoder<C::Decoder>;

    fn encoder(&mut self) -> Self::Encoder {
        FallbackEncoder(self.inner.encoder())
    }

    fn decoder(&mut self) -> Self::Decoder {
        FallbackDecoder {
            inner: self.inner.decoder(),
            decode_frames: self.decode_frames,
        }
    }
}

pub struct FallbackEncoder<E>(E);

impl<E> Encoder for FallbackEncoder<E>
where
    E: Encoder<Error = Status>,
{
    type Item = Payload<E::Item>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        match item {
            Payload::Frame(frame) => {
                dst.put_slice(&frame);
                Ok(())
            }
            Payload::Message(message) => self.0.encode(message, dst),
        }
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.0.buffer_settings()
    }
}

pub struct FallbackDecoder<D> {
    inner: D,
    decode_frames: bool,
}

impl<D> Decoder for FallbackDecoder<D>
where
    D: Decoder<Error = Status>,
{
    type Item = Payload<D::Item>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if self.decode_frames {
            let payload = src.copy_to_bytes(src.remaining());
            return Ok(Some(Payload::Frame(Frame(payload))));
        }

        Ok(self.inner.decode(src)?.map(Payload::Message))
    }

    fn buffer_settings(&self) -> BufferSettings {
        self.inner.buffer_settings()
    }
}
