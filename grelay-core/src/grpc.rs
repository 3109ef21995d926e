//! # Payload-agnostic gRPC Transport
//!
//! This module contains the low-level building blocks used to move gRPC messages without
//! knowing their schema.
//!
//! Unlike standard `tonic` clients which are strongly typed (e.g., `HelloRequest`), the
//! components here exchange opaque [`codec::Frame`]s: the serialized bytes of one message,
//! exactly as they travelled on the wire.
pub mod client;
pub mod codec;
