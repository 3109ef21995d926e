//! # Grelay Core
//!
//! `grelay-core` is the library powering the Grelay gRPC proxy. It lets a `tonic` server forward
//! every call it does not implement itself to a backend chosen by declarative rules, without
//! ever decoding the Protobuf payloads being exchanged.
//!
//! ## Key Components
//!
//! * **[`rule::Rule`]:** An ordered set of IP (CIDR), method path (regex) and metadata header
//!   patterns that resolves an inbound call to one backend address.
//! * **[`director::Director`]:** Turns a resolved route into a live outbound
//!   [`tonic::transport::Channel`]. [`director::RuleDirector`] is the default implementation
//!   backed by a [`rule::Rule`].
//! * **[`proxy::ProxyEntry`]:** Owns a director and installs the transparent stream bridge as the
//!   fallback handler of a server's route table.
//!
//! ## Codecs
//!
//! * **[`grpc::codec::FrameCodec`]:** An implementation of `tonic::codec::Codec` that moves
//!   every gRPC message as an opaque [`grpc::codec::Frame`].
//! * **[`grpc::codec::FallbackCodec`]:** Same frame passthrough, but able to fall back to a
//!   structured codec for callers that exchange real messages.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grelay_core::proxy::ProxyEntry;
//! use grelay_core::rule::{PathPattern, Rule};
//! use tonic::service::Routes;
//! use tonic::transport::Server;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let rule = Rule::new().with_path_patterns([PathPattern::new(
//!     ["^/helloworld.Greeter/"],
//!     ["localhost:50052"],
//! )?]);
//!
//! let entry = ProxyEntry::new("greeter", rule);
//!
//! Server::builder()
//!     .add_routes(entry.install(Routes::default()))
//!     .serve("0.0.0.0:50051".parse()?)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports `prost` and `tonic` to ensure that consumers use compatible versions
//! of these underlying dependencies.
pub mod call;
pub mod director;
pub mod grpc;
pub mod proxy;
pub mod rule;

// Re-exports
pub use prost;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
