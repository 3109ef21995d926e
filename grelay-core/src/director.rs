//! # Director
//!
//! A [`Director`] decides where an inbound call goes and hands the stream bridge a live
//! connection to that backend.
//!
//! [`RuleDirector`] is the implementation used by default: it resolves the call against a
//! [`Rule`] and dials the selected destination over plaintext HTTP/2.
use crate::{call::InboundCall, rule::Rule};
use std::{future::Future, time::Duration};
use tonic::{
    Status,
    metadata::MetadataMap,
    transport::{Channel, Endpoint},
};
use tracing::debug;

/// Metadata owned by the transport of each leg. They are never copied from one leg to the other.
const TRANSPORT_HEADERS: &[&str] = &["grpc-encoding", "grpc-accept-encoding"];

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("Unknown method '{0}'")]
    NoRouteMatched(String),
    #[error("Invalid destination '{dest}': '{source}'")]
    InvalidDestination {
        dest: String,
        source: tonic::transport::Error,
    },
    #[error("Failed to connect to '{dest}': '{source}'")]
    DialFailure {
        dest: String,
        source: tonic::transport::Error,
    },
}

impl From<DirectorError> for Status {
    fn from(err: DirectorError) -> Self {
        match err {
            DirectorError::NoRouteMatched(_) => Status::unimplemented("Unknown method"),
            DirectorError::InvalidDestination { .. } | DirectorError::DialFailure { .. } => {
                Status::unavailable(err.to_string())
            }
        }
    }
}

/// The outbound side of a proxied call, as decided by a [`Director`].
#[derive(Debug, Clone)]
pub struct Upstream {
    /// The backend address the call is forwarded to.
    pub destination: String,
    /// A connection to `destination`.
    pub channel: Channel,
    /// Metadata sent to the backend when the outbound call is opened.
    pub metadata: MetadataMap,
}

/// Resolves inbound calls to outbound connections.
///
/// Implementations must not keep per-call state: the same director serves every call the
/// proxy handles, concurrently.
pub trait Director: Send + Sync + 'static {
    fn direct(
        &self,
        call: &InboundCall<'_>,
    ) -> impl Future<Output = Result<Upstream, DirectorError>> + Send;
}

/// Options applied when dialing a backend.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
}

/// The default [`Director`]: routes with a [`Rule`] and dials a fresh plaintext connection.
#[derive(Debug)]
pub struct RuleDirector {
    rule: Rule,
    dial: DialOptions,
}

impl RuleDirector {
    pub fn new(rule: Rule) -> Self {
        Self {
            rule,
            dial: DialOptions::default(),
        }
    }

    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    fn endpoint(&self, dest: &str) -> Result<Endpoint, DirectorError> {
        let uri = if dest.starts_with("http://") || dest.starts_with("https://") {
            dest.to_string()
        } else {
            format!("http://{dest}")
        };

        let endpoint =
            Endpoint::from_shared(uri).map_err(|source| DirectorError::InvalidDestination {
                dest: dest.to_string(),
                source,
            })?;

        Ok(match self.dial.connect_timeout {
            Some(timeout) => endpoint.connect_timeout(timeout),
            None => endpoint,
        })
    }
}

impl Director for RuleDirector {
    async fn direct(&self, call: &InboundCall<'_>) -> Result<Upstream, DirectorError> {
        let route = self
            .rule
            .resolve(call)
            .ok_or_else(|| DirectorError::NoRouteMatched(call.method().to_string()))?;

        let destination = route.destination.to_string();

        debug!(
            method = call.method(),
            kind = %route.kind,
            pattern = route.index,
            destination = %destination,
            "Routing call to backend"
        );

        let channel = self
            .endpoint(&destination)?
            .connect()
            .await
            .map_err(|source| DirectorError::DialFailure {
                dest: destination.clone(),
                source,
            })?;

        Ok(Upstream {
            destination,
            channel,
            metadata: outbound_metadata(call.metadata()),
        })
    }
}

/// Copies the caller's metadata for the outbound leg, dropping transport-owned entries.
pub fn outbound_metadata(inbound: &MetadataMap) -> MetadataMap {
    let mut metadata = inbound.clone();
    strip_transport_headers(&mut metadata);
    metadata
}

pub(crate) fn strip_transport_headers(metadata: &mut MetadataMap) {
    for key in TRANSPORT_HEADERS {
        metadata.remove(*key);
    }
}
