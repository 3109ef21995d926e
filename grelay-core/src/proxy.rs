//! # Proxy Entry
//!
//! A [`ProxyEntry`] owns one [`Director`] and exposes the transparent stream bridge as a
//! catch-all `tower` service.
//!
//! The service is meant to be the *fallback* of a server's route table: calls to services
//! registered locally are served by them, every other method path is proxied.
//!
//! ```rust,no_run
//! # use grelay_core::{proxy::ProxyEntry, rule::Rule};
//! # use tonic::service::Routes;
//! # fn routes(rule: Rule) -> Routes {
//! let entry = ProxyEntry::new("greeter", rule);
//! entry.install(Routes::default())
//! # }
//! ```
mod bridge;

pub use bridge::BridgeStream;

use crate::{
    director::{Director, RuleDirector},
    grpc::codec::FrameCodec,
    rule::Rule,
};
use bridge::StreamBridge;
use std::{
    convert::Infallible,
    future::Future,
    net::{IpAddr, Ipv4Addr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{codegen::Service, service::Routes};
use tracing::{info, warn};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A named proxy, owning the director every proxied call of a server goes through.
#[derive(Debug)]
pub struct ProxyEntry<D = RuleDirector> {
    name: String,
    director: Arc<D>,
    local_ip: IpAddr,
}

impl ProxyEntry<RuleDirector> {
    /// Creates a proxy routing with `rule` and dialing backends with default options.
    pub fn new(name: impl Into<String>, rule: Rule) -> Self {
        Self::with_director(name, RuleDirector::new(rule))
    }
}

impl<D: Director> ProxyEntry<D> {
    pub fn with_director(name: impl Into<String>, director: D) -> Self {
        Self {
            name: name.into(),
            director: Arc::new(director),
            local_ip: local_ip(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn director(&self) -> &D {
        &self.director
    }

    /// The address appended to the `x-forwarded-for` metadata of every outbound call.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Returns the catch-all service relaying any call to the backend chosen by the director.
    pub fn service(&self) -> ProxyService<D> {
        ProxyService {
            director: Arc::clone(&self.director),
            local_ip: self.local_ip,
        }
    }

    /// Sets the proxy as the fallback of `routes`.
    ///
    /// Services already added to `routes`, and those added afterwards, keep precedence over
    /// the proxy for their own paths.
    pub fn install(&self, routes: Routes) -> Routes {
        let router = routes.into_axum_router().fallback_service(self.service());
        Routes::from(router)
    }

    pub fn bootstrap(&self) {
        info!(entry = %self.name, local_ip = %self.local_ip, "Proxy entry started");
    }

    pub fn interrupt(&self) {
        info!(entry = %self.name, "Proxy entry stopped");
    }
}

/// The `tower` service handed to the server for unimplemented method paths.
///
/// Every request is served as a bidirectional stream of [`Frame`](crate::grpc::codec::Frame)s,
/// whatever the shape the method has on the backend.
#[derive(Debug)]
pub struct ProxyService<D> {
    director: Arc<D>,
    local_ip: IpAddr,
}

impl<D> Clone for ProxyService<D> {
    fn clone(&self) -> Self {
        Self {
            director: Arc::clone(&self.director),
            local_ip: self.local_ip,
        }
    }
}

impl<D: Director> Service<http::Request<axum::body::Body>> for ProxyService<D> {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let bridge = StreamBridge {
            director: Arc::clone(&self.director),
            method: req.uri().path().to_string(),
            local_ip: self.local_ip,
        };

        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(FrameCodec);
            Ok(grpc.streaming(bridge, req).await)
        })
    }
}

/// Resolves the address of this host on its default interface, IPv4 first.
fn local_ip() -> IpAddr {
    let resolved = local_ip_address::local_ip().or_else(|err| match err {
        local_ip_address::Error::LocalIpAddressNotFound => local_ip_address::local_ipv6(),
        _ => Err(err),
    });

    resolved.unwrap_or_else(|err| {
        warn!(error = %err, "Could not resolve the local IP, using the loopback address");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PathPattern;

    fn entry() -> ProxyEntry {
        let rule = Rule::new()
            .with_path_patterns([PathPattern::new(["^/Greeter/"], ["localhost:1"]).unwrap()]);
        ProxyEntry::new("greeter", rule)
    }

    fn grpc_request(path: &str) -> http::Request<axum::body::Body> {
        http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/grpc")
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[test]
    fn test_entries_expose_their_director() {
        let entry = entry();

        assert_eq!(entry.name(), "greeter");
        assert_eq!(entry.director().rule().path_patterns().len(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_calls_end_with_unimplemented() {
        let mut service = entry().service();

        let response = service.call(grpc_request("/Other/Method")).await.unwrap();

        assert_eq!(response.status(), http::StatusCode::OK);

        let status = tonic::Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
        assert_eq!(status.message(), "Unknown method");
    }

    #[test]
    fn test_clones_share_the_director() {
        let entry = entry();
        let service = entry.service();
        let clone = service.clone();

        assert!(Arc::ptr_eq(&service.director, &clone.director));
        assert_eq!(clone.local_ip, entry.local_ip());
    }
}
