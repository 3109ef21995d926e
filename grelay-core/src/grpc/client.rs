//! # Frame Client
//!
//! This module wraps a standard `tonic` client to perform gRPC calls whose messages are opaque
//! [`Frame`]s. It is agnostic to the Protobuf messages being exchanged.
//!
//! ## How it works
//!
//! The [`FrameClient`] uses the [`FrameCodec`] for serialization, so the bytes handed to it are
//! written to the wire as-is and the bytes received are returned untouched. The caller only
//! needs the HTTP/2 path of the method (e.g. `/package.Service/Method`).
//!
//! The proxy always opens outbound calls with [`FrameClient::relay`]: the most general call
//! shape is wire-compatible with unary, client streaming and server streaming methods alike.
//!
//! ## Aborting a call
//!
//! A request stream that simply ends is a completed request for the server. To abort instead,
//! the proxy ends its stream with [`Relay::Abort`], which fails the request body. Over a
//! [`CancelOnAbort`] transport that failure resets the HTTP/2 stream with `CANCEL`, and the
//! server observes a cancelled call.
use super::codec::{Frame, FrameCodec, Relay, RelayCodec};
use crate::BoxError;
use futures_util::Stream;
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use std::{
    str::FromStr,
    task::{Context, Poll},
};
use tonic::{
    Extensions, Request, Response, Status, Streaming,
    client::GrpcService,
    codegen::Service,
    metadata::MetadataMap,
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum FrameCallError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid gRPC method path '{path}': '{source}'")]
    InvalidPath {
        path: String,
        source: http::uri::InvalidUri,
    },
}

/// A gRPC client exchanging raw [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl<S> FrameClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Unary gRPC call (Single Frame -> Single Frame).
    ///
    /// # Returns
    /// * `Ok(Ok(Response))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(FrameCallError)` - Failed to send request or connect.
    pub async fn unary(
        &mut self,
        path: &str,
        frame: Frame,
        metadata: MetadataMap,
    ) -> Result<Result<Response<Frame>, Status>, FrameCallError> {
        self.client
            .ready()
            .await
            .map_err(|e| FrameCallError::ClientNotReady(e.into()))?;

        let path = http_path(path)?;
        let request = Request::from_parts(metadata, Extensions::default(), frame);

        Ok(self.client.unary(request, path, FrameCodec).await)
    }

    /// Performs a Bidirectional Streaming gRPC call (Stream of Frames -> Stream of Frames).
    ///
    /// The future resolves once the server has sent its response headers, so `frames` must be
    /// able to make progress on its own while this call is awaited.
    ///
    /// # Returns
    ///
    /// * `Ok(Ok(Response))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(FrameCallError)` - Failed to send request or connect.
    pub async fn bidirectional_streaming(
        &mut self,
        path: &str,
        frames: impl Stream<Item = Frame> + Send + 'static,
        metadata: MetadataMap,
    ) -> Result<Result<Response<Streaming<Frame>>, Status>, FrameCallError> {
        self.client
            .ready()
            .await
            .map_err(|e| FrameCallError::ClientNotReady(e.into()))?;

        let path = http_path(path)?;
        let request = Request::from_parts(metadata, Extensions::default(), frames);

        Ok(self.client.streaming(request, path, FrameCodec).await)
    }

    /// Performs a Bidirectional Streaming gRPC call whose request stream may be aborted.
    ///
    /// The request ends cleanly when `items` ends, and fails at the first [`Relay::Abort`].
    pub async fn relay(
        &mut self,
        path: &str,
        items: impl Stream<Item = Relay> + Send + 'static,
        metadata: MetadataMap,
    ) -> Result<Result<Response<Streaming<Frame>>, Status>, FrameCallError> {
        self.client
            .ready()
            .await
            .map_err(|e| FrameCallError::ClientNotReady(e.into()))?;

        let path = http_path(path)?;
        let request = Request::from_parts(metadata, Extensions::default(), items);

        Ok(self.client.streaming(request, path, RelayCodec).await)
    }
}

/// A transport resetting the HTTP/2 stream with `CANCEL` when a request body fails.
///
/// Without it the stream is reset with `INTERNAL_ERROR`, and the server sees an internal error
/// where the client meant to cancel.
#[derive(Debug, Clone)]
pub struct CancelOnAbort<S = Channel> {
    inner: S,
}

impl<S> CancelOnAbort<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Service<http::Request<tonic::body::Body>> for CancelOnAbort<S>
where
    S: Service<http::Request<tonic::body::Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<tonic::body::Body>) -> Self::Future {
        let req = req.map(|body| {
            tonic::body::Body::new(body.map_err(|_| h2::Error::from(h2::Reason::CANCEL)))
        });
        self.inner.call(req)
    }
}

fn http_path(path: &str) -> Result<http::uri::PathAndQuery, FrameCallError> {
    http::uri::PathAndQuery::from_str(path).map_err(|source| FrameCallError::InvalidPath {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_grpc_method_paths() {
        let path = http_path("/echo.EchoService/UnaryEcho").unwrap();
        assert_eq!(path.path(), "/echo.EchoService/UnaryEcho");
    }

    #[test]
    fn test_rejects_paths_with_invalid_characters() {
        let err = http_path("/echo.EchoService/Unary Echo").unwrap_err();
        assert!(
            matches!(err, FrameCallError::InvalidPath { path, .. } if path.contains("Unary Echo"))
        );
    }
}
