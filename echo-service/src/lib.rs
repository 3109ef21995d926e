//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC backend for integration
//! testing the `grelay` proxy. It is not intended for production use.
//!
//! The service is wired by hand on top of `tonic::server::Grpc`, so no `protoc` is needed to
//! build it. Every method is served as a stream, which is wire-compatible with all four
//! call shapes.
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    Code, Request, Response, Status, Streaming,
    codegen::{Body, BoxFuture, Context, Poll, Service, StdError, http},
    metadata::{MetadataMap, MetadataValue},
    server::{NamedService, StreamingService},
};
use tonic_prost::ProstCodec;

pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EchoRequest {
        #[prost(string, tag = "1")]
        pub message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EchoResponse {
        #[prost(string, tag = "1")]
        pub message: ::prost::alloc::string::String,
    }
}

use pb::{EchoRequest, EchoResponse};

pub const SERVICE_NAME: &str = "echo.EchoService";

/// Response header listing every `x-forwarded-for` value the backend received.
pub const ECHO_FORWARDED_FOR: &str = "x-echo-forwarded-for";
/// Response header echoing the `x-tenant` value the backend received.
pub const ECHO_TENANT: &str = "x-echo-tenant";
/// Trailer sent by `ChorusEcho` with the number of messages it received.
pub const ECHO_COUNT: &str = "x-echo-count";
/// Trailer sent by `FailingStreamingEcho` alongside its error status.
pub const FAILURE_REASON: &str = "x-failure-reason";

/// Returns the HTTP/2 path of an echo method, e.g. `/echo.EchoService/UnaryEcho`.
pub fn path(method: &str) -> String {
    format!("/{SERVICE_NAME}/{method}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    /// Replies with the request message.
    Unary,
    /// Replies with `"<message> - seq <i>"` three times.
    ServerStreaming,
    /// Replies once with every request message concatenated.
    ClientStreaming,
    /// Replies `"echo: <message>"` to each request as it arrives.
    Bidirectional,
    /// Waits for the caller to finish, replays every message, then sends `"done: <n>"` and
    /// an `x-echo-count` trailer.
    Chorus,
    /// Replies once, then aborts with an `x-failure-reason` trailer.
    FailingStreaming,
}

impl Method {
    fn from_path(path: &str) -> Option<Self> {
        let method = path.strip_prefix('/')?.strip_prefix(SERVICE_NAME)?.strip_prefix('/')?;

        match method {
            "UnaryEcho" => Some(Self::Unary),
            "ServerStreamingEcho" => Some(Self::ServerStreaming),
            "ClientStreamingEcho" => Some(Self::ClientStreaming),
            "BidirectionalEcho" => Some(Self::Bidirectional),
            "ChorusEcho" => Some(Self::Chorus),
            "FailingStreamingEcho" => Some(Self::FailingStreaming),
            _ => None,
        }
    }
}

type EchoStream = ReceiverStream<Result<EchoResponse, Status>>;

/// What the backend observed on the request stream of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    /// A request message, by its `message` field.
    Received(String),
    /// The caller half-closed the stream.
    Completed,
    /// The stream failed before completing.
    Failed(Code),
}

/// The echo backend, ready to be added to a `tonic` server.
#[derive(Debug, Clone, Default)]
pub struct EchoServiceServer {
    observer: Observer,
}

impl EchoServiceServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend reporting what it reads from the request streams of `ClientStreamingEcho`,
    /// `BidirectionalEcho` and `ChorusEcho` calls.
    pub fn observed() -> (Self, mpsc::UnboundedReceiver<RequestEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = Self {
            observer: Observer(Some(events_tx)),
        };
        (server, events_rx)
    }
}

#[derive(Debug, Clone, Default)]
struct Observer(Option<mpsc::UnboundedSender<RequestEvent>>);

impl Observer {
    fn watch(
        &self,
        received: Result<Option<EchoRequest>, Status>,
    ) -> Result<Option<EchoRequest>, Status> {
        if let Some(events) = &self.0 {
            let event = match &received {
                Ok(Some(request)) => RequestEvent::Received(request.message.clone()),
                Ok(None) => RequestEvent::Completed,
                Err(status) => RequestEvent::Failed(status.code()),
            };
            let _ = events.send(event);
        }
        received
    }
}

impl NamedService for EchoServiceServer {
    const NAME: &'static str = SERVICE_NAME;
}

impl<B> Service<http::Request<B>> for EchoServiceServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(method) = Method::from_path(req.uri().path()) else {
            let status = Status::unimplemented("Unknown echo method");
            return Box::pin(async move { Ok(status.into_http::<tonic::body::Body>()) });
        };

        let call = EchoCall {
            method,
            observer: self.observer.clone(),
        };

        Box::pin(async move {
            let codec = ProstCodec::<EchoResponse, EchoRequest>::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.streaming(call, req).await)
        })
    }
}

struct EchoCall {
    method: Method,
    observer: Observer,
}

impl StreamingService<EchoRequest> for EchoCall {
    type Response = EchoResponse;
    type ResponseStream = EchoStream;
    type Future = BoxFuture<Response<EchoStream>, Status>;

    fn call(&mut self, request: Request<Streaming<EchoRequest>>) -> Self::Future {
        let method = self.method;
        let observer = self.observer.clone();
        Box::pin(async move { serve(method, observer, request).await })
    }
}

async fn serve(
    method: Method,
    observer: Observer,
    request: Request<Streaming<EchoRequest>>,
) -> Result<Response<EchoStream>, Status> {
    let headers = echoed_headers(request.metadata());
    let mut inbound = request.into_inner();
    let (tx, rx) = mpsc::channel(4);

    match method {
        Method::Unary => {
            let request = first_message(&mut inbound).await?;
            let _ = tx.send(Ok(reply(request.message))).await;
        }
        Method::ServerStreaming => {
            let request = first_message(&mut inbound).await?;
            tokio::spawn(async move {
                for i in 0..3 {
                    let message = format!("{} - seq {i}", request.message);
                    if tx.send(Ok(reply(message))).await.is_err() {
                        break;
                    }
                }
            });
        }
        Method::ClientStreaming => {
            let mut concatenated = String::new();
            while let Some(request) = observer.watch(inbound.message().await)? {
                concatenated.push_str(&request.message);
            }
            let _ = tx.send(Ok(reply(concatenated))).await;
        }
        Method::Bidirectional => {
            tokio::spawn(async move {
                loop {
                    let item = match observer.watch(inbound.message().await) {
                        Ok(Some(request)) => Ok(reply(format!("echo: {}", request.message))),
                        Ok(None) => break,
                        Err(status) => Err(status),
                    };
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        Method::Chorus => {
            tokio::spawn(async move {
                let mut received = Vec::new();
                loop {
                    match observer.watch(inbound.message().await) {
                        Ok(Some(request)) => received.push(request.message),
                        Ok(None) => break,
                        Err(status) => {
                            let _ = tx.send(Err(status)).await;
                            return;
                        }
                    }
                }

                let count = received.len();
                for message in received {
                    if tx.send(Ok(reply(message))).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(Ok(reply(format!("done: {count}")))).await;

                let mut trailers = MetadataMap::new();
                if let Ok(value) = MetadataValue::try_from(count.to_string()) {
                    trailers.insert(ECHO_COUNT, value);
                }
                let _ = tx.send(Err(Status::with_metadata(Code::Ok, "", trailers))).await;
            });
        }
        Method::FailingStreaming => {
            let request = first_message(&mut inbound).await?;
            tokio::spawn(async move {
                if tx.send(Ok(reply(request.message))).await.is_err() {
                    return;
                }

                let mut trailers = MetadataMap::new();
                trailers.insert(FAILURE_REASON, MetadataValue::from_static("backend gave up"));
                let status = Status::with_metadata(Code::Aborted, "aborted by backend", trailers);
                let _ = tx.send(Err(status)).await;
            });
        }
    }

    let mut response = Response::new(ReceiverStream::new(rx));
    *response.metadata_mut() = headers;
    Ok(response)
}

async fn first_message(inbound: &mut Streaming<EchoRequest>) -> Result<EchoRequest, Status> {
    inbound
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("Missing request message"))
}

fn reply(message: String) -> EchoResponse {
    EchoResponse { message }
}

fn echoed_headers(metadata: &MetadataMap) -> MetadataMap {
    let mut headers = MetadataMap::new();

    let forwarded_for = metadata
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");

    if let Ok(value) = MetadataValue::try_from(forwarded_for) {
        headers.insert(ECHO_FORWARDED_FOR, value);
    }

    if let Some(tenant) = metadata.get("x-tenant") {
        headers.insert(ECHO_TENANT, tenant.clone());
    }

    headers
}
