//! # Stream Bridge
//!
//! The handler that relays one inbound call to one outbound call, frame for frame.
//!
//! ## Lifecycle
//!
//! 1. **Routing**: the [`Director`] resolves the call. A failure ends the call right away,
//!    nothing is forwarded.
//! 2. **Forwarding**: the outbound call is opened as a bidirectional stream whatever the shape
//!    of the method on the backend, and two loops run concurrently:
//!    - caller -> backend: relays the caller's frames into the outbound request.
//!    - backend -> caller: relays the backend's frames into the inbound response.
//!
//!    Each loop reports its terminal outcome exactly once, on its own oneshot channel.
//! 3. **Draining**: the caller half-closed its side. The outbound request is closed and the
//!    backend's remaining responses keep flowing.
//! 4. **Aborting**: any failure other than a clean end of stream. The per-call
//!    [`CancellationToken`] is cancelled, which stops both loops and resets the outbound
//!    stream, so the backend sees a cancelled call and never a complete request.
//! 5. **Terminated**: exactly one final status reaches the caller, along with the backend
//!    trailers when there are any.
//!
//! Every channel between the two legs holds a single frame, so a slow consumer on either side
//! applies back-pressure to the producer on the other side instead of buffering.
use super::BoxFuture;
use crate::{
    call::{FORWARDED_FOR, InboundCall},
    director::{Director, strip_transport_headers},
    grpc::{
        client::{CancelOnAbort, FrameClient},
        codec::{Frame, Relay},
    },
};
use futures_util::Stream;
use std::{
    future::Future,
    net::IpAddr,
    pin::{Pin, pin},
    sync::Arc,
    task::{Context, Poll, ready},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};
use tonic::{
    Code, Request, Response, Status, Streaming,
    metadata::{MetadataMap, MetadataValue},
    server::StreamingService,
};
use tracing::debug;

/// Outcome of the caller -> backend loop. `Ok` is a clean end of stream.
type CallerOutcome = Result<(), Status>;

/// Outcome of the backend -> caller loop. `Ok` carries the backend trailers.
type BackendOutcome = Result<Option<MetadataMap>, Status>;

/// The transparent handler for a single method path.
pub(crate) struct StreamBridge<D> {
    pub(crate) director: Arc<D>,
    pub(crate) method: String,
    pub(crate) local_ip: IpAddr,
}

impl<D: Director> StreamingService<Frame> for StreamBridge<D> {
    type Response = Frame;
    type ResponseStream = BridgeStream;
    type Future = BoxFuture<Result<Response<BridgeStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let director = Arc::clone(&self.director);
        let method = self.method.clone();
        let local_ip = self.local_ip;

        Box::pin(async move { relay(director.as_ref(), &method, local_ip, request).await })
    }
}

/// The response stream handed to the server. Dropping it cancels the whole proxied call.
pub struct BridgeStream {
    frames: ReceiverStream<Result<Frame, Status>>,
    _cancel_on_drop: DropGuard,
}

impl Stream for BridgeStream {
    type Item = Result<Frame, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

/// The outbound request stream: the caller's frames, then a clean end or an abort.
///
/// The stream only ends cleanly when the frames channel closes while `abort` is not cancelled.
/// Frames still queued when the call is aborted are never sent.
struct OutboundFrames {
    frames: ReceiverStream<Frame>,
    abort: CancellationToken,
    on_abort: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl OutboundFrames {
    fn new(frames: mpsc::Receiver<Frame>, abort: CancellationToken) -> Self {
        Self {
            frames: ReceiverStream::new(frames),
            on_abort: Box::pin(abort.clone().cancelled_owned()),
            abort,
            finished: false,
        }
    }

    fn end_with_abort(&mut self) -> Poll<Option<Relay>> {
        self.finished = true;
        Poll::Ready(Some(Relay::Abort))
    }
}

impl Stream for OutboundFrames {
    type Item = Relay;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        if self.on_abort.as_mut().poll(cx).is_ready() {
            return self.end_with_abort();
        }

        match ready!(Pin::new(&mut self.frames).poll_next(cx)) {
            Some(frame) => Poll::Ready(Some(Relay::Frame(frame))),
            // The caller loop cancels `abort` before letting go of the sender.
            None if self.abort.is_cancelled() => self.end_with_abort(),
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

async fn relay<D: Director>(
    director: &D,
    method: &str,
    local_ip: IpAddr,
    request: Request<Streaming<Frame>>,
) -> Result<Response<BridgeStream>, Status> {
    let peer = request.remote_addr();
    let (metadata, _, inbound) = request.into_parts();

    // Routing
    let upstream = director
        .direct(&InboundCall::new(method, peer, &metadata))
        .await?;

    // Cancels every task of this call if we bail out before handing the stream to the server.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let mut outbound_metadata = upstream.metadata;
    if let Ok(value) = MetadataValue::try_from(local_ip.to_string()) {
        outbound_metadata.append(FORWARDED_FOR, value);
    }

    // Forwarding
    let abort = cancel.child_token();
    let (frames_tx, frames_rx) = mpsc::channel(1);
    let mut caller_done = spawn_loop(forward_caller(inbound, frames_tx, abort.clone()));

    let mut client = FrameClient::new(CancelOnAbort::new(upstream.channel));
    let mut open = pin!(client.relay(
        method,
        OutboundFrames::new(frames_rx, abort),
        outbound_metadata,
    ));

    // The backend may wait for input before answering with headers, so the caller loop is
    // already running while the call is being opened.
    let mut caller_finished = false;
    let opened = loop {
        tokio::select! {
            biased;

            outcome = &mut caller_done, if !caller_finished => {
                caller_finished = true;
                if let Err(status) = settle(outcome) {
                    cancel.cancel();
                    return Err(caller_failure(status));
                }
            }
            opened = &mut open => break opened,
        }
    };

    let response = opened
        .map_err(|err| Status::unavailable(err.to_string()))?
        .inspect_err(|status| {
            debug!(method = %method, code = ?status.code(), "Backend rejected call");
        })?;

    let (mut headers, backend, _) = response.into_parts();
    strip_transport_headers(&mut headers);

    let (responses_tx, responses_rx) = mpsc::channel(1);
    let backend_done = spawn_loop(forward_backend(backend, responses_tx.clone(), cancel.clone()));

    let caller_done = (!caller_finished).then_some(caller_done);
    let method = method.to_string();

    tokio::spawn(async move {
        let outcome = supervise(caller_done, backend_done, &cancel).await;

        match &outcome {
            Ok(_) => debug!(method = %method, "Proxied call completed"),
            Err(status) => debug!(method = %method, code = ?status.code(), "Proxied call failed"),
        }

        if let Some(last) = final_item(outcome) {
            // The caller may already be gone, there is nobody left to tell.
            let _ = responses_tx.send(last).await;
        }
    });

    let stream = BridgeStream {
        frames: ReceiverStream::new(responses_rx),
        _cancel_on_drop: guard,
    };

    Ok(Response::from_parts(headers, stream, Default::default()))
}

/// Waits for the first conclusive outcome of the two forwarding loops.
///
/// `caller_done` is `None` when the caller already finished cleanly while the outbound call was
/// being opened.
async fn supervise(
    mut caller_done: Option<oneshot::Receiver<CallerOutcome>>,
    mut backend_done: oneshot::Receiver<BackendOutcome>,
    cancel: &CancellationToken,
) -> BackendOutcome {
    for _ in 0..2 {
        tokio::select! {
            // A failing caller loop resets the outbound stream, which fails the backend loop
            // right after. The caller's failure is the one to report.
            biased;

            outcome = completion(&mut caller_done), if caller_done.is_some() => {
                caller_done = None;

                // Draining: dropping the sender already closed the outbound request.
                if let Err(status) = settle(outcome) {
                    cancel.cancel();
                    return Err(caller_failure(status));
                }
            }
            outcome = &mut backend_done => {
                let outcome = settle(outcome);
                if outcome.is_err() {
                    cancel.cancel();
                }
                return outcome;
            }
        }
    }

    cancel.cancel();
    Err(Status::internal("gRPC proxying should never reach this stage"))
}

/// Relays the caller's frames to the backend until the caller half-closes.
///
/// Any other ending cancels `abort` before the sender is dropped, so the outbound stream is
/// reset instead of closed.
async fn forward_caller(
    mut inbound: Streaming<Frame>,
    outbound: mpsc::Sender<Frame>,
    abort: CancellationToken,
) -> CallerOutcome {
    loop {
        let frame = tokio::select! {
            _ = abort.cancelled() => return Err(Status::cancelled("Proxied call was cancelled")),
            frame = inbound.message() => frame.inspect_err(|_| abort.cancel())?,
        };

        let Some(frame) = frame else {
            return Ok(());
        };

        tokio::select! {
            _ = abort.cancelled() => return Err(Status::cancelled("Proxied call was cancelled")),
            sent = outbound.send(frame) => {
                if sent.is_err() {
                    // The backend stopped reading. Its final status arrives on the other loop.
                    return Ok(());
                }
            }
        }
    }
}

/// Relays the backend's frames to the caller until the backend ends the call.
async fn forward_backend(
    mut backend: Streaming<Frame>,
    inbound: mpsc::Sender<Result<Frame, Status>>,
    cancel: CancellationToken,
) -> BackendOutcome {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(Status::cancelled("Proxied call was cancelled")),
            frame = backend.message() => frame?,
        };

        let Some(frame) = frame else {
            return backend.trailers().await;
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(Status::cancelled("Proxied call was cancelled")),
            sent = inbound.send(Ok(frame)) => {
                if sent.is_err() {
                    return Err(Status::cancelled("Caller went away"));
                }
            }
        }
    }
}

/// Runs a forwarding loop on its own task, reporting its outcome on a oneshot channel.
fn spawn_loop<T, F>(forward: F) -> oneshot::Receiver<Result<T, Status>>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Status>> + Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let _ = done_tx.send(forward.await);
    });

    done_rx
}

async fn completion<T>(
    receiver: &mut Option<oneshot::Receiver<T>>,
) -> Result<T, oneshot::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.await,
        None => std::future::pending().await,
    }
}

fn settle<T>(outcome: Result<Result<T, Status>, oneshot::error::RecvError>) -> Result<T, Status> {
    outcome.unwrap_or_else(|_| Err(Status::internal("Forwarding task ended without an outcome")))
}

fn caller_failure(status: Status) -> Status {
    Status::internal(format!("failed proxying client to backend: {status}"))
}

/// Turns the outcome of the call into the last item of the response stream.
///
/// Backend trailers are only representable through a terminal status in `tonic`, so a
/// successful call with trailers ends with an `Ok` status carrying them.
fn final_item(outcome: BackendOutcome) -> Option<Result<Frame, Status>> {
    match outcome {
        Ok(Some(trailers)) if !trailers.is_empty() => {
            Some(Err(Status::with_metadata(Code::Ok, "", trailers)))
        }
        Ok(_) => None,
        Err(status) => Some(Err(status)),
    }
}
