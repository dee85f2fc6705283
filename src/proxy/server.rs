//! Per-family gRPC listener.
//!
//! Every inbound HTTP/2 stream is treated as a bidirectional streaming call
//! with opaque frames, routed by the director and relayed to the leased
//! backend channel. Unary and server/client streaming methods fit the same
//! shape on the wire, so one handler serves them all.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use hyper::header::HOST;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, HeaderMap};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::BoxFuture;
use tonic::server::{Grpc, StreamingService};
use tonic::{Extensions, Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pool::EngineFamily;
use crate::proxy::codec::{Frame, FrameCodec};
use crate::proxy::director::RoutingDirector;

/// Ping-style methods registered by name; forwarded like any other method.
pub const DIAGNOSTIC_METHODS: [&str; 4] = ["PingEmpty", "Ping", "PingError", "PingList"];

/// Log label for a full method path.
pub fn route_label(path: &str) -> &'static str {
    let method = path.rsplit('/').next().unwrap_or_default();
    if DIAGNOSTIC_METHODS.contains(&method) {
        "diagnostic"
    } else {
        "forward"
    }
}

/// Parse a `grpc-timeout` header value such as `250m` or `5S`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

fn caller_deadline(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("grpc-timeout")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
}

/// First error seen on a caller's inbound stream.
#[derive(Clone, Default)]
struct InboundFault(Arc<Mutex<Option<Status>>>);

/// Forward inbound frames until the first error, which is parked in `fault`
/// and half-closes the backend stream.
fn until_fault<S>(inbound: S, fault: InboundFault) -> impl Stream<Item = Frame> + Send + 'static
where
    S: Stream<Item = std::result::Result<Frame, Status>> + Send + 'static,
{
    inbound.scan(fault, |fault, frame| {
        futures::future::ready(match frame {
            Ok(frame) => Some(frame),
            Err(status) => {
                warn!("Inbound stream failed, half-closing: {}", status.message());
                *fault.0.lock() = Some(status);
                None
            }
        })
    })
}

/// Append the parked inbound error, if any, after the backend's frames.
fn surface_fault<S>(
    frames: S,
    fault: InboundFault,
) -> impl Stream<Item = std::result::Result<Frame, Status>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Frame, Status>> + Send + 'static,
{
    let trailer = futures::stream::once(async move { fault.0.lock().take() })
        .filter_map(|status| futures::future::ready(status.map(Err::<Frame, Status>)));
    frames.chain(trailer)
}

/// One inbound call waiting to be relayed.
struct ProxiedCall {
    director: Arc<RoutingDirector>,
    path: String,
    authority: String,
    deadline: Option<Duration>,
}

impl StreamingService<Frame> for ProxiedCall {
    type Response = Frame;
    type ResponseStream = BoxStream<'static, std::result::Result<Frame, Status>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let director = self.director.clone();
        let path = self.path.clone();
        let authority = self.authority.clone();
        let deadline = self.deadline;
        Box::pin(async move { relay(director, path, authority, deadline, request).await })
    }
}

async fn relay(
    director: Arc<RoutingDirector>,
    path: String,
    authority: String,
    deadline: Option<Duration>,
    request: Request<Streaming<Frame>>,
) -> std::result::Result<Response<BoxStream<'static, std::result::Result<Frame, Status>>>, Status> {
    let (metadata, _, inbound) = request.into_parts();

    let target = director.route(&path, &authority, &metadata, deadline).await?;
    debug!(
        route = route_label(&path),
        family = %target.family,
        owner = target.lease.owner(),
        "Relaying {}",
        path
    );

    let path_and_query = path
        .parse::<PathAndQuery>()
        .map_err(|_| Status::unimplemented(format!("invalid method path {}", path)))?;

    let mut client = tonic::client::Grpc::new(target.lease.channel());
    client
        .ready()
        .await
        .map_err(|e| Status::unavailable(format!("backend not ready: {}", e)))?;

    let fault = InboundFault::default();
    let outbound = until_fault(inbound, fault.clone());

    let response = client
        .streaming(
            Request::from_parts(metadata, Extensions::default(), outbound),
            path_and_query,
            FrameCodec::default(),
        )
        .await?;

    let (metadata, body, _) = response.into_parts();
    // The lease rides along with the response stream and is released when
    // the last frame has been relayed or the caller goes away.
    let lease = target.lease;
    let frames = body.map(move |frame| {
        let _held = &lease;
        frame
    });

    Ok(Response::from_parts(
        metadata,
        surface_fault(frames, fault).boxed(),
        Extensions::default(),
    ))
}

async fn handle(
    director: Arc<RoutingDirector>,
    request: hyper::Request<Body>,
) -> hyper::Response<BoxBody> {
    let path = request.uri().path().to_string();
    let authority = request
        .uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            request
                .headers()
                .get(HOST)
                .and_then(|host| host.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let deadline = caller_deadline(request.headers());

    let call = ProxiedCall {
        director,
        path,
        authority,
        deadline,
    };
    Grpc::new(FrameCodec::default()).streaming(call, request).await
}

/// HTTP/2 listener for one engine family.
pub struct ProxyServer {
    family: EngineFamily,
    director: Arc<RoutingDirector>,
    window_size: u32,
}

impl ProxyServer {
    pub fn new(family: EngineFamily, director: Arc<RoutingDirector>, window_size: u32) -> Self {
        Self {
            family,
            director,
            window_size,
        }
    }

    /// Bind `addr` and serve until `shutdown` fires.
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("{} proxy listening on {}", self.family, listener.local_addr()?);

        let mut http = Http::new();
        http.http2_only(true)
            .http2_initial_stream_window_size(self.window_size)
            .http2_initial_connection_window_size(self.window_size);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("{} proxy accept failed: {}", self.family, e);
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let director = self.director.clone();
            let service = service_fn(move |request| {
                let director = director.clone();
                async move { Ok::<_, Infallible>(handle(director, request).await) }
            });
            let connection = http.serve_connection(stream, service);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                tokio::pin!(connection);
                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection from {} closed: {}", peer, e);
                }
            });
        }

        info!("{} proxy stopped", self.family);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(body: &'static [u8]) -> std::result::Result<Frame, Status> {
        Ok(Frame(Bytes::from_static(body)))
    }

    #[tokio::test]
    async fn test_inbound_decode_error_reaches_caller() {
        let fault = InboundFault::default();
        let inbound = futures::stream::iter(vec![
            frame(b"first"),
            Err(Status::internal("compressed frame without grpc-encoding")),
            frame(b"never sent"),
        ]);
        let forwarded: Vec<Frame> = until_fault(inbound, fault.clone()).collect().await;
        assert_eq!(forwarded, vec![Frame(Bytes::from_static(b"first"))]);

        let backend = futures::stream::iter(vec![frame(b"reply")]);
        let relayed: Vec<_> = surface_fault(backend, fault).collect().await;
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed[0].as_ref().unwrap(), &Frame(Bytes::from_static(b"reply")));
        let status = relayed[1].as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "compressed frame without grpc-encoding");
    }

    #[tokio::test]
    async fn test_clean_inbound_adds_no_status() {
        let fault = InboundFault::default();
        let inbound = futures::stream::iter(vec![frame(b"a"), frame(b"b")]);
        let forwarded: Vec<Frame> = until_fault(inbound, fault.clone()).collect().await;
        assert_eq!(forwarded.len(), 2);

        let backend = futures::stream::iter(vec![frame(b"reply")]);
        let relayed: Vec<_> = surface_fault(backend, fault).collect().await;
        assert_eq!(relayed.len(), 1);
        assert!(relayed[0].is_ok());
    }

    #[test]
    fn test_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("100u"), Some(Duration::from_micros(100)));
        assert_eq!(parse_grpc_timeout("7n"), Some(Duration::from_nanos(7)));
        assert_eq!(parse_grpc_timeout("5"), None);
        assert_eq!(parse_grpc_timeout("5x"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[test]
    fn test_diagnostic_methods_are_labeled() {
        assert_eq!(route_label("/grpc.testing.TestService/Ping"), "diagnostic");
        assert_eq!(route_label("/grpc.testing.TestService/PingList"), "diagnostic");
        assert_eq!(route_label("/asr.v1.Asr/Recognize"), "forward");
    }
}
