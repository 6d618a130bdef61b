//! `CONNECT` handling: connection takeover, acknowledgment, dial and relay.

use std::sync::Arc;

use http::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::buffer_pool::BufferPool;
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::forward::{empty_response, ProxyBody};

/// Access to the client connection behind a request, when the serving layer
/// can give it up.
pub enum Hijacker {
    /// Released by the HTTP server once the response to the request has
    /// been written. Bytes the client sent past the request head come with it.
    Upgrade(OnUpgrade),
    /// The serving layer keeps the connection.
    Unsupported,
}

impl Hijacker {
    pub fn from_request<B>(req: &mut Request<B>) -> Self {
        match req.extensions_mut().remove::<OnUpgrade>() {
            Some(upgrade) => Self::Upgrade(upgrade),
            None => Self::Unsupported,
        }
    }

    pub fn hijack(self) -> Result<OnUpgrade, ProxyError> {
        match self {
            Self::Upgrade(upgrade) => Ok(upgrade),
            Self::Unsupported => Err(ProxyError::HijackUnsupported),
        }
    }
}

/// `200 Connection established`, with no body and no length headers. The
/// status line echoes the request's protocol version.
pub fn established() -> Response<ProxyBody> {
    let mut response = empty_response(StatusCode::OK);
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    response
}

/// `host:port` a `CONNECT` should dial.
///
/// Uses the `Host` header, falling back to the URI authority, and appends
/// the URI's port when the host does not already end with it.
pub fn connect_target(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let mut addr = headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))?;

    if let Some(port) = uri.port() {
        let port = port.as_str();
        if !addr.ends_with(port) {
            addr.push(':');
            addr.push_str(port);
        }
    }
    Some(addr)
}

#[derive(Clone)]
pub struct TunnelHandler {
    dialer: Arc<Dialer>,
    pool: BufferPool,
}

impl TunnelHandler {
    pub fn new(dialer: Arc<Dialer>, pool: BufferPool) -> Self {
        Self { dialer, pool }
    }

    /// Claims the connection behind a `CONNECT` and schedules the tunnel.
    ///
    /// Errors are returned only while nothing has been committed, so the
    /// caller can still answer over HTTP. On success the caller answers with
    /// [`established`]; the tunnel task waits for that response to be
    /// written, then dials. Every later failure is logged there and ends with
    /// the client connection closed.
    pub fn open<B>(&self, req: &mut Request<B>) -> Result<(), ProxyError> {
        let target =
            connect_target(req.uri(), req.headers()).ok_or(ProxyError::MissingTarget)?;
        let upgrade = Hijacker::from_request(req).hijack()?;

        let handler = self.clone();
        let span = debug_span!("tunnel", %target);
        tokio::spawn(async move { handler.run(target, upgrade).await }.instrument(span));
        Ok(())
    }

    async fn run(self, target: String, upgrade: OnUpgrade) {
        let mut client = match upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                warn!(error = %e, "hijack connection failed");
                return;
            }
        };

        let upstream = match self.dialer.dial(None, &target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "dial remote addr failed");
                let _ = client.shutdown().await;
                return;
            }
        };

        debug!("tunnel established");
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = upstream.into_split();
        let closer = CancellationToken::new();

        tokio::spawn(
            relay(
                self.pool.clone(),
                client_read,
                upstream_write,
                closer.clone(),
                "client->upstream",
            )
            .in_current_span(),
        );
        tokio::spawn(
            relay(
                self.pool,
                upstream_read,
                client_write,
                closer,
                "upstream->client",
            )
            .in_current_span(),
        );
    }
}

/// Copies one direction of a tunnel, then tears the whole tunnel down.
///
/// `closer` is shared by both directions. Whichever finishes first cancels
/// it, which stops the other copy; cancelling twice is a no-op. Each task
/// drops the halves it owns, and a connection closes once both of its halves
/// are gone.
async fn relay<R, W>(
    pool: BufferPool,
    mut reader: R,
    mut writer: W,
    closer: CancellationToken,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        res = pool.copy(&mut reader, &mut writer) => Some(res),
        _ = closer.cancelled() => None,
    };
    match result {
        Some(Ok(bytes)) => trace!(direction, bytes, "relay reached eof"),
        Some(Err(e)) => trace!(direction, error = %e, "relay ended with error"),
        None => trace!(direction, "relay stopped by peer direction"),
    }

    let _ = writer.shutdown().await;
    closer.cancel();
    debug!(direction, "tunnel direction closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connect(target: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::connect(target);
        if let Some(host) = host {
            builder = builder.header(http::header::HOST, host);
        }
        builder.body(()).unwrap()
    }

    fn target_of(req: &Request<()>) -> Option<String> {
        connect_target(req.uri(), req.headers())
    }

    #[test]
    fn test_unsupported_hijack_is_typed() {
        assert!(matches!(
            Hijacker::Unsupported.hijack(),
            Err(ProxyError::HijackUnsupported)
        ));
    }

    #[test]
    fn test_request_without_upgrade_cannot_be_hijacked() {
        let mut req = connect("a.test:443", None);
        assert!(matches!(
            Hijacker::from_request(&mut req),
            Hijacker::Unsupported
        ));
    }

    #[test]
    fn test_established_has_custom_reason() {
        let response = established();
        assert_eq!(response.status(), StatusCode::OK);
        let reason = response.extensions().get::<ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Connection established");
        assert!(response.headers().is_empty());
    }

    #[test]
    fn test_connect_target_prefers_host_header() {
        let req = connect("a.test:443", Some("b.test:443"));
        assert_eq!(target_of(&req).as_deref(), Some("b.test:443"));
    }

    #[test]
    fn test_connect_target_falls_back_to_uri() {
        let req = connect("a.test:8443", None);
        assert_eq!(target_of(&req).as_deref(), Some("a.test:8443"));
    }

    #[test]
    fn test_connect_target_appends_missing_port() {
        let req = connect("a.test:443", Some("a.test"));
        assert_eq!(target_of(&req).as_deref(), Some("a.test:443"));
    }

    #[tokio::test]
    async fn test_relay_stops_when_peer_direction_closes() {
        let pool = BufferPool::new(16);
        let (_near, far) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(far);
        let closer = CancellationToken::new();

        let task = tokio::spawn(relay(pool.clone(), reader, writer, closer.clone(), "test"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle(), 0);
        closer.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_relay_eof_cancels_closer() {
        let pool = BufferPool::new(16);
        let input: &[u8] = b"hello";
        let mut output = Vec::new();
        let closer = CancellationToken::new();

        relay(pool, input, &mut output, closer.clone(), "test").await;
        assert!(closer.is_cancelled());
        assert_eq!(output, b"hello");
    }
}
