//! Plain (non-`CONNECT`) request forwarding through a pooled client.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderValue, CONTENT_TYPE, EXPECT};
use http::uri::Scheme;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder, MaybeHttpsStream};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_service::Service;
use tracing::{debug, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::config::ProxyConfig;
use crate::dialer::DialConnector;
use crate::error::ProxyError;

pub type ProxyBody = BoxBody<Bytes, io::Error>;

type BoxError = Box<dyn StdError + Send + Sync>;

const PIPE_CAPACITY: usize = 64 * 1024;

// ============================================================================
// UPSTREAM CONNECTOR
// ============================================================================

/// Dials through the [`DialConnector`] and layers TLS on top for `https`
/// origins. An `https` connect as a whole gets the connect timeout plus the
/// handshake timeout.
#[derive(Clone)]
pub struct UpstreamConnector {
    https: HttpsConnector<DialConnector>,
    tls_budget: Duration,
}

impl UpstreamConnector {
    pub fn new(dial: DialConnector, config: &ProxyConfig) -> Result<Self, ProxyError> {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(upstream_tls(config)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(dial);
        Ok(Self {
            https,
            tls_budget: config.connect_timeout + config.tls_handshake_timeout,
        })
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = MaybeHttpsStream<TokioIo<TcpStream>>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.https.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = uri.scheme() == Some(&Scheme::HTTPS);
        let connect = self.https.call(uri);
        if !tls {
            return Box::pin(connect);
        }
        let budget = self.tls_budget;
        Box::pin(async move {
            match timeout(budget, connect).await {
                Ok(res) => res,
                Err(_) => Err(ProxyError::TlsHandshakeTimeout.into()),
            }
        })
    }
}

/// Client TLS settings for `https` origins: platform roots plus any extra
/// roots from the config.
fn upstream_tls(config: &ProxyConfig) -> Result<ClientConfig, ProxyError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        debug!(error = %e, "skipping platform root");
    }
    let (platform, _) = roots.add_parsable_certificates(native.certs);
    let (extra, _) = roots.add_parsable_certificates(config.upstream_roots.iter().cloned());
    debug!(platform, extra, "upstream trust roots loaded");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

// ============================================================================
// REQUEST BODY
// ============================================================================

/// Client request body on its way upstream. When the request announced
/// `Expect: 100-continue` the body is held back until the origin answers
/// `100 Continue` or the wait elapses, whichever comes first.
pub struct HeldBody {
    gate: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    inner: Incoming,
}

impl Body for HeldBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        if let Some(gate) = self.gate.as_mut() {
            ready!(gate.as_mut().poll(cx));
            self.gate = None;
        }
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn expects_continue<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(EXPECT)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

// ============================================================================
// FORWARD HANDLER
// ============================================================================

#[derive(Clone)]
pub struct ForwardHandler {
    client: Client<UpstreamConnector, HeldBody>,
    pool: BufferPool,
    expect_continue_timeout: Duration,
}

impl ForwardHandler {
    pub fn new(connector: UpstreamConnector, pool: BufferPool, config: &ProxyConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http1_preserve_header_case(true)
            .build(connector);
        Self {
            client,
            pool,
            expect_continue_timeout: config.expect_continue_timeout,
        }
    }

    /// Sends `req` upstream and waits for the response head. No retries.
    pub async fn round_trip(&self, req: Request<Incoming>) -> Result<Response<Incoming>, ProxyError> {
        match req.uri().scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(ProxyError::UnsupportedScheme(
                    other.unwrap_or_default().to_string(),
                ))
            }
        }
        let req = self.hold_for_continue(req);
        Ok(self.client.request(req).await?)
    }

    fn hold_for_continue(&self, mut req: Request<Incoming>) -> Request<HeldBody> {
        if !expects_continue(&req) || req.body().is_end_stream() {
            return req.map(|inner| HeldBody { gate: None, inner });
        }

        let notify = Arc::new(Notify::new());
        let signal = notify.clone();
        hyper::ext::on_informational(&mut req, move |res| {
            if res.status() == StatusCode::CONTINUE {
                signal.notify_one();
            }
        });
        let wait = self.expect_continue_timeout;
        let gate = async move {
            if timeout(wait, notify.notified()).await.is_err() {
                trace!("no 100 continue from origin, sending body");
            }
        };
        req.map(|inner| HeldBody {
            gate: Some(Box::pin(gate)),
            inner,
        })
    }

    /// Forwards `req` and relays the upstream status, every header value and
    /// the body. A failed round trip becomes a 500 carrying the error text.
    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let upstream = match self.round_trip(req).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let text = error_chain(&e);
                warn!(%method, %uri, error = %text, "round trip failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &text);
            }
        };

        let (parts, body) = upstream.into_parts();
        debug!(%method, %uri, status = %parts.status, "forwarded");
        let mut response = Response::new(self.stream_body(body));
        *response.status_mut() = parts.status;
        let headers = response.headers_mut();
        for (name, value) in parts.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        response
    }

    /// Pumps the upstream body through a pooled buffer into the body handed
    /// to the client. The upstream body is dropped once the pump finishes.
    fn stream_body(&self, body: Incoming) -> ProxyBody {
        let (mut pipe_write, pipe_read) = tokio::io::duplex(PIPE_CAPACITY);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut upstream = Box::pin(StreamReader::new(
                body.map_err(io::Error::other).into_data_stream(),
            ));
            if let Err(e) = pool.copy(&mut upstream, &mut pipe_write).await {
                debug!(error = %e, "response body copy ended early");
            }
        });
        StreamBody::new(ReaderStream::new(pipe_read).map_ok(Frame::data)).boxed()
    }
}

/// Plain-text error response, body terminated by a newline.
pub fn error_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{text}\n")))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// Flattens an error and its sources into one line.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_joins_sources() {
        let err = ProxyError::dial(
            "a.test:80",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(error_chain(&err), "dial a.test:80: refused");
    }

    #[test]
    fn test_expects_continue_matches_token_case_insensitively() {
        let req = Request::post("http://a.test/")
            .header(EXPECT, "100-Continue")
            .body(())
            .unwrap();
        assert!(expects_continue(&req));

        let req = Request::post("http://a.test/").body(()).unwrap();
        assert!(!expects_continue(&req));
    }

    #[test]
    fn test_handshake_timeout_in_error_chain() {
        let err: BoxError = ProxyError::TlsHandshakeTimeout.into();
        assert_eq!(error_chain(err.as_ref()), "tls handshake timeout");
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"boom\n");
    }
}
