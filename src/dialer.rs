use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::Scheme;
use http::Uri;
use hyper_util::rt::TokioIo;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::rules::RuleTable;

/// Outbound TCP connection setup that honours pending rewrite rules.
pub struct Dialer {
    rules: Arc<RuleTable>,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl Dialer {
    pub fn new(rules: Arc<RuleTable>, connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            rules,
            connect_timeout,
            keepalive,
        }
    }

    /// Connects to `addr`, or to the destination a pending rule maps it to.
    ///
    /// A matching rule is consumed by this call whether or not the connection
    /// succeeds. When `cancel` is given, cancelling it aborts the attempt;
    /// the connect timeout applies either way.
    pub async fn dial(
        &self,
        cancel: Option<&CancellationToken>,
        addr: &str,
    ) -> Result<TcpStream, ProxyError> {
        let target = match self.rules.consume(addr) {
            Some(rewritten) => {
                info!("{} ==> {}", addr, rewritten);
                rewritten
            }
            None => addr.to_string(),
        };

        let connect = timeout(self.connect_timeout, TcpStream::connect(target.as_str()));
        let result = match cancel {
            Some(token) => tokio::select! {
                res = connect => res,
                _ = token.cancelled() => {
                    return Err(ProxyError::dial(
                        target,
                        io::Error::new(io::ErrorKind::Interrupted, "dial cancelled"),
                    ));
                }
            },
            None => connect.await,
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProxyError::dial(target, e)),
            Err(_) => {
                return Err(ProxyError::dial(
                    target,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to disable nagle on {}", target);
        }
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "failed to enable keep-alive on {}", target);
        }

        debug!(%target, "dialed");
        Ok(stream)
    }
}

/// Connector handing the pooled forward client connections from a [`Dialer`].
///
/// The dial key is the URI's `host:port`, defaulting the port to 443 for
/// `https` and 80 otherwise.
#[derive(Clone)]
pub struct DialConnector {
    dialer: Arc<Dialer>,
    cancel: CancellationToken,
}

impl DialConnector {
    pub fn new(dialer: Arc<Dialer>, cancel: CancellationToken) -> Self {
        Self { dialer, cancel }
    }
}

impl tower_service::Service<Uri> for DialConnector {
    type Response = TokioIo<TcpStream>;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        let cancel = self.cancel.clone();
        Box::pin(async move {
            let authority = uri.authority().ok_or(ProxyError::MissingTarget)?;
            let default_port = if uri.scheme() == Some(&Scheme::HTTPS) {
                443
            } else {
                80
            };
            let addr = format!(
                "{}:{}",
                authority.host(),
                authority.port_u16().unwrap_or(default_port)
            );
            let stream = dialer.dial(Some(&cancel), &addr).await?;
            Ok(TokioIo::new(stream))
        })
    }
}
