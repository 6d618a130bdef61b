use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, info, trace, Instrument};

use crate::buffer_pool::BufferPool;
use crate::config::ProxyConfig;
use crate::dialer::{DialConnector, Dialer};
use crate::directive;
use crate::forward::{error_response, ForwardHandler, ProxyBody, UpstreamConnector};
use crate::rules::RuleTable;
use crate::tunnel::{established, TunnelHandler};

// ============================================================================
// SERVER
// ============================================================================

/// The proxy listener together with the components it owns.
///
/// The rule table lives exactly as long as the server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: ConnectionContext,
    force: CancellationToken,
    tasks: TaskTracker,
}

/// Per-connection view of the server's shared components.
#[derive(Clone)]
struct ConnectionContext {
    rules: Arc<RuleTable>,
    tunnel: TunnelHandler,
    forward: ForwardHandler,
    shutdown: CancellationToken,
}

impl Server {
    /// Binds the listener and wires the rule table, dialer, buffer pool and
    /// handlers together. Must be called inside a tokio runtime.
    pub fn bind(config: ProxyConfig) -> anyhow::Result<Self> {
        let addr = config.listen;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind {addr}"))?;
        socket.listen(config.backlog)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        let rules = Arc::new(RuleTable::new());
        let pool = BufferPool::new(config.buffer_size);
        let dialer = Arc::new(Dialer::new(
            rules.clone(),
            config.connect_timeout,
            config.keepalive,
        ));
        let force = CancellationToken::new();
        let connector =
            UpstreamConnector::new(DialConnector::new(dialer.clone(), force.clone()), &config)?;
        let forward = ForwardHandler::new(connector, pool.clone(), &config);

        Ok(Self {
            listener,
            local_addr,
            ctx: ConnectionContext {
                rules,
                tunnel: TunnelHandler::new(dialer, pool),
                forward,
                shutdown: CancellationToken::new(),
            },
            force,
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.ctx.rules
    }

    /// Accepts connections until [`Server::stop`] is called or accepting
    /// fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("🚀 Proxy listening on http://{}", self.local_addr);
        let mut id: u64 = 0;
        loop {
            let (stream, peer) = tokio::select! {
                res = self.listener.accept() => res.context("failed to accept connection")?,
                _ = self.ctx.shutdown.cancelled() => break,
            };

            let ctx = self.ctx.clone();
            let force = self.force.clone();
            self.tasks.spawn(
                async move {
                    tokio::select! {
                        _ = ctx.serve_connection(stream) => {}
                        _ = force.cancelled() => trace!("connection force-closed"),
                    }
                }
                .instrument(debug_span!("conn", id, %peer)),
            );
            id += 1;
        }
        info!("listener stopped");
        Ok(())
    }

    /// Stops accepting and winds down served connections.
    ///
    /// With a non-zero `grace`, in-flight requests get up to that long to
    /// finish before remaining connections are closed; zero closes them at
    /// once. Established tunnels are not tracked and keep running.
    pub async fn stop(&self, grace: Duration) {
        info!(?grace, "shutting down");
        self.ctx.shutdown.cancel();
        self.tasks.close();

        if !grace.is_zero() {
            match timeout(grace, self.tasks.wait()).await {
                Ok(()) => debug!("all connections closed cleanly"),
                Err(_) => debug!(
                    remaining = self.tasks.len(),
                    "grace period elapsed, forcing close"
                ),
            }
        }

        self.force.cancel();
        self.tasks.wait().await;
        info!("shutdown complete");
    }
}

impl ConnectionContext {
    /// Serves every request on one client connection over HTTP/1. A
    /// `CONNECT` releases the connection to the tunnel once it is answered.
    async fn serve_connection(self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "failed to disable nagle");
        }

        let ctx = self.clone();
        let service = service_fn(move |req| {
            let ctx = ctx.clone();
            async move { Ok::<_, Infallible>(ctx.handle_request(req).await) }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .auto_date_header(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        let finished = tokio::select! {
            res = conn.as_mut() => Some(res),
            _ = self.shutdown.cancelled() => None,
        };
        let res = match finished {
            Some(res) => res,
            None => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = res {
            debug!(error = %e, "failed to serve connection");
        }
    }

    async fn handle_request(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        directive::apply(&self.rules, req.headers_mut());

        if req.method() == Method::CONNECT {
            return match self.tunnel.open(&mut req) {
                Ok(()) => established(),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            };
        }

        self.forward.serve(req).await
    }
}
