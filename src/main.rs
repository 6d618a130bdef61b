#![warn(clippy::all)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rewrite_proxy::{config, ProxyConfig, Server};
use tracing::info;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Upstream connect timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_connect: u64,

    /// TCP keep-alive interval for upstream sockets in seconds.
    #[arg(long, default_value_t = 30)]
    keepalive: u64,

    /// Seconds an idle pooled upstream connection is kept.
    #[arg(long, default_value_t = 90)]
    pool_idle_timeout: u64,

    /// Idle pooled upstream connections kept per origin host.
    #[arg(long, default_value_t = 100)]
    pool_max_idle_per_host: usize,

    /// TLS handshake timeout for https origins in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_tls_handshake: u64,

    /// Milliseconds to hold a request body waiting for 100 Continue.
    #[arg(long, default_value_t = 1000)]
    timeout_expect_continue: u64,

    /// PEM file with extra CA certificates trusted for https origins.
    #[arg(long)]
    upstream_ca: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    buffer_size: usize,

    /// Seconds to let in-flight requests finish on Ctrl-C. 0 stops at once.
    #[arg(long, default_value_t = 5)]
    shutdown_grace: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> anyhow::Result<ProxyConfig> {
        let listen: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))?;
        let upstream_roots = match &self.upstream_ca {
            Some(path) => config::load_roots(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Vec::new(),
        };
        Ok(ProxyConfig {
            listen,
            connect_timeout: Duration::from_secs(self.timeout_connect),
            keepalive: Duration::from_secs(self.keepalive),
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout),
            tls_handshake_timeout: Duration::from_secs(self.timeout_tls_handshake),
            expect_continue_timeout: Duration::from_millis(self.timeout_expect_continue),
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            upstream_roots,
            buffer_size: self.buffer_size,
            ..ProxyConfig::default()
        })
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.config()?;
    let grace = Duration::from_secs(args.shutdown_grace);

    let server = Arc::new(Server::bind(config)?);
    let runner = server.clone();
    let mut serving = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        res = &mut serving => return res?,
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received");
        }
    }

    server.stop(grace).await;
    serving.await?
}
