use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::buffer_pool::DEFAULT_BUFFER_SIZE;
use crate::error::ProxyError;

/// Runtime settings shared by the listener, dialer and forward transport.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    /// Budget for the TLS handshake with an `https` origin, on top of the
    /// connect timeout.
    pub tls_handshake_timeout: Duration,
    /// How long a request body announced with `Expect: 100-continue` is held
    /// back waiting for the origin's `100 Continue`.
    pub expect_continue_timeout: Duration,
    pub pool_idle_timeout: Duration,
    /// Idle pooled upstream connections kept per origin host.
    pub pool_max_idle_per_host: usize,
    pub buffer_size: usize,
    pub backlog: i32,
    /// Trusted in addition to the platform roots when verifying `https`
    /// origins.
    pub upstream_roots: Vec<CertificateDer<'static>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connect_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 100,
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: 1024,
            upstream_roots: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}

/// Reads every PEM certificate in `path`.
pub fn load_roots(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = BufReader::new(File::open(path)?);
    let roots = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_roots_reads_every_certificate() {
        let first = rcgen::generate_simple_self_signed(vec!["a.test".into()]).unwrap();
        let second = rcgen::generate_simple_self_signed(vec!["b.test".into()]).unwrap();
        let path = std::env::temp_dir()
            .join(format!("rewrite-proxy-roots-{}.pem", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(first.cert.pem().as_bytes()).unwrap();
        file.write_all(second.cert.pem().as_bytes()).unwrap();
        drop(file);

        let roots = load_roots(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0], *first.cert.der());
    }

    #[test]
    fn test_load_roots_missing_file() {
        let err = load_roots(Path::new("/nonexistent/roots.pem")).unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
