use std::io;

use thiserror::Error;

/// Errors raised while servicing a proxied request or tunnel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// The serving layer cannot hand over the client connection.
    #[error("unsupported")]
    HijackUnsupported,

    /// Neither the request host nor its URI named a destination.
    #[error("request has no target address")]
    MissingTarget,

    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    RoundTrip(#[from] hyper_util::client::legacy::Error),

    #[error("unsupported protocol scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("tls handshake timeout")]
    TlsHandshakeTimeout,

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub(crate) fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }
}
