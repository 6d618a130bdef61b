//! Forward HTTP proxy with `CONNECT` tunneling and one-shot destination
//! rewrites requested in-band through the `User-Agent` header.

pub mod buffer_pool;
pub mod config;
pub mod dialer;
pub mod directive;
pub mod error;
pub mod forward;
pub mod rules;
pub mod server;
pub mod tunnel;

pub use buffer_pool::BufferPool;
pub use config::ProxyConfig;
pub use dialer::Dialer;
pub use error::ProxyError;
pub use rules::RuleTable;
pub use server::Server;
