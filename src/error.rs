use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single upstream exchange. Always recoverable: the engine
/// moves on to the next upstream of the group.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("upstream {upstream} timed out after {}ms", .after.as_millis())]
    Timeout { upstream: SocketAddr, after: Duration },
    #[error("connection to {upstream} refused: {reason}")]
    ConnectionRefused { upstream: SocketAddr, reason: String },
    #[error("tls handshake with {upstream} failed: {reason}")]
    TlsHandshake { upstream: SocketAddr, reason: String },
    #[error("malformed response from {upstream}: {reason}")]
    Protocol { upstream: SocketAddr, reason: String },
    #[error("io error talking to {upstream}: {reason}")]
    Io { upstream: SocketAddr, reason: String },
}

impl TransportError {
    pub fn io(upstream: SocketAddr, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                Self::ConnectionRefused {
                    upstream,
                    reason: err.to_string(),
                }
            }
            io::ErrorKind::TimedOut => Self::Timeout {
                upstream,
                after: Duration::ZERO,
            },
            _ => Self::Io {
                upstream,
                reason: err.to_string(),
            },
        }
    }

    pub fn protocol(upstream: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Protocol {
            upstream,
            reason: reason.into(),
        }
    }
}

/// Outcome of a resolution that could not produce any answer.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("all {attempted} upstream(s) of group {group} failed")]
    UpstreamUnavailable {
        group: String,
        attempted: usize,
        last: Option<TransportError>,
    },
    #[error("query for {qname} exceeded {}ms budget", .after.as_millis())]
    Timeout { qname: String, after: Duration },
    #[error("cannot encode upstream query: {0}")]
    Encode(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Startup-time misconfiguration. Never produced while serving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("group {0} has no upstream servers")]
    EmptyGroup(String),
    #[error("invalid address {value}: {reason}")]
    InvalidAddress { value: String, reason: String },
    #[error("invalid address rule for {domain}: {reason}")]
    InvalidRule { domain: String, reason: String },
    #[error("no listeners configured")]
    NoListeners,
}
