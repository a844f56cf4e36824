mod tcp;
pub mod tls;
mod udp;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::codec;
use crate::config::{GlobalSettings, Protocol};
use crate::error::TransportError;
use crate::registry::UpstreamSpec;

pub use tcp::TcpMultiplexer;
pub use udp::UdpClient;

/// One request/response exchange with an upstream.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(
        &self,
        spec: &UpstreamSpec,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;
}

/// Production transport: picks UDP, TCP or TLS by `spec.kind`.
pub struct Transports {
    udp: UdpClient,
    tcp: TcpMultiplexer,
    tls: TcpMultiplexer,
}

impl Transports {
    pub fn new(settings: &GlobalSettings) -> anyhow::Result<Self> {
        Ok(Self {
            udp: UdpClient::new(settings.udp_pool_size)?,
            tcp: TcpMultiplexer::new(settings.tcp_pool_size, tcp::Dialer::Tcp),
            tls: TcpMultiplexer::new(settings.tcp_pool_size, tcp::Dialer::Tls(tls::TlsDialer::new()?)),
        })
    }

    /// UDP with a hedged second attempt inside the same budget; truncated
    /// answers are retried over TCP.
    async fn forward_udp_smart(
        &self,
        spec: &UpstreamSpec,
        query: &[u8],
        timeout_dur: Duration,
    ) -> Result<Bytes, TransportError> {
        let start = Instant::now();
        let hedge = timeout_dur / 2;
        let mut last_err = None;

        for attempt in 1..=2u32 {
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            let budget = if attempt == 1 { hedge } else { remaining };
            if budget.is_zero() {
                break;
            }
            match self.udp.send(query, spec.addr, budget).await {
                Ok(bytes) if codec::is_truncated(&bytes) => {
                    debug!(event = "udp_forward_fallback_tcp", upstream = %spec.addr, "truncated, retrying over tcp");
                    let remaining = timeout_dur.saturating_sub(start.elapsed());
                    return self.tcp.send(spec, query, remaining.max(hedge)).await;
                }
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        event = "udp_forward_retry",
                        upstream = %spec.addr,
                        attempt,
                        timeout_ms = budget.as_millis() as u64,
                        error = %err,
                        "udp forward attempt failed",
                    );
                    // a refused port will not start answering within the budget
                    if matches!(err, TransportError::ConnectionRefused { .. }) {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(TransportError::Timeout {
            upstream: spec.addr,
            after: timeout_dur,
        }))
    }
}

#[async_trait]
impl UpstreamTransport for Transports {
    async fn send(
        &self,
        spec: &UpstreamSpec,
        query: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        match spec.kind {
            Protocol::Udp => self.forward_udp_smart(spec, query, timeout).await,
            Protocol::Tcp => self.tcp.send(spec, query, timeout).await,
            Protocol::Tls => self.tls.send(spec, query, timeout).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use hickory_proto::rr::RecordType;

    use super::test_support::*;
    use super::*;
    use crate::codec::test_support::{client_query, first_a};

    fn transports() -> Transports {
        Transports::new(&GlobalSettings {
            udp_pool_size: 2,
            tcp_pool_size: 1,
            ..Default::default()
        })
        .expect("transports")
    }

    fn spec(kind: Protocol, addr: std::net::SocketAddr) -> UpstreamSpec {
        let mut spec = UpstreamSpec::new("default", kind, addr);
        spec.skip_cert_verify = true;
        spec
    }

    #[tokio::test]
    async fn same_answer_over_every_transport() {
        let handler = table(&[("a.com", Ipv4Addr::new(1, 2, 3, 4), 611)]);
        let udp = MockUpstream::udp(handler.clone(), Duration::ZERO).await;
        let tcp = MockUpstream::tcp(handler.clone(), Duration::ZERO).await;
        let tls = MockUpstream::tls(handler, Duration::ZERO).await;
        let t = transports();
        let q = client_query("a.com", RecordType::A);
        let wire = codec::build_upstream_query(&q.query).unwrap();

        for (kind, addr) in [(Protocol::Udp, udp.addr), (Protocol::Tcp, tcp.addr), (Protocol::Tls, tls.addr)] {
            let raw = t
                .send(&spec(kind, addr), &wire, Duration::from_secs(2))
                .await
                .unwrap_or_else(|e| panic!("{kind:?} failed: {e}"));
            let msg = decode(&raw);
            assert_eq!(first_a(&msg), Some((Ipv4Addr::new(1, 2, 3, 4), 611)), "{kind:?}");
        }
        assert_eq!(udp.hits(), 1);
        assert_eq!(tcp.hits(), 1);
        assert_eq!(tls.hits(), 1);
    }

    #[tokio::test]
    async fn tls_with_verification_rejects_self_signed_upstream() {
        let tls = MockUpstream::tls(table(&[]), Duration::ZERO).await;
        let t = transports();
        let q = client_query("a.com", RecordType::A);
        let wire = codec::build_upstream_query(&q.query).unwrap();
        let mut strict = spec(Protocol::Tls, tls.addr);
        strict.skip_cert_verify = false;

        let err = t.send(&strict, &wire, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::TlsHandshake { .. }), "{err}");
    }

    #[tokio::test]
    async fn silent_udp_upstream_times_out_within_budget() {
        let silent: Handler = Arc::new(|_| None);
        let up = MockUpstream::udp(silent, Duration::ZERO).await;
        let t = transports();
        let q = client_query("a.com", RecordType::A);
        let wire = codec::build_upstream_query(&q.query).unwrap();

        let start = Instant::now();
        let err = t
            .send(&spec(Protocol::Udp, up.addr), &wire, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_millis(600));
        // hedged retry sends twice
        assert_eq!(up.hits(), 2);
    }

    #[tokio::test]
    async fn tcp_to_closed_port_is_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let t = transports();
        let q = client_query("a.com", RecordType::A);
        let wire = codec::build_upstream_query(&q.query).unwrap();
        let err = t
            .send(&spec(Protocol::Tcp, addr), &wire, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }), "{err}");
    }
}
