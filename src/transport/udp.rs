use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;

use crate::error::TransportError;

type Waiter = oneshot::Sender<Result<Bytes, TransportError>>;
type InflightMap = DashMap<u16, (u16, SocketAddr, Waiter)>;

struct UdpSocketState {
    socket: Arc<UdpSocket>,
    // Key: id on the wire / 线上事务 ID
    // Value: (original id, upstream address, sender) / 值：(原始 ID, 上游地址, 发送端)
    inflight: Arc<InflightMap>,
    next_id: AtomicU16,
}

/// UDP 上游客户端池：每个 socket 一个接收任务，按事务 ID 分发应答。
/// IPv6 上游走一次性 socket。
pub struct UdpClient {
    pool: Vec<UdpSocketState>,
    next_idx: AtomicUsize,
}

impl UdpClient {
    pub fn new(size: usize) -> anyhow::Result<Self> {
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            let std_sock = new_socket(Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
            let socket = Arc::new(UdpSocket::from_std(std_sock).context("udp from_std")?);
            let inflight = Arc::new(DashMap::new());
            pool.push(UdpSocketState {
                socket: socket.clone(),
                inflight: inflight.clone(),
                next_id: AtomicU16::new(0),
            });
            tokio::spawn(recv_loop(socket, inflight));
        }
        Ok(Self {
            pool,
            next_idx: AtomicUsize::new(0),
        })
    }

    pub async fn send(
        &self,
        packet: &[u8],
        upstream: SocketAddr,
        timeout_dur: Duration,
    ) -> Result<Bytes, TransportError> {
        if packet.len() < 2 {
            return Err(TransportError::protocol(upstream, "packet too short"));
        }
        if self.pool.is_empty() || upstream.is_ipv6() {
            return self.send_oneshot(packet, upstream, timeout_dur).await;
        }

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let state = &self.pool[idx];
        let original_id = u16::from_be_bytes([packet[0], packet[1]]);

        let (tx, rx) = oneshot::channel();
        let mut attempts = 0;
        let new_id = loop {
            let cand = state.next_id.fetch_add(1, Ordering::Relaxed);
            // entry() 保证 ID 占位是原子的
            if let Entry::Vacant(slot) = state.inflight.entry(cand) {
                slot.insert((original_id, upstream, tx));
                break cand;
            }
            attempts += 1;
            if attempts > 100 {
                warn!("udp pool exhausted: socket_idx={} inflight_count={}", idx, state.inflight.len());
                return Err(TransportError::Io {
                    upstream,
                    reason: "udp pool exhausted (too many inflight requests)".into(),
                });
            }
        };

        // 调用方被取消（并行竞速落败）时也要释放 ID
        let mut slot = SlotGuard {
            inflight: &state.inflight,
            id: new_id,
            armed: true,
        };

        let mut new_packet = packet.to_vec();
        new_packet[0..2].copy_from_slice(&new_id.to_be_bytes());

        if let Err(e) = state.socket.send_to(&new_packet, upstream).await {
            return Err(TransportError::io(upstream, &e));
        }

        match timeout(timeout_dur, rx).await {
            Ok(Ok(res)) => {
                // recv_loop already took the entry; the id may be reused by now
                slot.armed = false;
                res
            }
            Ok(Err(_)) => Err(TransportError::Io {
                upstream,
                reason: "udp waiter dropped".into(),
            }),
            Err(_) => Err(TransportError::Timeout {
                upstream,
                after: timeout_dur,
            }),
        }
    }

    /// Fresh connected socket for a single exchange.
    async fn send_oneshot(
        &self,
        packet: &[u8],
        upstream: SocketAddr,
        timeout_dur: Duration,
    ) -> Result<Bytes, TransportError> {
        let io_err = |e: std::io::Error| TransportError::io(upstream, &e);
        let (domain, local) = if upstream.is_ipv6() {
            (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))
        } else {
            (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        };
        let std_sock = new_socket(domain, local).map_err(|e| TransportError::Io {
            upstream,
            reason: e.to_string(),
        })?;
        let sock = UdpSocket::from_std(std_sock).map_err(io_err)?;
        sock.connect(upstream).await.map_err(io_err)?;
        sock.send(packet).await.map_err(io_err)?;

        let mut buf = [0u8; 4096];
        let recv_res = timeout(timeout_dur, async {
            loop {
                let size = sock.recv(&mut buf).await?;
                // connected socket: only the upstream can reach us, match the id anyway
                if size >= 2 && buf[0] == packet[0] && buf[1] == packet[1] {
                    return Ok::<_, std::io::Error>(Bytes::copy_from_slice(&buf[..size]));
                }
            }
        })
        .await;

        match recv_res {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(io_err(err)),
            Err(_) => Err(TransportError::Timeout {
                upstream,
                after: timeout_dur,
            }),
        }
    }
}

/// Releases a reserved wire id unless the reply consumed it.
struct SlotGuard<'a> {
    inflight: &'a InflightMap,
    id: u16,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(&self.id);
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, inflight: Arc<InflightMap>) {
    let mut buf = [0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                if len < 2 {
                    continue;
                }
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                // 来源地址不符的包直接丢弃，不影响真正的等待者
                let Entry::Occupied(slot) = inflight.entry(id) else {
                    continue;
                };
                if slot.get().1 != src {
                    continue;
                }
                let (_, (original_id, _, tx)) = slot.remove_entry();
                let mut resp = buf[..len].to_vec();
                resp[0..2].copy_from_slice(&original_id.to_be_bytes());
                let _ = tx.send(Ok(Bytes::from(resp)));
            }
            Err(e) => {
                tracing::error!("UDP pool recv error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn new_socket(domain: Domain, local: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    // 4MB buffers to prevent packet loss under load
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    Ok(socket.into())
}
