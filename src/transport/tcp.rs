use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::error::TransportError;
use crate::registry::UpstreamSpec;
use crate::transport::tls::TlsDialer;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// How a fresh upstream connection is established.
pub enum Dialer {
    Tcp,
    Tls(TlsDialer),
}

impl Dialer {
    async fn connect(&self, spec: &UpstreamSpec) -> Result<BoxedStream, TransportError> {
        let stream = TcpStream::connect(spec.addr)
            .await
            .map_err(|e| TransportError::io(spec.addr, &e))?;
        let _ = stream.set_nodelay(true);
        match self {
            Dialer::Tcp => Ok(Box::new(stream)),
            Dialer::Tls(tls) => {
                let stream = tls.handshake(spec, stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    addr: SocketAddr,
    tls_name: Option<Arc<str>>,
    skip_cert_verify: bool,
}

impl From<&UpstreamSpec> for PoolKey {
    fn from(spec: &UpstreamSpec) -> Self {
        Self {
            addr: spec.addr,
            tls_name: spec.tls_name.clone(),
            skip_cert_verify: spec.skip_cert_verify,
        }
    }
}

/// 流式连接复用器（TCP 或 TLS），每个上游维护固定数量的长连接。
pub struct TcpMultiplexer {
    pools: DashMap<PoolKey, Arc<TcpConnectionPool>>,
    pool_size: usize,
    dialer: Arc<Dialer>,
}

struct TcpConnectionPool {
    clients: Vec<Arc<TcpMuxClient>>,
    next_idx: AtomicUsize,
}

impl TcpMultiplexer {
    pub fn new(pool_size: usize, dialer: Dialer) -> Self {
        Self {
            pools: DashMap::new(),
            pool_size,
            dialer: Arc::new(dialer),
        }
    }

    pub async fn send(
        &self,
        spec: &UpstreamSpec,
        packet: &[u8],
        timeout_dur: Duration,
    ) -> Result<Bytes, TransportError> {
        let pool = self
            .pools
            .entry(PoolKey::from(spec))
            .or_insert_with(|| {
                let size = self.pool_size.max(1);
                let clients = (0..size)
                    .map(|_| Arc::new(TcpMuxClient::new(spec.clone(), self.dialer.clone())))
                    .collect();
                Arc::new(TcpConnectionPool {
                    clients,
                    next_idx: AtomicUsize::new(0),
                })
            })
            .clone();

        let idx = pool.next_idx.fetch_add(1, Ordering::Relaxed) % pool.clients.len();
        pool.clients[idx].send(packet, timeout_dur).await
    }
}

// 每个连接一个写任务，帧整体入队，调用方被取消也不会留下半帧
const WRITE_QUEUE: usize = 128;

type Frames = mpsc::Sender<Bytes>;
type Conn = Arc<Mutex<Option<(u64, Frames)>>>;
type PendingMap = Arc<DashMap<u16, Pending>>;

struct TcpMuxClient {
    spec: UpstreamSpec,
    dialer: Arc<Dialer>,
    // 当前连接的写队列，附带连接代数，旧连接退出时不会误关新连接
    conn: Conn,
    generation: AtomicU64,
    pending: PendingMap,
    next_id: AtomicU16,
    inflight_limit: Arc<Semaphore>,
}

struct Pending {
    original_id: u16,
    generation: u64,
    tx: oneshot::Sender<Result<Bytes, TransportError>>,
}

/// Drops the pending entry unless the reply consumed it.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u16,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(&self.id);
        }
    }
}

impl TcpMuxClient {
    fn new(spec: UpstreamSpec, dialer: Arc<Dialer>) -> Self {
        Self {
            spec,
            dialer,
            conn: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU16::new(1),
            inflight_limit: Arc::new(Semaphore::new(128)),
        }
    }

    async fn send(&self, packet: &[u8], timeout_dur: Duration) -> Result<Bytes, TransportError> {
        let upstream = self.spec.addr;
        let timed_out = || TransportError::Timeout {
            upstream,
            after: timeout_dur,
        };
        let start = Instant::now();
        if packet.len() < 2 {
            return Err(TransportError::protocol(upstream, "dns packet too short for tcp"));
        }

        // 1. Acquire an in-flight slot within the budget
        let _permit = timeout(timeout_dur, self.inflight_limit.acquire())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| TransportError::Io {
                upstream,
                reason: "tcp mux closed".into(),
            })?;

        // 2. Current connection, dialing if needed
        let remaining = timeout_dur.saturating_sub(start.elapsed());
        let (generation, frames) = timeout(remaining, self.connection())
            .await
            .map_err(|_| timed_out())??;

        let original_id = u16::from_be_bytes([packet[0], packet[1]]);
        let (tx, rx) = oneshot::channel();
        let new_id = self.reserve_id(Pending {
            original_id,
            generation,
            tx,
        })?;
        let mut slot = PendingGuard {
            pending: &self.pending,
            id: new_id,
            armed: true,
        };

        let mut out = BytesMut::with_capacity(2 + packet.len());
        out.put_u16(packet.len() as u16);
        out.put_u16(new_id);
        out.extend_from_slice(&packet[2..]);

        // 3. Queue the whole frame; mpsc send is cancel safe
        let remaining = timeout_dur.saturating_sub(start.elapsed());
        match timeout(remaining, frames.send(out.freeze())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(TransportError::Io {
                    upstream,
                    reason: "tcp writer closed".into(),
                });
            }
            Err(_) => return Err(timed_out()),
        }

        // 4. Wait for the reply routed by id
        let remaining = timeout_dur.saturating_sub(start.elapsed());
        match timeout(remaining, rx).await {
            Ok(Ok(r)) => {
                // reader or fail_generation already removed the entry
                slot.armed = false;
                r
            }
            Ok(Err(_canceled)) => Err(TransportError::Io {
                upstream,
                reason: "tcp response canceled".into(),
            }),
            Err(_elapsed) => Err(timed_out()),
        }
    }

    async fn connection(&self) -> Result<(u64, Frames), TransportError> {
        let mut guard = self.conn.lock().await;
        if let Some((generation, frames)) = guard.as_ref() {
            if !frames.is_closed() {
                return Ok((*generation, frames.clone()));
            }
        }
        let stream = self.dialer.connect(&self.spec).await?;
        let (reader, writer) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (frames, queue) = mpsc::channel(WRITE_QUEUE);
        self.spawn_writer(writer, queue, generation);
        self.spawn_reader(reader, generation);
        *guard = Some((generation, frames.clone()));
        debug!(target = "tcp_mux", upstream = %self.spec.addr, generation, "connected");
        Ok((generation, frames))
    }

    /// Picks an id not in use on this connection and parks the waiter under it.
    fn reserve_id(&self, pending: Pending) -> Result<u16, TransportError> {
        for _ in 0..=u16::MAX as usize {
            let cand = self.next_id.fetch_add(1, Ordering::Relaxed);
            match self.pending.entry(cand) {
                Entry::Vacant(slot) => {
                    slot.insert(pending);
                    return Ok(cand);
                }
                Entry::Occupied(_) => continue,
            }
        }
        Err(TransportError::Io {
            upstream: self.spec.addr,
            reason: "no available dns ids for tcp mux".into(),
        })
    }

    fn spawn_writer(&self, mut writer: WriteHalf<BoxedStream>, mut queue: mpsc::Receiver<Bytes>, generation: u64) {
        let pending = Arc::clone(&self.pending);
        let conn = Arc::clone(&self.conn);
        let upstream = self.spec.addr;
        tokio::spawn(async move {
            let reason = loop {
                let Some(frame) = queue.recv().await else {
                    // connection replaced or client gone
                    let _ = writer.shutdown().await;
                    return;
                };
                if let Err(err) = writer.write_all(&frame).await {
                    break err.to_string();
                }
                // batch whatever queued up meanwhile under one flush
                let mut failed = None;
                while let Ok(frame) = queue.try_recv() {
                    if let Err(err) = writer.write_all(&frame).await {
                        failed = Some(err);
                        break;
                    }
                }
                if let Some(err) = failed {
                    break err.to_string();
                }
                if let Err(err) = writer.flush().await {
                    break err.to_string();
                }
            };
            debug!(target = "tcp_mux", upstream = %upstream, error = %reason, "tcp write failed");
            close_generation(&conn, &pending, upstream, generation, &reason).await;
        });
    }

    fn spawn_reader(&self, mut reader: ReadHalf<BoxedStream>, generation: u64) {
        let pending = Arc::clone(&self.pending);
        let conn = Arc::clone(&self.conn);
        let upstream = self.spec.addr;
        tokio::spawn(async move {
            let reason = loop {
                let mut len_buf = [0u8; 2];
                if let Err(err) = reader.read_exact(&mut len_buf).await {
                    debug!(target = "tcp_mux", upstream = %upstream, error = %err, "tcp read len failed");
                    break err.to_string();
                }
                let resp_len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; resp_len];
                if let Err(err) = reader.read_exact(&mut buf).await {
                    debug!(target = "tcp_mux", upstream = %upstream, error = %err, "tcp read body failed");
                    break err.to_string();
                }
                if resp_len < 2 {
                    continue;
                }
                let resp_id = u16::from_be_bytes([buf[0], buf[1]]);
                if let Some((_, p)) = pending.remove_if(&resp_id, |_, p| p.generation == generation) {
                    buf[0..2].copy_from_slice(&p.original_id.to_be_bytes());
                    let _ = p.tx.send(Ok(Bytes::from(buf)));
                } else {
                    // late reply to an abandoned exchange
                    debug!(target = "tcp_mux", upstream = %upstream, resp_id, "response with unknown id");
                }
            };
            close_generation(&conn, &pending, upstream, generation, &reason).await;
        });
    }
}

async fn close_generation(conn: &Conn, pending: &PendingMap, upstream: SocketAddr, generation: u64, reason: &str) {
    {
        let mut guard = conn.lock().await;
        if guard.as_ref().is_some_and(|(g, _)| *g == generation) {
            *guard = None;
        }
    }
    fail_generation(pending, upstream, generation, reason);
}

/// Fails the exchanges sent on `generation`; newer connections keep theirs.
fn fail_generation(pending: &PendingMap, upstream: SocketAddr, generation: u64, reason: &str) {
    let keys: Vec<u16> = pending
        .iter()
        .filter(|item| item.generation == generation)
        .map(|item| *item.key())
        .collect();
    for key in keys {
        if let Some((_, p)) = pending.remove_if(&key, |_, p| p.generation == generation) {
            let _ = p.tx.send(Err(TransportError::Io {
                upstream,
                reason: format!("connection closed: {reason}"),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use tokio::net::TcpListener;

    /// Echo server that answers frames in reverse arrival order.
    async fn reversing_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut frames = Vec::new();
            for _ in 0..4 {
                let mut len = [0u8; 2];
                stream.read_exact(&mut len).await.unwrap();
                let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
                stream.read_exact(&mut body).await.unwrap();
                frames.push(body);
            }
            for body in frames.into_iter().rev() {
                stream.write_all(&(body.len() as u16).to_be_bytes()).await.unwrap();
                stream.write_all(&body).await.unwrap();
            }
            // keep the connection open until the client is done
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        addr
    }

    #[tokio::test]
    async fn replies_are_routed_by_id_on_a_shared_connection() {
        let addr = reversing_echo().await;
        let mux = TcpMultiplexer::new(1, Dialer::Tcp);
        let spec = UpstreamSpec::new("default", crate::config::Protocol::Tcp, addr);

        let sends = (0u8..4).map(|i| {
            let mux = &mux;
            let spec = &spec;
            async move {
                let packet = [0, 0, i, i, i];
                let resp = mux.send(spec, &packet, Duration::from_secs(2)).await.expect("reply");
                (i, resp)
            }
        });
        for (i, resp) in join_all(sends).await {
            assert_eq!(&resp[..], &[0, 0, i, i, i]);
        }
    }

    #[tokio::test]
    async fn reserve_id_skips_ids_in_use() {
        let spec = UpstreamSpec::new("default", crate::config::Protocol::Tcp, "127.0.0.1:9".parse().unwrap());
        let client = TcpMuxClient::new(spec, Arc::new(Dialer::Tcp));
        for id in 1u16..200u16 {
            let (tx, _rx) = oneshot::channel();
            client.pending.insert(
                id,
                Pending {
                    original_id: 0,
                    generation: 0,
                    tx,
                },
            );
        }
        let (tx, _rx) = oneshot::channel();
        let id = client
            .reserve_id(Pending {
                original_id: 7,
                generation: 0,
                tx,
            })
            .unwrap();
        assert_eq!(id, 200);
        assert_eq!(client.pending.get(&id).map(|p| p.original_id), Some(7));
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // first connection: read one frame and hang up
            let (mut s, _) = listener.accept().await.unwrap();
            let mut len = [0u8; 2];
            let _ = s.read_exact(&mut len).await;
            drop(s);
            // second connection: echo one frame
            let (mut s, _) = listener.accept().await.unwrap();
            s.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
            s.read_exact(&mut body).await.unwrap();
            s.write_all(&len).await.unwrap();
            s.write_all(&body).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mux = TcpMultiplexer::new(1, Dialer::Tcp);
        let spec = UpstreamSpec::new("default", crate::config::Protocol::Tcp, addr);
        let err = mux.send(&spec, &[0, 1, 2], Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }), "{err}");

        let resp = mux.send(&spec, &[0, 1, 3], Duration::from_secs(2)).await.expect("reconnected");
        assert_eq!(&resp[..], &[0, 1, 3]);
    }

    #[tokio::test]
    async fn abandoned_sends_leave_no_pending_and_keep_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            // answers only frames whose payload starts with 0xff
            loop {
                let mut len = [0u8; 2];
                if s.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
                if s.read_exact(&mut body).await.is_err() {
                    return;
                }
                if body.get(2) == Some(&0xff) {
                    s.write_all(&len).await.unwrap();
                    s.write_all(&body).await.unwrap();
                }
            }
        });

        let spec = UpstreamSpec::new("default", crate::config::Protocol::Tcp, addr);
        let client = TcpMuxClient::new(spec, Arc::new(Dialer::Tcp));
        for i in 0..50u8 {
            let res = timeout(Duration::from_millis(5), client.send(&[0, i, 1, 2], Duration::from_secs(5))).await;
            assert!(res.is_err(), "silent frame answered");
        }
        assert!(client.pending.is_empty());

        let resp = client
            .send(&[0x12, 0x34, 0xff, 1], Duration::from_secs(2))
            .await
            .expect("reply on the same connection");
        assert_eq!(&resp[..], &[0x12, 0x34, 0xff, 1]);
        assert_eq!(client.generation.load(Ordering::Relaxed), 1);
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn closing_a_connection_fails_only_its_own_generation() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let pending: PendingMap = Arc::new(DashMap::new());
        let (old_tx, old_rx) = oneshot::channel();
        let (new_tx, mut new_rx) = oneshot::channel();
        pending.insert(
            1,
            Pending {
                original_id: 10,
                generation: 1,
                tx: old_tx,
            },
        );
        pending.insert(
            2,
            Pending {
                original_id: 20,
                generation: 2,
                tx: new_tx,
            },
        );

        fail_generation(&pending, addr, 1, "eof");

        let old = old_rx.await.expect("failed, not dropped");
        assert!(matches!(old, Err(TransportError::Io { .. })));
        assert!(new_rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get(&2).map(|p| p.original_id), Some(20));
    }
}
