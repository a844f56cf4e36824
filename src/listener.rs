use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::{ListenerConfig, Protocol};
use crate::engine::{Engine, ListenerScope};
use crate::transport::tls;

const UDP_RECV_BUF: usize = 4096;
const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;
const TCP_BACKLOG: i32 = 1024;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
// responses queued per stream connection before readers back off
const TCP_PIPELINE_DEPTH: usize = 64;

enum Sockets {
    Udp(Vec<Arc<UdpSocket>>),
    Tcp(TcpListener),
    Tls(TcpListener, TlsAcceptor),
}

/// A listener whose sockets are bound but not yet serving.
pub struct BoundListener {
    scope: ListenerScope,
    local_addr: SocketAddr,
    sockets: Sockets,
}

impl BoundListener {
    /// Binds the sockets for `cfg`. UDP listeners get `udp_workers` sockets
    /// sharing one port through SO_REUSEPORT where available.
    pub fn bind(cfg: &ListenerConfig, udp_workers: usize) -> anyhow::Result<Self> {
        let (addr, device) = cfg.endpoint()?;
        let device = device.as_deref();
        let (local_addr, sockets) = match cfg.protocol {
            Protocol::Udp => {
                let (local, sockets) = bind_udp_workers(addr, device, udp_workers.max(1))?;
                (local, Sockets::Udp(sockets))
            }
            Protocol::Tcp => {
                let listener = bind_tcp(addr, device)?;
                (listener.local_addr()?, Sockets::Tcp(listener))
            }
            Protocol::Tls => {
                let config = match (&cfg.tls_cert, &cfg.tls_key) {
                    (Some(cert), Some(key)) => tls::server_config_from_pem(cert, key)?,
                    (None, None) => tls::self_signed_server_config()?,
                    _ => anyhow::bail!("listener {}: tls_cert and tls_key must be set together", cfg.bind),
                };
                let listener = bind_tcp(addr, device)?;
                (
                    listener.local_addr()?,
                    Sockets::Tls(listener, TlsAcceptor::from(Arc::new(config))),
                )
            }
        };

        let scope = ListenerScope {
            label: Arc::from(format!("{}://{}", cfg.protocol.as_str(), local_addr)),
            group: Arc::from(cfg.group_name()),
            cache_enabled: !cfg.no_cache,
            datagram: cfg.protocol == Protocol::Udp,
        };
        info!(
            listener = %scope.label,
            group = %scope.group,
            device = device.unwrap_or("-"),
            cache = scope.cache_enabled,
            "listener bound"
        );
        Ok(Self {
            scope,
            local_addr,
            sockets,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self, engine: Engine) -> Vec<JoinHandle<()>> {
        let scope = Arc::new(self.scope);
        match self.sockets {
            Sockets::Udp(sockets) => sockets
                .into_iter()
                .map(|socket| tokio::spawn(run_udp_worker(socket, engine.clone(), scope.clone())))
                .collect(),
            Sockets::Tcp(listener) => vec![tokio::spawn(run_stream_acceptor(listener, None, engine, scope))],
            Sockets::Tls(listener, acceptor) => {
                vec![tokio::spawn(run_stream_acceptor(listener, Some(acceptor), engine, scope))]
            }
        }
    }
}

/// 高性能 UDP worker：缓存命中在接收循环内直接应答，其余请求 spawn 处理
async fn run_udp_worker(socket: Arc<UdpSocket>, engine: Engine, scope: Arc<ListenerScope>) {
    let mut buf = BytesMut::with_capacity(UDP_RECV_BUF);
    loop {
        buf.resize(UDP_RECV_BUF, 0);
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(listener = %scope.label, error = %err, "udp recv failed");
                continue;
            }
        };
        buf.truncate(len);
        let packet = buf.split().freeze();

        match engine.handle_packet_fast(&packet, peer, &scope) {
            Ok(Some(resp)) => {
                let _ = socket.send_to(&resp, peer).await;
            }
            Ok(None) => {
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                let scope = Arc::clone(&scope);
                tokio::spawn(async move {
                    match engine.handle_packet(&packet, peer, &scope).await {
                        Ok(resp) => {
                            let _ = socket.send_to(&resp, peer).await;
                        }
                        // nothing to answer without a readable header
                        Err(err) => debug!(client_ip = %peer.ip(), error = %err, "dropping packet"),
                    }
                });
            }
            Err(err) => debug!(client_ip = %peer.ip(), error = %err, "fast path failed"),
        }
    }
}

async fn run_stream_acceptor(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    engine: Engine,
    scope: Arc<ListenerScope>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!(listener = %scope.label, error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let engine = engine.clone();
        let scope = scope.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let res = match tls {
                Some(acceptor) => match timeout(TCP_IDLE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => serve_stream(stream, peer, engine, scope.clone()).await,
                    Ok(Err(err)) => Err(anyhow::Error::from(err).context("tls accept")),
                    Err(_) => Err(anyhow!("tls accept timed out")),
                },
                None => serve_stream(stream, peer, engine, scope.clone()).await,
            };
            if let Err(err) = res {
                debug!(client_ip = %peer.ip(), listener = %scope.label, error = %err, "stream connection closed");
            }
        });
    }
}

/// Length-prefixed DNS over a byte stream. Queries on one connection are
/// resolved concurrently and answered in completion order.
async fn serve_stream<S>(stream: S, peer: SocketAddr, engine: Engine, scope: Arc<ListenerScope>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Bytes>(TCP_PIPELINE_DEPTH);

    let write_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let Ok(len) = u16::try_from(resp.len()) else {
                continue;
            };
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(&resp).await?;
        }
        writer.shutdown().await?;
        Ok::<(), io::Error>(())
    });

    let read_result = read_frames(reader, peer, &engine, &scope, &tx).await;

    // the writer drains what in-flight queries still produce
    drop(tx);
    match write_task.await {
        Ok(Ok(())) => read_result,
        Ok(Err(err)) => read_result.and(Err(err.into())),
        Err(err) => read_result.and(Err(err.into())),
    }
}

async fn read_frames<R>(
    mut reader: R,
    peer: SocketAddr,
    engine: &Engine,
    scope: &Arc<ListenerScope>,
    tx: &mpsc::Sender<Bytes>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    loop {
        match timeout(TCP_IDLE_TIMEOUT, reader.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Ok(()),
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; frame_len];
        timeout(TCP_IDLE_TIMEOUT, reader.read_exact(&mut buf))
            .await
            .map_err(|_| anyhow!("frame read timed out"))??;

        let engine = engine.clone();
        let scope = scope.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match engine.handle_packet(&buf, peer, &scope).await {
                Ok(resp) => {
                    let _ = tx.send(resp).await;
                }
                Err(err) => debug!(client_ip = %peer.ip(), error = %err, "dropping frame"),
            }
        });
    }
}

fn bind_udp_workers(
    addr: SocketAddr,
    device: Option<&str>,
    workers: usize,
) -> anyhow::Result<(SocketAddr, Vec<Arc<UdpSocket>>)> {
    let first = Arc::new(bind_udp(addr, device)?);
    // port 0 is resolved by the first bind; the other workers join that port
    let local = first.local_addr()?;
    let mut sockets = vec![first.clone()];
    for worker_id in 1..workers {
        match bind_udp(local, device) {
            Ok(socket) => sockets.push(Arc::new(socket)),
            Err(err) => {
                debug!(worker_id, error = %err, "reuseport bind failed, sharing first socket");
                sockets.push(first.clone());
            }
        }
    }
    Ok((local, sockets))
}

fn bind_udp(addr: SocketAddr, device: Option<&str>) -> anyhow::Result<UdpSocket> {
    let socket = new_socket(addr, Type::DGRAM, SockProtocol::UDP, device)?;
    set_reuse_port(&socket);
    let _ = socket.set_recv_buffer_size(SOCKET_BUF_SIZE);
    let _ = socket.set_send_buffer_size(SOCKET_BUF_SIZE);
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register udp socket")
}

fn bind_tcp(addr: SocketAddr, device: Option<&str>) -> anyhow::Result<TcpListener> {
    let socket = new_socket(addr, Type::STREAM, SockProtocol::TCP, device)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind tcp {addr}"))?;
    socket.listen(TCP_BACKLOG).context("listen")?;
    TcpListener::from_std(socket.into()).context("register tcp listener")
}

fn new_socket(addr: SocketAddr, ty: Type, proto: SockProtocol, device: Option<&str>) -> anyhow::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, ty, Some(proto)).context("create socket")?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        // [::] 同时接收 IPv4 映射地址
        let _ = socket.set_only_v6(false);
    }
    if let Some(device) = device {
        bind_device(&socket, device)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &Socket, device: &str) -> anyhow::Result<()> {
    socket
        .bind_device(Some(device.as_bytes()))
        .with_context(|| format!("bind to device {device}"))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_socket: &Socket, device: &str) -> anyhow::Result<()> {
    anyhow::bail!("binding to device {device} is not supported on this platform")
}

// SO_REUSEPORT lets the kernel spread datagrams over the worker sockets
#[cfg(unix)]
fn set_reuse_port(socket: &Socket) {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use std::os::unix::io::AsRawFd;

    let val: c_int = 1;
    // SAFETY: the fd is owned by `socket` and `val` outlives the call.
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        debug!(error = %io::Error::last_os_error(), "SO_REUSEPORT unavailable");
    }
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &Socket) {}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use hickory_proto::op::{Message, ResponseCode};
    use hickory_proto::rr::RecordType;
    use serde_json::json;
    use tokio::net::TcpStream;

    use super::*;
    use crate::codec::test_support::{a_record, client_query_bytes, decode_response, first_a};
    use crate::codec::{Answer, ClientQuery};
    use crate::config::Config;
    use crate::registry::{GroupRegistry, UpstreamSpec};
    use crate::rules::AddressRules;
    use crate::transport::Transports;
    use crate::transport::test_support::{Handler, MockUpstream, table};

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).expect("config")
    }

    fn engine_for(cfg: &Config) -> Engine {
        let registry = GroupRegistry::from_config(cfg).expect("registry");
        let rules = AddressRules::from_config(&cfg.address).expect("rules");
        let transport = Arc::new(Transports::new(&cfg.settings).expect("transports"));
        Engine::new(cfg.settings.clone(), registry, rules, transport)
    }

    /// Binds and spawns every listener of `cfg`, in order.
    fn serve(cfg: &Config, engine: &Engine) -> Vec<SocketAddr> {
        cfg.listeners
            .iter()
            .map(|l| {
                let bound = BoundListener::bind(l, 2).expect("bind listener");
                let addr = bound.local_addr();
                bound.spawn(engine.clone());
                addr
            })
            .collect()
    }

    async fn udp_ask(addr: SocketAddr, packet: &[u8]) -> Message {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(packet, addr).await.unwrap();
        let mut buf = vec![0u8; 65535];
        let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
            .await
            .expect("udp reply in time")
            .unwrap();
        decode_response(&buf[..len])
    }

    async fn stream_ask<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, packet: &[u8]) -> Message {
        stream.write_all(&(packet.len() as u16).to_be_bytes()).await.unwrap();
        stream.write_all(packet).await.unwrap();
        let mut len_buf = [0u8; 2];
        timeout(Duration::from_secs(3), stream.read_exact(&mut len_buf))
            .await
            .expect("stream reply in time")
            .unwrap();
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await.unwrap();
        decode_response(&buf)
    }

    async fn tcp_ask(addr: SocketAddr, packet: &[u8]) -> Message {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream_ask(&mut stream, packet).await
    }

    async fn tls_ask(addr: SocketAddr, packet: &[u8]) -> Message {
        let dialer = tls::TlsDialer::new().unwrap();
        let mut spec = UpstreamSpec::new("test", Protocol::Tls, addr);
        spec.skip_cert_verify = true;
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut stream = dialer.handshake(&spec, tcp).await.expect("handshake");
        stream_ask(&mut stream, packet).await
    }

    fn a_com() -> Handler {
        table(&[("a.com", Ipv4Addr::new(1, 2, 3, 4), 611)])
    }

    #[tokio::test]
    async fn udp_tcp_and_tls_listeners_serve_the_same_records() {
        let up = MockUpstream::udp(a_com(), Duration::ZERO).await;
        let cfg = config(json!({
            "listeners": [
                { "bind": "127.0.0.1:0", "protocol": "udp" },
                { "bind": "127.0.0.1:0", "protocol": "tcp" },
                { "bind": "127.0.0.1:0", "protocol": "tls" }
            ],
            "upstreams": [ { "addr": up.addr.to_string() } ]
        }));
        let engine = engine_for(&cfg);
        let addrs = serve(&cfg, &engine);
        let query = client_query_bytes(42, "a.com", RecordType::A);

        let over_udp = udp_ask(addrs[0], &query).await;
        let over_tcp = tcp_ask(addrs[1], &query).await;
        let over_tls = tls_ask(addrs[2], &query).await;
        for msg in [&over_udp, &over_tcp, &over_tls] {
            assert_eq!(msg.id(), 42);
            assert_eq!(first_a(msg).map(|(ip, _)| ip), Some(Ipv4Addr::new(1, 2, 3, 4)));
        }
        // the two later listeners share the default group's cache
        assert_eq!(up.hits(), 1);
    }

    #[tokio::test]
    async fn group_can_forward_to_own_listener_of_another_group() {
        let up = MockUpstream::udp(a_com(), Duration::ZERO).await;
        let inner = ListenerConfig {
            bind: "127.0.0.1:0".into(),
            protocol: Protocol::Tcp,
            group: Some("upstream".into()),
            device: None,
            no_cache: false,
            tls_cert: None,
            tls_key: None,
        };
        // bind first so the outer group can point at its port
        let inner_bound = BoundListener::bind(&inner, 1).unwrap();
        let inner_addr = inner_bound.local_addr();

        let cfg = config(json!({
            "listeners": [
                { "bind": "127.0.0.1:0", "group": "self" },
                { "bind": "127.0.0.1:0", "protocol": "tcp", "group": "upstream" }
            ],
            "upstreams": [
                { "addr": inner_addr.to_string(), "transport": "tcp", "group": "self" },
                { "addr": up.addr.to_string(), "group": "upstream" }
            ]
        }));
        let engine = engine_for(&cfg);
        inner_bound.spawn(engine.clone());
        let outer = BoundListener::bind(&cfg.listeners[0], 1).unwrap();
        let outer_addr = outer.local_addr();
        outer.spawn(engine.clone());

        let query = client_query_bytes(1, "a.com", RecordType::A);
        let msg = udp_ask(outer_addr, &query).await;
        assert_eq!(first_a(&msg).map(|(ip, _)| ip), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(up.hits(), 1);

        // both groups now hold the answer
        udp_ask(outer_addr, &query).await;
        let direct = tcp_ask(inner_addr, &query).await;
        assert_eq!(first_a(&direct).map(|(ip, _)| ip), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(up.hits(), 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn listener_bound_to_loopback_device() {
        let up = MockUpstream::udp(a_com(), Duration::ZERO).await;
        let cfg = config(json!({
            "listeners": [ { "bind": "127.0.0.1:0@lo" } ],
            "upstreams": [ { "addr": up.addr.to_string() } ]
        }));
        let bound = match BoundListener::bind(&cfg.listeners[0], 1) {
            Ok(bound) => bound,
            Err(err)
                if err
                    .chain()
                    .filter_map(|e| e.downcast_ref::<io::Error>())
                    .any(|e| e.kind() == io::ErrorKind::PermissionDenied) =>
            {
                eprintln!("skipping: SO_BINDTODEVICE not permitted here");
                return;
            }
            Err(err) => panic!("bind failed: {err:#}"),
        };
        let addr = bound.local_addr();
        bound.spawn(engine_for(&cfg));

        let msg = udp_ask(addr, &client_query_bytes(3, "a.com", RecordType::A)).await;
        assert_eq!(first_a(&msg).map(|(ip, _)| ip), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[tokio::test]
    async fn unknown_device_fails_at_bind() {
        let cfg = config(json!({
            "listeners": [ { "bind": "127.0.0.1:0", "device": "kixfwd-no-such-dev0" } ],
            "upstreams": [ { "addr": "127.0.0.1" } ]
        }));
        assert!(BoundListener::bind(&cfg.listeners[0], 1).is_err());
    }

    #[tokio::test]
    async fn no_cache_listener_bypasses_shared_cache() {
        let up = MockUpstream::udp(a_com(), Duration::ZERO).await;
        let cfg = config(json!({
            "listeners": [
                { "bind": "127.0.0.1:0", "no_cache": true },
                { "bind": "127.0.0.1:0" }
            ],
            "upstreams": [ { "addr": up.addr.to_string() } ]
        }));
        let engine = engine_for(&cfg);
        let addrs = serve(&cfg, &engine);
        let query = client_query_bytes(9, "a.com", RecordType::A);

        udp_ask(addrs[0], &query).await;
        udp_ask(addrs[0], &query).await;
        assert_eq!(up.hits(), 2);
        udp_ask(addrs[1], &query).await;
        assert_eq!(up.hits(), 3);
        udp_ask(addrs[1], &query).await;
        assert_eq!(up.hits(), 3);
    }

    #[tokio::test]
    async fn oversized_udp_answer_is_truncated_but_complete_over_tcp() {
        let many: Handler = Arc::new(|q: &ClientQuery| {
            let mut answer = Answer::empty(ResponseCode::NoError);
            for i in 0..40u8 {
                answer.answers.push(a_record(&q.qname, 300, Ipv4Addr::new(10, 0, 0, i)));
            }
            Some(answer)
        });
        let up = MockUpstream::tcp(many, Duration::ZERO).await;
        let cfg = config(json!({
            "listeners": [
                { "bind": "127.0.0.1:0" },
                { "bind": "127.0.0.1:0", "protocol": "tcp" }
            ],
            "upstreams": [ { "addr": up.addr.to_string(), "transport": "tcp" } ]
        }));
        let engine = engine_for(&cfg);
        let addrs = serve(&cfg, &engine);
        let query = client_query_bytes(5, "big.example", RecordType::A);

        let over_udp = udp_ask(addrs[0], &query).await;
        assert!(over_udp.truncated());
        assert!(over_udp.answers().is_empty());
        let over_tcp = tcp_ask(addrs[1], &query).await;
        assert!(!over_tcp.truncated());
        assert_eq!(over_tcp.answers().len(), 40);
    }

    #[tokio::test]
    async fn pipelined_stream_queries_are_all_answered() {
        let up = MockUpstream::udp(
            table(&[
                ("a.com", Ipv4Addr::new(1, 1, 1, 1), 300),
                ("b.com", Ipv4Addr::new(2, 2, 2, 2), 300),
            ]),
            Duration::from_millis(20),
        )
        .await;
        let cfg = config(json!({
            "listeners": [ { "bind": "127.0.0.1:0", "protocol": "tcp" } ],
            "upstreams": [ { "addr": up.addr.to_string() } ]
        }));
        let engine = engine_for(&cfg);
        let addrs = serve(&cfg, &engine);

        let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
        for (id, name) in [(1u16, "a.com"), (2, "b.com")] {
            let packet = client_query_bytes(id, name, RecordType::A);
            stream.write_all(&(packet.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&packet).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut len_buf = [0u8; 2];
            timeout(Duration::from_secs(3), stream.read_exact(&mut len_buf))
                .await
                .expect("reply in time")
                .unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let msg = decode_response(&buf);
            seen.push((msg.id(), first_a(&msg).map(|(ip, _)| ip)));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (1, Some(Ipv4Addr::new(1, 1, 1, 1))),
                (2, Some(Ipv4Addr::new(2, 2, 2, 2)))
            ]
        );
    }

    #[tokio::test]
    async fn garbage_datagram_with_header_gets_formerr() {
        let cfg = config(json!({
            "listeners": [ { "bind": "127.0.0.1:0" } ],
            "upstreams": [ { "addr": "127.0.0.1" } ]
        }));
        let engine = engine_for(&cfg);
        let addrs = serve(&cfg, &engine);
        let msg = udp_ask(addrs[0], &[0x12, 0x34, 0xff, 0xff, 0x00]).await;
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.response_code(), ResponseCode::FormErr);
    }
}
