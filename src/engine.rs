use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::ResponseCode;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{CacheHit, QueryKey, RecordCache, TtlPolicy};
use crate::codec::{self, Answer, ClientQuery};
use crate::config::{DispatchPolicy, GlobalSettings};
use crate::error::{ResolveError, TransportError};
use crate::registry::{GroupRegistry, UpstreamSpec};
use crate::rules::AddressRules;
use crate::transport::UpstreamTransport;

const STATIC_SOURCE: &str = "address";

/// What a listener tells the engine about itself.
#[derive(Debug, Clone)]
pub struct ListenerScope {
    pub label: Arc<str>,
    pub group: Arc<str>,
    pub cache_enabled: bool,
    /// UDP replies are bounded by the client's advertised payload size.
    pub datagram: bool,
}

impl ListenerScope {
    fn reply_limit(&self, query: &ClientQuery) -> usize {
        if self.datagram {
            query.udp_limit()
        } else {
            codec::TCP_MAX_MESSAGE
        }
    }
}

/// A successful resolution. `answer` carries effective TTLs.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub answer: Answer,
    pub source: Arc<str>,
    pub cached: bool,
}

impl Resolution {
    fn from_hit(key: &QueryKey, hit: CacheHit) -> Self {
        debug!(
            target = "cache",
            qname = %key.name(),
            qtype = ?key.qtype(),
            group = %key.group(),
            remaining_ms = hit.remaining.as_millis() as u64,
            "cache hit"
        );
        Self {
            answer: hit.answer,
            source: hit.source,
            cached: true,
        }
    }
}

type Outcome = Result<Resolution, ResolveError>;
type InflightMap = DashMap<QueryKey, Vec<oneshot::Sender<Outcome>>, FxBuildHasher>;

/// Runtime counters / 运行时指标
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub inflight: AtomicUsize,
    pub total_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub dedup_waits: AtomicU64,
    pub upstream_ns_total: AtomicU64,
    pub upstream_calls: AtomicU64,
    pub upstream_failures: AtomicU64,
}

/// Query coordinator: cache, in-flight de-duplication and upstream dispatch.
#[derive(Clone)]
pub struct Engine {
    cache: RecordCache,
    registry: Arc<GroupRegistry>,
    transport: Arc<dyn UpstreamTransport>,
    rules: Arc<AddressRules>,
    settings: Arc<GlobalSettings>,
    // In-flight dedupe map: key -> waiters / 进行中的去重映射：键 -> 等待者
    inflight: Arc<InflightMap>,
    pub metrics: Arc<EngineMetrics>,
}

impl Engine {
    pub fn new(
        settings: GlobalSettings,
        registry: GroupRegistry,
        rules: AddressRules,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Self {
        let policy = TtlPolicy {
            min_ttl: settings.min_ttl,
            max_ttl: settings.max_ttl,
            negative_ttl: settings.negative_ttl,
        };
        Self {
            cache: RecordCache::new(settings.cache_size, policy),
            registry: Arc::new(registry),
            transport,
            rules: Arc::new(rules),
            settings: Arc::new(settings),
            inflight: Arc::new(DashMap::with_hasher(FxBuildHasher)),
            metrics: Arc::new(EngineMetrics::default()),
        }
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn metrics_snapshot(&self) -> String {
        let m = &self.metrics;
        let up_ns = m.upstream_ns_total.load(Ordering::Relaxed);
        let up_calls = m.upstream_calls.load(Ordering::Relaxed);
        let avg_up_ns = if up_calls > 0 { up_ns / up_calls } else { 0 };
        format!(
            "inflight={} total={} cache_hits={} dedup_waits={} upstream_calls={} upstream_failures={} upstream_avg_us={}",
            m.inflight.load(Ordering::Relaxed),
            m.total_requests.load(Ordering::Relaxed),
            m.cache_hits.load(Ordering::Relaxed),
            m.dedup_waits.load(Ordering::Relaxed),
            up_calls,
            m.upstream_failures.load(Ordering::Relaxed),
            avg_up_ns as f64 / 1000.0
        )
    }

    /// 快速路径：同步尝试静态规则与缓存命中 / Fast path: static rules and cache hits, no await.
    /// `Ok(None)` means the query needs the async path.
    pub fn handle_packet_fast(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        scope: &ListenerScope,
    ) -> anyhow::Result<Option<Bytes>> {
        let start = Instant::now();
        let Ok(query) = codec::decode_query(packet) else {
            // FORMERR is produced by the async path
            return Ok(None);
        };
        let resolution = match self.rules.lookup(&query.qname, query.qtype()) {
            Some(answer) => static_resolution(answer),
            None if scope.cache_enabled => {
                let key = QueryKey::new(&query.qname, query.qtype(), &scope.group);
                match self.cache.lookup(&key) {
                    Some(hit) => Resolution::from_hit(&key, hit),
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        if resolution.cached {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        log_response(&query, peer, scope, &resolution, start.elapsed());
        codec::encode_response(&query, &resolution.answer, scope.reply_limit(&query)).map(Some)
    }

    pub async fn handle_packet(
        &self,
        packet: &[u8],
        peer: SocketAddr,
        scope: &ListenerScope,
    ) -> anyhow::Result<Bytes> {
        let query = match codec::decode_query(packet) {
            Ok(q) => q,
            Err(err) => {
                debug!(client_ip = %peer.ip(), error = %err, "bad query");
                return match err.id {
                    Some(id) => codec::encode_error(id, err.rcode),
                    None => Err(err.into()),
                };
            }
        };

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        struct InflightGuard<'a>(&'a AtomicUsize);
        impl Drop for InflightGuard<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.metrics.inflight.fetch_add(1, Ordering::Relaxed);
        let _inflight_guard = InflightGuard(&self.metrics.inflight);

        let start = Instant::now();
        let answer = match self.resolve(&query, &scope.group, scope.cache_enabled).await {
            Ok(resolution) => {
                log_response(&query, peer, scope, &resolution, start.elapsed());
                resolution.answer
            }
            Err(err) => {
                warn!(
                    event = "dns_response",
                    qname = %query.qname,
                    qtype = ?query.qtype(),
                    rcode = ?ResponseCode::ServFail,
                    latency_ms = start.elapsed().as_millis() as u64,
                    client_ip = %peer.ip(),
                    group = %scope.group,
                    listener = %scope.label,
                    error = %err,
                    "resolution failed"
                );
                Answer::empty(ResponseCode::ServFail)
            }
        };
        codec::encode_response(&query, &answer, scope.reply_limit(&query))
    }

    /// Resolves `query` on behalf of a listener bound to `group`.
    pub async fn resolve(&self, query: &ClientQuery, group: &str, cache_enabled: bool) -> Outcome {
        if let Some(answer) = self.rules.lookup(&query.qname, query.qtype()) {
            return Ok(static_resolution(answer));
        }
        let key = QueryKey::new(&query.qname, query.qtype(), group);

        // no-cache listeners neither read, write nor share in-flight slots
        if !cache_enabled {
            let mut res = self.dispatch_bounded(&key, query).await?;
            self.cap_miss_ttl(&mut res);
            return Ok(res);
        }

        loop {
            if let Some(hit) = self.cache.lookup(&key) {
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Resolution::from_hit(&key, hit));
            }
            let rx = match self.inflight.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push(tx);
                    rx
                }
                Entry::Vacant(entry) => {
                    entry.insert(Vec::new());
                    break;
                }
            };
            self.metrics.dedup_waits.fetch_add(1, Ordering::Relaxed);
            match rx.await {
                Ok(outcome) => return outcome,
                Err(_) => {
                    // owner was cancelled before finishing; take over
                    debug!(qname = %key.name(), group = %key.group(), "in-flight owner gone, retrying");
                }
            }
        }

        let mut cleanup_guard = InflightCleanupGuard::new(self.inflight.clone(), key.clone());
        // another owner may have stored the answer between our miss and the slot
        let outcome = match self.cache.lookup(&key) {
            Some(hit) => Ok(Resolution::from_hit(&key, hit)),
            None => match self.dispatch_bounded(&key, query).await {
                Ok(mut res) => {
                    // stored before the slot is released, so late callers hit the cache
                    if !res.answer.is_server_error() {
                        self.cache.store(key.clone(), res.answer.clone(), &res.source);
                    }
                    self.cap_miss_ttl(&mut res);
                    Ok(res)
                }
                Err(err) => Err(err),
            },
        };
        cleanup_guard.defuse();
        self.notify_inflight_waiters(&key, &outcome);
        outcome
    }

    fn cap_miss_ttl(&self, res: &mut Resolution) {
        if let Some(cap) = self.settings.miss_reply_ttl {
            res.answer.cap_ttls(cap);
        }
    }

    fn notify_inflight_waiters(&self, key: &QueryKey, outcome: &Outcome) {
        let waiters = self.inflight.remove(key).map(|(_, v)| v).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Dispatch wrapped in the total query budget.
    async fn dispatch_bounded(&self, key: &QueryKey, query: &ClientQuery) -> Outcome {
        let upstreams = self.registry.resolve(Some(key.group()))?;
        let budget = self.settings.query_timeout(upstreams.len());
        match timeout(budget, self.dispatch(key, query, upstreams)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::Timeout {
                qname: key.name().to_string(),
                after: budget,
            }),
        }
    }

    async fn dispatch(&self, key: &QueryKey, query: &ClientQuery, upstreams: &[UpstreamSpec]) -> Outcome {
        let wire = codec::build_upstream_query(&query.query).map_err(|e| ResolveError::Encode(e.to_string()))?;
        let per_upstream = self.settings.upstream_timeout();
        let mut agg = Aggregate::default();

        match self.settings.dispatch {
            DispatchPolicy::Sequential => {
                for (idx, spec) in upstreams.iter().enumerate() {
                    let res = self.exchange(spec, &wire, query, per_upstream).await;
                    if let Some(done) = agg.offer(idx, spec, res) {
                        return Ok(done);
                    }
                }
            }
            DispatchPolicy::Parallel => {
                let wire = &wire;
                let mut pending: FuturesUnordered<_> = upstreams
                    .iter()
                    .enumerate()
                    .map(|(idx, spec)| async move {
                        (idx, spec, self.exchange(spec, wire, query, per_upstream).await)
                    })
                    .collect();
                while let Some((idx, spec, res)) = pending.next().await {
                    // remaining exchanges are dropped with `pending`
                    if let Some(done) = agg.offer(idx, spec, res) {
                        return Ok(done);
                    }
                }
            }
        }

        agg.finish(key, upstreams.len())
    }

    /// One upstream round trip, parsed and checked against the question.
    async fn exchange(
        &self,
        spec: &UpstreamSpec,
        wire: &[u8],
        query: &ClientQuery,
        timeout_dur: Duration,
    ) -> Result<Answer, TransportError> {
        let start = Instant::now();
        let res = self
            .transport
            .send(spec, wire, timeout_dur)
            .await
            .and_then(|raw| {
                codec::parse_upstream_response(&raw, &query.query)
                    .map_err(|reason| TransportError::protocol(spec.addr, reason))
            });
        let dur = start.elapsed();
        match &res {
            Ok(answer) => {
                self.metrics.upstream_calls.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .upstream_ns_total
                    .fetch_add(dur.as_nanos() as u64, Ordering::Relaxed);
                debug!(upstream = %spec.label(), rcode = ?answer.rcode, upstream_ns = dur.as_nanos() as u64, "upstream call latency");
            }
            Err(e) => {
                self.metrics.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(upstream = %spec.label(), group = %spec.group, error = %e, elapsed_ns = dur.as_nanos() as u64, "upstream call failed");
            }
        }
        res
    }
}

/// Collects upstream results: the first usable answer wins, server errors
/// are kept as fallback (lowest registration index first).
#[derive(Default)]
struct Aggregate {
    fallback: Option<(usize, Resolution)>,
    last_err: Option<TransportError>,
}

impl Aggregate {
    fn offer(&mut self, idx: usize, spec: &UpstreamSpec, res: Result<Answer, TransportError>) -> Option<Resolution> {
        match res {
            Ok(answer) => {
                let resolution = Resolution {
                    answer,
                    source: Arc::from(spec.label()),
                    cached: false,
                };
                if !resolution.answer.is_server_error() {
                    return Some(resolution);
                }
                if self.fallback.as_ref().is_none_or(|(i, _)| idx < *i) {
                    self.fallback = Some((idx, resolution));
                }
                None
            }
            Err(err) => {
                self.last_err = Some(err);
                None
            }
        }
    }

    fn finish(self, key: &QueryKey, attempted: usize) -> Outcome {
        match self.fallback {
            Some((_, resolution)) => Ok(resolution),
            None => Err(ResolveError::UpstreamUnavailable {
                group: key.group().to_string(),
                attempted,
                last: self.last_err,
            }),
        }
    }
}

struct InflightCleanupGuard {
    inflight: Arc<InflightMap>,
    key: QueryKey,
    active: bool,
}

impl InflightCleanupGuard {
    fn new(inflight: Arc<InflightMap>, key: QueryKey) -> Self {
        Self {
            inflight,
            key,
            active: true,
        }
    }

    fn defuse(&mut self) {
        self.active = false;
    }
}

impl Drop for InflightCleanupGuard {
    fn drop(&mut self) {
        // dropping the senders wakes the waiters, which then retry
        if self.active {
            self.inflight.remove(&self.key);
        }
    }
}

fn static_resolution(answer: Answer) -> Resolution {
    Resolution {
        answer,
        source: Arc::from(STATIC_SOURCE),
        cached: false,
    }
}

fn log_response(query: &ClientQuery, peer: SocketAddr, scope: &ListenerScope, res: &Resolution, latency: Duration) {
    info!(
        event = "dns_response",
        upstream = %res.source,
        qname = %query.qname,
        qtype = ?query.qtype(),
        rcode = ?res.answer.rcode,
        answers = res.answer.answers.len(),
        latency_ms = latency.as_millis() as u64,
        client_ip = %peer.ip(),
        group = %scope.group,
        listener = %scope.label,
        cache = res.cached,
    );
}
