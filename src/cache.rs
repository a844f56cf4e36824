use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hickory_proto::rr::{RData, RecordType};
use moka::Expiry;
use moka::sync::Cache;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{self, Answer};

/// Cache and de-duplication identity: name + type + group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    name: Arc<str>,
    qtype: RecordType,
    group: Arc<str>,
}

impl QueryKey {
    pub fn new(name: &str, qtype: RecordType, group: &str) -> Self {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        Self {
            name: Arc::from(name),
            qtype,
            group: Arc::from(group),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

/// Bounds applied to advertised TTLs before an answer is stored.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub negative_ttl: u32,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            min_ttl: 0,
            max_ttl: 86_400,
            negative_ttl: 60,
        }
    }
}

impl TtlPolicy {
    /// Rewrites record TTLs into base TTLs and returns the entry lifetime in
    /// seconds: the smallest base TTL, or `negative_ttl` without records.
    pub fn normalize(&self, answer: &mut Answer) -> u32 {
        let negative = answer.answers.is_empty();
        let mut lifetime: Option<u32> = None;
        for record in answer.records_mut() {
            let mut ttl = record.ttl();
            // RFC 2308: negative answers live min(SOA TTL, SOA minimum).
            if negative && record.record_type() == RecordType::SOA {
                if let Some(RData::SOA(soa)) = record.data() {
                    ttl = ttl.min(soa.minimum());
                }
            }
            let ttl = ttl.clamp(self.min_ttl, self.max_ttl.max(self.min_ttl));
            record.set_ttl(ttl);
            lifetime = Some(lifetime.map_or(ttl, |l| l.min(ttl)));
        }
        lifetime.unwrap_or(self.negative_ttl)
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    /// Records carry their base TTL.
    answer: Answer,
    lifetime: Duration,
    inserted: Instant,
    source: Arc<str>,
}

impl CacheEntry {
    /// Answer with effective TTLs at `now`, or `None` once expired.
    fn snapshot(&self, now: Instant) -> Option<(Answer, Duration)> {
        let elapsed = now.saturating_duration_since(self.inserted);
        if elapsed >= self.lifetime {
            return None;
        }
        let elapsed_secs = elapsed.as_secs() as u32;
        let mut answer = self.answer.clone();
        for record in answer.records_mut() {
            // base >= lifetime > elapsed, so this never reaches zero
            record.set_ttl(record.ttl().saturating_sub(elapsed_secs).max(1));
        }
        Some((answer, self.lifetime - elapsed))
    }
}

struct EntryExpiry;

impl Expiry<QueryKey, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &QueryKey,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }

    fn expire_after_update(
        &self,
        _key: &QueryKey,
        value: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub answer: Answer,
    pub remaining: Duration,
    pub source: Arc<str>,
}

/// Serializable form of one entry, TTLs relative to `saved_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub name: String,
    pub qtype: u16,
    pub group: String,
    pub source: String,
    pub saved_at: u64,
    pub remaining_secs: u64,
    pub message: Vec<u8>,
}

/// Concurrent answer cache. Expiry is evaluated at read time; moka's
/// per-entry expiry only reclaims memory.
#[derive(Clone)]
pub struct RecordCache {
    inner: Cache<QueryKey, Arc<CacheEntry>, FxBuildHasher>,
    policy: TtlPolicy,
}

impl RecordCache {
    pub fn new(max_capacity: u64, policy: TtlPolicy) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build_with_hasher(FxBuildHasher);
        Self { inner, policy }
    }

    pub fn lookup(&self, key: &QueryKey) -> Option<CacheHit> {
        self.lookup_at(key, Instant::now())
    }

    pub(crate) fn lookup_at(&self, key: &QueryKey, now: Instant) -> Option<CacheHit> {
        let entry = self.inner.get(key)?;
        match entry.snapshot(now) {
            Some((answer, remaining)) => Some(CacheHit {
                answer,
                remaining,
                source: entry.source.clone(),
            }),
            None => {
                debug!(target = "cache", qname = %key.name(), qtype = ?key.qtype(), "entry expired");
                self.invalidate(key);
                None
            }
        }
    }

    /// Stores `answer` under `key`; returns false when its lifetime is zero.
    pub fn store(&self, key: QueryKey, answer: Answer, source: &str) -> bool {
        self.store_at(key, answer, source, Instant::now())
    }

    pub(crate) fn store_at(&self, key: QueryKey, mut answer: Answer, source: &str, now: Instant) -> bool {
        let lifetime = self.policy.normalize(&mut answer);
        self.insert(key, answer, Duration::from_secs(lifetime as u64), source, now)
    }

    fn insert(&self, key: QueryKey, answer: Answer, lifetime: Duration, source: &str, now: Instant) -> bool {
        if lifetime.is_zero() {
            return false;
        }
        let entry = CacheEntry {
            answer,
            lifetime,
            inserted: now,
            source: Arc::from(source),
        };
        self.inner.insert(key, Arc::new(entry));
        true
    }

    pub fn invalidate(&self, key: &QueryKey) {
        self.inner.invalidate(key);
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    /// Snapshot of all live entries with effective TTLs.
    pub fn export(&self) -> Vec<PersistedEntry> {
        let now = Instant::now();
        let saved_at = unix_now();
        let mut out = Vec::new();
        for (key, entry) in self.inner.iter() {
            let Some((answer, remaining)) = entry.snapshot(now) else {
                continue;
            };
            match codec::encode_answer(&answer) {
                Ok(message) => out.push(PersistedEntry {
                    name: key.name().to_string(),
                    qtype: u16::from(key.qtype()),
                    group: key.group().to_string(),
                    source: entry.source.to_string(),
                    saved_at,
                    remaining_secs: remaining.as_secs(),
                    message,
                }),
                Err(err) => debug!(target = "cache", qname = %key.name(), error = %err, "skip unencodable entry"),
            }
        }
        out
    }

    /// Re-inserts persisted entries, aging them by the time spent on disk.
    /// Returns the number of entries restored.
    pub fn import(&self, entries: Vec<PersistedEntry>) -> anyhow::Result<usize> {
        let now = Instant::now();
        let wall = unix_now();
        let mut restored = 0;
        for e in entries {
            let aged = wall.saturating_sub(e.saved_at);
            let remaining = e.remaining_secs.saturating_sub(aged);
            if remaining == 0 {
                continue;
            }
            let mut answer = codec::decode_answer(&e.message)?;
            let aged = aged.min(u32::MAX as u64) as u32;
            let mut expired = false;
            for record in answer.records_mut() {
                let ttl = record.ttl().saturating_sub(aged);
                expired |= ttl == 0;
                record.set_ttl(ttl);
            }
            if expired {
                continue;
            }
            let key = QueryKey::new(&e.name, RecordType::from(e.qtype), &e.group);
            if self.insert(key, answer, Duration::from_secs(remaining), &e.source, now) {
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
