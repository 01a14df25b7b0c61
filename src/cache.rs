//! DNS response cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::debug;

use crate::dns::{self, Question};

pub const DEFAULT_MIN_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(86400);

struct CacheEntry {
    response: Message,
    expires_at: Instant,
    seq: u64,
}

/// Bounded, TTL-aware response cache.
///
/// Uses a 2-level map (qtype -> name -> entry) so lookups borrow the question
/// name instead of building a key. An expiry-ordered index next to it keeps
/// sweeping and eviction at O(log n) per entry. Returned messages are clones;
/// callers may mutate them freely.
pub struct ResponseCache {
    entries: RwLock<Entries>,
    capacity: usize,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl_bounds(capacity, DEFAULT_MIN_TTL, DEFAULT_MAX_TTL)
    }

    /// Create a cache whose entry lifetimes are clamped to `[min_ttl, max_ttl]`.
    pub fn with_ttl_bounds(capacity: usize, min_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            capacity: capacity.max(1),
            min_ttl,
            max_ttl: max_ttl.max(min_ttl),
        }
    }

    /// Look up a cached response.
    ///
    /// The record TTLs of the returned copy count down from the stored ones.
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, question: &Question) -> Option<Message> {
        let now = Instant::now();

        {
            let Ok(entries) = self.entries.read() else {
                return None;
            };
            let entry = entries.get(question)?;
            if now < entry.expires_at {
                let remaining = entry.expires_at.duration_since(now).as_secs() as u32;
                let mut response = entry.response.clone();
                dns::rewrite_ttls(&mut response, |ttl| ttl.min(remaining));
                return Some(response);
            }
        }

        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        if entries
            .get(question)
            .is_some_and(|entry| now >= entry.expires_at)
        {
            entries.remove(question.qtype, &question.name);
        }
        None
    }

    /// Store a response, deriving its lifetime from the smallest record TTL.
    pub fn put(&self, question: &Question, response: &Message) {
        let ttl = dns::min_ttl(response)
            .map(|ttl| Duration::from_secs(u64::from(ttl)))
            .unwrap_or(self.min_ttl);
        self.put_with_ttl(question, response, ttl);
    }

    /// Store a response for `ttl`, clamped to the cache's bounds.
    pub fn put_with_ttl(&self, question: &Question, response: &Message, ttl: Duration) {
        let ttl = ttl.clamp(self.min_ttl, self.max_ttl);
        let response = response.clone();
        let now = Instant::now();

        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        if entries.get(question).is_none() && entries.len() >= self.capacity {
            entries.make_room(now);
        }
        entries.insert(question, response, now + ttl);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        entries.purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Entries {
    by_name: FxHashMap<RecordType, FxHashMap<String, CacheEntry>>,
    /// Every entry of `by_name`, ordered by expiry; `seq` breaks ties.
    by_expiry: BTreeMap<(Instant, u64), (RecordType, String)>,
    next_seq: u64,
}

impl Entries {
    fn len(&self) -> usize {
        self.by_expiry.len()
    }

    fn get(&self, question: &Question) -> Option<&CacheEntry> {
        self.by_name
            .get(&question.qtype)?
            .get(question.name.as_str())
    }

    fn insert(&mut self, question: &Question, response: Message, expires_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_expiry
            .insert((expires_at, seq), (question.qtype, question.name.clone()));
        let previous = self.by_name.entry(question.qtype).or_default().insert(
            question.name.clone(),
            CacheEntry {
                response,
                expires_at,
                seq,
            },
        );
        if let Some(previous) = previous {
            self.by_expiry.remove(&(previous.expires_at, previous.seq));
        }
    }

    fn remove(&mut self, qtype: RecordType, name: &str) {
        let Some(inner) = self.by_name.get_mut(&qtype) else {
            return;
        };
        if let Some(entry) = inner.remove(name) {
            self.by_expiry.remove(&(entry.expires_at, entry.seq));
        }
        if inner.is_empty() {
            self.by_name.remove(&qtype);
        }
    }

    /// Remove the entry closest to expiry.
    fn pop_soonest(&mut self) -> Option<(RecordType, String)> {
        let (_, (qtype, name)) = self.by_expiry.pop_first()?;
        if let Some(inner) = self.by_name.get_mut(&qtype) {
            inner.remove(&name);
            if inner.is_empty() {
                self.by_name.remove(&qtype);
            }
        }
        Some((qtype, name))
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while self
            .by_expiry
            .first_key_value()
            .is_some_and(|((expires_at, _), _)| now >= *expires_at)
        {
            self.pop_soonest();
            removed += 1;
        }
        removed
    }

    /// Free one slot: expired entries first, otherwise the one closest to expiry.
    fn make_room(&mut self, now: Instant) {
        if self.purge_expired(now) > 0 {
            return;
        }
        if let Some((qtype, name)) = self.pop_soonest() {
            debug!(name = %name, qtype = %qtype, "Cache full, evicting entry");
        }
    }
}
