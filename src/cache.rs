use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use moka::sync::Cache;
use moka::Expiry;

use crate::proto;

/// Cache / single-flight key: lowercase `name || qtype [ . subnet ]`.
/// Including the ECS subnet keeps differently-scoped answers apart.
pub fn fingerprint(request: &Message) -> String {
    let Some(question) = request.queries().first() else {
        return String::new();
    };
    let mut key = format!("{}{}", question.name(), u16::from(question.query_type()));
    if let Some(subnet) = proto::format_ecs(request) {
        key.push('.');
        key.push_str(&subnet);
    }
    key.to_lowercase()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    msg: Message,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// TTL response cache. Entry lifetime is the minimum answer TTL clamped
/// to the configured bounds; empty responses are cached too (negative
/// caching at the floor TTL).
pub struct DnsCache {
    cache: Cache<String, CacheEntry>,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl DnsCache {
    pub fn new(max_capacity: u64, min_ttl: Duration, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            min_ttl,
            max_ttl: max_ttl.max(min_ttl),
        }
    }

    pub fn get(&self, request: &Message) -> Option<Message> {
        self.cache.get(&fingerprint(request)).map(|entry| entry.msg)
    }

    pub fn set(&self, request: &Message, response: Option<&Message>) {
        let Some(response) = response else {
            return;
        };
        let ttl = Duration::from_secs(proto::min_ttl(response)).clamp(self.min_ttl, self.max_ttl);
        self.cache.insert(
            fingerprint(request),
            CacheEntry {
                msg: response.clone(),
                ttl,
            },
        );
    }
}
