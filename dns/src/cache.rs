// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Response cache: LRU with per-record TTL and configurable clamping.

use config::DnsCacheConfig;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Instant;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub record_type: RecordType,
}

struct CachedResponse {
    message: Message,
    stored_at: Instant,
    /// Smallest clamped answer TTL.
    ttl: u32,
}

pub struct DnsCache {
    entries: Mutex<LruCache<CacheKey, CachedResponse>>,
    min_ttl: u32,
    max_ttl: u32,
}

impl DnsCache {
    #[must_use]
    pub fn new(config: &DnsCacheConfig) -> DnsCache {
        let capacity = NonZeroUsize::new(config.max_entries.max(1))
            .unwrap_or_else(|| unreachable!());
        DnsCache {
            entries: Mutex::new(LruCache::new(capacity)),
            min_ttl: config.min_ttl,
            max_ttl: config.max_ttl.max(config.min_ttl),
        }
    }

    fn clamp(&self, ttl: u32) -> u32 {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }

    /// Store an upstream response. Answer TTLs are clamped in place so the
    /// served copies decrement from the clamped value.
    pub fn store(&self, key: CacheKey, mut message: Message, now: Instant) {
        let answers = message.take_answers();
        if answers.is_empty() {
            return;
        }
        let mut min_ttl = u32::MAX;
        let clamped: Vec<_> = answers
            .into_iter()
            .map(|mut record| {
                let ttl = self.clamp(record.ttl());
                record.set_ttl(ttl);
                min_ttl = min_ttl.min(ttl);
                record
            })
            .collect();
        message.add_answers(clamped);
        self.entries.lock().put(
            key,
            CachedResponse {
                message,
                stored_at: now,
                ttl: min_ttl,
            },
        );
    }

    /// A fresh copy with decremented TTLs, or None when absent/expired.
    #[must_use]
    pub fn fetch(&self, key: &CacheKey, now: Instant) -> Option<Message> {
        let mut entries = self.entries.lock();
        let cached = entries.get(key)?;
        let age = now.saturating_duration_since(cached.stored_at).as_secs();
        let age = u32::try_from(age).unwrap_or(u32::MAX);
        if age >= cached.ttl {
            entries.pop(key);
            return None;
        }
        let mut copy = cached.message.clone();
        let remaining: Vec<_> = copy
            .take_answers()
            .into_iter()
            .map(|mut record| {
                record.set_ttl(record.ttl().saturating_sub(age));
                record
            })
            .collect();
        copy.add_answers(remaining);
        Some(copy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dropped on every applied revision so config changes take effect.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn response(ttl: u32) -> Message {
        let mut message = Message::new();
        let name = Name::from_ascii("host.example.com.").unwrap();
        message.add_answer(Record::from_rdata(
            name,
            ttl,
            RData::A(A("192.0.2.7".parse().unwrap())),
        ));
        message
    }

    fn key() -> CacheKey {
        CacheKey {
            name: "host.example.com.".to_string(),
            record_type: RecordType::A,
        }
    }

    fn cache() -> DnsCache {
        DnsCache::new(&DnsCacheConfig {
            max_entries: 8,
            min_ttl: 30,
            max_ttl: 300,
        })
    }

    #[test]
    fn ttl_clamps_both_directions() {
        let cache = cache();
        let t0 = Instant::now();
        cache.store(key(), response(5), t0);
        let fetched = cache.fetch(&key(), t0).unwrap();
        assert_eq!(fetched.answers()[0].ttl(), 30);

        cache.store(key(), response(86_400), t0);
        let fetched = cache.fetch(&key(), t0).unwrap();
        assert_eq!(fetched.answers()[0].ttl(), 300);
    }

    #[test]
    fn age_decrements_and_expires() {
        let cache = cache();
        let t0 = Instant::now();
        cache.store(key(), response(60), t0);

        let later = t0 + Duration::from_secs(20);
        let fetched = cache.fetch(&key(), later).unwrap();
        assert_eq!(fetched.answers()[0].ttl(), 40);

        let expired = t0 + Duration::from_secs(61);
        assert!(cache.fetch(&key(), expired).is_none());
        // Expired entry was evicted, not just hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn negative_responses_are_not_cached() {
        let cache = cache();
        cache.store(key(), Message::new(), Instant::now());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = cache();
        let t0 = Instant::now();
        for i in 0..9 {
            cache.store(
                CacheKey {
                    name: format!("h{i}.example.com."),
                    record_type: RecordType::A,
                },
                response(60),
                t0,
            );
        }
        assert_eq!(cache.len(), 8);
        assert!(
            cache
                .fetch(
                    &CacheKey {
                        name: "h0.example.com.".to_string(),
                        record_type: RecordType::A,
                    },
                    t0
                )
                .is_none()
        );
    }
}
