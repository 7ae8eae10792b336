//! An opportunistic response cache keyed by a question fingerprint.
//!
//! The fingerprint is FNV-1a-64 over the canonical packed form of the
//! message with the id zeroed and the additional section (including the OPT
//! record) stripped, so retries and differently-numbered queries for the
//! same question share an entry. One consequence: the Client Subnet option
//! does not participate in the key, so tailored answers are shared too.

use crate::types::Message;
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::RwLock;
use std::time::{Duration, Instant};

// Answerless responses (NXDOMAIN and friends) are worth keeping briefly.
const EMPTY_ANSWER_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    upstream: String,
    response: Message,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        ResponseCache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The cache key for a request. `None` when the message cannot be
    /// packed, in which case it simply isn't cached.
    pub fn fingerprint(request: &Message) -> Option<u64> {
        let mut canonical = request.clone();
        canonical.id = 0;
        canonical.additionals.clear();
        canonical.extension = None;

        let buf = match canonical.to_vec() {
            Ok(buf) => buf,
            Err(e) => {
                log::debug!("request not cacheable: {}", e);
                return None;
            }
        };

        let mut hasher = FnvHasher::default();
        hasher.write(&buf);
        Some(hasher.finish())
    }

    /// Returns a copy of the cached response carrying the request's id,
    /// plus the upstream that produced it.
    pub fn lookup(&self, key: u64, request_id: u16) -> Option<(Message, String)> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }

        log::debug!("cache hit for request 0x{:x}", key);
        let mut response = entry.response.clone();
        response.id = request_id;
        Some((response, entry.upstream.clone()))
    }

    /// Inserts a response, evicting every expired entry on the way. The
    /// entry lives for the smallest answer TTL; a zero TTL anywhere means
    /// the response must not be reused at all.
    pub fn store(&self, key: u64, upstream: &str, response: &Message) {
        let ttl = match minimum_ttl(response) {
            Some(ttl) => ttl,
            None => return,
        };

        let mut response = response.clone();
        response.additionals.clear();
        response.extension = None;

        let mut entries = self.entries.write().unwrap();

        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        log::debug!("cache miss for request 0x{:x} (TTL={:?})", key, ttl);
        entries.insert(
            key,
            CacheEntry {
                upstream: upstream.to_string(),
                response,
                expires_at: now + ttl,
            },
        );
    }

    #[cfg(test)]
    fn insert_expired(&self, key: u64, response: &Message) {
        self.entries.write().unwrap().insert(
            key,
            CacheEntry {
                upstream: "udp:192.0.2.1:53".to_string(),
                response: response.clone(),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

fn minimum_ttl(response: &Message) -> Option<Duration> {
    let mut minimum: Option<Duration> = None;

    for record in &response.answers {
        if record.ttl == Duration::ZERO {
            return None;
        }
        minimum = Some(match minimum {
            Some(minimum) => minimum.min(record.ttl),
            None => record.ttl,
        });
    }

    Some(minimum.unwrap_or(EMPTY_ANSWER_TTL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::types::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn request(name: &str, id: u16) -> Message {
        let mut request = Message {
            id,
            ..Message::default()
        };
        request.add_question(name, Type::A, Class::Internet).unwrap();
        request
    }

    fn response(request: &Message, ttl: u64) -> Message {
        let mut response = request.prepare_reply();
        response.rcode = Rcode::NoError;
        response.answers.push(Record {
            name: request.questions[0].name.clone(),
            class: Class::Internet,
            ttl: Duration::from_secs(ttl),
            resource: Resource::A(Ipv4Addr::new(192, 0, 2, 1)),
        });
        response
    }

    #[test]
    fn test_fingerprint_ignores_id_and_additionals() {
        let a = request("example.com", 1);
        let mut b = request("example.com", 2);
        b.add_extension(Extension::default());

        assert_eq!(
            ResponseCache::fingerprint(&a),
            ResponseCache::fingerprint(&b)
        );
        assert_ne!(
            ResponseCache::fingerprint(&a),
            ResponseCache::fingerprint(&request("other.example.com", 1))
        );
    }

    #[test]
    fn test_hit_carries_the_request_id() {
        let cache = ResponseCache::new();
        let query = request("example.com", 0x1111);
        let key = ResponseCache::fingerprint(&query).unwrap();

        cache.store(key, "udp:192.0.2.1:53", &response(&query, 300));

        let (cached, upstream) = cache.lookup(key, 0x2222).unwrap();
        assert_eq!(cached.id, 0x2222);
        assert_eq!(upstream, "udp:192.0.2.1:53");
        assert_eq!(cached.answers.len(), 1);
    }

    #[test]
    fn test_zero_ttl_is_never_stored() {
        let cache = ResponseCache::new();
        let query = request("example.com", 1);
        let key = ResponseCache::fingerprint(&query).unwrap();

        cache.store(key, "udp:192.0.2.1:53", &response(&query, 0));

        assert!(cache.lookup(key, 1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_store_purges_expired_entries() {
        let cache = ResponseCache::new();
        let stale = request("stale.example.com", 1);
        let fresh = request("fresh.example.com", 2);

        cache.insert_expired(
            ResponseCache::fingerprint(&stale).unwrap(),
            &response(&stale, 300),
        );
        assert_eq!(cache.len(), 1);

        let key = ResponseCache::fingerprint(&fresh).unwrap();
        cache.store(key, "udp:192.0.2.1:53", &response(&fresh, 300));

        // The insert evicted the expired entry; only the new one remains.
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(key, 2).is_some());
    }

    #[test]
    fn test_answerless_responses_get_the_default_ttl() {
        let cache = ResponseCache::new();
        let query = request("nxdomain.example.com", 1);
        let key = ResponseCache::fingerprint(&query).unwrap();

        let mut nx = query.prepare_reply();
        nx.rcode = Rcode::NXDomain;
        cache.store(key, "udp:192.0.2.1:53", &nx);

        assert!(cache.lookup(key, 1).is_some());
    }
}
