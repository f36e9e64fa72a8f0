//! 중복 시그널 방지 (offer/answer 지문 캐시)

use crate::protocol::SdpKind;
use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};

/// 지문에 포함할 SDP 앞부분 길이
const FINGERPRINT_SDP_PREFIX: usize = 256;

/// offer/answer 지문: 세션 + 보낸 사람 + 종류 + 세대 + SDP 앞부분
pub fn fingerprint(
    session_id: &str,
    from: &str,
    kind: SdpKind,
    generation: u32,
    sdp: &str,
) -> String {
    let bytes = sdp.as_bytes();
    let prefix = &bytes[..bytes.len().min(FINGERPRINT_SDP_PREFIX)];

    let mut hasher = Sha1::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(from.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update(generation.to_be_bytes());
    hasher.update(prefix);
    BASE64.encode(hasher.finalize())
}

/// 고정 용량 지문 집합. 가득 차면 가장 오래된 항목부터 버린다.
#[derive(Debug)]
pub struct FingerprintCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl FingerprintCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// 새 지문이면 true
    pub fn insert(&mut self, fingerprint: String) -> bool {
        if self.seen.contains(&fingerprint) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(fingerprint.clone());
        self.order.push_back(fingerprint);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_signals_share_a_fingerprint() {
        let a = fingerprint("s1", "alice", SdpKind::Offer, 1, "v=0\r\no=- 42 1 IN IP4 0.0.0.0");
        let b = fingerprint("s1", "alice", SdpKind::Offer, 1, "v=0\r\no=- 42 1 IN IP4 0.0.0.0");
        assert_eq!(a, b);

        assert_ne!(a, fingerprint("s2", "alice", SdpKind::Offer, 1, "v=0\r\no=- 42 1 IN IP4 0.0.0.0"));
        assert_ne!(a, fingerprint("s1", "alice", SdpKind::Answer, 1, "v=0\r\no=- 42 1 IN IP4 0.0.0.0"));
        assert_ne!(a, fingerprint("s1", "alice", SdpKind::Offer, 2, "v=0\r\no=- 42 1 IN IP4 0.0.0.0"));
    }

    #[test]
    fn only_the_sdp_prefix_is_fingerprinted() {
        let head = "a".repeat(FINGERPRINT_SDP_PREFIX);
        let a = fingerprint("s1", "alice", SdpKind::Offer, 1, &format!("{head}tail-one"));
        let b = fingerprint("s1", "alice", SdpKind::Offer, 1, &format!("{head}tail-two"));
        assert_eq!(a, b);
    }

    #[test]
    fn cache_evicts_oldest_when_full() {
        let mut cache = FingerprintCache::new(2);
        assert!(cache.insert("a".into()));
        assert!(cache.insert("b".into()));
        assert!(!cache.insert("a".into()));

        assert!(cache.insert("c".into()));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }
}
