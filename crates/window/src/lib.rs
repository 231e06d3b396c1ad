//! The live mode's bounded request population.
//!
//! A window owns an insertion-ordered request buffer and a trie indexing the
//! buffer's addresses; the trie's counts always equal the multiset of
//! addresses currently resident. Eviction is lazy: it runs at the start of a
//! detection cycle, not per insertion.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use cidrwatch_common::Request;
use cidrwatch_trie::Trie;
use tracing::debug;

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictStats {
    /// Requests older than the window's maximum age.
    pub expired: usize,
    /// Requests dropped to respect the maximum count.
    pub overflow: usize,
}

pub struct SlidingWindow {
    max_age: Duration,
    max_count: usize,
    buffer: VecDeque<Request>,
    trie: Trie,
    last_detection: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self {
            max_age,
            max_count,
            buffer: VecDeque::new(),
            trie: Trie::new(),
            last_detection: None,
        }
    }

    /// Admit a request. Filtering happened upstream; the window takes
    /// everything it is handed.
    pub fn push(&mut self, request: Request) {
        self.trie.insert(request.addr);
        self.buffer.push_back(request);
    }

    /// Drop requests older than `now - max_age`, then oldest-first down to
    /// `max_count`, deleting each dropped address from the trie.
    pub fn evict(&mut self, now: DateTime<Utc>) -> EvictStats {
        let mut stats = EvictStats::default();
        let cutoff = now - self.max_age;

        while let Some(front) = self.buffer.front() {
            if front.timestamp >= cutoff {
                break;
            }
            let request = self.buffer.pop_front().expect("front exists");
            self.trie.delete(request.addr);
            stats.expired += 1;
        }

        while self.buffer.len() > self.max_count {
            let request = self.buffer.pop_front().expect("len > 0");
            self.trie.delete(request.addr);
            stats.overflow += 1;
        }

        if stats.expired > 0 || stats.overflow > 0 {
            debug!(
                expired = stats.expired,
                overflow = stats.overflow,
                resident = self.buffer.len(),
                "window eviction"
            );
        }
        stats
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_detection(&self) -> Option<DateTime<Utc>> {
        self.last_detection
    }

    pub fn mark_detection(&mut self, now: DateTime<Utc>) {
        self.last_detection = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidrwatch_common::Method;
    use cidrwatch_net::parse_addr;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn request(addr: &str, at: DateTime<Utc>) -> Request {
        Request {
            addr: parse_addr(addr).unwrap(),
            timestamp: at,
            method: Method::Get,
            status: 200,
            bytes: 0,
            uri: "/".to_string(),
            user_agent: String::new(),
        }
    }

    #[test]
    fn push_indexes_into_trie() {
        let mut window = SlidingWindow::new(Duration::seconds(60), 100);
        window.push(request("10.0.0.1", t(0)));
        window.push(request("10.0.0.1", t(1)));
        window.push(request("10.0.0.2", t(2)));

        assert_eq!(window.len(), 3);
        assert_eq!(window.trie().count(parse_addr("10.0.0.1").unwrap()), 2);
        assert_eq!(window.trie().total(), 3);
    }

    #[test]
    fn age_eviction_clears_trie_counts() {
        let mut window = SlidingWindow::new(Duration::seconds(60), 100);
        window.push(request("10.0.0.1", t(0)));
        window.push(request("10.0.0.2", t(70)));

        let stats = window.evict(t(70));
        assert_eq!(stats, EvictStats { expired: 1, overflow: 0 });
        assert_eq!(window.len(), 1);
        assert_eq!(window.trie().count(parse_addr("10.0.0.1").unwrap()), 0);
        assert_eq!(window.trie().count(parse_addr("10.0.0.2").unwrap()), 1);
        assert_eq!(window.trie().total(), 1);
    }

    #[test]
    fn boundary_age_is_retained() {
        let mut window = SlidingWindow::new(Duration::seconds(60), 100);
        window.push(request("10.0.0.1", t(10)));
        // Exactly max_age old: still inside the window.
        let stats = window.evict(t(70));
        assert_eq!(stats.expired, 0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn size_eviction_drops_oldest_first() {
        let mut window = SlidingWindow::new(Duration::seconds(3600), 2);
        window.push(request("10.0.0.1", t(0)));
        window.push(request("10.0.0.2", t(1)));
        window.push(request("10.0.0.3", t(2)));

        let stats = window.evict(t(3));
        assert_eq!(stats, EvictStats { expired: 0, overflow: 1 });
        assert_eq!(window.len(), 2);
        assert_eq!(window.trie().count(parse_addr("10.0.0.1").unwrap()), 0);
        assert_eq!(window.trie().count(parse_addr("10.0.0.2").unwrap()), 1);
    }

    #[test]
    fn eviction_applies_age_before_size() {
        let mut window = SlidingWindow::new(Duration::seconds(60), 2);
        window.push(request("10.0.0.1", t(0)));
        window.push(request("10.0.0.2", t(65)));
        window.push(request("10.0.0.3", t(66)));
        window.push(request("10.0.0.4", t(67)));

        let stats = window.evict(t(70));
        // One aged out, then one more to get under the cap.
        assert_eq!(stats, EvictStats { expired: 1, overflow: 1 });
        assert_eq!(window.len(), 2);
        assert_eq!(window.trie().total(), 2);
    }

    #[test]
    fn eviction_invariants_hold() {
        let mut window = SlidingWindow::new(Duration::seconds(30), 5);
        for i in 0..20 {
            window.push(request("192.0.2.1", t(i * 10)));
        }
        let now = t(200);
        window.evict(now);

        assert!(window.len() <= 5);
        // Spot-check the retained population against the trie.
        assert_eq!(window.trie().total() as usize, window.len());
    }

    #[test]
    fn detection_timestamp_bookkeeping() {
        let mut window = SlidingWindow::new(Duration::seconds(60), 10);
        assert!(window.last_detection().is_none());
        window.mark_detection(t(42));
        assert_eq!(window.last_detection(), Some(t(42)));
    }
}
