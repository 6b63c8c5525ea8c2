//! Duplicate suppression: a fixed-capacity, time-pruned ring of recently seen message ids.
//!
//! Message ids are 16-bit and random, so two distinct messages can alias. The window only
//! stops the same datagram from being processed twice in quick succession.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Hard cap; the newest push overwrites the oldest entry.
pub const CAPACITY: usize = 256;
/// Age pruning only kicks in above this many entries.
pub const PRUNE_THRESHOLD: usize = 64;
/// Entries older than this are pruned once above the threshold.
pub const MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DedupWindow {
    entries: VecDeque<(Instant, u16)>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(CAPACITY),
        }
    }

    pub fn push(&mut self, message_id: u16) {
        self.push_at(message_id, Instant::now());
    }

    /// Record `message_id` as seen at `now`.
    pub fn push_at(&mut self, message_id: u16, now: Instant) {
        if self.entries.len() == CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((now, message_id));

        if self.entries.len() > PRUNE_THRESHOLD {
            while let Some(&(seen, _)) = self.entries.front() {
                if now.saturating_duration_since(seen) > MAX_AGE {
                    self.entries.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn contains(&self, message_id: u16) -> bool {
        self.entries.iter().any(|&(_, id)| id == message_id)
    }

    /// True when `message_id` was already seen; otherwise records it.
    pub fn check_and_record(&mut self, message_id: u16) -> bool {
        self.check_and_record_at(message_id, Instant::now())
    }

    pub fn check_and_record_at(&mut self, message_id: u16, now: Instant) -> bool {
        if self.contains(message_id) {
            return true;
        }
        self.push_at(message_id, now);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_a_duplicate() {
        let mut window = DedupWindow::new();
        assert!(!window.contains(77));
        window.push(77);
        assert!(window.contains(77));
        assert!(window.check_and_record(77));
        assert!(!window.check_and_record(78));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn old_ids_are_forgotten_once_above_threshold() {
        let mut window = DedupWindow::new();
        let start = Instant::now();
        window.push_at(1, start);
        let later = start + MAX_AGE + Duration::from_secs(1);
        for id in 100..100 + PRUNE_THRESHOLD as u16 {
            window.push_at(id, later);
        }
        assert!(!window.contains(1));
        assert_eq!(window.len(), PRUNE_THRESHOLD);
    }

    #[test]
    fn old_ids_survive_below_threshold() {
        let mut window = DedupWindow::new();
        let start = Instant::now();
        window.push_at(1, start);
        let later = start + Duration::from_secs(3600);
        for id in 100..110 {
            window.push_at(id, later);
        }
        assert!(window.contains(1));
    }

    #[test]
    fn capacity_keeps_most_recent() {
        let mut window = DedupWindow::new();
        let now = Instant::now();
        for id in 0..300u16 {
            window.push_at(id, now);
        }
        assert_eq!(window.len(), CAPACITY);
        assert!((0..44).all(|id| !window.contains(id)));
        assert!((44..300).all(|id| window.contains(id)));
    }
}
