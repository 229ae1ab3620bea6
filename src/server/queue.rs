use std::collections::VecDeque;

use crate::models::ConnId;

/// FIFO matchmaking queue of waiting connections. Pairing is strict
/// arrival order; the only exception is that a popped entry whose socket
/// has since gone away is discarded, with its would-be partner reinserted
/// at the front so it keeps its place in line.
#[derive(Debug, Default)]
pub struct MatchQueue {
    waiting: VecDeque<ConnId>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.waiting.contains(&conn)
    }

    /// Append unless already queued. Returns whether anything changed.
    pub fn enqueue(&mut self, conn: ConnId) -> bool {
        if self.contains(conn) {
            return false;
        }
        self.waiting.push_back(conn);
        true
    }

    /// Remove if present; no-op otherwise.
    pub fn cancel(&mut self, conn: ConnId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|waiting| *waiting != conn);
        self.waiting.len() != before
    }

    /// Pop the two oldest entries that are still reachable. The first of
    /// the returned pair is the older one.
    pub fn take_pair(&mut self, mut reachable: impl FnMut(ConnId) -> bool) -> Option<(ConnId, ConnId)> {
        while self.waiting.len() >= 2 {
            let first = match self.waiting.pop_front() {
                Some(conn) => conn,
                None => break,
            };
            let second = match self.waiting.pop_front() {
                Some(conn) => conn,
                None => {
                    self.waiting.push_front(first);
                    break;
                }
            };
            match (reachable(first), reachable(second)) {
                (true, true) => return Some((first, second)),
                (true, false) => self.waiting.push_front(first),
                (false, true) => self.waiting.push_front(second),
                (false, false) => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn conns(n: usize) -> Vec<ConnId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn pairs_in_strict_fifo_order() {
        let mut queue = MatchQueue::new();
        let c = conns(4);
        for conn in &c {
            queue.enqueue(*conn);
        }
        assert_eq!(queue.take_pair(|_| true), Some((c[0], c[1])));
        assert_eq!(queue.take_pair(|_| true), Some((c[2], c[3])));
        assert_eq!(queue.take_pair(|_| true), None);
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut queue = MatchQueue::new();
        let c = conns(1);
        assert!(queue.enqueue(c[0]));
        assert!(!queue.enqueue(c[0]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_removes_only_the_target() {
        let mut queue = MatchQueue::new();
        let c = conns(3);
        for conn in &c {
            queue.enqueue(*conn);
        }
        assert!(queue.cancel(c[1]));
        assert!(!queue.cancel(c[1]));
        assert_eq!(queue.take_pair(|_| true), Some((c[0], c[2])));
    }

    #[test]
    fn unreachable_entry_is_discarded_and_partner_keeps_priority() {
        let mut queue = MatchQueue::new();
        let c = conns(3);
        for conn in &c {
            queue.enqueue(*conn);
        }
        // c[0] went away before pairing; c[1] must stay at the front
        let pair = queue.take_pair(|conn| conn != c[0]);
        assert_eq!(pair, Some((c[1], c[2])));
        assert!(queue.is_empty());
    }

    #[test]
    fn lone_survivor_waits_for_the_next_arrival() {
        let mut queue = MatchQueue::new();
        let c = conns(2);
        queue.enqueue(c[0]);
        queue.enqueue(c[1]);
        assert_eq!(queue.take_pair(|conn| conn != c[0]), None);
        assert_eq!(queue.len(), 1);

        let late = Uuid::new_v4();
        queue.enqueue(late);
        assert_eq!(queue.take_pair(|_| true), Some((c[1], late)));
    }
}
