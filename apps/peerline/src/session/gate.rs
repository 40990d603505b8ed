use std::collections::VecDeque;

use crate::ice::IceCandidate;

/// Holds outbound candidates until the offer/answer exchange is complete,
/// then releases them in discovery order.
#[derive(Debug, Default)]
pub struct CandidateGate {
    open: bool,
    pending: VecDeque<IceCandidate>,
}

impl CandidateGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues `candidate`; while the gate is open the whole queue is
    /// returned for sending.
    pub fn offer(&mut self, candidate: IceCandidate) -> Vec<IceCandidate> {
        self.pending.push_back(candidate);
        if self.open { self.drain() } else { Vec::new() }
    }

    /// Opens the gate and returns everything queued so far.
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.drain()
    }

    pub fn clear(&mut self) {
        self.open = false;
        self.pending.clear();
    }

    fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"))
    }

    #[test]
    fn holds_until_open_then_preserves_order() {
        let mut gate = CandidateGate::new();
        assert!(gate.offer(candidate(1)).is_empty());
        assert!(gate.offer(candidate(2)).is_empty());
        assert!(gate.offer(candidate(3)).is_empty());
        assert_eq!(gate.pending_len(), 3);

        assert_eq!(gate.open(), vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(gate.offer(candidate(4)), vec![candidate(4)]);
        assert_eq!(gate.pending_len(), 0);
    }

    #[test]
    fn clear_discards_and_closes() {
        let mut gate = CandidateGate::new();
        gate.open();
        gate.clear();
        assert!(!gate.is_open());
        assert!(gate.offer(candidate(1)).is_empty());
    }
}
