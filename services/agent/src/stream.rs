//! Decision Stream
//!
//! Append-only, totally ordered sequence of emitted decisions. Observers
//! subscribe through a broadcast channel; a bounded replay buffer serves
//! the state query. Ordering is `(cycle_number, seq)` and strictly
//! increases; a duplicate decision id is refused rather than emitted.

use std::collections::{HashSet, VecDeque};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use types::{AgentError, Decision, Result};

/// Replay/history buffer depth.
const HISTORY_DEPTH: usize = 256;

/// Broadcast capacity; slow observers miss old decisions rather than
/// blocking the loop.
const CHANNEL_CAPACITY: usize = 64;

pub struct DecisionStream {
    tx: broadcast::Sender<Decision>,
    history: RwLock<VecDeque<Decision>>,
    order: Mutex<OrderState>,
}

#[derive(Debug, Default)]
struct OrderState {
    last: Option<(u64, u32)>,
    current_cycle: u64,
    next_seq: u32,
    emitted_ids: HashSet<Uuid>,
}

impl DecisionStream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_DEPTH)),
            order: Mutex::new(OrderState::default()),
        }
    }

    /// Assign the per-cycle sequence number and emit. Fails without
    /// emitting on a duplicate id or an ordering violation; the caller
    /// drops the decision and re-evaluates next cycle.
    pub fn emit(&self, mut decision: Decision) -> Result<Decision> {
        {
            let mut order = self.order.lock();

            if order.emitted_ids.contains(&decision.id) {
                return Err(AgentError::Invariant(format!(
                    "duplicate decision id {} on stream",
                    decision.id
                )));
            }

            if decision.cycle_number != order.current_cycle {
                order.current_cycle = decision.cycle_number;
                order.next_seq = 0;
            }
            decision.seq = order.next_seq;

            let key = (decision.cycle_number, decision.seq);
            if let Some(last) = order.last {
                if key <= last {
                    return Err(AgentError::Invariant(format!(
                        "decision stream ordering violated: {key:?} after {last:?}"
                    )));
                }
            }

            order.next_seq += 1;
            order.last = Some(key);
            order.emitted_ids.insert(decision.id);
        }

        {
            let mut history = self.history.write();
            history.push_back(decision.clone());
            while history.len() > HISTORY_DEPTH {
                history.pop_front();
            }
        }

        // No receivers is fine; the history buffer still records it.
        let receivers = self.tx.receiver_count();
        if receivers > 0 {
            let _ = self.tx.send(decision.clone());
        }
        debug!(
            decision_id = %decision.id,
            cycle = decision.cycle_number,
            seq = decision.seq,
            kind = ?decision.decision_type,
            "decision emitted"
        );
        Ok(decision)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Decision> {
        self.tx.subscribe()
    }

    /// Most recent `n` decisions, newest last.
    pub fn recent(&self, n: usize) -> Vec<Decision> {
        let history = self.history.read();
        history.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn emitted_count(&self) -> usize {
        self.order.lock().emitted_ids.len()
    }
}

impl Default for DecisionStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use types::PoolId;

    fn decision(cycle: u64) -> Decision {
        Decision::hold(cycle, Utc::now(), "pos-1", PoolId::from("p1"), "test")
    }

    #[test]
    fn sequence_numbers_restart_per_cycle() {
        let stream = DecisionStream::new();
        let a = stream.emit(decision(1)).unwrap();
        let b = stream.emit(decision(1)).unwrap();
        let c = stream.emit(decision(2)).unwrap();
        assert_eq!((a.cycle_number, a.seq), (1, 0));
        assert_eq!((b.cycle_number, b.seq), (1, 1));
        assert_eq!((c.cycle_number, c.seq), (2, 0));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let stream = DecisionStream::new();
        let d = decision(1);
        let emitted = stream.emit(d.clone()).unwrap();
        let result = stream.emit(emitted);
        assert!(matches!(result, Err(AgentError::Invariant(_))));
        assert_eq!(stream.emitted_count(), 1);
    }

    #[test]
    fn cycle_numbers_cannot_regress() {
        let stream = DecisionStream::new();
        stream.emit(decision(5)).unwrap();
        let result = stream.emit(decision(4));
        assert!(matches!(result, Err(AgentError::Invariant(_))));
    }

    #[tokio::test]
    async fn subscribers_receive_emissions() {
        let stream = DecisionStream::new();
        let mut rx = stream.subscribe();
        let emitted = stream.emit(decision(1)).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, emitted.id);
    }

    #[test]
    fn recent_returns_newest_last() {
        let stream = DecisionStream::new();
        for _ in 0..3 {
            stream.emit(decision(1)).unwrap();
        }
        let recent = stream.recent(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].seq < recent[1].seq);
    }
}
