//! Consecutive bot-failure counting and the derived hand-off affordance.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::{BotOutcome, ChatMessage, Room};

/// Failures in a row before a human can be offered.
pub const HANDOFF_THRESHOLD: u32 = 2;

/// `counter ≥ threshold` while nobody has been requested or assigned yet.
pub fn can_offer_handoff(counter: u32, room: &Room) -> bool {
    counter >= HANDOFF_THRESHOLD
        && !room.state.is_closed()
        && !room.waiting_for_agent()
        && !room.agent_accepted()
}

/// Trailing run of failed bot answers in a message log. A successful answer
/// or a welcome ends the run.
pub fn count_from_history(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .rev()
        .filter_map(|message| message.bot_outcome)
        .take_while(|outcome| *outcome == BotOutcome::Failed)
        .count() as u32
}

/// Process-local counters, one per room. Losing them is harmless: they can be
/// rebuilt from the log with [`EscalationCoordinator::recompute`].
#[derive(Default)]
pub struct EscalationCoordinator {
    counters: Mutex<HashMap<String, u32>>,
}

impl EscalationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self, room_id: &str) -> u32 {
        self.counters
            .lock()
            .await
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the new count.
    pub async fn record_failure(&self, room_id: &str) -> u32 {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(room_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub async fn record_success(&self, room_id: &str) {
        self.reset(room_id).await;
    }

    pub async fn reset(&self, room_id: &str) {
        self.counters.lock().await.insert(room_id.to_string(), 0);
    }

    /// Drop all state for a torn-down room.
    pub async fn forget(&self, room_id: &str) {
        self.counters.lock().await.remove(room_id);
    }

    pub async fn recompute(&self, room_id: &str, messages: &[ChatMessage]) -> u32 {
        let count = count_from_history(messages);
        self.counters.lock().await.insert(room_id.to_string(), count);
        count
    }

    pub async fn can_offer_handoff(&self, room: &Room) -> bool {
        can_offer_handoff(self.count(&room.id).await, room)
    }

    pub async fn tracked_rooms(&self) -> usize {
        self.counters.lock().await.len()
    }
}
