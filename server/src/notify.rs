//! Fire-and-forget audio/visual cues. Nothing depends on a cue arriving.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cue", rename_all = "snake_case")]
pub enum Cue {
    /// A message arrived in a room the agent does not have open.
    #[serde(rename_all = "camelCase")]
    InboundMessage {
        agent_id: String,
        room_id: String,
        message_id: String,
    },
    /// A room started waiting and the listed agents may claim it.
    #[serde(rename_all = "camelCase")]
    RoomWaiting {
        room_id: String,
        agent_ids: Vec<String>,
    },
    /// The visitor may now be offered a human agent.
    #[serde(rename_all = "camelCase")]
    HandoffAvailable { room_id: String },
    #[serde(rename_all = "camelCase")]
    RoomTransferred {
        room_id: String,
        from_agent_id: String,
        to_agent_id: String,
    },
}

impl Cue {
    /// Agents this cue is meant for. Empty means the room's visitor.
    pub fn agent_ids(&self) -> Vec<&str> {
        match self {
            Cue::InboundMessage { agent_id, .. } => vec![agent_id.as_str()],
            Cue::RoomWaiting { agent_ids, .. } => agent_ids.iter().map(String::as_str).collect(),
            Cue::HandoffAvailable { .. } => vec![],
            Cue::RoomTransferred { to_agent_id, .. } => vec![to_agent_id.as_str()],
        }
    }
}

pub trait Notifier: Send + Sync {
    fn cue(&self, cue: Cue);
}

/// Publishes cues on a broadcast channel; transports subscribe and forward.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Cue>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Cue> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn cue(&self, cue: Cue) {
        tracing::debug!(?cue, "cue");
        // no listeners is fine
        let _ = self.tx.send(cue);
    }
}
