//! Staff-to-staff messaging.
//!
//! Staff conversations have no room record; they are message collections
//! keyed by the sorted participant pair, or the shared broadcast room. They
//! are never torn down.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::message_log;
use crate::roster;
use crate::types::{AppState, ChatMessage, MessageDraft};

/// The shared room every agent watches.
pub const BROADCAST_ROOM: &str = "staff-general";

const PAIR_SEPARATOR: &str = "__";

/// One room per unordered pair of agents.
pub fn pair_room_id(a: &str, b: &str) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}{PAIR_SEPARATOR}{high}")
}

/// Agent ids end up inside pair room keys, so they may not contain the
/// separator or name the broadcast room.
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.trim().is_empty() && !agent_id.contains(PAIR_SEPARATOR) && agent_id != BROADCAST_ROOM
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

impl Recipient {
    pub fn from_option(agent_id: Option<&str>) -> Self {
        match agent_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self::Agent(id.to_string()),
            None => Self::Broadcast,
        }
    }

    pub fn room_id(&self, sender_id: &str) -> String {
        match self {
            Self::Agent(other) => pair_room_id(sender_id, other),
            Self::Broadcast => BROADCAST_ROOM.to_string(),
        }
    }
}

pub async fn send_staff_message(
    state: &Arc<AppState>,
    sender_id: &str,
    recipient: &Recipient,
    text: &str,
) -> Result<ChatMessage> {
    let sender = roster::get_agent(state, sender_id).await?;
    if let Recipient::Agent(other) = recipient {
        if other == sender_id {
            return Err(CoreError::precondition(
                &recipient.room_id(sender_id),
                "cannot message yourself",
            ));
        }
        roster::get_agent(state, other).await?;
    }
    let room_id = recipient.room_id(sender_id);
    message_log::append(
        state.store.as_ref(),
        &room_id,
        MessageDraft::text(&sender.id, &sender.name, text),
    )
    .await
}

pub async fn staff_history(
    state: &Arc<AppState>,
    agent_id: &str,
    recipient: &Recipient,
) -> Result<Vec<ChatMessage>> {
    message_log::history(state.store.as_ref(), &recipient.room_id(agent_id)).await
}
