//! Per-room ordered message log.

use std::future::Future;

use crate::error::{CoreError, Result};
use crate::store::{DocumentStore, Subscription};
use crate::types::{ChatMessage, MessageDraft, MessageType, now_millis};

/// Log order: client timestamp, then store insertion order.
pub fn order_messages(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
}

/// Append without looking at the room record. Text messages must carry
/// something other than whitespace.
pub async fn append(
    store: &dyn DocumentStore,
    room_id: &str,
    draft: MessageDraft,
) -> Result<ChatMessage> {
    if draft.kind == MessageType::Text && draft.payload.trim().is_empty() {
        return Err(CoreError::EmptyMessage);
    }
    let message = store.append_message(room_id, draft).await?;
    tracing::debug!(room_id, message_id = %message.id, seq = message.seq, "message appended");
    Ok(message)
}

/// Append to a visitor room, refusing rooms that are gone or closed.
pub async fn append_to_open_room(
    store: &dyn DocumentStore,
    room_id: &str,
    draft: MessageDraft,
) -> Result<ChatMessage> {
    let Some(room) = store.get_room(room_id).await? else {
        return Err(CoreError::RoomNotFound(room_id.to_string()));
    };
    if room.state.is_closed() {
        return Err(CoreError::RoomClosed(room_id.to_string()));
    }
    append(store, room_id, draft).await
}

/// Append an image/audio/file message once `payload` has produced its
/// reference. Nothing is written if the payload fails to resolve, and the
/// message is timestamped when the reference is ready.
pub async fn append_attachment<F>(
    store: &dyn DocumentStore,
    room_id: &str,
    sender_id: &str,
    sender_name: &str,
    kind: MessageType,
    payload: F,
) -> Result<ChatMessage>
where
    F: Future<Output = std::result::Result<String, String>> + Send,
{
    if !kind.is_attachment() {
        return Err(CoreError::Attachment(format!(
            "{kind:?} is not an attachment type"
        )));
    }
    let reference = payload.await.map_err(CoreError::Attachment)?;
    if reference.trim().is_empty() {
        return Err(CoreError::Attachment("empty payload reference".to_string()));
    }
    let draft = MessageDraft {
        sender_id: sender_id.to_string(),
        sender_name: sender_name.to_string(),
        kind,
        created_at: now_millis(),
        payload: reference,
        bot_outcome: None,
    };
    append_to_open_room(store, room_id, draft).await
}

pub async fn history(store: &dyn DocumentStore, room_id: &str) -> Result<Vec<ChatMessage>> {
    Ok(store.messages(room_id).await?)
}

pub async fn subscribe(
    store: &dyn DocumentStore,
    room_id: &str,
) -> Result<Subscription<Vec<ChatMessage>>> {
    Ok(store.subscribe_messages(room_id).await?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUpdate {
    pub messages: Vec<ChatMessage>,
    /// A message the consumer has not rendered yet became the newest one.
    pub scroll_to_latest: bool,
}

/// Consumer side of a room subscription. Snapshots may arrive in any shape;
/// the feed always re-sorts and only asks to scroll when the tail moved.
#[derive(Debug, Default)]
pub struct RoomFeed {
    latest_id: Option<String>,
}

impl RoomFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, mut snapshot: Vec<ChatMessage>) -> FeedUpdate {
        order_messages(&mut snapshot);
        let latest = snapshot.last().map(|m| m.id.clone());
        let scroll_to_latest = latest.is_some() && latest != self.latest_id;
        self.latest_id = latest;
        FeedUpdate {
            messages: snapshot,
            scroll_to_latest,
        }
    }
}
