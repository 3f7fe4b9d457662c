//! Document store boundary.
//!
//! The messaging core never talks to a database directly. Everything it needs
//! (point writes, ordered appends, conditional updates and live snapshots) goes
//! through [`DocumentStore`], so the backing engine can be swapped without
//! touching the session state machine.

mod hub;
mod memory;
mod postgres;

use async_trait::async_trait;

pub use hub::{SnapshotHub, Subscription};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreResult;
use crate::types::{AgentProfile, ChatMessage, MessageDraft, Room};

/// Result of a conditional room update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; carries the room as stored, with its new version.
    Applied(Room),
    /// The stored version no longer matched. Carries the current room, or
    /// `None` when it was deleted in the meantime.
    Conflict(Option<Room>),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new room. Fails with `AlreadyExists` if the id is taken and
    /// with `PartyHasOpenRoom` if the party already has a room that is not
    /// closed. Both checks are atomic with the insert.
    async fn insert_room(&self, room: &Room) -> StoreResult<()>;

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>>;

    async fn list_rooms(&self) -> StoreResult<Vec<Room>>;

    /// Replace the room record only if its stored version still equals
    /// `expected_version`. All status/assignment fields change together.
    async fn compare_and_swap_room(
        &self,
        room: &Room,
        expected_version: u64,
    ) -> StoreResult<CasOutcome>;

    async fn delete_room(&self, room_id: &str) -> StoreResult<()>;

    /// Append to the room's message collection. The store assigns `id` and a
    /// monotonically increasing `seq`.
    async fn append_message(&self, room_id: &str, draft: MessageDraft) -> StoreResult<ChatMessage>;

    /// All messages of a room, in log order.
    async fn messages(&self, room_id: &str) -> StoreResult<Vec<ChatMessage>>;

    /// Add `reader_id` to a message's read set. Returns whether it changed.
    async fn mark_read(&self, room_id: &str, message_id: &str, reader_id: &str)
        -> StoreResult<bool>;

    async fn purge_messages(&self, room_id: &str) -> StoreResult<()>;

    async fn put_agent(&self, agent: &AgentProfile) -> StoreResult<()>;

    async fn remove_agent(&self, agent_id: &str) -> StoreResult<()>;

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentProfile>>;

    async fn list_agents(&self) -> StoreResult<Vec<AgentProfile>>;

    /// Full ordered message snapshot of one room, re-delivered on every change.
    async fn subscribe_messages(&self, room_id: &str) -> StoreResult<Subscription<Vec<ChatMessage>>>;

    async fn subscribe_rooms(&self) -> StoreResult<Subscription<Vec<Room>>>;

    async fn subscribe_agents(&self) -> StoreResult<Subscription<Vec<AgentProfile>>>;

    /// Number of live subscription handles.
    fn active_subscriptions(&self) -> usize;
}
