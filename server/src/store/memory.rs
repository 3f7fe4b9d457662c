use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CasOutcome, DocumentStore, SnapshotHub, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::message_log::order_messages;
use crate::types::{AgentProfile, ChatMessage, MessageDraft, Room};

#[derive(Default)]
struct MemoryData {
    rooms: HashMap<String, Room>,
    messages: HashMap<String, Vec<ChatMessage>>,
    agents: BTreeMap<String, AgentProfile>,
    next_seq: u64,
}

impl MemoryData {
    fn room_list(&self) -> Vec<Room> {
        let mut rooms = self.rooms.values().cloned().collect::<Vec<_>>();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rooms
    }

    fn ordered_messages(&self, room_id: &str) -> Vec<ChatMessage> {
        let mut messages = self.messages.get(room_id).cloned().unwrap_or_default();
        order_messages(&mut messages);
        messages
    }

    fn agent_list(&self) -> Vec<AgentProfile> {
        self.agents.values().cloned().collect()
    }
}

/// In-process document store. Every mutation publishes while still holding
/// the data lock, so a subscriber never misses a change made after it joined.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
    hub: SnapshotHub,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away; every call fails until it comes back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_room(&self, room: &Room) -> StoreResult<()> {
        self.check_online()?;
        let mut data = self.data.write().await;
        if data.rooms.contains_key(&room.id) {
            return Err(StoreError::AlreadyExists {
                entity: "room",
                id: room.id.clone(),
            });
        }
        if data
            .rooms
            .values()
            .any(|other| other.party_id == room.party_id && !other.state.is_closed())
        {
            return Err(StoreError::PartyHasOpenRoom {
                party_id: room.party_id.clone(),
            });
        }
        data.rooms.insert(room.id.clone(), room.clone());
        self.hub.publish_rooms(data.room_list());
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(data.rooms.get(room_id).cloned())
    }

    async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(data.room_list())
    }

    async fn compare_and_swap_room(
        &self,
        room: &Room,
        expected_version: u64,
    ) -> StoreResult<CasOutcome> {
        self.check_online()?;
        let mut data = self.data.write().await;
        let Some(current) = data.rooms.get(&room.id) else {
            return Ok(CasOutcome::Conflict(None));
        };
        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(Some(current.clone())));
        }
        let mut stored = room.clone();
        stored.version = expected_version + 1;
        data.rooms.insert(stored.id.clone(), stored.clone());
        self.hub.publish_rooms(data.room_list());
        Ok(CasOutcome::Applied(stored))
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<()> {
        self.check_online()?;
        let mut data = self.data.write().await;
        if data.rooms.remove(room_id).is_some() {
            self.hub.publish_rooms(data.room_list());
        }
        Ok(())
    }

    async fn append_message(&self, room_id: &str, draft: MessageDraft) -> StoreResult<ChatMessage> {
        self.check_online()?;
        let mut data = self.data.write().await;
        data.next_seq += 1;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            seq: data.next_seq,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            kind: draft.kind,
            created_at: draft.created_at,
            payload: draft.payload,
            read_by: Default::default(),
            bot_outcome: draft.bot_outcome,
        };
        data.messages
            .entry(room_id.to_string())
            .or_default()
            .push(message.clone());
        self.hub
            .publish_messages(room_id, data.ordered_messages(room_id))
            .await;
        Ok(message)
    }

    async fn messages(&self, room_id: &str) -> StoreResult<Vec<ChatMessage>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(data.ordered_messages(room_id))
    }

    async fn mark_read(
        &self,
        room_id: &str,
        message_id: &str,
        reader_id: &str,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let mut data = self.data.write().await;
        let changed = data
            .messages
            .get_mut(room_id)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .map(|message| message.read_by.insert(reader_id.to_string()))
            .unwrap_or(false);
        if changed {
            self.hub
                .publish_messages(room_id, data.ordered_messages(room_id))
                .await;
        }
        Ok(changed)
    }

    async fn purge_messages(&self, room_id: &str) -> StoreResult<()> {
        self.check_online()?;
        let mut data = self.data.write().await;
        data.messages.remove(room_id);
        self.hub.close_messages(room_id).await;
        Ok(())
    }

    async fn put_agent(&self, agent: &AgentProfile) -> StoreResult<()> {
        self.check_online()?;
        let mut data = self.data.write().await;
        data.agents.insert(agent.id.clone(), agent.clone());
        self.hub.publish_agents(data.agent_list());
        Ok(())
    }

    async fn remove_agent(&self, agent_id: &str) -> StoreResult<()> {
        self.check_online()?;
        let mut data = self.data.write().await;
        if data.agents.remove(agent_id).is_some() {
            self.hub.publish_agents(data.agent_list());
        }
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentProfile>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(data.agents.get(agent_id).cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentProfile>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(data.agent_list())
    }

    async fn subscribe_messages(&self, room_id: &str) -> StoreResult<Subscription<Vec<ChatMessage>>> {
        self.check_online()?;
        let data = self.data.read().await;
        Ok(self
            .hub
            .subscribe_messages(room_id, data.ordered_messages(room_id))
            .await)
    }

    async fn subscribe_rooms(&self) -> StoreResult<Subscription<Vec<Room>>> {
        self.check_online()?;
        let _data = self.data.read().await;
        Ok(self.hub.subscribe_rooms())
    }

    async fn subscribe_agents(&self) -> StoreResult<Subscription<Vec<AgentProfile>>> {
        self.check_online()?;
        let _data = self.data.read().await;
        Ok(self.hub.subscribe_agents())
    }

    fn active_subscriptions(&self) -> usize {
        self.hub.active()
    }
}
