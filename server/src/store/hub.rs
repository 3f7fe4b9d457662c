use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{watch, Mutex};

use crate::types::{AgentProfile, ChatMessage, Room};

/// A live view onto a store collection.
///
/// The first call to [`Subscription::next`] yields the snapshot current at
/// subscribe time; every later call waits for the next change and yields the
/// whole collection again. Dropping the handle releases the subscription.
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
    primed: bool,
    _guard: SubscriptionGuard,
}

impl<T: Clone> Subscription<T> {
    fn new(rx: watch::Receiver<T>, active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            rx,
            primed: false,
            _guard: SubscriptionGuard {
                active: active.clone(),
            },
        }
    }

    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// `None` once the collection has been torn down.
    pub async fn next(&mut self) -> Option<T> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

struct SubscriptionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fans store changes out to subscribers as full snapshots.
///
/// Store implementations call the `publish_*` methods after each mutation
/// with the fresh collection; the hub only delivers when something changed.
pub struct SnapshotHub {
    room_messages: Mutex<HashMap<String, watch::Sender<Vec<ChatMessage>>>>,
    rooms: watch::Sender<Vec<Room>>,
    agents: watch::Sender<Vec<AgentProfile>>,
    active: Arc<AtomicUsize>,
}

impl Default for SnapshotHub {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl SnapshotHub {
    pub fn new(rooms: Vec<Room>, agents: Vec<AgentProfile>) -> Self {
        Self {
            room_messages: Mutex::new(HashMap::new()),
            rooms: watch::Sender::new(rooms),
            agents: watch::Sender::new(agents),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Subscribe to a room's messages, seeding the channel with `snapshot` if
    /// nobody is watching the room yet.
    pub async fn subscribe_messages(
        &self,
        room_id: &str,
        snapshot: Vec<ChatMessage>,
    ) -> Subscription<Vec<ChatMessage>> {
        let mut channels = self.room_messages.lock().await;
        let sender = channels
            .entry(room_id.to_string())
            .or_insert_with(|| watch::Sender::new(snapshot));
        Subscription::new(sender.subscribe(), &self.active)
    }

    /// Whether anyone currently watches the room's messages.
    pub async fn is_watched(&self, room_id: &str) -> bool {
        let channels = self.room_messages.lock().await;
        channels
            .get(room_id)
            .map(|sender| sender.receiver_count() > 0)
            .unwrap_or(false)
    }

    pub async fn watched_rooms(&self) -> Vec<String> {
        let channels = self.room_messages.lock().await;
        channels
            .iter()
            .filter(|(_, sender)| sender.receiver_count() > 0)
            .map(|(room_id, _)| room_id.clone())
            .collect()
    }

    pub async fn publish_messages(&self, room_id: &str, snapshot: Vec<ChatMessage>) {
        let mut channels = self.room_messages.lock().await;
        let Some(sender) = channels.get(room_id) else {
            return;
        };
        if sender.receiver_count() == 0 {
            channels.remove(room_id);
            return;
        }
        publish_if_changed(sender, snapshot);
    }

    /// Deliver a final empty snapshot and close the room's channel.
    pub async fn close_messages(&self, room_id: &str) {
        let mut channels = self.room_messages.lock().await;
        if let Some(sender) = channels.remove(room_id) {
            publish_if_changed(&sender, Vec::new());
        }
    }

    pub fn subscribe_rooms(&self) -> Subscription<Vec<Room>> {
        Subscription::new(self.rooms.subscribe(), &self.active)
    }

    pub fn publish_rooms(&self, snapshot: Vec<Room>) {
        publish_if_changed(&self.rooms, snapshot);
    }

    pub fn subscribe_agents(&self) -> Subscription<Vec<AgentProfile>> {
        Subscription::new(self.agents.subscribe(), &self.active)
    }

    pub fn publish_agents(&self, snapshot: Vec<AgentProfile>) {
        publish_if_changed(&self.agents, snapshot);
    }
}

fn publish_if_changed<T: PartialEq>(sender: &watch::Sender<T>, snapshot: T) {
    sender.send_if_modified(|current| {
        if *current == snapshot {
            false
        } else {
            *current = snapshot;
            true
        }
    });
}
