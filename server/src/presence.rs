//! Unread tracking for one agent across every room it could be party to.
//!
//! [`FanoutTracker`] keeps one live message subscription per watched room:
//! the broadcast room, one pair room per other agent on the roster, and any
//! visitor room the agent holds. A roster task follows the agent and room
//! lists and starts or releases watches as membership changes.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};

use crate::error::{Result, StoreResult};
use crate::notify::{Cue, Notifier};
use crate::staff::{pair_room_id, BROADCAST_ROOM};
use crate::store::{DocumentStore, Subscription};
use crate::types::{AgentProfile, ChatMessage, Room};

pub type UnreadSet = BTreeSet<String>;

/// Unread strategy seen by the transport. The fan-out below is one
/// implementation; a store-maintained unread view could be another.
#[async_trait]
pub trait UnreadTracker: Send + Sync {
    /// Focus a room. Clears its unread flag for this agent only and adds the
    /// agent to `read_by` of messages from others.
    async fn open_room(&self, room_id: &str) -> Result<()>;

    fn unfocus(&self);

    fn unread_rooms(&self) -> UnreadSet;

    fn subscribe_unread(&self) -> watch::Receiver<UnreadSet>;

    fn watched_rooms(&self) -> Vec<String>;

    /// Release every subscription held for this agent.
    async fn shutdown(&self);
}

/// Rooms `agent_id` should watch given the current roster and rooms. An
/// agent that is no longer on the roster watches nothing.
pub fn wanted_rooms(agent_id: &str, agents: &[AgentProfile], rooms: &[Room]) -> BTreeSet<String> {
    if !agents.iter().any(|agent| agent.id == agent_id) {
        return BTreeSet::new();
    }
    let mut wanted = BTreeSet::from([BROADCAST_ROOM.to_string()]);
    wanted.extend(
        agents
            .iter()
            .filter(|agent| agent.id != agent_id)
            .map(|agent| pair_room_id(agent_id, &agent.id)),
    );
    wanted.extend(
        rooms
            .iter()
            .filter(|room| room.assigned_to() == Some(agent_id))
            .map(|room| room.id.clone()),
    );
    wanted
}

/// The newest message is someone else's, the room is not open, and the agent
/// has not read it.
pub fn is_unread(agent_id: &str, focused: bool, latest: Option<&ChatMessage>) -> bool {
    latest.is_some_and(|message| {
        !focused && message.sender_id != agent_id && !message.read_by.contains(agent_id)
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    agent_id: String,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    focused: Mutex<Option<String>>,
    unread: watch::Sender<UnreadSet>,
    /// Last message id cued per room, so redelivered snapshots stay quiet.
    last_cued: Mutex<HashMap<String, String>>,
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Shared {
    fn is_focused(&self, room_id: &str) -> bool {
        lock(&self.focused).as_deref() == Some(room_id)
    }

    fn set_unread(&self, room_id: &str, unread: bool) {
        self.unread.send_if_modified(|set| {
            if unread {
                set.insert(room_id.to_string())
            } else {
                set.remove(room_id)
            }
        });
    }

    async fn evaluate(&self, room_id: &str, snapshot: &[ChatMessage]) {
        if self.is_focused(room_id) {
            self.mark_read(room_id, snapshot).await;
        }
        let latest = snapshot.last();
        // focus is read and the flag written under one lock, as in `open_room`
        let unread = {
            let focused = lock(&self.focused);
            let unread = is_unread(&self.agent_id, focused.as_deref() == Some(room_id), latest);
            self.set_unread(room_id, unread);
            unread
        };

        let Some(latest) = latest.filter(|_| unread) else {
            return;
        };
        let fresh = {
            let mut cued = lock(&self.last_cued);
            match cued.get(room_id) {
                Some(id) if *id == latest.id => false,
                _ => {
                    cued.insert(room_id.to_string(), latest.id.clone());
                    true
                }
            }
        };
        if fresh {
            self.notifier.cue(Cue::InboundMessage {
                agent_id: self.agent_id.clone(),
                room_id: room_id.to_string(),
                message_id: latest.id.clone(),
            });
        }
    }

    async fn mark_read(&self, room_id: &str, messages: &[ChatMessage]) {
        let pending = messages
            .iter()
            .filter(|m| m.sender_id != self.agent_id && !m.read_by.contains(&self.agent_id));
        for message in pending {
            if let Err(err) = self
                .store
                .mark_read(room_id, &message.id, &self.agent_id)
                .await
            {
                tracing::warn!(room_id, agent_id = %self.agent_id, "mark read failed: {}", err);
                return;
            }
        }
    }

    /// Start watches for rooms in `wanted` and release the rest.
    async fn sync(self: &Arc<Self>, wanted: &BTreeSet<String>) -> StoreResult<()> {
        let (stale, missing) = {
            let watches = lock(&self.watches);
            let stale = watches
                .keys()
                .filter(|room_id| !wanted.contains(*room_id))
                .cloned()
                .collect::<Vec<_>>();
            let missing = wanted
                .iter()
                .filter(|room_id| !watches.contains_key(*room_id))
                .cloned()
                .collect::<Vec<_>>();
            (stale, missing)
        };

        for room_id in stale {
            let handle = lock(&self.watches).remove(&room_id);
            if let Some(handle) = handle {
                handle.abort();
                let _ = handle.await;
            }
            self.set_unread(&room_id, false);
            lock(&self.last_cued).remove(&room_id);
            tracing::debug!(agent_id = %self.agent_id, room_id = %room_id, "stopped watching room");
        }

        for room_id in missing {
            let subscription = self.store.subscribe_messages(&room_id).await?;
            let handle = tokio::spawn(watch_room(self.clone(), room_id.clone(), subscription));
            lock(&self.watches).insert(room_id.clone(), handle);
            tracing::debug!(agent_id = %self.agent_id, room_id = %room_id, "watching room");
        }
        Ok(())
    }

    fn abort_watches(&self) -> Vec<JoinHandle<()>> {
        let handles = lock(&self.watches)
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        for handle in &handles {
            handle.abort();
        }
        handles
    }
}

async fn watch_room(
    shared: Arc<Shared>,
    room_id: String,
    mut subscription: Subscription<Vec<ChatMessage>>,
) {
    while let Some(snapshot) = subscription.next().await {
        shared.evaluate(&room_id, &snapshot).await;
    }
    // the room's log was torn down
    shared.set_unread(&room_id, false);
}

async fn track_roster(
    shared: Arc<Shared>,
    mut agents: Subscription<Vec<AgentProfile>>,
    mut rooms: Subscription<Vec<Room>>,
    mut latest_agents: Vec<AgentProfile>,
    mut latest_rooms: Vec<Room>,
) {
    loop {
        tokio::select! {
            next = agents.next() => match next {
                Some(list) => latest_agents = list,
                None => break,
            },
            next = rooms.next() => match next {
                Some(list) => latest_rooms = list,
                None => break,
            },
        }
        let wanted = wanted_rooms(&shared.agent_id, &latest_agents, &latest_rooms);
        if let Err(err) = shared.sync(&wanted).await {
            tracing::warn!(agent_id = %shared.agent_id, "could not update room watches: {}", err);
        }
    }
}

pub struct FanoutTracker {
    shared: Arc<Shared>,
    roster_task: Mutex<Option<JoinHandle<()>>>,
}

impl FanoutTracker {
    pub async fn start(
        agent_id: &str,
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let mut agents = store.subscribe_agents().await?;
        let mut rooms = store.subscribe_rooms().await?;
        let latest_agents = agents.next().await.unwrap_or_default();
        let latest_rooms = rooms.next().await.unwrap_or_default();

        let shared = Arc::new(Shared {
            agent_id: agent_id.to_string(),
            store,
            notifier,
            focused: Mutex::new(None),
            unread: watch::Sender::new(UnreadSet::new()),
            last_cued: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        });

        let wanted = wanted_rooms(agent_id, &latest_agents, &latest_rooms);
        if let Err(err) = shared.sync(&wanted).await {
            shared.abort_watches();
            return Err(err.into());
        }
        tracing::info!(agent_id, rooms = wanted.len(), "unread tracking started");

        let task = tokio::spawn(track_roster(
            shared.clone(),
            agents,
            rooms,
            latest_agents,
            latest_rooms,
        ));
        Ok(Self {
            shared,
            roster_task: Mutex::new(Some(task)),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }
}

#[async_trait]
impl UnreadTracker for FanoutTracker {
    async fn open_room(&self, room_id: &str) -> Result<()> {
        {
            let mut focused = lock(&self.shared.focused);
            *focused = Some(room_id.to_string());
            self.shared.set_unread(room_id, false);
        }
        let messages = self.shared.store.messages(room_id).await?;
        self.shared.mark_read(room_id, &messages).await;
        Ok(())
    }

    fn unfocus(&self) {
        *lock(&self.shared.focused) = None;
    }

    fn unread_rooms(&self) -> UnreadSet {
        self.shared.unread.borrow().clone()
    }

    fn subscribe_unread(&self) -> watch::Receiver<UnreadSet> {
        self.shared.unread.subscribe()
    }

    fn watched_rooms(&self) -> Vec<String> {
        let mut rooms = lock(&self.shared.watches)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        rooms.sort();
        rooms
    }

    async fn shutdown(&self) {
        let roster_task = lock(&self.roster_task).take();
        if let Some(task) = roster_task {
            task.abort();
            let _ = task.await;
        }
        for handle in self.shared.abort_watches() {
            let _ = handle.await;
        }
        self.shared.unread.send_replace(UnreadSet::new());
        tracing::info!(agent_id = %self.shared.agent_id, "unread tracking stopped");
    }
}

impl Drop for FanoutTracker {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.roster_task).take() {
            task.abort();
        }
        self.shared.abort_watches();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::staff::{send_staff_message, Recipient};
    use crate::test_support::{agent, eventually, test_state_with_store, ScriptedLlm};
    use crate::types::{AgentRole, AppState};

    async fn staff_of(names: &[&str]) -> Arc<AppState> {
        let (state, _) = test_state_with_store(ScriptedLlm::failing());
        for id in names {
            state
                .store
                .put_agent(&agent(id, AgentRole::Employee, &[]))
                .await
                .unwrap();
        }
        state
    }

    async fn tracker(state: &Arc<AppState>, agent_id: &str) -> FanoutTracker {
        FanoutTracker::start(agent_id, state.store.clone(), state.notifier.clone())
            .await
            .unwrap()
    }

    async fn wait_unread(tracker: &FanoutTracker, room_id: &str, expected: bool) {
        let mut rx = tracker.subscribe_unread();
        let reached = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|set| set.contains(room_id) == expected),
        )
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
        assert!(reached, "unread flag for {room_id} never became {expected}");
    }

    #[test]
    fn unread_rule() {
        let mut message = ChatMessage {
            id: "m1".to_string(),
            room_id: "r".to_string(),
            seq: 1,
            sender_id: "EMP-2".to_string(),
            sender_name: "Omar".to_string(),
            kind: crate::types::MessageType::Text,
            created_at: 1,
            payload: "hi".to_string(),
            read_by: Default::default(),
            bot_outcome: None,
        };
        assert!(is_unread("EMP-1", false, Some(&message)));
        assert!(!is_unread("EMP-1", true, Some(&message)));
        assert!(!is_unread("EMP-2", false, Some(&message)));
        message.read_by.insert("EMP-1".to_string());
        assert!(!is_unread("EMP-1", false, Some(&message)));
        assert!(!is_unread("EMP-1", false, None));
    }

    #[test]
    fn wanted_rooms_cover_pairs_broadcast_and_held_rooms() {
        let agents = vec![
            agent("EMP-1", AgentRole::Employee, &[]),
            agent("EMP-2", AgentRole::Employee, &[]),
        ];
        let held = Room {
            id: "RES-1-1000".to_string(),
            party_id: "v".to_string(),
            party_name: "Guest".to_string(),
            created_at: 0,
            language: None,
            locale: None,
            state: crate::types::RoomState::Assigned {
                agent_id: "EMP-1".to_string(),
            },
            required_tags: vec![],
            version: 1,
        };
        let wanted = wanted_rooms("EMP-1", &agents, &[held]);
        let expected = BTreeSet::from([
            "EMP-1__EMP-2".to_string(),
            "RES-1-1000".to_string(),
            BROADCAST_ROOM.to_string(),
        ]);
        assert_eq!(wanted, expected);
    }

    #[tokio::test]
    async fn unfocused_room_is_unread_until_opened() {
        let state = staff_of(&["EMP-X", "EMP-Y"]).await;
        let x = tracker(&state, "EMP-X").await;
        let room = pair_room_id("EMP-X", "EMP-Y");

        send_staff_message(&state, "EMP-Y", &Recipient::Agent("EMP-X".to_string()), "hello")
            .await
            .unwrap();
        wait_unread(&x, &room, true).await;

        x.open_room(&room).await.unwrap();
        assert!(!x.unread_rooms().contains(&room));
        let log = state.store.messages(&room).await.unwrap();
        assert!(log[0].read_by.contains("EMP-X"));
        x.shutdown().await;
    }

    #[tokio::test]
    async fn focused_room_never_turns_unread() {
        let state = staff_of(&["EMP-X", "EMP-Y"]).await;
        let x = tracker(&state, "EMP-X").await;
        let room = pair_room_id("EMP-X", "EMP-Y");
        x.open_room(&room).await.unwrap();

        let mut unread = x.subscribe_unread();
        send_staff_message(&state, "EMP-Y", &Recipient::Agent("EMP-X".to_string()), "you there?")
            .await
            .unwrap();

        let store = state.store.as_ref();
        let room_id = room.as_str();
        eventually(move || async move {
            store.messages(room_id).await.unwrap()[0].read_by.contains("EMP-X")
        })
        .await;
        assert!(!unread.borrow_and_update().contains(&room));
        assert!(!x.unread_rooms().contains(&room));
        x.shutdown().await;
    }

    #[tokio::test]
    async fn reading_only_affects_the_reader() {
        let state = staff_of(&["EMP-X", "EMP-Y", "EMP-Z"]).await;
        let x = tracker(&state, "EMP-X").await;
        let z = tracker(&state, "EMP-Z").await;

        send_staff_message(&state, "EMP-Y", &Recipient::Broadcast, "standup in 5")
            .await
            .unwrap();
        wait_unread(&x, BROADCAST_ROOM, true).await;
        wait_unread(&z, BROADCAST_ROOM, true).await;

        x.open_room(BROADCAST_ROOM).await.unwrap();
        assert!(!x.unread_rooms().contains(BROADCAST_ROOM));
        // the read receipt is redelivered to Z, who still has not read it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(z.unread_rooms().contains(BROADCAST_ROOM));

        x.shutdown().await;
        z.shutdown().await;
    }

    #[tokio::test]
    async fn each_message_is_cued_once() {
        let state = staff_of(&["EMP-X", "EMP-Y", "EMP-Z"]).await;
        let notifier = Arc::new(BroadcastNotifier::default());
        let mut cues = notifier.subscribe();
        let x = FanoutTracker::start("EMP-X", state.store.clone(), notifier.clone())
            .await
            .unwrap();

        let message = send_staff_message(&state, "EMP-Y", &Recipient::Broadcast, "lunch?")
            .await
            .unwrap();
        let cue = tokio::time::timeout(Duration::from_secs(2), cues.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            cue,
            Cue::InboundMessage {
                agent_id: "EMP-X".to_string(),
                room_id: BROADCAST_ROOM.to_string(),
                message_id: message.id.clone(),
            }
        );

        // someone else's read receipt redelivers the same latest message
        state
            .store
            .mark_read(BROADCAST_ROOM, &message.id, "EMP-Z")
            .await
            .unwrap();
        let again = tokio::time::timeout(Duration::from_millis(100), cues.recv()).await;
        assert!(again.is_err());
        x.shutdown().await;
    }

    #[tokio::test]
    async fn roster_changes_release_subscriptions() {
        let (state, store) = test_state_with_store(ScriptedLlm::failing());
        for id in ["EMP-1", "EMP-2", "EMP-3"] {
            store
                .put_agent(&agent(id, AgentRole::Employee, &[]))
                .await
                .unwrap();
        }
        let tracker = tracker(&state, "EMP-1").await;
        // agents + rooms + broadcast + two pair rooms
        assert_eq!(store.active_subscriptions(), 5);
        assert_eq!(tracker.watched_rooms().len(), 3);

        store.remove_agent("EMP-3").await.unwrap();
        let counted = store.clone();
        eventually(move || {
            let counted = counted.clone();
            async move { counted.active_subscriptions() == 4 }
        })
        .await;
        assert!(!tracker
            .watched_rooms()
            .contains(&pair_room_id("EMP-1", "EMP-3")));

        store
            .put_agent(&agent("EMP-4", AgentRole::Employee, &[]))
            .await
            .unwrap();
        let counted = store.clone();
        eventually(move || {
            let counted = counted.clone();
            async move { counted.active_subscriptions() == 5 }
        })
        .await;

        tracker.shutdown().await;
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[test]
    fn agents_off_the_roster_watch_nothing() {
        let agents = vec![agent("EMP-2", AgentRole::Employee, &[])];
        assert!(wanted_rooms("EMP-1", &agents, &[]).is_empty());
    }

    #[tokio::test]
    async fn removing_the_tracked_agent_releases_its_watches() {
        let (state, store) = test_state_with_store(ScriptedLlm::failing());
        for id in ["EMP-1", "EMP-2", "EMP-3"] {
            store
                .put_agent(&agent(id, AgentRole::Employee, &[]))
                .await
                .unwrap();
        }
        let tracker = tracker(&state, "EMP-1").await;
        assert_eq!(store.active_subscriptions(), 5);

        store.remove_agent("EMP-1").await.unwrap();
        let counted = store.clone();
        eventually(move || {
            let counted = counted.clone();
            async move { counted.active_subscriptions() == 2 }
        })
        .await;
        assert!(tracker.watched_rooms().is_empty());

        send_staff_message(&state, "EMP-2", &Recipient::Broadcast, "anyone?")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.unread_rooms().is_empty());
        tracker.shutdown().await;
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn opening_a_room_wins_over_a_concurrent_delivery() {
        let state = staff_of(&["EMP-X", "EMP-Y"]).await;
        let x = Arc::new(tracker(&state, "EMP-X").await);
        let room = pair_room_id("EMP-X", "EMP-Y");

        for round in 0..30 {
            x.unfocus();
            let sender = {
                let state = state.clone();
                tokio::spawn(async move {
                    send_staff_message(
                        &state,
                        "EMP-Y",
                        &Recipient::Agent("EMP-X".to_string()),
                        &format!("ping {round}"),
                    )
                    .await
                    .unwrap();
                })
            };
            let opener = {
                let x = x.clone();
                let room = room.clone();
                tokio::spawn(async move { x.open_room(&room).await.unwrap() })
            };
            sender.await.unwrap();
            opener.await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(
                !x.unread_rooms().contains(&room),
                "open room flagged unread in round {round}"
            );
        }
        x.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_a_tracker_releases_everything() {
        let (state, store) = test_state_with_store(ScriptedLlm::failing());
        store
            .put_agent(&agent("EMP-1", AgentRole::Employee, &[]))
            .await
            .unwrap();
        let tracker = tracker(&state, "EMP-1").await;
        assert!(store.active_subscriptions() > 0);
        drop(tracker);
        let counted = store.clone();
        eventually(move || {
            let counted = counted.clone();
            async move { counted.active_subscriptions() == 0 }
        })
        .await;
    }
}
