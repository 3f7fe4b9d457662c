//! Fakes and helpers shared by the unit tests.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::faq::{FaqEntry, KeywordFaq};
use crate::llm::{CompletionService, LlmError};
use crate::locale::LocaleTable;
use crate::profile::StaticProfiles;
use crate::store::{CasOutcome, DocumentStore, MemoryStore, Subscription};
use crate::types::{AgentProfile, AgentRole, AppState, ChatMessage, MessageDraft, MessageType, Room};

/// Completion service that plays back a script, then keeps repeating the
/// fallback reply.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, ()>>>,
    fallback: Result<String, ()>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn failing() -> Self {
        Self::sequence(vec![], Err(()))
    }

    pub fn replying(text: &str) -> Self {
        Self::sequence(vec![], Ok(text.to_string()))
    }

    pub fn slow(delay: Duration) -> Self {
        let mut llm = Self::replying("Welcome aboard!");
        llm.delay = delay;
        llm
    }

    pub fn sequence(script: Vec<Result<String, ()>>, fallback: Result<String, ()>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _language: &str,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(|()| LlmError::Request("scripted failure".to_string()))
    }
}

pub fn agent(id: &str, role: AgentRole, providers: &[&str]) -> AgentProfile {
    AgentProfile {
        id: id.to_string(),
        name: format!("Agent {id}"),
        role,
        online: true,
        providers: providers.iter().map(|p| p.to_string()).collect(),
    }
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.close_grace = Duration::from_millis(50);
    settings.llm.timeout = Duration::from_secs(1);
    settings
}

pub fn test_faq() -> KeywordFaq {
    KeywordFaq::new(vec![FaqEntry {
        language: "en".to_string(),
        keywords: vec!["hours".to_string()],
        answer: "We are open from 9 to 5.".to_string(),
    }])
}

pub fn test_state_with_store(
    llm: impl Into<Arc<ScriptedLlm>>,
) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (test_state_over(store.clone(), llm), store)
}

pub fn test_state_over(
    store: Arc<dyn DocumentStore>,
    llm: impl Into<Arc<ScriptedLlm>>,
) -> Arc<AppState> {
    let llm: Arc<ScriptedLlm> = llm.into();
    let state = AppState::new(
        store,
        llm,
        Arc::new(test_faq()),
        Arc::new(StaticProfiles::new()),
        Arc::new(LocaleTable::builtin()),
        test_settings(),
    );
    Arc::new(state)
}

pub fn test_state(llm: impl Into<Arc<ScriptedLlm>>) -> Arc<AppState> {
    test_state_with_store(llm).0
}

/// Memory store whose system-message appends can be made to fail.
#[derive(Default)]
pub struct FlakySystemAppends {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakySystemAppends {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for FlakySystemAppends {
    async fn insert_room(&self, room: &Room) -> StoreResult<()> {
        self.inner.insert_room(room).await
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        self.inner.get_room(room_id).await
    }

    async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        self.inner.list_rooms().await
    }

    async fn compare_and_swap_room(&self, room: &Room, expected_version: u64) -> StoreResult<CasOutcome> {
        self.inner.compare_and_swap_room(room, expected_version).await
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<()> {
        self.inner.delete_room(room_id).await
    }

    async fn append_message(&self, room_id: &str, draft: MessageDraft) -> StoreResult<ChatMessage> {
        if draft.kind == MessageType::System && self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("append dropped".to_string()));
        }
        self.inner.append_message(room_id, draft).await
    }

    async fn messages(&self, room_id: &str) -> StoreResult<Vec<ChatMessage>> {
        self.inner.messages(room_id).await
    }

    async fn mark_read(&self, room_id: &str, message_id: &str, reader_id: &str) -> StoreResult<bool> {
        self.inner.mark_read(room_id, message_id, reader_id).await
    }

    async fn purge_messages(&self, room_id: &str) -> StoreResult<()> {
        self.inner.purge_messages(room_id).await
    }

    async fn put_agent(&self, agent: &AgentProfile) -> StoreResult<()> {
        self.inner.put_agent(agent).await
    }

    async fn remove_agent(&self, agent_id: &str) -> StoreResult<()> {
        self.inner.remove_agent(agent_id).await
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentProfile>> {
        self.inner.get_agent(agent_id).await
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentProfile>> {
        self.inner.list_agents().await
    }

    async fn subscribe_messages(&self, room_id: &str) -> StoreResult<Subscription<Vec<ChatMessage>>> {
        self.inner.subscribe_messages(room_id).await
    }

    async fn subscribe_rooms(&self) -> StoreResult<Subscription<Vec<Room>>> {
        self.inner.subscribe_rooms().await
    }

    async fn subscribe_agents(&self) -> StoreResult<Subscription<Vec<AgentProfile>>> {
        self.inner.subscribe_agents().await
    }

    fn active_subscriptions(&self) -> usize {
        self.inner.active_subscriptions()
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
