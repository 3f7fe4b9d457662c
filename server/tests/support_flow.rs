use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_server::{
    assistant,
    config::Settings,
    faq::KeywordFaq,
    llm::{CompletionService, LlmError},
    locale::LocaleTable,
    profile::StaticProfiles,
    session::{self, OpenRoom},
    store::{DocumentStore, MemoryStore},
    types::{AgentProfile, AgentRole, AppState, BotOutcome, ClosedBy, MessageType},
};

struct Unreachable;

#[async_trait]
impl CompletionService for Unreachable {
    async fn complete(&self, _system: &str, _user: &str, _language: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

fn support_state() -> Arc<AppState> {
    let mut settings = Settings::default();
    settings.close_grace = Duration::from_millis(100);
    settings.llm.timeout = Duration::from_millis(500);
    Arc::new(AppState::new(
        Arc::new(MemoryStore::new()),
        Arc::new(Unreachable),
        Arc::new(KeywordFaq::new(vec![])),
        Arc::new(StaticProfiles::new()),
        Arc::new(LocaleTable::builtin()),
        settings,
    ))
}

async fn wait_for_messages(store: &dyn DocumentStore, room_id: &str, count: usize) {
    for _ in 0..200 {
        if store.messages(room_id).await.unwrap().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room_id} never reached {count} messages");
}

#[tokio::test]
async fn visitor_escalates_and_an_agent_closes_the_room() {
    let state = support_state();
    state
        .store
        .put_agent(&AgentProfile {
            id: "EMP-2024-007".to_string(),
            name: "Sara".to_string(),
            role: AgentRole::Employee,
            online: true,
            providers: vec!["reservations".to_string()],
        })
        .await
        .unwrap();

    let room = session::open_room(
        &state,
        OpenRoom {
            party_id: "visitor-42",
            party_name: Some("Omar"),
            room_id: None,
            required_tags: vec!["Reservations".to_string()],
        },
    )
    .await
    .unwrap();
    assert!(room.id.starts_with("RES-"));

    let room = session::select_language(&state, &room.id, "en", "ae").await.unwrap();
    assert_eq!(room.language.as_deref(), Some("en"));
    assert_eq!(room.locale.as_deref(), Some("AE"));
    wait_for_messages(state.store.as_ref(), &room.id, 1).await;
    let welcome = &state.store.messages(&room.id).await.unwrap()[0];
    assert_eq!(welcome.kind, MessageType::Bot);
    assert_eq!(welcome.payload, state.locales.welcome("en"));

    for question in ["Can I change my booking dates?", "Is the pool heated?"] {
        let answer = assistant::answer_question(&state, &room.id, question)
            .await
            .unwrap();
        assert_eq!(answer.bot_outcome, Some(BotOutcome::Failed));
    }
    assert!(session::summary(&state, &room.id).await.unwrap().can_offer_human_handoff);

    session::request_agent(&state, &room.id).await.unwrap();
    let summary = session::summary(&state, &room.id).await.unwrap();
    assert!(summary.waiting_for_agent);
    assert!(!summary.can_offer_human_handoff);

    session::accept_room(&state, &room.id, "EMP-2024-007").await.unwrap();
    let summary = session::summary(&state, &room.id).await.unwrap();
    assert_eq!(summary.assigned_to.as_deref(), Some("EMP-2024-007"));
    assert!(!summary.waiting_for_agent);
    assert!(summary.agent_accepted);

    session::close(&state, &room.id, ClosedBy::Employee, "EMP-2024-007", "Sara")
        .await
        .unwrap();
    let log = state.store.messages(&room.id).await.unwrap();
    let marker = log.last().unwrap();
    assert_eq!(marker.kind, MessageType::System);
    assert_eq!(marker.payload, "closed_by_employee");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(state.store.get_room(&room.id).await.unwrap().is_none());
    assert!(state.store.messages(&room.id).await.unwrap().is_empty());

    let next = session::open_room(
        &state,
        OpenRoom {
            party_id: "visitor-42",
            party_name: Some("Omar"),
            room_id: Some(&room.id),
            required_tags: vec![],
        },
    )
    .await
    .unwrap();
    assert_ne!(next.id, room.id);
}
