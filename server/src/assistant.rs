//! Automated answers for visitor questions.
//!
//! A visitor turn commits the visitor's message first. The bot answer is
//! produced on its own task: FAQ lookup, then the language model, then the
//! localized failure text plus an invitation to talk to a human.

use std::sync::Arc;

use tokio::time::timeout;

use crate::error::{CoreError, Result};
use crate::escalation::{can_offer_handoff, HANDOFF_THRESHOLD};
use crate::message_log;
use crate::notify::{Cue, Notifier};
use crate::prompting::{render_answer_prompt, AnswerPromptContext};
use crate::types::{AppState, BotOutcome, ChatMessage, MessageDraft, MessageType, RoomState};

/// Messages included in the answer prompt.
const TRANSCRIPT_WINDOW: usize = 12;

/// Record a visitor message. While the bot is serving the room, an answer is
/// scheduled in the background.
pub async fn post_visitor_message(
    state: &Arc<AppState>,
    room_id: &str,
    sender_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    let Some(room) = state.store.get_room(room_id).await? else {
        return Err(CoreError::RoomNotFound(room_id.to_string()));
    };
    if room.state.is_closed() {
        return Err(CoreError::RoomClosed(room_id.to_string()));
    }
    if room.party_id != sender_id {
        return Err(CoreError::precondition(room_id, "sender is not the room's visitor"));
    }
    let message = message_log::append(
        state.store.as_ref(),
        room_id,
        MessageDraft::text(sender_id, &room.party_name, text),
    )
    .await?;

    if room.state == RoomState::Assisted {
        let state = state.clone();
        let room_id = room_id.to_string();
        let question = text.to_string();
        tokio::spawn(async move {
            if let Err(err) = answer_question(&state, &room_id, &question).await {
                tracing::warn!(room_id = %room_id, "question left unanswered: {}", err);
            }
        });
    }
    Ok(message)
}

/// Produce and append one bot answer. Updates the escalation counter and
/// cues the hand-off offer when the failure run reaches the threshold.
pub async fn answer_question(
    state: &Arc<AppState>,
    room_id: &str,
    question: &str,
) -> Result<ChatMessage> {
    let Some(room) = state.store.get_room(room_id).await? else {
        return Err(CoreError::RoomNotFound(room_id.to_string()));
    };
    if room.state != RoomState::Assisted {
        return Err(CoreError::precondition(room_id, "room is no longer bot-assisted"));
    }
    let language = room.language_or_default();

    if let Some(answer) = state.faq.lookup(question, language) {
        tracing::debug!(room_id, "answered from faq");
        return answer_succeeded(state, room_id, &answer).await;
    }

    let history = state.store.messages(room_id).await?;
    let transcript = transcript(&history);
    let language_name = state.locales.language_name(language);
    let system_prompt = render_answer_prompt(&AnswerPromptContext {
        language_code: language,
        language_name: &language_name,
        transcript: &transcript,
    });

    match timeout(
        state.settings.llm.timeout,
        state.llm.complete(&system_prompt, question, language),
    )
    .await
    {
        Ok(Ok(answer)) => answer_succeeded(state, room_id, &answer).await,
        Ok(Err(err)) => {
            tracing::warn!(room_id, "answer completion failed: {}", err);
            answer_failed(state, room_id, language).await
        }
        Err(_) => {
            tracing::warn!(room_id, "answer completion timed out");
            answer_failed(state, room_id, language).await
        }
    }
}

async fn answer_succeeded(state: &Arc<AppState>, room_id: &str, answer: &str) -> Result<ChatMessage> {
    let message = message_log::append_to_open_room(
        state.store.as_ref(),
        room_id,
        MessageDraft::bot(answer, BotOutcome::Answered),
    )
    .await?;
    state.escalation.record_success(room_id).await;
    Ok(message)
}

async fn answer_failed(state: &Arc<AppState>, room_id: &str, language: &str) -> Result<ChatMessage> {
    let message = message_log::append_to_open_room(
        state.store.as_ref(),
        room_id,
        MessageDraft::bot(&state.locales.answer_unavailable(language), BotOutcome::Failed),
    )
    .await?;
    let failures = state.escalation.record_failure(room_id).await;

    let room = state.store.get_room(room_id).await?;
    if failures == HANDOFF_THRESHOLD && room.is_some_and(|room| can_offer_handoff(failures, &room)) {
        tracing::info!(room_id, failures, "hand-off now available");
        state.notifier.cue(Cue::HandoffAvailable {
            room_id: room_id.to_string(),
        });
    }
    Ok(message)
}

fn transcript(history: &[ChatMessage]) -> String {
    let start = history.len().saturating_sub(TRANSCRIPT_WINDOW);
    history[start..]
        .iter()
        .filter(|message| matches!(message.kind, MessageType::Text | MessageType::Bot))
        .map(|message| format!("{}: {}", message.sender_name, message.payload))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{self, OpenRoom};
    use crate::test_support::{eventually, test_state, ScriptedLlm};
    use crate::types::Room;

    async fn assisted(state: &Arc<AppState>) -> Room {
        let room = session::open_room(
            state,
            OpenRoom {
                party_id: "visitor-1",
                party_name: Some("Layla"),
                room_id: None,
                required_tags: vec![],
            },
        )
        .await
        .unwrap();
        let room = session::select_language(state, &room.id, "en", "AE")
            .await
            .unwrap();
        let store = state.store.as_ref();
        let room_id = room.id.as_str();
        eventually(move || async move { store.messages(room_id).await.unwrap().len() == 1 }).await;
        room
    }

    #[tokio::test]
    async fn faq_answers_skip_the_model() {
        let llm = Arc::new(ScriptedLlm::failing());
        let state = test_state(llm.clone());
        let room = assisted(&state).await;
        let welcome_calls = llm.calls();

        let answer = answer_question(&state, &room.id, "What are your hours?")
            .await
            .unwrap();
        assert_eq!(answer.payload, "We are open from 9 to 5.");
        assert_eq!(answer.bot_outcome, Some(BotOutcome::Answered));
        assert_eq!(llm.calls(), welcome_calls);
    }

    #[tokio::test]
    async fn two_failures_offer_a_human_and_a_success_resets() {
        let state = test_state(ScriptedLlm::sequence(
            vec![
                Ok("Welcome!".to_string()),
                Err(()),
                Err(()),
                Ok("Sure, here you go.".to_string()),
                Err(()),
            ],
            Err(()),
        ));
        let room = assisted(&state).await;
        let mut cues = state.notifier.subscribe();

        let first = answer_question(&state, &room.id, "Can I bring my cat?").await.unwrap();
        assert_eq!(first.bot_outcome, Some(BotOutcome::Failed));
        assert_eq!(first.payload, state.locales.answer_unavailable("en"));
        assert!(!session::summary(&state, &room.id).await.unwrap().can_offer_human_handoff);

        answer_question(&state, &room.id, "And my dog?").await.unwrap();
        assert!(session::summary(&state, &room.id).await.unwrap().can_offer_human_handoff);
        assert_eq!(
            cues.recv().await.unwrap(),
            Cue::HandoffAvailable {
                room_id: room.id.clone()
            }
        );

        let answered = answer_question(&state, &room.id, "A parrot?").await.unwrap();
        assert_eq!(answered.bot_outcome, Some(BotOutcome::Answered));
        assert_eq!(state.escalation.count(&room.id).await, 0);
        assert!(!session::summary(&state, &room.id).await.unwrap().can_offer_human_handoff);

        answer_question(&state, &room.id, "A snake?").await.unwrap();
        assert_eq!(state.escalation.count(&room.id).await, 1);
        assert!(!session::summary(&state, &room.id).await.unwrap().can_offer_human_handoff);
    }

    #[tokio::test]
    async fn visitor_turn_schedules_an_answer() {
        let state = test_state(ScriptedLlm::replying("Happy to help."));
        let room = assisted(&state).await;

        post_visitor_message(&state, &room.id, "visitor-1", "Is breakfast included?")
            .await
            .unwrap();
        let store = state.store.as_ref();
        let room_id = room.id.as_str();
        eventually(move || async move { store.messages(room_id).await.unwrap().len() == 3 }).await;

        let log = state.store.messages(&room.id).await.unwrap();
        assert_eq!(log[1].sender_name, "Layla");
        assert_eq!(log[2].payload, "Happy to help.");
    }

    #[tokio::test]
    async fn waiting_rooms_get_no_bot_answers() {
        let state = test_state(ScriptedLlm::replying("unused"));
        let room = assisted(&state).await;
        session::request_agent(&state, &room.id).await.unwrap();

        let err = answer_question(&state, &room.id, "hello?").await.unwrap_err();
        assert!(matches!(err, CoreError::Precondition { .. }));
    }

    #[tokio::test]
    async fn strangers_cannot_post_as_the_visitor() {
        let state = test_state(ScriptedLlm::failing());
        let room = assisted(&state).await;
        let err = post_visitor_message(&state, &room.id, "someone-else", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition { .. }));
    }
}
