//! Room lifecycle: open, language selection, hand-off request, claim,
//! transfer, close and teardown.
//!
//! Every status/assignment change goes through [`transition`], a
//! read-modify-CAS loop against the room's `version`. Two writers racing on
//! the same room cannot both win; the loser re-reads and re-evaluates the
//! precondition against the winner's state.

use std::sync::Arc;

use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{CoreError, Result, StoreError};
use crate::locale::DEFAULT_LANGUAGE;
use crate::message_log;
use crate::notify::{Cue, Notifier};
use crate::prompting::{render_welcome_prompt, WelcomePromptContext};
use crate::roster;
use crate::store::{CasOutcome, DocumentStore};
use crate::types::{
    now_millis, AppState, BotOutcome, ChatMessage, ClosedBy, MessageDraft, Room, RoomState,
    RoomSummary,
};

const MAX_CAS_ATTEMPTS: usize = 8;
const MAX_ID_ATTEMPTS: usize = 8;

/// Outcome of a state transition.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub room: Room,
    /// False when the room was already in the requested state.
    pub changed: bool,
}

/// Apply `next` to the current room under compare-and-swap.
///
/// `next` returns `Ok(Some(room))` to write, `Ok(None)` when the room already
/// satisfies the transition, or an error when the precondition fails. Closed
/// rooms never reach `next`.
pub async fn transition<F>(store: &dyn DocumentStore, room_id: &str, mut next: F) -> Result<Transitioned>
where
    F: FnMut(&Room) -> Result<Option<Room>>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(current) = store.get_room(room_id).await? else {
            return Err(CoreError::RoomNotFound(room_id.to_string()));
        };
        if current.state.is_closed() {
            tracing::warn!(room_id, "transition on closed room ignored");
            return Err(CoreError::RoomClosed(room_id.to_string()));
        }
        let proposed = match next(&current) {
            Ok(Some(proposed)) => proposed,
            Ok(None) => {
                return Ok(Transitioned {
                    room: current,
                    changed: false,
                })
            }
            Err(err) => {
                tracing::warn!(room_id, state = current.state.label(), "transition rejected: {}", err);
                return Err(err);
            }
        };
        match store.compare_and_swap_room(&proposed, current.version).await? {
            CasOutcome::Applied(room) => {
                return Ok(Transitioned {
                    room,
                    changed: true,
                })
            }
            CasOutcome::Conflict(Some(_)) => {
                tracing::debug!(room_id, "room changed underneath, retrying");
            }
            CasOutcome::Conflict(None) => {
                return Err(CoreError::RoomNotFound(room_id.to_string()));
            }
        }
    }
    Err(StoreError::Unavailable(format!("room {room_id} kept changing during update")).into())
}

fn with_state(room: &Room, state: RoomState) -> Room {
    let mut next = room.clone();
    next.state = state;
    next
}

/// `RES-<unix seconds>-<4 digits>`.
pub fn mint_room_id() -> String {
    let suffix = Uuid::new_v4().as_u128() % 9000 + 1000;
    format!("RES-{}-{suffix}", now_millis() / 1000)
}

pub struct OpenRoom<'a> {
    pub party_id: &'a str,
    pub party_name: Option<&'a str>,
    /// Room id remembered by the client from an earlier visit.
    pub room_id: Option<&'a str>,
    pub required_tags: Vec<String>,
}

/// Return the party's open room if it has one, else create a fresh room in
/// `LanguageSelection`.
pub async fn open_room(state: &Arc<AppState>, request: OpenRoom<'_>) -> Result<Room> {
    let store = state.store.as_ref();

    if let Some(room_id) = request.room_id {
        if let Some(room) = store.get_room(room_id).await? {
            if room.party_id == request.party_id && !room.state.is_closed() {
                resume(state, &room).await?;
                return Ok(room);
            }
        }
    }
    let party_name = resolve_party_name(state, request.party_id, request.party_name).await;
    for _ in 0..MAX_ID_ATTEMPTS {
        if let Some(room) = open_room_of(store, request.party_id).await? {
            resume(state, &room).await?;
            return Ok(room);
        }
        let room = Room {
            id: mint_room_id(),
            party_id: request.party_id.to_string(),
            party_name: party_name.clone(),
            created_at: now_millis(),
            language: None,
            locale: None,
            state: RoomState::LanguageSelection,
            required_tags: request.required_tags.clone(),
            version: 0,
        };
        match store.insert_room(&room).await {
            Ok(()) => {
                tracing::info!(room_id = %room.id, party_id = %room.party_id, "room opened");
                return Ok(room);
            }
            Err(StoreError::AlreadyExists { id, .. }) => {
                tracing::debug!(room_id = %id, "room id collision, minting another");
            }
            Err(StoreError::PartyHasOpenRoom { party_id }) => {
                tracing::debug!(party_id = %party_id, "concurrent open for party, reusing its room");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(StoreError::Unavailable("could not open a room".to_string()).into())
}

async fn open_room_of(store: &dyn DocumentStore, party_id: &str) -> Result<Option<Room>> {
    Ok(store
        .list_rooms()
        .await?
        .into_iter()
        .find(|room| room.party_id == party_id && !room.state.is_closed()))
}

/// Rebuild process-local state for a room a client reconnected to.
async fn resume(state: &Arc<AppState>, room: &Room) -> Result<()> {
    let messages = state.store.messages(&room.id).await?;
    let count = state.escalation.recompute(&room.id, &messages).await;
    tracing::info!(room_id = %room.id, failures = count, "room resumed");
    Ok(())
}

async fn resolve_party_name(state: &Arc<AppState>, party_id: &str, given: Option<&str>) -> String {
    if let Some(name) = given.map(str::trim).filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    match state.profiles.get_profile(party_id).await {
        Ok(profile) if !profile.display_name.trim().is_empty() => profile.display_name,
        Ok(profile) => state
            .locales
            .guest_name(profile.preferred_language.as_deref().unwrap_or(DEFAULT_LANGUAGE)),
        Err(err) => {
            tracing::warn!(party_id, "profile lookup failed, using guest name: {}", err);
            state.locales.guest_name(DEFAULT_LANGUAGE)
        }
    }
}

/// Commit the language choice and move to `Assisted`. The welcome message is
/// produced afterwards on its own task.
pub async fn select_language(
    state: &Arc<AppState>,
    room_id: &str,
    language: &str,
    locale: &str,
) -> Result<Room> {
    let language = state.locales.resolve_language(language, locale);
    let locale = locale.trim().to_ascii_uppercase();

    let outcome = transition(state.store.as_ref(), room_id, |room| match room.state {
        RoomState::LanguageSelection => {
            let mut next = with_state(room, RoomState::Assisted);
            next.language = Some(language.clone());
            next.locale = (!locale.is_empty()).then(|| locale.clone());
            Ok(Some(next))
        }
        _ => Err(CoreError::precondition(room_id, "language already selected")),
    })
    .await?;

    state.escalation.reset(room_id).await;
    tracing::info!(room_id, language = %language, "language selected");
    spawn_welcome(state.clone(), outcome.room.clone());
    Ok(outcome.room)
}

fn spawn_welcome(state: Arc<AppState>, room: Room) {
    tokio::spawn(async move {
        if let Err(err) = deliver_welcome(&state, &room).await {
            tracing::warn!(room_id = %room.id, "welcome not delivered: {}", err);
        }
    });
}

/// Ask the language model for a welcome, falling back to the canned one.
pub async fn deliver_welcome(state: &Arc<AppState>, room: &Room) -> Result<ChatMessage> {
    let language = room.language_or_default();
    let language_name = state.locales.language_name(language);
    let prompt = render_welcome_prompt(&WelcomePromptContext {
        language_code: language,
        language_name: &language_name,
        party_name: &room.party_name,
        locale: room.locale.as_deref().unwrap_or(""),
    });
    let user_prompt = format!("Write the welcome message for {}.", room.party_name);

    let text = match timeout(
        state.settings.llm.timeout,
        state.llm.complete(&prompt, &user_prompt, language),
    )
    .await
    {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            tracing::warn!(room_id = %room.id, "welcome completion failed, using fallback: {}", err);
            state.locales.welcome(language)
        }
        Err(_) => {
            tracing::warn!(room_id = %room.id, "welcome completion timed out, using fallback");
            state.locales.welcome(language)
        }
    };

    message_log::append_to_open_room(
        state.store.as_ref(),
        &room.id,
        MessageDraft::bot(&text, BotOutcome::Welcome),
    )
    .await
}

/// Put the room in the agent queue. Calling it again while waiting is a no-op.
pub async fn request_agent(state: &Arc<AppState>, room_id: &str) -> Result<Room> {
    let outcome = transition(state.store.as_ref(), room_id, |room| match room.state {
        RoomState::Assisted => Ok(Some(with_state(room, RoomState::WaitingForAgent))),
        RoomState::WaitingForAgent => Ok(None),
        RoomState::LanguageSelection => {
            Err(CoreError::precondition(room_id, "language not selected yet"))
        }
        RoomState::Assigned { .. } => {
            Err(CoreError::precondition(room_id, "room already has an agent"))
        }
        RoomState::Closed { .. } => Err(CoreError::RoomClosed(room_id.to_string())),
    })
    .await?;

    state.escalation.reset(room_id).await;
    if outcome.changed {
        tracing::info!(room_id, "agent requested");
        let agent_ids = roster::eligible_agents(state, &outcome.room)
            .await?
            .into_iter()
            .map(|agent| agent.id)
            .collect::<Vec<_>>();
        if agent_ids.is_empty() {
            tracing::warn!(room_id, "no eligible agent online for waiting room");
        } else {
            state.notifier.cue(Cue::RoomWaiting {
                room_id: room_id.to_string(),
                agent_ids,
            });
        }
    }
    Ok(outcome.room)
}

/// Claim a waiting room. Exactly one of several racing agents wins; the others
/// get `AlreadyClaimed`.
pub async fn accept_room(state: &Arc<AppState>, room_id: &str, agent_id: &str) -> Result<Room> {
    let Some(agent) = state.store.get_agent(agent_id).await? else {
        return Err(CoreError::AgentNotFound(agent_id.to_string()));
    };

    let outcome = transition(state.store.as_ref(), room_id, |room| match &room.state {
        RoomState::WaitingForAgent if !roster::is_eligible(&agent, room) => Err(
            CoreError::precondition(room_id, "agent lacks the room's specialization"),
        ),
        RoomState::WaitingForAgent => Ok(Some(with_state(
            room,
            RoomState::Assigned {
                agent_id: agent_id.to_string(),
            },
        ))),
        RoomState::Assigned { agent_id: holder } if holder == agent_id => Ok(None),
        RoomState::Assigned { agent_id: holder } => Err(CoreError::AlreadyClaimed {
            room_id: room_id.to_string(),
            agent_id: holder.clone(),
        }),
        _ => Err(CoreError::precondition(room_id, "room is not waiting for an agent")),
    })
    .await?;

    if outcome.changed {
        tracing::info!(room_id, agent_id, "room accepted");
    }
    Ok(outcome.room)
}

/// Reassign a room between agents and record it in the log. The receiving
/// agent does not have to acknowledge.
pub async fn transfer(
    state: &Arc<AppState>,
    room_id: &str,
    from_agent_id: &str,
    to_agent_id: &str,
) -> Result<Room> {
    if from_agent_id == to_agent_id {
        return Err(CoreError::precondition(room_id, "cannot transfer to the same agent"));
    }
    let Some(from_agent) = state.store.get_agent(from_agent_id).await? else {
        return Err(CoreError::AgentNotFound(from_agent_id.to_string()));
    };
    let Some(to_agent) = state.store.get_agent(to_agent_id).await? else {
        return Err(CoreError::AgentNotFound(to_agent_id.to_string()));
    };

    let outcome = transition(state.store.as_ref(), room_id, |room| match room.assigned_to() {
        Some(holder) if holder == from_agent_id => Ok(Some(with_state(
            room,
            RoomState::Assigned {
                agent_id: to_agent_id.to_string(),
            },
        ))),
        _ => Err(CoreError::precondition(room_id, "room is not held by the transferring agent")),
    })
    .await?;

    message_log::append(
        state.store.as_ref(),
        room_id,
        MessageDraft::system(
            &from_agent.id,
            &from_agent.name,
            &format!("transferred:{}:{}", from_agent.id, to_agent.id),
        ),
    )
    .await?;

    if !to_agent.online {
        tracing::warn!(room_id, to_agent_id, "room transferred to an offline agent");
    }
    tracing::info!(room_id, from_agent_id, to_agent_id, "room transferred");
    state.notifier.cue(Cue::RoomTransferred {
        room_id: room_id.to_string(),
        from_agent_id: from_agent_id.to_string(),
        to_agent_id: to_agent_id.to_string(),
    });
    Ok(outcome.room)
}

/// Mark the room closed, record who closed it, and schedule teardown after
/// the configured grace period.
pub async fn close(
    state: &Arc<AppState>,
    room_id: &str,
    closed_by: ClosedBy,
    actor_id: &str,
    actor_name: &str,
) -> Result<Room> {
    let outcome = transition(state.store.as_ref(), room_id, |room| {
        Ok(Some(with_state(room, RoomState::Closed { closed_by })))
    })
    .await?;

    // the room is closed from here on; teardown is scheduled even if the
    // marker cannot be written
    if let Err(err) = message_log::append(
        state.store.as_ref(),
        room_id,
        MessageDraft::system(actor_id, actor_name, closed_by.marker()),
    )
    .await
    {
        tracing::warn!(room_id, "close marker not recorded: {}", err);
    }
    tracing::info!(room_id, closed_by = closed_by.marker(), "room closed");

    let state = state.clone();
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(state.settings.close_grace).await;
        if let Err(err) = teardown(&state, &room_id).await {
            tracing::error!(room_id = %room_id, "room teardown failed: {}", err);
        }
    });
    Ok(outcome.room)
}

/// Purge the message log, then delete the room record. A room left closed by
/// an interrupted teardown stays inert.
pub async fn teardown(state: &Arc<AppState>, room_id: &str) -> Result<()> {
    state.store.purge_messages(room_id).await?;
    state.store.delete_room(room_id).await?;
    state.escalation.forget(room_id).await;
    tracing::info!(room_id, "room torn down");
    Ok(())
}

pub async fn get_room(state: &Arc<AppState>, room_id: &str) -> Result<Room> {
    state
        .store
        .get_room(room_id)
        .await?
        .ok_or_else(|| CoreError::RoomNotFound(room_id.to_string()))
}

pub async fn summary(state: &Arc<AppState>, room_id: &str) -> Result<RoomSummary> {
    let room = get_room(state, room_id).await?;
    Ok(summarize(state, &room).await)
}

pub async fn summarize(state: &Arc<AppState>, room: &Room) -> RoomSummary {
    let offer = state.escalation.can_offer_handoff(room).await;
    RoomSummary::project(room, offer)
}
