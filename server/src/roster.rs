//! Agent roster and room eligibility.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::message_log;
use crate::staff;
use crate::types::{AgentProfile, AgentRole, AppState, ChatMessage, MessageDraft, Room};

/// Whether `agent` may see and claim `room` while it waits. Rooms without
/// required tags are open to everyone; admins and managers see every room.
pub fn is_eligible(agent: &AgentProfile, room: &Room) -> bool {
    if matches!(agent.role, AgentRole::Admin | AgentRole::Manager) {
        return true;
    }
    room.required_tags.is_empty()
        || room
            .required_tags
            .iter()
            .any(|tag| agent.providers.iter().any(|own| own.eq_ignore_ascii_case(tag)))
}

/// Waiting rooms the agent is eligible for, plus the rooms it holds.
pub fn eligible_rooms(agent: &AgentProfile, rooms: Vec<Room>) -> Vec<Room> {
    rooms
        .into_iter()
        .filter(|room| {
            (room.waiting_for_agent() && is_eligible(agent, room))
                || room.assigned_to() == Some(agent.id.as_str())
        })
        .collect()
}

pub async fn list_eligible_rooms(state: &Arc<AppState>, agent_id: &str) -> Result<Vec<Room>> {
    let agent = get_agent(state, agent_id).await?;
    let rooms = state.store.list_rooms().await?;
    Ok(eligible_rooms(&agent, rooms))
}

/// Online agents who could claim `room`.
pub async fn eligible_agents(state: &Arc<AppState>, room: &Room) -> Result<Vec<AgentProfile>> {
    Ok(state
        .store
        .list_agents()
        .await?
        .into_iter()
        .filter(|agent| agent.online && is_eligible(agent, room))
        .collect())
}

pub async fn get_agent(state: &Arc<AppState>, agent_id: &str) -> Result<AgentProfile> {
    state
        .store
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))
}

pub async fn list_agents(state: &Arc<AppState>) -> Result<Vec<AgentProfile>> {
    Ok(state.store.list_agents().await?)
}

/// Add or replace a roster entry.
pub async fn register_agent(state: &Arc<AppState>, agent: AgentProfile) -> Result<AgentProfile> {
    if !staff::is_valid_agent_id(&agent.id) {
        tracing::warn!(agent_id = %agent.id, "agent id rejected");
        return Err(CoreError::InvalidAgentId(agent.id));
    }
    state.store.put_agent(&agent).await?;
    tracing::info!(agent_id = %agent.id, role = ?agent.role, "agent registered");
    Ok(agent)
}

pub async fn set_agent_online(
    state: &Arc<AppState>,
    agent_id: &str,
    online: bool,
) -> Result<AgentProfile> {
    let mut agent = get_agent(state, agent_id).await?;
    if agent.online != online {
        agent.online = online;
        state.store.put_agent(&agent).await?;
        tracing::info!(agent_id, online, "agent presence changed");
    }
    Ok(agent)
}

pub async fn remove_agent(state: &Arc<AppState>, agent_id: &str) -> Result<()> {
    let agent = get_agent(state, agent_id).await?;
    let held = state
        .store
        .list_rooms()
        .await?
        .into_iter()
        .filter(|room| room.assigned_to() == Some(agent.id.as_str()))
        .count();
    if held > 0 {
        tracing::warn!(agent_id, rooms = held, "removing agent that still holds rooms");
    }
    state.store.remove_agent(agent_id).await?;
    tracing::info!(agent_id, "agent removed");
    Ok(())
}

/// Message from the agent holding a visitor room.
pub async fn post_agent_message(
    state: &Arc<AppState>,
    room_id: &str,
    agent_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    let agent = get_agent(state, agent_id).await?;
    let Some(room) = state.store.get_room(room_id).await? else {
        return Err(CoreError::RoomNotFound(room_id.to_string()));
    };
    if room.state.is_closed() {
        return Err(CoreError::RoomClosed(room_id.to_string()));
    }
    if room.assigned_to() != Some(agent.id.as_str()) {
        return Err(CoreError::precondition(room_id, "room is not assigned to this agent"));
    }
    message_log::append(
        state.store.as_ref(),
        room_id,
        MessageDraft::text(&agent.id, &agent.name, text),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session;
    use crate::test_support::{agent, test_state, ScriptedLlm};
    use crate::types::{AgentRole, RoomState};

    fn room(id: &str, state: RoomState, tags: &[&str]) -> Room {
        Room {
            id: id.to_string(),
            party_id: format!("party-{id}"),
            party_name: "Guest".to_string(),
            created_at: 0,
            language: Some("en".to_string()),
            locale: None,
            state,
            required_tags: tags.iter().map(|t| t.to_string()).collect(),
            version: 0,
        }
    }

    #[test]
    fn eligibility_intersects_tags() {
        let visa = agent("EMP-V", AgentRole::Employee, &["Visa"]);
        let admin = agent("ADM-1", AgentRole::Admin, &[]);
        let tagged = room("r1", RoomState::WaitingForAgent, &["visa", "hotels"]);
        let untagged = room("r2", RoomState::WaitingForAgent, &[]);
        let other = room("r3", RoomState::WaitingForAgent, &["flights"]);

        assert!(is_eligible(&visa, &tagged));
        assert!(is_eligible(&visa, &untagged));
        assert!(!is_eligible(&visa, &other));
        assert!(is_eligible(&admin, &other));
    }

    #[test]
    fn eligible_rooms_are_waiting_or_held() {
        let me = agent("EMP-1", AgentRole::Employee, &[]);
        let rooms = vec![
            room("waiting", RoomState::WaitingForAgent, &[]),
            room(
                "mine",
                RoomState::Assigned {
                    agent_id: "EMP-1".to_string(),
                },
                &["anything"],
            ),
            room(
                "theirs",
                RoomState::Assigned {
                    agent_id: "EMP-2".to_string(),
                },
                &[],
            ),
            room("assisted", RoomState::Assisted, &[]),
        ];
        let ids = eligible_rooms(&me, rooms)
            .into_iter()
            .map(|room| room.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["waiting", "mine"]);
    }

    #[tokio::test]
    async fn presence_toggles_and_removal() {
        let state = test_state(ScriptedLlm::failing());
        register_agent(&state, agent("EMP-1", AgentRole::Employee, &[]))
            .await
            .unwrap();
        let offline = set_agent_online(&state, "EMP-1", false).await.unwrap();
        assert!(!offline.online);
        remove_agent(&state, "EMP-1").await.unwrap();
        assert!(matches!(
            set_agent_online(&state, "EMP-1", true).await,
            Err(CoreError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_the_holder_may_post() {
        let state = test_state(ScriptedLlm::failing());
        for id in ["EMP-1", "EMP-2"] {
            register_agent(&state, agent(id, AgentRole::Employee, &[]))
                .await
                .unwrap();
        }
        state
            .store
            .insert_room(&room("r1", RoomState::WaitingForAgent, &[]))
            .await
            .unwrap();
        session::accept_room(&state, "r1", "EMP-1").await.unwrap();

        let err = post_agent_message(&state, "r1", "EMP-2", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Precondition { .. }));
        let message = post_agent_message(&state, "r1", "EMP-1", "hello")
            .await
            .unwrap();
        assert_eq!(message.sender_name, "Agent EMP-1");
    }

    #[tokio::test]
    async fn ids_that_break_pair_keys_are_refused() {
        let state = test_state(ScriptedLlm::failing());
        let err = register_agent(&state, agent("a__b", AgentRole::Employee, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidAgentId(_)));
        assert!(state.store.list_agents().await.unwrap().is_empty());
    }
}
