use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tower_http::cors::CorsLayer;

use crate::assistant;
use crate::config::Settings;
use crate::error::{Result, StartupError};
use crate::faq::KeywordFaq;
use crate::llm::OpenAiCompletion;
use crate::locale::LocaleTable;
use crate::message_log;
use crate::notify::Cue;
use crate::presence::{FanoutTracker, UnreadTracker};
use crate::profile::StaticProfiles;
use crate::roster;
use crate::session::{self, OpenRoom};
use crate::staff::{self, Recipient};
use crate::store::{DocumentStore, MemoryStore, PgStore};
use crate::types::*;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(state: &Arc<AppState>, client_id: usize, event: &str, data: T) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn track_forwarder(state: &Arc<AppState>, client_id: usize, handle: tokio::task::JoinHandle<()>) {
    let mut rt = state.realtime.lock().await;
    if rt.clients.contains_key(&client_id) {
        rt.forwarders.entry(client_id).or_default().push(handle);
    } else {
        handle.abort();
    }
}

/// Visitor and agent messages share one route; the sender decides which.
async fn dispatch_message(
    state: &Arc<AppState>,
    room_id: &str,
    sender_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    let room = session::get_room(state, room_id).await?;
    if room.party_id == sender_id {
        assistant::post_visitor_message(state, room_id, sender_id, text).await
    } else {
        roster::post_agent_message(state, room_id, sender_id, text).await
    }
}

/// Accept an upload URL or a data URI as an attachment reference.
async fn resolve_reference(reference: String) -> std::result::Result<String, String> {
    let trimmed = reference.trim();
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") || trimmed.starts_with("data:") {
        Ok(trimmed.to_string())
    } else {
        Err("unsupported attachment reference".to_string())
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn post_room(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OpenRoomBody>,
) -> Result<Json<RoomSummary>> {
    let room = session::open_room(
        &state,
        OpenRoom {
            party_id: &body.party_id,
            party_name: body.party_name.as_deref(),
            room_id: body.room_id.as_deref(),
            required_tags: body.required_tags,
        },
    )
    .await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn get_room(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoomSummary>> {
    Ok(Json(session::summary(&state, &room_id).await?))
}

async fn get_messages(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>> {
    Ok(Json(message_log::history(state.store.as_ref(), &room_id).await?))
}

async fn post_language(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectLanguageBody>,
) -> Result<Json<RoomSummary>> {
    let room = session::select_language(&state, &room_id, &body.language, &body.locale).await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn post_message(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ChatMessage>> {
    Ok(Json(
        dispatch_message(&state, &room_id, &body.sender_id, &body.text).await?,
    ))
}

async fn post_attachment(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AttachmentBody>,
) -> Result<Json<ChatMessage>> {
    let sender_name = body.sender_name.as_deref().unwrap_or(&body.sender_id).to_string();
    let message = message_log::append_attachment(
        state.store.as_ref(),
        &room_id,
        &body.sender_id,
        &sender_name,
        body.kind,
        resolve_reference(body.reference),
    )
    .await?;
    Ok(Json(message))
}

async fn post_request_agent(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoomSummary>> {
    let room = session::request_agent(&state, &room_id).await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn post_accept(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AcceptBody>,
) -> Result<Json<RoomSummary>> {
    let room = session::accept_room(&state, &room_id, &body.agent_id).await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn post_transfer(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TransferBody>,
) -> Result<Json<RoomSummary>> {
    let room =
        session::transfer(&state, &room_id, &body.from_agent_id, &body.to_agent_id).await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn post_close(
    Path(room_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseBody>,
) -> Result<Json<RoomSummary>> {
    let actor_name = body.actor_name.as_deref().unwrap_or(&body.actor_id);
    let room = session::close(&state, &room_id, body.closed_by, &body.actor_id, actor_name).await?;
    Ok(Json(session::summarize(&state, &room).await))
}

async fn get_agents(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AgentProfile>>> {
    Ok(Json(roster::list_agents(&state).await?))
}

async fn post_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentProfile>,
) -> Result<Json<AgentProfile>> {
    Ok(Json(roster::register_agent(&state, body).await?))
}

async fn patch_agent_online(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<OnlineBody>,
) -> Result<Json<AgentProfile>> {
    Ok(Json(
        roster::set_agent_online(&state, &agent_id, body.online).await?,
    ))
}

async fn delete_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>> {
    roster::remove_agent(&state, &agent_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_agent_rooms(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RoomSummary>>> {
    let rooms = roster::list_eligible_rooms(&state, &agent_id).await?;
    let mut summaries = Vec::with_capacity(rooms.len());
    for room in &rooms {
        summaries.push(session::summarize(&state, room).await);
    }
    Ok(Json(summaries))
}

async fn post_staff_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StaffMessageBody>,
) -> Result<Json<ChatMessage>> {
    let recipient = Recipient::from_option(body.recipient_id.as_deref());
    Ok(Json(
        staff::send_staff_message(&state, &body.sender_id, &recipient, &body.text).await?,
    ))
}

async fn get_staff_messages(
    Path(agent_id): Path<String>,
    Query(query): Query<StaffHistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChatMessage>>> {
    let recipient = Recipient::from_option(query.with.as_deref());
    Ok(Json(staff::staff_history(&state, &agent_id, &recipient).await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }
    tracing::debug!(client_id, "socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        if let Err(err) = handle_event(&state, client_id, &envelope).await {
            tracing::warn!(client_id, event = %envelope.event, "socket event failed: {}", err);
            emit_to_client(
                &state,
                client_id,
                "error",
                json!({ "event": envelope.event, "error": err.to_string() }),
            )
            .await;
        }
    }

    disconnect(&state, client_id).await;
    send_task.abort();
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

async fn handle_event(state: &Arc<AppState>, client_id: usize, envelope: &EventEnvelopeIn) -> Result<()> {
    let data = &envelope.data;
    let field = |key: &str| str_field(data, key);

    match envelope.event.as_str() {
        "room:join" => {
            if let Some(room_id) = field("roomId") {
                join_room(state, client_id, room_id).await?;
            }
        }
        "room:message" => {
            if let (Some(room_id), Some(sender_id), Some(text)) =
                (field("roomId"), field("senderId"), field("text"))
            {
                dispatch_message(state, room_id, sender_id, text).await?;
            }
        }
        "agent:join" => {
            if let Some(agent_id) = field("agentId") {
                join_agent(state, client_id, agent_id).await?;
            }
        }
        "agent:open-room" => {
            if let Some(room_id) = field("roomId") {
                let tracker = state.realtime.lock().await.trackers.get(&client_id).cloned();
                if let Some(tracker) = tracker {
                    tracker.open_room(room_id).await?;
                }
            }
        }
        "agent:blur" => {
            let tracker = state.realtime.lock().await.trackers.get(&client_id).cloned();
            if let Some(tracker) = tracker {
                tracker.unfocus();
            }
        }
        "staff:message" => {
            if let (Some(sender_id), Some(text)) = (field("senderId"), field("text")) {
                let recipient = Recipient::from_option(field("recipientId"));
                staff::send_staff_message(state, sender_id, &recipient, text).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Stream a room's messages and state to one socket.
async fn join_room(state: &Arc<AppState>, client_id: usize, room_id: &str) -> Result<()> {
    let summary = session::summary(state, room_id).await?;
    let mut messages = message_log::subscribe(state.store.as_ref(), room_id).await?;
    let mut rooms = state.store.subscribe_rooms().await?;
    let mut cues = state.notifier.subscribe();
    emit_to_client(state, client_id, "room:state", &summary).await;

    let forward_state = state.clone();
    let room_id = room_id.to_string();
    let handle = tokio::spawn(async move {
        let state = forward_state;
        let mut last_summary = Some(summary);
        loop {
            tokio::select! {
                next = messages.next() => {
                    let Some(snapshot) = next else { break };
                    emit_to_client(
                        &state,
                        client_id,
                        "room:messages",
                        json!({ "roomId": room_id, "messages": snapshot }),
                    )
                    .await;
                }
                next = rooms.next() => {
                    let Some(list) = next else { break };
                    let Some(room) = list.iter().find(|room| room.id == room_id) else {
                        continue;
                    };
                    let summary = session::summarize(&state, room).await;
                    if last_summary.as_ref() != Some(&summary) {
                        emit_to_client(&state, client_id, "room:state", &summary).await;
                        last_summary = Some(summary);
                    }
                }
                cue = cues.recv() => match cue {
                    Ok(Cue::HandoffAvailable { room_id: cued }) if cued == room_id => {
                        if let Ok(summary) = session::summary(&state, &room_id).await {
                            emit_to_client(&state, client_id, "room:state", &summary).await;
                            last_summary = Some(summary);
                        }
                    }
                    Err(RecvError::Closed) => break,
                    _ => {}
                },
            }
        }
    });
    track_forwarder(state, client_id, handle).await;
    Ok(())
}

/// Start unread tracking for an agent socket and forward its unread set,
/// eligible rooms and cues.
async fn join_agent(state: &Arc<AppState>, client_id: usize, agent_id: &str) -> Result<()> {
    let agent = roster::get_agent(state, agent_id).await?;
    let tracker = Arc::new(
        FanoutTracker::start(agent_id, state.store.clone(), state.notifier.clone()).await?,
    );
    let previous = {
        let mut rt = state.realtime.lock().await;
        rt.agents.insert(client_id, agent.id.clone());
        rt.trackers.insert(client_id, tracker.clone())
    };
    if let Some(previous) = previous {
        previous.shutdown().await;
    }

    let mut unread = tracker.subscribe_unread();
    let mut rooms = state.store.subscribe_rooms().await?;
    let mut cues = state.notifier.subscribe();
    let forward_state = state.clone();
    let handle = tokio::spawn(async move {
        let state = forward_state;
        let initial = unread.borrow_and_update().clone();
        emit_to_client(&state, client_id, "agent:unread", json!({ "rooms": initial })).await;
        loop {
            tokio::select! {
                changed = unread.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let set = unread.borrow_and_update().clone();
                    emit_to_client(&state, client_id, "agent:unread", json!({ "rooms": set })).await;
                }
                next = rooms.next() => {
                    let Some(list) = next else { break };
                    let Ok(agent) = roster::get_agent(&state, &agent.id).await else {
                        continue;
                    };
                    let mut summaries = Vec::new();
                    for room in roster::eligible_rooms(&agent, list) {
                        summaries.push(session::summarize(&state, &room).await);
                    }
                    emit_to_client(&state, client_id, "agent:rooms", summaries).await;
                }
                cue = cues.recv() => match cue {
                    Ok(cue) if cue.agent_ids().contains(&agent.id.as_str()) => {
                        emit_to_client(&state, client_id, "cue", &cue).await;
                    }
                    Err(RecvError::Closed) => break,
                    _ => {}
                },
            }
        }
    });
    track_forwarder(state, client_id, handle).await;
    tracing::info!(client_id, agent_id, "agent connected");
    Ok(())
}

/// Release every subscription a socket held.
async fn disconnect(state: &Arc<AppState>, client_id: usize) {
    let (forwarders, tracker, agent_id) = {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        (
            rt.forwarders.remove(&client_id).unwrap_or_default(),
            rt.trackers.remove(&client_id),
            rt.agents.remove(&client_id),
        )
    };
    for handle in forwarders {
        handle.abort();
    }
    if let Some(tracker) = tracker {
        tracker.shutdown().await;
    }
    tracing::debug!(client_id, agent_id = agent_id.as_deref(), "socket disconnected");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/room", post(post_room))
        .route("/api/room/{room_id}", get(get_room))
        .route("/api/room/{room_id}/messages", get(get_messages))
        .route("/api/room/{room_id}/language", post(post_language))
        .route("/api/room/{room_id}/message", post(post_message))
        .route("/api/room/{room_id}/attachment", post(post_attachment))
        .route("/api/room/{room_id}/request-agent", post(post_request_agent))
        .route("/api/room/{room_id}/accept", post(post_accept))
        .route("/api/room/{room_id}/transfer", post(post_transfer))
        .route("/api/room/{room_id}/close", post(post_close))
        .route("/api/agents", get(get_agents).post(post_agent))
        .route("/api/agents/{agent_id}", delete(delete_agent))
        .route("/api/agents/{agent_id}/online", patch(patch_agent_online))
        .route("/api/agents/{agent_id}/rooms", get(get_agent_rooms))
        .route("/api/staff/message", post(post_staff_message))
        .route("/api/staff/{agent_id}/messages", get(get_staff_messages))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> std::result::Result<(), StartupError> {
    let settings = Settings::from_env()?;
    let locales = Arc::new(LocaleTable::load(settings.locale_table_path.as_deref())?);
    let faq = Arc::new(KeywordFaq::load(settings.faq_path.as_deref())?);
    tracing::info!(entries = faq.len(), "faq loaded");

    let store: Arc<dyn DocumentStore> = match settings.database_url.as_deref() {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    if settings.llm.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set, the assistant will use canned replies");
    }
    let llm = Arc::new(OpenAiCompletion::new(settings.llm.clone()));

    let port = settings.port;
    let state = Arc::new(AppState::new(
        store,
        llm,
        faq,
        Arc::new(StaticProfiles::new()),
        locales,
        settings,
    ));

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("support chat server running at http://localhost:{port}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
