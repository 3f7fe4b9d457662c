use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    PgPool, Row,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CasOutcome, DocumentStore, SnapshotHub, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::message_log::order_messages;
use crate::types::{AgentProfile, ChatMessage, MessageDraft, Room};

const CHANGE_CHANNEL: &str = "chat_changes";

/// Postgres-backed store. Writers announce changes with `pg_notify`, so
/// subscribers in every process see the same snapshots.
pub struct PgStore {
    pool: PgPool,
    hub: Arc<SnapshotHub>,
    listener: JoinHandle<()>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let hub = Arc::new(SnapshotHub::new(
            load_rooms(&pool).await?,
            load_agents(&pool).await?,
        ));

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let listener = tokio::spawn(listen_for_changes(listener, pool.clone(), hub.clone()));

        info!("connected to postgres document store");
        Ok(Self {
            pool,
            hub,
            listener,
        })
    }

    async fn announce(&self, payload: &str) -> StoreResult<()> {
        refresh(&self.pool, &self.hub, payload).await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Drop for PgStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_for_changes(mut listener: PgListener, pool: PgPool, hub: Arc<SnapshotHub>) {
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                if let Err(err) = refresh(&pool, &hub, notification.payload()).await {
                    warn!("failed to refresh after {}: {}", notification.payload(), err);
                }
            }
            Ok(None) => {
                // Notifications sent while disconnected are lost: re-derive
                // every watched collection from the tables.
                debug!("change listener reconnected, resyncing watched collections");
                if let Err(err) = refresh_all(&pool, &hub).await {
                    warn!("resync after reconnect failed: {}", err);
                }
            }
            Err(err) => {
                warn!("change listener error: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn refresh(pool: &PgPool, hub: &SnapshotHub, payload: &str) -> StoreResult<()> {
    if payload == "rooms" {
        hub.publish_rooms(load_rooms(pool).await?);
    } else if payload == "agents" {
        hub.publish_agents(load_agents(pool).await?);
    } else if let Some(room_id) = payload.strip_prefix("purge:") {
        hub.close_messages(room_id).await;
    } else if let Some(room_id) = payload.strip_prefix("messages:") {
        if hub.is_watched(room_id).await {
            hub.publish_messages(room_id, load_messages(pool, room_id).await?)
                .await;
        }
    }
    Ok(())
}

async fn refresh_all(pool: &PgPool, hub: &SnapshotHub) -> StoreResult<()> {
    hub.publish_rooms(load_rooms(pool).await?);
    hub.publish_agents(load_agents(pool).await?);
    for room_id in hub.watched_rooms().await {
        hub.publish_messages(&room_id, load_messages(pool, &room_id).await?)
            .await;
    }
    Ok(())
}

fn room_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Room> {
    let mut room = serde_json::from_str::<Room>(&row.get::<String, _>("doc"))?;
    room.version = row.get::<i64, _>("version") as u64;
    Ok(room)
}

async fn load_room(pool: &PgPool, room_id: &str) -> StoreResult<Option<Room>> {
    let row = sqlx::query("SELECT version, doc FROM rooms WHERE id = $1")
        .bind(room_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(room_from_row).transpose()
}

async fn load_rooms(pool: &PgPool) -> StoreResult<Vec<Room>> {
    let rows = sqlx::query("SELECT version, doc FROM rooms ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(room_from_row).collect()
}

async fn load_agents(pool: &PgPool) -> StoreResult<Vec<AgentProfile>> {
    let rows = sqlx::query("SELECT doc FROM agents ORDER BY id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            serde_json::from_str::<AgentProfile>(&row.get::<String, _>("doc"))
                .map_err(StoreError::from)
        })
        .collect()
}

async fn load_messages(pool: &PgPool, room_id: &str) -> StoreResult<Vec<ChatMessage>> {
    let rows = sqlx::query("SELECT seq, doc FROM room_messages WHERE room_id = $1")
        .bind(room_id)
        .fetch_all(pool)
        .await?;
    let reader_rows = sqlx::query(
        "SELECT r.message_id, r.reader_id FROM message_readers r \
         JOIN room_messages m ON m.id = r.message_id \
         WHERE m.room_id = $1",
    )
    .bind(room_id)
    .fetch_all(pool)
    .await?;

    let mut readers = HashMap::<String, Vec<String>>::new();
    for row in reader_rows {
        readers
            .entry(row.get("message_id"))
            .or_default()
            .push(row.get("reader_id"));
    }

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let mut message = serde_json::from_str::<ChatMessage>(&row.get::<String, _>("doc"))?;
        message.seq = row.get::<i64, _>("seq") as u64;
        if let Some(ids) = readers.remove(&message.id) {
            message.read_by.extend(ids);
        }
        messages.push(message);
    }
    order_messages(&mut messages);
    Ok(messages)
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_room(&self, room: &Room) -> StoreResult<()> {
        // the partial unique index on open rooms makes the party check atomic
        let inserted = sqlx::query(
            "INSERT INTO rooms (id, party_id, version, created_at, doc, is_open) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(&room.id)
        .bind(&room.party_id)
        .bind(room.version as i64)
        .bind(room.created_at)
        .bind(serde_json::to_string(room)?)
        .bind(!room.state.is_closed())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted == 0 {
            if load_room(&self.pool, &room.id).await?.is_some() {
                return Err(StoreError::AlreadyExists {
                    entity: "room",
                    id: room.id.clone(),
                });
            }
            return Err(StoreError::PartyHasOpenRoom {
                party_id: room.party_id.clone(),
            });
        }
        self.announce("rooms").await
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<Room>> {
        load_room(&self.pool, room_id).await
    }

    async fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        load_rooms(&self.pool).await
    }

    async fn compare_and_swap_room(
        &self,
        room: &Room,
        expected_version: u64,
    ) -> StoreResult<CasOutcome> {
        let mut stored = room.clone();
        stored.version = expected_version + 1;
        let updated = sqlx::query(
            "UPDATE rooms SET doc = $1, version = $2, is_open = $5 WHERE id = $3 AND version = $4",
        )
        .bind(serde_json::to_string(&stored)?)
        .bind(stored.version as i64)
        .bind(&room.id)
        .bind(expected_version as i64)
        .bind(!stored.state.is_closed())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(CasOutcome::Conflict(load_room(&self.pool, &room.id).await?));
        }
        self.announce("rooms").await?;
        Ok(CasOutcome::Applied(stored))
    }

    async fn delete_room(&self, room_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        self.announce("rooms").await
    }

    async fn append_message(&self, room_id: &str, draft: MessageDraft) -> StoreResult<ChatMessage> {
        let mut message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            seq: 0,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            kind: draft.kind,
            created_at: draft.created_at,
            payload: draft.payload,
            read_by: Default::default(),
            bot_outcome: draft.bot_outcome,
        };
        let seq = sqlx::query_scalar::<_, i64>(
            "INSERT INTO room_messages (id, room_id, created_at, doc) VALUES ($1, $2, $3, $4) \
             RETURNING seq",
        )
        .bind(&message.id)
        .bind(room_id)
        .bind(message.created_at)
        .bind(serde_json::to_string(&message)?)
        .fetch_one(&self.pool)
        .await?;
        message.seq = seq as u64;
        self.announce(&format!("messages:{room_id}")).await?;
        Ok(message)
    }

    async fn messages(&self, room_id: &str) -> StoreResult<Vec<ChatMessage>> {
        load_messages(&self.pool, room_id).await
    }

    async fn mark_read(
        &self,
        room_id: &str,
        message_id: &str,
        reader_id: &str,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO message_readers (message_id, reader_id) \
             SELECT id, $2 FROM room_messages WHERE id = $1 AND room_id = $3 \
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id)
        .bind(reader_id)
        .bind(room_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted > 0 {
            self.announce(&format!("messages:{room_id}")).await?;
        }
        Ok(inserted > 0)
    }

    async fn purge_messages(&self, room_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM message_readers WHERE message_id IN \
             (SELECT id FROM room_messages WHERE room_id = $1)",
        )
        .bind(room_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM room_messages WHERE room_id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.announce(&format!("purge:{room_id}")).await
    }

    async fn put_agent(&self, agent: &AgentProfile) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agents (id, doc) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc",
        )
        .bind(&agent.id)
        .bind(serde_json::to_string(agent)?)
        .execute(&self.pool)
        .await?;
        self.announce("agents").await
    }

    async fn remove_agent(&self, agent_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        self.announce("agents").await
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentProfile>> {
        let doc = sqlx::query_scalar::<_, String>("SELECT doc FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc.map(|doc| serde_json::from_str(&doc)).transpose()?)
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentProfile>> {
        load_agents(&self.pool).await
    }

    async fn subscribe_messages(&self, room_id: &str) -> StoreResult<Subscription<Vec<ChatMessage>>> {
        let snapshot = load_messages(&self.pool, room_id).await?;
        let subscription = self.hub.subscribe_messages(room_id, snapshot).await;
        // A write between the load above and channel creation would have
        // found nobody watching; reload once now that the channel exists.
        self.hub
            .publish_messages(room_id, load_messages(&self.pool, room_id).await?)
            .await;
        Ok(subscription)
    }

    async fn subscribe_rooms(&self) -> StoreResult<Subscription<Vec<Room>>> {
        Ok(self.hub.subscribe_rooms())
    }

    async fn subscribe_agents(&self) -> StoreResult<Subscription<Vec<AgentProfile>>> {
        Ok(self.hub.subscribe_agents())
    }

    fn active_subscriptions(&self) -> usize {
        self.hub.active()
    }
}
