use std::{
    collections::{BTreeSet, HashMap},
    sync::{atomic::AtomicUsize, Arc},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::config::Settings;
use crate::escalation::EscalationCoordinator;
use crate::faq::FaqMatcher;
use crate::llm::CompletionService;
use crate::locale::LocaleTable;
use crate::notify::BroadcastNotifier;
use crate::presence::FanoutTracker;
use crate::profile::ProfileLookup;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    File,
    Bot,
    System,
}

impl MessageType {
    pub fn is_attachment(self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::File)
    }
}

/// How an automated reply went. Only bot messages carry one; the escalation
/// counter can be rebuilt from these markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotOutcome {
    Welcome,
    Answered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub seq: u64,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub created_at: i64,
    pub payload: String,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_outcome: Option<BotOutcome>,
}

/// A message before the store has assigned it an id and order key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub sender_id: String,
    pub sender_name: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub created_at: i64,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_outcome: Option<BotOutcome>,
}

impl MessageDraft {
    pub fn text(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            kind: MessageType::Text,
            created_at: now_millis(),
            payload: text.to_string(),
            bot_outcome: None,
        }
    }

    pub fn bot(text: &str, outcome: BotOutcome) -> Self {
        Self {
            sender_id: BOT_SENDER_ID.to_string(),
            sender_name: BOT_SENDER_NAME.to_string(),
            kind: MessageType::Bot,
            created_at: now_millis(),
            payload: text.to_string(),
            bot_outcome: Some(outcome),
        }
    }

    pub fn system(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            kind: MessageType::System,
            created_at: now_millis(),
            payload: text.to_string(),
            bot_outcome: None,
        }
    }

    pub fn at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }
}

pub const BOT_SENDER_ID: &str = "__bot__";
pub const BOT_SENDER_NAME: &str = "Assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedBy {
    Client,
    Employee,
}

impl ClosedBy {
    /// Payload of the system message that records the close.
    pub fn marker(self) -> &'static str {
        match self {
            Self::Client => "closed_by_client",
            Self::Employee => "closed_by_employee",
        }
    }
}

/// Lifecycle of a support room. `EscalationOffered` is not a state: it is
/// derived from the escalation counter, see `escalation::can_offer_handoff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoomState {
    LanguageSelection,
    Assisted,
    WaitingForAgent,
    Assigned {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    Closed {
        #[serde(rename = "closedBy")]
        closed_by: ClosedBy,
    },
}

impl RoomState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LanguageSelection => "language_selection",
            Self::Assisted => "assisted",
            Self::WaitingForAgent => "waiting_for_agent",
            Self::Assigned { .. } => "assigned",
            Self::Closed { closed_by } => closed_by.marker(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub party_id: String,
    pub party_name: String,
    pub created_at: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    pub state: RoomState,
    /// Specialization tags an agent needs to see this room while it waits.
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Bumped by the store on every successful compare-and-swap.
    #[serde(default)]
    pub version: u64,
}

impl Room {
    pub fn waiting_for_agent(&self) -> bool {
        matches!(self.state, RoomState::WaitingForAgent)
    }

    pub fn agent_accepted(&self) -> bool {
        matches!(self.state, RoomState::Assigned { .. })
    }

    pub fn assigned_to(&self) -> Option<&str> {
        match &self.state {
            RoomState::Assigned { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    pub fn language_or_default(&self) -> &str {
        self.language.as_deref().unwrap_or("en")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub party_id: String,
    pub party_name: String,
    pub created_at: i64,
    pub language: Option<String>,
    pub locale: Option<String>,
    pub status: String,
    pub waiting_for_agent: bool,
    pub agent_accepted: bool,
    pub assigned_to: Option<String>,
    pub can_offer_human_handoff: bool,
    pub required_tags: Vec<String>,
}

impl RoomSummary {
    pub fn project(room: &Room, can_offer_human_handoff: bool) -> Self {
        Self {
            id: room.id.clone(),
            party_id: room.party_id.clone(),
            party_name: room.party_name.clone(),
            created_at: room.created_at,
            language: room.language.clone(),
            locale: room.locale.clone(),
            status: room.state.label().to_string(),
            waiting_for_agent: room.waiting_for_agent(),
            agent_accepted: room.agent_accepted(),
            assigned_to: room.assigned_to().map(str::to_string),
            can_offer_human_handoff,
            required_tags: room.required_tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Employee,
    Admin,
    Manager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub online: bool,
    /// Specialization tags ("providers").
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorProfile {
    pub display_name: String,
    #[serde(default)]
    pub preferred_language: Option<String>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    /// Agent id behind each agent connection.
    pub agents: HashMap<usize, String>,
    pub trackers: HashMap<usize, Arc<FanoutTracker>>,
    /// Snapshot/cue forwarding tasks owned by a connection.
    pub forwarders: HashMap<usize, Vec<JoinHandle<()>>>,
}

pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub llm: Arc<dyn CompletionService>,
    pub faq: Arc<dyn FaqMatcher>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub notifier: Arc<BroadcastNotifier>,
    pub locales: Arc<LocaleTable>,
    pub escalation: EscalationCoordinator,
    pub settings: Settings,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        llm: Arc<dyn CompletionService>,
        faq: Arc<dyn FaqMatcher>,
        profiles: Arc<dyn ProfileLookup>,
        locales: Arc<LocaleTable>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            llm,
            faq,
            profiles,
            notifier: Arc::new(BroadcastNotifier::default()),
            locales,
            escalation: EscalationCoordinator::new(),
            settings,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRoomBody {
    pub party_id: String,
    #[serde(default)]
    pub party_name: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectLanguageBody {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub locale: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub sender_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBody {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub from_agent_id: String,
    pub to_agent_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBody {
    pub closed_by: ClosedBy,
    pub actor_id: String,
    #[serde(default)]
    pub actor_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineBody {
    pub online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentBody {
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Upload URL or data URI produced by the client.
    pub reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffMessageBody {
    pub sender_id: String,
    /// Absent for the broadcast room.
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct StaffHistoryQuery {
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}
