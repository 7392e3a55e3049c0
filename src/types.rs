use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Project identifier. Every table is scoped by this key so one store can
/// host several independent swarms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent identifier, unique per project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentName(String);

impl AgentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message importance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl Default for Importance {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Importance {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Unknown importance: {s}")),
        }
    }
}

/// Recovery state of a checkpointed bead context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    Pending,
    Recovered,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Recovered => "recovered",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RecoveryState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "recovered" => Ok(Self::Recovered),
            _ => Err(format!("Unknown recovery state: {s}")),
        }
    }
}

/// Agent projection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub project_key: ProjectKey,
    pub name: AgentName,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task_description: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Message projection row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMessage {
    pub id: Uuid,
    pub project_key: ProjectKey,
    pub from_agent: AgentName,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-recipient delivery state for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub message_id: Uuid,
    pub agent_name: AgentName,
    pub read_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Inbox view of one message from a particular agent's perspective.
/// `read_at`/`acknowledged_at` are `None` for thread broadcasts, which have
/// no per-recipient row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub message: SwarmMessage,
    pub read_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub broadcast: bool,
}

/// Receipt returned by `send_message`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub thread_id: Option<String>,
    pub recipient_count: usize,
}

/// Options for `send_message`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
}

/// Filters for `get_inbox`
#[derive(Debug, Clone)]
pub struct InboxFilter {
    pub limit: i64,
    pub urgent_only: bool,
    pub unread_only: bool,
    pub include_bodies: bool,
    pub thread_id: Option<String>,
}

impl Default for InboxFilter {
    fn default() -> Self {
        Self {
            limit: 50,
            urgent_only: false,
            unread_only: false,
            include_bodies: true,
            thread_id: None,
        }
    }
}

/// File reservation projection row. Active while `released_at` is unset and
/// `expires_at` is in the future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReservation {
    pub id: Uuid,
    pub project_key: ProjectKey,
    pub agent_name: AgentName,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl FileReservation {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

/// One rejected path from a reservation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConflict {
    pub path: String,
    pub held_by: AgentName,
    pub exclusive: bool,
    pub path_pattern: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of `reserve_files`. Partial grants are the normal outcome, not an
/// error: each requested path is decided independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub granted: Vec<FileReservation>,
    pub conflicts: Vec<ReservationConflict>,
}

impl ReservationOutcome {
    pub fn fully_granted(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Options for `reserve_files`
#[derive(Debug, Clone, Default)]
pub struct ReserveOptions {
    pub reason: Option<String>,
    pub exclusive: bool,
    pub ttl_seconds: Option<i64>,
}

/// Filters for `release_files`. Both empty means "all active reservations
/// held by the agent".
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    pub paths: Vec<String>,
    pub reservation_ids: Vec<Uuid>,
}

/// Per-consumer read offset into the event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub project_key: ProjectKey,
    pub consumer: String,
    pub after_sequence: i64,
    pub updated_at: DateTime<Utc>,
}

/// Latest-only checkpoint snapshot, keyed by (epic, bead, agent). The full
/// history stays in the event log; only the newest save is materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmBeadContext {
    pub epic_id: String,
    pub bead_id: String,
    pub agent_name: AgentName,
    pub task_description: String,
    pub files: Vec<String>,
    pub strategy: Option<String>,
    pub progress_percent: i32,
    pub last_milestone: Option<String>,
    pub directives: Vec<String>,
    pub files_touched: Vec<String>,
    pub checkpointed_at: DateTime<Utc>,
    pub recovery_state: RecoveryState,
}

/// Result of `load_checkpoint`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CheckpointLoad {
    /// No prior save for the key. Nothing is fabricated and no audit event
    /// is appended.
    FreshStart,
    Recovered(SwarmBeadContext),
}

impl CheckpointLoad {
    pub fn is_fresh_start(&self) -> bool {
        matches!(self, Self::FreshStart)
    }

    pub fn context(&self) -> Option<&SwarmBeadContext> {
        match self {
            Self::FreshStart => None,
            Self::Recovered(context) => Some(context),
        }
    }
}

/// Store-wide counters for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub project_key: Option<ProjectKey>,
    pub event_count: i64,
    pub latest_sequence: i64,
    pub agent_count: i64,
    pub message_count: i64,
    pub active_reservation_count: i64,
    pub checkpoint_count: i64,
}
