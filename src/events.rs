use crate::types::{AgentName, Importance, ProjectKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Closed set of event kinds stored in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    MessageSent,
    MessageRead,
    MessageAcknowledged,
    ReservationGranted,
    ReservationReleased,
    CheckpointCreated,
    CheckpointRecovered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRegistered => "agent_registered",
            Self::MessageSent => "message_sent",
            Self::MessageRead => "message_read",
            Self::MessageAcknowledged => "message_acknowledged",
            Self::ReservationGranted => "reservation_granted",
            Self::ReservationReleased => "reservation_released",
            Self::CheckpointCreated => "checkpoint_created",
            Self::CheckpointRecovered => "checkpoint_recovered",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EventType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "agent_registered" => Ok(Self::AgentRegistered),
            "message_sent" => Ok(Self::MessageSent),
            "message_read" => Ok(Self::MessageRead),
            "message_acknowledged" => Ok(Self::MessageAcknowledged),
            "reservation_granted" => Ok(Self::ReservationGranted),
            "reservation_released" => Ok(Self::ReservationReleased),
            "checkpoint_created" => Ok(Self::CheckpointCreated),
            "checkpoint_recovered" => Ok(Self::CheckpointRecovered),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// Snapshot of a bead context as carried inside checkpoint events. The
/// projection adds `checkpointed_at` and `recovery_state` from the event
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
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
}

/// Typed event payloads. The serde tag doubles as the `event_type` column so
/// the discriminant in the row and in the JSON can never drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentRegistered {
        name: AgentName,
        program: Option<String>,
        model: Option<String>,
        task_description: Option<String>,
    },
    MessageSent {
        message_id: Uuid,
        from_agent: AgentName,
        to_agents: Vec<AgentName>,
        subject: String,
        body: String,
        thread_id: Option<String>,
        importance: Importance,
        ack_required: bool,
    },
    MessageRead {
        message_id: Uuid,
        agent_name: AgentName,
    },
    MessageAcknowledged {
        message_id: Uuid,
        agent_name: AgentName,
    },
    ReservationGranted {
        reservation_id: Uuid,
        agent_name: AgentName,
        path_pattern: String,
        exclusive: bool,
        reason: Option<String>,
        ttl_seconds: i64,
    },
    ReservationReleased {
        reservation_id: Uuid,
        agent_name: AgentName,
    },
    CheckpointCreated {
        context: CheckpointPayload,
    },
    CheckpointRecovered {
        epic_id: String,
        bead_id: String,
        agent_name: AgentName,
        recovered_by: Option<AgentName>,
        found: bool,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AgentRegistered { .. } => EventType::AgentRegistered,
            Self::MessageSent { .. } => EventType::MessageSent,
            Self::MessageRead { .. } => EventType::MessageRead,
            Self::MessageAcknowledged { .. } => EventType::MessageAcknowledged,
            Self::ReservationGranted { .. } => EventType::ReservationGranted,
            Self::ReservationReleased { .. } => EventType::ReservationReleased,
            Self::CheckpointCreated { .. } => EventType::CheckpointCreated,
            Self::CheckpointRecovered { .. } => EventType::CheckpointRecovered,
        }
    }

    /// The agent whose activity this event represents, when there is one.
    /// Used by the projection engine to bump `last_active_at`.
    pub fn acting_agent(&self) -> Option<&AgentName> {
        match self {
            Self::AgentRegistered { name, .. } => Some(name),
            Self::MessageSent { from_agent, .. } => Some(from_agent),
            Self::MessageRead { agent_name, .. }
            | Self::MessageAcknowledged { agent_name, .. }
            | Self::ReservationGranted { agent_name, .. }
            | Self::ReservationReleased { agent_name, .. } => Some(agent_name),
            Self::CheckpointCreated { context } => Some(&context.agent_name),
            Self::CheckpointRecovered { recovered_by, .. } => recovered_by.as_ref(),
        }
    }
}

/// One immutable fact from the log. `sequence` totally orders all events
/// within a project; cross-project ordering is undefined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: i64,
    pub project_key: ProjectKey,
    pub sequence: i64,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

impl AgentEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
