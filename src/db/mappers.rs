use crate::error::{Result, SwarmError};
use crate::events::{AgentEvent, EventPayload, EventType};
use crate::types::{
    Agent, AgentName, FileReservation, Importance, ProjectKey, RecoveryState, SwarmBeadContext,
    SwarmMessage,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub type EventRow = (i64, String, i64, String, serde_json::Value, DateTime<Utc>);

pub fn decode_event(row: EventRow) -> Result<AgentEvent> {
    let (id, project_key, sequence, event_type, data, created_at) = row;

    let stored_type = EventType::try_from(event_type.as_str()).map_err(SwarmError::DatabaseError)?;
    let payload: EventPayload = serde_json::from_value(data).map_err(|error| {
        SwarmError::DatabaseError(format!("Failed to decode event {id} payload: {error}"))
    })?;

    // The column discriminant and the tag inside the payload come from the
    // same enum at write time; a mismatch means external tampering.
    if payload.event_type() != stored_type {
        return Err(SwarmError::DatabaseError(format!(
            "Event {id} type column '{stored_type}' does not match payload tag '{}'",
            payload.event_type()
        )));
    }

    Ok(AgentEvent {
        id,
        project_key: ProjectKey::new(project_key),
        sequence,
        payload,
        created_at,
    })
}

pub type AgentRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

pub fn decode_agent(row: AgentRow) -> Agent {
    let (project_key, name, program, model, task_description, registered_at, last_active_at) = row;

    Agent {
        project_key: ProjectKey::new(project_key),
        name: AgentName::new(name),
        program,
        model,
        task_description,
        registered_at,
        last_active_at,
    }
}

pub type MessageRow = (
    Uuid,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    bool,
    DateTime<Utc>,
);

pub fn decode_message(row: MessageRow) -> Result<SwarmMessage> {
    let (id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at) =
        row;
    let importance =
        Importance::try_from(importance.as_str()).map_err(SwarmError::DatabaseError)?;

    Ok(SwarmMessage {
        id,
        project_key: ProjectKey::new(project_key),
        from_agent: AgentName::new(from_agent),
        subject,
        body,
        thread_id,
        importance,
        ack_required,
        created_at,
    })
}

pub type ReservationRow = (
    Uuid,
    String,
    String,
    String,
    bool,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

pub fn decode_reservation(row: ReservationRow) -> FileReservation {
    let (
        id,
        project_key,
        agent_name,
        path_pattern,
        exclusive,
        reason,
        created_at,
        expires_at,
        released_at,
    ) = row;

    FileReservation {
        id,
        project_key: ProjectKey::new(project_key),
        agent_name: AgentName::new(agent_name),
        path_pattern,
        exclusive,
        reason,
        created_at,
        expires_at,
        released_at,
    }
}

pub type ContextRow = (
    String,
    String,
    String,
    String,
    serde_json::Value,
    Option<String>,
    i32,
    Option<String>,
    serde_json::Value,
    serde_json::Value,
    DateTime<Utc>,
    String,
);

pub fn decode_context(row: ContextRow) -> Result<SwarmBeadContext> {
    let (
        epic_id,
        bead_id,
        agent_name,
        task_description,
        files,
        strategy,
        progress_percent,
        last_milestone,
        directives,
        files_touched,
        checkpointed_at,
        recovery_state,
    ) = row;

    let recovery_state =
        RecoveryState::try_from(recovery_state.as_str()).map_err(SwarmError::DatabaseError)?;

    Ok(SwarmBeadContext {
        epic_id,
        bead_id,
        agent_name: AgentName::new(agent_name),
        task_description,
        files: decode_string_list(files, "files")?,
        strategy,
        progress_percent,
        last_milestone,
        directives: decode_string_list(directives, "directives")?,
        files_touched: decode_string_list(files_touched, "files_touched")?,
        checkpointed_at,
        recovery_state,
    })
}

fn decode_string_list(value: serde_json::Value, column: &str) -> Result<Vec<String>> {
    serde_json::from_value(value).map_err(|error| {
        SwarmError::DatabaseError(format!("Failed to decode {column} column: {error}"))
    })
}
