use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::{AgentEvent, EventPayload, EventType};
use crate::types::ProjectKey;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::debug;

/// Filters for [`SwarmDb::read_events`]. All fields are optional; the
/// default reads everything up to [`crate::config::DEFAULT_READ_LIMIT`]
/// rows in sequence order.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_key: Option<ProjectKey>,
    pub types: Option<Vec<EventType>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub after_sequence: Option<i64>,
    pub limit: Option<i64>,
}

impl EventFilter {
    #[must_use]
    pub fn for_project(project_key: &ProjectKey) -> Self {
        Self {
            project_key: Some(project_key.clone()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn after_sequence(mut self, sequence: i64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    #[must_use]
    pub fn with_types(mut self, types: Vec<EventType>) -> Self {
        self.types = Some(types);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl SwarmDb {
    /// Append one event and apply it to the projections, atomically.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when persistence fails, or a
    /// transaction error when commit/rollback fails.
    pub async fn append_event(
        &self,
        project_key: &ProjectKey,
        payload: EventPayload,
    ) -> Result<AgentEvent> {
        let project = project_key.clone();
        self.with_transaction(move |tx| {
            Box::pin(async move {
                let event = append_event_in_tx(tx, &project, payload).await?;
                super::projections::apply_event_in_tx(tx, &event).await?;
                Ok(event)
            })
        })
        .await
    }

    /// Read events matching the filter in ascending sequence order.
    /// `after_sequence` is the resumable-read primitive used by cursors.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query or row decoding
    /// fails.
    pub async fn read_events(&self, filter: &EventFilter) -> Result<Vec<AgentEvent>> {
        let type_names: Option<Vec<String>> = filter
            .types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());
        let limit = filter
            .limit
            .unwrap_or(crate::config::DEFAULT_READ_LIMIT)
            .max(1);

        let rows = sqlx::query_as::<_, mappers::EventRow>(
            "SELECT id, project_key, sequence, event_type, data, created_at
             FROM agent_events
             WHERE ($1::text IS NULL OR project_key = $1)
               AND ($2::text[] IS NULL OR event_type = ANY($2))
               AND ($3::timestamptz IS NULL OR created_at >= $3)
               AND ($4::timestamptz IS NULL OR created_at <= $4)
               AND ($5::bigint IS NULL OR sequence > $5)
             ORDER BY project_key ASC, sequence ASC
             LIMIT $6",
        )
        .bind(filter.project_key.as_ref().map(|p| p.value().to_string()))
        .bind(type_names)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.after_sequence)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to read events: {error}")))?;

        rows.into_iter().map(mappers::decode_event).collect()
    }

    /// Highest sequence assigned for the project; 0 when no events exist.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_latest_sequence(&self, project_key: &ProjectKey) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT last_sequence FROM event_sequences WHERE project_key = $1",
        )
        .bind(project_key.value())
        .fetch_optional(self.pool())
        .await
        .map(|value| value.unwrap_or(0))
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to read latest sequence: {error}"))
        })
    }
}

/// Assign the next per-project sequence and insert the event, inside the
/// caller's transaction. The counter upsert takes a row lock, so concurrent
/// appenders serialize here and sequences come out contiguous: the counter
/// only advances when the surrounding transaction commits.
pub(crate) async fn append_event_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    project_key: &ProjectKey,
    payload: EventPayload,
) -> Result<AgentEvent> {
    let sequence = sqlx::query_scalar::<_, i64>(
        "INSERT INTO event_sequences (project_key, last_sequence) VALUES ($1, 1)
         ON CONFLICT (project_key)
         DO UPDATE SET last_sequence = event_sequences.last_sequence + 1
         RETURNING last_sequence",
    )
    .bind(project_key.value())
    .fetch_one(&mut **tx)
    .await
    .map_err(|error| {
        SwarmError::DatabaseError(format!("Failed to assign event sequence: {error}"))
    })?;

    let event_type = payload.event_type();
    let data = serde_json::to_value(&payload)?;

    let (id, created_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
        "INSERT INTO agent_events (project_key, sequence, event_type, data)
         VALUES ($1, $2, $3, $4)
         RETURNING id, created_at",
    )
    .bind(project_key.value())
    .bind(sequence)
    .bind(event_type.as_str())
    .bind(data)
    .fetch_one(&mut **tx)
    .await
    .map_err(|error| SwarmError::DatabaseError(format!("Failed to append event: {error}")))?;

    debug!(project = %project_key, sequence, %event_type, "Appended event");

    Ok(AgentEvent {
        id,
        project_key: project_key.clone(),
        sequence,
        payload,
        created_at,
    })
}
