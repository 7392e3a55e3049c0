//! Projection rebuild and verification.
//!
//! Because every applier derives its timestamps from the event row, folding
//! the log from sequence 1 reproduces the projection tables exactly. The
//! fingerprint makes that checkable: hash before, rebuild, hash after,
//! compare.

use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::types::ProjectKey;
use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction};
use tracing::info;

/// Projection tables owned by the event fold. Cursors are consumer state
/// and survive a rebuild untouched.
const PROJECTION_DELETES: &[&str] = &[
    "DELETE FROM message_recipients USING messages
     WHERE message_recipients.message_id = messages.id AND messages.project_key = $1",
    "DELETE FROM messages WHERE project_key = $1",
    "DELETE FROM file_reservations WHERE project_key = $1",
    "DELETE FROM swarm_contexts WHERE project_key = $1",
    "DELETE FROM agents WHERE project_key = $1",
];

impl SwarmDb {
    /// Drop a project's projections and re-derive them by folding the full
    /// event log in sequence order, all in one transaction. Readers either
    /// see the old state or the rebuilt one, never a half-rebuilt mix.
    /// Returns the number of events applied.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when any statement fails, or a
    /// transaction error when commit fails.
    pub async fn rebuild_projections(&self, project_key: &ProjectKey) -> Result<u64> {
        let project = project_key.clone();
        let applied = self
            .with_transaction(move |tx| {
                Box::pin(async move { rebuild_in_tx(tx, &project).await })
            })
            .await?;

        info!(project = %project_key, applied, "Rebuilt projections from event log");
        Ok(applied)
    }

    /// SHA-256 over a canonical serialization of every projection row for a
    /// project. Two stores holding the same events fingerprint identically;
    /// so does one store before and after [`Self::rebuild_projections`].
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when a query fails.
    pub async fn projection_fingerprint(&self, project_key: &ProjectKey) -> Result<String> {
        let mut hasher = Sha256::new();

        let mut agents = self.list_agents(project_key).await?;
        agents.sort_by(|a, b| a.name.value().cmp(b.name.value()));
        for agent in &agents {
            hasher.update(serde_json::to_vec(agent)?);
        }

        let messages = sqlx::query_as::<_, mappers::MessageRow>(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at
             FROM messages WHERE project_key = $1 ORDER BY id ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to read messages: {error}")))?;
        for row in messages {
            hasher.update(serde_json::to_vec(&mappers::decode_message(row)?)?);
        }

        let recipients = sqlx::query_as::<_, (uuid::Uuid, String, Option<chrono::DateTime<chrono::Utc>>, Option<chrono::DateTime<chrono::Utc>>)>(
            "SELECT r.message_id, r.agent_name, r.read_at, r.acknowledged_at
             FROM message_recipients r
             JOIN messages m ON m.id = r.message_id
             WHERE m.project_key = $1
             ORDER BY r.message_id ASC, r.agent_name ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to read recipients: {error}"))
        })?;
        for row in recipients {
            hasher.update(serde_json::to_vec(&row)?);
        }

        let reservations = sqlx::query_as::<_, mappers::ReservationRow>(
            "SELECT id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at, released_at
             FROM file_reservations WHERE project_key = $1 ORDER BY id ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to read reservations: {error}"))
        })?;
        for row in reservations {
            hasher.update(serde_json::to_vec(&mappers::decode_reservation(row))?);
        }

        let contexts = sqlx::query_as::<_, mappers::ContextRow>(
            "SELECT epic_id, bead_id, agent_name, task_description, files, strategy,
                    progress_percent, last_milestone, directives, files_touched,
                    checkpointed_at, recovery_state
             FROM swarm_contexts WHERE project_key = $1
             ORDER BY epic_id ASC, bead_id ASC, agent_name ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to read contexts: {error}"))
        })?;
        for row in contexts {
            hasher.update(serde_json::to_vec(&mappers::decode_context(row)?)?);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

async fn rebuild_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    project_key: &ProjectKey,
) -> Result<u64> {
    for sql in PROJECTION_DELETES {
        sqlx::query(sql)
            .bind(project_key.value())
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to clear projections: {error}"))
            })?;
    }

    // The log fits a single pass; page through it to bound memory anyway.
    let mut applied = 0_u64;
    let mut after_sequence = 0_i64;
    loop {
        let rows = sqlx::query_as::<_, mappers::EventRow>(
            "SELECT id, project_key, sequence, event_type, data, created_at
             FROM agent_events
             WHERE project_key = $1 AND sequence > $2
             ORDER BY sequence ASC
             LIMIT 500",
        )
        .bind(project_key.value())
        .bind(after_sequence)
        .fetch_all(&mut **tx)
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to read events for rebuild: {error}"))
        })?;

        if rows.is_empty() {
            break;
        }

        for row in rows {
            let event = mappers::decode_event(row)?;
            after_sequence = event.sequence;
            super::projections::apply_event_in_tx(tx, &event).await?;
            applied += 1;
        }
    }

    Ok(applied)
}
