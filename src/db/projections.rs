//! Incremental projection maintenance.
//!
//! Every projection row is a deterministic fold of the event stream: the
//! appliers here derive all timestamps from the event's `created_at` and use
//! upserts, so applying the same event twice, or replaying the whole log
//! from scratch, lands on identical state.

use crate::error::{Result, SwarmError};
use crate::events::{AgentEvent, CheckpointPayload, EventPayload};
use crate::types::{AgentName, Importance, ProjectKey};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// Apply one stored event to the projection tables inside the caller's
/// transaction. Write operations call this right after appending the event;
/// replay calls it in a loop. Cursors are consumer state, not a projection,
/// and are never touched here.
pub(crate) async fn apply_event_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    event: &AgentEvent,
) -> Result<()> {
    let project = &event.project_key;
    let at = event.created_at;

    match &event.payload {
        EventPayload::AgentRegistered {
            name,
            program,
            model,
            task_description,
        } => {
            apply_agent_registered(tx, project, name, program.as_deref(), model.as_deref(),
                task_description.as_deref(), at)
            .await?;
        }
        EventPayload::MessageSent {
            message_id,
            from_agent,
            to_agents,
            subject,
            body,
            thread_id,
            importance,
            ack_required,
        } => {
            apply_message_sent(
                tx,
                project,
                *message_id,
                from_agent,
                to_agents,
                subject,
                body,
                thread_id.as_deref(),
                *importance,
                *ack_required,
                at,
            )
            .await?;
        }
        EventPayload::MessageRead {
            message_id,
            agent_name,
        } => {
            sqlx::query(
                "UPDATE message_recipients SET read_at = $3
                 WHERE message_id = $1 AND agent_name = $2 AND read_at IS NULL",
            )
            .bind(message_id)
            .bind(agent_name.value())
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to apply message read: {error}"))
            })?;
        }
        EventPayload::MessageAcknowledged {
            message_id,
            agent_name,
        } => {
            // Acking an unread message also marks it read.
            sqlx::query(
                "UPDATE message_recipients
                 SET acknowledged_at = $3, read_at = COALESCE(read_at, $3)
                 WHERE message_id = $1 AND agent_name = $2 AND acknowledged_at IS NULL",
            )
            .bind(message_id)
            .bind(agent_name.value())
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to apply acknowledgement: {error}"))
            })?;
        }
        EventPayload::ReservationGranted {
            reservation_id,
            agent_name,
            path_pattern,
            exclusive,
            reason,
            ttl_seconds,
        } => {
            let expires_at = at + Duration::seconds(*ttl_seconds);
            sqlx::query(
                "INSERT INTO file_reservations
                     (id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(reservation_id)
            .bind(project.value())
            .bind(agent_name.value())
            .bind(path_pattern)
            .bind(exclusive)
            .bind(reason.as_deref())
            .bind(at)
            .bind(expires_at)
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to apply reservation grant: {error}"))
            })?;
        }
        EventPayload::ReservationReleased { reservation_id, .. } => {
            sqlx::query(
                "UPDATE file_reservations SET released_at = $2
                 WHERE id = $1 AND released_at IS NULL",
            )
            .bind(reservation_id)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to apply reservation release: {error}"))
            })?;
        }
        EventPayload::CheckpointCreated { context } => {
            apply_checkpoint_created(tx, project, context, at).await?;
        }
        EventPayload::CheckpointRecovered {
            epic_id,
            bead_id,
            agent_name,
            found,
            ..
        } => {
            if *found {
                sqlx::query(
                    "UPDATE swarm_contexts SET recovery_state = 'recovered'
                     WHERE project_key = $1 AND epic_id = $2 AND bead_id = $3 AND agent_name = $4",
                )
                .bind(project.value())
                .bind(epic_id)
                .bind(bead_id)
                .bind(agent_name.value())
                .execute(&mut **tx)
                .await
                .map_err(|error| {
                    SwarmError::DatabaseError(format!("Failed to apply recovery: {error}"))
                })?;
            }
        }
    }

    if let Some(agent) = event.payload.acting_agent() {
        touch_last_active(tx, project, agent, at).await?;
    }

    Ok(())
}

async fn apply_agent_registered(
    tx: &mut Transaction<'static, Postgres>,
    project: &ProjectKey,
    name: &AgentName,
    program: Option<&str>,
    model: Option<&str>,
    task_description: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    // Re-registration updates in place; registered_at keeps the first
    // registration's time.
    sqlx::query(
        "INSERT INTO agents (project_key, name, program, model, task_description, registered_at, last_active_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         ON CONFLICT (project_key, name) DO UPDATE
         SET program = EXCLUDED.program,
             model = EXCLUDED.model,
             task_description = EXCLUDED.task_description,
             last_active_at = GREATEST(agents.last_active_at, EXCLUDED.last_active_at)",
    )
    .bind(project.value())
    .bind(name.value())
    .bind(program)
    .bind(model)
    .bind(task_description)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map(|_| ())
    .map_err(|error| {
        SwarmError::DatabaseError(format!("Failed to apply agent registration: {error}"))
    })
}

#[allow(clippy::too_many_arguments)]
async fn apply_message_sent(
    tx: &mut Transaction<'static, Postgres>,
    project: &ProjectKey,
    message_id: Uuid,
    from_agent: &AgentName,
    to_agents: &[AgentName],
    subject: &str,
    body: &str,
    thread_id: Option<&str>,
    importance: Importance,
    ack_required: bool,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(message_id)
    .bind(project.value())
    .bind(from_agent.value())
    .bind(subject)
    .bind(body)
    .bind(thread_id)
    .bind(importance.as_str())
    .bind(ack_required)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map_err(|error| SwarmError::DatabaseError(format!("Failed to apply message: {error}")))?;

    for recipient in to_agents {
        sqlx::query(
            "INSERT INTO message_recipients (message_id, agent_name)
             VALUES ($1, $2)
             ON CONFLICT (message_id, agent_name) DO NOTHING",
        )
        .bind(message_id)
        .bind(recipient.value())
        .execute(&mut **tx)
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to apply message recipient: {error}"))
        })?;
    }

    Ok(())
}

async fn apply_checkpoint_created(
    tx: &mut Transaction<'static, Postgres>,
    project: &ProjectKey,
    context: &CheckpointPayload,
    at: DateTime<Utc>,
) -> Result<()> {
    let files = serde_json::to_value(&context.files)?;
    let directives = serde_json::to_value(&context.directives)?;
    let files_touched = serde_json::to_value(&context.files_touched)?;

    // Latest-only snapshot: overwrite on conflict and reset recovery state.
    sqlx::query(
        "INSERT INTO swarm_contexts
             (project_key, epic_id, bead_id, agent_name, task_description, files, strategy,
              progress_percent, last_milestone, directives, files_touched, checkpointed_at, recovery_state)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending')
         ON CONFLICT (project_key, epic_id, bead_id, agent_name) DO UPDATE
         SET task_description = EXCLUDED.task_description,
             files = EXCLUDED.files,
             strategy = EXCLUDED.strategy,
             progress_percent = EXCLUDED.progress_percent,
             last_milestone = EXCLUDED.last_milestone,
             directives = EXCLUDED.directives,
             files_touched = EXCLUDED.files_touched,
             checkpointed_at = EXCLUDED.checkpointed_at,
             recovery_state = 'pending'",
    )
    .bind(project.value())
    .bind(&context.epic_id)
    .bind(&context.bead_id)
    .bind(context.agent_name.value())
    .bind(&context.task_description)
    .bind(files)
    .bind(&context.strategy)
    .bind(context.progress_percent)
    .bind(&context.last_milestone)
    .bind(directives)
    .bind(files_touched)
    .bind(at)
    .execute(&mut **tx)
    .await
    .map(|_| ())
    .map_err(|error| SwarmError::DatabaseError(format!("Failed to apply checkpoint: {error}")))
}

async fn touch_last_active(
    tx: &mut Transaction<'static, Postgres>,
    project: &ProjectKey,
    agent: &AgentName,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE agents SET last_active_at = GREATEST(last_active_at, $3)
         WHERE project_key = $1 AND name = $2",
    )
    .bind(project.value())
    .bind(agent.value())
    .bind(at)
    .execute(&mut **tx)
    .await
    .map(|_| ())
    .map_err(|error| {
        SwarmError::DatabaseError(format!("Failed to update agent activity: {error}"))
    })
}
