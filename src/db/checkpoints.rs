use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::{CheckpointPayload, EventPayload};
use crate::types::{AgentName, CheckpointLoad, ProjectKey, RecoveryState, SwarmBeadContext};
use tracing::info;

impl SwarmDb {
    /// Save a bead checkpoint. One transaction appends the
    /// `checkpoint_created` event and upserts the latest-only snapshot in
    /// `swarm_contexts`; the event log keeps the full history.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when persistence fails, or a
    /// transaction error when commit fails.
    pub async fn save_checkpoint(
        &self,
        project_key: &ProjectKey,
        context: CheckpointPayload,
    ) -> Result<SwarmBeadContext> {
        let epic_id = context.epic_id.clone();
        let bead_id = context.bead_id.clone();
        let agent_name = context.agent_name.clone();

        let event = self
            .append_event(project_key, EventPayload::CheckpointCreated { context })
            .await?;

        info!(
            project = %project_key,
            epic = %epic_id,
            bead = %bead_id,
            agent = %agent_name,
            sequence = event.sequence,
            "Saved checkpoint"
        );

        self.get_checkpoint(project_key, &epic_id, &bead_id, &agent_name)
            .await?
            .ok_or_else(|| {
                SwarmError::Internal(format!(
                    "Checkpoint for {epic_id}/{bead_id}/{agent_name} missing after save"
                ))
            })
    }

    /// Load the latest checkpoint for a bead key. A hit appends a
    /// `checkpoint_recovered` audit event and flips the snapshot's recovery
    /// state; a miss is a [`CheckpointLoad::FreshStart`] with no side
    /// effects, nothing is fabricated.
    ///
    /// `recovered_by` names the agent doing the recovery when it differs
    /// from the agent that saved (takeover after a crash).
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when a query or the audit
    /// append fails.
    pub async fn load_checkpoint(
        &self,
        project_key: &ProjectKey,
        epic_id: &str,
        bead_id: &str,
        agent_name: &AgentName,
        recovered_by: Option<&AgentName>,
    ) -> Result<CheckpointLoad> {
        let Some(context) = self
            .get_checkpoint(project_key, epic_id, bead_id, agent_name)
            .await?
        else {
            return Ok(CheckpointLoad::FreshStart);
        };

        self.append_event(
            project_key,
            EventPayload::CheckpointRecovered {
                epic_id: epic_id.to_string(),
                bead_id: bead_id.to_string(),
                agent_name: agent_name.clone(),
                recovered_by: recovered_by.cloned(),
                found: true,
            },
        )
        .await?;

        info!(
            project = %project_key,
            epic = %epic_id,
            bead = %bead_id,
            agent = %agent_name,
            "Recovered checkpoint"
        );

        Ok(CheckpointLoad::Recovered(SwarmBeadContext {
            recovery_state: RecoveryState::Recovered,
            ..context
        }))
    }

    /// Read the stored snapshot without recovery side effects.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_checkpoint(
        &self,
        project_key: &ProjectKey,
        epic_id: &str,
        bead_id: &str,
        agent_name: &AgentName,
    ) -> Result<Option<SwarmBeadContext>> {
        sqlx::query_as::<_, mappers::ContextRow>(
            "SELECT epic_id, bead_id, agent_name, task_description, files, strategy,
                    progress_percent, last_milestone, directives, files_touched,
                    checkpointed_at, recovery_state
             FROM swarm_contexts
             WHERE project_key = $1 AND epic_id = $2 AND bead_id = $3 AND agent_name = $4",
        )
        .bind(project_key.value())
        .bind(epic_id)
        .bind(bead_id)
        .bind(agent_name.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to load checkpoint: {error}"))
        })?
        .map(mappers::decode_context)
        .transpose()
    }

    /// All checkpoint snapshots in a project, optionally narrowed to one
    /// epic, newest first.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn list_checkpoints(
        &self,
        project_key: &ProjectKey,
        epic_id: Option<&str>,
    ) -> Result<Vec<SwarmBeadContext>> {
        sqlx::query_as::<_, mappers::ContextRow>(
            "SELECT epic_id, bead_id, agent_name, task_description, files, strategy,
                    progress_percent, last_milestone, directives, files_touched,
                    checkpointed_at, recovery_state
             FROM swarm_contexts
             WHERE project_key = $1
               AND ($2::text IS NULL OR epic_id = $2)
             ORDER BY checkpointed_at DESC",
        )
        .bind(project_key.value())
        .bind(epic_id)
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to list checkpoints: {error}"))
        })?
        .into_iter()
        .map(mappers::decode_context)
        .collect()
    }
}
