use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::EventPayload;
use crate::types::{Agent, AgentName, ProjectKey};
use tracing::info;

impl SwarmDb {
    /// Register an agent (or refresh an existing registration) by appending
    /// an `agent_registered` event. Re-registering updates the profile fields
    /// but keeps the original `registered_at`.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the append fails.
    pub async fn register_agent(
        &self,
        project_key: &ProjectKey,
        name: &AgentName,
        program: Option<String>,
        model: Option<String>,
        task_description: Option<String>,
    ) -> Result<Agent> {
        let event = self
            .append_event(
                project_key,
                EventPayload::AgentRegistered {
                    name: name.clone(),
                    program,
                    model,
                    task_description,
                },
            )
            .await?;

        info!(project = %project_key, agent = %name, sequence = event.sequence, "Registered agent");

        self.get_agent(project_key, name).await?.ok_or_else(|| {
            SwarmError::Internal(format!("Agent {name} missing after registration"))
        })
    }

    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_agent(
        &self,
        project_key: &ProjectKey,
        name: &AgentName,
    ) -> Result<Option<Agent>> {
        sqlx::query_as::<_, mappers::AgentRow>(
            "SELECT project_key, name, program, model, task_description, registered_at, last_active_at
             FROM agents
             WHERE project_key = $1 AND name = $2",
        )
        .bind(project_key.value())
        .bind(name.value())
        .fetch_optional(self.pool())
        .await
        .map(|row| row.map(mappers::decode_agent))
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to load agent: {error}")))
    }

    /// All agents registered in a project, most recently active first.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn list_agents(&self, project_key: &ProjectKey) -> Result<Vec<Agent>> {
        sqlx::query_as::<_, mappers::AgentRow>(
            "SELECT project_key, name, program, model, task_description, registered_at, last_active_at
             FROM agents
             WHERE project_key = $1
             ORDER BY last_active_at DESC, name ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map(|rows| rows.into_iter().map(mappers::decode_agent).collect())
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to list agents: {error}")))
    }
}
