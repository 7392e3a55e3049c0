use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::EventPayload;
use crate::paths;
use crate::types::{
    AgentName, FileReservation, ProjectKey, ReleaseFilter, ReservationConflict,
    ReservationOutcome, ReserveOptions,
};
use chrono::Utc;
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

impl SwarmDb {
    /// Try to reserve a set of paths (or glob patterns) for an agent. Each
    /// path is decided independently: paths that overlap someone else's
    /// active exclusive reservation come back as conflicts, the rest are
    /// granted. Conflicts are data, not errors.
    ///
    /// An agent's own active reservations never conflict with its new
    /// request, so re-reserving is how leases get renewed. A renewal
    /// releases the hold it supersedes; a pattern never carries two live
    /// holds from the same agent.
    ///
    /// The check-then-insert runs under a per-project advisory lock so two
    /// agents cannot race past each other's pending grants.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when any statement fails, or a
    /// transaction error on commit failure.
    pub async fn reserve_files(
        &self,
        project_key: &ProjectKey,
        agent_name: &AgentName,
        paths: &[String],
        options: &ReserveOptions,
    ) -> Result<ReservationOutcome> {
        let project = project_key.clone();
        let agent = agent_name.clone();
        let requested: Vec<String> = paths.iter().map(|p| paths::normalize(p)).collect();
        let options = options.clone();

        let outcome = self
            .with_transaction(move |tx| {
                Box::pin(async move {
                    reserve_in_tx(tx, &project, &agent, &requested, &options).await
                })
            })
            .await?;

        info!(
            project = %project_key,
            agent = %agent_name,
            granted = outcome.granted.len(),
            conflicts = outcome.conflicts.len(),
            "Processed reservation request"
        );
        Ok(outcome)
    }

    /// Release the agent's active reservations matching the filter. An empty
    /// filter releases everything the agent holds. Returns the released
    /// reservations. Releasing nothing is not an error.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when any statement fails.
    pub async fn release_files(
        &self,
        project_key: &ProjectKey,
        agent_name: &AgentName,
        filter: &ReleaseFilter,
    ) -> Result<Vec<FileReservation>> {
        let active = self
            .get_active_reservations(project_key, Some(agent_name))
            .await?;

        let normalized_paths: Vec<String> =
            filter.paths.iter().map(|p| paths::normalize(p)).collect();

        let matching: Vec<FileReservation> = active
            .into_iter()
            .filter(|reservation| {
                let by_id = filter.reservation_ids.contains(&reservation.id);
                let by_path = normalized_paths
                    .iter()
                    .any(|path| path == &reservation.path_pattern);
                (filter.reservation_ids.is_empty() && normalized_paths.is_empty())
                    || by_id
                    || by_path
            })
            .collect();

        let mut released = Vec::with_capacity(matching.len());
        for reservation in matching {
            let event = self
                .append_event(
                    project_key,
                    EventPayload::ReservationReleased {
                        reservation_id: reservation.id,
                        agent_name: agent_name.clone(),
                    },
                )
                .await?;
            released.push(FileReservation {
                released_at: Some(event.created_at),
                ..reservation
            });
        }

        debug!(project = %project_key, agent = %agent_name, count = released.len(), "Released reservations");
        Ok(released)
    }

    /// Active (unreleased, unexpired) reservations in a project, optionally
    /// narrowed to one agent. Expiry is evaluated in the query; nothing
    /// depends on a background reaper.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_active_reservations(
        &self,
        project_key: &ProjectKey,
        agent_name: Option<&AgentName>,
    ) -> Result<Vec<FileReservation>> {
        sqlx::query_as::<_, mappers::ReservationRow>(
            "SELECT id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at, released_at
             FROM file_reservations
             WHERE project_key = $1
               AND released_at IS NULL
               AND expires_at > NOW()
               AND ($2::text IS NULL OR agent_name = $2)
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_key.value())
        .bind(agent_name.map(|a| a.value().to_string()))
        .fetch_all(self.pool())
        .await
        .map(|rows| rows.into_iter().map(mappers::decode_reservation).collect())
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to load reservations: {error}"))
        })
    }

    /// Dry-run conflict check: which of these paths would be refused for an
    /// exclusive request right now, and by whom. Grants nothing and appends
    /// nothing. `exclude_agent` drops that agent's own holds from the check,
    /// the way a real request from it would.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn check_reservation_conflicts(
        &self,
        project_key: &ProjectKey,
        paths: &[String],
        exclude_agent: Option<&AgentName>,
    ) -> Result<Vec<ReservationConflict>> {
        let held = self.get_active_reservations(project_key, None).await?;
        let nobody = AgentName::new("");
        let requester = exclude_agent.unwrap_or(&nobody);

        Ok(paths
            .iter()
            .map(|p| paths::normalize(p))
            .flat_map(|path| conflicts_for(&path, requester, true, &held))
            .collect())
    }

    /// Permanently release every expired, still-unreleased reservation in a
    /// project by appending release events for them. Queries already ignore
    /// expired rows; this exists to keep the projection tidy and the expiry
    /// visible in the log. Returns how many were reaped.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when any statement fails.
    pub async fn reap_expired_reservations(&self, project_key: &ProjectKey) -> Result<u64> {
        let expired = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, agent_name FROM file_reservations
             WHERE project_key = $1 AND released_at IS NULL AND expires_at <= NOW()
             ORDER BY expires_at ASC",
        )
        .bind(project_key.value())
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to find expired reservations: {error}"))
        })?;

        let mut reaped = 0_u64;
        for (reservation_id, agent_name) in expired {
            self.append_event(
                project_key,
                EventPayload::ReservationReleased {
                    reservation_id,
                    agent_name: AgentName::new(agent_name),
                },
            )
            .await?;
            reaped += 1;
        }

        if reaped > 0 {
            info!(project = %project_key, reaped, "Reaped expired reservations");
        }
        Ok(reaped)
    }
}

async fn reserve_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    project_key: &ProjectKey,
    agent_name: &AgentName,
    requested: &[String],
    options: &ReserveOptions,
) -> Result<ReservationOutcome> {
    lock_project_reservations(tx, project_key).await?;

    let held = active_reservations_in_tx(tx, project_key).await?;
    let ttl_seconds = options
        .ttl_seconds
        .unwrap_or(crate::config::DEFAULT_RESERVATION_TTL_SECONDS)
        .max(1);

    let mut granted = Vec::new();
    let mut conflicts = Vec::new();

    for path in requested {
        let path_conflicts = conflicts_for(path, agent_name, options.exclusive, &held);
        if path_conflicts.is_empty() {
            // Renewal replaces: releasing the superseded row keeps a single
            // live hold per agent and pattern.
            for superseded in held
                .iter()
                .filter(|r| r.agent_name == *agent_name && r.path_pattern == *path)
            {
                let release = super::event_log::append_event_in_tx(
                    tx,
                    project_key,
                    EventPayload::ReservationReleased {
                        reservation_id: superseded.id,
                        agent_name: agent_name.clone(),
                    },
                )
                .await?;
                super::projections::apply_event_in_tx(tx, &release).await?;
            }

            let reservation_id = Uuid::new_v4();
            let event = super::event_log::append_event_in_tx(
                tx,
                project_key,
                EventPayload::ReservationGranted {
                    reservation_id,
                    agent_name: agent_name.clone(),
                    path_pattern: path.clone(),
                    exclusive: options.exclusive,
                    reason: options.reason.clone(),
                    ttl_seconds,
                },
            )
            .await?;
            super::projections::apply_event_in_tx(tx, &event).await?;

            granted.push(FileReservation {
                id: reservation_id,
                project_key: project_key.clone(),
                agent_name: agent_name.clone(),
                path_pattern: path.clone(),
                exclusive: options.exclusive,
                reason: options.reason.clone(),
                created_at: event.created_at,
                expires_at: event.created_at + chrono::Duration::seconds(ttl_seconds),
                released_at: None,
            });
        } else {
            conflicts.extend(path_conflicts);
        }
    }

    Ok(ReservationOutcome { granted, conflicts })
}

/// Transaction-scoped advisory lock keyed by project. Serializes the
/// check-then-grant window across every connection and process; released
/// automatically at COMMIT/ROLLBACK.
async fn lock_project_reservations(
    tx: &mut Transaction<'static, Postgres>,
    project_key: &ProjectKey,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('file_reservations'), hashtext($1))")
        .bind(project_key.value())
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to take reservation lock: {error}"))
        })
}

async fn active_reservations_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    project_key: &ProjectKey,
) -> Result<Vec<FileReservation>> {
    sqlx::query_as::<_, mappers::ReservationRow>(
        "SELECT id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at, released_at
         FROM file_reservations
         WHERE project_key = $1 AND released_at IS NULL AND expires_at > NOW()",
    )
    .bind(project_key.value())
    .fetch_all(&mut **tx)
    .await
    .map(|rows| rows.into_iter().map(mappers::decode_reservation).collect())
    .map_err(|error| SwarmError::DatabaseError(format!("Failed to load reservations: {error}")))
}

/// Conflicts between one requested path and the currently-held reservations.
/// An overlap blocks when either side is exclusive. Shared-on-shared is
/// fine, and an agent's own reservations never block it.
fn conflicts_for(
    path: &str,
    agent_name: &AgentName,
    request_exclusive: bool,
    held: &[FileReservation],
) -> Vec<ReservationConflict> {
    let now = Utc::now();
    held.iter()
        .filter(|r| r.is_active(now))
        .filter(|r| r.agent_name != *agent_name)
        .filter(|r| r.exclusive || request_exclusive)
        .filter(|r| paths::patterns_overlap(path, &r.path_pattern))
        .map(|r| ReservationConflict {
            path: path.to_string(),
            held_by: r.agent_name.clone(),
            exclusive: r.exclusive,
            path_pattern: r.path_pattern.clone(),
            expires_at: r.expires_at,
        })
        .collect()
}
