use crate::db::{EventFilter, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::AgentEvent;
use crate::types::{Cursor, ProjectKey};
use chrono::{DateTime, Utc};
use tracing::debug;

impl SwarmDb {
    /// Per-consumer read offset. A consumer with no stored cursor starts at
    /// sequence 0, before the first event.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_cursor(&self, project_key: &ProjectKey, consumer: &str) -> Result<Cursor> {
        let row = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "SELECT after_sequence, updated_at FROM cursors
             WHERE project_key = $1 AND consumer = $2",
        )
        .bind(project_key.value())
        .bind(consumer)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to load cursor: {error}")))?;

        Ok(match row {
            Some((after_sequence, updated_at)) => Cursor {
                project_key: project_key.clone(),
                consumer: consumer.to_string(),
                after_sequence,
                updated_at,
            },
            None => Cursor {
                project_key: project_key.clone(),
                consumer: consumer.to_string(),
                after_sequence: 0,
                updated_at: Utc::now(),
            },
        })
    }

    /// Move a consumer's cursor forward. Cursors never move backwards: an
    /// advance to a sequence at or below the stored one is a no-op, so
    /// concurrent consumers of one cursor cannot cause replays.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the upsert fails.
    pub async fn advance_cursor(
        &self,
        project_key: &ProjectKey,
        consumer: &str,
        after_sequence: i64,
    ) -> Result<Cursor> {
        let (stored, updated_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "INSERT INTO cursors (project_key, consumer, after_sequence, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (project_key, consumer) DO UPDATE
             SET after_sequence = GREATEST(cursors.after_sequence, EXCLUDED.after_sequence),
                 updated_at = NOW()
             RETURNING after_sequence, updated_at",
        )
        .bind(project_key.value())
        .bind(consumer)
        .bind(after_sequence.max(0))
        .fetch_one(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to advance cursor: {error}"))
        })?;

        debug!(project = %project_key, consumer, after_sequence = stored, "Advanced cursor");

        Ok(Cursor {
            project_key: project_key.clone(),
            consumer: consumer.to_string(),
            after_sequence: stored,
            updated_at,
        })
    }

    /// Read the events a consumer has not seen yet and advance its cursor
    /// past them. The advance only happens after a successful read; a failed
    /// read leaves the cursor where it was, so the consumer sees the same
    /// events again next time (at-least-once delivery).
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the read or the cursor
    /// update fails.
    pub async fn read_new_events(
        &self,
        project_key: &ProjectKey,
        consumer: &str,
        limit: Option<i64>,
    ) -> Result<Vec<AgentEvent>> {
        let cursor = self.get_cursor(project_key, consumer).await?;

        let mut filter = EventFilter::for_project(project_key).after_sequence(cursor.after_sequence);
        if let Some(limit) = limit {
            filter = filter.with_limit(limit);
        }

        let events = self.read_events(&filter).await?;

        if let Some(last) = events.last() {
            self.advance_cursor(project_key, consumer, last.sequence)
                .await?;
        }

        Ok(events)
    }
}
