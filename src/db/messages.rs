use crate::db::{mappers, SwarmDb};
use crate::error::{Result, SwarmError};
use crate::events::EventPayload;
use crate::types::{
    AgentName, InboxEntry, InboxFilter, MessageRecipient, ProjectKey, SendOptions, SendReceipt,
    SwarmMessage,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tracing::info;
use uuid::Uuid;

/// Minimum Jaro-Winkler similarity before a name is offered as a suggestion
/// in an unknown-recipient error.
const SUGGESTION_THRESHOLD: f64 = 0.7;

type InboxRow = (
    Uuid,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    bool,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    bool,
);

impl SwarmDb {
    /// Send a message to the named recipients. An empty recipient list with a
    /// thread id is a thread broadcast: no per-recipient rows are created and
    /// the message surfaces in the inbox of every thread participant.
    ///
    /// # Errors
    /// Returns [`SwarmError::NotFound`] when the sender or a recipient is not
    /// a registered agent, with the closest registered name suggested.
    pub async fn send_message(
        &self,
        project_key: &ProjectKey,
        from_agent: &AgentName,
        to_agents: &[AgentName],
        subject: &str,
        body: &str,
        options: SendOptions,
    ) -> Result<SendReceipt> {
        if to_agents.is_empty() && options.thread_id.is_none() {
            return Err(SwarmError::Validation(
                "Message needs at least one recipient or a thread id".to_string(),
            ));
        }

        let registered = self.registered_names(project_key).await?;
        for name in std::iter::once(from_agent).chain(to_agents) {
            if !registered.iter().any(|known| known == name.value()) {
                return Err(unknown_agent_error(name, &registered));
            }
        }

        let message_id = Uuid::new_v4();
        let event = self
            .append_event(
                project_key,
                EventPayload::MessageSent {
                    message_id,
                    from_agent: from_agent.clone(),
                    to_agents: to_agents.to_vec(),
                    subject: subject.to_string(),
                    body: body.to_string(),
                    thread_id: options.thread_id.clone(),
                    importance: options.importance,
                    ack_required: options.ack_required,
                },
            )
            .await?;

        info!(
            project = %project_key,
            from = %from_agent,
            recipients = to_agents.len(),
            sequence = event.sequence,
            "Sent message"
        );

        Ok(SendReceipt {
            message_id,
            thread_id: options.thread_id,
            recipient_count: to_agents.len(),
        })
    }

    /// Messages visible to an agent, newest first: everything addressed to
    /// it, plus broadcasts in threads it participates in, plus every
    /// broadcast in the thread when the query filters by `thread_id`. The
    /// agent's own sends are excluded.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_inbox(
        &self,
        project_key: &ProjectKey,
        agent_name: &AgentName,
        filter: &InboxFilter,
    ) -> Result<Vec<InboxEntry>> {
        let rows = sqlx::query_as::<_, InboxRow>(
            "SELECT m.id, m.project_key, m.from_agent, m.subject, m.body, m.thread_id,
                    m.importance, m.ack_required, m.created_at,
                    r.read_at, r.acknowledged_at,
                    (r.message_id IS NULL) AS broadcast
             FROM messages m
             LEFT JOIN message_recipients r
                    ON r.message_id = m.id AND r.agent_name = $2
             WHERE m.project_key = $1
               AND m.from_agent <> $2
               AND (
                     r.message_id IS NOT NULL
                     OR (
                         m.thread_id IS NOT NULL
                         AND NOT EXISTS (
                             SELECT 1 FROM message_recipients r2 WHERE r2.message_id = m.id
                         )
                         AND (
                             $5::text IS NOT NULL
                             OR EXISTS (
                                 SELECT 1 FROM messages m2
                                 LEFT JOIN message_recipients r3 ON r3.message_id = m2.id
                                 WHERE m2.project_key = m.project_key
                                   AND m2.thread_id = m.thread_id
                                   AND (m2.from_agent = $2 OR r3.agent_name = $2)
                             )
                         )
                     )
                   )
               AND ($3 = FALSE OR m.importance = 'urgent')
               AND ($4 = FALSE OR r.message_id IS NULL OR r.read_at IS NULL)
               AND ($5::text IS NULL OR m.thread_id = $5)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $6",
        )
        .bind(project_key.value())
        .bind(agent_name.value())
        .bind(filter.urgent_only)
        .bind(filter.unread_only)
        .bind(filter.thread_id.as_deref())
        .bind(filter.limit.max(1))
        .fetch_all(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to load inbox: {error}")))?;

        rows.into_iter()
            .map(|row| {
                let (id, project, from, subject, body, thread, importance, ack, created,
                     read_at, acknowledged_at, broadcast) = row;
                let mut message = mappers::decode_message((
                    id, project, from, subject, body, thread, importance, ack, created,
                ))?;
                if !filter.include_bodies {
                    message.body.clear();
                }
                Ok(InboxEntry {
                    message,
                    read_at,
                    acknowledged_at,
                    broadcast,
                })
            })
            .collect()
    }

    /// One message with the delivery state of every recipient.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when a query fails.
    pub async fn get_message(
        &self,
        project_key: &ProjectKey,
        message_id: Uuid,
    ) -> Result<Option<(SwarmMessage, Vec<MessageRecipient>)>> {
        let Some(row) = sqlx::query_as::<_, mappers::MessageRow>(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at
             FROM messages
             WHERE project_key = $1 AND id = $2",
        )
        .bind(project_key.value())
        .bind(message_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to load message: {error}")))?
        else {
            return Ok(None);
        };

        let message = mappers::decode_message(row)?;

        let recipients = sqlx::query_as::<_, (Uuid, String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
            "SELECT message_id, agent_name, read_at, acknowledged_at
             FROM message_recipients
             WHERE message_id = $1
             ORDER BY agent_name ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to load recipients: {error}"))
        })?
        .into_iter()
        .map(|(message_id, agent_name, read_at, acknowledged_at)| MessageRecipient {
            message_id,
            agent_name: AgentName::new(agent_name),
            read_at,
            acknowledged_at,
        })
        .collect();

        Ok(Some((message, recipients)))
    }

    /// Every message in a thread, oldest first, each with its recipient
    /// states.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the query fails.
    pub async fn get_thread(
        &self,
        project_key: &ProjectKey,
        thread_id: &str,
    ) -> Result<Vec<(SwarmMessage, Vec<MessageRecipient>)>> {
        let messages = sqlx::query_as::<_, mappers::MessageRow>(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at
             FROM messages
             WHERE project_key = $1 AND thread_id = $2
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_key.value())
        .bind(thread_id)
        .fetch_all(self.pool())
        .await
        .map_err(|error| SwarmError::DatabaseError(format!("Failed to load thread: {error}")))?
        .into_iter()
        .map(mappers::decode_message)
        .collect::<Result<Vec<_>>>()?;

        let recipient_rows = sqlx::query_as::<_, (Uuid, String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(
            "SELECT r.message_id, r.agent_name, r.read_at, r.acknowledged_at
             FROM message_recipients r
             JOIN messages m ON m.id = r.message_id
             WHERE m.project_key = $1 AND m.thread_id = $2
             ORDER BY r.agent_name ASC",
        )
        .bind(project_key.value())
        .bind(thread_id)
        .fetch_all(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to load thread recipients: {error}"))
        })?;

        let mut by_message = recipient_rows
            .into_iter()
            .map(|(message_id, agent_name, read_at, acknowledged_at)| {
                (
                    message_id,
                    MessageRecipient {
                        message_id,
                        agent_name: AgentName::new(agent_name),
                        read_at,
                        acknowledged_at,
                    },
                )
            })
            .into_group_map();

        Ok(messages
            .into_iter()
            .map(|message| {
                let recipients = by_message.remove(&message.id).unwrap_or_default();
                (message, recipients)
            })
            .collect())
    }

    /// Record that an agent read a message. Idempotent: reading twice appends
    /// no second event.
    ///
    /// # Errors
    /// Returns [`SwarmError::NotFound`] when the agent is not a recipient of
    /// the message.
    pub async fn mark_message_read(
        &self,
        project_key: &ProjectKey,
        message_id: Uuid,
        agent_name: &AgentName,
    ) -> Result<()> {
        match self.recipient_state(message_id, agent_name).await? {
            None => Err(SwarmError::NotFound(format!(
                "Agent '{agent_name}' is not a recipient of message {message_id}"
            ))),
            Some((Some(_), _, _)) => Ok(()),
            Some((None, _, _)) => {
                self.append_event(
                    project_key,
                    EventPayload::MessageRead {
                        message_id,
                        agent_name: agent_name.clone(),
                    },
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// Record an explicit acknowledgement. Acking also marks the message
    /// read. Idempotent like [`Self::mark_message_read`]. Only messages sent
    /// with `ack_required` can be acknowledged.
    ///
    /// # Errors
    /// Returns [`SwarmError::NotFound`] when the agent is not a recipient of
    /// the message, or [`SwarmError::Validation`] when the message did not
    /// request acknowledgement.
    pub async fn acknowledge_message(
        &self,
        project_key: &ProjectKey,
        message_id: Uuid,
        agent_name: &AgentName,
    ) -> Result<()> {
        match self.recipient_state(message_id, agent_name).await? {
            None => Err(SwarmError::NotFound(format!(
                "Agent '{agent_name}' is not a recipient of message {message_id}"
            ))),
            Some((_, _, false)) => Err(SwarmError::Validation(format!(
                "Message {message_id} does not require acknowledgement"
            ))),
            Some((_, Some(_), true)) => Ok(()),
            Some((_, None, true)) => {
                self.append_event(
                    project_key,
                    EventPayload::MessageAcknowledged {
                        message_id,
                        agent_name: agent_name.clone(),
                    },
                )
                .await
                .map(|_| ())
            }
        }
    }

    async fn recipient_state(
        &self,
        message_id: Uuid,
        agent_name: &AgentName,
    ) -> Result<Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>, bool)>> {
        sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<DateTime<Utc>>, bool)>(
            "SELECT r.read_at, r.acknowledged_at, m.ack_required
             FROM message_recipients r
             JOIN messages m ON m.id = r.message_id
             WHERE r.message_id = $1 AND r.agent_name = $2",
        )
        .bind(message_id)
        .bind(agent_name.value())
        .fetch_optional(self.pool())
        .await
        .map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to load recipient state: {error}"))
        })
    }

    async fn registered_names(&self, project_key: &ProjectKey) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT name FROM agents WHERE project_key = $1")
            .bind(project_key.value())
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to list agent names: {error}"))
            })
    }
}

fn unknown_agent_error(name: &AgentName, registered: &[String]) -> SwarmError {
    let suggestion = registered
        .iter()
        .map(|known| (known, strsim::jaro_winkler(name.value(), known)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(known, _)| known);

    match suggestion {
        Some(known) => SwarmError::NotFound(format!(
            "Agent '{name}' is not registered. Did you mean '{known}'?"
        )),
        None => SwarmError::NotFound(format!("Agent '{name}' is not registered")),
    }
}
