use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use chatdesk_core::chat::{
    preview_of, ChatMessage, ChatSession, MessageKind, Participant, SessionStatus,
    SessionSummary, SurveyData,
};
use chatdesk_core::ids::{MessageId, SessionId};
use chatdesk_core::lifecycle::{self, LifecycleEvent};
use chatdesk_core::ChatError;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub const DEFAULT_PREVIEW_CHARS: usize = 80;

const SUMMARY_COLUMNS: &str =
    "id, participant_name, status, last_activity_at, preview, message_count, survey_completed";

/// A message as submitted, before the store assigns id, timestamp and order.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub author: String,
    pub content: String,
}

/// Result of one atomic append-and-transition.
#[derive(Clone, Debug)]
pub struct AppendOutcome {
    pub message: ChatMessage,
    pub summary: SessionSummary,
    pub previous_status: SessionStatus,
}

impl AppendOutcome {
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.summary.status
    }
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
    preview_chars: usize,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    /// Create a session in `waiting` with no messages.
    #[instrument(skip(self, participant))]
    pub fn create(&self, participant: Participant) -> Result<ChatSession, StoreError> {
        let id = SessionId::new();
        let now = row_helpers::now();
        let ts = row_helpers::format_timestamp(&now);
        let account_id = match &participant {
            Participant::Account { account_id, .. } => Some(account_id.as_str().to_string()),
            Participant::Guest { .. } => None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, participant, participant_name, account_id, status, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?5)",
                rusqlite::params![
                    id.as_str(),
                    serde_json::to_string(&participant)?,
                    participant.display_name(),
                    account_id,
                    ts,
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(session_id = %id, "chat session created");

        Ok(ChatSession {
            id,
            participant,
            status: SessionStatus::Waiting,
            messages: Vec::new(),
            created_at: now,
            last_activity_at: now,
            survey_completed: false,
            survey_data: None,
        })
    }

    /// Get a session with its messages in append order.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<ChatSession, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant, status, created_at, last_activity_at, survey_completed, survey_data
                 FROM chat_sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut session = match rows.next()? {
                Some(row) => row_to_session(row)?,
                None => return Err(StoreError::NotFound(format!("session {id}"))),
            };

            let mut stmt = conn.prepare(
                "SELECT id, kind, author, content, timestamp
                 FROM chat_messages WHERE session_id = ?1
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            while let Some(row) = rows.next()? {
                session.messages.push(row_to_message(row)?);
            }
            Ok(session)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn summary(&self, id: &SessionId) -> Result<SessionSummary, StoreError> {
        self.db.with_conn(|conn| load_summary(conn, id))
    }

    /// List session summaries, most recent activity first.
    #[instrument(skip(self))]
    pub fn list_summaries(
        &self,
        status: Option<SessionStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SUMMARY_COLUMNS} FROM chat_sessions WHERE status = ?1
                         ORDER BY last_activity_at DESC LIMIT ?2 OFFSET ?3"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![s.to_string(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_summary(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {SUMMARY_COLUMNS} FROM chat_sessions
                         ORDER BY last_activity_at DESC LIMIT ?1 OFFSET ?2"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_summary(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Append a message and apply the lifecycle rule in one transaction:
    /// 1. Reads current status, last activity and message count
    /// 2. Computes the next status
    /// 3. Inserts the message at the next sequence number
    /// 4. Updates status, last activity, count and preview
    #[instrument(skip(self, message), fields(session_id = %id, kind = %message.kind))]
    pub fn append_message(
        &self,
        id: &SessionId,
        message: NewMessage,
    ) -> Result<AppendOutcome, StoreError> {
        self.db.with_tx(|tx| {
            let (current, last_activity, count) = load_append_state(tx, id)?;

            let next = match lifecycle::next_status(current, LifecycleEvent::Message(message.kind)) {
                Ok(next) => next,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "refusing status change, keeping current status");
                    current
                }
            };

            // Never earlier than the previous message, even if the clock steps back.
            let timestamp = row_helpers::now().max(last_activity);
            let ts = row_helpers::format_timestamp(&timestamp);
            let message_id = MessageId::new();
            let preview = preview_of(&message.content, self.preview_chars);

            tx.execute(
                "INSERT INTO chat_messages (id, session_id, sequence, kind, author, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message_id.as_str(),
                    id.as_str(),
                    count,
                    message.kind.to_string(),
                    message.author,
                    message.content,
                    ts,
                ],
            )?;

            tx.execute(
                "UPDATE chat_sessions
                 SET status = ?1, last_activity_at = ?2, message_count = ?3, preview = ?4
                 WHERE id = ?5",
                rusqlite::params![next.to_string(), ts, count + 1, preview, id.as_str()],
            )?;

            let summary = load_summary(tx, id)?;

            Ok(AppendOutcome {
                message: ChatMessage {
                    id: message_id,
                    kind: message.kind,
                    author: message.author,
                    content: message.content,
                    timestamp,
                },
                summary,
                previous_status: current,
            })
        })
    }

    /// Close unconditionally, whatever the current status.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn close(&self, id: &SessionId) -> Result<SessionSummary, StoreError> {
        self.db.with_tx(|tx| {
            let (current, _, _) = load_append_state(tx, id)?;
            let next = lifecycle::next_status(current, LifecycleEvent::Close)
                .map_err(|e| StoreError::Conflict(e.to_string()))?;

            tx.execute(
                "UPDATE chat_sessions SET status = ?1 WHERE id = ?2",
                rusqlite::params![next.to_string(), id.as_str()],
            )?;
            tracing::info!(session_id = %id, from = %current, "chat session closed");
            load_summary(tx, id)
        })
    }

    /// Record the satisfaction survey. Only once, only on a closed session.
    #[instrument(skip(self, survey), fields(session_id = %id, rating = survey.rating))]
    pub fn submit_survey(
        &self,
        id: &SessionId,
        survey: &SurveyData,
    ) -> Result<SessionSummary, StoreError> {
        if !survey.is_valid() {
            return Err(StoreError::Conflict(format!(
                "rating must be between {} and {}",
                SurveyData::MIN_RATING,
                SurveyData::MAX_RATING
            )));
        }

        self.db.with_tx(|tx| {
            let (current, completed): (String, bool) = tx
                .query_row(
                    "SELECT status, survey_completed FROM chat_sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("session {id}"))
                    }
                    other => other.into(),
                })?;
            let current: SessionStatus = row_helpers::parse_enum(&current, "chat_sessions", "status")?;

            if completed {
                return Err(StoreError::Conflict("survey already submitted".into()));
            }
            lifecycle::next_status(current, LifecycleEvent::Survey).map_err(|e| match e {
                ChatError::SurveyRejected(reason) => StoreError::Conflict(reason),
                other => StoreError::Conflict(other.to_string()),
            })?;

            tx.execute(
                "UPDATE chat_sessions SET survey_completed = 1, survey_data = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(survey)?, id.as_str()],
            )?;
            load_summary(tx, id)
        })
    }
}

fn load_append_state(
    conn: &rusqlite::Connection,
    id: &SessionId,
) -> Result<(SessionStatus, DateTime<Utc>, i64), StoreError> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT status, last_activity_at, message_count FROM chat_sessions WHERE id = ?1",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let Some((status, last_activity, count)) = row else {
        return Err(StoreError::NotFound(format!("session {id}")));
    };

    Ok((
        row_helpers::parse_enum(&status, "chat_sessions", "status")?,
        row_helpers::parse_timestamp(&last_activity, "chat_sessions", "last_activity_at")?,
        count,
    ))
}

fn load_summary(conn: &rusqlite::Connection, id: &SessionId) -> Result<SessionSummary, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUMMARY_COLUMNS} FROM chat_sessions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_summary(row),
        None => Err(StoreError::NotFound(format!("session {id}"))),
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> Result<SessionSummary, StoreError> {
    let status: String = row_helpers::get(row, 2, "chat_sessions", "status")?;
    let last_activity: String = row_helpers::get(row, 3, "chat_sessions", "last_activity_at")?;

    Ok(SessionSummary {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "chat_sessions", "id")?),
        participant_name: row_helpers::get(row, 1, "chat_sessions", "participant_name")?,
        status: row_helpers::parse_enum(&status, "chat_sessions", "status")?,
        last_activity_at: row_helpers::parse_timestamp(&last_activity, "chat_sessions", "last_activity_at")?,
        preview: row_helpers::get_opt(row, 4, "chat_sessions", "preview")?,
        message_count: row_helpers::get::<i64>(row, 5, "chat_sessions", "message_count")? as u64,
        survey_completed: row_helpers::get(row, 6, "chat_sessions", "survey_completed")?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSession, StoreError> {
    let participant: String = row_helpers::get(row, 1, "chat_sessions", "participant")?;
    let status: String = row_helpers::get(row, 2, "chat_sessions", "status")?;
    let created_at: String = row_helpers::get(row, 3, "chat_sessions", "created_at")?;
    let last_activity: String = row_helpers::get(row, 4, "chat_sessions", "last_activity_at")?;
    let survey: Option<String> = row_helpers::get_opt(row, 6, "chat_sessions", "survey_data")?;

    Ok(ChatSession {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "chat_sessions", "id")?),
        participant: row_helpers::parse_json(&participant, "chat_sessions", "participant")?,
        status: row_helpers::parse_enum(&status, "chat_sessions", "status")?,
        messages: Vec::new(),
        created_at: row_helpers::parse_timestamp(&created_at, "chat_sessions", "created_at")?,
        last_activity_at: row_helpers::parse_timestamp(&last_activity, "chat_sessions", "last_activity_at")?,
        survey_completed: row_helpers::get(row, 5, "chat_sessions", "survey_completed")?,
        survey_data: survey
            .map(|raw| row_helpers::parse_json(&raw, "chat_sessions", "survey_data"))
            .transpose()?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    let kind: String = row_helpers::get(row, 1, "chat_messages", "kind")?;
    let timestamp: String = row_helpers::get(row, 4, "chat_messages", "timestamp")?;

    Ok(ChatMessage {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "chat_messages", "id")?),
        kind: row_helpers::parse_enum(&kind, "chat_messages", "kind")?,
        author: row_helpers::get(row, 2, "chat_messages", "author")?,
        content: row_helpers::get(row, 3, "chat_messages", "content")?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "chat_messages", "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn guest(name: &str) -> Participant {
        Participant::Guest {
            display_name: name.into(),
            contact_email: None,
        }
    }

    fn msg(kind: MessageKind, author: &str, content: &str) -> NewMessage {
        NewMessage {
            kind,
            author: author.into(),
            content: content.into(),
        }
    }

    #[test]
    fn create_session_starts_waiting() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        assert!(session.id.as_str().starts_with("chat_"));
        assert_eq!(session.status, SessionStatus::Waiting);
        assert!(session.messages.is_empty());
        assert_eq!(session.created_at, session.last_activity_at);

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched, session);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let result = repo.get(&SessionId::from_raw("chat_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_to_missing_session_is_not_found() {
        let repo = setup();
        let result = repo.append_message(
            &SessionId::from_raw("chat_missing"),
            msg(MessageKind::Visitor, "Guest", "Hello"),
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn appended_messages_come_back_in_order() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        let contents = ["one", "two", "three", "four", "five"];
        for (i, content) in contents.iter().enumerate() {
            let kind = if i % 2 == 0 { MessageKind::Visitor } else { MessageKind::Agent };
            repo.append_message(&session.id, msg(kind, "someone", content)).unwrap();
        }

        let fetched = repo.get(&session.id).unwrap();
        let got: Vec<&str> = fetched.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(got, contents);
        for w in fetched.messages.windows(2) {
            assert!(w[0].timestamp <= w[1].timestamp);
        }
        assert!(fetched.last_activity_at >= fetched.created_at);
    }

    #[test]
    fn visitor_message_keeps_waiting() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        let outcome = repo
            .append_message(&session.id, msg(MessageKind::Visitor, "Guest", "Hello"))
            .unwrap();
        assert_eq!(outcome.summary.status, SessionStatus::Waiting);
        assert!(!outcome.status_changed());
        assert_eq!(outcome.summary.preview.as_deref(), Some("Hello"));
        assert_eq!(outcome.summary.message_count, 1);
    }

    #[test]
    fn agent_message_activates() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        let outcome = repo
            .append_message(&session.id, msg(MessageKind::Agent, "Sam", "Hi, how can I help?"))
            .unwrap();
        assert_eq!(outcome.previous_status, SessionStatus::Waiting);
        assert_eq!(outcome.summary.status, SessionStatus::Active);
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn close_then_visitor_reopens() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        repo.append_message(&session.id, msg(MessageKind::Agent, "Sam", "Hi")).unwrap();

        let closed = repo.close(&session.id).unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);

        let outcome = repo
            .append_message(&session.id, msg(MessageKind::Visitor, "Guest", "still there?"))
            .unwrap();
        assert_eq!(outcome.summary.status, SessionStatus::Waiting);

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.messages.len(), 2);
        assert_eq!(fetched.messages[1].content, "still there?");
    }

    #[test]
    fn close_from_waiting_is_allowed() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        assert_eq!(repo.close(&session.id).unwrap().status, SessionStatus::Closed);
    }

    #[test]
    fn close_missing_session_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.close(&SessionId::from_raw("chat_nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn survey_requires_closed_session() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        let survey = SurveyData { rating: 4, comment: Some("quick answer".into()) };

        assert!(matches!(
            repo.submit_survey(&session.id, &survey),
            Err(StoreError::Conflict(_))
        ));

        repo.close(&session.id).unwrap();
        let summary = repo.submit_survey(&session.id, &survey).unwrap();
        assert!(summary.survey_completed);
        assert_eq!(summary.status, SessionStatus::Closed);

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.survey_data, Some(survey.clone()));

        assert!(matches!(
            repo.submit_survey(&session.id, &survey),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn survey_rating_out_of_range_rejected() {
        let repo = setup();
        let session = repo.create(guest("Dana")).unwrap();
        repo.close(&session.id).unwrap();
        let result = repo.submit_survey(&session.id, &SurveyData { rating: 9, comment: None });
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn list_summaries_filters_by_status() {
        let repo = setup();
        let a = repo.create(guest("A")).unwrap();
        let _b = repo.create(guest("B")).unwrap();
        repo.append_message(&a.id, msg(MessageKind::Agent, "Sam", "Hi")).unwrap();

        let all = repo.list_summaries(None, 100, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, a.id, "most recent activity first");

        let waiting = repo.list_summaries(Some(SessionStatus::Waiting), 100, 0).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].participant_name, "B");
    }

    #[test]
    fn list_summaries_pagination() {
        let repo = setup();
        for i in 0..5 {
            repo.create(guest(&format!("guest-{i}"))).unwrap();
        }
        assert_eq!(repo.list_summaries(None, 2, 0).unwrap().len(), 2);
        assert_eq!(repo.list_summaries(None, 2, 4).unwrap().len(), 1);
    }

    #[test]
    fn preview_respects_configured_length() {
        let repo = SessionRepo::new(Database::in_memory().unwrap()).with_preview_chars(5);
        let session = repo.create(guest("Dana")).unwrap();
        let outcome = repo
            .append_message(&session.id, msg(MessageKind::Visitor, "Guest", "where is my order?"))
            .unwrap();
        assert_eq!(outcome.summary.preview.as_deref(), Some("where…"));
    }

    #[test]
    fn account_participant_roundtrips() {
        let db = Database::in_memory().unwrap();
        let accounts = crate::accounts::AccountRepo::new(db.clone());
        let account = accounts
            .create("Maria", "maria@shop.test", crate::accounts::AccountRole::Customer)
            .unwrap();
        let repo = SessionRepo::new(db);
        let session = repo
            .create(Participant::Account {
                account_id: account.id.clone(),
                display_name: account.name.clone(),
            })
            .unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.participant, session.participant);
    }

    #[test]
    fn corrupt_status_returns_error() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let session = repo.create(guest("Dana")).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_sessions SET status = 'INVALID_STATUS' WHERE id = ?1",
                [session.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(repo.get(&session.id), Err(StoreError::CorruptRow { .. })));
    }

    #[test]
    fn concurrent_appends_linearized() {
        let repo = Arc::new(setup());
        let session = repo.create(guest("Dana")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = Arc::clone(&repo);
                let id = session.id.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        repo.append_message(&id, msg(MessageKind::Visitor, "Guest", &format!("{t}-{i}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.messages.len(), 80);
        assert_eq!(repo.summary(&session.id).unwrap().message_count, 80);
        let sequences: Vec<i64> = db_sequences(&repo, &session.id);
        assert_eq!(sequences, (0..80).collect::<Vec<i64>>());
    }

    fn db_sequences(repo: &SessionRepo, id: &SessionId) -> Vec<i64> {
        repo.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence FROM chat_messages WHERE session_id = ?1 ORDER BY sequence",
                )?;
                let rows = stmt.query_map([id.as_str()], |row| row.get(0))?;
                Ok(rows.collect::<Result<Vec<i64>, _>>()?)
            })
            .unwrap()
    }
}
