use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use chatdesk_core::chat::{ChatMessage, ChatSession, Participant, SessionSummary, SurveyData};
use chatdesk_core::identity::Identity;
use chatdesk_core::ids::SessionId;
use chatdesk_core::ChatError;
use chatdesk_store::{NewMessage, SessionRepo, StoreError};

use crate::client::{ClientId, ClientRegistry};
use crate::identity::IdentityResolver;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::rooms::{Room, RoomRouter};

const MAX_SESSION_ID_LEN: usize = 128;

/// Parse a client-supplied session id. Rejects empty, oversized or
/// non-identifier strings.
pub fn parse_session_id(raw: &str) -> Result<SessionId, ChatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChatError::InvalidInput("sessionId is empty".into()));
    }
    if trimmed.len() > MAX_SESSION_ID_LEN {
        return Err(ChatError::InvalidInput("sessionId is too long".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ChatError::InvalidInput(format!("malformed sessionId: {trimmed}")));
    }
    Ok(SessionId::from_raw(trimmed))
}

/// Per-session append locks, acquired with a deadline.
struct AppendLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl AppendLocks {
    fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    async fn acquire(&self, id: &SessionId) -> Result<OwnedMutexGuard<()>, ChatError> {
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| ChatError::SessionBusy(self.timeout))
    }

    /// Forget locks nobody holds or waits on.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Routes inbound chat events: resolves identity, persists through the
/// session store, then fans results out to rooms.
///
/// Every mutation of a session runs under that session's append lock, and
/// the lock is held until the resulting broadcasts are queued, so all
/// observers see a session's events in commit order.
pub struct ChatBroker {
    sessions: SessionRepo,
    resolver: Arc<dyn IdentityResolver>,
    router: Arc<RoomRouter>,
    locks: AppendLocks,
}

impl ChatBroker {
    pub fn new(
        sessions: SessionRepo,
        resolver: Arc<dyn IdentityResolver>,
        router: Arc<RoomRouter>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            resolver,
            router,
            locks: AppendLocks::new(lock_timeout),
        }
    }

    pub fn router(&self) -> &Arc<RoomRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        self.router.registry()
    }

    pub fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }

    /// Run a session-store call on the blocking pool.
    pub async fn with_sessions<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&SessionRepo) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let sessions = self.sessions.clone();
        tokio::task::spawn_blocking(move || f(&sessions))
            .await
            .map_err(|e| ChatError::Persistence(format!("store task failed: {e}")))?
            .map_err(ChatError::from)
    }

    /// Parse and dispatch one inbound frame. Failures are reported to the
    /// originating client only.
    #[instrument(skip_all, fields(client_id = %client_id))]
    pub async fn handle_event(&self, client_id: &ClientId, raw: &str) {
        let event = match serde_json::from_str::<ClientEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "unparseable client frame");
                self.reply(client_id, ServerEvent::parse_error(e));
                return;
            }
        };

        match event {
            ClientEvent::JoinSession(join) => {
                self.join(client_id, join.session_id.as_deref(), join.credential.as_deref())
                    .await;
            }
            ClientEvent::SendMessage(send) => {
                let result = self
                    .submit_from(
                        Some(client_id),
                        send.session_id.as_deref(),
                        send.content.as_deref(),
                        send.credential.as_deref(),
                    )
                    .await;
                if let Err(e) = result {
                    warn!(kind = e.error_kind(), error = %e, "message rejected");
                    self.reply(client_id, ServerEvent::error(&e, send.session_id));
                }
            }
        }
    }

    /// Subscribe a connection to the rooms its identity entitles it to.
    /// Never touches the store; a malformed session id only skips that room.
    pub async fn join(
        &self,
        client_id: &ClientId,
        session_id: Option<&str>,
        credential: Option<&str>,
    ) -> Identity {
        let identity = self.resolver.resolve(credential).await;

        if identity.is_agent() {
            self.router.subscribe(client_id, Room::Agents);
        }

        if let Some(raw) = session_id {
            match parse_session_id(raw) {
                Ok(id) => {
                    self.router.subscribe(client_id, Room::Session(id));
                }
                Err(e) => warn!(error = %e, "join ignored malformed sessionId"),
            }
        }

        info!(client_id = %client_id, role = %identity.role, "client joined");
        identity
    }

    /// Persist a message, then announce it. Returns the stored message.
    pub async fn submit(
        &self,
        session_id: Option<&str>,
        content: Option<&str>,
        credential: Option<&str>,
    ) -> Result<ChatMessage, ChatError> {
        self.submit_from(None, session_id, content, credential).await
    }

    /// [`submit`](Self::submit) on behalf of a connection. The sender gets
    /// the `newMessage` echo even if it never joined the session room.
    #[instrument(skip_all, fields(session_id = session_id.unwrap_or_default()))]
    pub async fn submit_from(
        &self,
        origin: Option<&ClientId>,
        session_id: Option<&str>,
        content: Option<&str>,
        credential: Option<&str>,
    ) -> Result<ChatMessage, ChatError> {
        let session_id = match session_id {
            Some(raw) => parse_session_id(raw)?,
            None => return Err(ChatError::InvalidInput("sessionId is required".into())),
        };
        let content = content.map(str::trim).unwrap_or_default();
        if content.is_empty() {
            return Err(ChatError::InvalidInput("content is empty".into()));
        }

        let identity = self.resolver.resolve(credential).await;
        let message = NewMessage {
            kind: identity.message_kind(),
            author: identity.display_name,
            content: content.to_string(),
        };

        let _guard = self.locks.acquire(&session_id).await?;

        let id = session_id.clone();
        let outcome = self
            .with_sessions(move |sessions| sessions.append_message(&id, message))
            .await?;

        self.announce(
            &[Room::Session(session_id.clone()), Room::Agents],
            origin,
            ServerEvent::new_message(session_id.as_str(), outcome.message.clone()),
        );
        self.announce(
            &[Room::Agents],
            None,
            ServerEvent::SessionUpdated(outcome.summary.clone()),
        );

        if outcome.status_changed() {
            info!(
                from = %outcome.previous_status,
                to = %outcome.summary.status,
                "session status changed"
            );
        }
        info!(kind = %outcome.message.kind, message_id = %outcome.message.id, "message accepted");
        Ok(outcome.message)
    }

    /// Create a session and announce it to agents.
    pub async fn create_session(&self, participant: Participant) -> Result<ChatSession, ChatError> {
        let session = self
            .with_sessions(move |sessions| sessions.create(participant))
            .await?;
        let summary = summary_of(&session);
        self.announce(&[Room::Agents], None, ServerEvent::SessionUpdated(summary));
        info!(session_id = %session.id, "chat session started");
        Ok(session)
    }

    /// Close a session. Watchers of the session and all agents are told.
    pub async fn close(&self, session_id: &SessionId) -> Result<SessionSummary, ChatError> {
        let _guard = self.locks.acquire(session_id).await?;
        let id = session_id.clone();
        let summary = self.with_sessions(move |sessions| sessions.close(&id)).await?;

        self.announce(
            &[Room::Session(session_id.clone()), Room::Agents],
            None,
            ServerEvent::SessionUpdated(summary.clone()),
        );
        Ok(summary)
    }

    pub async fn submit_survey(
        &self,
        session_id: &SessionId,
        survey: SurveyData,
    ) -> Result<SessionSummary, ChatError> {
        let _guard = self.locks.acquire(session_id).await?;
        let id = session_id.clone();
        let summary = self
            .with_sessions(move |sessions| sessions.submit_survey(&id, &survey))
            .await?;

        self.announce(
            &[Room::Agents],
            None,
            ServerEvent::SessionUpdated(summary.clone()),
        );
        Ok(summary)
    }

    /// Tear down a connection: no room keeps it as a member afterwards.
    pub fn disconnect(&self, client_id: &ClientId) {
        self.registry().unregister(client_id);
        let rooms = self.router.unsubscribe_all(client_id);
        info!(client_id = %client_id, rooms, "client disconnected");
    }

    /// Disconnect clients that stopped answering and drop idle locks.
    pub fn reap_dead_connections(&self) -> usize {
        let dead = self.registry().dead_clients();
        for client_id in &dead {
            self.disconnect(client_id);
        }
        self.locks.prune();
        if !dead.is_empty() {
            info!(count = dead.len(), "reaped dead clients");
        }
        dead.len()
    }

    fn reply(&self, client_id: &ClientId, event: ServerEvent) {
        if let Some(json) = event.to_json() {
            let _ = self.registry().send_to(client_id, json);
        }
    }

    /// Queue `event` to the rooms (plus `origin`). Nothing is sent if the
    /// event fails to serialize.
    fn announce(&self, rooms: &[Room], origin: Option<&ClientId>, event: ServerEvent) {
        if let Some(json) = event.to_json() {
            self.router.broadcast_union_with(rooms, origin, &json);
        }
    }
}

fn summary_of(session: &ChatSession) -> SessionSummary {
    SessionSummary {
        session_id: session.id.clone(),
        status: session.status,
        participant_name: session.participant.display_name().to_string(),
        last_activity_at: session.last_activity_at,
        preview: None,
        message_count: session.messages.len() as u64,
        survey_completed: session.survey_completed,
    }
}

/// Periodically disconnect dead clients.
pub fn start_cleanup_task(
    broker: Arc<ChatBroker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            broker.reap_dead_connections();
        }
    })
}
