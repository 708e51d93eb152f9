//! Client-side orchestration of chat turns over a [`Gateway`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::dispatcher::DynGateway;
use crate::error::GatewayError;
use crate::session::{DEFAULT_TITLE, Session, SessionStore};
use crate::types::{FragmentStream, Message, Provider, ProviderRequest, ResponseEnvelope};

/// Assistant message shown whenever a turn fails.
pub const FALLBACK_REPLY: &str =
    "Sorry, there was an error processing your request. Please try again.";

const DEFAULT_TITLE_MODEL: &str = "claude-3-haiku-20240307";
const TITLE_WORD_LIMIT: usize = 4;
const EVENT_CAPACITY: usize = 256;

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Errored,
}

/// Change notifications for whatever renders the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    StateChanged {
        session_id: String,
        state: TurnState,
    },
    /// The message list of a session changed (append or in-place update).
    MessagesChanged { session_id: String },
    TitleChanged { session_id: String, title: String },
    /// Sessions were created, selected or reconfigured.
    SessionsChanged,
}

/// Why `send_message` refused to start a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("message is empty")]
    Empty,
    #[error("a reply is still in progress")]
    Busy,
}

/// Result of one accepted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: String,
    /// Either [`TurnState::Completed`] or [`TurnState::Errored`].
    pub state: TurnState,
    /// Assistant text appended by the turn, if any.
    pub reply: Option<String>,
}

/// Side-channel provider and model used to name new sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSettings {
    pub provider: Provider,
    pub model: String,
}

impl Default for TitleSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            model: DEFAULT_TITLE_MODEL.to_string(),
        }
    }
}

/// Drives chat turns for the sessions in a [`SessionStore`].
///
/// Only one turn runs at a time; a second `send_message` while the first is
/// outstanding is rejected rather than queued. Every store mutation is keyed
/// by the session id captured when the turn started, so switching sessions
/// mid-turn cannot leak a reply into another history.
///
/// Title derivation runs on its own tokio task and never holds the busy flag,
/// so `send_message` must be called from within a tokio runtime.
pub struct ConversationController {
    store: Arc<Mutex<SessionStore>>,
    gateway: DynGateway,
    title: TitleSettings,
    busy: AtomicBool,
    events: broadcast::Sender<ConversationEvent>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConversationController {
    pub fn new(store: SessionStore, gateway: DynGateway) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store: Arc::new(Mutex::new(store)),
            gateway,
            title: TitleSettings::default(),
            busy: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_title_settings(mut self, title: TitleSettings) -> Self {
        self.title = title;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Sends `input` as a user message in the current session and consumes the reply.
    ///
    /// The user message is appended before the gateway is called and the
    /// request carries the whole session history. On the first message of a
    /// session a title is derived on a background task; its result arrives
    /// as [`ConversationEvent::TitleChanged`], possibly after this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SendRejected::Empty`] for blank input and [`SendRejected::Busy`]
    /// while another turn is outstanding. Gateway failures are not errors here:
    /// they end the turn in [`TurnState::Errored`].
    pub async fn send_message(&self, input: &str) -> Result<TurnOutcome, SendRejected> {
        let content = input.trim();
        if content.is_empty() {
            return Err(SendRejected::Empty);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SendRejected::Busy);
        }
        let busy = BusyGuard(&self.busy);

        let (session_id, request, first_message) = {
            let mut store = self.store.lock();
            let session = store.current_or_create();
            let mut history = session.messages.clone();
            history.push(Message::user(content));
            store.append_message(&session.id, Message::user(content));
            let request =
                ProviderRequest::new(history, session.provider, Some(session.model.clone()));
            (session.id.clone(), request, session.messages.is_empty())
        };
        self.emit(ConversationEvent::MessagesChanged {
            session_id: session_id.clone(),
        });
        self.set_state(&session_id, TurnState::Sending);
        tracing::debug!(
            session_id = %session_id,
            provider = %request.provider,
            message_count = request.messages.len(),
            "sending chat turn"
        );

        if first_message {
            let job = TitleJob {
                gateway: self.gateway.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
                settings: self.title.clone(),
                session_id: session_id.clone(),
                first_message: content.to_string(),
            };
            tokio::spawn(job.run());
        }

        let outcome = self.run_turn(&session_id, request).await;
        drop(busy);
        self.set_state(&session_id, TurnState::Idle);
        Ok(outcome)
    }

    async fn run_turn(&self, session_id: &str, request: ProviderRequest) -> TurnOutcome {
        match self.consume(session_id, request).await {
            Ok(reply) => {
                self.set_state(session_id, TurnState::Completed);
                TurnOutcome {
                    session_id: session_id.to_string(),
                    state: TurnState::Completed,
                    reply: Some(reply),
                }
            }
            Err(err) => {
                tracing::error!(session_id, error = %err, "chat turn failed");
                // A rejected provider leaves the history with just the user message.
                let reply = if err.status_code() == 400 {
                    None
                } else {
                    self.append(session_id, Message::assistant(FALLBACK_REPLY));
                    Some(FALLBACK_REPLY.to_string())
                };
                self.set_state(session_id, TurnState::Errored);
                TurnOutcome {
                    session_id: session_id.to_string(),
                    state: TurnState::Errored,
                    reply,
                }
            }
        }
    }

    async fn consume(&self, session_id: &str, request: ProviderRequest) -> Result<String, GatewayError> {
        match self.gateway.send(request).await? {
            ResponseEnvelope::Whole(text) => {
                self.append(session_id, Message::assistant(text.clone()));
                Ok(text)
            }
            ResponseEnvelope::Stream(mut fragments) => {
                self.set_state(session_id, TurnState::Streaming);
                self.append(session_id, Message::assistant(""));
                let mut text = Utf8Accumulator::default();
                while let Some(fragment) = fragments.next().await {
                    if text.push(&fragment) {
                        self.overwrite_last(session_id, text.as_str()).await;
                    }
                }
                if text.finish() {
                    self.overwrite_last(session_id, text.as_str()).await;
                }
                Ok(text.into_string())
            }
        }
    }

    /// Starts a fresh session and makes it current.
    pub fn new_chat(&self) -> String {
        let id = self.store.lock().create();
        self.emit(ConversationEvent::SessionsChanged);
        id
    }

    /// Makes `id` current; unknown ids are ignored and `false` is returned.
    pub fn select_session(&self, id: &str) -> bool {
        let selected = self.store.lock().select(id);
        if selected {
            self.emit(ConversationEvent::SessionsChanged);
        }
        selected
    }

    /// Renames a session; blank titles are ignored.
    pub fn rename_session(&self, id: &str, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }
        let renamed = self.store.lock().rename_title(id, title);
        if renamed {
            self.emit(ConversationEvent::TitleChanged {
                session_id: id.to_string(),
                title: title.to_string(),
            });
        }
        renamed
    }

    /// Switches the current session's provider and resets its model to the
    /// provider's first listed model.
    pub fn set_provider(&self, provider: Provider) {
        let changed = {
            let mut store = self.store.lock();
            let session = store.current_or_create();
            store.set_selection(&session.id, provider, provider.default_selection())
        };
        if changed {
            self.emit(ConversationEvent::SessionsChanged);
        }
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] when `model` is not listed for the
    /// current session's provider.
    pub fn set_model(&self, model: &str) -> Result<(), GatewayError> {
        {
            let mut store = self.store.lock();
            let session = store.current_or_create();
            if !session.provider.supports_model(model) {
                return Err(GatewayError::Validation {
                    message: format!(
                        "model {model} is not available for {}",
                        session.provider.display_name()
                    ),
                });
            }
            store.set_selection(&session.id, session.provider, model);
        }
        self.emit(ConversationEvent::SessionsChanged);
        Ok(())
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.store.lock().current()
    }

    /// Snapshot of every session, most recent first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.store.lock().list()
    }

    fn append(&self, session_id: &str, message: Message) {
        if self.store.lock().append_message(session_id, message) {
            self.emit(ConversationEvent::MessagesChanged {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Runs on the blocking pool since every update is written to the key-value store.
    async fn overwrite_last(&self, session_id: &str, content: &str) {
        let store = self.store.clone();
        let id = session_id.to_string();
        let content = content.to_string();
        let updated = tokio::task::spawn_blocking(move || {
            store.lock().update_last_message(&id, &content)
        })
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(session_id, error = %err, "streamed update was lost");
            false
        });
        if updated {
            self.emit(ConversationEvent::MessagesChanged {
                session_id: session_id.to_string(),
            });
        }
    }

    fn set_state(&self, session_id: &str, state: TurnState) {
        self.emit(ConversationEvent::StateChanged {
            session_id: session_id.to_string(),
            state,
        });
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Names a session from its first message, detached from the turn.
struct TitleJob {
    gateway: DynGateway,
    store: Arc<Mutex<SessionStore>>,
    events: broadcast::Sender<ConversationEvent>,
    settings: TitleSettings,
    session_id: String,
    first_message: String,
}

impl TitleJob {
    async fn run(self) {
        let title = match self.request().await {
            Ok(Some(title)) => title,
            Ok(None) => DEFAULT_TITLE.to_string(),
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "title generation failed");
                DEFAULT_TITLE.to_string()
            }
        };
        let renamed = self.store.lock().rename_title(&self.session_id, title.clone());
        if renamed {
            let _ = self.events.send(ConversationEvent::TitleChanged {
                session_id: self.session_id,
                title,
            });
        }
    }

    async fn request(&self) -> Result<Option<String>, GatewayError> {
        let prompt = format!(
            "Generate a short title of at most {TITLE_WORD_LIMIT} words for a conversation \
             that starts with the following message. Reply with the title only.\n\n{}",
            self.first_message
        );
        let request = ProviderRequest::new(
            vec![Message::user(prompt)],
            self.settings.provider,
            Some(self.settings.model.clone()),
        );
        let raw = match self.gateway.send(request).await? {
            ResponseEnvelope::Whole(text) => text,
            ResponseEnvelope::Stream(fragments) => collect_text(fragments).await,
        };
        Ok(clean_title(&raw))
    }
}

/// Trims, drops quote characters and keeps at most four words.
pub(crate) fn clean_title(raw: &str) -> Option<String> {
    let unquoted: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '"' | '\u{201c}' | '\u{201d}'))
        .collect();
    let unquoted = unquoted.trim_matches(|c: char| matches!(c, '\'' | '\u{2018}' | '\u{2019}'));
    let words: Vec<&str> = unquoted.split_whitespace().take(TITLE_WORD_LIMIT).collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

async fn collect_text(mut fragments: FragmentStream) -> String {
    let mut text = Utf8Accumulator::default();
    while let Some(fragment) = fragments.next().await {
        text.push(&fragment);
    }
    text.finish();
    text.into_string()
}

/// Incremental UTF-8 decoder that keeps incomplete trailing sequences until
/// the next fragment completes them. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    text: String,
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Returns whether any text was decoded.
    fn push(&mut self, fragment: &[u8]) -> bool {
        let before = self.text.len();
        self.pending.extend_from_slice(fragment);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match err.error_len() {
                        Some(invalid) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        self.text.len() != before
    }

    /// Flushes a dangling partial sequence; returns whether text changed.
    fn finish(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.pending.clear();
        self.text.push(char::REPLACEMENT_CHARACTER);
        true
    }

    fn as_str(&self) -> &str {
        &self.text
    }

    fn into_string(self) -> String {
        self.text
    }
}
