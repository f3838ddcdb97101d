//! Applies decoded stream events to conversation state.
//!
//! One assembler serves one submission. Events are applied strictly in arrival
//! order and every mutation is also returned as a `ChatDelta`.

use chrono::{DateTime, Utc};

use super::conversation::Conversation;
use super::types::{ChatDelta, ChatMessage, MessageContent, Role, StreamEvent};

pub const CONNECTION_LOST: &str = "Connection lost";

pub struct StreamAssembler {
    submitted_text: String,
    submitted_at: DateTime<Utc>,
    /// Id of the assistant message receiving `text` events.
    current: Option<String>,
    pairs_started: u32,
    /// Set once the server has reported an `error` for this submission.
    error_reported: bool,
}

impl StreamAssembler {
    pub fn new(submitted_text: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            submitted_text: submitted_text.into(),
            submitted_at,
            current: None,
            pairs_started: 0,
            error_reported: false,
        }
    }

    pub fn current_target(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn error_reported(&self) -> bool {
        self.error_reported
    }

    /// Close the open target without a notice; the user has already seen why.
    pub fn close(&mut self) {
        if let Some(target) = self.current.take() {
            log::debug!("Closing message {} after server error", target);
        }
    }

    /// Apply one event. `None` means the event changed nothing.
    pub fn apply(&mut self, conversation: &mut Conversation, event: StreamEvent) -> Option<ChatDelta> {
        let delta = self.translate(event)?;
        conversation.apply_delta(&delta);
        Some(delta)
    }

    /// Close the open target after the transport failed mid-stream.
    pub fn fail(&mut self, conversation: &mut Conversation, message: &str) -> ChatDelta {
        if let Some(target) = self.current.take() {
            log::warn!("Stream for message {} closed: {}", target, message);
        }
        let delta = ChatDelta::Notice {
            error: message.to_string(),
        };
        conversation.apply_delta(&delta);
        delta
    }

    fn translate(&mut self, event: StreamEvent) -> Option<ChatDelta> {
        match event {
            StreamEvent::Start { pair_id } => {
                if let Some(previous) = self.current.take() {
                    log::warn!("Stream started a new pair while {} was still open", previous);
                }
                let (user, assistant) = self.placeholder_pair(pair_id);
                self.current = Some(assistant.id.clone());
                Some(ChatDelta::PairStarted { user, assistant })
            }
            StreamEvent::Text { content } => {
                let Some(target) = self.current.as_ref() else {
                    log::debug!("Dropping text received with no open message");
                    return None;
                };
                if content.is_empty() {
                    return None;
                }
                Some(ChatDelta::TextAppended {
                    message_id: target.clone(),
                    delta: content,
                })
            }
            StreamEvent::Error { message } => {
                log::warn!("Stream error: {}", message);
                self.error_reported = true;
                Some(ChatDelta::Notice { error: message })
            }
            StreamEvent::Done => {
                self.current = None;
                Some(ChatDelta::Done)
            }
            StreamEvent::ChatId { chat_id } => Some(ChatDelta::ConversationAssigned {
                conversation_id: chat_id,
            }),
            StreamEvent::Unknown { kind } => {
                log::debug!("Ignoring unknown stream event type: {}", kind);
                None
            }
        }
    }

    fn placeholder_pair(&mut self, pair_id: Option<String>) -> (ChatMessage, ChatMessage) {
        self.pairs_started += 1;
        let seq = self.pairs_started;
        let at = self.submitted_at;

        let user = ChatMessage {
            id: format!("local-{seq}-user"),
            role: Role::User,
            contents: vec![MessageContent::text(
                format!("local-{seq}-user-content"),
                self.submitted_text.clone(),
                at,
            )],
            hidden: false,
            created_at: at,
            pair_id: pair_id.clone(),
        };
        let assistant = ChatMessage {
            id: format!("local-{seq}-assistant"),
            role: Role::Assistant,
            contents: vec![MessageContent::text(
                format!("local-{seq}-assistant-content"),
                String::new(),
                at,
            )],
            hidden: false,
            created_at: at,
            pair_id,
        };
        (user, assistant)
    }
}
