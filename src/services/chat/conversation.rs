use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::services::error::ClientError;

use super::types::{ChatDelta, ChatMessage};

/// Caller-owned view state for one conversation.
///
/// While `is_streaming` is true only the stream task mutates `messages`;
/// otherwise only REST response handlers do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    /// Empty until the backend has assigned an id.
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub is_streaming: bool,
}

pub type SharedConversation = Arc<Mutex<Conversation>>;

pub fn shared(conversation: Conversation) -> SharedConversation {
    Arc::new(Mutex::new(conversation))
}

pub(crate) fn lock(conversation: &SharedConversation) -> Result<MutexGuard<'_, Conversation>, ClientError> {
    conversation.lock().map_err(|_| ClientError::LockPoisoned)
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn find(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Apply a delta produced by the assembler or the manager.
    ///
    /// Renderers that keep their own copy can replay the update stream through
    /// this and end up with the same messages as the shared state.
    pub fn apply_delta(&mut self, delta: &ChatDelta) {
        match delta {
            ChatDelta::StreamStarted => self.is_streaming = true,
            ChatDelta::StreamEnded => self.is_streaming = false,
            ChatDelta::PairStarted { user, assistant } => {
                self.messages.push(user.clone());
                self.messages.push(assistant.clone());
            }
            ChatDelta::TextAppended { message_id, delta } => {
                // The open target is almost always the last message.
                if let Some(text) = self
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|m| &m.id == message_id)
                    .and_then(ChatMessage::first_text_mut)
                {
                    text.push_str(delta);
                }
            }
            ChatDelta::ConversationAssigned { conversation_id } => {
                self.id = conversation_id.clone();
            }
            ChatDelta::Reconciled { messages } => self.messages = messages.clone(),
            ChatDelta::Notice { .. } | ChatDelta::Done => {}
        }
    }

    /// Replace a text part after the server accepted an edit.
    pub fn edit_text(&mut self, message_id: &str, text: &str, at: DateTime<Utc>) -> bool {
        let Some(content) = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .and_then(|m| m.contents.iter_mut().find(|c| c.is_text()))
        else {
            return false;
        };
        content.text_content = Some(text.to_string());
        content.edited_at = Some(at);
        true
    }

    /// Returns how many messages changed.
    pub fn set_pair_hidden(&mut self, pair_id: &str, hidden: bool) -> usize {
        let mut changed = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.pair_id.as_deref() == Some(pair_id))
        {
            if message.hidden != hidden {
                message.hidden = hidden;
                changed += 1;
            }
        }
        changed
    }

    pub fn is_pair_hidden(&self, pair_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.pair_id.as_deref() == Some(pair_id) && m.hidden)
    }

    /// Returns how many messages were removed.
    pub fn remove_pair(&mut self, pair_id: &str) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| m.pair_id.as_deref() != Some(pair_id));
        before - self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::services::chat::types::{MessageContent, Role};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn message(id: &str, role: Role, pair: Option<&str>, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            role,
            contents: vec![MessageContent::text(format!("{id}-c"), text, at())],
            hidden: false,
            created_at: at(),
            pair_id: pair.map(str::to_string),
        }
    }

    fn sample() -> Conversation {
        Conversation {
            id: "c1".to_string(),
            messages: vec![
                message("u1", Role::User, Some("p1"), "hi"),
                message("a1", Role::Assistant, Some("p1"), "hello"),
                message("u2", Role::User, Some("p2"), "again"),
                message("a2", Role::Assistant, Some("p2"), "sure"),
            ],
            is_streaming: false,
        }
    }

    #[test]
    fn test_edit_text_sets_edited_at() {
        let mut conversation = sample();
        assert!(conversation.edit_text("u2", "once more", at()));
        let edited = conversation.find("u2").unwrap();
        assert_eq!(edited.text(), "once more");
        assert_eq!(edited.contents[0].edited_at, Some(at()));
        assert!(!conversation.edit_text("missing", "x", at()));
    }

    #[test]
    fn test_pair_hide_and_remove() {
        let mut conversation = sample();
        assert_eq!(conversation.set_pair_hidden("p1", true), 2);
        assert!(conversation.is_pair_hidden("p1"));
        assert!(!conversation.is_pair_hidden("p2"));
        assert_eq!(conversation.set_pair_hidden("p1", true), 0);

        assert_eq!(conversation.remove_pair("p1"), 2);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.remove_pair("p1"), 0);
    }

    #[test]
    fn test_apply_text_delta_targets_message() {
        let mut conversation = sample();
        conversation.apply_delta(&ChatDelta::TextAppended {
            message_id: "a1".to_string(),
            delta: " there".to_string(),
        });
        assert_eq!(conversation.find("a1").unwrap().text(), "hello there");

        // Unknown targets are ignored.
        let before = conversation.clone();
        conversation.apply_delta(&ChatDelta::TextAppended {
            message_id: "nope".to_string(),
            delta: "x".to_string(),
        });
        assert_eq!(conversation, before);
    }
}
