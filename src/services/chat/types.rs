use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Document,
}

/// One part of a message. Text parts grow while a stream is open; file parts never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

impl MessageContent {
    pub fn text(id: impl Into<String>, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content_type: ContentType::Text,
            text_content: Some(text.into()),
            mime_type: None,
            file_content: None,
            file_path: None,
            file_size: None,
            created_at,
            edited_at: None,
        }
    }

    pub fn is_text(&self) -> bool {
        self.content_type == ContentType::Text
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            Some(self.text_content.as_deref().unwrap_or_default())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub contents: Vec<MessageContent>,
    #[serde(default)]
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        rename = "message_pair_id",
        alias = "message_pair",
        alias = "pairId",
        deserialize_with = "optional_id"
    )]
    pub pair_id: Option<String>,
}

impl ChatMessage {
    /// All text parts joined in order.
    pub fn text(&self) -> String {
        self.contents.iter().filter_map(MessageContent::as_text).collect()
    }

    pub(crate) fn first_text_mut(&mut self) -> Option<&mut String> {
        self.contents
            .iter_mut()
            .find(|c| c.is_text())
            .map(|c| c.text_content.get_or_insert_with(String::new))
    }
}

/// A decoded record from the message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Start { pair_id: Option<String> },
    Text { content: String },
    Error { message: String },
    Done,
    /// Server created the conversation while handling the request.
    ChatId { chat_id: String },
    Unknown { kind: String },
}

/// Immutable state change, emitted for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatDelta {
    StreamStarted,
    PairStarted {
        user: ChatMessage,
        assistant: ChatMessage,
    },
    TextAppended {
        message_id: String,
        delta: String,
    },
    Notice {
        error: String,
    },
    Done,
    ConversationAssigned {
        conversation_id: String,
    },
    Reconciled {
        messages: Vec<ChatMessage>,
    },
    StreamEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUpdate {
    pub request_id: String,
    pub conversation_id: String,
    pub delta: ChatDelta,
}

/// Accepts ids as strings or integers; the older backend numbers its rows.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Int(n) => n.to_string(),
    })
}

/// Like `string_or_number`, but `null` and `""` both mean "no id".
pub(crate) fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }

    Ok(match Option::<Id>::deserialize(deserializer)? {
        Some(Id::Str(s)) if !s.trim().is_empty() => Some(s),
        Some(Id::Int(n)) => Some(n.to_string()),
        _ => None,
    })
}
