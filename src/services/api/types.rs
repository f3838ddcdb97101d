use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::chat::ChatMessage;
use crate::services::chat::types::{optional_id, string_or_number};

/// Body of `POST /chats/{id}/messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageRequest {
    pub message: String,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatCreate {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub include_archived: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ChatListQuery {
    fn default() -> Self {
        Self {
            project_id: None,
            include_archived: false,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default, alias = "project", deserialize_with = "optional_id")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessagePair {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatDetail {
    #[serde(flatten)]
    pub chat: ChatSummary,
    #[serde(default)]
    pub message_pairs: Vec<MessagePair>,
    #[serde(default)]
    pub total_tokens: u64,
}

impl ChatDetail {
    /// Messages of every pair, in pair order.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.message_pairs
            .into_iter()
            .flat_map(|pair| pair.messages)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditMessage {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectCreate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Project {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    #[serde(default)]
    pub knowledge_items: Vec<KnowledgeItem>,
    #[serde(default)]
    pub chats: Vec<ChatSummary>,
    #[serde(default)]
    pub total_knowledge_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeCreate {
    pub title: String,
    pub content: String,
    pub include_in_chat: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KnowledgeItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default = "default_true")]
    pub include_in_chat: bool,
    #[serde(default)]
    pub token_count: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemPromptCreate {
    pub title: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SavedSystemPrompt {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileUpload {
    pub file_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default)]
    pub url: Option<String>,
}

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub user: serde_json::Value,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// `GET /chats/{id}/export`. Hidden messages are left out by the server.
///
/// Timestamps stay as the server's ISO strings; they may lack an offset.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatExport {
    pub chat_id: String,
    pub title: String,
    pub created_at: String,
    #[serde(default)]
    pub project: ExportProject,
    #[serde(default)]
    pub messages: Vec<ExportMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExportProject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExportMessage {
    pub role: String,
    pub created_at: String,
    #[serde(default)]
    pub contents: Vec<ExportContent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExportContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Title for a chat created from its first message.
pub fn derive_chat_title(message: &str) -> String {
    const MAX_CHARS: usize = 50;
    let message = message.trim();
    let mut title: String = message.chars().take(MAX_CHARS).collect();
    if message.chars().count() > MAX_CHARS {
        title.push_str("...");
    }
    if title.is_empty() {
        title.push_str("New Chat");
    }
    title
}
