//! Client-side chat engine: streams assistant replies from the chat backend
//! into a conversation while the bytes are still arriving, and wraps the
//! backend's REST endpoints.

pub mod services;

pub use services::api::types;
pub use services::api::{ByteStream, ChatApi, ChatBackend};
pub use services::auth::{AuthScheme, CredentialProvider, SessionState};
pub use services::chat::{
    ChatDelta, ChatMessage, ChatStreamManager, ChatUpdate, ContentType, Conversation, Emitter,
    MessageContent, RecordingEmitter, Role, SharedConversation, StreamAssembler, StreamEvent,
    Submission, shared,
};
pub use services::config::{ClientConfig, ClientPublicConfig, load_client_config};
pub use services::error::ClientError;
pub use services::retry::RetryConfig;

/// Install `env_logger`, filtered by `RUST_LOG` (default `info`).
///
/// Hosts with their own logger can skip this; calling it twice is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
