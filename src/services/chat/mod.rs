//! Streaming side of the chat client.
//!
//! Notes:
//! - The backend answers a message with newline-delimited JSON records. Bytes
//!   are decoded incrementally (`decoder`), turned into state changes
//!   (`assembler`) and applied to a caller-owned `Conversation`.
//! - Every change is also emitted as a `ChatUpdate` so a renderer never has to
//!   read the shared state while a stream is running.

mod assembler;
mod conversation;
mod decoder;
mod emitter;
mod manager;
mod stream;
pub(crate) mod types;

pub use assembler::{CONNECTION_LOST, StreamAssembler};
pub use conversation::{Conversation, SharedConversation, shared};
pub use decoder::{DecodedEvents, LineDecoder, parse_line};
pub use emitter::{Emitter, RecordingEmitter};
pub use manager::{ChatStreamManager, Submission};
pub use stream::{StreamOutcome, consume_stream};
pub use types::{
    ChatDelta, ChatMessage, ChatUpdate, ContentType, MessageContent, Role, StreamEvent,
};
