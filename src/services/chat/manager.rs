use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::api::{ByteStream, ChatBackend};
use crate::services::api::types::{ChatCreate, MessageRequest, derive_chat_title};
use crate::services::error::ClientError;

use super::assembler::StreamAssembler;
use super::conversation::{SharedConversation, lock};
use super::emitter::Emitter;
use super::stream::{StreamOutcome, consume_stream};
use super::types::{ChatDelta, ChatUpdate};

const REFETCH_FAILED: &str = "Failed to fetch messages";

/// One user message about to be sent.
#[derive(Debug, Clone)]
pub struct Submission {
    pub text: String,
    /// Ids of attachments already uploaded to the chat.
    pub files: Vec<String>,
    pub system_prompt_override: Option<String>,
    /// Only used when the conversation has to be created first.
    pub project_id: Option<String>,
    /// Timestamp given to the placeholder messages.
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
            system_prompt_override: None,
            project_id: None,
            submitted_at: Utc::now(),
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.files.is_empty()
    }
}

struct ActiveStream {
    handle: JoinHandle<()>,
    conversation: SharedConversation,
    /// Cancelled exactly once, by whoever publishes `stream_ended`.
    cancel: CancellationToken,
}

#[derive(Default)]
struct StreamRegistry {
    handles: HashMap<String, ActiveStream>,
    by_conversation: HashMap<String, String>,
}

/// Starts and tracks message streams, at most one per conversation.
pub struct ChatStreamManager {
    backend: Arc<dyn ChatBackend>,
    emitter: Arc<dyn Emitter>,
    // NOTE: std::sync::Mutex since the lock is never held across .await.
    registry: Arc<Mutex<StreamRegistry>>,
}

impl ChatStreamManager {
    pub fn new(backend: Arc<dyn ChatBackend>, emitter: Arc<dyn Emitter>) -> Self {
        Self {
            backend,
            emitter,
            registry: Arc::new(Mutex::new(StreamRegistry::default())),
        }
    }

    /// Send a message and stream the reply into `conversation`.
    ///
    /// Returns the request id once the stream is open. Failures before that
    /// point leave the messages untouched and clear `is_streaming` again; the
    /// submission stays with the caller so it can be retried.
    pub async fn submit(
        &self,
        conversation: SharedConversation,
        submission: &Submission,
    ) -> Result<String, ClientError> {
        if submission.is_empty() {
            return Err(ClientError::EmptySubmission);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        self.begin(&conversation, &request_id)?;

        let (conversation_id, body) = match self.open(&conversation, &request_id, submission).await {
            Ok(opened) => opened,
            Err(err) => {
                log::warn!("Message submission failed: {}", err);
                self.rollback(&conversation, &request_id);
                return Err(err);
            }
        };

        let mut registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(_) => {
                self.rollback(&conversation, &request_id);
                return Err(ClientError::LockPoisoned);
            }
        };

        let cancel = CancellationToken::new();
        let task = StreamTask {
            request_id: request_id.clone(),
            conversation_id: conversation_id.clone(),
            conversation: conversation.clone(),
            backend: self.backend.clone(),
            emitter: self.emitter.clone(),
            registry: self.registry.clone(),
            cancel: cancel.clone(),
        };
        let assembler = StreamAssembler::new(submission.text.clone(), submission.submitted_at);
        let handle = tokio::spawn(task.run(body, assembler));

        registry
            .by_conversation
            .insert(conversation_id, request_id.clone());
        registry.handles.insert(
            request_id.clone(),
            ActiveStream {
                handle,
                conversation,
                cancel,
            },
        );

        Ok(request_id)
    }

    /// Abort a running request. Returns false if it had already finished.
    pub fn abort_request(&self, request_id: &str) -> Result<bool, ClientError> {
        let Some(active) = self.take_request(request_id)? else {
            return Ok(false);
        };
        self.stop(request_id, active);
        Ok(true)
    }

    /// Abort whatever stream is running for the conversation, if any.
    pub fn abort_conversation(&self, conversation_id: &str) -> Result<bool, ClientError> {
        let Some((request_id, active)) = self.take_conversation(conversation_id)? else {
            return Ok(false);
        };
        self.stop(&request_id, active);
        Ok(true)
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.registry
            .lock()
            .map(|r| r.by_conversation.contains_key(conversation_id))
            .unwrap_or(true)
    }

    /// Replace a message's text once the server accepted the edit.
    pub async fn edit_message(
        &self,
        conversation: &SharedConversation,
        message_id: &str,
        text: &str,
    ) -> Result<bool, ClientError> {
        ensure_idle(conversation)?;
        self.backend.edit_message(message_id, text).await?;
        Ok(lock(conversation)?.edit_text(message_id, text, Utc::now()))
    }

    /// Flip a pair's hidden flag. Returns the new value.
    pub async fn toggle_message_pair(
        &self,
        conversation: &SharedConversation,
        pair_id: &str,
    ) -> Result<bool, ClientError> {
        let hidden = {
            let state = lock(conversation)?;
            if state.is_streaming {
                return Err(ClientError::ConversationBusy);
            }
            !state.is_pair_hidden(pair_id)
        };
        self.backend.toggle_message_pair(pair_id, hidden).await?;
        lock(conversation)?.set_pair_hidden(pair_id, hidden);
        Ok(hidden)
    }

    /// Returns how many local messages were removed.
    pub async fn delete_message_pair(
        &self,
        conversation: &SharedConversation,
        pair_id: &str,
    ) -> Result<usize, ClientError> {
        ensure_idle(conversation)?;
        self.backend.delete_message_pair(pair_id).await?;
        Ok(lock(conversation)?.remove_pair(pair_id))
    }

    /// Mark the conversation as streaming, or fail if it already is.
    fn begin(&self, conversation: &SharedConversation, request_id: &str) -> Result<(), ClientError> {
        let mut state = lock(conversation)?;
        if state.is_streaming || self.is_busy(&state.id) {
            return Err(ClientError::ConversationBusy);
        }
        state.apply_delta(&ChatDelta::StreamStarted);
        self.emitter.emit(ChatUpdate {
            request_id: request_id.to_string(),
            conversation_id: state.id.clone(),
            delta: ChatDelta::StreamStarted,
        });
        Ok(())
    }

    /// Create the chat when needed, then open the message stream.
    async fn open(
        &self,
        conversation: &SharedConversation,
        request_id: &str,
        submission: &Submission,
    ) -> Result<(String, ByteStream), ClientError> {
        let mut chat_id = lock(conversation)?.id.clone();

        if chat_id.is_empty() {
            let chat = self
                .backend
                .create_chat(&ChatCreate {
                    title: derive_chat_title(&submission.text),
                    project_id: submission.project_id.clone(),
                    system_prompt: submission.system_prompt_override.clone(),
                })
                .await?;
            log::info!("Created chat {}", chat.id);
            chat_id = chat.id.clone();
            publish(
                conversation,
                self.emitter.as_ref(),
                request_id,
                ChatDelta::ConversationAssigned {
                    conversation_id: chat.id,
                },
            )?;
        }

        let request = MessageRequest {
            message: submission.text.clone(),
            files: submission.files.clone(),
            system_prompt_override: submission.system_prompt_override.clone(),
        };
        let body = self.backend.open_message_stream(&chat_id, &request).await?;
        Ok((chat_id, body))
    }

    /// Undo `begin` after a failure before any stream task exists.
    fn rollback(&self, conversation: &SharedConversation, request_id: &str) {
        if let Err(err) = publish(conversation, self.emitter.as_ref(), request_id, ChatDelta::StreamEnded) {
            log::warn!("Failed to reset conversation after error: {}", err);
        }
    }

    fn stop(&self, request_id: &str, active: ActiveStream) {
        match end_stream(&active.conversation, self.emitter.as_ref(), request_id, &active.cancel) {
            Ok(true) => log::info!("Stream {} aborted", request_id),
            Ok(false) => log::debug!("Stream {} had already ended", request_id),
            Err(err) => {
                active.cancel.cancel();
                log::warn!("Failed to reset conversation after abort: {}", err);
            }
        }
        active.handle.abort();
    }

    fn take_request(&self, request_id: &str) -> Result<Option<ActiveStream>, ClientError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| ClientError::LockPoisoned)?;
        let Some(active) = registry.handles.remove(request_id) else {
            return Ok(None);
        };

        let conversation_id = registry
            .by_conversation
            .iter()
            .find(|(_, rid)| rid.as_str() == request_id)
            .map(|(cid, _)| cid.clone());
        if let Some(cid) = conversation_id.as_deref() {
            registry.by_conversation.remove(cid);
        }

        Ok(Some(active))
    }

    fn take_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<(String, ActiveStream)>, ClientError> {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| ClientError::LockPoisoned)?;

        let Some(request_id) = registry.by_conversation.remove(conversation_id) else {
            return Ok(None);
        };
        let Some(active) = registry.handles.remove(&request_id) else {
            return Ok(None);
        };

        Ok(Some((request_id, active)))
    }
}

impl Drop for ChatStreamManager {
    fn drop(&mut self) {
        let active: Vec<(String, ActiveStream)> = match self.registry.lock() {
            Ok(mut registry) => {
                registry.by_conversation.clear();
                registry.handles.drain().collect()
            }
            Err(_) => return,
        };
        for (request_id, stream) in active {
            self.stop(&request_id, stream);
        }
    }
}

/// State owned by one spawned stream.
struct StreamTask {
    request_id: String,
    conversation_id: String,
    conversation: SharedConversation,
    backend: Arc<dyn ChatBackend>,
    emitter: Arc<dyn Emitter>,
    registry: Arc<Mutex<StreamRegistry>>,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn run(self, body: ByteStream, mut assembler: StreamAssembler) {
        let outcome = consume_stream(
            body,
            &self.request_id,
            &mut assembler,
            &self.conversation,
            self.emitter.as_ref(),
            &self.cancel,
        )
        .await;

        match outcome {
            Ok(StreamOutcome::Completed) => self.reconcile().await,
            Ok(StreamOutcome::Cancelled) => {
                log::debug!("Stream {} cancelled", self.request_id);
                return;
            }
            Ok(outcome) => log::debug!("Stream {} finished: {:?}", self.request_id, outcome),
            Err(err) => log::warn!("Stream {} stopped: {}", self.request_id, err),
        }

        // Unregister first so observers of `stream_ended` can submit again.
        self.unregister();
        if let Err(err) = end_stream(
            &self.conversation,
            self.emitter.as_ref(),
            &self.request_id,
            &self.cancel,
        ) {
            log::warn!("Failed to end stream {}: {}", self.request_id, err);
        }
    }

    /// Replace the optimistic messages with the server's copy.
    async fn reconcile(&self) {
        let chat_id = match lock(&self.conversation) {
            Ok(state) => state.id.clone(),
            Err(err) => {
                log::warn!("Skipping refetch: {}", err);
                return;
            }
        };

        let delta = match self.backend.list_messages(&chat_id).await {
            Ok(messages) => ChatDelta::Reconciled { messages },
            Err(err) => {
                log::warn!("Refetch of chat {} failed: {}", chat_id, err);
                ChatDelta::Notice {
                    error: REFETCH_FAILED.to_string(),
                }
            }
        };

        let applied = lock(&self.conversation).map(|mut state| {
            if self.cancel.is_cancelled() {
                return;
            }
            state.apply_delta(&delta);
            self.emitter.emit(ChatUpdate {
                request_id: self.request_id.clone(),
                conversation_id: state.id.clone(),
                delta,
            });
        });
        if let Err(err) = applied {
            log::warn!("Failed to apply refetched messages: {}", err);
        }
    }

    fn unregister(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.handles.remove(&self.request_id);
            if registry
                .by_conversation
                .get(&self.conversation_id)
                .map(|rid| rid.as_str())
                == Some(self.request_id.as_str())
            {
                registry.by_conversation.remove(&self.conversation_id);
            }
        }
    }
}

/// Publish `stream_ended` unless someone already did. Returns whether this call did.
///
/// The token is checked and cancelled under the conversation lock, so the task
/// and an abort can never both end the stream, and nothing the task applies
/// afterwards can land.
fn end_stream(
    conversation: &SharedConversation,
    emitter: &dyn Emitter,
    request_id: &str,
    cancel: &CancellationToken,
) -> Result<bool, ClientError> {
    let mut state = lock(conversation)?;
    if cancel.is_cancelled() {
        return Ok(false);
    }
    cancel.cancel();
    state.apply_delta(&ChatDelta::StreamEnded);
    emitter.emit(ChatUpdate {
        request_id: request_id.to_string(),
        conversation_id: state.id.clone(),
        delta: ChatDelta::StreamEnded,
    });
    Ok(true)
}

fn ensure_idle(conversation: &SharedConversation) -> Result<(), ClientError> {
    if lock(conversation)?.is_streaming {
        return Err(ClientError::ConversationBusy);
    }
    Ok(())
}

/// Apply a delta to the shared state, then hand it to the emitter.
fn publish(
    conversation: &SharedConversation,
    emitter: &dyn Emitter,
    request_id: &str,
    delta: ChatDelta,
) -> Result<(), ClientError> {
    let mut state = lock(conversation)?;
    state.apply_delta(&delta);
    emitter.emit(ChatUpdate {
        request_id: request_id.to_string(),
        conversation_id: state.id.clone(),
        delta,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::api::types::ChatSummary;
    use crate::services::chat::{ChatMessage, Conversation, RecordingEmitter, shared};
    use async_trait::async_trait;
    use futures_util::StreamExt;

    fn poison(registry: &Arc<Mutex<StreamRegistry>>) {
        let moved = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = moved.lock().unwrap();
            panic!("registry poisoned for test");
        })
        .join();
        assert!(registry.is_poisoned());
    }

    /// Opens an empty stream; optionally poisons the registry while doing so.
    #[derive(Default)]
    struct OpenOnly {
        poison_on_open: Mutex<Option<Arc<Mutex<StreamRegistry>>>>,
    }

    #[async_trait]
    impl ChatBackend for OpenOnly {
        async fn open_message_stream(
            &self,
            _chat_id: &str,
            _request: &MessageRequest,
        ) -> Result<ByteStream, ClientError> {
            if let Some(registry) = self.poison_on_open.lock().unwrap().take() {
                poison(&registry);
            }
            Ok(futures_util::stream::empty().boxed())
        }

        async fn list_messages(&self, _chat_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
            Ok(Vec::new())
        }

        async fn create_chat(&self, _request: &ChatCreate) -> Result<ChatSummary, ClientError> {
            Err(ClientError::Config("no chat creation here".into()))
        }

        async fn edit_message(&self, _message_id: &str, _text: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn toggle_message_pair(&self, _pair_id: &str, _hidden: bool) -> Result<(), ClientError> {
            Ok(())
        }

        async fn delete_message_pair(&self, _pair_id: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poisoned_registry_reports_busy() {
        let emitter = Arc::new(RecordingEmitter::new());
        let manager = ChatStreamManager::new(Arc::new(OpenOnly::default()), emitter.clone());
        poison(&manager.registry);

        assert!(manager.is_busy("c1"));

        let conversation = shared(Conversation::new("c1"));
        let result = manager.submit(conversation.clone(), &Submission::new("hi")).await;
        assert!(matches!(result, Err(ClientError::ConversationBusy)));
        assert!(!conversation.lock().unwrap().is_streaming);
        assert!(emitter.updates().is_empty());
    }

    #[tokio::test]
    async fn test_registry_poisoned_during_open_rolls_back() {
        let backend = Arc::new(OpenOnly::default());
        let emitter = Arc::new(RecordingEmitter::new());
        let manager = ChatStreamManager::new(backend.clone(), emitter.clone());
        *backend.poison_on_open.lock().unwrap() = Some(manager.registry.clone());

        let conversation = shared(Conversation::new("c1"));
        let result = manager.submit(conversation.clone(), &Submission::new("hi")).await;
        assert!(matches!(result, Err(ClientError::LockPoisoned)));

        let state = conversation.lock().unwrap();
        assert!(!state.is_streaming);
        assert!(state.messages.is_empty());

        let deltas: Vec<ChatDelta> = emitter.updates().into_iter().map(|u| u.delta).collect();
        assert_eq!(deltas, vec![ChatDelta::StreamStarted, ChatDelta::StreamEnded]);
    }

    #[test]
    fn test_blank_submission_is_empty() {
        assert!(Submission::new("  \n").is_empty());

        let mut with_file = Submission::new("");
        with_file.files.push("f1".to_string());
        assert!(!with_file.is_empty());
        assert!(!Submission::new("hi").is_empty());
    }
}
