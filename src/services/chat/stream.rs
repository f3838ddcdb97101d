use std::fmt::Display;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::services::error::ClientError;

use super::assembler::{CONNECTION_LOST, StreamAssembler};
use super::conversation::{SharedConversation, lock};
use super::decoder::{DecodedEvents, LineDecoder};
use super::emitter::Emitter;
use super::types::{ChatDelta, ChatUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `done` arrived; the conversation should be refetched.
    Completed,
    /// The body ended or failed while a reply was still open.
    ConnectionLost,
    /// The body ended without `done`, either with nothing open or right after
    /// the server reported an error.
    Ended,
    /// The token was cancelled; nothing more was applied.
    Cancelled,
}

/// Read the body chunk by chunk, applying each decoded event in order.
///
/// Returns as soon as the chunk carrying `done` has been applied, which drops
/// the body and releases the connection. Cancellation is checked under the
/// conversation lock before every event, so once whoever cancels has taken
/// that lock no further event lands.
pub async fn consume_stream<S, E>(
    mut body: S,
    request_id: &str,
    assembler: &mut StreamAssembler,
    conversation: &SharedConversation,
    emitter: &dyn Emitter,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, ClientError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut decoder = LineDecoder::new();
    let mut events = DecodedEvents::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                log::warn!("Stream {} failed mid-response: {}", request_id, err);
                decoder.finish();
                return close_with_notice(request_id, assembler, conversation, emitter, cancel);
            }
        };

        decoder.push(&chunk, &mut events);

        let mut completed = false;
        for event in events.drain(..) {
            let mut state = lock(conversation)?;
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled);
            }
            let Some(delta) = assembler.apply(&mut state, event) else {
                continue;
            };
            completed |= delta == ChatDelta::Done;
            let update = ChatUpdate {
                request_id: request_id.to_string(),
                conversation_id: state.id.clone(),
                delta,
            };
            emitter.emit(update);
        }

        if completed {
            decoder.finish();
            return Ok(StreamOutcome::Completed);
        }
    }

    decoder.finish();
    if !assembler.is_open() {
        return Ok(StreamOutcome::Ended);
    }
    if assembler.error_reported() {
        assembler.close();
        return Ok(StreamOutcome::Ended);
    }
    log::warn!("Stream {} ended before completion", request_id);
    close_with_notice(request_id, assembler, conversation, emitter, cancel)
}

fn close_with_notice(
    request_id: &str,
    assembler: &mut StreamAssembler,
    conversation: &SharedConversation,
    emitter: &dyn Emitter,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, ClientError> {
    let mut state = lock(conversation)?;
    if cancel.is_cancelled() {
        return Ok(StreamOutcome::Cancelled);
    }
    let delta = assembler.fail(&mut state, CONNECTION_LOST);
    emitter.emit(ChatUpdate {
        request_id: request_id.to_string(),
        conversation_id: state.id.clone(),
        delta,
    });
    Ok(StreamOutcome::ConnectionLost)
}
