use std::sync::Mutex;

use tokio::sync::mpsc;

use super::types::ChatUpdate;

/// Receives state deltas for the rendering layer. Implementations must not block.
pub trait Emitter: Send + Sync {
    fn emit(&self, update: ChatUpdate);
}

impl Emitter for mpsc::UnboundedSender<ChatUpdate> {
    fn emit(&self, update: ChatUpdate) {
        if self.send(update).is_err() {
            log::debug!("Chat update dropped: receiver closed");
        }
    }
}

/// Collects updates in memory; handy for headless callers and tests.
#[derive(Default)]
pub struct RecordingEmitter {
    updates: Mutex<Vec<ChatUpdate>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ChatUpdate> {
        self.updates
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

impl Emitter for RecordingEmitter {
    fn emit(&self, update: ChatUpdate) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(update);
        }
    }
}
