//! Buffer-then-flush writer in front of a [`TrailStore`].
//!
//! Producers push entries without awaiting the store; a background task
//! holds them until a flush is requested and then writes them in order.

use colony_core::{DecisionRecord, EventEnvelope};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::trail::TrailStore;

#[derive(Debug, Clone)]
pub enum TrailEntry {
    State { step: u64, state: Value },
    Event { step: u64, event: EventEnvelope },
    Decision { step: u64, decision: DecisionRecord },
    StepCompleted,
}

enum Command {
    Push(TrailEntry),
    Flush(Option<oneshot::Sender<usize>>),
}

pub struct PersistenceBuffer {
    commands: mpsc::UnboundedSender<Command>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PersistenceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceBuffer").finish_non_exhaustive()
    }
}

impl PersistenceBuffer {
    pub fn spawn(store: Arc<dyn TrailStore>, trail_id: impl Into<String>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(store, trail_id.into(), rx));
        Self {
            commands,
            writer: std::sync::Mutex::new(Some(writer)),
        }
    }

    /// Queue an entry; never waits on the store
    pub fn push(&self, entry: TrailEntry) {
        if self.commands.send(Command::Push(entry)).is_err() {
            warn!("Trail writer gone, entry discarded");
        }
    }

    /// Ask the writer to persist everything queued so far, without waiting
    pub fn request_flush(&self) {
        // a closed writer has nothing left to flush
        let _ = self.commands.send(Command::Flush(None));
    }

    /// Persist everything queued so far and wait. Returns entries written.
    pub async fn flush(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(Some(tx))).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }

    /// Flush and stop the writer
    pub async fn close(&self) {
        self.flush().await;
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            writer.abort();
            // aborted after its final flush; the join error is expected
            let _ = writer.await;
        }
    }
}

async fn run_writer(
    store: Arc<dyn TrailStore>,
    trail_id: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: Vec<TrailEntry> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Push(entry) => pending.push(entry),
            Command::Flush(ack) => {
                let written = write_all(store.as_ref(), &trail_id, std::mem::take(&mut pending)).await;
                if let Some(ack) = ack {
                    let _ = ack.send(written);
                }
            }
        }
    }

    if !pending.is_empty() {
        write_all(store.as_ref(), &trail_id, pending).await;
    }
}

async fn write_all(store: &dyn TrailStore, trail_id: &str, entries: Vec<TrailEntry>) -> usize {
    let total = entries.len();
    let mut written = 0;
    for entry in entries {
        let result = match &entry {
            TrailEntry::State { step, state } => store.save_state(trail_id, *step, state).await,
            TrailEntry::Event { step, event } => store.create_event(trail_id, *step, event).await,
            TrailEntry::Decision { step, decision } => {
                store.record_decision(trail_id, *step, decision).await
            }
            TrailEntry::StepCompleted => store.update_step_count(trail_id).await.map(|_| ()),
        };
        match result {
            Ok(()) => written += 1,
            Err(err) => warn!(trail_id, error = %err, "Failed to persist trail entry"),
        }
    }
    if total > 0 {
        debug!(trail_id, written, total, "Flushed trail entries");
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trail::InMemoryTrailStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_entries_wait_for_flush() {
        let store = Arc::new(InMemoryTrailStore::new());
        let buffer = PersistenceBuffer::spawn(store.clone(), "t");

        buffer.push(TrailEntry::State {
            step: 1,
            state: json!({"a": 1}),
        });
        buffer.push(TrailEntry::StepCompleted);
        tokio::task::yield_now().await;
        assert!(store.records().is_empty());

        assert_eq!(buffer.flush().await, 2);
        assert_eq!(store.states().len(), 1);
        assert_eq!(store.step_count("t"), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_remaining() {
        let store = Arc::new(InMemoryTrailStore::new());
        let buffer = PersistenceBuffer::spawn(store.clone(), "t");
        buffer.push(TrailEntry::State {
            step: 3,
            state: json!({}),
        });
        buffer.close().await;
        assert_eq!(store.states().len(), 1);
        assert_eq!(buffer.flush().await, 0);
    }
}
