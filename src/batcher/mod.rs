//! Per-Session Event Batcher (spec §4.4): one buffer per session, flushed on
//! size-or-time, fed through a per-session actor task so adds/flushes for a
//! session are strictly serialized (spec §5).

use crate::models::Id;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_BATCH_MAX_EVENTS: usize = 10;

/// Invoked with the ordered event-id slice of a flushed batch. Implementors
/// must not block; heavy work should hand off to its own task.
#[async_trait]
pub trait FlushSink: Send + Sync {
    async fn on_flush(&self, session_id: Id, event_ids: Vec<Id>);
}

enum Command {
    Add(Id),
    Flush,
}

struct SessionActor {
    tx: mpsc::UnboundedSender<Command>,
}

/// Holds one lightweight tokio task per session with a pending buffer; the
/// task owns the timer so cancellation is just "drop the old one and arm a
/// new one", never a race between a fired timer and a manual flush.
pub struct EventBatcher {
    sink: Arc<dyn FlushSink>,
    interval: Duration,
    max_events: usize,
    actors: Mutex<HashMap<Id, Arc<SessionActor>>>,
}

impl EventBatcher {
    pub fn new(sink: Arc<dyn FlushSink>, interval_ms: u64, max_events: usize) -> Self {
        Self {
            sink,
            interval: Duration::from_millis(interval_ms),
            max_events,
            actors: Mutex::new(HashMap::new()),
        }
    }

    async fn actor_for(&self, session_id: &Id) -> Arc<SessionActor> {
        let mut actors = self.actors.lock().await;
        if let Some(actor) = actors.get(session_id) {
            return actor.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Arc::new(SessionActor { tx });
        actors.insert(session_id.clone(), actor.clone());
        tokio::spawn(Self::run(session_id.clone(), rx, self.sink.clone(), self.interval, self.max_events));
        actor
    }

    pub async fn add(&self, session_id: &Id, event_id: Id) {
        let actor = self.actor_for(session_id).await;
        if actor.tx.send(Command::Add(event_id)).is_err() {
            warn!(session_id = %session_id, "batcher actor channel closed, event dropped");
        }
    }

    pub async fn flush(&self, session_id: &Id) {
        let actors = self.actors.lock().await;
        if let Some(actor) = actors.get(session_id) {
            let _ = actor.tx.send(Command::Flush);
        }
    }

    /// Used at graceful shutdown: flush every buffer with a pending batch.
    pub async fn flush_all(&self) {
        let actors = self.actors.lock().await;
        for actor in actors.values() {
            let _ = actor.tx.send(Command::Flush);
        }
    }

    async fn run(
        session_id: Id,
        mut rx: mpsc::UnboundedReceiver<Command>,
        sink: Arc<dyn FlushSink>,
        interval: Duration,
        max_events: usize,
    ) {
        let mut buffer: Vec<Id> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                maybe_cmd = rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Add(id)) => {
                            if buffer.is_empty() {
                                deadline = Some(Instant::now() + interval);
                            }
                            buffer.push(id);
                            if buffer.len() >= max_events {
                                debug!(session_id = %session_id, n = buffer.len(), "batch size reached, flushing");
                                let batch = std::mem::take(&mut buffer);
                                deadline = None;
                                metrics::histogram!("interaction_engine_batch_size").record(batch.len() as f64);
                                sink.on_flush(session_id.clone(), batch).await;
                            }
                        }
                        Some(Command::Flush) => {
                            deadline = None;
                            if !buffer.is_empty() {
                                let batch = std::mem::take(&mut buffer);
                                metrics::histogram!("interaction_engine_batch_size").record(batch.len() as f64);
                                sink.on_flush(session_id.clone(), batch).await;
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                let batch = std::mem::take(&mut buffer);
                                metrics::histogram!("interaction_engine_batch_size").record(batch.len() as f64);
                                sink.on_flush(session_id.clone(), batch).await;
                            }
                            break;
                        }
                    }
                }
                _ = sleep, if deadline.is_some() => {
                    deadline = None;
                    if !buffer.is_empty() {
                        debug!(session_id = %session_id, "batch interval elapsed, flushing");
                        let batch = std::mem::take(&mut buffer);
                        metrics::histogram!("interaction_engine_batch_size").record(batch.len() as f64);
                        sink.on_flush(session_id.clone(), batch).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct RecordingSink {
        flushes: TokioMutex<Vec<(Id, Vec<Id>)>>,
    }

    #[async_trait]
    impl FlushSink for RecordingSink {
        async fn on_flush(&self, session_id: Id, event_ids: Vec<Id>) {
            self.flushes.lock().await.push((session_id, event_ids));
        }
    }

    #[tokio::test]
    async fn flushes_immediately_at_max_events() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = EventBatcher::new(sink.clone(), 60_000, 3);
        let session = "s1".to_string();
        batcher.add(&session, "e1".into()).await;
        batcher.add(&session, "e2".into()).await;
        batcher.add(&session, "e3".into()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let flushes = sink.flushes.lock().await;
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1, vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn flush_all_drains_pending_buffers_at_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = EventBatcher::new(sink.clone(), 60_000, 10);
        batcher.add(&"s1".to_string(), "e1".into()).await;
        batcher.add(&"s2".to_string(), "e2".into()).await;
        batcher.flush_all().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let flushes = sink.flushes.lock().await;
        assert_eq!(flushes.len(), 2);
    }

    #[tokio::test]
    async fn no_flush_when_interval_elapses_with_zero_events() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = EventBatcher::new(sink.clone(), 20, 10);
        let _ = &batcher; // actor only spawns once an event is added
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.flushes.lock().await.is_empty());
    }
}
