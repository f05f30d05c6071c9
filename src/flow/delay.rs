//! Scheduled flow resumption for long delay nodes.
//!
//! Delays above the inline ceiling never block an executing run. The
//! interpreter returns a `Scheduled` outcome and the engine registers the
//! resumption here; when the timer fires, a [`ResumeDue`] token is emitted
//! for the engine to pick the run back up. One pending timer per
//! conversation; scheduling again replaces the old timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Emitted when a scheduled delay elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeDue {
    pub conversation_id: Uuid,
    /// The delay node whose successors the run continues from.
    pub node_id: String,
}

pub struct DelayScheduler {
    tx: mpsc::UnboundedSender<ResumeDue>,
    pending: RwLock<HashMap<Uuid, JoinHandle<()>>>,
}

impl DelayScheduler {
    /// Create a scheduler and the receiver the engine drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ResumeDue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                pending: RwLock::new(HashMap::new()),
            }),
            rx,
        )
    }

    /// Schedule a resumption after `delay`. Replaces any pending timer for
    /// the conversation.
    pub async fn schedule(&self, conversation_id: Uuid, node_id: String, delay: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(ResumeDue {
                conversation_id,
                node_id,
            });
        });

        let mut pending = self.pending.write().await;
        if let Some(old) = pending.insert(conversation_id, handle) {
            old.abort();
        }
    }

    /// Cancel the pending timer for a conversation, if any. Used when a new
    /// inbound message supersedes the scheduled continuation.
    pub async fn cancel(&self, conversation_id: Uuid) -> bool {
        let mut pending = self.pending.write().await;
        match pending.remove(&conversation_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop the bookkeeping entry once a resumption has been handled.
    pub async fn mark_resumed(&self, conversation_id: Uuid) {
        self.pending.write().await.remove(&conversation_id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_and_emits_token() {
        let (scheduler, mut rx) = DelayScheduler::new();
        let convo = Uuid::new_v4();
        scheduler
            .schedule(convo, "delay_1".into(), Duration::from_secs(300))
            .await;
        assert_eq!(scheduler.pending_count().await, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let due = rx.recv().await.unwrap();
        assert_eq!(
            due,
            ResumeDue {
                conversation_id: convo,
                node_id: "delay_1".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_emission() {
        let (scheduler, mut rx) = DelayScheduler::new();
        let convo = Uuid::new_v4();
        scheduler
            .schedule(convo, "delay_1".into(), Duration::from_secs(300))
            .await;
        assert!(scheduler.cancel(convo).await);
        assert!(!scheduler.cancel(convo).await);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_timer() {
        let (scheduler, mut rx) = DelayScheduler::new();
        let convo = Uuid::new_v4();
        scheduler
            .schedule(convo, "delay_1".into(), Duration::from_secs(100))
            .await;
        scheduler
            .schedule(convo, "delay_2".into(), Duration::from_secs(200))
            .await;
        assert_eq!(scheduler.pending_count().await, 1);

        tokio::time::advance(Duration::from_secs(250)).await;
        let due = rx.recv().await.unwrap();
        assert_eq!(due.node_id, "delay_2");
        assert!(rx.try_recv().is_err());
    }
}
