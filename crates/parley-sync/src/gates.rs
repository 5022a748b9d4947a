//! Per-conversation sequencing of write + fan-out.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parley_core::ConversationId;
use tokio::sync::Mutex;

/// Holds one async lock per busy conversation. Recipients see a
/// conversation's events in the order the store committed them because the
/// write and its fan-out run under the same gate.
#[derive(Default)]
pub(crate) struct ConversationGates {
    gates: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationGates {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `work` while holding the conversation's gate.
    pub(crate) async fn run<F, T>(&self, conversation: &ConversationId, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let gate = self.gates.entry(conversation.clone()).or_default().value().clone();
        let result = {
            let _guard = gate.lock().await;
            work.await
        };
        drop(gate);
        // Only the map's own reference left: nobody is waiting.
        let _ = self
            .gates
            .remove_if(conversation, |_, g| Arc::strong_count(g) == 1);
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.gates.len()
    }
}
