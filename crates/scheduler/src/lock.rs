//! Conversation lock manager: at most one active generation per conversation.

use std::collections::HashSet;
use std::sync::Mutex;

use genqueue_core::ConversationId;

use crate::jobs::{JobStore, JobStoreError};

/// Gate that serializes generation attempts per conversation.
///
/// The durable truth is the job store: a conversation is busy iff it has a
/// job in `queued`/`running`. The in-memory held-set only covers the window
/// between a successful `acquire` and the store write that makes the new job
/// visible. A process restart therefore needs no unlock step: `acquire`
/// re-derives everything else from the store.
#[derive(Debug, Default)]
pub struct ThreadLockManager {
    held: Mutex<HashSet<ConversationId>>,
}

/// Exclusive right to enqueue for one conversation.
///
/// Held across the enqueue write; released on drop. Once the job row is
/// visible in the store, the row itself keeps the conversation busy.
#[derive(Debug)]
pub struct Lease<'a> {
    manager: &'a ThreadLockManager,
    conversation_id: ConversationId,
}

impl Lease<'_> {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.manager.release(self.conversation_id);
    }
}

impl ThreadLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the conversation gate, failing fast with `Busy` when another
    /// generation is queued, running, or currently being enqueued.
    pub fn acquire<'a, S: JobStore>(
        &'a self,
        store: &S,
        conversation_id: ConversationId,
    ) -> Result<Lease<'a>, JobStoreError> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(conversation_id) {
            return Err(JobStoreError::Busy(conversation_id));
        }

        match store.count_active_for_conversation(conversation_id) {
            Ok(0) => Ok(Lease {
                manager: self,
                conversation_id,
            }),
            Ok(_) => {
                held.remove(&conversation_id);
                Err(JobStoreError::Busy(conversation_id))
            }
            Err(e) => {
                held.remove(&conversation_id);
                Err(e)
            }
        }
    }

    fn release(&self, conversation_id: ConversationId) {
        self.held.lock().unwrap().remove(&conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use genqueue_core::ModelId;
    use genqueue_core::ProviderId;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let manager = ThreadLockManager::new();
        let store = InMemoryJobStore::new();
        let conversation = ConversationId::new();

        let lease = manager.acquire(&store, conversation).unwrap();
        assert!(matches!(
            manager.acquire(&store, conversation),
            Err(JobStoreError::Busy(_))
        ));

        drop(lease);
        manager.acquire(&store, conversation).unwrap();
    }

    #[test]
    fn independent_conversations_do_not_contend() {
        let manager = ThreadLockManager::new();
        let store = InMemoryJobStore::new();

        let a = manager.acquire(&store, ConversationId::new()).unwrap();
        let b = manager.acquire(&store, ConversationId::new()).unwrap();
        drop((a, b));
    }

    #[test]
    fn busy_is_rederived_from_store_state() {
        let store = InMemoryJobStore::new();
        let conversation = ConversationId::new();
        let job = store
            .create(
                conversation,
                &ProviderId::new("p"),
                &ModelId::new("m"),
                serde_json::json!({}),
                0,
            )
            .unwrap();
        store.enqueue(job.id).unwrap();

        // A fresh manager (as after a restart) still refuses the conversation.
        let manager = ThreadLockManager::new();
        assert!(matches!(
            manager.acquire(&store, conversation),
            Err(JobStoreError::Busy(_))
        ));

        store.mark_cancelled(job.id).unwrap();
        manager.acquire(&store, conversation).unwrap();
    }
}
