//! In-memory implementation of the store contract.

use crate::conversation::ParticipantPair;
use crate::store::{MessageStore, NewMessage, StatusTarget, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use duet_protocol::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, MessageStatus,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// A [`MessageStore`] that keeps everything in process memory.
///
/// The pair index doubles as the uniqueness constraint on conversations.
/// Each conversation keeps its messages in one log, so sequence numbers are
/// assigned under that log's shard lock.
#[derive(Debug)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    pairs: DashMap<ParticipantPair, ConversationId>,
    logs: DashMap<ConversationId, Vec<Message>>,
    message_index: DashMap<MessageId, ConversationId>,
    next_conversation_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
            pairs: DashMap::new(),
            logs: DashMap::new(),
            message_index: DashMap::new(),
            next_conversation_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Number of conversations stored.
    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Number of messages stored.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_index.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(message: &mut Message, status: MessageStatus) -> bool {
    if message.status.can_advance_to(status) {
        message.status = status;
        true
    } else {
        false
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn find_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Option<Conversation>, StoreError> {
        let Some(id) = self.pairs.get(pair).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn find_conversation_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(&id).map(|c| c.clone()))
    }

    async fn create_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Conversation, StoreError> {
        match self.pairs.entry(pair.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("conversation {}", pair))),
            Entry::Vacant(slot) => {
                let id = self.next_conversation_id.fetch_add(1, Ordering::Relaxed);
                let conversation = pair.to_conversation(id);
                // Record first so the pair index never points at a missing id.
                self.conversations.insert(id, conversation.clone());
                slot.insert(id);
                Ok(conversation)
            }
        }
    }

    async fn save_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::Missing(format!(
                "conversation {}",
                message.conversation_id
            )));
        }

        let mut log = self.logs.entry(message.conversation_id).or_default();
        let stored = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            conversation_id: message.conversation_id,
            seq: log.len() as u64 + 1,
            sender: message.sender,
            receiver: message.receiver,
            content: message.content,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
        };
        log.push(stored.clone());
        self.message_index.insert(stored.id, stored.conversation_id);

        Ok(stored)
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let Some(conversation_id) = self.message_index.get(&id).map(|c| *c) else {
            return Ok(None);
        };
        Ok(self
            .logs
            .get(&conversation_id)
            .and_then(|log| log.iter().find(|m| m.id == id).cloned()))
    }

    async fn update_message_status(
        &self,
        target: StatusTarget,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError> {
        match target {
            StatusTarget::Message(id) => {
                let conversation_id = self
                    .message_index
                    .get(&id)
                    .map(|c| *c)
                    .ok_or_else(|| StoreError::Missing(format!("message {}", id)))?;
                let mut log = self
                    .logs
                    .get_mut(&conversation_id)
                    .ok_or_else(|| StoreError::Missing(format!("message {}", id)))?;
                let updated = log
                    .iter_mut()
                    .filter(|m| m.id == id)
                    .filter_map(|m| advance(m, status).then(|| m.clone()))
                    .collect();
                Ok(updated)
            }
            StatusTarget::Inbox {
                conversation_id,
                receiver,
            } => {
                let Some(mut log) = self.logs.get_mut(&conversation_id) else {
                    return Ok(Vec::new());
                };
                let updated = log
                    .iter_mut()
                    .filter(|m| m.receiver == receiver)
                    .filter_map(|m| advance(m, status).then(|| m.clone()))
                    .collect();
                Ok(updated)
            }
        }
    }

    async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<Message>, StoreError> {
        Ok(self.logs.get(&id).map(|log| log.clone()).unwrap_or_default())
    }

    async fn find_last_message_per_conversation(
        &self,
        user: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .filter_map(|entry| {
                let conversation = entry.value();
                let peer = conversation.other_participant(user)?.to_string();
                let last_message = self
                    .logs
                    .get(&conversation.id)
                    .and_then(|log| log.last().cloned());
                Some(ConversationSummary {
                    conversation_id: conversation.id,
                    peer,
                    last_message,
                })
            })
            .collect();

        // Most recently active first; silent conversations last.
        summaries.sort_by(|a, b| {
            let a_key = a.last_message.as_ref().map(|m| (m.created_at, m.id));
            let b_key = b.last_message.as_ref().map(|m| (m.created_at, m.id));
            b_key
                .cmp(&a_key)
                .then(a.conversation_id.cmp(&b.conversation_id))
        });
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(conversation_id: ConversationId, sender: &str, receiver: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: format!("from {}", sender),
        }
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = MemoryStore::new();
        let pair = ParticipantPair::new("1", "2").unwrap();

        let created = store.create_conversation(&pair).await.unwrap();
        assert!(matches!(
            store.create_conversation(&pair).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.find_conversation(&pair).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_save_assigns_sequence() {
        let store = MemoryStore::new();
        let pair = ParticipantPair::new("1", "2").unwrap();
        let conversation = store.create_conversation(&pair).await.unwrap();

        let first = store.save_message(new_message(conversation.id, "1", "2")).await.unwrap();
        let second = store.save_message(new_message(conversation.id, "2", "1")).await.unwrap();

        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.status, MessageStatus::Sent);
        assert_eq!(store.message_count(), 2);
        assert_eq!(store.find_message(second.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_save_requires_conversation() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.save_message(new_message(99, "1", "2")).await,
            Err(StoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = MemoryStore::new();
        let pair = ParticipantPair::new("1", "2").unwrap();
        let conversation = store.create_conversation(&pair).await.unwrap();
        let message = store.save_message(new_message(conversation.id, "1", "2")).await.unwrap();

        let read = store
            .update_message_status(StatusTarget::Message(message.id), MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        let delivered = store
            .update_message_status(StatusTarget::Message(message.id), MessageStatus::Delivered)
            .await
            .unwrap();
        assert!(delivered.is_empty());

        let current = store.find_message(message.id).await.unwrap().unwrap();
        assert_eq!(current.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_inbox_update_only_touches_receiver() {
        let store = MemoryStore::new();
        let pair = ParticipantPair::new("1", "2").unwrap();
        let conversation = store.create_conversation(&pair).await.unwrap();
        store.save_message(new_message(conversation.id, "1", "2")).await.unwrap();
        store.save_message(new_message(conversation.id, "2", "1")).await.unwrap();
        store.save_message(new_message(conversation.id, "1", "2")).await.unwrap();

        let target = StatusTarget::Inbox {
            conversation_id: conversation.id,
            receiver: "2".to_string(),
        };
        let updated = store
            .update_message_status(target.clone(), MessageStatus::Read)
            .await
            .unwrap();
        assert_eq!(updated.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 3]);

        let again = store.update_message_status(target, MessageStatus::Read).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_last_message_per_conversation() {
        let store = MemoryStore::new();
        let with_two = store
            .create_conversation(&ParticipantPair::new("1", "2").unwrap())
            .await
            .unwrap();
        let with_three = store
            .create_conversation(&ParticipantPair::new("3", "1").unwrap())
            .await
            .unwrap();
        store
            .create_conversation(&ParticipantPair::new("2", "3").unwrap())
            .await
            .unwrap();

        store.save_message(new_message(with_two.id, "1", "2")).await.unwrap();
        let latest = store.save_message(new_message(with_two.id, "2", "1")).await.unwrap();

        let summaries = store.find_last_message_per_conversation("1").await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].peer, "2");
        assert_eq!(summaries[0].last_message, Some(latest));
        assert_eq!(summaries[1].conversation_id, with_three.id);
        assert_eq!(summaries[1].peer, "3");
        assert!(summaries[1].last_message.is_none());
    }
}
