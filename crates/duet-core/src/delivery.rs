//! Message delivery state machine.
//!
//! A message moves `Sent -> Delivered -> Read` and never back. Every
//! write for a conversation runs under that conversation's lock, so
//! submissions and status transitions never interleave within one
//! conversation while unrelated conversations proceed in parallel.

use crate::conversation::{ConversationResolver, ParticipantPair};
use crate::error::CoreError;
use crate::store::{MessageStore, NewMessage, StatusTarget};
use dashmap::DashMap;
use duet_protocol::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, MessageStatus,
};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// Per-conversation write locks.
#[derive(Debug, Default)]
struct ConversationLocks {
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    async fn acquire(&self, id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(id).or_default().value());
        lock.lock_owned().await
    }
}

/// Result of marking a conversation read.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    /// The conversation that was read.
    pub conversation: Conversation,
    /// The reader.
    pub reader: String,
    /// Messages that moved to `Read`; empty if nothing was unread.
    pub messages: Vec<Message>,
}

impl ReadOutcome {
    /// The participant to send a receipt to, if anything changed.
    #[must_use]
    pub fn receipt_recipient(&self) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        self.conversation.other_participant(&self.reader)
    }
}

/// Owns every message status transition.
pub struct MessageDelivery {
    store: Arc<dyn MessageStore>,
    resolver: ConversationResolver,
    locks: ConversationLocks,
}

impl MessageDelivery {
    /// Create a delivery state machine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            resolver: ConversationResolver::new(Arc::clone(&store)),
            store,
            locks: ConversationLocks::default(),
        }
    }

    /// The resolver used to find conversations.
    #[must_use]
    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    /// Persist a new message from `sender` to `receiver` in the `Sent` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the participants are the same user or the store
    /// fails. Nothing is persisted on error.
    pub async fn submit(
        &self,
        sender: &str,
        receiver: &str,
        content: impl Into<String>,
    ) -> Result<Message, CoreError> {
        let conversation = self.resolver.resolve(sender, receiver).await?;
        let _guard = self.locks.acquire(conversation.id).await;

        let message = self
            .store
            .save_message(NewMessage {
                conversation_id: conversation.id,
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                content: content.into(),
            })
            .await?;

        debug!(
            message = message.id,
            conversation = conversation.id,
            seq = message.seq,
            "Message submitted"
        );
        Ok(message)
    }

    /// Move a message from `Sent` to `Delivered`.
    ///
    /// Returns the message as it stands afterwards. A message already
    /// delivered or read is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the message does not exist or the store fails.
    /// The message itself stays persisted; the update can be retried.
    pub async fn mark_delivered(&self, id: MessageId) -> Result<Message, CoreError> {
        let message = self
            .store
            .find_message(id)
            .await?
            .ok_or(CoreError::MessageNotFound(id))?;
        let _guard = self.locks.acquire(message.conversation_id).await;

        let updated = self
            .store
            .update_message_status(StatusTarget::Message(id), MessageStatus::Delivered)
            .await?;

        match updated.into_iter().next() {
            Some(delivered) => {
                trace!(message = id, "Message delivered");
                Ok(delivered)
            }
            None => self
                .store
                .find_message(id)
                .await?
                .ok_or(CoreError::MessageNotFound(id)),
        }
    }

    /// Mark every unread message addressed to `reader` in a conversation as `Read`.
    ///
    /// Calling this again with nothing new to read changes nothing and
    /// yields an outcome with no messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist, `reader` is not
    /// a participant, or the store fails.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: &str,
    ) -> Result<ReadOutcome, CoreError> {
        let conversation = self
            .store
            .find_conversation_by_id(conversation_id)
            .await?
            .ok_or(CoreError::ConversationNotFound(conversation_id))?;

        if !conversation.has_participant(reader) {
            return Err(CoreError::NotParticipant {
                user: reader.to_string(),
                conversation: conversation_id,
            });
        }

        let _guard = self.locks.acquire(conversation_id).await;
        let messages = self
            .store
            .update_message_status(
                StatusTarget::Inbox {
                    conversation_id,
                    receiver: reader.to_string(),
                },
                MessageStatus::Read,
            )
            .await?;

        debug!(
            conversation = conversation_id,
            reader = %reader,
            count = messages.len(),
            "Messages read"
        );
        Ok(ReadOutcome {
            conversation,
            reader: reader.to_string(),
            messages,
        })
    }

    /// Messages exchanged between `user` and `peer`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if `user == peer` or the store fails.
    pub async fn history(&self, user: &str, peer: &str) -> Result<Vec<Message>, CoreError> {
        let pair = ParticipantPair::new(user, peer)?;
        let Some(conversation) = self.store.find_conversation(&pair).await? else {
            return Ok(Vec::new());
        };

        let mut messages = self.store.conversation_messages(conversation.id).await?;
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    /// The latest message of each of `user`'s conversations.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn last_messages(&self, user: &str) -> Result<Vec<ConversationSummary>, CoreError> {
        Ok(self.store.find_last_message_per_conversation(user).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn delivery() -> MessageDelivery {
        MessageDelivery::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_submit_starts_sent() {
        let delivery = delivery();
        let message = delivery.submit("1", "2", "hi").await.unwrap();

        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender, "1");
        assert_eq!(message.receiver, "2");
        assert_eq!(message.seq, 1);
    }

    #[tokio::test]
    async fn test_submit_to_self_rejected() {
        let delivery = delivery();
        assert!(matches!(
            delivery.submit("1", "1", "hi").await,
            Err(CoreError::SelfConversation)
        ));
    }

    #[tokio::test]
    async fn test_mark_delivered_is_forward_only() {
        let delivery = delivery();
        let message = delivery.submit("1", "2", "hi").await.unwrap();

        let delivered = delivery.mark_delivered(message.id).await.unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        delivery.mark_read(message.conversation_id, "2").await.unwrap();

        // A late delivery mark must not pull the message back from Read.
        let current = delivery.mark_delivered(message.id).await.unwrap();
        assert_eq!(current.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_mark_delivered_unknown_message() {
        let delivery = delivery();
        assert!(matches!(
            delivery.mark_delivered(42).await,
            Err(CoreError::MessageNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let delivery = delivery();
        let first = delivery.submit("1", "2", "one").await.unwrap();
        delivery.submit("1", "2", "two").await.unwrap();
        delivery.submit("2", "1", "reply").await.unwrap();
        delivery.mark_delivered(first.id).await.unwrap();

        let outcome = delivery.mark_read(first.conversation_id, "2").await.unwrap();
        assert_eq!(outcome.messages.len(), 2);
        assert!(outcome.messages.iter().all(|m| m.status == MessageStatus::Read));
        assert_eq!(outcome.receipt_recipient(), Some("1"));

        let repeat = delivery.mark_read(first.conversation_id, "2").await.unwrap();
        assert!(repeat.messages.is_empty());
        assert_eq!(repeat.receipt_recipient(), None);
    }

    #[tokio::test]
    async fn test_mark_read_rejects_outsiders() {
        let delivery = delivery();
        let message = delivery.submit("1", "2", "hi").await.unwrap();

        assert!(matches!(
            delivery.mark_read(message.conversation_id, "3").await,
            Err(CoreError::NotParticipant { .. })
        ));
        assert!(matches!(
            delivery.mark_read(999, "2").await,
            Err(CoreError::ConversationNotFound(999))
        ));
    }

    #[tokio::test]
    async fn test_history_in_submission_order() {
        let delivery = delivery();
        assert!(delivery.history("1", "2").await.unwrap().is_empty());

        for i in 0..5 {
            let (from, to) = if i % 2 == 0 { ("1", "2") } else { ("2", "1") };
            delivery.submit(from, to, format!("m{}", i)).await.unwrap();
        }

        let history = delivery.history("2", "1").await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let summaries = delivery.last_messages("1").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].last_message.as_ref().unwrap().content, "m4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_stay_monotonic() {
        let delivery = Arc::new(delivery());
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(delivery.submit("1", "2", format!("m{}", i)).await.unwrap().id);
        }
        let conversation_id = delivery.history("1", "2").await.unwrap()[0].conversation_id;

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let delivery = Arc::clone(&delivery);
            tasks.push(tokio::spawn(async move {
                delivery.mark_delivered(id).await.map(|_| ())
            }));
        }
        for _ in 0..4 {
            let delivery = Arc::clone(&delivery);
            tasks.push(tokio::spawn(async move {
                delivery.mark_read(conversation_id, "2").await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Whatever the interleaving, the final read pass leaves everything Read.
        delivery.mark_read(conversation_id, "2").await.unwrap();
        let history = delivery.history("1", "2").await.unwrap();
        assert!(history.iter().all(|m| m.status == MessageStatus::Read));
        let seqs: Vec<_> = history.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }
}
