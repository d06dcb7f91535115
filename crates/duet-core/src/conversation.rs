//! Conversation resolution.
//!
//! Every unordered pair of users maps to exactly one conversation, created
//! on first contact.

use crate::error::CoreError;
use crate::store::{MessageStore, StoreError};
use duet_protocol::{Conversation, ConversationId, UserId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Normalized key for an unordered pair of distinct users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    /// Build the key for `a` and `b` in either order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SelfConversation`] if `a == b`.
    pub fn new(a: &str, b: &str) -> Result<Self, CoreError> {
        if a == b {
            return Err(CoreError::SelfConversation);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            low: low.to_string(),
            high: high.to_string(),
        })
    }

    /// The participant that sorts first.
    #[must_use]
    pub fn low(&self) -> &str {
        &self.low
    }

    /// The participant that sorts second.
    #[must_use]
    pub fn high(&self) -> &str {
        &self.high
    }

    /// Build the conversation record for this pair.
    #[must_use]
    pub fn to_conversation(&self, id: ConversationId) -> Conversation {
        Conversation {
            id,
            participant_a: self.low.clone(),
            participant_b: self.high.clone(),
        }
    }
}

impl fmt::Display for ParticipantPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Resolves participant pairs to their conversation.
///
/// Uniqueness is delegated to the store: when two first contacts race, the
/// loser's create reports a conflict and it adopts the winner's record.
#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn MessageStore>,
}

impl ConversationResolver {
    /// Create a resolver over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Find or create the conversation between `a` and `b`.
    ///
    /// # Errors
    ///
    /// Returns an error if `a == b` or the store fails.
    pub async fn resolve(&self, a: &str, b: &str) -> Result<Conversation, CoreError> {
        let pair = ParticipantPair::new(a, b)?;

        if let Some(conversation) = self.store.find_conversation(&pair).await? {
            trace!(pair = %pair, conversation = conversation.id, "Conversation found");
            return Ok(conversation);
        }

        match self.store.create_conversation(&pair).await {
            Ok(conversation) => {
                debug!(pair = %pair, conversation = conversation.id, "Conversation created");
                Ok(conversation)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(pair = %pair, "Conversation created concurrently, re-fetching");
                self.store
                    .find_conversation(&pair)
                    .await?
                    .ok_or_else(|| StoreError::Missing(format!("conversation {}", pair)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find the existing conversation between `a` and `b` without creating one.
    ///
    /// # Errors
    ///
    /// Returns an error if `a == b` or the store fails.
    pub async fn find(&self, a: &str, b: &str) -> Result<Option<Conversation>, CoreError> {
        let pair = ParticipantPair::new(a, b)?;
        Ok(self.store.find_conversation(&pair).await?)
    }
}
