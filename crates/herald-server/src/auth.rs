use std::collections::HashSet;
use std::sync::Arc;

use herald_contracts::ConversationId;

/// Conversations allowed to talk to the bridge. An empty set allows nobody.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    allowed: Arc<HashSet<ConversationId>>,
}

impl Authorization {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed: Arc::new(ids.into_iter().map(ConversationId).collect()),
        }
    }

    pub fn allows(&self, conversation: ConversationId) -> bool {
        self.allowed.contains(&conversation)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
