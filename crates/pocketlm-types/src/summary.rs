use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A terse synopsis of the older part of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub chat_id: String,
    pub text: String,
    /// How many messages of the conversation existed when this was produced.
    pub covered_message_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ConversationSummary {
    /// A summary goes stale once the live conversation has moved on by at
    /// least `tolerance` messages since it was written.
    pub fn is_stale(&self, live_message_count: usize, tolerance: usize) -> bool {
        live_message_count.abs_diff(self.covered_message_count) >= tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_uses_absolute_divergence() {
        let summary = ConversationSummary {
            chat_id: "c".into(),
            text: "t".into(),
            covered_message_count: 16,
            created_at: Utc::now(),
        };
        assert!(!summary.is_stale(20, 8));
        assert!(summary.is_stale(24, 8));
        // History got shorter (messages deleted) - also stale.
        assert!(summary.is_stale(4, 8));
    }
}
