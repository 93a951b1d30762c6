//! Retry schedule and sequence numbering for acknowledged group delivery.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skynet_shared::constants::{RETRY_BASE_MS, RETRY_CAP_MS, RETRY_MAX_ATTEMPTS};
use skynet_shared::{ConversationId, ParticipantId};

/// Exponential backoff applied between retransmissions of a reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total transmissions, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RETRY_BASE_MS),
            cap: Duration::from_millis(RETRY_CAP_MS),
            max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// How long to wait for an ack after transmission number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Ack wait after each transmission, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(move |attempt| self.delay_for(attempt))
    }
}

/// Outcome of a successful reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableDelivery {
    pub sequence: u64,
    /// Transmissions it took before the ack was seen.
    pub attempts: u32,
}

/// Next sequence number per (sender, conversation) stream.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: HashMap<(ParticipantId, ConversationId), u64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next number for the stream; streams start at 1.
    pub fn next(&mut self, sender: &ParticipantId, conversation: &ConversationId) -> u64 {
        let slot = self
            .next
            .entry((sender.clone(), conversation.clone()))
            .or_insert(1);
        let seq = *slot;
        *slot += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000]);
    }

    #[test]
    fn test_schedule_is_capped() {
        let policy = RetryPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_attempts: 8,
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
        assert_eq!(policy.delays().count(), 8);
    }

    #[test]
    fn test_sequence_per_stream() {
        let mut seq = SequenceCounter::new();
        let alice = ParticipantId::new("alice");
        let conv_a = ConversationId("a".into());
        let conv_b = ConversationId("b".into());

        assert_eq!(seq.next(&alice, &conv_a), 1);
        assert_eq!(seq.next(&alice, &conv_a), 2);
        assert_eq!(seq.next(&alice, &conv_b), 1);
        assert_eq!(seq.next(&alice, &conv_a), 3);
    }
}
