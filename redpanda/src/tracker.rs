//! Per-subscription bookkeeping for acknowledgement-driven redelivery.
//!
//! Kafka commits are positional: committing offset `n` on a partition implies
//! everything before it was processed. A subscription therefore hands out one
//! delivery at a time, and when a delivery comes back unacknowledged it rewinds
//! the partition to that offset. Messages the client had already prefetched past
//! the rewind point are stale until the rewound message shows up again, and must
//! be neither delivered nor committed.

use std::collections::HashMap;

/// What to do with a message read from the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Deliver it; this is delivery number `attempt`
    Deliver {
        /// 1 on first delivery
        attempt: u32,
    },
    /// Prefetched past a rewind point; drop it without committing
    Stale,
}

/// Tracks delivery attempts and pending rewinds per partition.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    attempts: HashMap<(i32, i64), u32>,
    rewound_to: HashMap<i32, i64>,
}

impl DeliveryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a message read at `(partition, offset)` is delivered.
    pub fn admit(&mut self, partition: i32, offset: i64) -> Admit {
        if let Some(&target) = self.rewound_to.get(&partition) {
            if offset != target {
                return Admit::Stale;
            }
            self.rewound_to.remove(&partition);
        }

        let attempt = self.attempts.entry((partition, offset)).or_insert(0);
        *attempt += 1;
        Admit::Deliver { attempt: *attempt }
    }

    /// The delivery at `(partition, offset)` was acknowledged.
    pub fn acknowledged(&mut self, partition: i32, offset: i64) {
        self.attempts.remove(&(partition, offset));
    }

    /// The delivery at `(partition, offset)` came back unacknowledged and the
    /// partition was rewound to it.
    pub fn rewound(&mut self, partition: i32, offset: i64) {
        self.rewound_to.insert(partition, offset);
    }

    /// Number of messages delivered but not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }
}
