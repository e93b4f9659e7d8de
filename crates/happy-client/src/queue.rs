//! `messageQueueV1`: pure functions over encrypted session metadata.
//!
//! No I/O, no clock reads — callers supply `now` (epoch millis) so every
//! transition here is deterministic and unit-testable without fakes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Stale in-flight reclaim window, duplicated nowhere else (§9 design notes:
/// "treat it as a single named constant").
pub const STALE_IN_FLIGHT_MS: i64 = 60_000;

/// Tail-retained cap on `messageQueueV1Discarded` (§8 property 6).
pub const DISCARD_HISTORY_CAP: usize = 50;

/// One queued (or in-flight, or discarded) user message. `message` is the
/// base64 ciphertext, opaque to this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub local_id: String,
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The single in-flight item, stamped with when it was claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightItem {
    #[serde(flatten)]
    pub item: QueueItem,
    pub claimed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    SwitchToLocal,
    Manual,
}

/// An item moved into `messageQueueV1Discarded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardedItem {
    #[serde(flatten)]
    pub item: QueueItem,
    pub discarded_at: i64,
    pub reason: DiscardReason,
}

/// The embedded queue block. `v` is fixed at `1`; parsing any other shape
/// is strict (§4.4: "a corrupted queue cannot silently swallow messages").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageQueueV1 {
    pub v: u8,
    pub queue: VecDeque<QueueItem>,
    #[serde(default)]
    pub in_flight: Option<InFlightItem>,
}

impl Default for MessageQueueV1 {
    fn default() -> Self {
        Self {
            v: 1,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }
}

/// Outcome of [`claim_next`].
pub struct Claim {
    /// `true` if `meta` must be persisted (fresh claim or stale reclaim).
    /// `false` means the returned item was already durable in-flight.
    pub mutated: bool,
    pub item: InFlightItem,
}

/// `claimNext(meta, now)` — §4.4.
///
/// Returns `None` if there is nothing to claim. Otherwise returns the
/// in-flight item (existing, reclaimed, or freshly popped) and whether
/// `queue` was mutated as a result.
pub fn claim_next(queue: &mut MessageQueueV1, now: i64) -> Option<Claim> {
    if let Some(existing) = queue.in_flight.clone() {
        if now - existing.claimed_at < STALE_IN_FLIGHT_MS {
            return Some(Claim {
                mutated: false,
                item: existing,
            });
        }
        // Stale: move back to the front of the queue, then reclaim.
        queue.queue.push_front(existing.item);
    }

    let item = queue.queue.pop_front()?;
    let claimed = InFlightItem {
        item,
        claimed_at: now,
    };
    queue.in_flight = Some(claimed.clone());
    Some(Claim {
        mutated: true,
        item: claimed,
    })
}

/// `clearInFlight(meta, localId)` — §4.4. No-op if there is no in-flight or
/// the ids differ.
pub fn clear_in_flight(queue: &mut MessageQueueV1, local_id: &str) {
    if queue
        .in_flight
        .as_ref()
        .is_some_and(|f| f.item.local_id == local_id)
    {
        queue.in_flight = None;
    }
}

/// `discardAll(meta, now, reason)` — §4.4. Moves every queued and in-flight
/// item into `discarded`, bounded to the 50 most-recent, tail-retained.
/// Returns the items discarded by this call.
pub fn discard_all(
    queue: &mut MessageQueueV1,
    discarded: &mut Vec<DiscardedItem>,
    now: i64,
    reason: DiscardReason,
) -> Vec<DiscardedItem> {
    let mut moved = Vec::with_capacity(queue.queue.len() + 1);
    if let Some(in_flight) = queue.in_flight.take() {
        moved.push(DiscardedItem {
            item: in_flight.item,
            discarded_at: now,
            reason,
        });
    }
    while let Some(item) = queue.queue.pop_front() {
        moved.push(DiscardedItem {
            item,
            discarded_at: now,
            reason,
        });
    }

    discarded.extend(moved.iter().cloned());
    if discarded.len() > DISCARD_HISTORY_CAP {
        let excess = discarded.len() - DISCARD_HISTORY_CAP;
        discarded.drain(0..excess);
    }

    moved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(local_id: &str, at: i64) -> QueueItem {
        QueueItem {
            local_id: local_id.into(),
            message: "Y2lwaGVy".into(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn claim_next_empty_returns_none() {
        let mut q = MessageQueueV1::default();
        assert!(claim_next(&mut q, 1_000).is_none());
    }

    #[test]
    fn claim_next_fresh_pop() {
        let mut q = MessageQueueV1::default();
        q.queue.push_back(item("L1", 0));
        q.queue.push_back(item("L2", 0));

        let claim = claim_next(&mut q, 1_000).unwrap();
        assert!(claim.mutated);
        assert_eq!(claim.item.item.local_id, "L1");
        assert_eq!(claim.item.claimed_at, 1_000);
        assert_eq!(q.queue.len(), 1);
        assert_eq!(q.in_flight.as_ref().unwrap().item.local_id, "L1");
    }

    #[test]
    fn claim_next_fresh_in_flight_is_returned_unmutated() {
        let mut q = MessageQueueV1::default();
        q.in_flight = Some(InFlightItem {
            item: item("L1", 0),
            claimed_at: 1_000,
        });

        let claim = claim_next(&mut q, 1_500).unwrap();
        assert!(!claim.mutated);
        assert_eq!(claim.item.item.local_id, "L1");
        assert_eq!(claim.item.claimed_at, 1_000);
    }

    #[test]
    fn claim_next_stale_in_flight_is_reclaimed() {
        let mut q = MessageQueueV1::default();
        q.in_flight = Some(InFlightItem {
            item: item("L1", 0),
            claimed_at: 0,
        });
        q.queue.push_back(item("L2", 0));

        let claim = claim_next(&mut q, STALE_IN_FLIGHT_MS + 1).unwrap();
        assert!(claim.mutated);
        assert_eq!(claim.item.item.local_id, "L1");
        assert_eq!(claim.item.claimed_at, STALE_IN_FLIGHT_MS + 1);
        // L2 is untouched, still at the back.
        assert_eq!(q.queue.len(), 1);
        assert_eq!(q.queue[0].local_id, "L2");
    }

    #[test]
    fn clear_in_flight_matching_id() {
        let mut q = MessageQueueV1::default();
        q.in_flight = Some(InFlightItem {
            item: item("L1", 0),
            claimed_at: 0,
        });
        clear_in_flight(&mut q, "L1");
        assert!(q.in_flight.is_none());
    }

    #[test]
    fn clear_in_flight_mismatched_id_is_noop() {
        let mut q = MessageQueueV1::default();
        q.in_flight = Some(InFlightItem {
            item: item("L1", 0),
            claimed_at: 0,
        });
        clear_in_flight(&mut q, "L2");
        assert!(q.in_flight.is_some());
    }

    #[test]
    fn discard_all_moves_queue_and_in_flight() {
        let mut q = MessageQueueV1::default();
        q.in_flight = Some(InFlightItem {
            item: item("L1", 0),
            claimed_at: 0,
        });
        q.queue.push_back(item("L2", 0));
        q.queue.push_back(item("L3", 0));
        let mut history = Vec::new();

        let moved = discard_all(&mut q, &mut history, 5_000, DiscardReason::Manual);
        assert_eq!(moved.len(), 3);
        assert!(q.in_flight.is_none());
        assert!(q.queue.is_empty());
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|d| d.discarded_at == 5_000));
    }

    #[test]
    fn discard_history_cap_is_tail_retained() {
        let mut q = MessageQueueV1::default();
        let mut history = Vec::new();
        for batch in 0..DISCARD_HISTORY_CAP + 5 {
            q.queue.push_back(item(&format!("L{batch}"), 0));
            discard_all(&mut q, &mut history, batch as i64, DiscardReason::SwitchToLocal);
        }
        assert_eq!(history.len(), DISCARD_HISTORY_CAP);
        assert_eq!(history.first().unwrap().item.local_id, "L5");
        assert_eq!(history.last().unwrap().item.local_id, format!("L{}", DISCARD_HISTORY_CAP + 4));
    }

    #[test]
    fn strict_parse_rejects_malformed_queue() {
        let raw = serde_json::json!({"v": 1, "queue": "not-an-array"});
        let parsed: Result<MessageQueueV1, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }
}
