//! Lifecycle event bus.
//!
//! Every item transition the engine commits is announced once on a
//! `tokio::sync::broadcast` channel. A bounded history is kept next to the
//! channel so late readers (a CLI summary, a test) can still replay what
//! happened to an item.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::ids::{DeltaFileId, EventId};

/// Events kept in the history when no explicit size is given.
pub const DEFAULT_HISTORY: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// What happened, and to which item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DeltaFileIngested {
        did: DeltaFileId,
        data_source: String,
    },
    ActionQueued {
        did: DeltaFileId,
        flow: String,
        action: String,
        queue: String,
        cold: bool,
    },
    StageChanged {
        did: DeltaFileId,
        stage: String,
    },
    /// `did` is the aggregate the members were joined into.
    JoinReleased {
        did: DeltaFileId,
        flow: String,
        action: String,
        members: usize,
    },
    EventRejected {
        did: DeltaFileId,
        action: String,
        reason: String,
    },
}

impl EventPayload {
    pub fn did(&self) -> DeltaFileId {
        match self {
            EventPayload::DeltaFileIngested { did, .. }
            | EventPayload::ActionQueued { did, .. }
            | EventPayload::StageChanged { did, .. }
            | EventPayload::JoinReleased { did, .. }
            | EventPayload::EventRejected { did, .. } => *did,
        }
    }
}

/// An announced payload with its id and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: RwLock<VecDeque<Event>>,
    history_len: usize,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events; the history keeps the last [`DEFAULT_HISTORY`].
    pub fn new(capacity: usize) -> Self {
        Self::with_history(capacity, DEFAULT_HISTORY)
    }

    pub fn with_history(capacity: usize, history_len: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(history_len)),
            history_len,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Record `payload` in the history and send it to current subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        };
        if self.history_len > 0 {
            let mut history = self.history.write();
            while history.len() >= self.history_len {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // Nobody listening is normal in batch runs.
        let _ = self.tx.send(event);
    }

    /// Up to `n` most recent events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.history.read().iter().rev().take(n).cloned().collect()
    }

    /// Retained events about `did`, oldest first.
    pub fn history_for(&self, did: DeltaFileId) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .filter(|e| e.payload.did() == did)
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("history", &self.history.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingested(did: DeltaFileId) -> EventPayload {
        EventPayload::DeltaFileIngested {
            did,
            data_source: "rest".into(),
        }
    }

    #[test]
    fn subscriber_receives_stage_change() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let did = DeltaFileId::new();
        bus.broadcast(EventPayload::StageChanged {
            did,
            stage: "COMPLETE".into(),
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload.did(), did);
        assert!(matches!(event.payload, EventPayload::StageChanged { ref stage, .. } if stage == "COMPLETE"));
    }

    #[test]
    fn history_drops_oldest() {
        let bus = EventBus::with_history(16, 3);
        let dids: Vec<_> = (0..5).map(|_| DeltaFileId::new()).collect();
        for did in &dids {
            bus.broadcast(ingested(*did));
        }

        let recent = bus.recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload.did(), dids[4]);
        assert!(bus.history_for(dids[0]).is_empty());
    }

    #[test]
    fn history_for_one_item_in_order() {
        let bus = EventBus::default();
        let did = DeltaFileId::new();
        bus.broadcast(ingested(did));
        bus.broadcast(ingested(DeltaFileId::new()));
        bus.broadcast(EventPayload::EventRejected {
            did,
            action: "compress".into(),
            reason: "stale".into(),
        });

        let history = bus.history_for(did);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0].payload, EventPayload::DeltaFileIngested { .. }));
        assert!(matches!(history[1].payload, EventPayload::EventRejected { .. }));
    }

    #[test]
    fn zero_history_still_broadcasts() {
        let bus = EventBus::with_history(4, 0);
        let mut rx = bus.subscribe();
        bus.broadcast(EventPayload::JoinReleased {
            did: DeltaFileId::new(),
            flow: "batch".into(),
            action: "merge".into(),
            members: 3,
        });
        assert!(bus.recent_events(10).is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::ActionQueued {
            did: DeltaFileId::new(),
            flow: "smoke".into(),
            action: "compress".into(),
            queue: "org.example.Compress".into(),
            cold: false,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "action_queued");
        assert_eq!(json["cold"], false);
    }
}
