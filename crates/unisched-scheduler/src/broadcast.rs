use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use unisched_core::ScheduleId;

use crate::types::StatusEvent;

/// Which events a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Events of one schedule.
    Schedule(ScheduleId),
    /// Every event (`"*"`).
    All,
}

impl Topic {
    /// `"*"` is the global wildcard; anything else is a schedule id.
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Topic::All
        } else {
            Topic::Schedule(ScheduleId::from(s))
        }
    }

    fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            Topic::All => true,
            Topic::Schedule(id) => *id == event.schedule_id,
        }
    }
}

struct Subscriber {
    topic: Topic,
    tx: mpsc::Sender<StatusEvent>,
}

/// Fan-out of execution state changes, one bounded channel per subscriber.
///
/// Delivery is best-effort: late subscribers see nothing retroactively, and a
/// subscriber whose buffer is full is disconnected rather than allowed to
/// stall the publisher.
pub struct StatusBroadcaster {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    buffer: usize,
}

impl StatusBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, ?topic, "status subscriber added");
        self.subscribers.insert(id, Subscriber { topic, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "status subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Push `event` to every matching subscriber without blocking.
    pub fn publish(&self, event: StatusEvent) {
        let mut dropped: Vec<(u64, &'static str)> = Vec::new();

        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !sub.topic.matches(&event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped.push((*entry.key(), "buffer full")),
                Err(TrySendError::Closed(_)) => dropped.push((*entry.key(), "receiver closed")),
            }
        }

        // Removal happens after iteration: DashMap shards are still read-locked inside the loop.
        for (id, reason) in dropped {
            if self.subscribers.remove(&id).is_some() {
                if reason == "buffer full" {
                    warn!(subscriber = id, "slow status subscriber disconnected");
                } else {
                    debug!(subscriber = id, reason, "status subscriber gone");
                }
            }
        }
    }
}

/// Receiving end of a status subscription.
///
/// `recv` returns `None` once the subscriber was disconnected (after any
/// events already buffered have been drained).
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StatusEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    /// Adapt into a `Stream` for SSE/WebSocket framing by the caller.
    pub fn into_stream(self) -> ReceiverStream<StatusEvent> {
        ReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, StatusEventKind};
    use chrono::Utc;
    use unisched_core::ExecutionId;

    fn event(schedule: &str, status: ExecutionStatus) -> StatusEvent {
        StatusEvent {
            kind: StatusEventKind::Transition,
            schedule_id: ScheduleId::from(schedule),
            execution_id: ExecutionId::from("exec"),
            status,
            timestamp: Utc::now(),
            progress: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn events_reach_matching_subscribers_only() {
        let b = StatusBroadcaster::new(8);
        let mut a_sub = b.subscribe(Topic::parse("a"));
        let mut all_sub = b.subscribe(Topic::parse("*"));

        b.publish(event("a", ExecutionStatus::Running));
        b.publish(event("b", ExecutionStatus::Running));

        assert_eq!(a_sub.recv().await.unwrap().schedule_id.as_str(), "a");
        assert!(a_sub.try_recv().is_none());

        assert_eq!(all_sub.recv().await.unwrap().schedule_id.as_str(), "a");
        assert_eq!(all_sub.recv().await.unwrap().schedule_id.as_str(), "b");
    }

    #[tokio::test]
    async fn late_subscribers_get_no_history() {
        let b = StatusBroadcaster::new(8);
        b.publish(event("a", ExecutionStatus::Succeeded));
        let mut sub = b.subscribe(Topic::All);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_subscriber_is_disconnected_without_blocking() {
        let b = StatusBroadcaster::new(2);
        let mut slow = b.subscribe(Topic::All);
        let mut fast = b.subscribe(Topic::All);

        b.publish(event("a", ExecutionStatus::Pending));
        b.publish(event("a", ExecutionStatus::Running));
        // drain the fast one so only the slow one overflows
        fast.recv().await.unwrap();
        fast.recv().await.unwrap();
        b.publish(event("a", ExecutionStatus::Succeeded));

        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(fast.recv().await.unwrap().status, ExecutionStatus::Succeeded);

        // The slow subscriber keeps what was buffered, then sees the disconnect.
        assert_eq!(slow.recv().await.unwrap().status, ExecutionStatus::Pending);
        assert_eq!(slow.recv().await.unwrap().status, ExecutionStatus::Running);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscription_can_be_consumed_as_a_stream() {
        use tokio_stream::StreamExt;

        let b = StatusBroadcaster::new(8);
        let sub = b.subscribe(Topic::Schedule(ScheduleId::from("a")));
        b.publish(event("a", ExecutionStatus::Pending));
        b.publish(event("b", ExecutionStatus::Pending));
        b.publish(event("a", ExecutionStatus::Running));
        b.unsubscribe(sub.id());

        let statuses: Vec<_> = sub.into_stream().map(|e| e.status).collect().await;
        assert_eq!(statuses, vec![ExecutionStatus::Pending, ExecutionStatus::Running]);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let b = StatusBroadcaster::new(4);
        let sub = b.subscribe(Topic::All);
        drop(sub);
        b.publish(event("a", ExecutionStatus::Running));
        assert_eq!(b.subscriber_count(), 0);
    }
}
