//! At-least-once work item queue.
//!
//! A received message becomes invisible for its visibility timeout; it is
//! redelivered unless deleted with the pop receipt of the delivery that
//! handled it.
//!
//! Reminders are named messages: at most one pending message exists per
//! reminder key, and setting a reminder again replaces it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};
use crate::work_item::WorkItem;

/// One delivery of a queued message. The body is kept raw so that poison
/// messages can be dead-lettered instead of blocking the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Uuid,
    pub pop_receipt: String,
    /// Number of deliveries so far, including this one.
    pub dequeue_count: u32,
    pub body: String,
}

#[async_trait]
pub trait WorkItemQueue: Send + Sync {
    /// Enqueue `item`, invisible until `visibility_delay` has elapsed.
    async fn produce(&self, item: &WorkItem, visibility_delay: Duration) -> FlowResult<()>;

    /// Arm the reminder `key` with `item`. A pending message under the same
    /// key is replaced, and the replacement fires no later than it would have.
    /// A message under the key that is currently being handled is dropped.
    async fn set_reminder(&self, key: &str, item: &WorkItem, delay: Duration) -> FlowResult<()>;

    /// Remove the message of reminder `key`, if any.
    async fn unset_reminder(&self, key: &str) -> FlowResult<()>;

    async fn receive(&self, visibility_timeout: Duration) -> FlowResult<Option<QueueMessage>>;

    /// Keep a message that is being handled invisible for another
    /// `visibility_timeout`. A message that is already gone (deleted, or
    /// replaced as a reminder) is left alone.
    async fn renew_visibility(
        &self,
        id: Uuid,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> FlowResult<()>;

    /// Delete a message. A stale pop receipt (the message was redelivered
    /// since) is rejected.
    async fn delete(&self, id: Uuid, pop_receipt: &str) -> FlowResult<()>;
}

#[derive(Debug)]
struct Entry {
    id: Uuid,
    body: String,
    visible_at: Instant,
    dequeue_count: u32,
    pop_receipt: Option<String>,
    reminder_key: Option<String>,
}

/// In-process queue with visibility timeouts on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryWorkItemQueue {
    entries: Mutex<Vec<Entry>>,
}

impl MemoryWorkItemQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Messages currently queued, visible or not.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a raw body, bypassing serialization.
    pub fn produce_raw(&self, body: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.entries().push(Entry {
            id,
            body: body.into(),
            visible_at: Instant::now(),
            dequeue_count: 0,
            pop_receipt: None,
            reminder_key: None,
        });
        id
    }

    /// Every queued work item that parses, in queue order.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.entries()
            .iter()
            .filter_map(|e| WorkItem::from_json(&e.body).ok())
            .collect()
    }
}

#[async_trait]
impl WorkItemQueue for MemoryWorkItemQueue {
    async fn produce(&self, item: &WorkItem, visibility_delay: Duration) -> FlowResult<()> {
        let body = item.to_json()?;
        self.entries().push(Entry {
            id: Uuid::new_v4(),
            body,
            visible_at: Instant::now() + visibility_delay,
            dequeue_count: 0,
            pop_receipt: None,
            reminder_key: None,
        });
        Ok(())
    }

    async fn set_reminder(&self, key: &str, item: &WorkItem, delay: Duration) -> FlowResult<()> {
        let body = item.to_json()?;
        let mut visible_at = Instant::now() + delay;
        let mut entries = self.entries();
        entries.retain(|e| {
            if e.reminder_key.as_deref() != Some(key) {
                return true;
            }
            if e.pop_receipt.is_none() {
                visible_at = visible_at.min(e.visible_at);
            }
            false
        });
        entries.push(Entry {
            id: Uuid::new_v4(),
            body,
            visible_at,
            dequeue_count: 0,
            pop_receipt: None,
            reminder_key: Some(key.to_string()),
        });
        Ok(())
    }

    async fn unset_reminder(&self, key: &str) -> FlowResult<()> {
        self.entries()
            .retain(|e| e.reminder_key.as_deref() != Some(key));
        Ok(())
    }

    async fn receive(&self, visibility_timeout: Duration) -> FlowResult<Option<QueueMessage>> {
        let now = Instant::now();
        let mut entries = self.entries();
        let Some(entry) = entries.iter_mut().find(|e| e.visible_at <= now) else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        entry.visible_at = now + visibility_timeout;
        entry.dequeue_count += 1;
        entry.pop_receipt = Some(receipt.clone());
        Ok(Some(QueueMessage {
            id: entry.id,
            pop_receipt: receipt,
            dequeue_count: entry.dequeue_count,
            body: entry.body.clone(),
        }))
    }

    async fn renew_visibility(
        &self,
        id: Uuid,
        pop_receipt: &str,
        visibility_timeout: Duration,
    ) -> FlowResult<()> {
        let mut entries = self.entries();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(());
        };
        if entry.pop_receipt.as_deref() != Some(pop_receipt) {
            return Err(FlowError::decisive(format!(
                "stale pop receipt for message {id}"
            )));
        }
        entry.visible_at = Instant::now() + visibility_timeout;
        Ok(())
    }

    async fn delete(&self, id: Uuid, pop_receipt: &str) -> FlowResult<()> {
        let mut entries = self.entries();
        let Some(pos) = entries.iter().position(|e| e.id == id) else {
            return Ok(());
        };
        if entries[pos].pop_receipt.as_deref() != Some(pop_receipt) {
            return Err(FlowError::decisive(format!(
                "stale pop receipt for message {id}"
            )));
        }
        entries.remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_message_is_redelivered_after_visibility_timeout() {
        let queue = MemoryWorkItemQueue::new();
        queue
            .produce(&WorkItem::build_coherency_info(1), Duration::ZERO)
            .await
            .unwrap();

        let first = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(first.dequeue_count, 1);
        assert!(queue.receive(Duration::from_secs(30)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.dequeue_count, 2);

        assert!(queue.delete(first.id, &first.pop_receipt).await.is_err());
        queue.delete(second.id, &second.pop_receipt).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_message_stays_invisible() {
        let queue = MemoryWorkItemQueue::new();
        queue
            .produce(&WorkItem::build_coherency_info(1), Duration::ZERO)
            .await
            .unwrap();
        let msg = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue
            .renew_visibility(msg.id, &msg.pop_receipt, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(queue.receive(Duration::from_secs(30)).await.unwrap().is_none());

        assert!(queue
            .renew_visibility(msg.id, "other", Duration::from_secs(30))
            .await
            .is_err());
        queue.delete(msg.id, &msg.pop_receipt).await.unwrap();
        queue
            .renew_visibility(msg.id, &msg.pop_receipt, Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_is_invisible_until_due() {
        let queue = MemoryWorkItemQueue::new();
        queue
            .produce(&WorkItem::build_coherency_info(2), Duration::from_secs(300))
            .await
            .unwrap();
        assert!(queue.receive(Duration::from_secs(30)).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(300)).await;
        let msg = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();
        let item = WorkItem::from_json(&msg.body).unwrap();
        assert_eq!(item.type_name(), "BuildCoherencyInfo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_is_replaced_and_keeps_earliest_due_time() {
        let queue = MemoryWorkItemQueue::new();
        queue
            .set_reminder("a", &WorkItem::build_coherency_info(1), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        queue
            .set_reminder("a", &WorkItem::build_coherency_info(2), Duration::from_secs(60))
            .await
            .unwrap();
        queue
            .set_reminder("b", &WorkItem::build_coherency_info(3), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        let msg = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();
        let item = WorkItem::from_json(&msg.body).unwrap();
        match item.kind {
            crate::work_item::WorkItemKind::BuildCoherencyInfo(w) => assert_eq!(w.build_id, 2),
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_set_while_handled_replaces_delivery() {
        let queue = MemoryWorkItemQueue::new();
        queue
            .set_reminder("a", &WorkItem::build_coherency_info(1), Duration::ZERO)
            .await
            .unwrap();
        let msg = queue.receive(Duration::from_secs(30)).await.unwrap().unwrap();

        // The handler re-arms its own reminder for later.
        queue
            .set_reminder("a", &WorkItem::build_coherency_info(1), Duration::from_secs(300))
            .await
            .unwrap();
        queue.delete(msg.id, &msg.pop_receipt).await.unwrap();
        assert_eq!(queue.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(queue.receive(Duration::from_secs(30)).await.unwrap().is_none());

        queue.unset_reminder("a").await.unwrap();
        assert!(queue.is_empty());
    }
}
