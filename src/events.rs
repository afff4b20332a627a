//! Timed-event definitions and the queue contract.
//!
//! Events form a closed, typed set; dispatch is a `match`, never a lookup
//! by task name. The queue product itself is an external collaborator behind
//! [`EventQueue`]: at-least-once, fire-and-forget delivery to whoever drains
//! the handler side. De-duplication never happens at the queue layer; the
//! state guards and the notification ledger absorb redelivery.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::store::types::UserId;

/// A time-triggered or deferred unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Fired near due time; defensively re-enqueues the day's cascade.
    CheckinDue { user_id: UserId, date: NaiveDate },
    /// Reminder #`n` (1-based), fired at due + n·offset.
    Reminder {
        user_id: UserId,
        date: NaiveDate,
        n: u32,
    },
    /// Fired at the deadline; transitions PENDING → MISSED and escalates.
    DeadlineMissed { user_id: UserId, date: NaiveDate },
    /// One-shot recheck after an unreachability episode began.
    UnreachableRecheck { user_id: UserId },
    /// Offer the late-notify choice to a user who checked in after an
    /// escalation already fired.
    LatePrompt { user_id: UserId, date: NaiveDate },
    /// Ask a newly introduced contact for consent.
    ConsentRequest { user_id: UserId, contact_id: i64 },
    /// Tell approved contacts the user is back online.
    OnlineNotice { user_id: UserId, date: NaiveDate },
    /// Archive a check-in photo to the object store.
    ArchivePhoto { checkin_id: i64 },
}

/// Scheduling/dispatch contract consumed from the queue product.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueue `event` to fire at `when` (UTC). At-least-once delivery.
    async fn enqueue_at(&self, event: Event, when: DateTime<Utc>) -> Result<()>;

    /// Enqueue `event` to fire as soon as possible.
    async fn enqueue_now(&self, event: Event) -> Result<()> {
        self.enqueue_at(event, Utc::now()).await
    }
}

/// In-process queue backed by tokio timers.
///
/// Each enqueue spawns a task that sleeps until the target instant and then
/// pushes the event onto an unbounded channel; the worker loop drains the
/// receiver half. Suitable for a single-process deployment and for tests;
/// a durable queue product plugs in through the same trait.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Event>,
}

impl InProcessQueue {
    /// Create the queue and the receiver the worker loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventQueue for InProcessQueue {
    async fn enqueue_at(&self, event: Event, when: DateTime<Utc>) -> Result<()> {
        let tx = self.tx.clone();
        let delay = (when - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(event).is_err() {
                warn!("event receiver dropped; timed event discarded");
            }
        });
        Ok(())
    }
}
