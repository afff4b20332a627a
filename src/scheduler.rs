//! Rolling-window obligation scheduler.
//!
//! Keeps a configurable window of future daily obligation rows materialized
//! and the corresponding timed events enqueued. The sweep is idempotent
//! under re-entry: row creation is an insert-or-ignore on the (user, date)
//! key, and redelivered events are absorbed by the handlers' state guards
//! and the notification ledger; the queue layer cannot de-duplicate by
//! business key, so no attempt is made there.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::config::{CheckinConfig, SchedulerConfig};
use crate::error::Result;
use crate::events::{Event, EventQueue};
use crate::store::Store;
use crate::store::types::{User, UserStatus};

/// Periodic sweep that materializes obligations and enqueues their events.
pub struct Scheduler {
    store: Arc<Store>,
    queue: Arc<dyn EventQueue>,
    cfg: SchedulerConfig,
    checkin: CheckinConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn EventQueue>,
        cfg: SchedulerConfig,
        checkin: CheckinConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cfg,
            checkin,
        }
    }

    /// Run sweeps forever on the configured tick.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(self.cfg.tick_secs));
        loop {
            tick.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(upserted) => debug!(upserted, "scheduler sweep complete"),
                Err(e) => error!("scheduler sweep failed: {e}"),
            }
        }
    }

    /// One sweep over all users at the given instant.
    ///
    /// Returns the number of (user, date) rows touched. Safe to re-run and
    /// safe to run concurrently for disjoint users.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let users = self.store.with_tx(|tx| {
            let mut eligible = Vec::new();
            for user in tx.list_users()? {
                match user.status {
                    UserStatus::Active => eligible.push(user),
                    UserStatus::Paused => {
                        // Auto-reactivate once the pause has elapsed.
                        if user.pause_until.is_some_and(|until| until <= now) {
                            tx.set_user_status(user.id, UserStatus::Active, now)?;
                            info!(user_id = user.id, "pause elapsed, user reactivated");
                            eligible.push(User {
                                status: UserStatus::Active,
                                pause_until: None,
                                ..user
                            });
                        }
                    }
                    UserStatus::Disabled => {}
                }
            }
            Ok(eligible)
        })?;

        let mut touched = 0;
        for user in users {
            match self.materialize_window(&user, now).await {
                Ok(n) => touched += n,
                // One user's bad row must not starve the rest of the sweep.
                Err(e) => warn!(user_id = user.id, "skipping user in sweep: {e}"),
            }
        }

        // Retention: resolved rows past the window become purgeable.
        let cutoff = clock::local_date_for(
            chrono_tz::Tz::UTC,
            now - Duration::days(self.checkin.retention_days),
        );
        let purged = self.store.with_tx(|tx| tx.purge_resolved_before(cutoff))?;
        if purged > 0 {
            debug!(purged, "purged resolved daily rows past retention");
        }

        Ok(touched)
    }

    /// Materialize every local date from today through the window end for
    /// one user, enqueueing the reminder and deadline events per date.
    async fn materialize_window(&self, user: &User, now: DateTime<Utc>) -> Result<usize> {
        let tz = clock::parse_timezone(&user.timezone)?;
        let window_end = now + Duration::hours(self.cfg.window_hours);

        let mut date = clock::local_date_for(tz, now);
        let end_date = clock::local_date_for(tz, window_end);
        let mut touched = 0;

        while date <= end_date {
            let due_at = clock::combine_local_to_utc(tz, date, user.checkin_time_local);
            let deadline_at = clock::add_minutes(due_at, self.checkin.grace_minutes);

            self.store
                .with_tx(|tx| tx.upsert_daily_state(user.id, date, due_at, deadline_at))?;

            for (i, offset) in self.checkin.reminder_offsets_min.iter().enumerate() {
                self.queue
                    .enqueue_at(
                        Event::Reminder {
                            user_id: user.id,
                            date,
                            n: (i + 1) as u32,
                        },
                        clock::add_minutes(due_at, *offset),
                    )
                    .await?;
            }
            self.queue
                .enqueue_at(
                    Event::DeadlineMissed {
                        user_id: user.id,
                        date,
                    },
                    deadline_at,
                )
                .await?;

            touched += 1;
            let Some(next) = date.succ_opt() else { break };
            date = next;
        }

        Ok(touched)
    }
}
