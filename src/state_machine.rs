//! Daily obligation state machine and event handlers.
//!
//! [`CheckinService`] owns every state transition: ingress operations
//! (registration, check-in submission, consent responses) and the handlers
//! behind each timed [`Event`]. All transitions run inside one unit of work
//! and are guarded so redelivered or duplicate events collapse to no-ops.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::config::{CheckinConfig, VigilConfig};
use crate::delivery::rate_limiter::RateLimiter;
use crate::delivery::{ChatClient, Choice, Sender};
use crate::error::{DeliveryError, Result, VigilError};
use crate::events::{Event, EventQueue};
use crate::media::{Archiver, ObjectStore};
use crate::notify::{EscalationReason, Notifier};
use crate::store::types::{
    CheckinRecord, ContactStatus, DailyState, DayState, GeoPoint, NotificationKind,
    TrustedContact, User, UserId, UserStatus,
};
use crate::store::{Store, ledger};

/// Minutes after a check-in during which a location message attaches to it.
const GEO_ATTACH_WINDOW_MIN: i64 = 5;

const REMINDER_TEXT: &str = "Reminder: your daily check-in is due. Please send today's photo.";
const LATE_PROMPT_TEXT: &str =
    "Your check-in arrived after your trusted contacts were notified. \
     Should we let them know you are okay?";

/// The check-in core: ingress operations plus the timed-event handlers.
pub struct CheckinService {
    store: Arc<Store>,
    queue: Arc<dyn EventQueue>,
    chat: Arc<dyn ChatClient>,
    sender: Sender,
    notifier: Notifier,
    archiver: Archiver,
    checkin: CheckinConfig,
}

impl CheckinService {
    /// Wire the service from its collaborators. The object store is only
    /// consulted when archival is enabled in the configuration.
    pub fn new(
        store: Arc<Store>,
        chat: Arc<dyn ChatClient>,
        queue: Arc<dyn EventQueue>,
        object_store: Option<Arc<dyn ObjectStore>>,
        cfg: &VigilConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(cfg.delivery.rate_limit_per_sec));
        let sender = Sender::new(Arc::clone(&chat), limiter);
        let notifier = Notifier::new(Arc::clone(&store), sender.clone());
        let archiver = match object_store {
            Some(os) if cfg.media.archive_photos => Archiver::new(os),
            _ => Archiver::disabled(),
        };
        Self {
            store,
            queue,
            chat,
            sender,
            notifier,
            archiver,
            checkin: cfg.checkin.clone(),
        }
    }

    /// Drain the event channel until it closes, logging handler failures.
    ///
    /// A failed handler never stops the loop: the event's own guards decide
    /// whether a redelivery may retry it.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event.clone()).await {
                error!(?event, "event handler failed: {e}");
            }
        }
        info!("event channel closed, worker stopping");
    }

    /// Dispatch one timed event to its handler.
    pub async fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            Event::CheckinDue { user_id, date } => self.checkin_due(user_id, date).await,
            Event::Reminder { user_id, date, n } => self.reminder(user_id, date, n).await,
            Event::DeadlineMissed { user_id, date } => self.deadline_missed(user_id, date).await,
            Event::UnreachableRecheck { user_id } => self.unreachable_recheck(user_id).await,
            Event::LatePrompt { user_id, date } => self.late_prompt(user_id, date).await,
            Event::ConsentRequest { user_id, contact_id } => {
                self.notifier.send_consent_request(user_id, contact_id).await
            }
            Event::OnlineNotice { user_id, date } => self.online_notice(user_id, date).await,
            Event::ArchivePhoto { checkin_id } => {
                self.archiver
                    .archive(self.chat.as_ref(), &self.store, checkin_id)
                    .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ingress operations
// ---------------------------------------------------------------------------

impl CheckinService {
    /// Register a user, or update settings for an existing platform identity.
    ///
    /// The timezone is validated here; nothing downstream ever sees an
    /// unparseable zone name. Today's obligation is kicked off immediately so
    /// a mid-day registration does not wait for the next sweep.
    pub async fn register_user(
        &self,
        platform_user_id: i64,
        chat_id: i64,
        timezone: &str,
        checkin_time_local: NaiveTime,
    ) -> Result<User> {
        let tz = clock::parse_timezone(timezone)?;
        let now = Utc::now();
        let user = self.store.with_tx(|tx| {
            tx.upsert_user(platform_user_id, chat_id, timezone, checkin_time_local, now)
        })?;
        self.queue
            .enqueue_now(Event::CheckinDue {
                user_id: user.id,
                date: clock::local_date_for(tz, now),
            })
            .await?;
        info!(user_id = user.id, timezone, "user registered");
        Ok(user)
    }

    /// Record a submitted check-in photo for the user's current local day.
    ///
    /// Marks the day DONE when it is still open. A late arrival after the
    /// escalation already fired, while still inside the post-deadline grace
    /// window, additionally triggers the late-notify prompt.
    pub async fn record_checkin(&self, user_id: UserId, photo_ref: &str) -> Result<CheckinRecord> {
        let now = Utc::now();
        let (record, offer_prompt) = self.store.with_tx(|tx| {
            let user = tx.user(user_id)?.ok_or(VigilError::UnknownUser(user_id))?;
            let tz = clock::parse_timezone(&user.timezone)?;
            let date = clock::local_date_for(tz, now);
            let due_at = clock::combine_local_to_utc(tz, date, user.checkin_time_local);
            let state = tx.upsert_daily_state(
                user_id,
                date,
                due_at,
                clock::add_minutes(due_at, self.checkin.grace_minutes),
            )?;

            let is_late = now > state.deadline_at;
            let record = tx.append_checkin(user_id, date, photo_ref, is_late, now)?;
            if state.state == DayState::Pending {
                tx.mark_done(user_id, date)?;
            }

            let offer_prompt = is_late
                && state.state == DayState::Missed
                && state.escalation_sent_at.is_some()
                && now <= clock::add_hours(state.deadline_at, self.checkin.late_grace_hours);
            Ok((record, offer_prompt))
        })?;

        if offer_prompt {
            self.queue
                .enqueue_now(Event::LatePrompt {
                    user_id,
                    date: record.date_local,
                })
                .await?;
        }
        if self.archiver.is_enabled() {
            self.queue
                .enqueue_now(Event::ArchivePhoto {
                    checkin_id: record.id,
                })
                .await?;
        }
        debug!(user_id, checkin_id = record.id, late = record.is_late, "check-in recorded");
        Ok(record)
    }

    /// Attach coordinates to the user's most recent check-in, if one was
    /// submitted within the attach window. Returns whether anything matched.
    pub fn attach_geo(&self, user_id: UserId, geo: GeoPoint) -> Result<bool> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let Some(recent) = tx.latest_checkin_within(user_id, GEO_ATTACH_WINDOW_MIN, now)?
            else {
                return Ok(false);
            };
            tx.attach_geo(recent.id, geo)?;
            Ok(true)
        })
    }

    /// Pause the user's obligations until the given instant.
    pub fn set_pause_until(&self, user_id: UserId, until: DateTime<Utc>) -> Result<()> {
        self.store.with_tx(|tx| tx.set_pause(user_id, until, Utc::now()))
    }

    /// Set the user's lifecycle status directly.
    pub fn set_status(&self, user_id: UserId, status: UserStatus) -> Result<()> {
        self.store.with_tx(|tx| tx.set_user_status(user_id, status, Utc::now()))
    }

    /// Add (or re-introduce) a trusted contact and start the consent
    /// workflow. Enforces the per-user contact cap.
    pub async fn add_trusted_contact(
        &self,
        user_id: UserId,
        contact_platform_id: i64,
        contact_chat_id: i64,
    ) -> Result<TrustedContact> {
        let now = Utc::now();
        let contact = self.store.with_tx(|tx| {
            if tx.user(user_id)?.is_none() {
                return Err(VigilError::UnknownUser(user_id));
            }
            if tx.count_contacts(user_id)? >= self.checkin.contact_cap {
                return Err(VigilError::ContactCapReached(self.checkin.contact_cap));
            }
            tx.upsert_contact(user_id, contact_platform_id, contact_chat_id, now)
        })?;

        if contact.status == ContactStatus::Pending {
            self.queue
                .enqueue_now(Event::ConsentRequest {
                    user_id,
                    contact_id: contact.id,
                })
                .await?;
        }
        Ok(contact)
    }

    /// Record the contact's answer to the consent request.
    pub fn respond_to_consent(&self, contact_id: i64, approved: bool) -> Result<()> {
        let status = if approved {
            ContactStatus::Approved
        } else {
            ContactStatus::Declined
        };
        self.store
            .with_tx(|tx| tx.set_contact_status(contact_id, status, Utc::now()))
    }

    /// Withdraw a previously given consent.
    pub fn revoke_contact(&self, contact_id: i64) -> Result<()> {
        self.store
            .with_tx(|tx| tx.set_contact_status(contact_id, ContactStatus::Revoked, Utc::now()))
    }

    /// Record the user's answer to the late-notify prompt; a positive answer
    /// queues the "back online" notice to approved contacts.
    pub async fn set_late_response(
        &self,
        user_id: UserId,
        date: NaiveDate,
        notify: bool,
    ) -> Result<()> {
        self.store
            .with_tx(|tx| tx.set_late_response(user_id, date, notify, Utc::now()))?;
        if notify {
            self.queue
                .enqueue_now(Event::OnlineNotice { user_id, date })
                .await?;
        }
        Ok(())
    }

    /// The obligation row for the user's current local day, if materialized.
    pub fn obligation_status(&self, user_id: UserId) -> Result<Option<DailyState>> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let user = tx.user(user_id)?.ok_or(VigilError::UnknownUser(user_id))?;
            let tz = clock::parse_timezone(&user.timezone)?;
            tx.daily_state(user_id, clock::local_date_for(tz, now))
        })
    }
}

// ---------------------------------------------------------------------------
// Timed-event handlers
// ---------------------------------------------------------------------------

impl CheckinService {
    /// Materialize the day's obligation row for an active user and enqueue
    /// the reminder and deadline cascade.
    async fn checkin_due(&self, user_id: UserId, date: NaiveDate) -> Result<()> {
        let now = Utc::now();
        let state = self.store.with_tx(|tx| {
            let Some(mut user) = tx.user(user_id)? else {
                return Ok(None);
            };
            // An elapsed pause reactivates here too, not only in the sweep.
            if user.status == UserStatus::Paused
                && user.pause_until.is_some_and(|until| until <= now)
            {
                tx.set_user_status(user.id, UserStatus::Active, now)?;
                user.status = UserStatus::Active;
                user.pause_until = None;
            }
            if user.status != UserStatus::Active {
                return Ok(None);
            }
            let tz = clock::parse_timezone(&user.timezone)?;
            let due_at = clock::combine_local_to_utc(tz, date, user.checkin_time_local);
            let state = tx.upsert_daily_state(
                user_id,
                date,
                due_at,
                clock::add_minutes(due_at, self.checkin.grace_minutes),
            )?;
            Ok(Some(state))
        })?;
        let Some(state) = state else { return Ok(()) };
        if state.state != DayState::Pending {
            return Ok(());
        }

        for (i, offset) in self.checkin.reminder_offsets_min.iter().enumerate() {
            self.queue
                .enqueue_at(
                    Event::Reminder {
                        user_id,
                        date,
                        n: (i + 1) as u32,
                    },
                    clock::add_minutes(state.due_at, *offset),
                )
                .await?;
        }
        self.queue
            .enqueue_at(Event::DeadlineMissed { user_id, date }, state.deadline_at)
            .await?;
        Ok(())
    }

    /// Send reminder #`n` if the day is still open and not already covered.
    async fn reminder(&self, user_id: UserId, date: NaiveDate, n: u32) -> Result<()> {
        let now = Utc::now();
        let claim = self.store.with_tx(|tx| {
            let Some(user) = tx.user(user_id)? else {
                return Ok(None);
            };
            if user.status != UserStatus::Active {
                return Ok(None);
            }
            let Some(state) = tx.daily_state(user_id, date)? else {
                return Ok(None);
            };
            if state.state != DayState::Pending || state.reminders_sent >= n {
                return Ok(None);
            }
            let key = ledger::reminder_key(user_id, date, n);
            if !tx.try_insert_attempt(&key, NotificationKind::Reminder, user_id, user.chat_id, now)?
            {
                return Ok(None);
            }
            Ok(Some((user, key)))
        })?;
        let Some((user, key)) = claim else { return Ok(()) };

        match self.sender.send_text(user.chat_id, REMINDER_TEXT, &[]).await {
            Ok(()) => self.store.with_tx(|tx| {
                tx.mark_attempt_sent(&key, Utc::now())?;
                tx.increment_reminders_below(user_id, date, n)?;
                Ok(())
            }),
            Err(err) => self.record_send_failure(&key, user_id, err).await,
        }
    }

    /// Deadline passed: transition PENDING → MISSED and escalate.
    ///
    /// The transition and the deadline guard-key claim commit together; the
    /// contact fan-out runs after the commit so a fan-out failure can never
    /// roll the MISSED state back.
    async fn deadline_missed(&self, user_id: UserId, date: NaiveDate) -> Result<()> {
        let now = Utc::now();
        let missed = self.store.with_tx(|tx| {
            let Some(user) = tx.user(user_id)? else {
                return Ok(None);
            };
            let Some(state) = tx.daily_state(user_id, date)? else {
                return Ok(None);
            };
            if state.state != DayState::Pending {
                return Ok(None);
            }
            // Guard row only; the deadline event has no message of its own.
            let key = ledger::deadline_key(user_id, date);
            if !tx.try_insert_attempt(&key, NotificationKind::Deadline, user_id, user.chat_id, now)?
            {
                return Ok(None);
            }
            tx.mark_missed(user_id, date, now)?;
            Ok(Some(user))
        })?;

        if let Some(user) = missed {
            info!(user_id, %date, "deadline missed, escalating");
            self.notifier
                .notify_trusted_contacts(&user, EscalationReason::MissedCheckin)
                .await?;
        }
        Ok(())
    }

    /// One-shot recheck after an unreachability episode began: if the user
    /// is still marked unreachable and the episode has lasted the configured
    /// delay, escalate to contacts.
    async fn unreachable_recheck(&self, user_id: UserId) -> Result<()> {
        let now = Utc::now();
        let Some(user) = self.store.with_tx(|tx| tx.user(user_id))? else {
            return Ok(());
        };
        let Some(since) = user.unreachable_since else {
            return Ok(());
        };
        // An early or redelivered event must not escalate before the
        // episode has actually lasted the recheck delay.
        if clock::add_hours(since, self.checkin.unreachable_recheck_hours) > now {
            return Ok(());
        }
        self.notifier
            .notify_trusted_contacts(&user, EscalationReason::Unreachable)
            .await
    }

    /// Offer the late-notify choice to a user whose check-in arrived after
    /// the escalation.
    async fn late_prompt(&self, user_id: UserId, date: NaiveDate) -> Result<()> {
        let now = Utc::now();
        let claim = self.store.with_tx(|tx| {
            let Some(user) = tx.user(user_id)? else {
                return Ok(None);
            };
            let Some(state) = tx.daily_state(user_id, date)? else {
                return Ok(None);
            };
            if state.late_prompt_response_at.is_some() {
                return Ok(None);
            }
            let key = ledger::late_prompt_key(user_id, date);
            if !tx.try_insert_attempt(
                &key,
                NotificationKind::LatePrompt,
                user_id,
                user.chat_id,
                now,
            )? {
                return Ok(None);
            }
            Ok(Some((user, key)))
        })?;
        let Some((user, key)) = claim else { return Ok(()) };

        let choices = [
            Choice::new("Yes", format!("late_notify:yes:{date}")),
            Choice::new("No", format!("late_notify:no:{date}")),
        ];
        match self
            .sender
            .send_text(user.chat_id, LATE_PROMPT_TEXT, &choices)
            .await
        {
            Ok(()) => self.store.with_tx(|tx| {
                tx.mark_attempt_sent(&key, Utc::now())?;
                tx.mark_late_prompt_sent(user_id, date, Utc::now())?;
                Ok(())
            }),
            Err(err) => self.record_send_failure(&key, user_id, err).await,
        }
    }

    /// Fan the "back online" notice out to approved contacts.
    async fn online_notice(&self, user_id: UserId, date: NaiveDate) -> Result<()> {
        let Some(user) = self.store.with_tx(|tx| tx.user(user_id))? else {
            return Ok(());
        };
        self.notifier.notify_online(&user, date).await
    }

    /// Record a user-facing send failure and route it to its recovery path.
    ///
    /// Permanent denial marks the user unreachable and schedules the single
    /// recheck; a rate limit propagates so the caller's retry layer sees it;
    /// anything else is logged and absorbed.
    async fn record_send_failure(
        &self,
        key: &str,
        user_id: UserId,
        err: DeliveryError,
    ) -> Result<()> {
        self.store.with_tx(|tx| {
            tx.mark_attempt_error(key, ledger::code_for(&err), &err.to_string())
        })?;
        match err {
            DeliveryError::PermanentlyDenied(_) => {
                warn!(user_id, key, "recipient permanently unreachable");
                self.mark_unreachable(user_id).await
            }
            DeliveryError::RateLimited { .. } => Err(VigilError::Delivery(err)),
            DeliveryError::Transient(_) => {
                warn!(user_id, key, "delivery failed: {err}");
                Ok(())
            }
        }
    }

    /// Start an unreachability episode, scheduling exactly one recheck.
    async fn mark_unreachable(&self, user_id: UserId) -> Result<()> {
        let now = Utc::now();
        let newly = self
            .store
            .with_tx(|tx| tx.mark_unreachable_once(user_id, now))?;
        if newly {
            self.queue
                .enqueue_at(
                    Event::UnreachableRecheck { user_id },
                    clock::add_hours(now, self.checkin.unreachable_recheck_hours),
                )
                .await?;
        }
        Ok(())
    }
}
