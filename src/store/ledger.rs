//! Idempotent notification ledger.
//!
//! One row per distinct notification attempt, keyed by a deterministic
//! idempotency key. The unique index on the key column is the enforcement
//! mechanism: [`StoreTx::try_insert_attempt`] is a single atomic
//! check-and-insert, so two workers racing on the same key have exactly one
//! winner and the loser skips its send entirely.
//!
//! Known gap, inherited from the upstream design: a crash strictly between a
//! successful guard insert and the delivery call leaves that key PENDING
//! forever; there is no reconciliation sweep.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{OptionalExtension, params};

use super::StoreTx;
use super::types::{ChatId, DeliveryStatus, NotificationAttempt, NotificationKind, UserId};
use crate::error::{DeliveryError, Result};

/// Ledger error code for a permanent platform denial.
pub const CODE_FORBIDDEN: &str = "FORBIDDEN";
/// Ledger error code for a platform rate limit.
pub const CODE_RATE_LIMIT: &str = "RATE_LIMIT";
/// Ledger error code for any other delivery failure.
pub const CODE_SEND_ERROR: &str = "SEND_ERROR";

/// Map a delivery failure to its ledger error code.
pub fn code_for(err: &DeliveryError) -> &'static str {
    match err {
        DeliveryError::PermanentlyDenied(_) => CODE_FORBIDDEN,
        DeliveryError::RateLimited { .. } => CODE_RATE_LIMIT,
        DeliveryError::Transient(_) => CODE_SEND_ERROR,
    }
}

/// Key for reminder #`n` of a day's obligation.
pub fn reminder_key(user_id: UserId, date: NaiveDate, n: u32) -> String {
    format!("reminder:{user_id}:{date}:{n}")
}

/// Key for a day's missed-deadline transition.
pub fn deadline_key(user_id: UserId, date: NaiveDate) -> String {
    format!("deadline:{user_id}:{date}")
}

/// Key for one contact's escalation message for a given reason.
pub fn escalation_key(user_id: UserId, contact_chat_id: ChatId, reason: &str) -> String {
    format!("escalation:{user_id}:{contact_chat_id}:{reason}")
}

/// Key for one contact's "back online" notice for a given day.
pub fn online_key(user_id: UserId, contact_chat_id: ChatId, date: NaiveDate) -> String {
    format!("online:{user_id}:{contact_chat_id}:{date}")
}

/// Key for a day's late-arrival prompt to the user.
pub fn late_prompt_key(user_id: UserId, date: NaiveDate) -> String {
    format!("late_prompt:{user_id}:{date}")
}

/// Key for a contact's one-time consent request.
pub fn consent_key(contact_id: i64) -> String {
    format!("consent:{contact_id}")
}

impl StoreTx<'_> {
    /// Atomically claim an idempotency key by inserting a PENDING row.
    ///
    /// Returns `false` (without erroring) when the key already exists:
    /// someone else claimed this event, and the caller must skip its work.
    pub fn try_insert_attempt(
        &self,
        key: &str,
        kind: NotificationKind,
        user_id: UserId,
        target_chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO notification_log \
             (idempotency_key, kind, user_id, target_chat_id, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5)",
            params![key, kind.as_str(), user_id, target_chat_id, now.timestamp()],
        )?;
        Ok(inserted > 0)
    }

    /// Terminal transition: the delivery succeeded.
    pub fn mark_attempt_sent(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            "UPDATE notification_log SET status = 'SENT', sent_at = ?2 \
             WHERE idempotency_key = ?1",
            params![key, at.timestamp()],
        )?;
        Ok(())
    }

    /// Terminal transition: the delivery failed.
    pub fn mark_attempt_error(&self, key: &str, code: &str, message: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE notification_log SET status = 'ERROR', error_code = ?2, error_message = ?3 \
             WHERE idempotency_key = ?1",
            params![key, code, message],
        )?;
        Ok(())
    }

    /// Fetch one ledger row by key.
    pub fn attempt(&self, key: &str) -> Result<Option<NotificationAttempt>> {
        let row = self
            .tx
            .query_row(
                "SELECT id, idempotency_key, kind, user_id, target_chat_id, status, \
                 error_code, error_message, sent_at, created_at \
                 FROM notification_log WHERE idempotency_key = ?1",
                params![key],
                |row| {
                    let kind_str: String = row.get(2)?;
                    let status_str: String = row.get(5)?;
                    Ok(NotificationAttempt {
                        id: row.get(0)?,
                        idempotency_key: row.get(1)?,
                        kind: NotificationKind::parse(&kind_str)
                            .map_err(|e| super::conv_err(2, e))?,
                        user_id: row.get(3)?,
                        target_chat_id: row.get(4)?,
                        status: DeliveryStatus::parse(&status_str)
                            .map_err(|e| super::conv_err(5, e))?,
                        error_code: row.get(6)?,
                        error_message: row.get(7)?,
                        sent_at: super::opt_utc(row.get(8)?),
                        created_at: super::utc_from_secs(row.get(9)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::store::Store;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn second_insert_on_same_key_loses() {
        let store = Store::open_in_memory().unwrap();
        let key = reminder_key(1, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(), 2);

        let first = store
            .with_tx(|tx| tx.try_insert_attempt(&key, NotificationKind::Reminder, 1, 10, now()))
            .unwrap();
        let second = store
            .with_tx(|tx| tx.try_insert_attempt(&key, NotificationKind::Reminder, 1, 10, now()))
            .unwrap();
        assert!(first);
        assert!(!second);

        let row = store.with_tx(|tx| tx.attempt(&key)).unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Pending);
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let key = deadline_key(7, NaiveDate::from_ymd_opt(2026, 4, 2).unwrap());
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let wins = Arc::clone(&wins);
                let key = key.clone();
                std::thread::spawn(move || {
                    let claimed = store
                        .with_tx(|tx| {
                            tx.try_insert_attempt(&key, NotificationKind::Deadline, 7, 70, now())
                        })
                        .unwrap();
                    if claimed {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_transitions_record_outcome() {
        let store = Store::open_in_memory().unwrap();
        let sent_key = "escalation:1:10:missed";
        let err_key = "escalation:1:11:missed";

        store
            .with_tx(|tx| {
                tx.try_insert_attempt(sent_key, NotificationKind::Escalation, 1, 10, now())?;
                tx.try_insert_attempt(err_key, NotificationKind::Escalation, 1, 11, now())?;
                tx.mark_attempt_sent(sent_key, now())?;
                tx.mark_attempt_error(err_key, CODE_FORBIDDEN, "blocked")?;
                Ok(())
            })
            .unwrap();

        let sent = store.with_tx(|tx| tx.attempt(sent_key)).unwrap().unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.sent_at, Some(now()));

        let errored = store.with_tx(|tx| tx.attempt(err_key)).unwrap().unwrap();
        assert_eq!(errored.status, DeliveryStatus::Error);
        assert_eq!(errored.error_code.as_deref(), Some(CODE_FORBIDDEN));
    }

    #[test]
    fn delivery_errors_map_to_ledger_codes() {
        assert_eq!(code_for(&DeliveryError::PermanentlyDenied("x".into())), CODE_FORBIDDEN);
        assert_eq!(
            code_for(&DeliveryError::RateLimited { retry_after_secs: 3 }),
            CODE_RATE_LIMIT
        );
        assert_eq!(code_for(&DeliveryError::Transient("x".into())), CODE_SEND_ERROR);
    }

    #[test]
    fn keys_are_deterministic() {
        let d = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        assert_eq!(reminder_key(5, d, 3), "reminder:5:2026-04-01:3");
        assert_eq!(deadline_key(5, d), "deadline:5:2026-04-01");
        assert_eq!(online_key(5, 42, d), "online:5:42:2026-04-01");
        assert_eq!(late_prompt_key(5, d), "late_prompt:5:2026-04-01");
        assert_eq!(consent_key(9), "consent:9");
    }
}
