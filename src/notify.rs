//! Trusted-contact fan-out.
//!
//! Escalations, "back online" notices, and consent requests all follow the
//! same shape: load the recipients, claim a per-contact idempotency key,
//! send, record the outcome. One contact's delivery failure never blocks
//! the others.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::delivery::{Choice, Sender};
use crate::error::Result;
use crate::store::types::{NotificationKind, User};
use crate::store::{Store, ledger};

/// Why trusted contacts are being notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    /// The day's deadline passed without a check-in.
    MissedCheckin,
    /// Delivery to the user has permanently failed and stayed failed
    /// through the recheck delay.
    Unreachable,
}

impl EscalationReason {
    /// Stable token used inside idempotency keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissedCheckin => "missed_checkin",
            Self::Unreachable => "unreachable",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::MissedCheckin => "The daily check-in was missed.",
            Self::Unreachable => "The user is unreachable; they may have blocked or deleted the bot.",
        }
    }
}

/// Sends contact-facing notifications through the ledger guard.
pub struct Notifier {
    store: Arc<Store>,
    sender: Sender,
}

impl Notifier {
    pub fn new(store: Arc<Store>, sender: Sender) -> Self {
        Self { store, sender }
    }

    /// Escalate to every approved contact, attaching the most recent
    /// check-in evidence when any exists.
    ///
    /// Silently a no-op when the user has no approved contacts; the
    /// consent workflow simply has not completed.
    pub async fn notify_trusted_contacts(&self, user: &User, reason: EscalationReason) -> Result<()> {
        let (contacts, last) = self.store.with_tx(|tx| {
            Ok((
                tx.list_approved_contacts(user.id)?,
                tx.latest_checkin(user.id)?,
            ))
        })?;
        if contacts.is_empty() {
            debug!(user_id = user.id, "no approved contacts, escalation skipped");
            return Ok(());
        }

        let text = describe_with_evidence(reason, &last);

        for contact in contacts {
            let key = ledger::escalation_key(user.id, contact.contact_chat_id, reason.as_str());
            let claimed = self.store.with_tx(|tx| {
                tx.try_insert_attempt(
                    &key,
                    NotificationKind::Escalation,
                    user.id,
                    contact.contact_chat_id,
                    Utc::now(),
                )
            })?;
            if !claimed {
                continue;
            }

            let outcome = match &last {
                Some(checkin) => {
                    self.sender
                        .send_photo(contact.contact_chat_id, &checkin.photo_ref, &text)
                        .await
                }
                None => {
                    self.sender
                        .send_text(contact.contact_chat_id, &text, &[])
                        .await
                }
            };
            self.record_outcome(&key, contact.contact_chat_id, outcome)?;
        }
        Ok(())
    }

    /// Lighter "back online" fan-out after a positive late-prompt response.
    pub async fn notify_online(&self, user: &User, date: NaiveDate) -> Result<()> {
        let contacts = self.store.with_tx(|tx| tx.list_approved_contacts(user.id))?;
        if contacts.is_empty() {
            return Ok(());
        }

        let text = format!("The user is back online ({date}).");
        for contact in contacts {
            let key = ledger::online_key(user.id, contact.contact_chat_id, date);
            let claimed = self.store.with_tx(|tx| {
                tx.try_insert_attempt(
                    &key,
                    NotificationKind::Online,
                    user.id,
                    contact.contact_chat_id,
                    Utc::now(),
                )
            })?;
            if !claimed {
                continue;
            }
            let outcome = self
                .sender
                .send_text(contact.contact_chat_id, &text, &[])
                .await;
            self.record_outcome(&key, contact.contact_chat_id, outcome)?;
        }
        Ok(())
    }

    /// Ask a newly introduced contact whether they consent to receiving
    /// escalations for this user.
    pub async fn send_consent_request(&self, user_id: i64, contact_id: i64) -> Result<()> {
        let claim = self.store.with_tx(|tx| {
            let Some(contact) = tx.contact(contact_id)? else {
                return Ok(None);
            };
            if contact.status != crate::store::types::ContactStatus::Pending {
                return Ok(None);
            }
            let key = ledger::consent_key(contact_id);
            if !tx.try_insert_attempt(
                &key,
                NotificationKind::Consent,
                user_id,
                contact.contact_chat_id,
                Utc::now(),
            )? {
                return Ok(None);
            }
            Ok(Some((contact, key)))
        })?;
        let Some((contact, key)) = claim else {
            return Ok(());
        };

        let choices = [
            Choice::new("Yes", format!("contact:approve:{contact_id}")),
            Choice::new("No", format!("contact:decline:{contact_id}")),
        ];
        let text = "You were added as a trusted contact. \
                    Do you agree to be notified when a check-in is missed?";
        let outcome = self
            .sender
            .send_text(contact.contact_chat_id, text, &choices)
            .await;
        self.record_outcome(&key, contact.contact_chat_id, outcome)
    }

    /// Record one contact-send outcome in the ledger. Failures are logged
    /// and absorbed so the remaining contacts still get their message.
    fn record_outcome(
        &self,
        key: &str,
        chat_id: i64,
        outcome: std::result::Result<(), crate::error::DeliveryError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => self.store.with_tx(|tx| tx.mark_attempt_sent(key, Utc::now())),
            Err(err) => {
                warn!(chat_id, key, "contact delivery failed: {err}");
                self.store.with_tx(|tx| {
                    tx.mark_attempt_error(key, ledger::code_for(&err), &err.to_string())
                })
            }
        }
    }
}

fn describe_with_evidence(
    reason: EscalationReason,
    last: &Option<crate::store::types::CheckinRecord>,
) -> String {
    let mut text = reason.describe().to_owned();
    if let Some(checkin) = last {
        text.push_str(&format!("\nLast check-in: {}", checkin.created_at));
        if let Some(geo) = checkin.geo {
            text.push_str(&format!("\nLocation: {}, {}", geo.lat, geo.lon));
        }
    }
    text
}
