//! Domain rows and closed status enums for the check-in store.
//!
//! Status columns are persisted as their uppercase string form and validated
//! on every read; storage may have been written by an older schema, so a
//! value outside the closed set surfaces as a conversion error instead of
//! leaking through as a stringly-typed state.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Row id of a registered user.
pub type UserId = i64;

/// Chat-platform conversation id a message can be sent to.
pub type ChatId = i64;

/// A persisted enum column held a value outside the closed set.
#[derive(Debug, thiserror::Error)]
#[error("invalid {column} value: {value}")]
pub struct InvalidEnumValue {
    pub column: &'static str,
    pub value: String,
}

macro_rules! persisted_enum {
    ($(#[$meta:meta])* $name:ident / $column:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            /// Persisted string form.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Validated parse of a persisted value.
            pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(InvalidEnumValue {
                        column: $column,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

persisted_enum! {
    /// User lifecycle. `Disabled` is terminal for this core.
    UserStatus / "users.status" {
        Active => "ACTIVE",
        Paused => "PAUSED",
        Disabled => "DISABLED",
    }
}

persisted_enum! {
    /// Trusted-contact consent lifecycle.
    ContactStatus / "trusted_contacts.status" {
        Pending => "PENDING",
        Approved => "APPROVED",
        Declined => "DECLINED",
        Revoked => "REVOKED",
    }
}

persisted_enum! {
    /// Daily obligation lifecycle. `Done` and `Missed` are terminal for the
    /// day; only the late-prompt fields may still change after `Missed`.
    DayState / "daily_state.state" {
        Pending => "PENDING",
        Done => "DONE",
        Missed => "MISSED",
    }
}

persisted_enum! {
    /// Delivery status of one notification attempt.
    DeliveryStatus / "notification_log.status" {
        Pending => "PENDING",
        Sent => "SENT",
        Error => "ERROR",
    }
}

persisted_enum! {
    /// What a notification attempt was for.
    NotificationKind / "notification_log.kind" {
        Reminder => "REMINDER",
        Deadline => "DEADLINE",
        Escalation => "ESCALATION",
        Online => "ONLINE",
        LatePrompt => "LATE_PROMPT",
        Consent => "CONSENT",
    }
}

/// A registered user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    /// Identity on the chat platform.
    pub platform_user_id: i64,
    /// Conversation the platform delivers our messages to.
    pub chat_id: ChatId,
    /// IANA timezone name, validated when supplied.
    pub timezone: String,
    /// Local wall-clock time the daily check-in is due.
    pub checkin_time_local: NaiveTime,
    pub status: UserStatus,
    /// When set and elapsed, a paused user auto-reactivates.
    pub pause_until: Option<DateTime<Utc>>,
    /// Set once when delivery permanently fails; cleared out of scope.
    pub unreachable_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed user → contact relation gated on the contact's consent.
#[derive(Debug, Clone)]
pub struct TrustedContact {
    pub id: i64,
    pub user_id: UserId,
    /// The contact's identity on the chat platform.
    pub contact_platform_id: i64,
    /// Conversation the contact can be reached in.
    pub contact_chat_id: ChatId,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Geographic point attached to a check-in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// An immutable check-in fact: evidence submitted at a timestamp.
#[derive(Debug, Clone)]
pub struct CheckinRecord {
    pub id: i64,
    pub user_id: UserId,
    pub date_local: NaiveDate,
    pub created_at: DateTime<Utc>,
    /// Platform reference to the submitted photo.
    pub photo_ref: String,
    /// Object-store key once the photo has been archived.
    pub archive_key: Option<String>,
    pub geo: Option<GeoPoint>,
    /// True when submitted after the day's deadline.
    pub is_late: bool,
}

/// The per-(user, local date) obligation row.
#[derive(Debug, Clone)]
pub struct DailyState {
    pub user_id: UserId,
    pub date_local: NaiveDate,
    /// When the check-in is due (UTC).
    pub due_at: DateTime<Utc>,
    /// Due time plus the grace window (UTC); the deadline event fires here.
    pub deadline_at: DateTime<Utc>,
    pub state: DayState,
    /// Monotonic count of reminders actually delivered.
    pub reminders_sent: u32,
    pub escalation_sent_at: Option<DateTime<Utc>>,
    pub late_prompt_sent_at: Option<DateTime<Utc>>,
    pub late_prompt_response_at: Option<DateTime<Utc>>,
    /// The user's answer to the late prompt, when one was given.
    pub late_notify_contacts: Option<bool>,
}

/// One row per idempotency key in the notification ledger.
#[derive(Debug, Clone)]
pub struct NotificationAttempt {
    pub id: i64,
    pub idempotency_key: String,
    pub kind: NotificationKind,
    pub user_id: UserId,
    pub target_chat_id: ChatId,
    pub status: DeliveryStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips_through_persisted_form() {
        assert_eq!(UserStatus::parse("PAUSED").unwrap(), UserStatus::Paused);
        assert_eq!(ContactStatus::Approved.as_str(), "APPROVED");
        assert_eq!(DayState::parse("MISSED").unwrap(), DayState::Missed);
        assert_eq!(
            NotificationKind::parse("LATE_PROMPT").unwrap(),
            NotificationKind::LatePrompt
        );
    }

    #[test]
    fn enum_parse_rejects_unknown_values() {
        let err = DayState::parse("EXPIRED").unwrap_err();
        assert_eq!(err.column, "daily_state.state");
        assert_eq!(err.value, "EXPIRED");
    }
}
