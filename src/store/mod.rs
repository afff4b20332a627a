//! SQLite-backed store for users, contacts, check-ins, daily obligation
//! rows, and the notification ledger.
//!
//! Thread-safe via an internal `Mutex<Connection>`. All mutation funnels
//! through [`Store::with_tx`], an explicit unit-of-work: the closure runs
//! inside one SQLite transaction that commits on `Ok` and rolls back on
//! `Err`, so a mid-handler failure leaves every table consistent.

pub mod ledger;
pub mod schema;
pub mod types;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::error::{Result, VigilError};
use types::{
    CheckinRecord, ContactStatus, DailyState, DayState, GeoPoint, TrustedContact, User, UserId,
    UserStatus,
};

/// Database filename within the storage root directory.
const DB_FILENAME: &str = "vigil.db";

/// SQLite-backed check-in store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `{root_dir}/vigil.db`.
    ///
    /// Applies the schema if the database is new.
    pub fn open(root_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(root_dir)?;
        let conn = Connection::open(root_dir.join(DB_FILENAME))?;
        schema::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read the current schema version from the database.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.conn.lock().map_err(|_| VigilError::LockPoisoned)?;
        Ok(schema::read_schema_version(&conn)?)
    }

    /// Run `f` inside a single transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| VigilError::LockPoisoned)?;
        let tx = conn.transaction()?;
        let value = f(&StoreTx { tx: &tx })?;
        tx.commit()?;
        Ok(value)
    }
}

/// Row-level API available inside one unit-of-work.
pub struct StoreTx<'a> {
    pub(crate) tx: &'a Transaction<'a>,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

impl StoreTx<'_> {
    /// Create a user, or update timezone / check-in time / chat id for an
    /// existing platform identity.
    pub fn upsert_user(
        &self,
        platform_user_id: i64,
        chat_id: i64,
        timezone: &str,
        checkin_time_local: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<User> {
        self.tx.execute(
            "INSERT INTO users \
             (platform_user_id, chat_id, timezone, checkin_time_local, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'ACTIVE', ?5, ?5) \
             ON CONFLICT(platform_user_id) DO UPDATE SET \
               chat_id = ?2, timezone = ?3, checkin_time_local = ?4, updated_at = ?5",
            params![
                platform_user_id,
                chat_id,
                timezone,
                format_time(checkin_time_local),
                now.timestamp()
            ],
        )?;
        self.user_by_platform_id(platform_user_id)?
            .ok_or(VigilError::UnknownUser(platform_user_id))
    }

    /// Fetch a user by row id.
    pub fn user(&self, id: UserId) -> Result<Option<User>> {
        let row = self
            .tx
            .query_row(
                &format!("{USER_SELECT} WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch a user by chat-platform identity.
    pub fn user_by_platform_id(&self, platform_user_id: i64) -> Result<Option<User>> {
        let row = self
            .tx
            .query_row(
                &format!("{USER_SELECT} WHERE platform_user_id = ?1"),
                params![platform_user_id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// All users regardless of status, ordered by id.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.tx.prepare(&format!("{USER_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_user)?;
        collect(rows)
    }

    /// Set lifecycle status. Entering `Active` clears any pause.
    pub fn set_user_status(
        &self,
        id: UserId,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let n = if status == UserStatus::Active {
            self.tx.execute(
                "UPDATE users SET status = ?2, pause_until = NULL, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now.timestamp()],
            )?
        } else {
            self.tx.execute(
                "UPDATE users SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now.timestamp()],
            )?
        };
        if n == 0 {
            return Err(VigilError::UnknownUser(id));
        }
        Ok(())
    }

    /// Pause the user until the given instant.
    pub fn set_pause(&self, id: UserId, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE users SET status = 'PAUSED', pause_until = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, until.timestamp(), now.timestamp()],
        )?;
        if n == 0 {
            return Err(VigilError::UnknownUser(id));
        }
        Ok(())
    }

    /// Stamp `unreachable_since` if it is not already set.
    ///
    /// Returns `true` only for the first call of an unreachability episode,
    /// so the caller schedules exactly one recheck.
    pub fn mark_unreachable_once(&self, id: UserId, since: DateTime<Utc>) -> Result<bool> {
        let n = self.tx.execute(
            "UPDATE users SET unreachable_since = ?2, updated_at = ?2 \
             WHERE id = ?1 AND unreachable_since IS NULL",
            params![id, since.timestamp()],
        )?;
        Ok(n > 0)
    }
}

// ---------------------------------------------------------------------------
// Trusted contacts
// ---------------------------------------------------------------------------

impl StoreTx<'_> {
    /// Number of contact rows (any status) for a user.
    pub fn count_contacts(&self, user_id: UserId) -> Result<usize> {
        let n: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM trusted_contacts WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Create a contact relation, or refresh the chat id of an existing one.
    ///
    /// Re-introducing an existing contact never resets its consent status;
    /// only the contact's own response moves it.
    pub fn upsert_contact(
        &self,
        user_id: UserId,
        contact_platform_id: i64,
        contact_chat_id: i64,
        now: DateTime<Utc>,
    ) -> Result<TrustedContact> {
        self.tx.execute(
            "INSERT INTO trusted_contacts \
             (user_id, contact_platform_id, contact_chat_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4) \
             ON CONFLICT(user_id, contact_platform_id) DO UPDATE SET \
               contact_chat_id = ?3, updated_at = ?4",
            params![user_id, contact_platform_id, contact_chat_id, now.timestamp()],
        )?;
        let contact = self.tx.query_row(
            &format!("{CONTACT_SELECT} WHERE user_id = ?1 AND contact_platform_id = ?2"),
            params![user_id, contact_platform_id],
            row_to_contact,
        )?;
        Ok(contact)
    }

    /// Fetch a contact by row id.
    pub fn contact(&self, id: i64) -> Result<Option<TrustedContact>> {
        let row = self
            .tx
            .query_row(
                &format!("{CONTACT_SELECT} WHERE id = ?1"),
                params![id],
                row_to_contact,
            )
            .optional()?;
        Ok(row)
    }

    /// Record the contact's consent response (or a revocation).
    pub fn set_contact_status(
        &self,
        id: i64,
        status: ContactStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let n = self.tx.execute(
            "UPDATE trusted_contacts SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now.timestamp()],
        )?;
        if n == 0 {
            return Err(VigilError::UnknownContact(id));
        }
        Ok(())
    }

    /// Contacts who approved receiving escalations for this user.
    pub fn list_approved_contacts(&self, user_id: UserId) -> Result<Vec<TrustedContact>> {
        let mut stmt = self.tx.prepare(&format!(
            "{CONTACT_SELECT} WHERE user_id = ?1 AND status = 'APPROVED' ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_contact)?;
        collect(rows)
    }
}

// ---------------------------------------------------------------------------
// Check-ins
// ---------------------------------------------------------------------------

impl StoreTx<'_> {
    /// Append a check-in fact. Never mutated afterwards except for geo
    /// attachment and the archive key.
    pub fn append_checkin(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        photo_ref: &str,
        is_late: bool,
        now: DateTime<Utc>,
    ) -> Result<CheckinRecord> {
        self.tx.execute(
            "INSERT INTO checkins (user_id, date_local, created_at, photo_ref, is_late) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                date_local.to_string(),
                now.timestamp(),
                photo_ref,
                is_late
            ],
        )?;
        let id = self.tx.last_insert_rowid();
        Ok(CheckinRecord {
            id,
            user_id,
            date_local,
            created_at: now,
            photo_ref: photo_ref.to_owned(),
            archive_key: None,
            geo: None,
            is_late,
        })
    }

    /// Fetch a check-in by row id.
    pub fn checkin(&self, id: i64) -> Result<Option<CheckinRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{CHECKIN_SELECT} WHERE id = ?1"),
                params![id],
                row_to_checkin,
            )
            .optional()?;
        Ok(row)
    }

    /// Attach coordinates to a check-in.
    pub fn attach_geo(&self, checkin_id: i64, geo: GeoPoint) -> Result<()> {
        self.tx.execute(
            "UPDATE checkins SET geo_lat = ?2, geo_lon = ?3 WHERE id = ?1",
            params![checkin_id, geo.lat, geo.lon],
        )?;
        Ok(())
    }

    /// Record the object-store key of the archived photo.
    pub fn set_archive_key(&self, checkin_id: i64, key: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE checkins SET archive_key = ?2 WHERE id = ?1",
            params![checkin_id, key],
        )?;
        Ok(())
    }

    /// Most recent check-in for a user, if any.
    pub fn latest_checkin(&self, user_id: UserId) -> Result<Option<CheckinRecord>> {
        let row = self
            .tx
            .query_row(
                &format!("{CHECKIN_SELECT} WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"),
                params![user_id],
                row_to_checkin,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent check-in submitted within the last `minutes`.
    pub fn latest_checkin_within(
        &self,
        user_id: UserId,
        minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CheckinRecord>> {
        let threshold = now.timestamp() - minutes * 60;
        let row = self
            .tx
            .query_row(
                &format!(
                    "{CHECKIN_SELECT} WHERE user_id = ?1 AND created_at >= ?2 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![user_id, threshold],
                row_to_checkin,
            )
            .optional()?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Daily obligation rows
// ---------------------------------------------------------------------------

impl StoreTx<'_> {
    /// Create the obligation row for (user, local date) if it does not
    /// exist, then return the current row.
    ///
    /// A second creation attempt is a no-op; the primary key makes repeated
    /// sweeps safe.
    pub fn upsert_daily_state(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        due_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> Result<DailyState> {
        self.tx.execute(
            "INSERT OR IGNORE INTO daily_state \
             (user_id, date_local, due_at, deadline_at, state, reminders_sent) \
             VALUES (?1, ?2, ?3, ?4, 'PENDING', 0)",
            params![
                user_id,
                date_local.to_string(),
                due_at.timestamp(),
                deadline_at.timestamp()
            ],
        )?;
        let state = self.tx.query_row(
            &format!("{DAILY_SELECT} WHERE user_id = ?1 AND date_local = ?2"),
            params![user_id, date_local.to_string()],
            row_to_daily,
        )?;
        Ok(state)
    }

    /// Fetch the obligation row for (user, local date).
    pub fn daily_state(&self, user_id: UserId, date_local: NaiveDate) -> Result<Option<DailyState>> {
        let row = self
            .tx
            .query_row(
                &format!("{DAILY_SELECT} WHERE user_id = ?1 AND date_local = ?2"),
                params![user_id, date_local.to_string()],
                row_to_daily,
            )
            .optional()?;
        Ok(row)
    }

    /// PENDING → DONE. Returns `false` when the row was no longer PENDING.
    pub fn mark_done(&self, user_id: UserId, date_local: NaiveDate) -> Result<bool> {
        let n = self.tx.execute(
            "UPDATE daily_state SET state = 'DONE' \
             WHERE user_id = ?1 AND date_local = ?2 AND state = 'PENDING'",
            params![user_id, date_local.to_string()],
        )?;
        Ok(n > 0)
    }

    /// PENDING → MISSED, stamping `escalation_sent_at` in the same write.
    /// Returns `false` when the row was no longer PENDING.
    pub fn mark_missed(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.tx.execute(
            "UPDATE daily_state SET state = 'MISSED', escalation_sent_at = ?3 \
             WHERE user_id = ?1 AND date_local = ?2 AND state = 'PENDING'",
            params![user_id, date_local.to_string(), at.timestamp()],
        )?;
        Ok(n > 0)
    }

    /// Increment the reminder count, but only while it is below `n`.
    ///
    /// The monotonic guard makes duplicate or late-firing reminder events
    /// unable to double count.
    pub fn increment_reminders_below(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        n: u32,
    ) -> Result<bool> {
        let changed = self.tx.execute(
            "UPDATE daily_state SET reminders_sent = reminders_sent + 1 \
             WHERE user_id = ?1 AND date_local = ?2 AND reminders_sent < ?3",
            params![user_id, date_local.to_string(), n],
        )?;
        Ok(changed > 0)
    }

    /// Stamp the late-prompt send time.
    pub fn mark_late_prompt_sent(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.tx.execute(
            "UPDATE daily_state SET late_prompt_sent_at = ?3 \
             WHERE user_id = ?1 AND date_local = ?2",
            params![user_id, date_local.to_string(), at.timestamp()],
        )?;
        Ok(())
    }

    /// Record the user's answer to the late prompt. Allowed after MISSED.
    pub fn set_late_response(
        &self,
        user_id: UserId,
        date_local: NaiveDate,
        notify: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.tx.execute(
            "UPDATE daily_state SET late_prompt_response_at = ?3, late_notify_contacts = ?4 \
             WHERE user_id = ?1 AND date_local = ?2",
            params![user_id, date_local.to_string(), at.timestamp(), notify],
        )?;
        Ok(())
    }

    /// Delete resolved rows older than the cutoff date. Retention policy
    /// hook; PENDING rows are never purged.
    pub fn purge_resolved_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let n = self.tx.execute(
            "DELETE FROM daily_state WHERE date_local < ?1 AND state != 'PENDING'",
            params![cutoff.to_string()],
        )?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

const USER_SELECT: &str = "SELECT id, platform_user_id, chat_id, timezone, checkin_time_local, \
     status, pause_until, unreachable_since, created_at, updated_at FROM users";

const CONTACT_SELECT: &str = "SELECT id, user_id, contact_platform_id, contact_chat_id, status, \
     created_at, updated_at FROM trusted_contacts";

const CHECKIN_SELECT: &str = "SELECT id, user_id, date_local, created_at, photo_ref, archive_key, \
     geo_lat, geo_lon, is_late FROM checkins";

const DAILY_SELECT: &str = "SELECT user_id, date_local, due_at, deadline_at, state, \
     reminders_sent, escalation_sent_at, late_prompt_sent_at, late_prompt_response_at, \
     late_notify_contacts FROM daily_state";

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn conv_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn utc_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn opt_utc(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.map(utc_from_secs)
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    s.parse::<NaiveDate>().map_err(|e| conv_err(idx, e))
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let time_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        platform_user_id: row.get(1)?,
        chat_id: row.get(2)?,
        timezone: row.get(3)?,
        checkin_time_local: NaiveTime::parse_from_str(&time_str, "%H:%M")
            .map_err(|e| conv_err(4, e))?,
        status: UserStatus::parse(&status_str).map_err(|e| conv_err(5, e))?,
        pause_until: opt_utc(row.get(6)?),
        unreachable_since: opt_utc(row.get(7)?),
        created_at: utc_from_secs(row.get(8)?),
        updated_at: utc_from_secs(row.get(9)?),
    })
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<TrustedContact> {
    let status_str: String = row.get(4)?;
    Ok(TrustedContact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        contact_platform_id: row.get(2)?,
        contact_chat_id: row.get(3)?,
        status: ContactStatus::parse(&status_str).map_err(|e| conv_err(4, e))?,
        created_at: utc_from_secs(row.get(5)?),
        updated_at: utc_from_secs(row.get(6)?),
    })
}

fn row_to_checkin(row: &Row<'_>) -> rusqlite::Result<CheckinRecord> {
    let date_str: String = row.get(2)?;
    let lat: Option<f64> = row.get(6)?;
    let lon: Option<f64> = row.get(7)?;
    Ok(CheckinRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        date_local: parse_date(2, &date_str)?,
        created_at: utc_from_secs(row.get(3)?),
        photo_ref: row.get(4)?,
        archive_key: row.get(5)?,
        geo: match (lat, lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        },
        is_late: row.get(8)?,
    })
}

fn row_to_daily(row: &Row<'_>) -> rusqlite::Result<DailyState> {
    let date_str: String = row.get(1)?;
    let state_str: String = row.get(4)?;
    Ok(DailyState {
        user_id: row.get(0)?,
        date_local: parse_date(1, &date_str)?,
        due_at: utc_from_secs(row.get(2)?),
        deadline_at: utc_from_secs(row.get(3)?),
        state: DayState::parse(&state_str).map_err(|e| conv_err(4, e))?,
        reminders_sent: row.get(5)?,
        escalation_sent_at: opt_utc(row.get(6)?),
        late_prompt_sent_at: opt_utc(row.get(7)?),
        late_prompt_response_at: opt_utc(row.get(8)?),
        late_notify_contacts: row.get(9)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
