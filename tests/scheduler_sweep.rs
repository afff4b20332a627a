//! Integration tests: the rolling-window sweep that materializes daily
//! obligation rows and enqueues the reminder / deadline cascade.

mod common;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use common::RecordingQueue;
use vigil::config::{CheckinConfig, SchedulerConfig};
use vigil::events::{Event, EventQueue};
use vigil::scheduler::Scheduler;
use vigil::store::Store;
use vigil::store::types::{DayState, User, UserStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Sweep {
    store: Arc<Store>,
    queue: Arc<RecordingQueue>,
    scheduler: Scheduler,
}

fn sweep_harness() -> Sweep {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let queue = Arc::new(RecordingQueue::default());
    let scheduler = Scheduler::new(
        Arc::clone(&store),
        queue.clone() as Arc<dyn EventQueue>,
        SchedulerConfig::default(),
        CheckinConfig::default(),
    );
    Sweep {
        store,
        queue,
        scheduler,
    }
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).single().expect("valid instant")
}

fn utc_at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, hh, mm, 0).single().expect("valid instant")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn seed_user_in(s: &Sweep, platform_id: i64, timezone: &str) -> User {
    let nine = NaiveTime::from_hms_opt(9, 0, 0).expect("valid time");
    s.store
        .with_tx(|tx| tx.upsert_user(platform_id, platform_id * 10, timezone, nine, fixed_now()))
        .expect("seed user")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_materializes_the_window_with_the_full_cascade() {
    let s = sweep_harness();
    let user = seed_user_in(&s, 1, "UTC");

    let touched = s.scheduler.sweep_once(fixed_now()).await.expect("sweep");
    // 36 hours ahead of Apr 1 00:00 covers Apr 1 and Apr 2.
    assert_eq!(touched, 2);

    let row = s
        .store
        .with_tx(|tx| tx.daily_state(user.id, date(2026, 4, 1)))
        .expect("load")
        .expect("row for today");
    assert_eq!(row.state, DayState::Pending);
    assert_eq!(row.due_at, utc_at(2026, 4, 1, 9, 0));
    assert_eq!(row.deadline_at, utc_at(2026, 4, 1, 10, 30));

    // Reminders at +30/+60/+90 minutes past due, deadline at due + grace.
    let today = date(2026, 4, 1);
    let mut reminder_times: Vec<(u32, DateTime<Utc>)> = s
        .queue
        .entries()
        .into_iter()
        .filter_map(|(e, when)| match e {
            Event::Reminder { user_id, date, n } if user_id == user.id && date == today => {
                Some((n, when))
            }
            _ => None,
        })
        .collect();
    reminder_times.sort();
    assert_eq!(
        reminder_times,
        vec![
            (1, utc_at(2026, 4, 1, 9, 30)),
            (2, utc_at(2026, 4, 1, 10, 0)),
            (3, utc_at(2026, 4, 1, 10, 30)),
        ]
    );

    let deadlines: Vec<_> = s
        .queue
        .entries()
        .into_iter()
        .filter(|(e, _)| {
            matches!(e, Event::DeadlineMissed { user_id, date } if *user_id == user.id && *date == today)
        })
        .collect();
    assert_eq!(deadlines.len(), 1);
    assert_eq!(deadlines[0].1, utc_at(2026, 4, 1, 10, 30));
}

#[tokio::test]
async fn timezone_shifts_the_due_instant() {
    let s = sweep_harness();
    let user = seed_user_in(&s, 1, "Europe/Moscow");

    s.scheduler.sweep_once(fixed_now()).await.expect("sweep");

    // 09:00 Moscow (UTC+3) is 06:00 UTC.
    let row = s
        .store
        .with_tx(|tx| tx.daily_state(user.id, date(2026, 4, 1)))
        .expect("load")
        .expect("row for today");
    assert_eq!(row.due_at, utc_at(2026, 4, 1, 6, 0));
    assert_eq!(row.deadline_at, utc_at(2026, 4, 1, 7, 30));
}

#[tokio::test]
async fn resweep_never_rewrites_existing_rows() {
    let s = sweep_harness();
    let user = seed_user_in(&s, 1, "UTC");

    let first = s.scheduler.sweep_once(fixed_now()).await.expect("first sweep");
    s.store
        .with_tx(|tx| tx.mark_done(user.id, date(2026, 4, 1)))
        .expect("resolve today");

    // Re-running the same sweep later in the day touches the same dates but
    // leaves resolved state and original instants alone.
    let again = s
        .scheduler
        .sweep_once(fixed_now() + chrono::Duration::hours(3))
        .await
        .expect("second sweep");
    assert_eq!(first, again);

    let row = s
        .store
        .with_tx(|tx| tx.daily_state(user.id, date(2026, 4, 1)))
        .expect("load")
        .expect("row survives");
    assert_eq!(row.state, DayState::Done);
    assert_eq!(row.due_at, utc_at(2026, 4, 1, 9, 0));
}

#[tokio::test]
async fn pause_and_disable_gate_the_sweep() {
    let s = sweep_harness();
    let elapsed = seed_user_in(&s, 1, "UTC");
    let still_paused = seed_user_in(&s, 2, "UTC");
    let disabled = seed_user_in(&s, 3, "UTC");
    s.store
        .with_tx(|tx| {
            tx.set_pause(elapsed.id, fixed_now() - chrono::Duration::hours(1), fixed_now())?;
            tx.set_pause(still_paused.id, fixed_now() + chrono::Duration::days(2), fixed_now())?;
            tx.set_user_status(disabled.id, UserStatus::Disabled, fixed_now())
        })
        .expect("arrange statuses");

    s.scheduler.sweep_once(fixed_now()).await.expect("sweep");

    let reactivated = s
        .store
        .with_tx(|tx| tx.user(elapsed.id))
        .expect("load")
        .expect("present");
    assert_eq!(reactivated.status, UserStatus::Active);
    assert!(reactivated.pause_until.is_none());

    let has_row = |id| {
        s.store
            .with_tx(|tx| tx.daily_state(id, date(2026, 4, 1)))
            .expect("load")
            .is_some()
    };
    assert!(has_row(elapsed.id), "elapsed pause materializes again");
    assert!(!has_row(still_paused.id));
    assert!(!has_row(disabled.id));
}

#[tokio::test]
async fn retention_purges_resolved_rows_but_never_pending_ones() {
    let s = sweep_harness();
    let user = seed_user_in(&s, 1, "UTC");
    s.store
        .with_tx(|tx| {
            tx.upsert_daily_state(user.id, date(2026, 3, 1), fixed_now(), fixed_now())?;
            tx.mark_done(user.id, date(2026, 3, 1))?;
            tx.upsert_daily_state(user.id, date(2026, 3, 2), fixed_now(), fixed_now())?;
            Ok(())
        })
        .expect("seed old rows");

    s.scheduler.sweep_once(fixed_now()).await.expect("sweep");

    let old_done = s
        .store
        .with_tx(|tx| tx.daily_state(user.id, date(2026, 3, 1)))
        .expect("load");
    assert!(old_done.is_none(), "resolved row past retention is purged");

    let old_pending = s
        .store
        .with_tx(|tx| tx.daily_state(user.id, date(2026, 3, 2)))
        .expect("load");
    assert!(old_pending.is_some(), "unresolved rows are kept");
}
