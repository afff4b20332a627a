//! Vigil: daily check-in tracking with a reminder and escalation cascade.
//!
//! Users register a daily check-in time in their own timezone. Each local day
//! gets an obligation row; the cascade runs reminders after the due time,
//! marks the day MISSED at the deadline, and escalates to consented trusted
//! contacts. A check-in that arrives after an escalation offers the user a
//! late-notify choice.
//!
//! # Architecture
//!
//! Independent pieces wired through traits at the external seams:
//! - **Store**: SQLite persistence with an explicit unit-of-work
//! - **Scheduler**: rolling-window sweep that materializes obligations
//! - **Events**: a closed, typed event set behind the [`events::EventQueue`]
//!   contract, with an in-process tokio implementation
//! - **State machine**: [`state_machine::CheckinService`], every transition
//!   and timed-event handler
//! - **Delivery**: the chat platform behind [`delivery::ChatClient`], rate
//!   limited and recorded in an idempotent notification ledger
//! - **Media**: optional check-in photo archival behind
//!   [`media::ObjectStore`]

pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod media;
pub mod notify;
pub mod scheduler;
pub mod state_machine;
pub mod store;

pub use config::VigilConfig;
pub use delivery::ChatClient;
pub use error::{DeliveryError, Result, VigilError};
pub use events::{Event, EventQueue, InProcessQueue};
pub use scheduler::Scheduler;
pub use state_machine::CheckinService;
pub use store::Store;
