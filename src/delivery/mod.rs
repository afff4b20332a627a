//! Chat-platform delivery boundary.
//!
//! The platform client is an external collaborator consumed through the
//! [`ChatClient`] trait; this crate never talks to a chat API directly.
//! [`Sender`] wraps a client with the shared outbound rate limiter so every
//! send site checks the budget the same way.

pub mod rate_limiter;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::store::types::ChatId;
use rate_limiter::RateLimiter;

/// An interactive choice attached to a message (e.g. approve / decline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    /// Button label shown to the recipient.
    pub label: String,
    /// Machine-readable payload returned when the choice is taken.
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Outbound chat-platform client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a text message, optionally with interactive choices.
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), DeliveryError>;

    /// Send a photo by platform reference with a caption.
    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo_ref: &str,
        caption: &str,
    ) -> Result<(), DeliveryError>;

    /// Download the bytes behind a photo reference (for archival).
    async fn fetch_photo(&self, photo_ref: &str) -> Result<Vec<u8>, DeliveryError>;
}

/// Shared rate-limiter key: all sends target the same external channel.
const OUTBOUND_KEY: &str = "outbound";

/// Rate-limited front door to the chat client.
#[derive(Clone)]
pub struct Sender {
    chat: Arc<dyn ChatClient>,
    limiter: Arc<RateLimiter>,
}

impl Sender {
    pub fn new(chat: Arc<dyn ChatClient>, limiter: Arc<RateLimiter>) -> Self {
        Self { chat, limiter }
    }

    fn check_budget(&self) -> Result<(), DeliveryError> {
        if self.limiter.allow(OUTBOUND_KEY) {
            Ok(())
        } else {
            // Local budget exhausted: surface as a rate limit so the caller's
            // retry layer treats it exactly like a platform throttle.
            Err(DeliveryError::RateLimited {
                retry_after_secs: 1,
            })
        }
    }

    /// Send a text message if the per-second budget allows it.
    pub async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), DeliveryError> {
        self.check_budget()?;
        self.chat.send_text(chat_id, text, choices).await
    }

    /// Send a photo if the per-second budget allows it.
    pub async fn send_photo(
        &self,
        chat_id: ChatId,
        photo_ref: &str,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        self.check_budget()?;
        self.chat.send_photo(chat_id, photo_ref, caption).await
    }
}
