//! Optional photo archival to an object store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::delivery::ChatClient;
use crate::error::{Result, VigilError};
use crate::store::Store;

/// Blob-storage boundary for archived check-in photos.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, overwriting any previous object.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// Copies check-in photos out of the chat platform into durable storage.
///
/// Disabled deployments get [`Archiver::disabled`], which turns every
/// archive request into a no-op rather than sprinkling feature checks
/// through the event handlers.
pub struct Archiver {
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl Archiver {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Some(object_store),
        }
    }

    pub fn disabled() -> Self {
        Self { object_store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.object_store.is_some()
    }

    /// Fetch the photo behind a check-in and store it durably.
    ///
    /// Idempotent under redelivery: a record that already carries an
    /// archive key is skipped without refetching.
    pub async fn archive(
        &self,
        chat: &dyn ChatClient,
        store: &Store,
        checkin_id: i64,
    ) -> Result<()> {
        let Some(object_store) = &self.object_store else {
            return Ok(());
        };
        let Some(checkin) = store.with_tx(|tx| tx.checkin(checkin_id))? else {
            debug!(checkin_id, "archive requested for unknown check-in");
            return Ok(());
        };
        if checkin.archive_key.is_some() {
            return Ok(());
        }

        let bytes = chat
            .fetch_photo(&checkin.photo_ref)
            .await
            .map_err(|e| VigilError::Media(format!("photo fetch failed: {e}")))?;
        let key = format!("checkins/{}/{}.jpg", checkin.id, checkin.photo_ref);
        object_store.put(&key, &bytes, "image/jpeg").await?;
        store.with_tx(|tx| tx.set_archive_key(checkin_id, &key))?;
        info!(checkin_id, key, "check-in photo archived");
        Ok(())
    }
}
