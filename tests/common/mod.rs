//! Shared fakes and wiring for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};

use vigil::config::VigilConfig;
use vigil::delivery::{ChatClient, Choice};
use vigil::error::{DeliveryError, Result};
use vigil::events::{Event, EventQueue};
use vigil::media::ObjectStore;
use vigil::state_machine::CheckinService;
use vigil::store::Store;
use vigil::store::types::User;

/// One message the fake client accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub photo_ref: Option<String>,
    pub choices: Vec<Choice>,
}

/// Chat client that records sends and fails on demand per chat id.
#[derive(Default)]
pub struct FakeChatClient {
    pub sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<HashMap<i64, DeliveryError>>,
    photos: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeChatClient {
    /// Every send to `chat_id` will fail with `err` until cleared.
    pub fn fail_chat(&self, chat_id: i64, err: DeliveryError) {
        self.failures.lock().unwrap().insert(chat_id, err);
    }

    pub fn clear_failure(&self, chat_id: i64) {
        self.failures.lock().unwrap().remove(&chat_id);
    }

    /// Register downloadable photo bytes behind a platform reference.
    pub fn put_photo(&self, photo_ref: &str, bytes: &[u8]) {
        self.photos
            .lock()
            .unwrap()
            .insert(photo_ref.to_owned(), bytes.to_vec());
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn messages_to(&self, chat_id: i64) -> Vec<SentMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }

    fn check_failure(&self, chat_id: i64) -> std::result::Result<(), DeliveryError> {
        match self.failures.lock().unwrap().get(&chat_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        choices: &[Choice],
    ) -> std::result::Result<(), DeliveryError> {
        self.check_failure(chat_id)?;
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_owned(),
            photo_ref: None,
            choices: choices.to_vec(),
        });
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo_ref: &str,
        caption: &str,
    ) -> std::result::Result<(), DeliveryError> {
        self.check_failure(chat_id)?;
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: caption.to_owned(),
            photo_ref: Some(photo_ref.to_owned()),
            choices: Vec::new(),
        });
        Ok(())
    }

    async fn fetch_photo(&self, photo_ref: &str) -> std::result::Result<Vec<u8>, DeliveryError> {
        self.photos
            .lock()
            .unwrap()
            .get(photo_ref)
            .cloned()
            .ok_or_else(|| DeliveryError::Transient(format!("no such photo: {photo_ref}")))
    }
}

/// Queue that records enqueues instead of firing them; tests drive handlers
/// directly through `CheckinService::handle_event`.
#[derive(Default)]
pub struct RecordingQueue {
    entries: Mutex<Vec<(Event, DateTime<Utc>)>>,
}

impl RecordingQueue {
    pub fn entries(&self) -> Vec<(Event, DateTime<Utc>)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.entries().into_iter().map(|(e, _)| e).collect()
    }

    pub fn count_matching(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventQueue for RecordingQueue {
    async fn enqueue_at(&self, event: Event, when: DateTime<Utc>) -> Result<()> {
        self.entries.lock().unwrap().push((event, when));
        Ok(())
    }
}

/// In-memory object store for archival tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), (bytes.to_vec(), content_type.to_owned()));
        Ok(())
    }
}

/// Fully wired service over an in-memory store and the fakes above.
pub struct Harness {
    pub store: Arc<Store>,
    pub chat: Arc<FakeChatClient>,
    pub queue: Arc<RecordingQueue>,
    pub service: CheckinService,
}

pub fn harness() -> Harness {
    harness_with(VigilConfig::default(), None)
}

pub fn harness_with(
    cfg: VigilConfig,
    object_store: Option<Arc<MemoryObjectStore>>,
) -> Harness {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let chat = Arc::new(FakeChatClient::default());
    let queue = Arc::new(RecordingQueue::default());
    let service = CheckinService::new(
        Arc::clone(&store),
        chat.clone() as Arc<dyn ChatClient>,
        queue.clone() as Arc<dyn EventQueue>,
        object_store.map(|os| os as Arc<dyn ObjectStore>),
        &cfg,
    );
    Harness {
        store,
        chat,
        queue,
        service,
    }
}

pub fn nine_am() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("valid time")
}

/// Seed a UTC user with a 09:00 check-in time.
pub fn seed_user(store: &Store, platform_id: i64, chat_id: i64) -> User {
    store
        .with_tx(|tx| tx.upsert_user(platform_id, chat_id, "UTC", nine_am(), Utc::now()))
        .expect("seed user")
}
