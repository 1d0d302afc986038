/// Message persistence: conversation history stored in sled DB
///
/// The conversation layer only talks to storage through [`MessageStore`], so the
/// hosted backend, the embedded sled store and test doubles are interchangeable.
use crate::booking_store::{Booking, BookingStore};
use crate::error::{InboxError, Result};
use crate::messenger_types::{ChangeEvent, Message, NewMessage, ThreadKey, ThreadSummary};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Storage collaborator consumed by the conversation controller
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// One summary per thread involving `user_id`, unsorted
    async fn list_threads_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>>;

    /// Messages of a thread, oldest first, restricted to those `user_id` sent or received
    async fn list_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<Message>>;

    /// Persist a message from `sender_id`
    async fn insert_message(&self, sender_id: &str, message: NewMessage) -> Result<Message>;

    /// Flip the server read flag on every message of the thread addressed to `user_id`.
    /// Returns how many messages changed.
    async fn mark_messages_read(&self, thread_id: &str, user_id: &str) -> Result<u32>;

    /// Unread messages addressed to `user_id` across all threads
    async fn count_unread(&self, user_id: &str) -> Result<u32>;

    /// Change feed scoped to messages addressed to `user_id`
    fn subscribe(&self, user_id: &str) -> Result<Subscription>;
}

/// What a subscription yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Change(ChangeEvent),
    /// The receiver fell behind and `n` events were dropped
    Missed(u64),
}

/// Live change subscription for one user. Dropping it unsubscribes.
pub struct Subscription {
    user_id: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(user_id: impl Into<String>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            user_id: user_id.into(),
            rx,
        }
    }

    /// Next signal for this user; `None` once the feed has closed
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.receiver_id() == self.user_id => {
                    return Some(FeedSignal::Change(event))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Some(FeedSignal::Missed(n)),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn thread_prefix(thread_id: &str) -> Vec<u8> {
    let mut prefix = thread_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn message_key(msg: &Message) -> Vec<u8> {
    let micros = msg.created_at.timestamp_micros().max(0) as u64;
    let mut key = thread_prefix(&msg.thread_id);
    key.extend_from_slice(format!("{:020}", micros).as_bytes());
    key.push(0);
    key.extend_from_slice(msg.id.as_bytes());
    key
}

/// Message store backed by sled embedded database
#[derive(Clone)]
pub struct SledMessageStore {
    messages: sled::Tree,
    bookings: BookingStore,
    events: broadcast::Sender<ChangeEvent>,
    write_lock: Arc<Mutex<()>>,
}

impl SledMessageStore {
    /// Open (or create) the store in the given data directory
    pub fn new(data_dir: &Path, event_buffer: usize) -> Result<Self> {
        let db_path = data_dir.join("messages.db");
        let db = sled::open(&db_path)
            .map_err(|e| InboxError::Storage(format!("Failed to open messages DB: {}", e)))?;
        info!("Message store initialized at {:?}", db_path);
        Self::from_db(db, event_buffer)
    }

    /// Throwaway in-memory store
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| InboxError::Storage(format!("Failed to open temporary DB: {}", e)))?;
        Self::from_db(db, 256)
    }

    fn from_db(db: sled::Db, event_buffer: usize) -> Result<Self> {
        let messages = db
            .open_tree("messages")
            .map_err(|e| InboxError::Storage(format!("messages tree: {}", e)))?;
        let bookings = BookingStore::new(&db)?;
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Ok(Self {
            messages,
            bookings,
            events,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn bookings(&self) -> &BookingStore {
        &self.bookings
    }

    pub fn add_booking(&self, booking: &Booking) -> Result<()> {
        self.bookings.upsert(booking)
    }

    fn scan_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(thread_prefix(thread_id)) {
            let (_, value) =
                entry.map_err(|e| InboxError::Storage(format!("Failed to scan thread: {}", e)))?;
            out.push(serde_json::from_slice::<Message>(&value)?);
        }
        Ok(out)
    }

    fn last_in_thread(&self, thread_id: &str) -> Result<Option<Message>> {
        match self.messages.scan_prefix(thread_prefix(thread_id)).next_back() {
            Some(entry) => {
                let (_, value) = entry
                    .map_err(|e| InboxError::Storage(format!("Failed to read thread tail: {}", e)))?;
                Ok(Some(serde_json::from_slice::<Message>(&value)?))
            }
            None => Ok(None),
        }
    }

    fn write(&self, msg: &Message) -> Result<()> {
        let value = serde_json::to_vec(msg).map_err(InboxError::Serialization)?;
        self.messages
            .insert(message_key(msg), value)
            .map_err(|e| InboxError::Storage(format!("Failed to save message: {}", e)))?;
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn authorize(key: &ThreadKey, user_id: &str) -> Result<()> {
        if key.involves(user_id) {
            Ok(())
        } else {
            Err(InboxError::Authorization(format!(
                "{} is not a participant of this conversation",
                user_id
            )))
        }
    }
}

#[async_trait]
impl MessageStore for SledMessageStore {
    async fn list_threads_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>> {
        let mut summaries = Vec::new();

        for booking in self.bookings.for_user(user_id)? {
            for other in booking.participants.iter().filter(|p| p.user_id != user_id) {
                let key = ThreadKey::new(
                    &booking.booking_id,
                    &booking.property_id,
                    user_id,
                    &other.user_id,
                );
                let thread_id = key.to_string();
                let messages = self.scan_thread(&thread_id)?;
                let Some(last) = messages.last() else {
                    continue;
                };

                let unread_at: Vec<DateTime<Utc>> = messages
                    .iter()
                    .filter(|m| m.receiver_id == user_id && !m.is_read)
                    .map(|m| m.created_at)
                    .collect();

                summaries.push(ThreadSummary {
                    thread_id,
                    booking_id: booking.booking_id.clone(),
                    property_id: booking.property_id.clone(),
                    property_title: booking.property_title.clone(),
                    counterparty_id: other.user_id.clone(),
                    counterparty_name: other.display_name.clone(),
                    last_message: last.body.clone(),
                    last_message_at: last.created_at,
                    last_message_id: last.id.clone(),
                    unread_at,
                });
            }
        }

        debug!("Listed {} threads for {}", summaries.len(), user_id);
        Ok(summaries)
    }

    async fn list_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<Message>> {
        let key = ThreadKey::parse(thread_id)?;
        Self::authorize(&key, user_id)?;

        let messages = self
            .scan_thread(thread_id)?
            .into_iter()
            .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
            .collect();
        Ok(messages)
    }

    async fn insert_message(&self, sender_id: &str, message: NewMessage) -> Result<Message> {
        if message.body.trim().is_empty() {
            return Err(InboxError::Validation("message body is empty".to_string()));
        }

        let booking = self.bookings.get(&message.booking_id)?.ok_or_else(|| {
            InboxError::Authorization(format!("unknown booking {}", message.booking_id))
        })?;
        if booking.property_id != message.property_id {
            return Err(InboxError::Validation(format!(
                "booking {} is not for property {}",
                booking.booking_id, message.property_id
            )));
        }
        if sender_id == message.receiver_id
            || !booking.is_party(sender_id)
            || !booking.is_party(&message.receiver_id)
        {
            return Err(InboxError::Authorization(format!(
                "{} and {} are not both parties to booking {}",
                sender_id, message.receiver_id, booking.booking_id
            )));
        }

        let key = ThreadKey::new(
            &message.booking_id,
            &message.property_id,
            sender_id,
            &message.receiver_id,
        );
        let thread_id = key.to_string();

        let _guard = self.write_lock.lock().await;

        // Keep timestamp order identical to insertion order within a thread
        let mut created_at = Utc::now();
        if let Some(last) = self.last_in_thread(&thread_id)? {
            if created_at <= last.created_at {
                created_at = last.created_at + Duration::microseconds(1);
            }
        }

        let stored = Message {
            id: Uuid::new_v4().to_string(),
            thread_id,
            booking_id: message.booking_id,
            property_id: message.property_id,
            sender_id: sender_id.to_string(),
            receiver_id: message.receiver_id,
            body: message.body,
            created_at,
            is_read: false,
            read_at: None,
        };
        self.write(&stored)?;

        debug!("Stored message {} in {}", stored.id, stored.thread_id);
        self.publish(ChangeEvent::Inserted {
            receiver_id: stored.receiver_id.clone(),
        });
        Ok(stored)
    }

    async fn mark_messages_read(&self, thread_id: &str, user_id: &str) -> Result<u32> {
        let key = ThreadKey::parse(thread_id)?;
        Self::authorize(&key, user_id)?;

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut changed = 0u32;

        for mut msg in self.scan_thread(thread_id)? {
            if msg.receiver_id == user_id && !msg.is_read {
                msg.is_read = true;
                msg.read_at = Some(now);
                self.write(&msg)?;
                changed += 1;
            }
        }

        if changed > 0 {
            debug!("Marked {} messages read in {}", changed, thread_id);
            self.publish(ChangeEvent::Updated {
                receiver_id: user_id.to_string(),
            });
        }
        Ok(changed)
    }

    async fn count_unread(&self, user_id: &str) -> Result<u32> {
        let threads = self.list_threads_for_user(user_id).await?;
        Ok(threads.iter().map(|t| t.unread_at.len() as u32).sum())
    }

    fn subscribe(&self, user_id: &str) -> Result<Subscription> {
        Ok(Subscription::new(user_id, self.events.subscribe()))
    }
}
