//! Shared fixtures: a scripted store wrapping the sled store, plus helpers
#![allow(dead_code)]

use async_trait::async_trait;
use inbox_core::message_store::{MessageStore, Subscription};
use inbox_core::messenger_types::{ChangeEvent, Message, NewMessage, ThreadKey, ThreadSummary};
use inbox_core::{Booking, Config, InboxError, Participant, Result, SledMessageStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

pub const GUEST: &str = "guest";
pub const HOST: &str = "host";

/// What the next insert does instead of succeeding normally
pub enum InsertScript {
    Fail(InboxError),
    /// Persist the message but report a transport failure
    DropResponse,
}

/// Sled store with knobs for failures, delays and a controllable change feed
pub struct ScriptedStore {
    pub inner: SledMessageStore,
    feed: Mutex<broadcast::Sender<ChangeEvent>>,
    next_insert: Mutex<Option<InsertScript>>,
    insert_delay: Mutex<Duration>,
    threads_delay: Mutex<Duration>,
    message_delays: Mutex<HashMap<String, Duration>>,
    pub fail_threads: AtomicBool,
    pub fail_messages: AtomicBool,
    /// Answer list calls from a read taken before the delay
    pub read_before_delay: AtomicBool,
    /// Number of upcoming subscribe calls that fail
    pub fail_subscribes: AtomicU32,
    pub list_threads_calls: AtomicUsize,
    pub list_messages_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
    pub mark_read_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            inner: SledMessageStore::temporary().unwrap(),
            feed: Mutex::new(feed),
            next_insert: Mutex::new(None),
            insert_delay: Mutex::new(Duration::ZERO),
            threads_delay: Mutex::new(Duration::ZERO),
            message_delays: Mutex::new(HashMap::new()),
            fail_threads: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
            read_before_delay: AtomicBool::new(false),
            fail_subscribes: AtomicU32::new(0),
            list_threads_calls: AtomicUsize::new(0),
            list_messages_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            mark_read_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn script_next_insert(&self, script: InsertScript) {
        *self.next_insert.lock().unwrap() = Some(script);
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = delay;
    }

    pub fn set_threads_delay(&self, delay: Duration) {
        *self.threads_delay.lock().unwrap() = delay;
    }

    pub fn set_messages_delay(&self, thread_id: &str, delay: Duration) {
        self.message_delays
            .lock()
            .unwrap()
            .insert(thread_id.to_string(), delay);
    }

    /// Push an event straight onto the feed
    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.feed.lock().unwrap().send(event);
    }

    /// Close every live subscription
    pub fn close_feed(&self) {
        let (fresh, _) = broadcast::channel(64);
        *self.feed.lock().unwrap() = fresh;
    }

    /// Subscriptions currently attached to the feed
    pub fn live_subscriptions(&self) -> usize {
        self.feed.lock().unwrap().receiver_count()
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for ScriptedStore {
    async fn list_threads_for_user(&self, user_id: &str) -> Result<Vec<ThreadSummary>> {
        self.list_threads_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.threads_delay.lock().unwrap();
        if self.read_before_delay.load(Ordering::SeqCst) {
            let snapshot = self.inner.list_threads_for_user(user_id).await;
            sleep(delay).await;
            return snapshot;
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.fail_threads.load(Ordering::SeqCst) {
            return Err(InboxError::Transient("thread list unavailable".into()));
        }
        self.inner.list_threads_for_user(user_id).await
    }

    async fn list_messages(&self, thread_id: &str, user_id: &str) -> Result<Vec<Message>> {
        self.list_messages_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.message_delays.lock().unwrap().get(thread_id).copied();
        if self.read_before_delay.load(Ordering::SeqCst) {
            let snapshot = self.inner.list_messages(thread_id, user_id).await;
            sleep(delay.unwrap_or_default()).await;
            return snapshot;
        }
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(InboxError::Transient("messages unavailable".into()));
        }
        self.inner.list_messages(thread_id, user_id).await
    }

    async fn insert_message(&self, sender_id: &str, message: NewMessage) -> Result<Message> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.insert_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let script = self.next_insert.lock().unwrap().take();
        match script {
            Some(InsertScript::Fail(e)) => Err(e),
            Some(InsertScript::DropResponse) => {
                let stored = self.inner.insert_message(sender_id, message).await?;
                self.emit(ChangeEvent::Inserted {
                    receiver_id: stored.receiver_id.clone(),
                });
                Err(InboxError::Transient("connection reset before response".into()))
            }
            None => {
                let stored = self.inner.insert_message(sender_id, message).await?;
                self.emit(ChangeEvent::Inserted {
                    receiver_id: stored.receiver_id.clone(),
                });
                Ok(stored)
            }
        }
    }

    async fn mark_messages_read(&self, thread_id: &str, user_id: &str) -> Result<u32> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        let changed = self.inner.mark_messages_read(thread_id, user_id).await?;
        if changed > 0 {
            self.emit(ChangeEvent::Updated {
                receiver_id: user_id.to_string(),
            });
        }
        Ok(changed)
    }

    async fn count_unread(&self, user_id: &str) -> Result<u32> {
        self.inner.count_unread(user_id).await
    }

    fn subscribe(&self, user_id: &str) -> Result<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(InboxError::Transient("realtime channel refused".into()));
        }
        Ok(Subscription::new(
            user_id,
            self.feed.lock().unwrap().subscribe(),
        ))
    }
}

pub fn booking(booking_id: &str, property_id: &str, title: &str) -> Booking {
    Booking {
        booking_id: booking_id.to_string(),
        property_id: property_id.to_string(),
        property_title: title.to_string(),
        participants: vec![
            Participant::new(GUEST, "Gina Guest"),
            Participant::new(HOST, "Hank Host"),
        ],
    }
}

pub fn seed_booking(store: &ScriptedStore, booking_id: &str, property_id: &str, title: &str) -> String {
    store
        .inner
        .add_booking(&booking(booking_id, property_id, title))
        .unwrap();
    ThreadKey::new(booking_id, property_id, GUEST, HOST).to_string()
}

pub fn new_message(thread_id: &str, receiver: &str, body: &str) -> NewMessage {
    let key = ThreadKey::parse(thread_id).unwrap();
    NewMessage {
        booking_id: key.booking_id,
        property_id: key.property_id,
        receiver_id: receiver.to_string(),
        body: body.to_string(),
    }
}

/// Host writes to the guest, bypassing any controller
pub async fn host_says(store: &ScriptedStore, thread_id: &str, body: &str) -> Message {
    store
        .insert_message(HOST, new_message(thread_id, GUEST, body))
        .await
        .unwrap()
}

pub fn test_config(user_id: &str) -> Config {
    let mut config = Config::for_user(user_id);
    config.reconnect_attempts = 2;
    config.reconnect_backoff = Duration::from_millis(10);
    config
}

/// Poll `check` against `subject` until it returns true or `limit` passes
pub async fn wait_for<'a, T, F, Fut>(limit: Duration, subject: &'a T, mut check: F) -> bool
where
    T: ?Sized,
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = bool> + 'a,
{
    let deadline = Instant::now() + limit;
    loop {
        if check(subject).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
