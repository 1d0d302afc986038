/// Conversation controller: the single owner of mutable session state.
///
/// Loads threads and messages, applies optimistic sends, merges real-time
/// re-fetches and keeps read-state consistent. No store call is ever awaited
/// while the state lock is held.
use crate::aggregator;
use crate::badge::{BadgeFeed, BadgePublisher};
use crate::config::Config;
use crate::error::{ErrorKind, InboxError, Result};
use crate::message_store::MessageStore;
use crate::messenger_types::{
    Delivery, DisplayMessage, Message, NewMessage, Thread, ThreadFilter, ThreadKey,
};
use crate::read_state::ReadStateCache;
use crate::realtime::{BridgeHandle, BridgeSettings, BridgeStatus, ChangeListener, RealtimeBridge};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-selection state machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Idle,
    Loading { thread_id: String },
    Loaded { thread_id: String },
    /// Last fetch failed; whatever was loaded before stays visible
    Failed { thread_id: String, error: String },
}

impl Selection {
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Selection::Idle => None,
            Selection::Loading { thread_id }
            | Selection::Loaded { thread_id }
            | Selection::Failed { thread_id, .. } => Some(thread_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub selection: Selection,
    pub threads_error: Option<String>,
    pub bridge: BridgeStatus,
    pub read_state_degraded: bool,
    pub pending_sends: usize,
    pub failed_sends: usize,
}

#[derive(Debug, Clone)]
struct LastProjection {
    body: String,
    at: DateTime<Utc>,
    id: String,
}

impl LastProjection {
    fn of(thread: &Thread) -> Self {
        Self {
            body: thread.last_message.clone(),
            at: thread.last_message_at,
            id: thread.last_message_id.clone(),
        }
    }

    fn apply(&self, thread: &mut Thread) {
        thread.last_message = self.body.clone();
        thread.last_message_at = self.at;
        thread.last_message_id = self.id.clone();
    }
}

/// An optimistic message that the server has not confirmed yet
#[derive(Debug, Clone)]
struct Outgoing {
    display: DisplayMessage,
    /// Thread projection before this send; `None` when the send created the row
    previous: Option<LastProjection>,
}

#[derive(Default)]
struct SessionState {
    threads: Vec<Thread>,
    threads_error: Option<String>,
    selection: Selection,
    generation: u64,
    /// Server copies for the selected thread, ascending
    loaded: Vec<Message>,
    outbox: Vec<Outgoing>,
    /// Confirmed sends no thread-list fetch has reflected yet, by server id
    confirmed: HashMap<String, Message>,
    /// Server ids already matched to one of our sends by id, with their timestamp
    reconciled: HashMap<String, DateTime<Utc>>,
    /// Archived thread -> last message time it was archived at
    archived: HashMap<String, DateTime<Utc>>,
    drafts: HashMap<String, String>,
}

struct Inner {
    user_id: String,
    store: Arc<dyn MessageStore>,
    read_state: ReadStateCache,
    settings: BridgeSettings,
    reconcile_window: chrono::Duration,
    state: Mutex<SessionState>,
    refresh_lock: Mutex<()>,
    badge: BadgePublisher,
    bridge: Mutex<Option<BridgeHandle>>,
}

impl Inner {
    fn publish_badge(&self, state: &SessionState) {
        self.badge.publish(aggregator::unread_total(&state.threads));
    }
}

#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<Inner>,
}

/// Bridge listener that does not keep the controller alive
struct WeakController(Weak<Inner>);

#[async_trait]
impl ChangeListener for WeakController {
    async fn on_change(&self) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        let controller = ConversationController { inner };
        if let Err(e) = controller.on_realtime_event().await {
            warn!("Re-fetch after change event failed: {}", e);
        }
        true
    }
}

fn abs_diff(a: DateTime<Utc>, b: DateTime<Utc>) -> chrono::Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Closest unclaimed server message with the same sender and body
fn closest_twin<'a>(
    loaded: &'a [Message],
    local: &Message,
    claimed: &HashSet<&str>,
    window: chrono::Duration,
) -> Option<&'a Message> {
    loaded
        .iter()
        .filter(|m| {
            m.sender_id == local.sender_id
                && m.body == local.body
                && !claimed.contains(m.id.as_str())
        })
        .map(|m| (m, abs_diff(m.created_at, local.created_at)))
        .filter(|(_, d)| *d <= window)
        .min_by_key(|(_, d)| *d)
        .map(|(m, _)| m)
}

/// Loaded server messages plus local sends for one thread, deduplicated and in
/// `created_at` order. Also returns the temp ids whose server copy showed up.
fn merge_view(
    loaded: &[Message],
    outbox: &[Outgoing],
    thread_id: &str,
    reconciled: &HashMap<String, DateTime<Utc>>,
    window: chrono::Duration,
) -> (Vec<DisplayMessage>, Vec<String>) {
    let mut rows: Vec<DisplayMessage> = loaded
        .iter()
        .map(|m| DisplayMessage {
            message: m.clone(),
            delivery: Delivery::Confirmed {
                server_id: m.id.clone(),
            },
        })
        .collect();
    let mut claimed: HashSet<&str> = reconciled.keys().map(String::as_str).collect();
    let mut resolved = Vec::new();

    for out in outbox.iter().filter(|o| o.display.message.thread_id == thread_id) {
        let local = &out.display.message;
        let twin = match &out.display.delivery {
            Delivery::Confirmed { server_id } => loaded.iter().find(|m| &m.id == server_id),
            Delivery::Pending { .. } | Delivery::Failed { .. } => {
                closest_twin(loaded, local, &claimed, window)
            }
        };
        match twin {
            Some(server) => {
                claimed.insert(server.id.as_str());
                resolved.push(local.id.clone());
            }
            None => rows.push(out.display.clone()),
        }
    }

    rows.sort_by_key(|r| r.message.created_at);
    (rows, resolved)
}

/// Fold a fetch into the loaded page. Messages are never deleted, so anything
/// already loaded stays; read flags only move forward.
fn absorb_fetched(loaded: &mut Vec<Message>, fetched: Vec<Message>) {
    let mut by_id: HashMap<String, Message> =
        loaded.drain(..).map(|m| (m.id.clone(), m)).collect();
    for mut message in fetched {
        if let Some(known) = by_id.get(&message.id) {
            if known.is_read && !message.is_read {
                message.is_read = true;
                message.read_at = known.read_at;
            }
        }
        by_id.insert(message.id.clone(), message);
    }
    loaded.extend(by_id.into_values());
    loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Forget id matches that no local send can still be confused with
fn prune_reconciled(
    reconciled: &mut HashMap<String, DateTime<Utc>>,
    outbox: &[Outgoing],
    window: chrono::Duration,
    now: DateTime<Utc>,
) {
    reconciled.retain(|_, at| {
        *at + window >= now
            || outbox
                .iter()
                .any(|o| abs_diff(o.display.message.created_at, *at) <= window)
    });
}

/// Point a thread row at a freshly sent message, creating the row if needed
fn project_send(threads: &mut Vec<Thread>, msg: &Message) -> Option<LastProjection> {
    let previous = match threads.iter_mut().find(|t| t.id == msg.thread_id) {
        Some(thread) => {
            let previous = LastProjection::of(thread);
            thread.last_message = msg.body.clone();
            thread.last_message_at = msg.created_at;
            thread.last_message_id = msg.id.clone();
            Some(previous)
        }
        None => {
            threads.push(Thread {
                id: msg.thread_id.clone(),
                booking_id: msg.booking_id.clone(),
                property_id: msg.property_id.clone(),
                property_title: String::new(),
                counterparty_id: msg.receiver_id.clone(),
                counterparty_name: String::new(),
                last_message: msg.body.clone(),
                last_message_at: msg.created_at,
                last_message_id: msg.id.clone(),
                unread_count: 0,
            });
            None
        }
    };
    aggregator::sort_threads(threads);
    previous
}

/// Undo `project_send` for a send that will never land
fn restore_projection(threads: &mut Vec<Thread>, out: &Outgoing) {
    let msg = &out.display.message;
    let Some(pos) = threads.iter().position(|t| t.id == msg.thread_id) else {
        return;
    };
    if threads[pos].last_message_id != msg.id {
        return;
    }
    match &out.previous {
        Some(previous) => previous.apply(&mut threads[pos]),
        None => {
            threads.remove(pos);
        }
    }
    aggregator::sort_threads(threads);
}

/// Keep local and confirmed sends visible in a freshly fetched thread list.
/// Confirmed sends the list already reflects are forgotten.
fn overlay_local(
    fresh: &mut Vec<Thread>,
    previous: &[Thread],
    outbox: &[Outgoing],
    confirmed: &mut HashMap<String, Message>,
) {
    confirmed.retain(|_, msg| {
        !fresh
            .iter()
            .any(|t| t.id == msg.thread_id && t.last_message_at >= msg.created_at)
    });

    let local = outbox
        .iter()
        .map(|o| &o.display.message)
        .chain(confirmed.values());
    for msg in local {
        if let Some(thread) = fresh.iter_mut().find(|t| t.id == msg.thread_id) {
            if msg.created_at > thread.last_message_at {
                thread.last_message = msg.body.clone();
                thread.last_message_at = msg.created_at;
                thread.last_message_id = msg.id.clone();
            }
        } else if let Some(prev) = previous.iter().find(|t| t.id == msg.thread_id) {
            fresh.push(prev.clone());
        }
    }
    aggregator::sort_threads(fresh);
}

/// Zero the threads a mark-all-read covered, unless something newer landed
fn clear_marked(threads: &mut [Thread], marked: &[String], at: DateTime<Utc>) {
    for thread in threads.iter_mut().filter(|t| marked.contains(&t.id)) {
        if thread.last_message_at <= at {
            thread.unread_count = 0;
        }
    }
}

impl ConversationController {
    pub fn new(store: Arc<dyn MessageStore>, read_state: ReadStateCache, config: &Config) -> Self {
        let reconcile_window = chrono::Duration::from_std(config.reconcile_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        Self {
            inner: Arc::new(Inner {
                user_id: config.user_id.clone(),
                store,
                read_state,
                settings: BridgeSettings {
                    reconnect_attempts: config.reconnect_attempts,
                    reconnect_backoff: config.reconnect_backoff,
                },
                reconcile_window,
                state: Mutex::new(SessionState::default()),
                refresh_lock: Mutex::new(()),
                badge: BadgePublisher::new(),
                bridge: Mutex::new(None),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Warm read markers, load the thread list and start the event bridge
    pub async fn start(&self) -> Result<()> {
        self.inner.read_state.load_user(&self.inner.user_id).await;
        let loaded = self.refresh_threads().await;
        self.subscribe().await;
        loaded
    }

    pub async fn subscribe(&self) {
        let mut bridge = self.inner.bridge.lock().await;
        if bridge.is_some() {
            return;
        }
        let listener: Arc<dyn ChangeListener> =
            Arc::new(WeakController(Arc::downgrade(&self.inner)));
        *bridge = Some(RealtimeBridge::spawn(
            self.inner.store.clone(),
            self.inner.user_id.clone(),
            listener,
            self.inner.settings,
        ));
        info!("Subscribed to changes for {}", self.inner.user_id);
    }

    /// Tear the event bridge down; once this returns no re-fetch will run
    pub async fn unsubscribe(&self) {
        let handle = self.inner.bridge.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Unsubscribed from changes for {}", self.inner.user_id);
        }
    }

    pub async fn refresh_threads(&self) -> Result<()> {
        let _serial = self.inner.refresh_lock.lock().await;
        self.reload_threads().await
    }

    /// Full re-fetch triggered by the event bridge. Runs are serialized.
    pub async fn on_realtime_event(&self) -> Result<()> {
        let _serial = self.inner.refresh_lock.lock().await;
        let threads = self.reload_threads().await;

        let open = {
            let state = self.inner.state.lock().await;
            state
                .selection
                .thread_id()
                .map(|id| (id.to_string(), state.generation))
        };
        if let Some((thread_id, generation)) = open {
            match self.load_messages(&thread_id, generation).await {
                Ok(_) | Err(InboxError::Superseded { .. }) => {}
                Err(e) => return threads.and(Err(e)),
            }
        }
        threads
    }

    async fn reload_threads(&self) -> Result<()> {
        let inner = &self.inner;
        let summaries = match inner.store.list_threads_for_user(&inner.user_id).await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!("Thread list refresh failed, keeping last known list: {}", e);
                inner.state.lock().await.threads_error = Some(e.to_string());
                return Err(e);
            }
        };

        let open = inner
            .state
            .lock()
            .await
            .selection
            .thread_id()
            .map(str::to_string);
        let mut snapshot = inner.read_state.snapshot(&inner.user_id).await;

        // Whatever lands in the open thread is read on arrival
        if let Some(open) = &open {
            if let Some(summary) = summaries.iter().find(|s| &s.thread_id == open) {
                if aggregator::unread_count(&summary.unread_at, snapshot.last_read_at(open)) > 0 {
                    let at = self.acknowledge(open, summary.last_message_at).await;
                    snapshot.set(open.clone(), at);
                }
            }
        }

        let mut fresh = aggregator::aggregate(summaries, &snapshot);

        let mut state = inner.state.lock().await;
        let SessionState {
            threads,
            outbox,
            confirmed,
            archived,
            ..
        } = &mut *state;
        overlay_local(&mut fresh, threads, outbox, confirmed);

        fresh.retain(|t| match archived.get(&t.id) {
            Some(cutoff) if t.last_message_at <= *cutoff => false,
            Some(_) => {
                archived.remove(&t.id);
                true
            }
            None => true,
        });

        debug!("Thread list refreshed: {} threads", fresh.len());
        state.threads = fresh;
        state.threads_error = None;
        inner.publish_badge(&state);
        Ok(())
    }

    /// Mark a thread read locally up to `max(now, up_to)` and tell the server, best-effort
    async fn acknowledge(&self, thread_id: &str, up_to: DateTime<Utc>) -> DateTime<Utc> {
        let at = Utc::now().max(up_to);
        let at = self
            .inner
            .read_state
            .mark_thread_read_at(&self.inner.user_id, thread_id, at)
            .await;
        self.spawn_server_mark(thread_id.to_string());
        at
    }

    fn spawn_server_mark(&self, thread_id: String) {
        let store = self.inner.store.clone();
        let user_id = self.inner.user_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.mark_messages_read(&thread_id, &user_id).await {
                warn!("Best-effort mark-read for {} failed: {}", thread_id, e);
            }
        });
    }

    /// Open a thread. Its unread count drops to zero before the fetch resolves.
    pub async fn select_thread(&self, thread_id: &str) -> Result<Vec<DisplayMessage>> {
        let key = ThreadKey::parse(thread_id)?;
        if !key.involves(&self.inner.user_id) {
            return Err(InboxError::Authorization(
                "this conversation is not accessible".to_string(),
            ));
        }

        let unread_up_to = {
            let state = self.inner.state.lock().await;
            state
                .threads
                .iter()
                .find(|t| t.id == thread_id && t.unread_count > 0)
                .map(|t| t.last_message_at)
        };
        if let Some(up_to) = unread_up_to {
            self.acknowledge(thread_id, up_to).await;
        }

        let generation = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            if state.selection.thread_id() != Some(thread_id) {
                state.loaded.clear();
            }
            state.selection = Selection::Loading {
                thread_id: thread_id.to_string(),
            };
            if unread_up_to.is_some() {
                if let Some(thread) = state.threads.iter_mut().find(|t| t.id == thread_id) {
                    thread.unread_count = 0;
                }
                self.inner.publish_badge(&state);
            }
            state.generation
        };

        debug!("Selected thread {}", thread_id);
        self.load_messages(thread_id, generation).await
    }

    pub async fn deselect(&self) {
        let mut state = self.inner.state.lock().await;
        state.generation += 1;
        state.selection = Selection::Idle;
        state.loaded.clear();
    }

    /// Fetch messages for `thread_id`, dropping the result if the selection moved on
    async fn load_messages(&self, thread_id: &str, generation: u64) -> Result<Vec<DisplayMessage>> {
        let inner = &self.inner;
        let result = inner.store.list_messages(thread_id, &inner.user_id).await;

        let newest_unread = {
            let mut state = inner.state.lock().await;
            if state.generation != generation || state.selection.thread_id() != Some(thread_id) {
                debug!("Discarding messages for {}: selection moved on", thread_id);
                return Err(InboxError::Superseded {
                    thread_id: thread_id.to_string(),
                });
            }

            let messages = match result {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Loading messages for {} failed: {}", thread_id, e);
                    state.selection = Selection::Failed {
                        thread_id: thread_id.to_string(),
                        error: e.to_string(),
                    };
                    return Err(e);
                }
            };
            absorb_fetched(&mut state.loaded, messages);

            let (_, resolved) = merge_view(
                &state.loaded,
                &state.outbox,
                thread_id,
                &state.reconciled,
                inner.reconcile_window,
            );
            if !resolved.is_empty() {
                debug!("Server copies found for {} local sends", resolved.len());
                state
                    .outbox
                    .retain(|o| !resolved.contains(&o.display.message.id));
            }
            let SessionState { reconciled, outbox, .. } = &mut *state;
            prune_reconciled(reconciled, outbox, inner.reconcile_window, Utc::now());
            state.selection = Selection::Loaded {
                thread_id: thread_id.to_string(),
            };

            let newest = state
                .loaded
                .iter()
                .filter(|m| m.receiver_id == inner.user_id && !m.is_read)
                .map(|m| m.created_at)
                .max();
            newest
        };

        let mut marker = inner.read_state.last_read_at(&inner.user_id, thread_id).await;
        if let Some(newest) = newest_unread {
            if marker.map_or(true, |m| newest > m) {
                marker = Some(self.acknowledge(thread_id, newest).await);
            }
        }

        let mut state = inner.state.lock().await;
        if state.generation == generation {
            let SessionState { loaded, threads, .. } = &mut *state;
            let count = aggregator::unread_in_messages(&inner.user_id, loaded, marker);
            if let Some(thread) = threads.iter_mut().find(|t| t.id == thread_id) {
                thread.unread_count = count;
            }
            inner.publish_badge(&state);
        }
        let (view, _) = merge_view(
            &state.loaded,
            &state.outbox,
            thread_id,
            &state.reconciled,
            inner.reconcile_window,
        );
        Ok(view)
    }

    /// Send `body` into `thread_id`. The message is visible before the store is called.
    pub async fn send_message(&self, thread_id: &str, body: &str) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(InboxError::Validation("message body is empty".to_string()));
        }
        let key = ThreadKey::parse(thread_id)?;
        let receiver_id = key
            .counterparty(&self.inner.user_id)
            .ok_or_else(|| {
                InboxError::Authorization("this conversation is not accessible".to_string())
            })?
            .to_string();

        let temp_id = format!("tmp-{}", Uuid::new_v4());
        let optimistic = Message {
            id: temp_id.clone(),
            thread_id: thread_id.to_string(),
            booking_id: key.booking_id.clone(),
            property_id: key.property_id.clone(),
            sender_id: self.inner.user_id.clone(),
            receiver_id,
            body: body.to_string(),
            created_at: Utc::now(),
            is_read: false,
            read_at: None,
        };

        {
            let mut state = self.inner.state.lock().await;
            let previous = project_send(&mut state.threads, &optimistic);
            state.outbox.push(Outgoing {
                display: DisplayMessage {
                    message: optimistic.clone(),
                    delivery: Delivery::Pending { temp_id },
                },
                previous,
            });
            state.drafts.remove(thread_id);
            self.inner.publish_badge(&state);
        }

        self.deliver(optimistic).await
    }

    async fn deliver(&self, optimistic: Message) -> Result<Message> {
        let inner = &self.inner;
        let temp_id = optimistic.id.clone();
        let request = NewMessage {
            booking_id: optimistic.booking_id,
            property_id: optimistic.property_id,
            receiver_id: optimistic.receiver_id,
            body: optimistic.body,
        };

        let err = match inner.store.insert_message(&inner.user_id, request).await {
            Ok(server) => {
                self.confirm(&temp_id, &server).await;
                debug!("Send {} confirmed as {}", temp_id, server.id);
                return Ok(server);
            }
            Err(e) => e,
        };

        let mut state = inner.state.lock().await;
        let pos = state
            .outbox
            .iter()
            .position(|o| o.display.message.id == temp_id);
        match err.kind() {
            ErrorKind::Transient => {
                warn!("Send {} failed, kept for retry: {}", temp_id, err);
                if let Some(pos) = pos {
                    state.outbox[pos].display.delivery = Delivery::Failed {
                        temp_id: temp_id.clone(),
                        reason: err.to_string(),
                    };
                }
            }
            ErrorKind::Validation | ErrorKind::Authorization | ErrorKind::Superseded => {
                warn!("Send {} rejected: {}", temp_id, err);
                if let Some(pos) = pos {
                    let out = state.outbox.remove(pos);
                    restore_projection(&mut state.threads, &out);
                }
            }
        }
        inner.publish_badge(&state);
        Err(err)
    }

    /// Swap the optimistic copy for the server copy in place
    async fn confirm(&self, temp_id: &str, server: &Message) {
        let mut state = self.inner.state.lock().await;
        state.outbox.retain(|o| o.display.message.id != temp_id);
        state.confirmed.insert(server.id.clone(), server.clone());
        let SessionState { reconciled, outbox, .. } = &mut *state;
        reconciled.insert(server.id.clone(), server.created_at);
        prune_reconciled(reconciled, outbox, self.inner.reconcile_window, Utc::now());

        let open = state.selection.thread_id() == Some(server.thread_id.as_str());
        if open && !state.loaded.iter().any(|m| m.id == server.id) {
            let pos = state
                .loaded
                .partition_point(|m| m.created_at <= server.created_at);
            state.loaded.insert(pos, server.clone());
        }

        if let Some(thread) = state.threads.iter_mut().find(|t| t.id == server.thread_id) {
            if thread.last_message_id == temp_id {
                thread.last_message = server.body.clone();
                thread.last_message_at = server.created_at;
                thread.last_message_id = server.id.clone();
            }
        }
        aggregator::sort_threads(&mut state.threads);
    }

    /// Re-issue a failed send. Only ever triggered by the user.
    pub async fn retry_send(&self, temp_id: &str) -> Result<Message> {
        let optimistic = {
            let mut state = self.inner.state.lock().await;
            let out = state
                .outbox
                .iter_mut()
                .find(|o| o.display.message.id == temp_id)
                .ok_or_else(|| InboxError::Validation(format!("no outgoing message {}", temp_id)))?;
            if !matches!(out.display.delivery, Delivery::Failed { .. }) {
                return Err(InboxError::Validation(format!(
                    "message {} has not failed",
                    temp_id
                )));
            }
            out.display.delivery = Delivery::Pending {
                temp_id: temp_id.to_string(),
            };
            out.display.message.clone()
        };
        info!("Retrying send {}", temp_id);
        self.deliver(optimistic).await
    }

    /// Drop a failed send from the view
    pub async fn discard_failed(&self, temp_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .outbox
            .iter()
            .position(|o| {
                o.display.message.id == temp_id
                    && matches!(o.display.delivery, Delivery::Failed { .. })
            })
            .ok_or_else(|| InboxError::Validation(format!("no failed message {}", temp_id)))?;
        let out = state.outbox.remove(pos);
        restore_projection(&mut state.threads, &out);
        self.inner.publish_badge(&state);
        Ok(())
    }

    /// Mark every listed thread read. Counts drop to zero in one update.
    /// Returns how many threads had unread messages.
    pub async fn mark_all_read(&self) -> usize {
        let (all, unread): (Vec<String>, Vec<String>) = {
            let state = self.inner.state.lock().await;
            (
                state.threads.iter().map(|t| t.id.clone()).collect(),
                state
                    .threads
                    .iter()
                    .filter(|t| t.unread_count > 0)
                    .map(|t| t.id.clone())
                    .collect(),
            )
        };
        if all.is_empty() {
            return 0;
        }

        let at = self
            .inner
            .read_state
            .mark_all_read(&self.inner.user_id, &all)
            .await;

        {
            let mut state = self.inner.state.lock().await;
            clear_marked(&mut state.threads, &all, at);
            self.inner.publish_badge(&state);
        }

        for thread_id in &unread {
            self.spawn_server_mark(thread_id.clone());
        }
        info!("Marked {} threads read", unread.len());
        unread.len()
    }

    /// Hide a thread until a newer message arrives in it
    pub async fn archive_thread(&self, thread_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let pos = state
            .threads
            .iter()
            .position(|t| t.id == thread_id)
            .ok_or_else(|| InboxError::Validation(format!("unknown thread {}", thread_id)))?;
        let thread = state.threads.remove(pos);
        state.archived.insert(thread.id, thread.last_message_at);

        if state.selection.thread_id() == Some(thread_id) {
            state.generation += 1;
            state.selection = Selection::Idle;
            state.loaded.clear();
        }
        self.inner.publish_badge(&state);
        Ok(())
    }

    pub async fn set_draft(&self, thread_id: &str, text: &str) {
        let mut state = self.inner.state.lock().await;
        if text.is_empty() {
            state.drafts.remove(thread_id);
        } else {
            state.drafts.insert(thread_id.to_string(), text.to_string());
        }
    }

    pub async fn draft(&self, thread_id: &str) -> String {
        let state = self.inner.state.lock().await;
        state.drafts.get(thread_id).cloned().unwrap_or_default()
    }

    pub async fn threads(&self, filter: &ThreadFilter) -> Vec<Thread> {
        let state = self.inner.state.lock().await;
        aggregator::filter_threads(&state.threads, filter)
    }

    pub async fn thread(&self, thread_id: &str) -> Option<Thread> {
        let state = self.inner.state.lock().await;
        state.threads.iter().find(|t| t.id == thread_id).cloned()
    }

    /// The open thread as it should be displayed
    pub async fn messages(&self) -> Vec<DisplayMessage> {
        let state = self.inner.state.lock().await;
        match state.selection.thread_id() {
            Some(thread_id) => {
                merge_view(
                    &state.loaded,
                    &state.outbox,
                    thread_id,
                    &state.reconciled,
                    self.inner.reconcile_window,
                )
                .0
            }
            None => Vec::new(),
        }
    }

    /// Pending and failed sends across all threads
    pub async fn outbox(&self) -> Vec<DisplayMessage> {
        let state = self.inner.state.lock().await;
        state.outbox.iter().map(|o| o.display.clone()).collect()
    }

    pub async fn unread_total(&self) -> u32 {
        self.inner.badge.current()
    }

    /// Store-side unread count, without the local read markers
    pub async fn server_unread_total(&self) -> Result<u32> {
        self.inner.store.count_unread(&self.inner.user_id).await
    }

    pub fn badge(&self) -> BadgeFeed {
        self.inner.badge.subscribe()
    }

    pub async fn status(&self) -> ControllerStatus {
        let bridge = self
            .inner
            .bridge
            .lock()
            .await
            .as_ref()
            .map(BridgeHandle::status)
            .unwrap_or(BridgeStatus::Stopped);
        let state = self.inner.state.lock().await;
        let failed_sends = state
            .outbox
            .iter()
            .filter(|o| matches!(o.display.delivery, Delivery::Failed { .. }))
            .count();
        ControllerStatus {
            selection: state.selection.clone(),
            threads_error: state.threads_error.clone(),
            bridge,
            read_state_degraded: self.inner.read_state.is_degraded(),
            pending_sends: state.outbox.len() - failed_sends,
            failed_sends,
        }
    }
}
