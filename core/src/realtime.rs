/// Real-time event bridge
///
/// Holds the store's change subscription for the session and turns every
/// change into a request for a full re-fetch. Requests that arrive while a
/// re-fetch is running collapse into a single follow-up run.
use crate::message_store::{FeedSignal, MessageStore, Subscription};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Whatever re-derives state when the bridge fires
#[async_trait]
pub trait ChangeListener: Send + Sync {
    /// Re-fetch. Returns false once the listener is gone and the bridge should stop.
    async fn on_change(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BridgeStatus {
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up resubscribing; the last fetched state stays on screen
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

/// Exponential backoff with up to 50% jitter
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = (capped.as_millis() / 2) as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    capped + Duration::from_millis(jitter)
}

/// Running bridge. Dropping it tears the subscription down as well.
pub struct BridgeHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<BridgeStatus>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    /// Stop both tasks and wait for them, so nothing is delivered afterwards
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!("Realtime bridge stopped");
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct RealtimeBridge;

impl RealtimeBridge {
    /// Subscribe for `user_id` and start delivering change signals to `listener`.
    /// The first subscription is taken before this returns.
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        user_id: String,
        listener: Arc<dyn ChangeListener>,
        settings: BridgeSettings,
    ) -> BridgeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(BridgeStatus::Connected);
        let pending = Arc::new(Notify::new());
        let initial = match store.subscribe(&user_id) {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!("Change feed subscribe failed for {}: {}", user_id, e);
                None
            }
        };

        let listen_handle = {
            let pending = pending.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                run_listener(store, user_id, initial, pending, status_tx, shutdown, settings).await
            })
        };

        let refetch_handle = {
            let shutdown = shutdown_rx;
            tokio::spawn(async move { run_refetcher(listener, pending, shutdown).await })
        };

        BridgeHandle {
            shutdown: shutdown_tx,
            status: status_rx,
            tasks: vec![listen_handle, refetch_handle],
        }
    }
}

/// Resubscribe with backoff. `None` means give up (or shutdown was requested).
async fn reconnect(
    store: &Arc<dyn MessageStore>,
    user_id: &str,
    status: &watch::Sender<BridgeStatus>,
    shutdown: &mut watch::Receiver<bool>,
    settings: BridgeSettings,
) -> Option<Subscription> {
    for attempt in 1..=settings.reconnect_attempts {
        let _ = status.send(BridgeStatus::Reconnecting { attempt });
        let delay = backoff_delay(settings.reconnect_backoff, attempt);
        debug!("Resubscribing in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = sleep(delay) => {}
        }

        match store.subscribe(user_id) {
            Ok(sub) => {
                info!("Change feed resubscribed for {} after {} attempt(s)", user_id, attempt);
                return Some(sub);
            }
            Err(e) => warn!("Resubscribe attempt {} failed: {}", attempt, e),
        }
    }
    None
}

async fn run_listener(
    store: Arc<dyn MessageStore>,
    user_id: String,
    mut subscription: Option<Subscription>,
    pending: Arc<Notify>,
    status: watch::Sender<BridgeStatus>,
    mut shutdown: watch::Receiver<bool>,
    settings: BridgeSettings,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(sub) = subscription.as_mut() else {
            match reconnect(&store, &user_id, &status, &mut shutdown, settings).await {
                Some(sub) => {
                    subscription = Some(sub);
                    let _ = status.send(BridgeStatus::Connected);
                    // Anything published while we were away is only visible through a re-fetch
                    pending.notify_one();
                    continue;
                }
                None => {
                    if !*shutdown.borrow() {
                        warn!("Change feed for {} degraded; showing last fetched state", user_id);
                        let _ = status.send(BridgeStatus::Degraded);
                        // Park until teardown so status stays observable
                        let _ = shutdown.changed().await;
                    }
                    break;
                }
            }
        };

        let signal = tokio::select! {
            _ = shutdown.changed() => break,
            signal = sub.recv() => signal,
        };

        match signal {
            Some(FeedSignal::Change(event)) => {
                debug!("Change event for {}: {:?}", user_id, event);
                pending.notify_one();
            }
            Some(FeedSignal::Missed(n)) => {
                warn!("Change feed lagged {} events; forcing re-fetch", n);
                pending.notify_one();
            }
            None => {
                warn!("Change feed closed for {}", user_id);
                subscription = None;
            }
        }
    }

    // Drop the subscription before reporting stopped
    drop(subscription);
    let _ = status.send(BridgeStatus::Stopped);
}

async fn run_refetcher(
    listener: Arc<dyn ChangeListener>,
    pending: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = pending.notified() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if !listener.on_change().await {
            debug!("Change listener gone; stopping re-fetch worker");
            break;
        }
    }
}
