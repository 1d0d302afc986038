/// Notification badge feed: read-only projection of the unread total for headers
use tokio::sync::watch;

/// Publishing half, owned by the conversation controller
pub(crate) struct BadgePublisher {
    tx: watch::Sender<u32>,
}

impl BadgePublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Push a new total; subscribers only wake when it actually changed
    pub(crate) fn publish(&self, total: u32) {
        self.tx.send_if_modified(|current| {
            if *current == total {
                false
            } else {
                *current = total;
                true
            }
        });
    }

    pub(crate) fn current(&self) -> u32 {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> BadgeFeed {
        BadgeFeed {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cheap, cloneable view of the unread total
#[derive(Clone)]
pub struct BadgeFeed {
    rx: watch::Receiver<u32>,
}

impl BadgeFeed {
    pub fn current(&self) -> u32 {
        *self.rx.borrow()
    }

    /// Wait for the next change; `None` once the controller is gone
    pub async fn changed(&mut self) -> Option<u32> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
