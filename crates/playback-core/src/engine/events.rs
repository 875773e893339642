use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::EngineEvent;

#[derive(Debug, Default)]
struct HubInner {
    subscribers: DashMap<u64, mpsc::UnboundedSender<EngineEvent>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. On a closed hub the subscription is already
    /// exhausted.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.inner.closed.load(Ordering::Acquire) {
            self.inner.subscribers.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
            disposed: false,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        self.inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber and refuse further events.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// Handle returned by [`EventHub::subscribe`]. Disposing it (explicitly or by
/// dropping) detaches the listener; buffered events are discarded.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    hub: Weak<HubInner>,
    disposed: bool,
}

impl Subscription {
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        if self.disposed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<EngineEvent> {
        if self.disposed {
            return None;
        }
        self.rx.recv().await
    }

    /// Everything queued so far, in emission order.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.remove(&self.id);
        }
        self.rx.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
