//! Fan-out of recomputed metrics to dashboard subscribers.
//!
//! The hub holds the latest published [`FeedSet`] in a `watch` channel.
//! Each subscriber owns a receiver and nothing else: there are no
//! per-session timers, and a slow subscriber simply skips intermediate
//! values and wakes up to the latest one. Dropping a session releases it.

use futures::Stream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::metrics::{FeedKind, FeedSet, MetricsService};

pub struct StreamHub {
    service: Arc<MetricsService>,
    tx: watch::Sender<Option<Arc<FeedSet>>>,
    sessions: Arc<AtomicUsize>,
}

impl StreamHub {
    pub fn new(service: Arc<MetricsService>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            service,
            tx,
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn service(&self) -> &Arc<MetricsService> {
        &self.service
    }

    /// Publishes a fresh recomputation to every subscriber.
    pub fn publish(&self, feeds: FeedSet) {
        self.tx.send_replace(Some(Arc::new(feeds)));
    }

    /// The most recently published feeds, if any.
    pub fn latest(&self) -> Option<Arc<FeedSet>> {
        self.tx.borrow().clone()
    }

    /// Number of live subscriber sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Opens a session. Its first delivery is a freshly computed snapshot
    /// (the empty one if the partition cannot be read); later deliveries
    /// follow [`publish`](Self::publish).
    pub async fn subscribe(&self, kind: FeedKind) -> SubscriberSession {
        let rx = self.tx.subscribe();
        let service = self.service.clone();
        let initial = match tokio::task::spawn_blocking(move || service.compute_or_default()).await
        {
            Ok(feeds) => feeds,
            Err(_) => self.service.empty(),
        };

        let live = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(?kind, sessions = live, "subscriber connected");
        SubscriberSession {
            kind,
            rx,
            initial: Some(Arc::new(initial)),
            last_fingerprint: None,
            _guard: SessionGuard {
                sessions: self.sessions.clone(),
            },
        }
    }
}

struct SessionGuard {
    sessions: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let left = self.sessions.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(sessions = left, "subscriber disconnected");
    }
}

/// One connected dashboard client.
pub struct SubscriberSession {
    kind: FeedKind,
    rx: watch::Receiver<Option<Arc<FeedSet>>>,
    initial: Option<Arc<FeedSet>>,
    last_fingerprint: Option<String>,
    _guard: SessionGuard,
}

impl SubscriberSession {
    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Waits for the next payload that differs from the last one delivered.
    /// Returns `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<String> {
        if let Some(initial) = self.initial.take() {
            return Some(self.deliver(&initial));
        }
        loop {
            self.rx.changed().await.ok()?;
            let latest = self.rx.borrow_and_update().clone();
            let Some(feeds) = latest else { continue };
            if self.last_fingerprint.as_deref() == Some(feeds.fingerprint(self.kind)) {
                continue;
            }
            return Some(self.deliver(&feeds));
        }
    }

    fn deliver(&mut self, feeds: &FeedSet) -> String {
        self.last_fingerprint = Some(feeds.fingerprint(self.kind).to_string());
        feeds.json(self.kind).to_string()
    }

    /// Turns the session into a stream of JSON payloads.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        futures::stream::unfold(self, |mut session| async move {
            session.next().await.map(|payload| (payload, session))
        })
    }
}
