//! Typed publish/subscribe primitives.
//!
//! A [`Topic`] fans every emitted value out to each live [`Subscription`].
//! Subscriptions are bounded channels, so a slow subscriber applies
//! backpressure to the emitter instead of growing without limit.
//! Closing a topic ends the stream of every subscription once it has
//! drained what was already delivered.

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Topic closed")]
    Closed,
}

/// Receiving half of a topic subscription.
///
/// Drop it to unsubscribe. If bound to a cancellation token, the stream
/// ends as soon as the token is cancelled.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: Option<CancellationToken>,
}

impl<T> Subscription<T> {
    /// End this subscription when `token` is cancelled.
    pub fn bind(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Receive the next value, or `None` once the topic is closed, the
    /// subscription is closed, or its token is cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.rx.close();
                        None
                    }
                    value = self.rx.recv() => value,
                }
            }
            None => self.rx.recv().await,
        }
    }

    /// Receive a value that is already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

struct TopicState<T> {
    subscribers: Vec<(usize, mpsc::Sender<T>)>,
    closed: bool,
}

/// One statically typed event stream with any number of subscribers.
pub struct Topic<T> {
    state: RwLock<TopicState<T>>,
    next_id: AtomicUsize,
    capacity: usize,
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Create a topic whose subscriptions buffer up to `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(TopicState {
                subscribers: Vec::new(),
                closed: false,
            }),
            next_id: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Result<Subscription<T>, BusError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.subscribers.push((id, tx));

        Ok(Subscription { rx, cancel: None })
    }

    /// Deliver `event` to every live subscriber, waiting for buffer space.
    ///
    /// Subscribers whose receiving half is gone are pruned.
    pub async fn emit(&self, event: T) -> Result<(), BusError> {
        // Clone the sender list so no lock is held across an await.
        let subscribers: Vec<_> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(BusError::Closed);
            }
            state.subscribers.clone()
        };

        let mut gone = Vec::new();
        for (id, tx) in subscribers {
            if tx.send(event.clone()).await.is_err() {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.subscribers.retain(|(id, _)| !gone.contains(id));
        }

        Ok(())
    }

    /// Close the topic. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        state.closed = true;
        state.subscribers.clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }
}
