//! Unbounded hand-off queues between the feed and the event consumers.
//!
//! Writers never block. Readers wait until an event arrives or the queue is
//! closed; a closed queue still yields what was queued before closing.
//! Closing goes through a shared token, so it never waits on a parked reader.

use crate::error::FeedError;
use crate::types::MarketEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A single unbounded multi-producer, multi-consumer FIFO.
pub struct EventQueue {
    sender: mpsc::UnboundedSender<MarketEvent>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<MarketEvent>>>,
    closed: CancellationToken,
}

/// Cloneable write half of an [`EventQueue`].
#[derive(Clone)]
pub struct EventWriter {
    sender: mpsc::UnboundedSender<MarketEvent>,
    closed: CancellationToken,
}

/// Cloneable read half of an [`EventQueue`]. Clones compete for events.
#[derive(Clone)]
pub struct EventReader {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<MarketEvent>>>,
    closed: CancellationToken,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closed: CancellationToken::new(),
        }
    }

    pub fn writer(&self) -> EventWriter {
        EventWriter {
            sender: self.sender.clone(),
            closed: self.closed.clone(),
        }
    }

    pub fn reader(&self) -> EventReader {
        EventReader {
            receiver: self.receiver.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Stop accepting events and wake every waiting reader.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Split into halves, dropping the queue's own sender so the queue
    /// also closes once every returned writer is gone.
    pub fn split(self) -> (EventWriter, EventReader) {
        (
            EventWriter {
                sender: self.sender,
                closed: self.closed.clone(),
            },
            EventReader {
                receiver: self.receiver,
                closed: self.closed,
            },
        )
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventWriter {
    /// Enqueue an event without waiting.
    pub fn publish(&self, event: MarketEvent) -> Result<(), FeedError> {
        if self.closed.is_cancelled() {
            return Err(FeedError::QueueClosed);
        }
        self.sender.send(event).map_err(|_| FeedError::QueueClosed)
    }
}

impl EventReader {
    /// Wait for the next event. `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<MarketEvent> {
        let mut receiver = self.receiver.lock().await;
        if self.closed.is_cancelled() {
            receiver.close();
            return receiver.recv().await;
        }

        tokio::select! {
            biased;
            event = receiver.recv() => event,
            _ = self.closed.cancelled() => {
                // Buffered events are still returned after close
                receiver.close();
                receiver.recv().await
            }
        }
    }

    /// Stop accepting new events. Queued events can still be read.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// The creation and trade queues, created together.
pub struct EventQueues {
    pub creations: EventQueue,
    pub trades: EventQueue,
}

impl EventQueues {
    pub fn new() -> Self {
        Self {
            creations: EventQueue::new(),
            trades: EventQueue::new(),
        }
    }

    /// Close both queues; consumers drain what is left and stop.
    pub fn close(&self) {
        self.creations.close();
        self.trades.close();
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            creations: self.creations.writer(),
            trades: self.trades.writer(),
        }
    }
}

impl Default for EventQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of both queues, handed to the feed client.
#[derive(Clone)]
pub struct EventPublisher {
    pub creations: EventWriter,
    pub trades: EventWriter,
}
