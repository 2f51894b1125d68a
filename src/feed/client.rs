//! MarketFeedClient - owns the feed connection and publishes decoded events.
//!
//! Creation events are deduplicated against a bounded recent window and
//! published immediately. Trade events are coalesced per mint (last write
//! wins) and published by a periodic flush.

use crate::config::FeedSettings;
use crate::error::FeedError;
use crate::feed::protocol::{self, Frame};
use crate::feed::recent::RecentTokenSet;
use crate::queues::{EventPublisher, EventWriter};
use crate::types::{MarketEvent, Pubkey};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type LatestTrades = Arc<Mutex<HashMap<Pubkey, MarketEvent>>>;

/// What happened to a single inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Acknowledged,
    /// New token published and trade subscription requested
    Created(Pubkey),
    /// Creation for a mint already in the recent window
    Duplicate(Pubkey),
    /// Trade stored for the next flush
    TradeBuffered(Pubkey),
}

/// Inbound-side state, separate from the subscription receiver so the
/// connection loop can borrow both at once.
struct FeedState {
    publisher: EventPublisher,
    recent: RecentTokenSet,
    latest_trades: LatestTrades,
    subscriptions: mpsc::UnboundedSender<Pubkey>,
}

pub struct MarketFeedClient {
    settings: FeedSettings,
    state: FeedState,
    subscription_requests: mpsc::UnboundedReceiver<Pubkey>,
}

impl MarketFeedClient {
    pub fn new(settings: FeedSettings, publisher: EventPublisher) -> Self {
        let (subscriptions, subscription_requests) = mpsc::unbounded_channel();
        let state = FeedState {
            publisher,
            recent: RecentTokenSet::new(settings.recent_capacity),
            latest_trades: Arc::new(Mutex::new(HashMap::new())),
            subscriptions,
        };

        Self {
            settings,
            state,
            subscription_requests,
        }
    }

    /// Process one text frame from the feed.
    pub fn handle_frame(&mut self, text: &str) -> Result<FrameOutcome, FeedError> {
        self.state.handle_frame(text)
    }

    /// Publish the latest buffered trade of every mint and clear the buffer.
    pub fn flush_trades(&self) -> usize {
        flush_latest_trades(&self.state.latest_trades, &self.state.publisher.trades)
    }

    /// Number of mints with a buffered trade.
    pub fn buffered_trades(&self) -> usize {
        self.state.latest_trades.lock().len()
    }

    /// Next queued trade subscription request, if any.
    pub fn try_next_subscription(&mut self) -> Option<Pubkey> {
        self.subscription_requests.try_recv().ok()
    }

    /// Connect, subscribe and process the feed until `cancel` fires.
    ///
    /// Transport failures reconnect after a fixed delay and only re-subscribe
    /// to new-token notifications. Per-mint trade subscriptions from earlier
    /// connections are not replayed.
    pub async fn run(mut self, cancel: CancellationToken) {
        let flush_task = tokio::spawn(run_trade_flush(
            self.state.latest_trades.clone(),
            self.state.publisher.trades.clone(),
            self.settings.flush_interval(),
            cancel.clone(),
        ));

        loop {
            match self.run_connection(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        "Feed connection error: {}. Reconnecting in {}ms...",
                        e,
                        self.settings.reconnect_delay_ms
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.reconnect_delay()) => {
                    info!("Attempting to reconnect to market feed...");
                }
            }
        }

        if let Err(e) = flush_task.await {
            error!("Trade flush task failed: {}", e);
        }
        info!("MarketFeedClient stopped");
    }

    /// One connection lifetime. `Ok` only when cancelled.
    #[instrument(skip(self, cancel), fields(url = %self.settings.url))]
    async fn run_connection(&mut self, cancel: &CancellationToken) -> Result<(), FeedError> {
        let Self {
            settings,
            state,
            subscription_requests,
        } = self;

        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = connect_async(settings.url.as_str()) => connected?,
        };
        let (mut write, mut read) = stream.split();

        write
            .send(Message::Text(protocol::subscribe_new_token()))
            .await?;
        info!("Connected to market feed and subscribed to new token events");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Failed to send close frame: {}", e);
                    }
                    return Ok(());
                }
                Some(mint) = subscription_requests.recv() => {
                    let frame = protocol::subscribe_token_trade(std::slice::from_ref(&mint));
                    write.send(Message::Text(frame)).await?;
                    debug!("Subscribed to trades for {}", mint);
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = state.handle_frame(&text) {
                            warn!("Dropping feed frame: {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Err(FeedError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

impl FeedState {
    fn handle_frame(&mut self, text: &str) -> Result<FrameOutcome, FeedError> {
        let event = match protocol::decode_frame(text)? {
            Frame::Ack(message) => {
                debug!("Feed acknowledgement: {}", message);
                return Ok(FrameOutcome::Acknowledged);
            }
            Frame::Event(event) => event,
        };

        if event.is_creation() {
            self.handle_creation(event)
        } else {
            let mint = event.mint.clone();
            self.latest_trades.lock().insert(mint.clone(), event);
            Ok(FrameOutcome::TradeBuffered(mint))
        }
    }

    fn handle_creation(&mut self, event: MarketEvent) -> Result<FrameOutcome, FeedError> {
        let mint = event.mint.clone();
        if !self.recent.insert(&mint) {
            warn!("Duplicate token creation detected: {}, {}", event.symbol(), mint);
            return Ok(FrameOutcome::Duplicate(mint));
        }

        info!("NEW token: {}, {}", event.symbol(), mint);
        self.publisher.creations.publish(event)?;
        if self.subscriptions.send(mint.clone()).is_err() {
            warn!("Subscription channel closed, not subscribing to {}", mint);
        }
        Ok(FrameOutcome::Created(mint))
    }
}

/// Drain the trade buffer in one step and publish one event per mint.
pub fn flush_latest_trades(
    latest_trades: &Mutex<HashMap<Pubkey, MarketEvent>>,
    writer: &EventWriter,
) -> usize {
    let drained = std::mem::take(&mut *latest_trades.lock());
    let mut published = 0;

    for (mint, trade) in drained {
        if mint.is_empty() {
            warn!("Skipping buffered trade with empty mint");
            continue;
        }
        match writer.publish(trade) {
            Ok(()) => published += 1,
            Err(e) => error!("Failed to publish trade for {}: {}", mint, e),
        }
    }
    published
}

async fn run_trade_flush(
    latest_trades: LatestTrades,
    writer: EventWriter,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let published = flush_latest_trades(&latest_trades, &writer);
                if published > 0 {
                    debug!("Flushed {} coalesced trades", published);
                }
            }
        }
    }
}
