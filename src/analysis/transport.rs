//! WebSocket bridge to the analysis oracle.

use crate::analysis::oracle::{OracleReply, OracleTransport};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

type BridgeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct BridgeFrame {
    text: String,
    html: Option<String>,
}

/// Decode a bridge frame. JSON `{"text", "html"}` objects carry a formatted
/// variant; anything else is taken as plain reply text.
pub fn parse_bridge_frame(frame: &str) -> OracleReply {
    match serde_json::from_str::<BridgeFrame>(frame) {
        Ok(BridgeFrame { text, html }) => OracleReply {
            text,
            formatted: html.filter(|h| !h.is_empty()),
        },
        Err(_) => OracleReply::text(frame),
    }
}

type BridgeSink = SplitSink<BridgeStream, Message>;
type SharedSink = Arc<Mutex<Option<BridgeSink>>>;

/// Sends addresses as text frames and forwards every inbound text frame to
/// the reply channel.
///
/// A lost bridge is reconnected after a fixed delay. Sends made while the
/// bridge is down fail without waiting.
pub struct WsOracleTransport {
    sink: SharedSink,
    supervisor: JoinHandle<()>,
}

impl WsOracleTransport {
    /// Open the bridge session. Only this first connection attempt is fatal.
    #[instrument]
    pub async fn connect(
        url: &str,
        reconnect_delay: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OracleReply>)> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to oracle bridge at {}", url))?;
        let (sink, stream) = stream.split();
        let (replies, reply_rx) = mpsc::unbounded_channel();
        info!("Connected to oracle bridge at {}", url);

        let sink: SharedSink = Arc::new(Mutex::new(Some(sink)));
        let supervisor = tokio::spawn(run_bridge(
            url.to_string(),
            stream,
            sink.clone(),
            replies,
            reconnect_delay,
        ));

        Ok((Self { sink, supervisor }, reply_rx))
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

async fn run_bridge(
    url: String,
    mut stream: SplitStream<BridgeStream>,
    sink: SharedSink,
    replies: mpsc::UnboundedSender<OracleReply>,
    reconnect_delay: Duration,
) {
    loop {
        if !forward_replies(stream, &replies).await {
            debug!("Reply channel dropped, stopping bridge reader");
            return;
        }
        sink.lock().await.take();
        warn!(
            "Oracle bridge closed. Reconnecting in {}ms...",
            reconnect_delay.as_millis()
        );

        stream = loop {
            sleep(reconnect_delay).await;
            if replies.is_closed() {
                return;
            }
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    let (writer, reader) = ws.split();
                    *sink.lock().await = Some(writer);
                    info!("Reconnected to oracle bridge at {}", url);
                    break reader;
                }
                Err(e) => error!("Oracle bridge reconnect failed: {}", e),
            }
        };
    }
}

/// Forward text frames until the bridge closes. Returns false once nobody
/// listens for replies anymore.
async fn forward_replies(
    mut stream: SplitStream<BridgeStream>,
    replies: &mpsc::UnboundedSender<OracleReply>,
) -> bool {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if replies.send(parse_bridge_frame(&text)).is_err() {
                    return false;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Oracle bridge read error: {}", e);
                break;
            }
        }
    }
    true
}

#[async_trait]
impl OracleTransport for WsOracleTransport {
    async fn send(&self, address: &str) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let Some(writer) = sink.as_mut() else {
            bail!("Oracle bridge is disconnected");
        };
        writer
            .send(Message::Text(address.to_string()))
            .await
            .context("Failed to send to oracle bridge")
    }
}

impl Drop for WsOracleTransport {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}
