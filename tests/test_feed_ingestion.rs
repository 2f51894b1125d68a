//! Feed client against a local WebSocket server.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use pumpwatch::config::FeedSettings;
use pumpwatch::feed::MarketFeedClient;
use pumpwatch::queues::EventQueues;
use pumpwatch::services::{run_creation_consumer, MemoryTokenStore, TokenStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;

const MINT: &str = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr";

fn creation(mint: &str) -> String {
    serde_json::json!({
        "signature": format!("create-{}", mint),
        "mint": mint,
        "traderPublicKey": "Creator111",
        "txType": "create",
        "initialBuy": 50_000_000.0,
        "bondingCurveKey": "Curve111",
        "vTokensInBondingCurve": 1_000_000_000.0,
        "vSolInBondingCurve": 30.0,
        "marketCapSol": 30.0,
        "name": "Frog Coin",
        "symbol": "FROG",
        "uri": "https://ipfs.io/ipfs/QmFrog"
    })
    .to_string()
}

fn trade(mint: &str, signature: &str, market_cap_sol: f64) -> String {
    serde_json::json!({
        "signature": signature,
        "mint": mint,
        "traderPublicKey": "Trader111",
        "txType": "buy",
        "tokenAmount": 1_000.0,
        "newTokenBalance": 1_000.0,
        "bondingCurveKey": "Curve111",
        "vTokensInBondingCurve": 990_000_000.0,
        "vSolInBondingCurve": 31.0,
        "marketCapSol": market_cap_sol
    })
    .to_string()
}

fn settings(url: String, flush_interval_ms: u64) -> FeedSettings {
    FeedSettings {
        url,
        flush_interval_ms,
        reconnect_delay_ms: 50,
        recent_capacity: 100,
    }
}

async fn bind() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    Ok((listener, url))
}

async fn accept(listener: &TcpListener) -> Result<WebSocketStream<TcpStream>> {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept()).await??;
    Ok(accept_async(stream).await?)
}

async fn next_control(ws: &mut WebSocketStream<TcpStream>) -> Result<Value> {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("client hung up"))??;
        if let Message::Text(text) = message {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

#[tokio::test]
async fn test_creation_subscribes_and_trades_coalesce() -> Result<()> {
    let (listener, url) = bind().await?;
    let queues = EventQueues::new();
    let store = Arc::new(MemoryTokenStore::new());
    let cancel = CancellationToken::new();

    let client = MarketFeedClient::new(settings(url, 500), queues.publisher());
    let feed_task = tokio::spawn(client.run(cancel.clone()));
    let consumer_task = tokio::spawn(run_creation_consumer(
        queues.creations.reader(),
        store.clone(),
        cancel.clone(),
    ));

    let mut ws = accept(&listener).await?;
    assert_eq!(next_control(&mut ws).await?["method"], "subscribeNewToken");

    ws.send(Message::Text(r#"{"message":"Successfully subscribed"}"#.to_string()))
        .await?;
    ws.send(Message::Text(creation(MINT))).await?;
    ws.send(Message::Text(creation(MINT))).await?;

    let subscribe = next_control(&mut ws).await?;
    assert_eq!(subscribe["method"], "subscribeTokenTrade");
    assert_eq!(subscribe["keys"][0], MINT);

    ws.send(Message::Text("{not json".to_string())).await?;
    ws.send(Message::Text(trade(MINT, "t1", 40.0))).await?;
    ws.send(Message::Text(trade(MINT, "t2", 45.0))).await?;

    let trades = queues.trades.reader();
    let published = timeout(Duration::from_secs(3), trades.recv()).await?.unwrap();
    assert_eq!(published.signature, "t2");
    assert_eq!(published.market_cap_sol, 45.0);
    assert!(timeout(Duration::from_millis(700), trades.recv()).await.is_err());

    let stored = store.get(MINT).await?.unwrap();
    assert_eq!(stored.symbol, "FROG");
    assert_eq!(store.len().await, 1);

    cancel.cancel();
    feed_task.await?;
    consumer_task.await?;
    Ok(())
}

#[tokio::test]
async fn test_reconnects_after_server_close() -> Result<()> {
    let (listener, url) = bind().await?;
    let queues = EventQueues::new();
    let cancel = CancellationToken::new();

    let client = MarketFeedClient::new(settings(url, 1_000), queues.publisher());
    let feed_task = tokio::spawn(client.run(cancel.clone()));

    let mut first = accept(&listener).await?;
    assert_eq!(next_control(&mut first).await?["method"], "subscribeNewToken");
    first.close(None).await?;
    drop(first);

    let mut second = accept(&listener).await?;
    assert_eq!(next_control(&mut second).await?["method"], "subscribeNewToken");

    second.send(Message::Text(creation(MINT))).await?;
    let created = timeout(Duration::from_secs(3), queues.creations.reader().recv())
        .await?
        .unwrap();
    assert_eq!(created.mint, MINT);

    cancel.cancel();
    timeout(Duration::from_secs(3), feed_task).await??;
    Ok(())
}
