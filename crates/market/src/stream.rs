//! Reconnecting combined-streams websocket client.
//!
//! One connection multiplexes many named streams. Subscribers register a
//! bounded channel per stream name; inbound `{stream, data}` frames are
//! fanned out with non-blocking sends so one slow consumer can never
//! back-pressure the others.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use helmsman_core::{SourceError, SourceStats};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const DEFAULT_BATCH_SIZE: usize = 150;
const BATCH_GAP: Duration = Duration::from_millis(100);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const WRITE_RETRIES: usize = 3;
const WRITE_RETRY_GAP: Duration = Duration::from_millis(200);

struct PendingSubscribe {
    params: Vec<String>,
    /// 0 on first send; bumped on the single error-frame retry.
    attempt: u8,
}

pub struct CombinedStreamsClient {
    url: String,
    batch_size: usize,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    subscribers: RwLock<HashMap<String, mpsc::Sender<serde_json::Value>>>,
    /// Stream names in first-subscribe order; replayed verbatim on reconnect.
    subscribed: Mutex<Vec<String>>,
    pending: Mutex<HashMap<i64, PendingSubscribe>>,
    next_id: AtomicI64,
    stats: Mutex<SourceStats>,
    shutdown: watch::Sender<bool>,
    on_connect: Mutex<Option<helmsman_core::events::ConnectHook>>,
    on_disconnect: Mutex<Option<helmsman_core::events::DisconnectHook>>,
}

impl CombinedStreamsClient {
    #[must_use]
    pub fn new(url: &str, batch_size: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            url: url.trim().to_string(),
            batch_size: if batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                batch_size
            },
            writer: tokio::sync::Mutex::new(None),
            subscribers: RwLock::new(HashMap::new()),
            subscribed: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            stats: Mutex::new(SourceStats::default()),
            shutdown,
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        })
    }

    pub fn set_hooks(
        &self,
        on_connect: Option<helmsman_core::events::ConnectHook>,
        on_disconnect: Option<helmsman_core::events::DisconnectHook>,
    ) {
        *self.on_connect.lock() = on_connect;
        *self.on_disconnect.lock() = on_disconnect;
    }

    /// Dials the endpoint and spawns the read loop.
    ///
    /// # Errors
    /// Returns an error when the initial dial fails; later drops are retried
    /// internally until [`close`](Self::close).
    pub async fn connect(self: Arc<Self>) -> Result<(), SourceError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| SourceError::Transport(anyhow::anyhow!(e)))?;
        let (writer, reader) = ws.split();
        *self.writer.lock().await = Some(writer);
        if let Some(hook) = self.on_connect.lock().clone() {
            hook();
        }
        tokio::spawn(async move {
            self.read_loop(reader).await;
        });
        Ok(())
    }

    /// Registers a subscriber channel for one stream name. Must be called
    /// before the matching SUBSCRIBE frame goes out so no frame is lost.
    pub fn add_subscriber(&self, stream: &str, buffer: usize) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.write().insert(stream.to_string(), tx);
        rx
    }

    /// Sends SUBSCRIBE frames for the streams in batches, pausing between
    /// batches to stay under the venue's frame-rate limit.
    ///
    /// # Errors
    /// Returns the first write failure after per-frame retries are exhausted.
    pub async fn batch_subscribe(&self, streams: &[String]) -> Result<(), SourceError> {
        for chunk in streams.chunks(self.batch_size) {
            self.send_subscribe(chunk.to_vec(), 0).await?;
            tokio::time::sleep(BATCH_GAP).await;
        }
        Ok(())
    }

    async fn send_subscribe(&self, params: Vec<String>, attempt: u8) -> Result<(), SourceError> {
        if params.is_empty() {
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({"method": "SUBSCRIBE", "params": params, "id": id}).to_string();
        for round in 1..=WRITE_RETRIES {
            let sent = {
                let mut guard = self.writer.lock().await;
                let Some(writer) = guard.as_mut() else {
                    return Err(SourceError::NotConnected);
                };
                writer.send(Message::Text(frame.clone())).await
            };
            match sent {
                Ok(()) => {
                    self.record_subscribed(&params);
                    self.pending
                        .lock()
                        .insert(id, PendingSubscribe { params, attempt });
                    return Ok(());
                }
                Err(e) if round == WRITE_RETRIES => {
                    return Err(SourceError::Transport(anyhow::anyhow!(e)));
                }
                Err(_) => tokio::time::sleep(WRITE_RETRY_GAP).await,
            }
        }
        Err(SourceError::Subscribe("subscribe write failed".to_string()))
    }

    async fn read_loop(self: Arc<Self>, mut reader: WsReader) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch_frame(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let mut guard = self.writer.lock().await;
                            if let Some(writer) = guard.as_mut() {
                                let _ = writer.send(Message::Pong(payload)).await;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            match self.handle_disconnect(&e.to_string()).await {
                                Some(next) => reader = next,
                                None => return,
                            }
                        }
                        None => {
                            match self.handle_disconnect("stream ended").await {
                                Some(next) => reader = next,
                                None => return,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Redials until the connection is back or the client is closed, then
    /// replays every previously subscribed stream in the original order.
    async fn handle_disconnect(&self, reason: &str) -> Option<WsReader> {
        tracing::warn!(url = %self.url, reason, "websocket dropped, reconnecting");
        {
            let mut stats = self.stats.lock();
            stats.reconnects += 1;
            stats.last_error = Some(reason.to_string());
        }
        if let Some(hook) = self.on_disconnect.lock().clone() {
            hook(reason);
        }
        *self.writer.lock().await = None;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return None;
                    }
                }
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    let (writer, reader) = ws.split();
                    *self.writer.lock().await = Some(writer);
                    if let Some(hook) = self.on_connect.lock().clone() {
                        hook();
                    }
                    self.replay_subscriptions().await;
                    tracing::info!(url = %self.url, "websocket reconnected");
                    return Some(reader);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "websocket redial failed");
                    self.stats.lock().last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Remembers stream names for reconnect replay, deduplicated and in
    /// first-subscribe order.
    fn record_subscribed(&self, params: &[String]) {
        let mut subscribed = self.subscribed.lock();
        for p in params {
            if !subscribed.iter().any(|s| s == p) {
                subscribed.push(p.clone());
            }
        }
    }

    async fn replay_subscriptions(&self) {
        let streams: Vec<String> = self.subscribed.lock().clone();
        for chunk in streams.chunks(self.batch_size) {
            if let Err(e) = self.send_subscribe(chunk.to_vec(), 0).await {
                tracing::warn!(error = %e, "failed to replay subscriptions");
            }
            tokio::time::sleep(BATCH_GAP).await;
        }
    }

    /// Routes one inbound frame. Data frames take priority, then subscribe
    /// acks, then subscribe error frames.
    pub(crate) async fn dispatch_frame(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            tracing::debug!("undecodable frame dropped");
            return;
        };
        if let Some(stream) = value.get("stream").and_then(|s| s.as_str()) {
            let Some(data) = value.get("data") else {
                return;
            };
            let sender = self.subscribers.read().get(stream).cloned();
            if let Some(tx) = sender {
                if tx.try_send(data.clone()).is_err() {
                    self.stats.lock().dropped_frames += 1;
                    tracing::debug!(stream, "subscriber full, frame dropped");
                }
            }
            return;
        }

        let code = value.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0);
        let Some(id) = value.get("id").and_then(serde_json::Value::as_i64) else {
            return;
        };
        if code == 0 {
            self.pending.lock().remove(&id);
            return;
        }

        let msg = value
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("subscribe rejected")
            .to_string();
        let entry = {
            let mut stats = self.stats.lock();
            stats.subscribe_errors += 1;
            stats.last_error = Some(msg.clone());
            self.pending.lock().remove(&id)
        };
        match entry {
            Some(p) if p.attempt == 0 => {
                tracing::warn!(code, msg, "subscribe rejected, retrying once");
                if let Err(e) = self.send_subscribe(p.params, 1).await {
                    tracing::warn!(error = %e, "subscribe retry failed");
                }
            }
            Some(p) => {
                tracing::error!(code, msg, params = ?p.params, "subscribe failed twice, giving up");
            }
            None => tracing::warn!(code, msg, "error frame for unknown subscribe id"),
        }
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        self.stats.lock().clone()
    }

    /// Names of streams this client has subscribed, in subscribe order.
    #[must_use]
    pub fn subscribed_streams(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    /// Stops the read loop and drops all subscriber channels. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.subscribers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn data_frames_route_to_their_subscriber() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        let mut rx = client.add_subscriber("ethusdt@kline_1m", 4);
        client
            .dispatch_frame(r#"{"stream":"ethusdt@kline_1m","data":{"x":1}}"#)
            .await;
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload["x"], 1);
    }

    #[tokio::test]
    async fn full_subscriber_drops_frames_without_blocking() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        let mut _rx = client.add_subscriber("ethusdt@kline_1m", 1);
        client
            .dispatch_frame(r#"{"stream":"ethusdt@kline_1m","data":{"n":1}}"#)
            .await;
        client
            .dispatch_frame(r#"{"stream":"ethusdt@kline_1m","data":{"n":2}}"#)
            .await;
        assert_eq!(client.stats().dropped_frames, 1);
    }

    #[tokio::test]
    async fn ack_frames_clear_pending() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        client.pending.lock().insert(
            7,
            PendingSubscribe {
                params: vec!["ethusdt@kline_1m".to_string()],
                attempt: 0,
            },
        );
        client.dispatch_frame(r#"{"result":null,"id":7}"#).await;
        assert!(client.pending.lock().is_empty());
        assert_eq!(client.stats().subscribe_errors, 0);
    }

    #[tokio::test]
    async fn error_frames_count_and_surface_message() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        client.pending.lock().insert(
            9,
            PendingSubscribe {
                params: vec!["ethusdt@kline_1m".to_string()],
                attempt: 1,
            },
        );
        client
            .dispatch_frame(r#"{"code":2,"msg":"invalid stream","id":9}"#)
            .await;
        let stats = client.stats();
        assert_eq!(stats.subscribe_errors, 1);
        assert_eq!(stats.last_error.as_deref(), Some("invalid stream"));
        // Attempt already spent: no new pending entry.
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn replay_set_preserves_order_and_survives_acks() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        client.record_subscribed(&[
            "ethusdt@kline_1m".to_string(),
            "btcusdt@kline_1m".to_string(),
        ]);
        client.record_subscribed(&[
            "ethusdt@kline_1m".to_string(), // duplicate, kept once
            "ethusdt@aggTrade".to_string(),
        ]);
        client.pending.lock().insert(
            3,
            PendingSubscribe {
                params: vec!["btcusdt@kline_1m".to_string()],
                attempt: 0,
            },
        );
        // Acks clear pending bookkeeping but never the replay set.
        client.dispatch_frame(r#"{"result":null,"id":3}"#).await;
        assert_eq!(
            client.subscribed_streams(),
            vec![
                "ethusdt@kline_1m".to_string(),
                "btcusdt@kline_1m".to_string(),
                "ethusdt@aggTrade".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_streams_are_ignored() {
        let client = CombinedStreamsClient::new("wss://example.invalid/stream", 0);
        client
            .dispatch_frame(r#"{"stream":"btcusdt@kline_1m","data":{}}"#)
            .await;
        assert_eq!(client.stats().dropped_frames, 0);
    }
}
