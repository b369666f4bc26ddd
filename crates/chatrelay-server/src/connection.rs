use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chatrelay_core::events::RequestRejection;
use chatrelay_core::{BrokerHandle, ObserverEvent, ObserverId, ObserverRequest, ObserverSink};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Per-connection limits.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Outgoing queue length; events beyond it are dropped for this observer.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Close after this long without a pong, or when one frame takes this
    /// long to write.
    pub client_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

/// Serve one observer: attach it to the broker, pump broker events out and
/// observer requests in, and detach when either side goes away.
pub async fn handle_ws_connection(
    socket: WebSocket,
    observer: ObserverId,
    broker: BrokerHandle,
    config: ConnectionConfig,
) {
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(config.max_send_queue.max(1));
    if !broker.attach(observer.clone(), tx.clone()).await {
        tracing::warn!(observer_id = %observer, "broker stopped, refusing observer");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let clock = Instant::now();
    let last_pong = Arc::new(AtomicU64::new(0));

    // Writer task: forward queued events to the WebSocket + periodic ping
    let writer_id = observer.clone();
    let writer_pong = Arc::clone(&last_pong);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(config.heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            let frame = tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    WsMessage::Text(text.as_str().into())
                }
                _ = ping_interval.tick() => {
                    if !is_alive(clock, &writer_pong, config.client_timeout) {
                        tracing::info!(observer_id = %writer_id, "observer missed heartbeats, closing");
                        break;
                    }
                    tracing::trace!(observer_id = %writer_id, "sending ping");
                    WsMessage::Ping(vec![].into())
                }
            };

            match tokio::time::timeout(config.client_timeout, ws_tx.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::info!(observer_id = %writer_id, "observer stopped reading, closing");
                    break;
                }
            }
        }
    });

    // Reader task: route observer frames to the broker, track pongs
    let reader_id = observer.clone();
    let reader_broker = broker.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_frame(&reader_id, text.as_str(), &reader_broker, &tx).await;
                }
                WsMessage::Pong(_) => last_pong.store(millis_since(clock), Ordering::Relaxed),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let _ = broker.detach(observer).await;
}

/// Route one text frame. Malformed sends are answered on the observer's own
/// queue; anything else unrecognized is only logged.
async fn handle_frame(observer: &ObserverId, raw: &str, broker: &BrokerHandle, own_queue: &ObserverSink) {
    match ObserverRequest::parse(raw) {
        Ok(ObserverRequest::SendMessage(request)) => {
            let _ = broker.send_message(observer.clone(), request).await;
        }
        Err(rejection) => {
            tracing::warn!(observer_id = %observer, error = %rejection, "rejected observer frame");
            reply_rejection(rejection, own_queue);
        }
    }
}

fn reply_rejection(rejection: RequestRejection, own_queue: &ObserverSink) {
    let Some(notice) = rejection.into_notice() else {
        return;
    };
    match serde_json::to_string(&ObserverEvent::SendFailed(notice)) {
        Ok(json) => {
            let _ = own_queue.try_send(Arc::new(json));
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize send_failed"),
    }
}

/// Whether a pong (or the connection start) was seen within `timeout`.
fn is_alive(clock: Instant, last_pong_ms: &AtomicU64, timeout: Duration) -> bool {
    let last = last_pong_ms.load(Ordering::Relaxed);
    millis_since(clock).saturating_sub(last) < timeout.as_millis() as u64
}

fn millis_since(clock: Instant) -> u64 {
    clock.elapsed().as_millis() as u64
}
