use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_core::{AdapterEvent, SendFailure, SessionAdapter};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::{send_outcome, BridgeEvent, BridgeRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Send waiting for its `send_result` frame.
type PendingTx = oneshot::Sender<Result<(), SendFailure>>;

/// Sidecar connection settings.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub url: String,
    pub send_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub command_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3002/session".into(),
            send_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            command_queue: 256,
        }
    }
}

struct SendCommand {
    to: String,
    text: String,
    response_tx: PendingTx,
}

enum LinkExit {
    Disconnected,
    /// The broker dropped its event receiver.
    ConsumerGone,
}

/// Adapter that reaches the messaging session through a sidecar WebSocket.
///
/// `initialize` spawns a supervisor that keeps the link up, reconnecting with
/// backoff. Sends made while the link is down fail with `NotConnected`.
pub struct BridgeAdapter {
    config: BridgeConfig,
    link: Arc<RwLock<Option<mpsc::Sender<SendCommand>>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeAdapter {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            link: Arc::new(RwLock::new(None)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.read().is_some()
    }
}

impl Drop for BridgeAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl SessionAdapter for BridgeAdapter {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn initialize(&self, events: mpsc::Sender<AdapterEvent>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            warn!("bridge already initialized");
            return;
        }
        info!(url = %self.config.url, "starting session bridge");
        *supervisor = Some(tokio::spawn(supervise(
            self.config.clone(),
            Arc::clone(&self.link),
            events,
        )));
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendFailure> {
        let link = self.link.read().clone();
        let Some(cmd_tx) = link else {
            return Err(SendFailure::NotConnected);
        };

        let (tx, rx) = oneshot::channel();
        cmd_tx
            .send(SendCommand {
                to: to.to_string(),
                text: text.to_string(),
                response_tx: tx,
            })
            .await
            .map_err(|_| SendFailure::NotConnected)?;

        tokio::time::timeout(self.config.send_timeout, rx)
            .await
            .map_err(|_| SendFailure::Timeout(self.config.send_timeout))?
            .map_err(|_| SendFailure::Transport("bridge disconnected".into()))?
    }
}

/// Keep a link to the sidecar up until the event consumer goes away.
async fn supervise(
    config: BridgeConfig,
    link: Arc<RwLock<Option<mpsc::Sender<SendCommand>>>>,
    events: mpsc::Sender<AdapterEvent>,
) {
    let mut backoff = config.initial_backoff;
    loop {
        match connect_async(config.url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %config.url, "connected to session sidecar");
                backoff = config.initial_backoff;

                let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue.max(1));
                *link.write() = Some(cmd_tx);
                let exit = run_link(ws, cmd_rx, &events).await;
                *link.write() = None;

                match exit {
                    LinkExit::ConsumerGone => {
                        info!("event consumer gone, stopping bridge");
                        return;
                    }
                    LinkExit::Disconnected => warn!(url = %config.url, "session sidecar disconnected"),
                }
            }
            Err(e) => {
                warn!(
                    url = %config.url,
                    error = %BridgeError::from(e),
                    retry_in_ms = backoff.as_millis() as u64,
                    "failed to connect to session sidecar"
                );
            }
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, config.max_backoff);
    }
}

/// Pump one sidecar connection. Pending sends are dropped with the map when
/// the link ends, which their callers see as a transport failure.
async fn run_link(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<SendCommand>,
    events: &mpsc::Sender<AdapterEvent>,
) -> LinkExit {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<String, PendingTx> = HashMap::new();

    if let Err(e) = send_frame(&mut ws_tx, &BridgeRequest::Initialize).await {
        warn!(error = %e, "failed to send initialize");
        return LinkExit::Disconnected;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return LinkExit::Disconnected };
                // Drop entries whose caller already timed out.
                pending.retain(|_, tx| !tx.is_closed());

                let request_id = Uuid::now_v7().to_string();
                let frame = BridgeRequest::Send {
                    request_id: request_id.clone(),
                    to: cmd.to,
                    text: cmd.text,
                };
                if let Err(e) = send_frame(&mut ws_tx, &frame).await {
                    let _ = cmd.response_tx.send(Err(SendFailure::Transport(e.to_string())));
                    return LinkExit::Disconnected;
                }
                let _ = pending.insert(request_id, cmd.response_tx);
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { return LinkExit::Disconnected };
                let Message::Text(text) = msg else { continue };
                match BridgeEvent::parse(text.as_str()) {
                    Ok(BridgeEvent::SendResult { request_id, ok, error }) => {
                        match pending.remove(&request_id) {
                            Some(tx) => {
                                let _ = tx.send(send_outcome(ok, error));
                            }
                            None => debug!(request_id, "send_result for unknown request"),
                        }
                    }
                    Ok(event) => {
                        if let Some(event) = event.into_adapter_event() {
                            if events.send(event).await.is_err() {
                                return LinkExit::ConsumerGone;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "unparseable sidecar frame"),
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &BridgeRequest) -> Result<(), BridgeError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    type ServerWs = WebSocketStream<TcpStream>;

    async fn sidecar() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/session", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn read_json(ws: &mut ServerWs) -> Value {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn write_json(ws: &mut ServerWs, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    fn config(url: String) -> BridgeConfig {
        BridgeConfig {
            url,
            send_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            command_queue: 16,
        }
    }

    async fn wait_connected(adapter: &BridgeAdapter) {
        for _ in 0..200 {
            if adapter.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bridge never connected");
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let max = Duration::from_secs(30);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(20), max), max);
    }

    #[tokio::test]
    async fn send_before_initialize_is_not_connected() {
        let adapter = BridgeAdapter::new(BridgeConfig::default());
        assert_eq!(
            adapter.send_message("a@c.us", "hi").await,
            Err(SendFailure::NotConnected)
        );
    }

    #[tokio::test]
    async fn relays_lifecycle_frames_as_events() {
        let (listener, url) = sidecar().await;
        let adapter = BridgeAdapter::new(config(url));
        let (tx, mut rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let mut ws = accept(&listener).await;
        assert_eq!(read_json(&mut ws).await, json!({"type": "initialize"}));

        write_json(&mut ws, json!({"type": "qr", "code": "ABC123"})).await;
        write_json(&mut ws, json!({"type": "authenticated"})).await;
        write_json(&mut ws, json!({"type": "ready"})).await;
        write_json(
            &mut ws,
            json!({"type": "message", "id": "A1", "from": "966500000000@c.us", "body": "hi"}),
        )
        .await;

        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::CredentialIssued("ABC123".into()))
        );
        assert_eq!(rx.recv().await, Some(AdapterEvent::Authenticated));
        assert_eq!(rx.recv().await, Some(AdapterEvent::Ready));
        let Some(AdapterEvent::InboundMessage(raw)) = rx.recv().await else {
            panic!("expected inbound message");
        };
        assert_eq!(raw.body, "hi");
    }

    #[tokio::test]
    async fn send_is_correlated_with_result() {
        let (listener, url) = sidecar().await;
        let adapter = Arc::new(BridgeAdapter::new(config(url)));
        let (tx, _rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let mut ws = accept(&listener).await;
        let _ = read_json(&mut ws).await;
        wait_connected(&adapter).await;

        let sender = Arc::clone(&adapter);
        let ok_send =
            tokio::spawn(async move { sender.send_message("966500000000@c.us", "hello").await });
        let frame = read_json(&mut ws).await;
        assert_eq!(frame["type"], "send");
        assert_eq!(frame["to"], "966500000000@c.us");
        assert_eq!(frame["text"], "hello");
        let request_id = frame["requestId"].as_str().unwrap().to_string();
        write_json(&mut ws, json!({"type": "send_result", "requestId": request_id, "ok": true}))
            .await;
        assert_eq!(ok_send.await.unwrap(), Ok(()));

        let sender = Arc::clone(&adapter);
        let bad_send = tokio::spawn(async move { sender.send_message("nobody", "hello").await });
        let frame = read_json(&mut ws).await;
        let request_id = frame["requestId"].as_str().unwrap().to_string();
        write_json(
            &mut ws,
            json!({"type": "send_result", "requestId": request_id, "ok": false, "error": "invalid wid"}),
        )
        .await;
        assert_eq!(
            bad_send.await.unwrap(),
            Err(SendFailure::Rejected("invalid wid".into()))
        );
    }

    #[tokio::test]
    async fn zero_command_queue_still_sends() {
        let (listener, url) = sidecar().await;
        let adapter = Arc::new(BridgeAdapter::new(BridgeConfig {
            command_queue: 0,
            ..config(url)
        }));
        let (tx, _rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let mut ws = accept(&listener).await;
        let _ = read_json(&mut ws).await;
        wait_connected(&adapter).await;

        let sender = Arc::clone(&adapter);
        let send = tokio::spawn(async move { sender.send_message("966500000000@c.us", "hi").await });
        let frame = read_json(&mut ws).await;
        let request_id = frame["requestId"].as_str().unwrap().to_string();
        write_json(&mut ws, json!({"type": "send_result", "requestId": request_id, "ok": true}))
            .await;
        assert_eq!(send.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn pending_send_fails_when_sidecar_drops() {
        let (listener, url) = sidecar().await;
        let adapter = Arc::new(BridgeAdapter::new(config(url)));
        let (tx, _rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let mut ws = accept(&listener).await;
        let _ = read_json(&mut ws).await;
        wait_connected(&adapter).await;

        let sender = Arc::clone(&adapter);
        let send = tokio::spawn(async move { sender.send_message("a@c.us", "hi").await });
        let _ = read_json(&mut ws).await;
        drop(ws);

        assert_eq!(
            send.await.unwrap(),
            Err(SendFailure::Transport("bridge disconnected".into()))
        );
    }

    #[tokio::test]
    async fn reconnects_after_disconnect() {
        let (listener, url) = sidecar().await;
        let adapter = BridgeAdapter::new(config(url));
        let (tx, _rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let ws = accept(&listener).await;
        drop(ws);

        let mut ws = accept(&listener).await;
        assert_eq!(read_json(&mut ws).await, json!({"type": "initialize"}));
    }

    #[tokio::test]
    async fn send_times_out_without_result() {
        let (listener, url) = sidecar().await;
        let adapter = BridgeAdapter::new(BridgeConfig {
            send_timeout: Duration::from_millis(50),
            ..config(url)
        });
        let (tx, _rx) = mpsc::channel(16);
        adapter.initialize(tx).await;

        let mut ws = accept(&listener).await;
        let _ = read_json(&mut ws).await;
        wait_connected(&adapter).await;

        assert_eq!(
            adapter.send_message("a@c.us", "hi").await,
            Err(SendFailure::Timeout(Duration::from_millis(50)))
        );
    }
}
