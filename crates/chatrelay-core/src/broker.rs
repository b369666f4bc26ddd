//! Relay broker: mirrors the external session into every observer.
//!
//! The broker runs as a single task that owns the session state and the
//! observer registry, so handlers never race each other. Adapter events,
//! observer commands and send completions are all drained from channels by
//! [`RelayBroker::run`]. Sends run on their own tasks; their outcome comes back
//! as a completion, so the loop keeps relaying while a send is in flight.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterEvent, RawInboundMessage, SessionAdapter};
use crate::errors::SendFailure;
use crate::events::{
    InboundMessage, ObserverEvent, ObserverStatus, OutboundMessageEcho, SendFailedNotice,
    SendRequest,
};
use crate::ids::ObserverId;
use crate::registry::{ObserverRegistry, ObserverSink};
use crate::state::{SessionSnapshot, SessionState, SessionStateTracker};

/// Broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Sender name stamped on outbound echoes.
    pub bot_identity: String,
    pub command_queue: usize,
    pub adapter_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bot_identity: "SaudiBot".into(),
            command_queue: 1024,
            adapter_queue: 1024,
        }
    }
}

/// Summary served by the health endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub session: SessionState,
    pub has_pending_credential: bool,
    pub observers: usize,
}

/// Commands sent to the broker by the observer transport.
#[derive(Debug)]
pub enum BrokerCommand {
    Attach {
        observer: ObserverId,
        sink: ObserverSink,
    },
    Detach {
        observer: ObserverId,
    },
    Send {
        observer: ObserverId,
        request: SendRequest,
    },
    Status {
        reply: oneshot::Sender<BrokerStatus>,
    },
}

#[derive(Debug)]
struct SendCompletion {
    observer: ObserverId,
    request: SendRequest,
    outcome: Result<(), SendFailure>,
}

pub struct RelayBroker {
    adapter: Arc<dyn SessionAdapter>,
    tracker: SessionStateTracker,
    registry: ObserverRegistry,
    bot_identity: String,
    completions_tx: mpsc::Sender<SendCompletion>,
    completions_rx: mpsc::Receiver<SendCompletion>,
}

impl RelayBroker {
    pub fn new(adapter: Arc<dyn SessionAdapter>, config: &BrokerConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(config.command_queue.max(1));
        Self {
            adapter,
            tracker: SessionStateTracker::new(),
            registry: ObserverRegistry::new(),
            bot_identity: config.bot_identity.clone(),
            completions_tx,
            completions_rx,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tracker.snapshot()
    }

    pub fn observer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            session: self.tracker.state(),
            has_pending_credential: self.tracker.pending_credential().is_some(),
            observers: self.registry.len(),
        }
    }

    pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::CredentialIssued(token) => self.handle_credential_issued(token),
            AdapterEvent::Authenticated => self.handle_authenticated(),
            AdapterEvent::Ready => self.handle_ready(),
            AdapterEvent::InboundMessage(raw) => self.handle_inbound_message(raw),
        }
    }

    pub fn handle_credential_issued(&mut self, token: String) {
        info!(preview = %credential_preview(&token), "pairing code issued");
        self.tracker.set_pending_credential(token.clone());
        let _ = self.registry.broadcast(&ObserverEvent::QrCode(token));
    }

    pub fn handle_authenticated(&mut self) {
        info!("session authenticated");
        self.tracker.set_state(SessionState::Authenticating);
        let _ = self
            .registry
            .broadcast(&ObserverEvent::Status(ObserverStatus::Connecting));
    }

    pub fn handle_ready(&mut self) {
        info!("session ready");
        self.tracker.set_state(SessionState::Connected);
        self.tracker.clear_pending_credential();
        let _ = self
            .registry
            .broadcast(&ObserverEvent::Status(ObserverStatus::Connected));
    }

    /// Relayed in every state; messages can arrive before `Ready`.
    pub fn handle_inbound_message(&mut self, raw: RawInboundMessage) {
        let message = InboundMessage::normalize(raw, Utc::now());
        info!(
            message_id = %message.id,
            sender = %message.sender,
            state = %self.tracker.state(),
            "message received"
        );
        let _ = self.registry.broadcast(&ObserverEvent::NewMessage(message));
    }

    pub fn handle_observer_attach(&mut self, observer: ObserverId, sink: ObserverSink) {
        info!(observer_id = %observer, "observer attached");
        let snapshot = self.tracker.snapshot();
        self.registry.attach(observer, sink, &snapshot);
    }

    pub fn handle_observer_detach(&mut self, observer: &ObserverId) {
        if self.registry.detach(observer) {
            info!(observer_id = %observer, "observer detached");
        }
    }

    /// Start a send on its own task. The outcome is reported only to
    /// `observer`, once the completion is drained by the broker loop.
    pub fn handle_send_request(&mut self, observer: ObserverId, request: SendRequest) {
        debug!(observer_id = %observer, to = %request.to, "send requested");
        let adapter = Arc::clone(&self.adapter);
        let completions = self.completions_tx.clone();
        let _ = tokio::spawn(async move {
            let outcome = adapter.send_message(&request.to, &request.text).await;
            let _ = completions
                .send(SendCompletion {
                    observer,
                    request,
                    outcome,
                })
                .await;
        });
    }

    fn handle_send_completed(&mut self, completion: SendCompletion) {
        let SendCompletion {
            observer,
            request,
            outcome,
        } = completion;

        let event = match outcome {
            Ok(()) => {
                info!(observer_id = %observer, to = %request.to, text_len = request.text.len(), "message sent");
                ObserverEvent::MessageSent(OutboundMessageEcho::new(
                    &self.bot_identity,
                    &request,
                    Utc::now(),
                ))
            }
            Err(failure) => {
                warn!(
                    observer_id = %observer,
                    to = %request.to,
                    error = %failure,
                    error_kind = failure.error_kind(),
                    "failed to send message"
                );
                ObserverEvent::SendFailed(SendFailedNotice::from_failure(&request, &failure))
            }
        };

        if !self.registry.send_to(&observer, &event) {
            debug!(observer_id = %observer, event_type = event.event_type(), "requester gone before send completed");
        }
    }

    fn handle_command(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Attach { observer, sink } => self.handle_observer_attach(observer, sink),
            BrokerCommand::Detach { observer } => self.handle_observer_detach(&observer),
            BrokerCommand::Send { observer, request } => self.handle_send_request(observer, request),
            BrokerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Drive the broker until every [`BrokerHandle`] is dropped.
    pub async fn run(
        mut self,
        mut adapter_events: mpsc::Receiver<AdapterEvent>,
        mut commands: mpsc::Receiver<BrokerCommand>,
    ) {
        let mut adapter_open = true;
        loop {
            tokio::select! {
                event = adapter_events.recv(), if adapter_open => match event {
                    Some(event) => self.handle_adapter_event(event),
                    None => {
                        warn!("adapter event stream closed");
                        adapter_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("all broker handles dropped, stopping");
                        break;
                    }
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_send_completed(completion);
                }
            }
        }
    }

    #[cfg(test)]
    async fn settle_one_send(&mut self) {
        if let Some(completion) = self.completions_rx.recv().await {
            self.handle_send_completed(completion);
        }
    }
}

/// Cloneable handle used by the observer transport to reach the broker.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    commands: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(commands: mpsc::Sender<BrokerCommand>) -> Self {
        Self { commands }
    }

    pub async fn attach(&self, observer: ObserverId, sink: ObserverSink) -> bool {
        self.commands
            .send(BrokerCommand::Attach { observer, sink })
            .await
            .is_ok()
    }

    pub async fn detach(&self, observer: ObserverId) -> bool {
        self.commands
            .send(BrokerCommand::Detach { observer })
            .await
            .is_ok()
    }

    pub async fn send_message(&self, observer: ObserverId, request: SendRequest) -> bool {
        self.commands
            .send(BrokerCommand::Send { observer, request })
            .await
            .is_ok()
    }

    /// `None` once the broker has stopped.
    pub async fn status(&self) -> Option<BrokerStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(BrokerCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Spawn a broker for `adapter` and initialize the adapter against it.
pub async fn launch(
    adapter: Arc<dyn SessionAdapter>,
    config: BrokerConfig,
) -> (BrokerHandle, JoinHandle<()>) {
    let (adapter_tx, adapter_rx) = mpsc::channel(config.adapter_queue.max(1));
    let (command_tx, command_rx) = mpsc::channel(config.command_queue.max(1));

    let broker = RelayBroker::new(Arc::clone(&adapter), &config);
    let task = tokio::spawn(broker.run(adapter_rx, command_rx));

    info!(adapter = adapter.name(), "initializing session adapter");
    adapter.initialize(adapter_tx).await;

    (BrokerHandle::new(command_tx), task)
}

fn credential_preview(token: &str) -> String {
    let head: String = token.chars().take(20).collect();
    if head.len() < token.len() {
        format!("{head}...")
    } else {
        head
    }
}
