use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::adapter::{AdapterEvent, SessionAdapter};
use crate::errors::SendFailure;
use crate::events::SendRequest;

/// Pre-programmed outcome for one `send_message` call.
#[derive(Clone, Debug)]
pub enum MockSend {
    Succeed,
    Fail(SendFailure),
    /// Wait a duration, then resolve the inner outcome.
    Delay(Duration, Box<MockSend>),
}

impl MockSend {
    pub fn delayed(delay: Duration, inner: MockSend) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Scripted session adapter for deterministic tests without a real session.
///
/// Startup events are emitted from `initialize`; later events can be pushed
/// with [`MockAdapter::emit`]. Sends resolve from a queue of [`MockSend`]
/// outcomes and succeed once the queue is empty.
#[derive(Default)]
pub struct MockAdapter {
    startup: Vec<AdapterEvent>,
    outcomes: Mutex<VecDeque<MockSend>>,
    sent: Mutex<Vec<SendRequest>>,
    events: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
    init_count: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_events(events: Vec<AdapterEvent>) -> Self {
        Self {
            startup: events,
            ..Self::default()
        }
    }

    pub fn push_outcome(&self, outcome: MockSend) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Every send attempted so far, in call order.
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::Relaxed)
    }

    /// Emit an event as if the session produced it. Returns false before
    /// `initialize` or once the consumer is gone.
    pub async fn emit(&self, event: AdapterEvent) -> bool {
        let tx = self.events.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SessionAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self, events: mpsc::Sender<AdapterEvent>) {
        let _ = self.init_count.fetch_add(1, Ordering::Relaxed);
        *self.events.lock() = Some(events.clone());
        for event in &self.startup {
            if events.send(event.clone()).await.is_err() {
                break;
            }
        }
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), SendFailure> {
        self.sent.lock().push(SendRequest {
            to: to.to_string(),
            text: text.to_string(),
        });
        let outcome = self.outcomes.lock().pop_front().unwrap_or(MockSend::Succeed);
        resolve(outcome).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(outcome: MockSend) -> Result<(), SendFailure> {
    let mut current = outcome;
    loop {
        match current {
            MockSend::Succeed => return Ok(()),
            MockSend::Fail(failure) => return Err(failure),
            MockSend::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
