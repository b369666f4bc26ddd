//! Event fan-out to attached observers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::ObserverEvent;
use crate::ids::ObserverId;
use crate::state::SessionSnapshot;

/// Outgoing queue of one observer. Frames are pre-serialized JSON.
pub type ObserverSink = mpsc::Sender<Arc<String>>;

/// Currently attached observers. Owned by the broker task.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    observers: HashMap<ObserverId, ObserverSink>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer, then send it the single catch-up event for
    /// `snapshot`. Re-attaching an id replaces its sink.
    pub fn attach(&mut self, id: ObserverId, sink: ObserverSink, snapshot: &SessionSnapshot) {
        let _ = self.observers.insert(id.clone(), sink);
        let catch_up = snapshot.catch_up_event();
        debug!(observer_id = %id, event_type = catch_up.event_type(), "sending catch-up");
        let _ = self.send_to(&id, &catch_up);
    }

    /// Remove an observer. Returns false if it was not attached.
    pub fn detach(&mut self, id: &ObserverId) -> bool {
        self.observers.remove(id).is_some()
    }

    pub fn contains(&self, id: &ObserverId) -> bool {
        self.observers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver to one observer. Returns whether the frame was queued.
    pub fn send_to(&self, id: &ObserverId, event: &ObserverEvent) -> bool {
        let Some(sink) = self.observers.get(id) else {
            debug!(observer_id = %id, event_type = event.event_type(), "observer gone, dropping event");
            return false;
        };
        match serialize(event) {
            Some(json) => deliver(id, sink, json),
            None => false,
        }
    }

    /// Best-effort delivery to every attached observer. Observers whose
    /// queue has closed are dropped. Returns the number of deliveries.
    pub fn broadcast(&mut self, event: &ObserverEvent) -> usize {
        let Some(json) = serialize(event) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in &self.observers {
            if sink.is_closed() {
                closed.push(id.clone());
            } else if deliver(id, sink, Arc::clone(&json)) {
                delivered += 1;
            }
        }
        for id in closed {
            let _ = self.observers.remove(&id);
            debug!(observer_id = %id, "removed closed observer");
        }

        debug!(event_type = event.event_type(), recipients = delivered, "broadcast event");
        delivered
    }
}

fn serialize(event: &ObserverEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
            None
        }
    }
}

fn deliver(id: &ObserverId, sink: &ObserverSink, json: Arc<String>) -> bool {
    match sink.try_send(json) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(observer_id = %id, msg_len = msg.len(), "send queue full, dropping event");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ObserverStatus;
    use crate::state::SessionState;

    fn observer(capacity: usize) -> (ObserverId, ObserverSink, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ObserverId::new(), tx, rx)
    }

    fn recv_event(rx: &mut mpsc::Receiver<Arc<String>>) -> ObserverEvent {
        let json = rx.try_recv().expect("expected a queued event");
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn attach_sends_scan_qr_by_default() {
        let mut registry = ObserverRegistry::new();
        let (id, tx, mut rx) = observer(8);
        registry.attach(id.clone(), tx, &SessionSnapshot::default());

        assert!(registry.contains(&id));
        assert_eq!(recv_event(&mut rx), ObserverEvent::Status(ObserverStatus::ScanQr));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn attach_sends_pending_credential() {
        let mut registry = ObserverRegistry::new();
        let (id, tx, mut rx) = observer(8);
        let snapshot = SessionSnapshot {
            state: SessionState::AwaitingScan,
            pending_credential: Some("ABC123".into()),
        };
        registry.attach(id, tx, &snapshot);

        assert_eq!(recv_event(&mut rx), ObserverEvent::QrCode("ABC123".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn attach_when_connected_sends_only_status() {
        let mut registry = ObserverRegistry::new();
        let (id, tx, mut rx) = observer(8);
        let snapshot = SessionSnapshot {
            state: SessionState::Connected,
            pending_credential: None,
        };
        registry.attach(id, tx, &snapshot);

        assert_eq!(recv_event(&mut rx), ObserverEvent::Status(ObserverStatus::Connected));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_every_observer_with_same_payload() {
        let mut registry = ObserverRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (id, tx, mut rx) = observer(8);
            registry.attach(id, tx, &SessionSnapshot::default());
            let _ = rx.try_recv();
            receivers.push(rx);
        }

        let delivered = registry.broadcast(&ObserverEvent::QrCode("tok".into()));
        assert_eq!(delivered, 3);

        let payloads: Vec<Arc<String>> = receivers
            .iter_mut()
            .map(|rx| rx.try_recv().unwrap())
            .collect();
        assert!(payloads.windows(2).all(|w| w[0] == w[1]));
        assert!(receivers.iter_mut().all(|rx| rx.try_recv().is_err()));
    }

    #[test]
    fn broadcast_with_no_observers() {
        let mut registry = ObserverRegistry::new();
        assert_eq!(registry.broadcast(&ObserverEvent::QrCode("tok".into())), 0);
    }

    #[test]
    fn detach_is_idempotent() {
        let mut registry = ObserverRegistry::new();
        let (id1, tx1, _rx1) = observer(8);
        let (id2, tx2, mut rx2) = observer(8);
        registry.attach(id1.clone(), tx1, &SessionSnapshot::default());
        registry.attach(id2, tx2, &SessionSnapshot::default());
        let _ = rx2.try_recv();

        assert!(registry.detach(&id1));
        assert!(!registry.detach(&id1));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.broadcast(&ObserverEvent::QrCode("tok".into())), 1);
        assert_eq!(recv_event(&mut rx2), ObserverEvent::QrCode("tok".into()));
    }

    #[test]
    fn send_to_targets_one_observer() {
        let mut registry = ObserverRegistry::new();
        let (id1, tx1, mut rx1) = observer(8);
        let (id2, tx2, mut rx2) = observer(8);
        registry.attach(id1.clone(), tx1, &SessionSnapshot::default());
        registry.attach(id2, tx2, &SessionSnapshot::default());
        let _ = rx1.try_recv();
        let _ = rx2.try_recv();

        assert!(registry.send_to(&id1, &ObserverEvent::Status(ObserverStatus::Connecting)));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn send_to_unknown_observer() {
        let registry = ObserverRegistry::new();
        assert!(!registry.send_to(&ObserverId::new(), &ObserverEvent::QrCode("x".into())));
    }

    #[test]
    fn full_queue_drops_event() {
        let mut registry = ObserverRegistry::new();
        let (id, tx, _rx) = observer(1);
        // Catch-up fills the only slot.
        registry.attach(id, tx, &SessionSnapshot::default());
        assert_eq!(registry.broadcast(&ObserverEvent::QrCode("tok".into())), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_observers_are_pruned_on_broadcast() {
        let mut registry = ObserverRegistry::new();
        let (id, tx, rx) = observer(8);
        registry.attach(id.clone(), tx, &SessionSnapshot::default());
        drop(rx);

        assert_eq!(registry.broadcast(&ObserverEvent::QrCode("tok".into())), 0);
        assert!(!registry.contains(&id));
        assert!(!registry.detach(&id));
    }
}
