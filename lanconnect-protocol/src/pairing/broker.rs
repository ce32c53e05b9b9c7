//! Pairing Broker
//!
//! Mediates approve/deny decisions between a handshake waiting on an
//! unknown device and an external approver (the control surface).
//!
//! Each request owns a one-shot channel. At most one request per device id
//! is outstanding: a second request for the same id replaces the first, and
//! the earlier waiter resolves with [`PairingDecision::Superseded`].

use super::PairingEvent;
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outcome delivered to a waiting pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingDecision {
    /// Pair with the device
    Approved,
    /// Refuse the request
    Denied,
    /// A newer request for the same device replaced this one
    Superseded,
}

impl PairingDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, PairingDecision::Approved)
    }
}

/// A request currently awaiting a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairing {
    pub device_id: String,
    pub device_name: String,
    pub fingerprint: String,
}

struct PendingRequest {
    ticket: u64,
    info: PendingPairing,
    decision_tx: oneshot::Sender<PairingDecision>,
}

struct BrokerInner {
    pending: Mutex<HashMap<String, PendingRequest>>,
    events: broadcast::Sender<PairingEvent>,
    next_ticket: AtomicU64,
}

impl BrokerInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PairingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Process-wide pairing request table
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct PairingBroker {
    inner: Arc<BrokerInner>,
}

impl Default for PairingBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                pending: Mutex::new(HashMap::new()),
                events,
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to pairing events
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.inner.events.subscribe()
    }

    /// Publish a pairing request for `device_id`
    ///
    /// Any request already outstanding for the same id is resolved as
    /// [`PairingDecision::Superseded`]. The returned ticket withdraws the
    /// request when dropped undecided.
    pub fn request(
        &self,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> PairingTicket {
        let info = PendingPairing {
            device_id: device_id.into(),
            device_name: device_name.into(),
            fingerprint: fingerprint.into(),
        };
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (decision_tx, decision_rx) = oneshot::channel();

        let previous = self.inner.pending().insert(
            info.device_id.clone(),
            PendingRequest {
                ticket,
                info: info.clone(),
                decision_tx,
            },
        );

        if let Some(previous) = previous {
            debug!(
                "Pairing request from {} replaces an earlier one",
                info.device_id
            );
            let _ = previous.decision_tx.send(PairingDecision::Superseded);
        }

        info!(
            "Pairing requested by {} ({}), fingerprint {}",
            info.device_name, info.device_id, info.fingerprint
        );
        self.inner.emit(PairingEvent::RequestReceived {
            device_id: info.device_id.clone(),
            device_name: info.device_name,
            fingerprint: info.fingerprint,
        });

        PairingTicket {
            broker: self.inner.clone(),
            device_id: info.device_id,
            ticket,
            decision_rx,
        }
    }

    /// Deliver `decision` to the request outstanding for `device_id`
    ///
    /// Returns `false` when no request was outstanding.
    pub fn decide(&self, device_id: &str, decision: PairingDecision) -> bool {
        let Some(request) = self.inner.pending().remove(device_id) else {
            return false;
        };

        info!("Pairing with {} decided: {:?}", device_id, decision);
        let delivered = request.decision_tx.send(decision).is_ok();
        self.inner.emit(PairingEvent::Decided {
            device_id: device_id.to_string(),
            decision,
        });
        delivered
    }

    /// Approve the request outstanding for `device_id`
    pub fn approve(&self, device_id: &str) -> bool {
        self.decide(device_id, PairingDecision::Approved)
    }

    /// Deny the request outstanding for `device_id`
    pub fn deny(&self, device_id: &str) -> bool {
        self.decide(device_id, PairingDecision::Denied)
    }

    /// Approve the request for `device_id`, waiting up to `timeout` for one
    /// to be published if none is outstanding yet
    pub async fn approve_when_requested(&self, device_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        // Subscribe before checking so a request published in between is seen
        let mut events = self.subscribe();

        loop {
            if self.approve(device_id) {
                return true;
            }

            // Any event (or lag) triggers a re-check of the table
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) | Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Ok(_) => {}
            }
        }
    }

    /// Whether a request for `device_id` is outstanding
    pub fn is_awaiting(&self, device_id: &str) -> bool {
        self.inner.pending().contains_key(device_id)
    }

    /// All outstanding requests
    pub fn pending(&self) -> Vec<PendingPairing> {
        let mut pending: Vec<_> = self
            .inner
            .pending()
            .values()
            .map(|request| request.info.clone())
            .collect();
        pending.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        pending
    }
}

/// Handle on one published pairing request
pub struct PairingTicket {
    broker: Arc<BrokerInner>,
    device_id: String,
    ticket: u64,
    decision_rx: oneshot::Receiver<PairingDecision>,
}

impl PairingTicket {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wait for a decision, bounded by `cancel` and `timeout`
    ///
    /// Fails with [`ProtocolError::PairingTimeout`] or
    /// [`ProtocolError::Cancelled`]; the request is withdrawn in both cases.
    pub async fn wait(
        mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<PairingDecision> {
        // A decision that is already in wins over a timeout firing with it
        tokio::select! {
            biased;
            decision = &mut self.decision_rx => {
                // The sender only disappears when the request is replaced
                Ok(decision.unwrap_or(PairingDecision::Superseded))
            }
            _ = cancel.cancelled() => {
                Err(ProtocolError::Cancelled(format!("pairing with {}", self.device_id)))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(ProtocolError::PairingTimeout(self.device_id.clone()))
            }
        }
    }
}

impl Drop for PairingTicket {
    fn drop(&mut self) {
        let mut pending = self.broker.pending();
        let still_ours = pending
            .get(&self.device_id)
            .is_some_and(|request| request.ticket == self.ticket);

        if still_ours {
            pending.remove(&self.device_id);
            drop(pending);
            debug!("Pairing request from {} withdrawn", self.device_id);
            self.broker.emit(PairingEvent::Withdrawn {
                device_id: self.device_id.clone(),
            });
        }
    }
}
