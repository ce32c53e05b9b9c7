//! Per-device session table
//!
//! Outbound attempts register here before doing any work. Inbound attempts
//! start detached and claim their slot only once the peer has proven its
//! certificate (or asked to pair), so a bare identity line cannot displace a
//! live session. Claiming cancels whatever was registered for the same device
//! id before (an in-flight attempt or an active session), so at most one
//! session per device id can ever reach the active state.

use crate::Packet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Commands accepted by an active session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Write a packet to the peer
    Send(Packet),
    /// Tell the peer we unpaired, then close
    Unpair,
}

/// One registered establishment attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    pub device_id: String,
    pub generation: u64,
    /// Cancelled when superseded or on shutdown
    pub cancel: CancellationToken,
}

struct Entry {
    generation: u64,
    cancel: CancellationToken,
    commands: Option<mpsc::Sender<SessionCommand>>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

/// Shared table of attempts and active sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new attempt for `device_id`, superseding any earlier one
    ///
    /// The attempt's token is a child of `parent`.
    pub fn begin(&self, device_id: &str, parent: &CancellationToken) -> Attempt {
        let attempt = self.detached(device_id, parent);
        self.claim(&attempt);
        attempt
    }

    /// Create an attempt for `device_id` without registering it
    ///
    /// Nothing registered for the id is touched until [`claim`](Self::claim).
    pub fn detached(&self, device_id: &str, parent: &CancellationToken) -> Attempt {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        Attempt {
            device_id: device_id.to_string(),
            generation,
            cancel: parent.child_token(),
        }
    }

    /// Register `attempt`, superseding anything older for the same id
    ///
    /// Returns `true` if the attempt holds the slot afterwards. An attempt
    /// that is already cancelled, or older than the registered one, loses
    /// and is cancelled.
    pub fn claim(&self, attempt: &Attempt) -> bool {
        let mut entries = self.entries();

        match entries.get(&attempt.device_id) {
            Some(entry) if entry.generation == attempt.generation => return true,
            Some(entry) if entry.generation > attempt.generation => {
                attempt.cancel.cancel();
                return false;
            }
            _ if attempt.cancel.is_cancelled() => return false,
            _ => {}
        }

        let previous = entries.insert(
            attempt.device_id.clone(),
            Entry {
                generation: attempt.generation,
                cancel: attempt.cancel.clone(),
                commands: None,
            },
        );

        if let Some(previous) = previous {
            debug!(
                "Attempt {} for {} supersedes attempt {}",
                attempt.generation, attempt.device_id, previous.generation
            );
            previous.cancel.cancel();
        }
        true
    }

    /// Mark `attempt` active, attaching its command channel
    ///
    /// Returns `false` if a newer attempt has replaced it in the meantime.
    pub fn activate(&self, attempt: &Attempt, commands: mpsc::Sender<SessionCommand>) -> bool {
        match self.entries().get_mut(&attempt.device_id) {
            Some(entry) if entry.generation == attempt.generation && !attempt.cancel.is_cancelled() => {
                entry.commands = Some(commands);
                true
            }
            _ => false,
        }
    }

    /// Drop the entry of `attempt` unless it was already replaced
    pub fn finish(&self, attempt: &Attempt) {
        let mut entries = self.entries();
        if entries
            .get(&attempt.device_id)
            .is_some_and(|entry| entry.generation == attempt.generation)
        {
            entries.remove(&attempt.device_id);
        }
    }

    /// Whether an attempt for `device_id` is registered
    pub fn is_pending(&self, device_id: &str) -> bool {
        self.entries().contains_key(device_id)
    }

    /// Whether `device_id` has an active session
    pub fn is_active(&self, device_id: &str) -> bool {
        self.entries()
            .get(device_id)
            .is_some_and(|entry| entry.commands.is_some())
    }

    /// Ids of all active sessions
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.commands.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Command channel of the active session for `device_id`
    pub fn commands(&self, device_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.entries()
            .get(device_id)
            .and_then(|entry| entry.commands.clone())
    }

    /// Cancel the attempt or session registered for `device_id`
    pub fn cancel(&self, device_id: &str) -> bool {
        match self.entries().get(device_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered attempt and session
    pub fn cancel_all(&self) {
        for entry in self.entries().values() {
            entry.cancel.cancel();
        }
    }
}
