//! Shared supervisor state
//!
//! Everything that would otherwise be process-wide mutable state lives in a
//! [`SupervisorContext`] that is handed to each component at construction, so
//! independent instances can coexist (tests create one per case).

use crate::process::LiveProcessSet;
use hostgate_types::{BackendAddress, SupervisorEvent, UpdateFeedKind, UpdateFeedState};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Callback fired once the backend address is known
pub type ServiceUpCallback = Box<dyn FnOnce(&str, u16) -> anyhow::Result<()> + Send + 'static>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct ReadinessState {
    address: BackendAddress,
    /// Whether the address for the current backend start was delivered
    delivered: bool,
    pending: Vec<ServiceUpCallback>,
}

/// State shared by every component of one supervisor instance
pub struct SupervisorContext {
    readiness: Mutex<ReadinessState>,
    feed: RwLock<UpdateFeedState>,
    live: LiveProcessSet,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorContext {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            readiness: Mutex::new(ReadinessState::default()),
            feed: RwLock::new(UpdateFeedState::default()),
            live: LiveProcessSet::new(),
            events,
        }
    }

    fn readiness(&self) -> MutexGuard<'_, ReadinessState> {
        self.readiness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current backend address (`port == 0` while unknown)
    pub fn backend_address(&self) -> BackendAddress {
        self.readiness().address.clone()
    }

    /// Forget the previous backend's address ahead of a new start.
    ///
    /// Callbacks registered before this call stay queued for the new start.
    pub fn begin_backend_start(&self) {
        let mut state = self.readiness();
        state.address = BackendAddress::unset();
        state.delivered = false;
    }

    /// Back to `localhost:0`, used at shutdown
    pub fn reset_backend_address(&self) {
        self.begin_backend_start();
    }

    /// Record the address for the current start and hand back the queued
    /// callbacks. Returns `None` if this start already has an address.
    pub(crate) fn deliver_address(
        &self,
        host: &str,
        port: u16,
    ) -> Option<Vec<ServiceUpCallback>> {
        let mut state = self.readiness();
        if state.delivered {
            return None;
        }
        state.address = BackendAddress::new(host, port);
        state.delivered = true;
        Some(std::mem::take(&mut state.pending))
    }

    /// Queue a callback, or give it back together with the address when the
    /// address for this start is already known.
    pub(crate) fn register_service_up(
        &self,
        callback: ServiceUpCallback,
    ) -> Option<(ServiceUpCallback, BackendAddress)> {
        let mut state = self.readiness();
        if state.delivered {
            return Some((callback, state.address.clone()));
        }
        state.pending.push(callback);
        None
    }

    pub fn pending_service_up_count(&self) -> usize {
        self.readiness().pending.len()
    }

    pub fn feed_state(&self) -> UpdateFeedState {
        *self.feed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch the update feed to the fallback for the rest of the run.
    /// Returns `true` only for the call that performed the switch.
    pub fn switch_to_fallback(&self) -> bool {
        let mut feed = self.feed.write().unwrap_or_else(PoisonError::into_inner);
        if feed.active == UpdateFeedKind::Fallback {
            return false;
        }
        feed.active = UpdateFeedKind::Fallback;
        true
    }

    pub fn live_processes(&self) -> &LiveProcessSet {
        &self.live
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Notify the embedding application; nobody listening is not an error
    pub fn emit(&self, event: SupervisorEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!(event = name, "No subscribers for supervisor event");
        }
    }
}

impl Default for SupervisorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SupervisorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorContext")
            .field("address", &self.backend_address())
            .field("feed", &self.feed_state())
            .field("live_processes", &self.live.len())
            .finish()
    }
}
