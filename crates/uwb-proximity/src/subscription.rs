// Subscriber fan-out for session notifications

use crate::{Device, DeviceId, PositionSample, Result, SessionEvent, UwbError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Receives session notifications. Every handler is optional; the defaults do nothing.
///
/// Handlers run on the session's event path, so they should return quickly and never block.
pub trait SessionObserver: Send + Sync {
    fn on_position(&self, _sample: PositionSample) {}

    fn on_discover(&self, _device: &Device) {}

    fn on_update(&self, _device: &Device) {}

    fn on_connecting(&self, _device_id: &DeviceId, _attempt: u32) {}

    fn on_connect(&self, _device_id: &DeviceId) {}

    fn on_connect_failed(&self, _device_id: &DeviceId, _error: &str, _will_retry: bool) {}

    fn on_disconnect(&self, _device_id: &DeviceId, _error: Option<&str>) {}

    /// The device was evicted when the registry hit its capacity limit
    fn on_remove(&self, _device_id: &DeviceId) {}

    fn on_session_terminated(&self, _reason: &str) {}

    fn on_session_stopped(&self) {}

    /// Entry point used by the session; routes to the typed handlers above
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceDiscovered { device } => self.on_discover(device),
            SessionEvent::DeviceUpdated { device } => self.on_update(device),
            SessionEvent::DeviceConnecting { device_id, attempt } => {
                self.on_connecting(device_id, *attempt)
            }
            SessionEvent::DeviceConnected { device_id } => self.on_connect(device_id),
            SessionEvent::DeviceConnectFailed {
                device_id,
                error,
                will_retry,
                ..
            } => self.on_connect_failed(device_id, error, *will_retry),
            SessionEvent::DeviceDisconnected { device_id, error } => {
                self.on_disconnect(device_id, error.as_deref())
            }
            SessionEvent::DeviceRemoved { device_id } => self.on_remove(device_id),
            SessionEvent::PositionUpdated { sample } => self.on_position(sample.clone()),
            SessionEvent::SessionTerminated { reason } => self.on_session_terminated(reason),
            SessionEvent::SessionStopped => self.on_session_stopped(),
        }
    }
}

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

/// Observer that forwards every event into an unbounded channel
struct ChannelObserver {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionObserver for ChannelObserver {
    fn on_event(&self, event: &SessionEvent) {
        // A closed receiver just means the subscriber went away
        let _ = self.sender.send(event.clone());
    }
}

#[derive(Default)]
pub struct SubscriberSet {
    observers: Vec<(SubscriptionHandle, Arc<dyn SessionObserver>)>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn SessionObserver>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(Uuid::new_v4());
        self.observers.push((handle, observer));
        debug!("Added subscriber {} ({} total)", handle.0, self.observers.len());
        handle
    }

    pub fn subscribe_channel(&mut self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self.subscribe(Arc::new(ChannelObserver { sender }));
        (handle, receiver)
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<()> {
        let before = self.observers.len();
        self.observers.retain(|(h, _)| *h != handle);
        if self.observers.len() == before {
            return Err(UwbError::SubscriptionNotFound(handle.0));
        }
        debug!("Removed subscriber {}", handle.0);
        Ok(())
    }

    /// Deliver one event to every current subscriber
    pub fn publish(&self, event: &SessionEvent) {
        for (_, observer) in &self.observers {
            observer.on_event(event);
        }
    }
}
