// Shared helpers for session-level tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uwb_proximity::{SessionEvent, SimulatedRadio, UwbSession};

const EVENT_WAIT: Duration = Duration::from_secs(120);

/// Session over a fresh simulated radio, already started
pub async fn started_session(radio: SimulatedRadio) -> (Arc<SimulatedRadio>, UwbSession) {
    let radio = Arc::new(radio);
    let session = UwbSession::new(radio.clone());
    session.start().await.expect("session should start");
    (radio, session)
}

pub async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Skip events until one matches
pub async fn wait_for<F>(events: &mut UnboundedReceiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Collect events up to and including the first one that matches
pub async fn collect_until<F>(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut last: F,
) -> Vec<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut collected = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = last(&event);
        collected.push(event);
        if done {
            return collected;
        }
    }
}

pub fn is_connected(event: &SessionEvent, id: &str) -> bool {
    matches!(event, SessionEvent::DeviceConnected { device_id } if device_id == id)
}
