mod common;

use async_trait::async_trait;
use common::{collect_until, is_connected, next_event, wait_for};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uwb_proximity::{
    ConnectBehavior, ConnectionState, DeviceId, DiscoveryEvent, DriverEvent, RadioDriver,
    RetryConfig, SessionConfig, SessionEvent, SimulatedRadio, UwbSession,
};

async fn session_with(radio: Arc<SimulatedRadio>, config: SessionConfig) -> UwbSession {
    let session = UwbSession::new(radio);
    session.configure(config).await.unwrap();
    session.start().await.unwrap();
    session
}

fn is_failure(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::DeviceConnectFailed { .. })
}

#[tokio::test(start_paused = true)]
async fn test_failures_retry_with_backoff_until_ceiling() {
    let radio = Arc::new(
        SimulatedRadio::new().with_default_behavior(ConnectBehavior::Fail("no ack".to_string())),
    );
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();

    let mut timeline = Vec::new();
    let log = collect_until(&mut events, |e| {
        timeline.push(Instant::now());
        matches!(e, SessionEvent::DeviceConnectFailed { will_retry: false, .. })
    })
    .await;

    let kinds: Vec<_> = log
        .iter()
        .map(|e| match e {
            SessionEvent::DeviceConnecting { attempt, .. } => format!("connecting:{}", attempt),
            SessionEvent::DeviceConnectFailed {
                attempt, will_retry, ..
            } => format!("failed:{}:{}", attempt, will_retry),
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "connecting:1",
            "failed:1:true",
            "connecting:2",
            "failed:2:true",
            "connecting:3",
            "failed:3:false",
        ]
    );

    // Backoff between a failure and the next attempt grows: 500ms, then 1s
    assert!(timeline[2] - timeline[1] >= Duration::from_millis(500));
    assert!(timeline[4] - timeline[3] >= Duration::from_millis(1000));

    assert_eq!(radio.connect_requests("dev-1").await, 3);

    // No further automatic attempts once the ceiling is reached
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.connect_requests("dev-1").await, 3);
    assert!(events.try_recv().is_err());

    let device = session.device("dev-1").await.unwrap();
    assert_eq!(device.state, ConnectionState::Failed);
    assert_eq!(device.last_error.as_deref(), Some("Radio driver error: no ack"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover() {
    let radio = Arc::new(SimulatedRadio::new());
    radio
        .set_behavior("dev-1", ConnectBehavior::FailTimes(2, "busy".to_string()))
        .await;
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();

    let log = collect_until(&mut events, |e| is_connected(e, "dev-1")).await;
    assert_eq!(log.iter().filter(|e| is_failure(e)).count(), 2);
    assert!(matches!(
        log[log.len() - 2],
        SessionEvent::DeviceConnecting { attempt: 3, .. }
    ));
    assert_eq!(radio.connect_requests("dev-1").await, 3);

    let device = session.device("dev-1").await.unwrap();
    assert_eq!(device.state, ConnectionState::Connected);
    assert!(device.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_connect_times_out() {
    let radio = Arc::new(SimulatedRadio::new().with_default_behavior(ConnectBehavior::Hang));
    let config = SessionConfig::default().with_retry(RetryConfig {
        max_attempts: 1,
        ..RetryConfig::default()
    });
    let session = session_with(radio.clone(), config).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;

    let started = Instant::now();
    session.connect("dev-1").await.unwrap();
    let failed = wait_for(&mut events, is_failure).await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    match failed {
        SessionEvent::DeviceConnectFailed {
            error, will_retry, ..
        } => {
            assert!(error.starts_with("Timeout"), "unexpected error: {}", error);
            assert!(!will_retry);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_connect_timeout() {
    let radio = Arc::new(SimulatedRadio::new().with_default_behavior(ConnectBehavior::Hang));
    let config = SessionConfig::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_retry(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
    let session = session_with(radio.clone(), config).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;

    let started = Instant::now();
    session.connect("dev-1").await.unwrap();
    wait_for(&mut events, is_failure).await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_in_flight_attempt() {
    let radio = Arc::new(SimulatedRadio::new().with_default_behavior(ConnectBehavior::Hang));
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::DeviceConnecting { .. }
    ));

    // Let the request reach the radio before cancelling it
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.disconnect("dev-1").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::DeviceDisconnected {
            device_id: "dev-1".to_string(),
            error: None
        }
    );

    // Well past the connect timeout: the cancelled attempt must not resurface
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(
        session.device("dev-1").await.unwrap().state,
        ConnectionState::Disconnected
    );
    assert_eq!(radio.connect_requests("dev-1").await, 1);
    assert_eq!(radio.disconnect_requests("dev-1").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_driver_answer_after_disconnect_is_discarded() {
    let radio = Arc::new(SimulatedRadio::new().with_latency(Duration::from_secs(3)));
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();
    next_event(&mut events).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    session.disconnect("dev-1").await.unwrap();
    next_event(&mut events).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(
        session.device("dev-1").await.unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_retry() {
    let radio = Arc::new(
        SimulatedRadio::new().with_default_behavior(ConnectBehavior::Fail("no ack".to_string())),
    );
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();
    wait_for(&mut events, is_failure).await;

    // First retry is now waiting on its backoff timer
    session.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(radio.connect_requests("dev-1").await, 1);
    assert!(!session.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_connect_during_backoff_restarts_counter() {
    let radio = Arc::new(SimulatedRadio::new());
    radio
        .set_behavior("dev-1", ConnectBehavior::FailTimes(1, "busy".to_string()))
        .await;
    let session = session_with(radio.clone(), SessionConfig::default()).await;
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    radio.discover("dev-1", -60.0).await.unwrap();
    next_event(&mut events).await;
    session.connect("dev-1").await.unwrap();
    wait_for(&mut events, is_failure).await;

    // Failed devices accept an explicit connect; it supersedes the scheduled retry
    session.connect("dev-1").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::DeviceConnecting {
            device_id: "dev-1".to_string(),
            attempt: 1
        }
    );
    wait_for(&mut events, |e| is_connected(e, "dev-1")).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.connect_requests("dev-1").await, 2);
    assert!(events.try_recv().is_err());
}

/// Radio that takes a full second to release a device and records request order
#[derive(Default)]
struct SlowReleaseRadio {
    requests: Mutex<Vec<String>>,
    sender: Mutex<Option<mpsc::Sender<DriverEvent>>>,
}

impl SlowReleaseRadio {
    async fn discover(&self, device_id: &str) {
        let sender = self.sender.lock().unwrap().clone().expect("radio is scanning");
        sender
            .send(DriverEvent::Discovered(DiscoveryEvent::new(device_id, -60.0)))
            .await
            .unwrap();
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RadioDriver for SlowReleaseRadio {
    async fn start_scanning(
        &self,
        _config: &SessionConfig,
    ) -> uwb_proximity::Result<mpsc::Receiver<DriverEvent>> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop_scanning(&self) -> uwb_proximity::Result<()> {
        self.sender.lock().unwrap().take();
        Ok(())
    }

    async fn request_connect(&self, device_id: &DeviceId) -> uwb_proximity::Result<()> {
        self.requests.lock().unwrap().push(format!("connect {}", device_id));
        Ok(())
    }

    async fn request_disconnect(&self, device_id: &DeviceId) -> uwb_proximity::Result<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.requests.lock().unwrap().push(format!("disconnect {}", device_id));
        Ok(())
    }

    fn driver_name(&self) -> &str {
        "slow-release"
    }
}

async fn connect_slow_release(
    radio: &SlowReleaseRadio,
    session: &UwbSession,
) -> mpsc::UnboundedReceiver<SessionEvent> {
    let (_, mut events) = session.subscribe_channel().await.unwrap();
    radio.discover("dev-1").await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceDiscovered { .. })).await;
    session.connect("dev-1").await.unwrap();
    wait_for(&mut events, |e| is_connected(e, "dev-1")).await;
    events
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_slow_disconnect_before_restart() {
    let radio = Arc::new(SlowReleaseRadio::default());
    let session = UwbSession::new(radio.clone());
    session.start().await.unwrap();
    connect_slow_release(&radio, &session).await;

    session.disconnect("dev-1").await.unwrap();
    session.stop().await.unwrap();
    assert_eq!(radio.requests(), vec!["connect dev-1", "disconnect dev-1"]);

    session.start().await.unwrap();
    connect_slow_release(&radio, &session).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        radio.requests(),
        vec!["connect dev-1", "disconnect dev-1", "connect dev-1"]
    );
    assert_eq!(
        session.device("dev-1").await.unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_for_pending_disconnect() {
    let radio = Arc::new(SlowReleaseRadio::default());
    let session = UwbSession::new(radio.clone());
    session.start().await.unwrap();
    let mut events = connect_slow_release(&radio, &session).await;

    session.disconnect("dev-1").await.unwrap();
    session.connect("dev-1").await.unwrap();
    wait_for(&mut events, |e| is_connected(e, "dev-1")).await;

    assert_eq!(
        radio.requests(),
        vec!["connect dev-1", "disconnect dev-1", "connect dev-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_linked_devices_concurrently() {
    let radio = Arc::new(SlowReleaseRadio::default());
    let session = UwbSession::new(radio.clone());
    session.start().await.unwrap();
    let (_, mut events) = session.subscribe_channel().await.unwrap();

    for id in ["dev-1", "dev-2", "dev-3"] {
        radio.discover(id).await;
        wait_for(&mut events, |e| matches!(e, SessionEvent::DeviceDiscovered { .. })).await;
        session.connect(id).await.unwrap();
        wait_for(&mut events, |e| is_connected(e, id)).await;
    }

    let started = Instant::now();
    session.stop().await.unwrap();

    // Three one-second releases overlap instead of queueing
    assert!(started.elapsed() < Duration::from_secs(2));
    let disconnects = radio
        .requests()
        .into_iter()
        .filter(|r| r.starts_with("disconnect"))
        .count();
    assert_eq!(disconnects, 3);
}
