mod logging;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use uwb_proximity::{
    ConnectBehavior, Device, DeviceId, DiscoveryEvent, DriverEvent, PositionRefiner,
    PositionSample, RawPositionSample, SessionConfig, SessionEvent, SessionObserver,
    SimulatedRadio, UwbSession,
};

const DEFAULT_DEMO_DURATION_SECS: u64 = 15;

/// Logs every session callback
struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_position(&self, sample: PositionSample) {
        tracing::info!(
            device_id = %sample.device_id,
            distance = sample.distance,
            angle = ?sample.angle,
            sequence = sample.sequence,
            "Position update"
        );
    }

    fn on_discover(&self, device: &Device) {
        tracing::info!(
            device_id = %device.id,
            signal_strength = device.signal_strength,
            "Discovered device"
        );
    }

    fn on_connect(&self, device_id: &DeviceId) {
        tracing::info!(device_id = %device_id, "Connected to device");
    }

    fn on_connect_failed(&self, device_id: &DeviceId, error: &str, will_retry: bool) {
        tracing::warn!(device_id = %device_id, error = %error, will_retry, "Connection failed");
    }

    fn on_disconnect(&self, device_id: &DeviceId, error: Option<&str>) {
        match error {
            Some(error) => tracing::warn!(device_id = %device_id, error = %error, "Disconnected from device"),
            None => tracing::info!(device_id = %device_id, "Disconnected from device"),
        }
    }

    fn on_remove(&self, device_id: &DeviceId) {
        tracing::info!(device_id = %device_id, "Device evicted from registry");
    }

    fn on_session_terminated(&self, reason: &str) {
        tracing::error!(reason = %reason, "Session terminated");
    }
}

/// Stand-in for camera assist: snaps distance to centimetres
struct CentimetreRefiner;

impl PositionRefiner for CentimetreRefiner {
    fn refine(&self, mut sample: PositionSample) -> PositionSample {
        sample.distance = (sample.distance * 100.0).round() / 100.0;
        sample
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(logging::LogFormat::from_env());

    let config = SessionConfig::from_env()?;
    tracing::info!(
        auto_connect = config.auto_connect,
        camera_assisted = config.camera_assisted,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        "Configuration loaded successfully"
    );

    let duration = Duration::from_secs(
        std::env::var("UWB_DEMO_DURATION_SECS")
            .unwrap_or_else(|_| DEFAULT_DEMO_DURATION_SECS.to_string())
            .parse()?,
    );

    let radio = Arc::new(SimulatedRadio::new().with_latency(Duration::from_millis(250)));
    radio
        .set_behavior("tag-garage", ConnectBehavior::Fail("peer out of range".to_string()))
        .await;

    let session = if config.camera_assisted {
        UwbSession::with_refiner(radio.clone(), Arc::new(CentimetreRefiner))
    } else {
        UwbSession::new(radio.clone())
    };
    let auto_connect = config.auto_connect;
    session.configure(config).await?;

    let info = session.start().await?;
    tracing::info!(session_id = %info.session_id, "Ranging session started");

    session.subscribe(Arc::new(LoggingObserver)).await?;
    let (_, mut events) = session.subscribe_channel().await?;

    let script = tokio::spawn(run_script(radio.clone()));

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::info!("Demo duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(SessionEvent::DeviceDiscovered { device }) if !auto_connect => {
                        if let Err(e) = session.connect(&device.id).await {
                            tracing::warn!(device_id = %device.id, error = %e.user_message(), "Connect request rejected");
                        }
                    }
                    Some(SessionEvent::SessionTerminated { .. }) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    script.abort();

    if session.is_running().await {
        let stats = session.stats().await?;
        tracing::info!(stats = %serde_json::to_string(&stats)?, "Session statistics");
        session.stop().await?;
    }

    tracing::info!("Demo finished");
    Ok(())
}

/// Feeds discoveries and ranging samples into the simulated radio
async fn run_script(radio: Arc<SimulatedRadio>) -> uwb_proximity::Result<()> {
    let tags = [
        ("tag-keys", -48.0, "Keys"),
        ("tag-wallet", -61.0, "Wallet"),
        ("tag-garage", -79.0, "Garage door"),
    ];

    for (id, rssi, label) in tags {
        radio
            .emit(DriverEvent::Discovered(
                DiscoveryEvent::new(id, rssi).with_metadata("name", serde_json::json!(label)),
            ))
            .await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let mut sequence = 0u64;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        sequence += 1;

        // Keys slowly approach, the wallet orbits at a fixed range
        let keys_distance = (4.0 - 0.1 * sequence as f64).max(0.2);
        radio
            .range(RawPositionSample::new("tag-keys", keys_distance, sequence).with_angle(0.35))
            .await?;

        let bearing = (sequence as f64 * 0.2).sin() * std::f64::consts::FRAC_PI_2;
        radio
            .range(RawPositionSample::new("tag-wallet", 2.5, sequence).with_angle(bearing))
            .await?;
    }
}
