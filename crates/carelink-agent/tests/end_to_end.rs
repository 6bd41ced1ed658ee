//! # End-to-end: IMU → classifier → dispatcher → modem
//!
//! The full monitoring pipeline against the simulated modem and a scripted
//! motion source, on tokio's paused clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carelink_agent::dispatch::{AlertBuilder, AlertDispatcher};
use carelink_agent::modem::{ModemDriver, SessionState};
use carelink_agent::orchestrator::Orchestrator;
use carelink_agent::position::PositionTracker;
use carelink_agent::sensor::{MotionSample, SampleSource};
use carelink_agent::sim::{self, ModemBehavior, SimulatedModem, SimulatedModemHandle};
use carelink_common::config::{
    FallConfig, HeartbeatConfig, ModemConfig, PatientConfig, PositionConfig,
};
use carelink_common::models::Coordinates;
use tokio::io::BufReader;
use tokio::time::Instant;

const DEST: &str = "+15550100";

// ─── Helpers ────────────────────────────────────────────────────────────────

/// 3 g between `from` and `from + 150 ms` after creation, 1 g otherwise.
struct ImpactAt {
    origin: Instant,
    from: Duration,
    reads: Arc<AtomicU64>,
}

impl SampleSource for ImpactAt {
    fn read(&mut self) -> MotionSample {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let t = self.origin.elapsed();
        let g = if t >= self.from && t < self.from + Duration::from_millis(150) {
            3.0
        } else {
            1.0
        };
        MotionSample::from_magnitude_g(g)
    }
}

struct Rig {
    modem: SimulatedModemHandle,
    driver: Arc<ModemDriver>,
    position: Arc<PositionTracker>,
    reads: Arc<AtomicU64>,
}

fn start(behavior: ModemBehavior, impact_after: Duration) -> Rig {
    let (modem, handle) = SimulatedModem::new(behavior);
    let driver = Arc::new(ModemDriver::new(
        Box::new(modem),
        Arc::new(handle.reset_line()),
        ModemConfig {
            destination: DEST.into(),
            ..ModemConfig::default()
        },
    ));
    let position = Arc::new(PositionTracker::new(PositionConfig::default()));
    let reads = Arc::new(AtomicU64::new(0));

    let orchestrator = Orchestrator::new(
        ImpactAt {
            origin: Instant::now(),
            from: impact_after,
            reads: reads.clone(),
        },
        FallConfig::default(),
        AlertBuilder::new(
            PatientConfig {
                id: "PATIENT_001".into(),
                device_tag: "PiZero".into(),
            },
            position.clone(),
        ),
        Arc::new(AlertDispatcher::new(driver.clone(), DEST)),
        HeartbeatConfig::default(),
    );
    tokio::spawn(orchestrator.run());

    Rig {
        modem: handle,
        driver,
        position,
        reads,
    }
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fall_is_delivered_as_one_sms() {
    let rig = start(ModemBehavior::default(), Duration::from_secs(2));
    rig.driver.initialize().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let sent = rig.modem.messages();
    assert_eq!(sent.len(), 1, "{sent:?}");
    assert_eq!(sent[0].destination, DEST);
    let fields: Vec<&str> = sent[0].body.split('|').collect();
    assert_eq!(fields[0], "FALL_ALERT");
    assert_eq!(fields[1], "PATIENT_001");
    assert_eq!(fields[2], "NO_GPS_FIX");
    assert_eq!(fields[3], "GPS_NO_FIX");
    assert_eq!(fields[4].len(), "HH:MM:SS".len());
    assert_eq!(fields[5], "Impact:3.00g");
    assert_eq!(fields[6], "Device:PiZero");
}

#[tokio::test(start_paused = true)]
async fn fall_alert_carries_gps_position() {
    let rig = start(ModemBehavior::default(), Duration::from_secs(5));

    let origin = Coordinates {
        latitude: 48.1173,
        longitude: 11.5167,
    };
    let tracker = rig.position.clone();
    tokio::spawn(async move {
        let feed = sim::gps_feed(origin, Duration::from_secs(1));
        tracker.run(BufReader::new(feed)).await
    });

    tokio::time::sleep(Duration::from_secs(30)).await;

    let sent = rig.modem.messages();
    assert_eq!(sent.len(), 1, "{sent:?}");
    let fields: Vec<&str> = sent[0].body.split('|').collect();
    let (lat, lon) = fields[2].split_once(',').unwrap();
    assert!((lat.parse::<f64>().unwrap() - origin.latitude).abs() < 0.001);
    assert!((lon.parse::<f64>().unwrap() - origin.longitude).abs() < 0.001);
    assert!(fields[3].starts_with("GPS_OK("), "{}", fields[3]);
}

#[tokio::test(start_paused = true)]
async fn dead_modem_never_stalls_monitoring() {
    let rig = start(
        ModemBehavior {
            responsive: false,
            ..ModemBehavior::default()
        },
        Duration::from_secs(1),
    );

    // Short of the second heartbeat, which would start another recovery.
    tokio::time::sleep(Duration::from_secs(110)).await;

    // The alert went nowhere, but the loop kept sampling at ≥ 5 Hz the
    // whole time the modem was being probed and reset.
    assert!(rig.modem.messages().is_empty());
    assert!(rig.modem.resets() >= 1);
    assert_eq!(rig.driver.state(), SessionState::Faulted);
    assert!(rig.reads.load(Ordering::Relaxed) >= 5 * 109);
}

#[tokio::test(start_paused = true)]
async fn location_updates_follow_heartbeats() {
    let rig = start(ModemBehavior::default(), Duration::from_secs(100_000));
    let tracker = rig.position.clone();
    tokio::spawn(async move {
        let feed = sim::gps_feed(
            Coordinates {
                latitude: 51.5,
                longitude: -0.125,
            },
            Duration::from_secs(1),
        );
        tracker.run(BufReader::new(feed)).await
    });

    // Heartbeats at 60 s intervals; the fifth carries a location update.
    tokio::time::sleep(Duration::from_secs(5 * 60 + 30)).await;

    let sent = rig.modem.messages();
    assert_eq!(sent.len(), 1, "{sent:?}");
    let fields: Vec<&str> = sent[0].body.split('|').collect();
    assert_eq!(fields[..2], ["LOCATION_UPDATE", "PATIENT_001"]);
    let (lat, lon) = fields[2].split_once(',').unwrap();
    assert!((lat.parse::<f64>().unwrap() - 51.5).abs() < 0.001);
    assert!((lon.parse::<f64>().unwrap() + 0.125).abs() < 0.001);
    assert!(!sent[0].body.contains("Impact:"));
}
