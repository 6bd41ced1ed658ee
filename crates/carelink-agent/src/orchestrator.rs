//! Main monitoring loop.
//!
//! Each tick reads one motion sample, runs the fall classifier, emits
//! heartbeats, and hands any resulting alerts to the sink. Nothing in a
//! tick waits on the modem, so the loop keeps its cadence while alerts are
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use carelink_common::config::{FallConfig, HeartbeatConfig};
use tokio::time::Instant;

use crate::dispatch::{AlertBuilder, AlertSink};
use crate::fall::{FallClassifier, FallDetected};
use crate::sensor::SampleSource;

/// Consecutive invalid samples between repeated warnings.
const INVALID_SAMPLE_LOG_EVERY: u32 = 50;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub magnitude_g: f64,
    pub fall: Option<FallDetected>,
    pub heartbeat: bool,
    /// Time budget until the next tick.
    pub next_tick: Duration,
}

pub struct Orchestrator<S> {
    source: S,
    classifier: FallClassifier,
    alerts: AlertBuilder,
    sink: Arc<dyn AlertSink>,
    heartbeat: HeartbeatConfig,
    iterations: u64,
    heartbeats: u64,
    last_heartbeat: Instant,
    invalid_streak: u32,
}

impl<S: SampleSource> Orchestrator<S> {
    pub fn new(
        source: S,
        fall: FallConfig,
        alerts: AlertBuilder,
        sink: Arc<dyn AlertSink>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Orchestrator {
            source,
            classifier: FallClassifier::new(fall),
            alerts,
            sink,
            heartbeat,
            iterations: 0,
            heartbeats: 0,
            last_heartbeat: Instant::now(),
            invalid_streak: 0,
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run one monitoring step at `now`.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        self.iterations += 1;

        let sample = self.source.read();
        if sample.ok {
            if self.invalid_streak > 0 {
                tracing::info!(missed = self.invalid_streak, "IMU readings recovered");
            }
            self.invalid_streak = 0;
        } else {
            self.invalid_streak += 1;
            if self.invalid_streak % INVALID_SAMPLE_LOG_EVERY == 1 {
                tracing::warn!(consecutive = self.invalid_streak, "invalid IMU sample");
            }
        }

        let fall = self.classifier.classify(&sample, now);
        if let Some(detected) = fall {
            self.sink.dispatch(self.alerts.fall(detected.impact_g));
        }

        let heartbeat = now.saturating_duration_since(self.last_heartbeat) >= self.heartbeat.interval;
        if heartbeat {
            self.on_heartbeat(now);
        }

        TickReport {
            magnitude_g: self.classifier.last_magnitude_g(),
            fall,
            heartbeat,
            next_tick: self.classifier.tick_period(),
        }
    }

    fn on_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.heartbeats += 1;
        tracing::info!(
            iterations = self.iterations,
            heartbeats = self.heartbeats,
            magnitude_g = format_args!("{:.2}", self.classifier.last_magnitude_g()),
            rate_hz = self.classifier.recommended_rate(),
            "[HEARTBEAT] monitoring"
        );
        self.sink.heartbeat();

        let every = u64::from(self.heartbeat.location_every);
        if every > 0 && self.heartbeats % every == 0 {
            match self.alerts.location_update() {
                Some(event) => self.sink.dispatch(event),
                None => tracing::debug!("no GPS fix, skipping location update"),
            }
        }
    }

    /// Tick forever at the classifier's recommended cadence.
    pub async fn run(mut self) {
        tracing::info!("monitoring started");
        loop {
            let started = Instant::now();
            let report = self.tick(started);
            tokio::time::sleep_until(started + report.next_tick).await;
        }
    }
}
