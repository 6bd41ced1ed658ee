//! # Fall Classifier
//!
//! Threshold/duration state machine over acceleration magnitude.
//!
//! ```text
//!            mag > threshold
//!   Idle ───────────────────────▶ ImpactWindow
//!    ▲                               │  mag > threshold: refresh last_high
//!    │  elapsed > impact_duration    │
//!    ├───────────────────────────────┤  (FallDetected unless in cooldown)
//!    │  quiet > subside_after        │
//!    └───────────────────────────────┘  (no result)
//! ```
//!
//! The classifier also recommends the sampling rate: high while anything
//! interesting is happening, low otherwise. At the low rate a fall is
//! noticed at most one low-rate tick late, and the high rate then resolves
//! the impact window.

use std::time::Duration;

use carelink_common::config::{FallConfig, MAX_RATE_HZ, MIN_RATE_HZ};
use tokio::time::Instant;

use crate::sensor::MotionSample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallState {
    Idle,
    ImpactWindow {
        started_at: Instant,
        last_high_at: Instant,
        /// Largest magnitude seen in this window, reported as the impact.
        peak_g: f64,
    },
}

/// A confirmed fall.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallDetected {
    pub impact_g: f64,
    /// Time from the first above-threshold sample to confirmation.
    pub window: Duration,
}

pub struct FallClassifier {
    config: FallConfig,
    state: FallState,
    last_fall_at: Option<Instant>,
    last_magnitude_g: f64,
}

impl FallClassifier {
    pub fn new(config: FallConfig) -> Self {
        FallClassifier {
            config,
            state: FallState::Idle,
            last_fall_at: None,
            last_magnitude_g: 0.0,
        }
    }

    pub fn state(&self) -> FallState {
        self.state
    }

    /// Magnitude of the most recent sample, in g.
    pub fn last_magnitude_g(&self) -> f64 {
        self.last_magnitude_g
    }

    /// Feed one sample taken at `now`.
    pub fn classify(&mut self, sample: &MotionSample, now: Instant) -> Option<FallDetected> {
        let magnitude = sample.magnitude_g();
        self.last_magnitude_g = magnitude;

        if magnitude > self.config.threshold_g {
            match &mut self.state {
                FallState::Idle => {
                    tracing::warn!(magnitude_g = magnitude, "impact detected");
                    self.state = FallState::ImpactWindow {
                        started_at: now,
                        last_high_at: now,
                        peak_g: magnitude,
                    };
                }
                FallState::ImpactWindow {
                    last_high_at,
                    peak_g,
                    ..
                } => {
                    *last_high_at = now;
                    *peak_g = peak_g.max(magnitude);
                }
            }
        }

        let FallState::ImpactWindow {
            started_at,
            last_high_at,
            peak_g,
        } = self.state
        else {
            return None;
        };

        let window = now.saturating_duration_since(started_at);
        if window > self.config.impact_duration {
            self.state = FallState::Idle;
            if self.in_cooldown(now) {
                tracing::info!(
                    window_ms = window.as_millis() as u64,
                    "impact confirmed during alert cooldown, suppressed"
                );
                return None;
            }
            tracing::error!(
                window_ms = window.as_millis() as u64,
                impact_g = peak_g,
                "FALL CONFIRMED"
            );
            self.last_fall_at = Some(now);
            return Some(FallDetected {
                impact_g: peak_g,
                window,
            });
        }

        if now.saturating_duration_since(last_high_at) > self.config.subside_after {
            tracing::info!(window_ms = window.as_millis() as u64, "impact subsided");
            self.state = FallState::Idle;
        }
        None
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.last_fall_at
            .is_some_and(|at| now.saturating_duration_since(at) <= self.config.cooldown)
    }

    /// Sampling rate (Hz) for the next tick.
    pub fn recommended_rate(&self) -> f64 {
        let watching = self.last_magnitude_g > self.config.watch_threshold_g
            || matches!(self.state, FallState::ImpactWindow { .. });
        if watching {
            self.config.high_rate_hz
        } else {
            self.config.low_rate_hz
        }
    }

    /// Tick budget at the recommended rate.
    pub fn tick_period(&self) -> Duration {
        // `max` also maps NaN to the floor.
        let rate = self.recommended_rate().max(MIN_RATE_HZ).min(MAX_RATE_HZ);
        Duration::from_secs_f64(1.0 / rate)
    }
}
