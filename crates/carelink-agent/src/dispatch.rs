//! Alert construction and fire-and-forget delivery.
//!
//! The monitoring loop must never wait on the modem. [`AlertDispatcher`]
//! hands each alert to its own task; the outcome is logged there and never
//! reported back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use carelink_common::config::PatientConfig;
use carelink_common::models::AlertEvent;

use crate::modem::{ModemDriver, SessionState};
use crate::position::PositionTracker;

/// Builds alert events stamped with the patient identity, the current
/// position and local wall-clock time.
pub struct AlertBuilder {
    patient: PatientConfig,
    position: Arc<PositionTracker>,
}

impl AlertBuilder {
    pub fn new(patient: PatientConfig, position: Arc<PositionTracker>) -> Self {
        AlertBuilder { patient, position }
    }

    pub fn fall(&self, impact_g: f64) -> AlertEvent {
        let (fix, status) = self.position.snapshot();
        AlertEvent::fall(
            &self.patient.id,
            &self.patient.device_tag,
            fix.map(|f| f.coordinates),
            status,
            impact_g,
            chrono::Local::now(),
        )
    }

    /// `None` when there is no fresh fix to report.
    pub fn location_update(&self) -> Option<AlertEvent> {
        let (fix, status) = self.position.snapshot();
        let fix = fix?;
        Some(AlertEvent::location_update(
            &self.patient.id,
            &self.patient.device_tag,
            fix.coordinates,
            status,
            chrono::Local::now(),
        ))
    }
}

/// Where the monitoring loop sends alerts. Implementations must return
/// promptly.
pub trait AlertSink: Send + Sync {
    fn dispatch(&self, event: AlertEvent);

    /// Called once per monitoring heartbeat.
    fn heartbeat(&self) {}
}

/// Delivers alerts as text messages through the modem.
pub struct AlertDispatcher {
    driver: Arc<ModemDriver>,
    destination: Arc<str>,
    recovering: Arc<AtomicBool>,
}

impl AlertDispatcher {
    pub fn new(driver: Arc<ModemDriver>, destination: impl Into<Arc<str>>) -> Self {
        AlertDispatcher {
            driver,
            destination: destination.into(),
            recovering: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl AlertSink for AlertDispatcher {
    fn dispatch(&self, event: AlertEvent) {
        let kind = event.kind();
        let payload = event.to_payload();
        tracing::info!(kind = %kind, payload = %payload, "dispatching alert");

        let driver = self.driver.clone();
        let destination = self.destination.clone();
        tokio::spawn(async move {
            match driver.deliver(&destination, &payload).await {
                Ok(receipt) => tracing::info!(
                    kind = %kind,
                    attempt = receipt.attempt,
                    "alert delivered"
                ),
                Err(e) => tracing::error!(kind = %kind, error = %e, "alert delivery failed"),
            }
        });
    }

    /// Kick off a recovery when the session is faulted, at most one at a
    /// time.
    fn heartbeat(&self) {
        let session = self.driver.session();
        tracing::info!(
            modem = %session.state,
            exchanges = session.exchanges,
            hardware_resets = session.hardware_resets,
            "[HEARTBEAT] modem"
        );
        if session.state != SessionState::Faulted || self.recovering.swap(true, Ordering::AcqRel) {
            return;
        }

        let driver = self.driver.clone();
        let recovering = self.recovering.clone();
        tokio::spawn(async move {
            tracing::warn!("modem faulted, attempting recovery");
            match driver.recover().await {
                Ok(()) => tracing::info!("modem recovered"),
                Err(e) => tracing::error!(error = %e, "modem recovery failed"),
            }
            recovering.store(false, Ordering::Release);
        });
    }
}
