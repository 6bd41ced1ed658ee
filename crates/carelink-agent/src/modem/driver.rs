//! Modem session driver: probing, initialization and recovery.
//!
//! Recovery escalates in three steps: a plain probe, a soft
//! re-initialization (repeated probes with backoff), and finally a hardware
//! reset followed by a stabilization wait and one more initialization. The
//! session stays `Initializing` throughout. Only if the post-reset
//! initialization fails is it `Faulted`, and every send then fails fast
//! until [`ModemDriver::recover`] succeeds.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use carelink_common::config::ModemConfig;

use super::exchange::{self, CommandExchange, ExchangeResult, ExchangeTiming, OK};
use super::session::{
    parse_registration, parse_signal_quality, ModemSession, Registration, SessionState,
    SignalQuality,
};
use super::transport::{HardwareReset, Transport};
use super::ModemError;

pub struct ModemDriver {
    /// Exclusive channel access. Held for a whole exchange, or a whole
    /// submission sequence, so commands never interleave.
    pub(super) channel: tokio::sync::Mutex<Box<dyn Transport>>,
    session: Mutex<ModemSession>,
    /// Only one task escalates recovery at a time.
    recovery: tokio::sync::Mutex<()>,
    reset: Arc<dyn HardwareReset>,
    pub(super) config: ModemConfig,
    pub(super) timing: ExchangeTiming,
}

impl ModemDriver {
    pub fn new(
        transport: Box<dyn Transport>,
        reset: Arc<dyn HardwareReset>,
        config: ModemConfig,
    ) -> Self {
        let timing = ExchangeTiming {
            poll_interval: config.poll_interval,
            drain_attempts: config.drain_attempts,
        };
        ModemDriver {
            channel: tokio::sync::Mutex::new(transport),
            session: Mutex::new(ModemSession::default()),
            recovery: tokio::sync::Mutex::new(()),
            reset,
            config,
            timing,
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn session(&self) -> ModemSession {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    fn update<R>(&self, f: impl FnOnce(&mut ModemSession) -> R) -> R {
        f(&mut self.session.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.update(|s| std::mem::replace(&mut s.state, state));
        if previous != state {
            tracing::info!(from = %previous, to = %state, "modem session state");
        }
    }

    pub(super) fn record(&self, result: &ExchangeResult) {
        self.update(|s| {
            s.exchanges += 1;
            s.last_outcome = Some(result.outcome);
        });
        tracing::debug!(
            command = result.command.as_deref().unwrap_or("<listen>"),
            outcome = ?result.outcome,
            elapsed_ms = result.elapsed.as_millis() as u64,
            response = %result.response.trim(),
            "modem exchange"
        );
    }

    // ── Exchanges ───────────────────────────────────────────────────

    /// Run one exchange with exclusive use of the channel.
    pub async fn exchange(&self, exchange: CommandExchange) -> ExchangeResult {
        let result = {
            let mut channel = self.channel.lock().await;
            exchange::perform(&mut **channel, exchange, &self.timing).await
        };
        self.record(&result);
        result
    }

    /// Send `command` and wait up to `deadline` for `expected`.
    pub async fn send(&self, command: &str, expected: &str, deadline: Duration) -> ExchangeResult {
        self.exchange(
            CommandExchange::command(command)
                .expect(expected)
                .deadline(deadline)
                .idle_window(Some(self.config.idle_window)),
        )
        .await
    }

    /// Single `AT` round trip.
    pub async fn probe(&self) -> bool {
        let ok = self.send("AT", OK, self.config.probe_timeout).await.succeeded();
        if ok {
            self.update(|s| s.probe_failures = 0);
        } else {
            self.update(|s| s.probe_failures += 1);
        }
        ok
    }

    pub async fn set_text_mode(&self) -> bool {
        self.send("AT+CMGF=1", OK, self.config.command_timeout)
            .await
            .succeeded()
    }

    pub async fn registration(&self) -> Registration {
        let result = self.send("AT+CREG?", OK, self.config.command_timeout).await;
        parse_registration(&result.response).unwrap_or(Registration::Unknown)
    }

    pub async fn signal_quality(&self) -> Option<SignalQuality> {
        let result = self.send("AT+CSQ", OK, self.config.command_timeout).await;
        parse_signal_quality(&result.response)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Probe up to `probe_attempts` times with backoff in between.
    /// Ends `Ready`, or `Faulted` with [`ModemError::Unresponsive`].
    pub async fn initialize(&self) -> Result<(), ModemError> {
        if self.bring_up().await {
            return Ok(());
        }
        let attempts = self.config.probe_attempts;
        self.set_state(SessionState::Faulted);
        tracing::error!(attempts, "modem unresponsive, session faulted");
        Err(ModemError::Unresponsive { attempts })
    }

    /// Probe with backoff. On failure the session stays `Initializing`, so
    /// callers can still escalate before giving up on it.
    async fn bring_up(&self) -> bool {
        self.set_state(SessionState::Initializing);
        let attempts = self.config.probe_attempts;

        for attempt in 1..=attempts {
            if self.probe().await {
                self.set_state(SessionState::Ready);
                self.log_diagnostics().await;
                return true;
            }
            tracing::warn!(attempt, attempts, "modem did not answer probe");
            if attempt < attempts {
                tokio::time::sleep(self.config.probe_backoff).await;
            }
        }
        false
    }

    async fn log_diagnostics(&self) {
        if !self.set_text_mode().await {
            tracing::warn!("modem rejected text mode during initialization");
        }
        let registration = self.registration().await;
        let signal = self.signal_quality().await;
        tracing::info!(
            registration = %registration,
            rssi = ?signal.map(|q| q.rssi),
            dbm = ?signal.and_then(|q| q.dbm()),
            "modem ready"
        );
    }

    /// Make sure the modem answers before a send, escalating as needed.
    pub async fn ensure_ready(&self) -> Result<(), ModemError> {
        if self.state() == SessionState::Faulted {
            return Err(ModemError::Faulted);
        }
        if self.probe().await {
            self.set_state(SessionState::Ready);
            return Ok(());
        }

        let _recovery = self.recovery.lock().await;
        // Another task may have finished escalating while we waited.
        let state = self.state();
        if state == SessionState::Faulted {
            return Err(ModemError::Faulted);
        }
        if state == SessionState::Ready && self.probe().await {
            return Ok(());
        }

        tracing::warn!("modem not responding, re-initializing");
        if self.bring_up().await {
            return Ok(());
        }
        tracing::warn!("soft re-initialization failed, escalating to hardware reset");
        self.reset_and_initialize().await
    }

    /// Hardware reset plus re-initialization. The way out of `Faulted`.
    pub async fn recover(&self) -> Result<(), ModemError> {
        let _recovery = self.recovery.lock().await;
        if self.state() == SessionState::Ready {
            return Ok(());
        }
        self.reset_and_initialize().await
    }

    /// Stays `Initializing` until the post-reset initialization settles
    /// the session one way or the other.
    async fn reset_and_initialize(&self) -> Result<(), ModemError> {
        self.set_state(SessionState::Initializing);
        let resets = self.update(|s| {
            s.hardware_resets += 1;
            s.hardware_resets
        });
        tracing::warn!(resets, "resetting modem hardware");
        if let Err(e) = self.reset.reset().await {
            tracing::error!(error = %e, "modem hardware reset failed");
        }
        tokio::time::sleep(self.config.stabilize).await;
        self.initialize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ModemBehavior, SimulatedModem};

    fn driver(behavior: ModemBehavior) -> (ModemDriver, crate::sim::SimulatedModemHandle) {
        let (modem, handle) = SimulatedModem::new(behavior);
        let driver = ModemDriver::new(
            Box::new(modem),
            Arc::new(handle.reset_line()),
            ModemConfig {
                destination: "+15550100".into(),
                ..ModemConfig::default()
            },
        );
        (driver, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_reaches_ready() {
        let (d, handle) = driver(ModemBehavior::default());
        assert_eq!(d.state(), SessionState::Uninitialized);
        d.initialize().await.unwrap();
        assert_eq!(d.state(), SessionState::Ready);

        let commands = handle.commands();
        assert_eq!(commands.first().map(String::as_str), Some("AT"));
        assert!(commands.iter().any(|c| c == "AT+CMGF=1"));
        assert!(commands.iter().any(|c| c == "AT+CREG?"));
        assert!(commands.iter().any(|c| c == "AT+CSQ"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_modem_faults_after_all_probes() {
        let (d, handle) = driver(ModemBehavior {
            responsive: false,
            ..ModemBehavior::default()
        });
        let started = tokio::time::Instant::now();
        let err = d.initialize().await.unwrap_err();
        assert!(matches!(err, ModemError::Unresponsive { attempts: 5 }));
        assert_eq!(d.state(), SessionState::Faulted);
        assert_eq!(handle.commands().iter().filter(|c| *c == "AT").count(), 5);
        // Four backoffs between five probes, no backoff after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(20), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_session_fails_fast() {
        let (d, handle) = driver(ModemBehavior {
            responsive: false,
            ..ModemBehavior::default()
        });
        let _ = d.initialize().await;
        let before = handle.commands().len();
        assert!(matches!(d.ensure_ready().await, Err(ModemError::Faulted)));
        assert_eq!(handle.commands().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_ready_escalates_to_hardware_reset() {
        let (d, handle) = driver(ModemBehavior {
            responsive: false,
            recover_on_reset: true,
            ..ModemBehavior::default()
        });
        d.ensure_ready().await.unwrap();
        assert_eq!(d.state(), SessionState::Ready);
        assert_eq!(handle.resets(), 1);
        assert_eq!(d.session().hardware_resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_leaves_session_faulted() {
        let (d, handle) = driver(ModemBehavior {
            responsive: false,
            ..ModemBehavior::default()
        });
        assert!(matches!(
            d.ensure_ready().await,
            Err(ModemError::Unresponsive { .. })
        ));
        assert_eq!(d.state(), SessionState::Faulted);
        assert_eq!(handle.resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_clears_fault_once_modem_answers() {
        let (d, handle) = driver(ModemBehavior {
            responsive: false,
            ..ModemBehavior::default()
        });
        let _ = d.initialize().await;
        assert_eq!(d.state(), SessionState::Faulted);

        handle.set_behavior(|b| b.recover_on_reset = true);
        d.recover().await.unwrap();
        assert_eq!(d.state(), SessionState::Ready);
        assert!(d.ensure_ready().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_and_signal_are_parsed() {
        let (d, handle) = driver(ModemBehavior::default());
        assert_eq!(d.registration().await, Registration::Home);
        assert_eq!(d.signal_quality().await.and_then(|q| q.dbm()), Some(-77));

        handle.set_behavior(|b| b.registered = false);
        assert_eq!(d.registration().await, Registration::Searching);
    }
}
