//! Simulated hardware for `--simulate` runs and tests.
//!
//! - [`SimulatedImu`]: resting noise around 1 g with optional periodic
//!   synthetic falls.
//! - [`SimulatedModem`]: answers the AT subset the driver uses, with
//!   switchable failure modes.
//! - [`gps_feed`]: an NMEA GGA stream around a fixed origin.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use carelink_common::models::Coordinates;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::modem::transport::{BoxFuture, HardwareReset, Transport};
use crate::sensor::{MotionSample, SampleSource, STANDARD_GRAVITY};

// ── IMU ─────────────────────────────────────────────────────────────

/// How long a synthetic fall stays above threshold.
const FALL_BURST: Duration = Duration::from_millis(120);
const FALL_MAGNITUDE_G: f64 = 3.2;

pub struct SimulatedImu {
    rng: StdRng,
    fall_every: Option<Duration>,
    next_fall_at: Option<Instant>,
}

impl SimulatedImu {
    /// `fall_every = None` never falls.
    pub fn new(fall_every: Option<Duration>) -> Self {
        SimulatedImu {
            rng: StdRng::from_os_rng(),
            fall_every,
            next_fall_at: fall_every.map(|every| Instant::now() + every),
        }
    }

    fn in_fall(&mut self, now: Instant) -> bool {
        let (Some(every), Some(at)) = (self.fall_every, self.next_fall_at) else {
            return false;
        };
        if now < at {
            return false;
        }
        if now < at + FALL_BURST {
            return true;
        }
        self.next_fall_at = Some(at + every);
        false
    }
}

impl SampleSource for SimulatedImu {
    fn read(&mut self) -> MotionSample {
        let magnitude = if self.in_fall(Instant::now()) {
            FALL_MAGNITUDE_G + self.rng.random_range(-0.2..0.2)
        } else {
            1.0 + self.rng.random_range(-0.03..0.03)
        };
        let tilt = self.rng.random_range(-0.05..0.05);
        let accel = [
            tilt * STANDARD_GRAVITY,
            0.0,
            (magnitude * magnitude - tilt * tilt).max(0.0).sqrt() * STANDARD_GRAVITY,
        ];
        let gyro = [0, 1, 2].map(|_| self.rng.random_range(-0.5..0.5));
        MotionSample::new(accel, gyro, 24.0 + self.rng.random_range(-0.2..0.2))
    }
}

// ── Modem ───────────────────────────────────────────────────────────

/// What the modem says after the submit byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReply {
    /// `+CMGS: <n>` then `OK`.
    Reference,
    /// Ready banners instead of a reference.
    ReadyBanner,
    /// `+CMS ERROR: 500`.
    Error,
    Silent,
}

#[derive(Debug, Clone)]
pub struct ModemBehavior {
    /// When false, nothing is ever answered.
    pub responsive: bool,
    pub registered: bool,
    /// Whether the compose command gets its `>` prompt.
    pub prompt: bool,
    pub submit: SubmitReply,
    /// A hardware reset brings an unresponsive modem back.
    pub recover_on_reset: bool,
}

impl Default for ModemBehavior {
    fn default() -> Self {
        ModemBehavior {
            responsive: true,
            registered: true,
            prompt: true,
            submit: SubmitReply::Reference,
            recover_on_reset: false,
        }
    }
}

/// One step of traffic as the simulated modem saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    Command(String),
    /// Submit byte received; carries the composed body.
    Submitted(String),
    /// Text entry abandoned with ESC.
    Cancelled,
}

/// A message the simulated modem accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub destination: String,
    pub body: String,
}

#[derive(Default)]
struct ModemState {
    behavior: ModemBehavior,
    /// Bytes waiting to be read by the driver.
    outbound: VecDeque<u8>,
    line: Vec<u8>,
    /// Destination of the message being composed.
    composing: Option<String>,
    body: Vec<u8>,
    commands: Vec<String>,
    transcript: Vec<ModemEvent>,
    messages: Vec<SentMessage>,
    submissions: usize,
    bytes_written: usize,
    resets: u32,
    next_reference: u32,
}

impl ModemState {
    fn reply(&mut self, text: &str) {
        self.outbound.extend(text.as_bytes());
    }

    fn accept(&mut self, byte: u8) {
        if self.composing.is_some() {
            match byte {
                0x1A => self.submit(),
                0x1B => {
                    self.composing = None;
                    self.body.clear();
                    self.transcript.push(ModemEvent::Cancelled);
                    self.reply("\r\nOK\r\n");
                }
                _ => self.body.push(byte),
            }
            return;
        }
        match byte {
            // Stray cancel outside text entry.
            0x1B => {}
            b'\r' | b'\n' => {
                if !self.line.is_empty() {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    self.command(line.trim());
                }
            }
            _ => self.line.push(byte),
        }
    }

    fn command(&mut self, command: &str) {
        self.commands.push(command.to_string());
        self.transcript.push(ModemEvent::Command(command.to_string()));
        if !self.behavior.responsive {
            return;
        }
        // Echo, as the modem does with ATE1.
        self.reply(&format!("{command}\r"));

        match command {
            "AT" | "AT+CMGF=1" => self.reply("\r\nOK\r\n"),
            "AT+CREG?" => {
                let stat = if self.behavior.registered { 1 } else { 2 };
                self.reply(&format!("\r\n+CREG: 0,{stat}\r\n\r\nOK\r\n"));
            }
            "AT+CSQ" => self.reply("\r\n+CSQ: 18,0\r\n\r\nOK\r\n"),
            _ => {
                let destination = command
                    .strip_prefix("AT+CMGS=\"")
                    .and_then(|rest| rest.strip_suffix('"'));
                match destination {
                    Some(destination) if self.behavior.prompt => {
                        self.composing = Some(destination.to_string());
                        self.body.clear();
                        self.reply("\r\n> ");
                    }
                    Some(_) => {}
                    None => self.reply("\r\nERROR\r\n"),
                }
            }
        }
    }

    fn submit(&mut self) {
        let Some(destination) = self.composing.take() else {
            return;
        };
        let body = String::from_utf8_lossy(&self.body).into_owned();
        self.body.clear();
        self.submissions += 1;
        self.transcript.push(ModemEvent::Submitted(body.clone()));

        match self.behavior.submit {
            SubmitReply::Reference => {
                self.next_reference += 1;
                let reference = self.next_reference;
                self.reply(&format!("\r\n+CMGS: {reference}\r\n\r\nOK\r\n"));
                self.messages.push(SentMessage { destination, body });
            }
            SubmitReply::ReadyBanner => {
                self.reply("\r\nCall Ready\r\n\r\nSMS Ready\r\n");
                self.messages.push(SentMessage { destination, body });
            }
            SubmitReply::Error => self.reply("\r\n+CMS ERROR: 500\r\n"),
            SubmitReply::Silent => {}
        }
    }
}

/// In-memory modem speaking a small AT dialect.
pub struct SimulatedModem {
    state: Arc<Mutex<ModemState>>,
}

/// Inspection and control side of a [`SimulatedModem`].
#[derive(Clone)]
pub struct SimulatedModemHandle {
    state: Arc<Mutex<ModemState>>,
}

impl SimulatedModem {
    pub fn new(behavior: ModemBehavior) -> (Self, SimulatedModemHandle) {
        let state = Arc::new(Mutex::new(ModemState {
            behavior,
            ..ModemState::default()
        }));
        (
            SimulatedModem {
                state: state.clone(),
            },
            SimulatedModemHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimulatedModem {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        state.bytes_written += bytes.len();
        for &byte in bytes {
            state.accept(byte);
        }
        Ok(bytes.len())
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        let n = buf.len().min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl SimulatedModemHandle {
    fn state(&self) -> MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, f: impl FnOnce(&mut ModemBehavior)) {
        f(&mut self.state().behavior);
    }

    /// Command lines received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Everything the modem saw, in order.
    pub fn transcript(&self) -> Vec<ModemEvent> {
        self.state().transcript.clone()
    }

    /// Messages the modem accepted.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.state().messages.clone()
    }

    /// Every submit byte seen, accepted or not.
    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    pub fn bytes_written(&self) -> usize {
        self.state().bytes_written
    }

    pub fn resets(&self) -> u32 {
        self.state().resets
    }

    pub fn reset_line(&self) -> SimulatedReset {
        SimulatedReset {
            modem: self.clone(),
        }
    }
}

/// Reset line wired to a [`SimulatedModem`].
pub struct SimulatedReset {
    modem: SimulatedModemHandle,
}

impl SimulatedReset {
    fn pulse(&self) {
        let mut state = self.modem.state();
        state.resets += 1;
        state.outbound.clear();
        state.line.clear();
        state.composing = None;
        state.body.clear();
        if state.behavior.recover_on_reset {
            state.behavior.responsive = true;
        }
    }
}

impl HardwareReset for SimulatedReset {
    fn reset(&self) -> BoxFuture<'_, io::Result<()>> {
        self.pulse();
        Box::pin(async { Ok(()) })
    }
}

// ── GPS ─────────────────────────────────────────────────────────────

/// Format a GGA sentence with a valid checksum.
pub fn format_gga(position: Coordinates, satellites: u8, utc: chrono::NaiveTime) -> String {
    fn split(value: f64, degree_width: usize, positive: char, negative: char) -> String {
        let hemisphere = if value < 0.0 { negative } else { positive };
        let value = value.abs();
        let degrees = value.trunc();
        let minutes = (value - degrees) * 60.0;
        format!(
            "{:0width$}{:07.4},{hemisphere}",
            degrees as u32,
            minutes,
            width = degree_width
        )
    }

    let body = format!(
        "GPGGA,{},{},{},1,{satellites:02},0.9,545.4,M,46.9,M,,",
        utc.format("%H%M%S%.3f"),
        split(position.latitude, 2, 'N', 'S'),
        split(position.longitude, 3, 'E', 'W'),
    );
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${body}*{checksum:02X}")
}

/// A GGA stream wandering slightly around `origin`, one sentence per
/// `period`. The writer task ends when the reader is dropped.
pub fn gps_feed(origin: Coordinates, period: Duration) -> tokio::io::DuplexStream {
    let (reader, mut writer) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut rng = StdRng::from_os_rng();
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let position = Coordinates {
                latitude: origin.latitude + rng.random_range(-0.0001..0.0001),
                longitude: origin.longitude + rng.random_range(-0.0001..0.0001),
            };
            let satellites = rng.random_range(6..=11);
            let line = format_gga(position, satellites, chrono::Utc::now().time());
            if writer.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });
    reader
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::parse_gga;

    #[test]
    fn simulated_modem_answers_basic_commands() {
        let (mut modem, handle) = SimulatedModem::new(ModemBehavior::default());
        modem.write(b"AT+CREG?\r").unwrap();
        let mut buf = [0u8; 128];
        let n = modem.poll_read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("+CREG: 0,1"));
        assert!(text.ends_with("OK\r\n"));
        assert_eq!(handle.commands(), vec!["AT+CREG?"]);
        assert_eq!(modem.poll_read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn simulated_modem_collects_message_bodies() {
        let (mut modem, handle) = SimulatedModem::new(ModemBehavior::default());
        modem.write(b"AT+CMGS=\"+15550100\"\r").unwrap();
        modem.write(b"line one\nline two").unwrap();
        modem.write(&[0x1A]).unwrap();
        assert_eq!(
            handle.messages(),
            vec![SentMessage {
                destination: "+15550100".into(),
                body: "line one\nline two".into(),
            }]
        );
        // Body text is not mistaken for commands.
        assert_eq!(handle.commands().len(), 1);
    }

    #[tokio::test]
    async fn unresponsive_modem_still_records_commands() {
        let (mut modem, handle) = SimulatedModem::new(ModemBehavior {
            responsive: false,
            recover_on_reset: true,
            ..ModemBehavior::default()
        });
        modem.write(b"AT\r").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(modem.poll_read(&mut buf).unwrap(), 0);
        assert_eq!(handle.commands(), vec!["AT"]);

        handle.reset_line().reset().await.unwrap();
        modem.write(b"AT\r").unwrap();
        assert!(modem.poll_read(&mut buf).unwrap() > 0);
        assert_eq!(handle.resets(), 1);
    }

    #[test]
    fn formatted_gga_parses_back() {
        let origin = Coordinates {
            latitude: -33.8688,
            longitude: 151.2093,
        };
        let utc = chrono::NaiveTime::from_hms_opt(12, 35, 19).unwrap();
        let line = format_gga(origin, 8, utc);
        assert!(line.starts_with("$GPGGA,123519.000,3352.1280,S,15112.5580,E,1,08,"));

        let gga = parse_gga(&line).unwrap();
        assert_eq!(gga.fix_quality, 1);
        let c = gga.coordinates.unwrap();
        assert!((c.latitude - origin.latitude).abs() < 1e-6);
        assert!((c.longitude - origin.longitude).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_imu_produces_a_fall_burst() {
        let mut imu = SimulatedImu::new(Some(Duration::from_secs(10)));
        assert!(imu.read().magnitude_g() < 1.5);

        tokio::time::advance(Duration::from_millis(10_050)).await;
        assert!(imu.read().magnitude_g() > 2.5);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(imu.read().magnitude_g() < 1.5);
    }
}
