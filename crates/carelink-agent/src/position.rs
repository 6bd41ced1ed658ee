//! Position tracker. Keeps the latest GPS fix from a stream of NMEA lines.
//!
//! Only GGA sentences are consulted. Checksums and framing are the
//! receiver's problem; a line that does not decode is simply ignored.
//!
//! A fix is never cleared. It just stops being returned once it is older
//! than the configured staleness limit.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use carelink_common::config::PositionConfig;
use carelink_common::models::{Coordinates, PositionStatus};
use tokio::io::AsyncBufReadExt;
use tokio::time::Instant;

/// Pause after a failed read before trying the receiver again.
const READ_RETRY: Duration = Duration::from_secs(1);

/// A timestamped position estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub coordinates: Coordinates,
    pub satellites: u8,
    pub captured_at: Instant,
}

impl Fix {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

/// The fields of a GGA sentence we care about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GgaSentence {
    pub fix_quality: u8,
    pub satellites: u8,
    /// Present only when both coordinate fields decode.
    pub coordinates: Option<Coordinates>,
}

/// Parse a `$..GGA` sentence (any talker: GP, GN, GL, ...).
///
/// Returns `None` for every other sentence type and for GGA lines too short
/// to carry a fix-quality field.
pub fn parse_gga(line: &str) -> Option<GgaSentence> {
    let line = line.trim();
    let fields: Vec<&str> = line.split(',').collect();
    let header = fields.first()?;
    if !(header.len() == 6 && header.starts_with('$') && header.ends_with("GGA")) {
        return None;
    }
    if fields.len() <= 6 {
        return None;
    }

    let fix_quality = fields[6].trim().parse().unwrap_or(0);
    let satellites = fields
        .get(7)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);

    let latitude = parse_coordinate(fields[2], fields[3], 2);
    let longitude = parse_coordinate(fields[4], fields[5], 3);
    let coordinates = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Coordinates {
            latitude,
            longitude,
        }),
        _ => None,
    };

    Some(GgaSentence {
        fix_quality,
        satellites,
        coordinates,
    })
}

/// Decode `DDMM.mmmm` (or `DDDMM.mmmm` with `degree_digits = 3`) into
/// signed decimal degrees.
fn parse_coordinate(raw: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    let raw = raw.trim();
    if raw.len() <= degree_digits || !raw.is_char_boundary(degree_digits) {
        return None;
    }
    let (degrees, minutes) = raw.split_at(degree_digits);
    let degrees: u32 = degrees.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    if !(0.0..60.0).contains(&minutes) {
        return None;
    }

    let value = f64::from(degrees) + minutes / 60.0;
    match hemisphere.trim() {
        "S" | "W" => Some(-value),
        _ => Some(value),
    }
}

/// Holds the most recent valid fix behind a single lock.
pub struct PositionTracker {
    fix: Mutex<Option<Fix>>,
    config: PositionConfig,
}

impl PositionTracker {
    pub fn new(config: PositionConfig) -> Self {
        PositionTracker {
            fix: Mutex::new(None),
            config,
        }
    }

    /// Consume one line; returns `true` when it produced a new fix.
    pub fn ingest_line(&self, line: &str) -> bool {
        self.ingest_line_at(line, Instant::now())
    }

    pub fn ingest_line_at(&self, line: &str, now: Instant) -> bool {
        let Some(gga) = parse_gga(line) else {
            return false;
        };
        let Some(coordinates) = gga.coordinates.filter(|_| gga.fix_quality > 0) else {
            return false;
        };

        let fix = Fix {
            coordinates,
            satellites: gga.satellites,
            captured_at: now,
        };
        *self.fix.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix);
        tracing::debug!(
            lat = coordinates.latitude,
            lon = coordinates.longitude,
            satellites = gga.satellites,
            "GPS fix"
        );
        true
    }

    /// The stored fix, unless it is stale.
    pub fn last_fix(&self) -> Option<Fix> {
        self.last_fix_at(Instant::now())
    }

    pub fn last_fix_at(&self, now: Instant) -> Option<Fix> {
        let fix = *self.fix.lock().unwrap_or_else(PoisonError::into_inner);
        fix.filter(|f| f.age(now) < self.config.stale_after)
    }

    pub fn status(&self) -> PositionStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> PositionStatus {
        self.snapshot_at(now).1
    }

    /// The fresh fix and the status describing it, from one read of the
    /// stored fix so the two always agree.
    pub fn snapshot(&self) -> (Option<Fix>, PositionStatus) {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> (Option<Fix>, PositionStatus) {
        let fix = self.last_fix_at(now);
        let status = match fix {
            Some(fix) => PositionStatus::Ok {
                age_s: fix.age(now).as_secs(),
            },
            None => PositionStatus::NoFix,
        };
        (fix, status)
    }

    /// Read NMEA lines until the stream ends, updating the stored fix.
    ///
    /// Bytes that are not valid text are replaced rather than rejected, and
    /// read errors are logged and retried, so line noise on the receiver
    /// never stops tracking. Logs a warning whenever the receiver stays
    /// silent for the configured period, and a periodic status line with
    /// fix quality and satellites.
    pub async fn run<R>(&self, mut reader: R)
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(128);
        let mut last_status_log: Option<Instant> = None;

        loop {
            // `read_until` keeps partial input in `buf` across a timeout.
            match tokio::time::timeout(
                self.config.silence_warning,
                reader.read_until(b'\n', &mut buf),
            )
            .await
            {
                Ok(Ok(0)) => {
                    if !buf.is_empty() {
                        self.handle_line(&buf, &mut last_status_log);
                    }
                    tracing::warn!("GPS stream ended");
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "GPS read failed, retrying");
                    tokio::time::sleep(READ_RETRY).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        silent_s = self.config.silence_warning.as_secs(),
                        "no GPS data received, check receiver connection"
                    );
                    continue;
                }
            }

            self.handle_line(&buf, &mut last_status_log);
            buf.clear();
        }
    }

    fn handle_line(&self, raw: &[u8], last_status_log: &mut Option<Instant>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        tracing::trace!(line = %line, "GPS raw");
        self.ingest_line(line);

        if let Some(gga) = parse_gga(line) {
            let now = Instant::now();
            let due = last_status_log
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.status_log);
            if due {
                tracing::info!(
                    fix_quality = gga.fix_quality,
                    satellites = gga.satellites,
                    "GPS status"
                );
                *last_status_log = Some(now);
            }
        }
    }
}
