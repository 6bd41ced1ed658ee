//! CareLink patient monitor.
//!
//! - [`sensor`]: IMU sample source (MPU-6050 over i2c-dev)
//! - [`fall`]: fall classifier state machine
//! - [`position`]: latest GPS fix from an NMEA stream
//! - [`modem`]: AT-command modem driver and SMS delivery
//! - [`dispatch`]: alert construction and fire-and-forget delivery
//! - [`orchestrator`]: the monitoring loop tying it together
//! - [`sim`]: simulated hardware for `--simulate` and tests

pub mod dispatch;
pub mod fall;
pub mod modem;
pub mod orchestrator;
pub mod position;
pub mod sensor;
pub mod sim;
