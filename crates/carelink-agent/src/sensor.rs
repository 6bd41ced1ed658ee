//! Motion sample source: the IMU seen as "one reading per request".
//!
//! Production reads an MPU-6050 through the Linux i2c-dev interface. Bus
//! setup and device discovery happen outside this process; we only open the
//! bus node, address the device and burst-read its data registers.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

/// Standard gravity, used to express acceleration magnitude in g.
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// One IMU reading. `ok == false` marks a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionSample {
    /// Acceleration in m/s².
    pub accel: [f64; 3],
    /// Angular rate in °/s.
    pub gyro: [f64; 3],
    pub temperature_c: f64,
    pub ok: bool,
}

impl MotionSample {
    pub fn new(accel: [f64; 3], gyro: [f64; 3], temperature_c: f64) -> Self {
        MotionSample {
            accel,
            gyro,
            temperature_c,
            ok: true,
        }
    }

    /// A reading that failed; contributes magnitude 0.
    pub fn invalid() -> Self {
        MotionSample::default()
    }

    /// A valid sample whose acceleration has the given magnitude (in g),
    /// pointing straight down.
    pub fn from_magnitude_g(g: f64) -> Self {
        MotionSample::new([0.0, 0.0, g * STANDARD_GRAVITY], [0.0; 3], 25.0)
    }

    /// |accel| / g₀. Always ≥ 0; invalid samples read as 0.
    pub fn magnitude_g(&self) -> f64 {
        if !self.ok {
            return 0.0;
        }
        let [x, y, z] = self.accel;
        let magnitude = (x * x + y * y + z * z).sqrt() / STANDARD_GRAVITY;
        if magnitude.is_finite() {
            magnitude
        } else {
            0.0
        }
    }
}

/// Supplies one motion reading per call. Failures are reported in-band
/// through [`MotionSample::ok`], never as an error.
pub trait SampleSource: Send {
    fn read(&mut self) -> MotionSample;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn read(&mut self) -> MotionSample {
        (**self).read()
    }
}

// ── MPU-6050 over i2c-dev ───────────────────────────────────────────

/// `I2C_SLAVE` ioctl from `<linux/i2c-dev.h>`.
const I2C_SLAVE: u16 = 0x0703;

const REG_ACCEL_CONFIG: u8 = 0x1C;
const REG_ACCEL_XOUT_H: u8 = 0x3B;
const REG_PWR_MGMT_1: u8 = 0x6B;

/// ±8 g full scale; the default ±2 g would clip right at the fall threshold.
const ACCEL_RANGE_8G: u8 = 0x10;
const ACCEL_LSB_PER_G: f64 = 4096.0;
const GYRO_LSB_PER_DPS: f64 = 131.0;

/// MPU-6050 accelerometer/gyro on a Linux I²C bus.
pub struct Mpu6050 {
    bus: File,
    address: u16,
}

impl Mpu6050 {
    /// Open the bus node, select the device and wake it from sleep.
    pub fn open(bus_path: &Path, address: u16) -> io::Result<Self> {
        let bus = OpenOptions::new().read(true).write(true).open(bus_path)?;
        let mut dev = Mpu6050 { bus, address };
        dev.select()?;
        dev.wake()?;
        tracing::info!(bus = %bus_path.display(), address = format_args!("{address:#04x}"), "MPU-6050 initialized");
        Ok(dev)
    }

    fn select(&self) -> io::Result<()> {
        // SAFETY: the fd is owned by `self.bus` and I2C_SLAVE takes a plain
        // integer argument.
        let rc = unsafe {
            libc::ioctl(
                self.bus.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(self.address),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wake(&mut self) -> io::Result<()> {
        self.bus.write_all(&[REG_PWR_MGMT_1, 0x00])?;
        self.bus.write_all(&[REG_ACCEL_CONFIG, ACCEL_RANGE_8G])
    }

    fn read_burst(&mut self) -> io::Result<[u8; 14]> {
        self.bus.write_all(&[REG_ACCEL_XOUT_H])?;
        let mut raw = [0u8; 14];
        self.bus.read_exact(&mut raw)?;
        Ok(raw)
    }
}

impl SampleSource for Mpu6050 {
    fn read(&mut self) -> MotionSample {
        for attempt in 1..=2 {
            match self.read_burst() {
                Ok(raw) => return decode_burst(&raw),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "IMU read failed");
                    if attempt == 1 {
                        if let Err(e) = self.select().and_then(|_| self.wake()) {
                            tracing::debug!(error = %e, "IMU re-wake failed");
                        }
                    }
                }
            }
        }
        MotionSample::invalid()
    }
}

/// Decode the 14-byte ACCEL_XOUT_H..GYRO_ZOUT_L register burst.
pub fn decode_burst(raw: &[u8; 14]) -> MotionSample {
    let word = |i: usize| f64::from(i16::from_be_bytes([raw[i], raw[i + 1]]));

    let accel = [0, 2, 4].map(|i| word(i) / ACCEL_LSB_PER_G * STANDARD_GRAVITY);
    let temperature_c = word(6) / 340.0 + 36.53;
    let gyro = [8, 10, 12].map(|i| word(i) / GYRO_LSB_PER_DPS);

    MotionSample::new(accel, gyro, temperature_c)
}
