//! Byte channel to the modem and its reset line.
//!
//! The channel is unframed and half-duplex: bytes written are commands,
//! bytes read are whatever the modem felt like saying. Reads never block.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Duplex byte channel owned exclusively by the modem driver. Nothing here
/// ever waits; pacing is left to the async exchange layer.
pub trait Transport: Send {
    /// Hand as much of `bytes` to the device as it takes right now.
    /// `Ok(0)` means the transmit queue is full.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Copy whatever is available into `buf` without waiting.
    /// `Ok(0)` means nothing was pending.
    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bytes written but not yet on the wire.
    fn tx_pending(&mut self) -> io::Result<usize> {
        Ok(0)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).poll_read(buf)
    }

    fn tx_pending(&mut self) -> io::Result<usize> {
        (**self).tx_pending()
    }
}

// ── Serial device ───────────────────────────────────────────────────

/// A tty opened non-blocking. Line settings (baud, raw mode) are applied
/// by the platform before the agent starts.
pub struct SerialDevice {
    file: File,
    path: PathBuf,
}

impl SerialDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        tracing::info!(device = %path.display(), "modem serial device opened");
        Ok(SerialDevice {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl Transport for SerialDevice {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.file.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn tx_pending(&mut self) -> io::Result<usize> {
        let mut queued: libc::c_int = 0;
        // SAFETY: the fd is owned by `self.file` and `queued` outlives the call.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                libc::TIOCOUTQ,
                &mut queued as *mut libc::c_int,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Plain files and pipes used in bench setups have no queue.
            if err.raw_os_error() == Some(libc::ENOTTY) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(usize::try_from(queued).unwrap_or(0))
    }
}

// ── Hardware reset ──────────────────────────────────────────────────

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Pulses the modem's reset line. Pin handling lives outside the agent.
pub trait HardwareReset: Send + Sync {
    fn reset(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Used when no reset mechanism is configured.
pub struct NoReset;

impl HardwareReset for NoReset {
    fn reset(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async {
            tracing::warn!("hardware reset requested but no reset command is configured");
            Ok(())
        })
    }
}

/// Runs an external command (e.g. a GPIO helper script) to reset the modem.
pub struct CommandReset {
    program: String,
    args: Vec<String>,
}

impl CommandReset {
    /// Build from an argv list; `None` if the list is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(CommandReset {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl HardwareReset for CommandReset {
    fn reset(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            tracing::info!(program = %self.program, "running modem reset command");
            let output = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .output()
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(io::Error::other(format!(
                    "reset command {} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn command_reset_from_argv() {
        assert!(CommandReset::from_argv(&[]).is_none());
        let reset = CommandReset::from_argv(&["true".into()]).unwrap();
        assert_eq!(reset.program, "true");
        assert!(reset.args.is_empty());
    }

    #[tokio::test]
    async fn command_reset_reports_failure() {
        let ok = CommandReset::from_argv(&["true".into()]).unwrap();
        assert!(ok.reset().await.is_ok());
        let failing = CommandReset::from_argv(&["false".into()]).unwrap();
        assert!(failing.reset().await.is_err());
        let missing = CommandReset::from_argv(&["/nonexistent/carelink-reset".into()]).unwrap();
        assert!(missing.reset().await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn command_reset_does_not_block_the_runtime() {
        let reset = CommandReset::from_argv(&["sleep".into(), "0.3".into()]).unwrap();
        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        });
        reset.reset().await.unwrap();
        counter.abort();
        // A blocking wait would have starved the single runtime thread.
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5);
    }

    #[test]
    fn serial_device_on_a_plain_file() {
        let path = std::env::temp_dir().join(format!("carelink-serial-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let mut dev = SerialDevice::open(&path).unwrap();
        assert_eq!(dev.write(b"AT\r").unwrap(), 3);
        // Not a tty: nothing is ever queued.
        assert_eq!(dev.tx_pending().unwrap(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"AT\r");

        std::fs::remove_file(&path).unwrap();
    }
}
