//! One command/response round trip on the modem channel.
//!
//! A command exchange drains stale bytes and writes the command line; a
//! listen exchange keeps whatever is already pending. Both then poll the
//! channel and accumulate text until the first of these happens:
//!
//! - an expected token appears in the accumulated response
//! - an error token appears
//! - the overall deadline passes
//! - nothing has arrived for the idle window (measured from the last byte,
//!   or from the send if nothing arrived yet)
//!
//! Timing uses `tokio::time` so paused-clock tests run instantly.

use std::io;
use std::time::Duration;

use tokio::time::Instant;

use super::transport::Transport;

pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
/// Text-entry prompt after a message compose command.
pub const PROMPT: &str = ">";

const READ_CHUNK: usize = 256;
/// How long the transmit side may make no progress before a write or a
/// drain gives up.
const TX_STALL_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// An expected token was seen.
    Matched,
    /// An error token was seen.
    Error,
    Deadline,
    Idle,
    /// The command could not be written.
    WriteFailed,
}

/// Polling parameters shared by every exchange on a channel.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTiming {
    pub poll_interval: Duration,
    pub drain_attempts: u32,
}

/// Builder for a single exchange.
#[derive(Debug, Clone)]
pub struct CommandExchange {
    command: Option<String>,
    expected: Vec<String>,
    errors: Vec<String>,
    deadline: Duration,
    idle_window: Option<Duration>,
}

impl CommandExchange {
    /// Send `command` (CR appended) and wait for `OK`.
    pub fn command(command: impl Into<String>) -> Self {
        CommandExchange {
            command: Some(command.into()),
            ..Self::listen()
        }
    }

    /// Send nothing; just wait for the modem to speak.
    pub fn listen() -> Self {
        CommandExchange {
            command: None,
            expected: vec![OK.to_string()],
            errors: vec![ERROR.to_string()],
            deadline: Duration::from_secs(3),
            idle_window: Some(Duration::from_secs(1)),
        }
    }

    /// Replace the expected tokens with `token`.
    pub fn expect(mut self, token: impl Into<String>) -> Self {
        self.expected = vec![token.into()];
        self
    }

    /// Accept `token` in addition to those already expected.
    pub fn or_expect(mut self, token: impl Into<String>) -> Self {
        self.expected.push(token.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// `None` disables the idle rule; only the deadline then ends a silent
    /// exchange.
    pub fn idle_window(mut self, window: Option<Duration>) -> Self {
        self.idle_window = window;
        self
    }

    /// First expected or error token in `response`, expected tokens first.
    fn evaluate(&self, response: &str) -> Option<(ExchangeOutcome, String)> {
        if let Some(token) = self.expected.iter().find(|t| response.contains(t.as_str())) {
            return Some((ExchangeOutcome::Matched, token.clone()));
        }
        self.errors
            .iter()
            .find(|t| response.contains(t.as_str()))
            .map(|t| (ExchangeOutcome::Error, t.clone()))
    }
}

/// What came back from an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResult {
    pub command: Option<String>,
    pub response: String,
    pub outcome: ExchangeOutcome,
    /// The token that ended the exchange, if any.
    pub token: Option<String>,
    pub elapsed: Duration,
}

impl ExchangeResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == ExchangeOutcome::Matched
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.response.contains(needle)
    }
}

/// Run `exchange` on `transport`. Never fails: every way an exchange can go
/// wrong is reported through [`ExchangeResult::outcome`].
pub async fn perform<T>(
    transport: &mut T,
    exchange: CommandExchange,
    timing: &ExchangeTiming,
) -> ExchangeResult
where
    T: Transport + ?Sized,
{
    let mut buf = [0u8; READ_CHUNK];

    if exchange.command.is_some() {
        drain(transport, &mut buf, timing).await;
    }

    let started = Instant::now();
    let finish = |response: String, outcome, token| ExchangeResult {
        command: exchange.command.clone(),
        response,
        outcome,
        token,
        elapsed: started.elapsed(),
    };

    if let Some(command) = &exchange.command {
        // CR alone ends a command line. A trailing LF would become the first
        // byte of a message body after `AT+CMGS`.
        let line = format!("{command}\r");
        if let Err(e) = write_all(transport, line.as_bytes(), timing).await {
            tracing::warn!(command = %command, error = %e, "modem write failed");
            return finish(String::new(), ExchangeOutcome::WriteFailed, None);
        }
    }

    let deadline = started + exchange.deadline;
    let mut last_rx = started;
    let mut response = String::new();

    loop {
        let n = match transport.poll_read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "modem read failed");
                0
            }
        };

        let now = Instant::now();
        if n > 0 {
            response.push_str(&String::from_utf8_lossy(&buf[..n]));
            last_rx = now;
            if let Some((outcome, token)) = exchange.evaluate(&response) {
                return finish(response, outcome, Some(token));
            }
        }

        if now >= deadline {
            return finish(response, ExchangeOutcome::Deadline, None);
        }
        if let Some(window) = exchange.idle_window {
            if now.saturating_duration_since(last_rx) >= window {
                return finish(response, ExchangeOutcome::Idle, None);
            }
        }

        tokio::time::sleep(timing.poll_interval).await;
    }
}

/// Write all of `bytes`, yielding while the device's transmit queue is full.
pub async fn write_all<T>(
    transport: &mut T,
    bytes: &[u8],
    timing: &ExchangeTiming,
) -> io::Result<()>
where
    T: Transport + ?Sized,
{
    let mut rest = bytes;
    let mut progress = Instant::now();
    while !rest.is_empty() {
        let n = transport.write(rest)?;
        if n > 0 {
            rest = &rest[n..];
            progress = Instant::now();
            continue;
        }
        if progress.elapsed() >= TX_STALL_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "modem transmit queue stalled",
            ));
        }
        tokio::time::sleep(timing.poll_interval).await;
    }
    Ok(())
}

/// Wait until everything written has left the device.
pub async fn drain_tx<T>(transport: &mut T, timing: &ExchangeTiming) -> io::Result<()>
where
    T: Transport + ?Sized,
{
    let mut last = usize::MAX;
    let mut progress = Instant::now();
    loop {
        let pending = transport.tx_pending()?;
        if pending == 0 {
            return Ok(());
        }
        if pending < last {
            last = pending;
            progress = Instant::now();
        } else if progress.elapsed() >= TX_STALL_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "modem transmit queue not draining",
            ));
        }
        tokio::time::sleep(timing.poll_interval).await;
    }
}

/// Discard anything left over from earlier exchanges or unsolicited output.
async fn drain<T>(transport: &mut T, buf: &mut [u8], timing: &ExchangeTiming)
where
    T: Transport + ?Sized,
{
    for _ in 0..timing.drain_attempts {
        match transport.poll_read(buf) {
            Ok(0) => break,
            Ok(n) => {
                tracing::trace!(
                    discarded = %String::from_utf8_lossy(&buf[..n]).trim(),
                    "stale modem output"
                );
                tokio::time::sleep(timing.poll_interval).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "drain read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// Replies with scripted chunks, one per poll once a write has happened.
    #[derive(Default)]
    struct Scripted {
        stale: VecDeque<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        wrote: bool,
        fail_writes: bool,
        accept_per_write: Option<usize>,
        stalled: bool,
        queued: usize,
    }

    impl Transport for Scripted {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            if self.stalled {
                return Ok(0);
            }
            let n = bytes.len().min(self.accept_per_write.unwrap_or(usize::MAX));
            self.written.extend_from_slice(&bytes[..n]);
            self.wrote = true;
            Ok(n)
        }

        fn tx_pending(&mut self) -> io::Result<usize> {
            self.queued = self.queued.saturating_sub(1);
            Ok(self.queued)
        }

        fn poll_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let next = if self.wrote {
                self.replies.pop_front()
            } else {
                self.stale.pop_front()
            };
            let Some(chunk) = next else { return Ok(0) };
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    fn timing() -> ExchangeTiming {
        ExchangeTiming {
            poll_interval: Duration::from_millis(20),
            drain_attempts: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ok_response_matches() {
        let mut t = Scripted {
            replies: VecDeque::from([b"AT\r".to_vec(), b"\r\nOK\r\n".to_vec()]),
            ..Default::default()
        };
        let result = perform(&mut t, CommandExchange::command("AT"), &timing()).await;
        assert!(result.succeeded());
        assert_eq!(result.token.as_deref(), Some(OK));
        assert_eq!(t.written, b"AT\r");
        assert!(result.contains("OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_token_ends_exchange() {
        let mut t = Scripted {
            replies: VecDeque::from([b"\r\n+CMS ERROR: 500\r\n".to_vec()]),
            ..Default::default()
        };
        let result = perform(&mut t, CommandExchange::command("AT+CMGF=1"), &timing()).await;
        assert_eq!(result.outcome, ExchangeOutcome::Error);
        assert!(!result.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_is_matched_without_ok() {
        let mut t = Scripted {
            replies: VecDeque::from([b"\r\n> ".to_vec()]),
            ..Default::default()
        };
        let exchange = CommandExchange::command("AT+CMGS=\"+15550100\"").expect(PROMPT);
        let result = perform(&mut t, exchange, &timing()).await;
        assert!(result.succeeded());
        assert_eq!(result.token.as_deref(), Some(PROMPT));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_bytes_are_drained_before_sending() {
        let mut t = Scripted {
            stale: VecDeque::from([b"\r\nRING\r\n".to_vec(), b"\r\nOK\r\n".to_vec()]),
            replies: VecDeque::from([b"\r\n+CSQ: 18,0\r\n\r\nOK\r\n".to_vec()]),
            ..Default::default()
        };
        let result = perform(&mut t, CommandExchange::command("AT+CSQ"), &timing()).await;
        assert!(result.succeeded());
        assert!(!result.contains("RING"));
        assert!(result.contains("+CSQ: 18,0"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_modem_ends_on_idle_window() {
        let mut t = Scripted::default();
        let exchange = CommandExchange::command("AT")
            .deadline(Duration::from_secs(3))
            .idle_window(Some(Duration::from_secs(1)));
        let result = perform(&mut t, exchange, &timing()).await;
        assert_eq!(result.outcome, ExchangeOutcome::Idle);
        assert!(result.elapsed >= Duration::from_secs(1));
        assert!(result.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn without_idle_window_only_deadline_ends_silence() {
        let mut t = Scripted::default();
        let exchange = CommandExchange::listen()
            .deadline(Duration::from_secs(15))
            .idle_window(None);
        let result = perform(&mut t, exchange, &timing()).await;
        assert_eq!(result.outcome, ExchangeOutcome::Deadline);
        assert!(result.elapsed >= Duration::from_secs(15));
        assert!(t.written.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn listen_keeps_pending_bytes() {
        let mut t = Scripted {
            replies: VecDeque::from([b"\r\n+CMGS: 7\r\n".to_vec(), b"\r\nOK\r\n".to_vec()]),
            wrote: true,
            ..Default::default()
        };
        let result = perform(&mut t, CommandExchange::listen().expect("+CMGS:"), &timing()).await;
        assert!(result.succeeded());
        assert!(result.contains("+CMGS: 7"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_reported() {
        let mut t = Scripted {
            fail_writes: true,
            ..Default::default()
        };
        let result = perform(&mut t, CommandExchange::command("AT"), &timing()).await;
        assert_eq!(result.outcome, ExchangeOutcome::WriteFailed);
        assert!(result.response.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn alternative_tokens_are_accepted() {
        let mut t = Scripted {
            replies: VecDeque::from([b"\r\nSMS Ready\r\n".to_vec()]),
            wrote: true,
            ..Default::default()
        };
        let exchange = CommandExchange::listen()
            .expect("+CMGS:")
            .or_expect("SMS Ready");
        let result = perform(&mut t, exchange, &timing()).await;
        assert!(result.succeeded());
        assert_eq!(result.token.as_deref(), Some("SMS Ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_writes_are_completed() {
        let mut t = Scripted {
            accept_per_write: Some(3),
            ..Default::default()
        };
        write_all(&mut t, b"FALL_ALERT|P1", &timing()).await.unwrap();
        assert_eq!(t.written, b"FALL_ALERT|P1");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transmit_queue_times_out() {
        let mut t = Scripted {
            stalled: true,
            ..Default::default()
        };
        let started = Instant::now();
        let err = write_all(&mut t, b"AT\r", &timing()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= TX_STALL_LIMIT);

        let result = perform(&mut t, CommandExchange::command("AT"), &timing()).await;
        assert_eq!(result.outcome, ExchangeOutcome::WriteFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_the_queue_to_empty() {
        let mut t = Scripted {
            queued: 4,
            ..Default::default()
        };
        drain_tx(&mut t, &timing()).await.unwrap();
        assert_eq!(t.queued, 0);
    }
}
