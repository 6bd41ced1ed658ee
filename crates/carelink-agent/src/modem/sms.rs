//! Text message submission and delivery.
//!
//! Submission is one atomic sequence on the channel: compose command, wait
//! for the `>` prompt, write the body, write the submit byte (0x1A), then
//! listen for a terminal marker. The channel lock is held throughout so no
//! other command can land in the middle of a message body.

use super::driver::ModemDriver;
use super::exchange::{self, CommandExchange, ExchangeOutcome, ExchangeResult, PROMPT};
use super::session::SessionState;
use super::ModemError;

/// Ctrl-Z: ends the message body and submits it.
const SUBMIT: u8 = 0x1A;
/// ESC: abandons a compose that never got its prompt.
const CANCEL: u8 = 0x1B;

/// Markers that count as accepted once the body is submitted. Some firmware
/// answers with its ready banners instead of a `+CMGS` reference.
const ACCEPTED_MARKERS: [&str; 3] = ["+CMGS:", "SMS Ready", "Call Ready"];

/// The modem's acceptance of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub marker: String,
    /// Message reference from `+CMGS: <mr>`, when the modem gave one.
    pub reference: Option<u32>,
    pub response: String,
}

/// A delivered alert and the attempt that got it out.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub attempt: u32,
    pub receipt: SubmitReceipt,
}

impl ModemDriver {
    /// Submit one message. Assumes the session is ready and in text mode.
    pub async fn submit_message(
        &self,
        destination: &str,
        body: &str,
    ) -> Result<SubmitReceipt, ModemError> {
        let mut channel = self.channel.lock().await;

        let compose = CommandExchange::command(format!("AT+CMGS=\"{destination}\""))
            .expect(PROMPT)
            .deadline(self.config.command_timeout)
            .idle_window(Some(self.config.idle_window));
        let prompt = exchange::perform(&mut **channel, compose, &self.timing).await;
        self.record(&prompt);
        if !prompt.succeeded() {
            if let Err(e) = exchange::write_all(&mut **channel, &[CANCEL], &self.timing).await {
                tracing::debug!(error = %e, "failed to cancel compose");
            }
            return Err(ModemError::PromptTimeout {
                response: prompt.response,
            });
        }

        exchange::write_all(&mut **channel, body.as_bytes(), &self.timing).await?;
        exchange::drain_tx(&mut **channel, &self.timing).await?;
        exchange::write_all(&mut **channel, &[SUBMIT], &self.timing).await?;
        exchange::drain_tx(&mut **channel, &self.timing).await?;

        let mut confirm = CommandExchange::listen()
            .deadline(self.config.submit_window)
            .idle_window(None)
            .expect(ACCEPTED_MARKERS[0]);
        for marker in &ACCEPTED_MARKERS[1..] {
            confirm = confirm.or_expect(*marker);
        }
        let result = exchange::perform(&mut **channel, confirm, &self.timing).await;
        drop(channel);
        self.record(&result);

        match result.outcome {
            ExchangeOutcome::Matched => Ok(receipt(result)),
            ExchangeOutcome::Error => Err(ModemError::SubmissionRejected {
                response: result.response,
            }),
            _ => Err(ModemError::SubmissionTimeout {
                window_s: self.config.submit_window.as_secs(),
            }),
        }
    }

    /// Deliver `body` to `destination`, retrying whole attempts.
    ///
    /// Each attempt makes sure the modem answers, checks network
    /// registration, selects text mode and submits. Attempts are separated
    /// by the configured cooldown.
    pub async fn deliver(
        &self,
        destination: &str,
        body: &str,
    ) -> Result<DeliveryReceipt, ModemError> {
        if self.state() == SessionState::Faulted {
            return Err(ModemError::Faulted);
        }

        let attempts = self.config.retry_count;
        let mut last_error = None;
        for attempt in 1..=attempts {
            tracing::info!(attempt, attempts, destination, "sending SMS");
            match self.attempt_delivery(destination, body).await {
                Ok(receipt) => {
                    tracing::info!(
                        attempt,
                        marker = %receipt.marker,
                        reference = ?receipt.reference,
                        "SMS accepted"
                    );
                    return Ok(DeliveryReceipt { attempt, receipt });
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "SMS attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.attempt_cooldown).await;
            }
        }

        Err(ModemError::DeliveryExhausted {
            attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn attempt_delivery(
        &self,
        destination: &str,
        body: &str,
    ) -> Result<SubmitReceipt, ModemError> {
        self.ensure_ready().await?;

        let registration = self.registration().await;
        if !registration.is_registered() {
            return Err(ModemError::NotRegistered(registration));
        }
        if !self.set_text_mode().await {
            return Err(ModemError::TextModeRejected);
        }
        self.submit_message(destination, body).await
    }
}

fn receipt(result: ExchangeResult) -> SubmitReceipt {
    SubmitReceipt {
        marker: result.token.unwrap_or_default(),
        reference: parse_reference(&result.response),
        response: result.response,
    }
}

fn parse_reference(response: &str) -> Option<u32> {
    let rest = &response[response.find("+CMGS:")? + "+CMGS:".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
