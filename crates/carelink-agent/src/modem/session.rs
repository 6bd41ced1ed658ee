//! Modem session bookkeeping and response parsing.

use std::fmt;

use super::exchange::ExchangeOutcome;

/// Lifecycle of the modem session.
///
/// `Uninitialized → Initializing → Ready | Faulted`. A failed probe on a
/// `Ready` session sends it back through `Initializing`. `Faulted` is left
/// only through an explicit recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Snapshot of the session, cheap to clone for logging and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemSession {
    pub state: SessionState,
    /// Probes that went unanswered since the last successful one.
    pub probe_failures: u32,
    pub hardware_resets: u32,
    pub exchanges: u64,
    pub last_outcome: Option<ExchangeOutcome>,
}

// ── +CREG ───────────────────────────────────────────────────────────

/// Network registration status from `AT+CREG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    NotRegistered,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
}

impl Registration {
    fn from_stat(stat: u8) -> Self {
        match stat {
            0 => Registration::NotRegistered,
            1 => Registration::Home,
            2 => Registration::Searching,
            3 => Registration::Denied,
            5 => Registration::Roaming,
            _ => Registration::Unknown,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Registration::Home | Registration::Roaming)
    }
}

impl fmt::Display for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Registration::NotRegistered => "not registered",
            Registration::Home => "home network",
            Registration::Searching => "searching",
            Registration::Denied => "registration denied",
            Registration::Unknown => "unknown",
            Registration::Roaming => "roaming",
        };
        f.write_str(s)
    }
}

/// Parse the stat field of a `+CREG:` line.
///
/// Query responses carry `<n>,<stat>[,<lac>,<ci>]`; unsolicited codes carry
/// just `<stat>`.
pub fn parse_registration(response: &str) -> Option<Registration> {
    let rest = field_after(response, "+CREG:")?;
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    let stat = match fields.as_slice() {
        [stat] => stat,
        [_, stat, ..] => stat,
        [] => return None,
    };
    stat.parse().ok().map(Registration::from_stat)
}

// ── +CSQ ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    /// 0..=31, or 99 when unknown.
    pub rssi: u8,
    pub ber: u8,
}

impl SignalQuality {
    /// Received signal strength in dBm, `None` when the modem doesn't know.
    pub fn dbm(&self) -> Option<i32> {
        match self.rssi {
            99 => None,
            rssi => Some(-113 + 2 * i32::from(rssi.min(31))),
        }
    }
}

pub fn parse_signal_quality(response: &str) -> Option<SignalQuality> {
    let rest = field_after(response, "+CSQ:")?;
    let (rssi, ber) = rest.split_once(',')?;
    Some(SignalQuality {
        rssi: rssi.trim().parse().ok()?,
        ber: ber.trim().parse().ok()?,
    })
}

/// Text after `prefix` up to the end of that line.
fn field_after<'a>(response: &'a str, prefix: &str) -> Option<&'a str> {
    let start = response.find(prefix)? + prefix.len();
    let rest = &response[start..];
    let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_query_response() {
        let r = parse_registration("AT+CREG?\r\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        assert_eq!(r, Some(Registration::Home));
        assert!(r.unwrap().is_registered());

        let r = parse_registration("\r\n+CREG: 2,5,\"1A2B\",\"0C3D\"\r\nOK");
        assert_eq!(r, Some(Registration::Roaming));
        assert!(r.unwrap().is_registered());
    }

    #[test]
    fn unregistered_states() {
        for (line, expected) in [
            ("+CREG: 0,0", Registration::NotRegistered),
            ("+CREG: 0,2", Registration::Searching),
            ("+CREG: 0,3", Registration::Denied),
            ("+CREG: 0,4", Registration::Unknown),
        ] {
            let r = parse_registration(line).unwrap();
            assert_eq!(r, expected, "{line}");
            assert!(!r.is_registered());
        }
    }

    #[test]
    fn unsolicited_registration_code() {
        assert_eq!(parse_registration("\r\n+CREG: 1\r\n"), Some(Registration::Home));
    }

    #[test]
    fn registration_missing_or_garbled() {
        assert_eq!(parse_registration("OK"), None);
        assert_eq!(parse_registration("+CREG: x,y"), None);
    }

    #[test]
    fn signal_quality() {
        let q = parse_signal_quality("\r\n+CSQ: 18,0\r\n\r\nOK\r\n").unwrap();
        assert_eq!(q, SignalQuality { rssi: 18, ber: 0 });
        assert_eq!(q.dbm(), Some(-77));

        let unknown = parse_signal_quality("+CSQ: 99,99").unwrap();
        assert_eq!(unknown.dbm(), None);

        assert!(parse_signal_quality("ERROR").is_none());
    }
}
