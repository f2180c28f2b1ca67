// Pushlink for Rust
// SPDX-License-Identifier: MPL-2.0

//! Client configuration data.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use pushlink_core::MaxFrequency;

/// Transport the client is forced to use, bypassing stream-sense.
///
/// The two-level forms (`Ws`, `Http`) pin the protocol but still allow the
/// streaming-to-polling fallback; the four specific forms pin both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForcedTransport {
    Ws,
    WsStreaming,
    WsPolling,
    Http,
    HttpStreaming,
    HttpPolling,
}

impl ForcedTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForcedTransport::Ws => "WS",
            ForcedTransport::WsStreaming => "WS-STREAMING",
            ForcedTransport::WsPolling => "WS-POLLING",
            ForcedTransport::Http => "HTTP",
            ForcedTransport::HttpStreaming => "HTTP-STREAMING",
            ForcedTransport::HttpPolling => "HTTP-POLLING",
        }
    }

    pub fn allows_ws(&self) -> bool {
        matches!(
            self,
            ForcedTransport::Ws | ForcedTransport::WsStreaming | ForcedTransport::WsPolling
        )
    }
}

impl fmt::Display for ForcedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForcedTransport {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "WS" => Ok(ForcedTransport::Ws),
            "WS-STREAMING" => Ok(ForcedTransport::WsStreaming),
            "WS-POLLING" => Ok(ForcedTransport::WsPolling),
            "HTTP" => Ok(ForcedTransport::Http),
            "HTTP-STREAMING" => Ok(ForcedTransport::HttpStreaming),
            "HTTP-POLLING" => Ok(ForcedTransport::HttpPolling),
            _ => Err(()),
        }
    }
}

/// Requested outbound bandwidth cap for the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum MaxBandwidth {
    #[default]
    Unlimited,
    /// Kilobits per second.
    Limited(f64),
}

/// Tunable connection behavior. Mutating a live option goes through the
/// ingress queue so the session thread applies it at a safe point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Transport to use instead of stream-sensing, if any.
    #[serde(default)]
    pub forced_transport: Option<ForcedTransport>,
    /// Open the WebSocket handshake while the HTTP create round-trip is
    /// still in flight.
    #[serde(default = "defaults::early_ws_open")]
    pub early_ws_open: bool,
    /// Declare a Content-Length on streaming HTTP requests, for proxies
    /// that refuse chunked request bodies.
    #[serde(default)]
    pub content_length_required: bool,
    #[serde(default = "defaults::content_length")]
    pub content_length: u64,
    /// Interval of client-to-server heartbeats on an otherwise idle
    /// connection; zero disables them.
    #[serde(default = "defaults::reverse_heartbeat_interval")]
    pub reverse_heartbeat_interval: Duration,
    #[serde(default)]
    pub requested_max_bandwidth: MaxBandwidth,
    /// Maximum time the server may leave a polling request unanswered.
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout: Duration,
    /// Requested keepalive interval; zero lets the server decide.
    #[serde(default = "defaults::keepalive_interval")]
    pub keepalive_interval: Duration,
    /// Pause between polling cycles.
    #[serde(default = "defaults::polling_interval")]
    pub polling_interval: Duration,
    /// Base delay before recreating a session after a failure.
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay: Duration,
    /// How long a freshly bound streaming connection may stay silent before
    /// stream-sense falls back to polling.
    #[serde(default = "defaults::first_retry_max_delay")]
    pub first_retry_max_delay: Duration,
    /// Silence beyond the keepalive interval tolerated before STALLED.
    #[serde(default = "defaults::stalled_timeout")]
    pub stalled_timeout: Duration,
    /// Further silence tolerated in STALLED before the session is dropped.
    #[serde(default = "defaults::reconnect_timeout")]
    pub reconnect_timeout: Duration,
    /// Time budget for resuming an interrupted session; zero disables
    /// recovery entirely.
    #[serde(default = "defaults::session_recovery_timeout")]
    pub session_recovery_timeout: Duration,
}

impl ConnectionOptions {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.retry_delay.is_zero() {
            errors.push("retry delay must be positive".to_owned());
        }
        if self.first_retry_max_delay.is_zero() {
            errors.push("first retry max delay must be positive".to_owned());
        }
        if self.reconnect_timeout.is_zero() {
            errors.push("reconnect timeout must be positive".to_owned());
        }
        if let MaxBandwidth::Limited(kbps) = self.requested_max_bandwidth {
            if !(kbps > 0.0) {
                errors.push(format!("requested max bandwidth {kbps} is not positive"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            forced_transport: None,
            early_ws_open: defaults::early_ws_open(),
            content_length_required: false,
            content_length: defaults::content_length(),
            reverse_heartbeat_interval: defaults::reverse_heartbeat_interval(),
            requested_max_bandwidth: MaxBandwidth::default(),
            idle_timeout: defaults::idle_timeout(),
            keepalive_interval: defaults::keepalive_interval(),
            polling_interval: defaults::polling_interval(),
            retry_delay: defaults::retry_delay(),
            first_retry_max_delay: defaults::first_retry_max_delay(),
            stalled_timeout: defaults::stalled_timeout(),
            reconnect_timeout: defaults::reconnect_timeout(),
            session_recovery_timeout: defaults::session_recovery_timeout(),
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectionDetails {
    /// `http(s)://` or `ws(s)://` address of the server.
    pub server_address: Option<String>,
    pub adapter_set: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionDetails {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        match &self.server_address {
            None => errors.push("server address is not set".to_owned()),
            Some(addr) => match url::Url::parse(addr) {
                Ok(u) if matches!(u.scheme(), "http" | "https" | "ws" | "wss") => {}
                Ok(u) => errors.push(format!("unsupported scheme {}", u.scheme())),
                Err(e) => errors.push(format!("bad server address {addr}: {e}")),
            },
        }
        if self.password.is_some() && self.user.is_none() {
            errors.push("password set without a user".to_owned());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn early_ws_open() -> bool {
        true
    }

    pub fn content_length() -> u64 {
        50_000_000
    }

    pub fn reverse_heartbeat_interval() -> Duration {
        Duration::ZERO
    }

    pub fn idle_timeout() -> Duration {
        Duration::from_secs(19)
    }

    pub fn keepalive_interval() -> Duration {
        Duration::ZERO
    }

    pub fn polling_interval() -> Duration {
        Duration::ZERO
    }

    pub fn retry_delay() -> Duration {
        Duration::from_secs(4)
    }

    pub fn first_retry_max_delay() -> Duration {
        Duration::from_millis(100)
    }

    pub fn stalled_timeout() -> Duration {
        Duration::from_secs(2)
    }

    pub fn reconnect_timeout() -> Duration {
        Duration::from_secs(3)
    }

    pub fn session_recovery_timeout() -> Duration {
        Duration::from_secs(15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ConnectionOptions::default().validate().unwrap();
    }

    #[test]
    fn bad_bandwidth_rejected() {
        let opts = ConnectionOptions {
            requested_max_bandwidth: MaxBandwidth::Limited(0.0),
            ..Default::default()
        };
        assert_eq!(opts.validate().unwrap_err().len(), 1);
    }

    #[test]
    fn details_require_address() {
        let details = ConnectionDetails::default();
        assert!(details.validate().is_err());
        let details = ConnectionDetails {
            server_address: Some("wss://push.example.com:443".into()),
            ..Default::default()
        };
        details.validate().unwrap();
        let details = ConnectionDetails {
            server_address: Some("ftp://push.example.com".into()),
            ..Default::default()
        };
        assert!(details.validate().is_err());
    }

    #[test]
    fn forced_transport_strings() {
        for t in [
            ForcedTransport::Ws,
            ForcedTransport::WsStreaming,
            ForcedTransport::WsPolling,
            ForcedTransport::Http,
            ForcedTransport::HttpStreaming,
            ForcedTransport::HttpPolling,
        ] {
            assert_eq!(t.as_str().parse::<ForcedTransport>(), Ok(t));
        }
    }
}
