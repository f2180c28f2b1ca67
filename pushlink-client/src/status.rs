use std::fmt;

/// The observable connection status of a client.
///
/// Exactly one status is active at any time; transitions are totally
/// ordered within a session. The string forms are part of the public
/// contract and are matched by applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    /// Disconnected, a new session attempt is scheduled.
    WillRetry,
    /// Disconnected, a recovery of the previous session is in progress.
    TryingRecovery,
    Connecting,
    /// Session established, transport not yet proven to carry data.
    StreamSensing,
    WsStreaming,
    HttpStreaming,
    WsPolling,
    HttpPolling,
    /// Connected but no data within the keepalive budget.
    Stalled,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Disconnected => "DISCONNECTED",
            ClientStatus::WillRetry => "DISCONNECTED:WILL-RETRY",
            ClientStatus::TryingRecovery => "DISCONNECTED:TRYING-RECOVERY",
            ClientStatus::Connecting => "CONNECTING",
            ClientStatus::StreamSensing => "CONNECTED:STREAM-SENSING",
            ClientStatus::WsStreaming => "CONNECTED:WS-STREAMING",
            ClientStatus::HttpStreaming => "CONNECTED:HTTP-STREAMING",
            ClientStatus::WsPolling => "CONNECTED:WS-POLLING",
            ClientStatus::HttpPolling => "CONNECTED:HTTP-POLLING",
            ClientStatus::Stalled => "STALLED",
        }
    }

    /// Any of the `DISCONNECTED*` statuses.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            ClientStatus::Disconnected | ClientStatus::WillRetry | ClientStatus::TryingRecovery
        )
    }

    /// Any of the `CONNECTED:*` statuses.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ClientStatus::StreamSensing
                | ClientStatus::WsStreaming
                | ClientStatus::HttpStreaming
                | ClientStatus::WsPolling
                | ClientStatus::HttpPolling
        )
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(ClientStatus::WillRetry.to_string(), "DISCONNECTED:WILL-RETRY");
        assert_eq!(
            ClientStatus::TryingRecovery.to_string(),
            "DISCONNECTED:TRYING-RECOVERY"
        );
        assert_eq!(ClientStatus::WsStreaming.to_string(), "CONNECTED:WS-STREAMING");
        assert_eq!(ClientStatus::Stalled.to_string(), "STALLED");
    }

    #[test]
    fn classes() {
        assert!(ClientStatus::TryingRecovery.is_disconnected());
        assert!(!ClientStatus::Stalled.is_disconnected());
        assert!(ClientStatus::HttpPolling.is_connected());
        assert!(!ClientStatus::Connecting.is_connected());
    }
}
