//! Session lifecycle: one [`Session`] per attempt to hold a conversation
//! with the server, driven by the manager in `manager.rs` on the session
//! task.

pub(crate) mod event_loop;
pub(crate) mod manager;
pub(crate) mod state;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::transport::{StreamConnection, TransportKind};
use state::{SessionPhase, StateMachine};

#[allow(unused)]
macro_rules! session_warn {
    ($session: expr, $($arg:tt)*) =>  {
        log::warn!("session:{} {}", $session.object_id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_warn;

#[allow(unused)]
macro_rules! session_debug {
    ($session: expr, $($arg:tt)*) =>  {
        log::debug!("session:{} {}", $session.object_id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_debug;

#[allow(unused)]
macro_rules! session_error {
    ($session: expr, $($arg:tt)*) =>  {
        log::error!("session:{} {}", $session.object_id, format!($($arg)*));
    }
}
#[allow(unused)]
pub(crate) use session_error;

/// State carried from an outgoing session into its successor.
///
/// With `recovery` set, the successor replays the conversation with a
/// `recover` request from `progressive`; without it, the successor simply
/// rebinds the same server session on another transport.
#[derive(Debug, Clone)]
pub(crate) struct RecoveryBean {
    pub session_id: String,
    pub progressive: u64,
    /// When the outgoing session lost its transport; bounds the recovery
    /// budget.
    pub started: Instant,
    pub recovery: bool,
}

/// Liveness of the WebSocket a session may hold in parallel with its
/// current conversation (early open).
pub(crate) enum WsLiveness {
    NotConnected,
    /// Handshake in flight.
    Connecting,
    /// Handshake done, socket idle and ready to carry a bind.
    Connected(Box<dyn StreamConnection>),
    /// Handshake failed; binding over WS is off the table.
    Broken,
}

impl WsLiveness {
    pub fn name(&self) -> &'static str {
        match self {
            WsLiveness::NotConnected => "WS_NOT_CONNECTED",
            WsLiveness::Connecting => "WS_CONNECTING",
            WsLiveness::Connected(_) => "WS_CONNECTED",
            WsLiveness::Broken => "WS_BROKEN",
        }
    }
}

/// One attempt to hold a logical conversation with the server. Never
/// reused: a session that reaches `Sleep` is replaced by a fresh one.
pub(crate) struct Session {
    pub object_id: u64,
    /// Transport flavor this session is trying to bind.
    pub kind: TransportKind,
    /// A forced transport disables stream-sense fallbacks.
    pub forced: bool,
    /// Manager phase at creation; calls back into the manager carry it.
    pub handler_phase: u64,
    pub sm: StateMachine,
    pub session_id: Option<String>,
    /// Server-pushed redirect for subsequent requests.
    pub control_link: Option<String>,
    /// Keepalive granted by the server on CONOK.
    pub keepalive: Duration,
    /// Seed this session was created from, if any.
    pub recovery: Option<RecoveryBean>,
    /// Count of progressive-bearing notifications received.
    pub data_progressive: u64,
    pub conn: Option<Box<dyn StreamConnection>>,
    /// Whether `conn` is a WebSocket (and can carry further requests) or a
    /// one-way HTTP stream.
    pub conn_is_ws: bool,
    /// Whether the open currently in flight is a WebSocket one.
    pub opening_ws: bool,
    pub pending_ws: WsLiveness,
    /// Cancels in-flight opens registered by this session.
    pub open_abort: CancellationToken,
    /// Cancels the early WebSocket open separately, so a control-link
    /// redirect can re-point it without touching the conversation.
    pub ws_abort: CancellationToken,
    /// A bind is waiting for the early WebSocket open to finish.
    pub bind_pending: bool,
    pub pending_bind: Option<pushlink_core::Request>,
    pub last_rx: Instant,
    /// Whether this session already went through its first RECEIVING.
    pub bound_once: bool,
    /// Streaming attempt already downgraded to polling by stream-sense.
    pub sensed_polling: bool,
}

impl Session {
    pub fn new(
        object_id: u64,
        kind: TransportKind,
        forced: bool,
        handler_phase: u64,
        recovery: Option<RecoveryBean>,
    ) -> Session {
        Session {
            object_id,
            kind,
            forced,
            handler_phase,
            sm: StateMachine::new(),
            session_id: recovery.as_ref().map(|r| r.session_id.clone()),
            control_link: None,
            keepalive: Duration::ZERO,
            data_progressive: recovery.as_ref().map(|r| r.progressive).unwrap_or(0),
            recovery,
            conn: None,
            conn_is_ws: false,
            opening_ws: false,
            pending_ws: WsLiveness::NotConnected,
            open_abort: CancellationToken::new(),
            ws_abort: CancellationToken::new(),
            bind_pending: false,
            pending_bind: None,
            last_rx: Instant::now(),
            bound_once: false,
            sensed_polling: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.sm.phase()
    }

    /// The address control requests and rebinds must target.
    pub fn effective_address<'a>(&'a self, configured: &'a str) -> &'a str {
        self.control_link.as_deref().unwrap_or(configured)
    }

    /// Turn this session into the seed for a successor.
    pub fn to_recovery_bean(&self, recovery: bool) -> Option<RecoveryBean> {
        let session_id = self.session_id.clone()?;
        Some(RecoveryBean {
            session_id,
            progressive: self.data_progressive,
            started: self
                .recovery
                .as_ref()
                .map(|r| r.started)
                .unwrap_or_else(Instant::now),
            recovery,
        })
    }

    /// Abort any in-flight open and drop the live connections.
    pub fn shut_transports(&mut self) {
        self.open_abort.cancel();
        self.ws_abort.cancel();
        self.conn = None;
        self.pending_ws = WsLiveness::Broken;
        self.bind_pending = false;
        self.pending_bind = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_bean_carries_progress() {
        let mut s = Session::new(1, TransportKind::WsStreaming, false, 1, None);
        assert!(s.to_recovery_bean(true).is_none());
        s.session_id = Some("S1".into());
        s.data_progressive = 17;
        let bean = s.to_recovery_bean(true).unwrap();
        assert_eq!(bean.session_id, "S1");
        assert_eq!(bean.progressive, 17);
        assert!(bean.recovery);
    }

    #[test]
    fn recovered_session_resumes_progressive() {
        let bean = RecoveryBean {
            session_id: "S1".into(),
            progressive: 9,
            started: Instant::now(),
            recovery: true,
        };
        let s = Session::new(2, TransportKind::WsStreaming, false, 1, Some(bean));
        assert_eq!(s.data_progressive, 9);
        assert_eq!(s.session_id.as_deref(), Some("S1"));
    }
}
