//! The session task.
//!
//! Everything session-scoped runs on one cooperative task: user commands
//! arrive through a thread-safe ingress queue, transports and spawned
//! request exchanges post events back through the event queue, and delayed
//! work goes through a single delay queue whose entries re-check their
//! phase before acting. The loop never blocks on I/O: opens and control
//! exchanges run on spawned tasks, and the one stream connection is polled
//! cancel-safely inside the select.

use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;

use pushlink_core::Request;

use crate::config::{ForcedTransport, MaxBandwidth};
use crate::listener::MessageListener;
use crate::session::manager::SessionCore;
use crate::session::RecoveryBean;
use crate::subscription::Subscription;
use crate::transport::{StreamConnection, TransportError};

/// User-facing calls, posted from the facade.
pub(crate) enum Command {
    Connect,
    Disconnect {
        done: Option<oneshot::Sender<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    SendMessage {
        text: String,
        sequence: String,
        delay: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
    },
    SetOption(OptionChange),
}

/// Mutable options become explicit commands so side effects (transport
/// switches, constrain requests) happen at a safe point.
pub(crate) enum OptionChange {
    ForcedTransport(Option<ForcedTransport>),
    MaxBandwidth(MaxBandwidth),
    ReverseHeartbeatInterval(Duration),
    RetryDelay(Duration),
    FirstRetryMaxDelay(Duration),
    KeepaliveInterval(Duration),
    StalledTimeout(Duration),
    ReconnectTimeout(Duration),
    PollingInterval(Duration),
    IdleTimeout(Duration),
    SessionRecoveryTimeout(Duration),
    EarlyWsOpen(bool),
    ContentLengthRequired(bool),
}

/// Completions posted back by spawned work.
pub(crate) enum SessionEvent {
    /// An `open` for the session conversation finished.
    StreamOpened {
        object_id: u64,
        phase: u64,
        result: Result<Box<dyn StreamConnection>, TransportError>,
    },
    /// An early WebSocket open finished.
    WsPreOpened {
        object_id: u64,
        result: Result<Box<dyn StreamConnection>, TransportError>,
    },
    /// A control-path exchange answered with these lines.
    ControlLines { object_id: u64, lines: Vec<String> },
    /// A control-path exchange failed before reaching the server.
    ControlFailed {
        object_id: u64,
        req_id: Option<u32>,
        request: Request,
        error: TransportError,
    },
    /// A write on the session conversation failed; posted instead of being
    /// handled inline so the send path never re-enters the state machine.
    TransportBroken {
        object_id: u64,
        cause: &'static str,
    },
}

/// What happened on the current stream connection.
pub(crate) enum StreamEvent {
    Line(String),
    Failed(TransportError),
    Closed,
}

/// Who a scheduled task belongs to; mismatches are dropped silently.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TaskScope {
    /// Valid while the manager phase is unchanged.
    Manager(u64),
    /// Valid while this session exists and its phase counter is unchanged.
    Session { object_id: u64, phase: u64 },
    /// Self-validating tasks (their target re-checks its own state).
    Always,
}

pub(crate) enum TaskKind {
    /// Delayed bind after a LOOP or pause.
    Bind,
    /// Streaming produced no data after bind; fall back.
    StreamSenseTimeout,
    /// Check for missing keepalives.
    KeepaliveCheck,
    /// STALLED for too long; give the session up.
    ReconnectTimeout,
    /// Create a fresh session after the retry backoff.
    RetryCreate,
    /// Retry a recovery attempt while the budget lasts.
    RecoveryRetry(RecoveryBean),
    /// A message's delay budget ran out.
    MessageDeadline { token: u64 },
    /// Client-to-server heartbeat on an idle connection.
    ReverseHeartbeat,
    /// Re-send a control request that failed on the network.
    ResendControl(Request),
}

pub(crate) struct ScheduledTask {
    pub scope: TaskScope,
    pub kind: TaskKind,
}

/// The session task's delay queue.
pub(crate) struct Timers {
    queue: DelayQueue<ScheduledTask>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            queue: DelayQueue::new(),
        }
    }

    pub fn schedule(&mut self, scope: TaskScope, kind: TaskKind, delay: Duration) {
        self.queue.insert(ScheduledTask { scope, kind }, delay);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub(crate) struct SessionThread {
    ingress: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    timers: Timers,
    core: SessionCore,
}

impl SessionThread {
    pub fn spawn(
        core: SessionCore,
        ingress: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let thread = SessionThread {
            ingress,
            events,
            timers: Timers::new(),
            core,
        };
        tokio::spawn(thread.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                cmd = self.ingress.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.core.handle_command(cmd, &mut self.timers).await {
                                break;
                            }
                        }
                        // The facade is gone; nothing can reach us anymore.
                        None => break,
                    }
                }
                Some(event) = self.events.recv() => {
                    self.core.handle_event(event, &mut self.timers).await;
                }
                Some(expired) = poll_fn(|cx| self.timers.queue.poll_expired(cx)),
                    if !self.timers.is_empty() =>
                {
                    self.core.handle_task(expired.into_inner(), &mut self.timers).await;
                }
                event = self.core.poll_stream() => {
                    self.core.handle_stream_event(event, &mut self.timers).await;
                }
            }
        }
        debug!("session task drained");
    }
}
