//! The session manager: owns the current [`Session`], drives its state
//! machine from decoded notifications, timers and transport completions,
//! and orchestrates creation, stream-sense switches and recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use pushlink_core::{
    BindSessionRequest, ControlOp, ControlRequest, CreateSessionRequest, DestroyRequest,
    Notification, RecoverRequest, Request,
};

use crate::config::{ConnectionDetails, ConnectionOptions, ForcedTransport, MaxBandwidth};
use crate::listener::{ClientListener, Dispatcher};
use crate::message::MessageManager;
use crate::retry::ExponentialBackoff;
use crate::session::event_loop::{
    Command, OptionChange, ScheduledTask, SessionEvent, StreamEvent, TaskKind, TaskScope, Timers,
};
use crate::session::state::SessionPhase;
use crate::session::{session_debug, session_warn, RecoveryBean, Session, WsLiveness};
use crate::status::ClientStatus;
use crate::subscription::manager::{ReqIdGen, SubscriptionManager};
use crate::transport::http::HttpConnector;
use crate::transport::ws::WsConnector;
use crate::transport::{Connector, StreamConnection, TransportError, TransportKind};

/// Client identification sent on create.
const CID: &str = "pushlink_client";
/// Ceiling of the create-retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Pacing of control-request retries after a network failure.
const CONTROL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Keepalive assumed when the server granted none.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);

/// What a CONERR/END code means for the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerVerdict {
    /// Surface through `on_server_error`, stop retrying.
    Fatal,
    /// Create a fresh session after the backoff.
    Retry,
    /// The session (or its recovery) is unknown to the server; drop any
    /// recovery state and create fresh.
    SyncError,
}

fn classify_code(code: i32) -> ServerVerdict {
    match code {
        4 | 5 => ServerVerdict::Retry,
        20 | 21 | 41 | 48 => ServerVerdict::SyncError,
        _ => ServerVerdict::Fatal,
    }
}

/// Resolve a CONOK control-link field against the configured address: a
/// bare host (or host:port) replaces the host part, a full URL wins.
fn resolve_control_link(configured: &str, link: &str) -> String {
    if link.contains("://") {
        return link.to_string();
    }
    let Ok(mut url) = Url::parse(configured) else {
        return link.to_string();
    };
    match link
        .rsplit_once(':')
        .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
    {
        Some((host, port)) => {
            if url.set_host(Some(host)).is_err() {
                return link.to_string();
            }
            let _ = url.set_port(Some(port));
        }
        None => {
            if url.set_host(Some(link)).is_err() {
                return link.to_string();
            }
        }
    }
    url.to_string()
}

fn millis_opt(d: Duration) -> Option<u64> {
    (!d.is_zero()).then(|| d.as_millis() as u64)
}

fn close_detached(conn: Box<dyn StreamConnection>) {
    tokio::spawn(async move {
        let mut conn = conn;
        conn.close().await;
    });
}

/// Server-assigned connection facts, written by the session task and read
/// lock-free by the facade.
#[derive(Default)]
pub(crate) struct ServerInfo {
    pub session_id: ArcSwapOption<String>,
    pub control_link: ArcSwapOption<String>,
    pub server_name: ArcSwapOption<String>,
    pub client_ip: ArcSwapOption<String>,
}

pub(crate) struct SessionCore {
    manager_phase: u64,
    next_object_id: u64,
    current: Option<Session>,
    options: ConnectionOptions,
    details: ConnectionDetails,
    server_info: Arc<ServerInfo>,
    status: ClientStatus,
    status_tx: watch::Sender<ClientStatus>,
    listeners: Arc<Mutex<Vec<Arc<dyn ClientListener>>>>,
    dispatcher: Dispatcher,
    subscriptions: SubscriptionManager,
    messages: MessageManager,
    req_ids: ReqIdGen,
    backoff: Option<ExponentialBackoff>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    ws_connector: Arc<WsConnector>,
    http_connector: Arc<HttpConnector>,
}

impl SessionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: ConnectionOptions,
        details: ConnectionDetails,
        server_info: Arc<ServerInfo>,
        status_tx: watch::Sender<ClientStatus>,
        listeners: Arc<Mutex<Vec<Arc<dyn ClientListener>>>>,
        dispatcher: Dispatcher,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        http_connector: HttpConnector,
    ) -> SessionCore {
        SessionCore {
            manager_phase: 0,
            next_object_id: 0,
            current: None,
            options,
            details,
            server_info,
            status: ClientStatus::Disconnected,
            status_tx,
            listeners,
            dispatcher,
            subscriptions: SubscriptionManager::new(),
            messages: MessageManager::new(),
            req_ids: ReqIdGen::new(),
            backoff: None,
            events_tx,
            ws_connector: Arc::new(WsConnector),
            http_connector: Arc::new(http_connector),
        }
    }

    fn set_status(&mut self, status: ClientStatus) {
        if self.status == status {
            return;
        }
        debug!("status {} -> {}", self.status, status);
        self.status = status;
        let _ = self.status_tx.send(status);
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            self.dispatcher
                .dispatch(move || listener.on_status_change(status));
        }
    }

    fn notify_property(&self, property: &'static str) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            self.dispatcher
                .dispatch(move || listener.on_property_change(property));
        }
    }

    fn address(&self) -> String {
        self.details.server_address.clone().unwrap_or_default()
    }

    fn default_kind(&self) -> TransportKind {
        match self.options.forced_transport {
            None | Some(ForcedTransport::Ws) | Some(ForcedTransport::WsStreaming) => {
                TransportKind::WsStreaming
            }
            Some(ForcedTransport::WsPolling) => TransportKind::WsPolling,
            Some(ForcedTransport::Http) | Some(ForcedTransport::HttpStreaming) => {
                TransportKind::HttpStreaming
            }
            Some(ForcedTransport::HttpPolling) => TransportKind::HttpPolling,
        }
    }

    /// Stream-sense may change protocol only when nothing is forced.
    fn may_switch_protocol(&self) -> bool {
        self.options.forced_transport.is_none()
    }

    /// Stream-sense may fall from streaming to polling unless a specific
    /// mode is forced.
    fn may_fall_to_polling(&self) -> bool {
        matches!(
            self.options.forced_transport,
            None | Some(ForcedTransport::Ws) | Some(ForcedTransport::Http)
        )
    }

    fn receiving_session_id(&self) -> Option<String> {
        self.current
            .as_ref()
            .filter(|s| {
                matches!(
                    s.phase(),
                    SessionPhase::Receiving | SessionPhase::Stalled
                )
            })
            .and_then(|s| s.session_id.clone())
    }

    fn effective_keepalive(session: &Session) -> Duration {
        if session.keepalive.is_zero() {
            DEFAULT_KEEPALIVE
        } else {
            session.keepalive
        }
    }

    fn queue_transport_broken(&self, object_id: u64, cause: &'static str) {
        let _ = self
            .events_tx
            .send(SessionEvent::TransportBroken { object_id, cause });
    }

    // ------------------------------------------------------------------
    // Ingress commands
    // ------------------------------------------------------------------

    /// Returns true when the session task must shut down.
    pub async fn handle_command(&mut self, cmd: Command, timers: &mut Timers) -> bool {
        match cmd {
            Command::Connect => {
                if self.status != ClientStatus::Disconnected {
                    debug!("connect ignored in status {}", self.status);
                    return false;
                }
                self.backoff = None;
                self.set_status(ClientStatus::Connecting);
                let kind = self.default_kind();
                self.start_session(timers, kind, None, "api").await;
            }
            Command::Disconnect { done } => {
                self.disconnect().await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Shutdown { done } => {
                self.disconnect().await;
                let _ = done.send(());
                return true;
            }
            Command::Subscribe(sub) => {
                if let Err(e) = self.subscriptions.register(&sub) {
                    warn!("subscribe rejected: {e}");
                    return false;
                }
                if let Some(session_id) = self.receiving_session_id() {
                    match self
                        .subscriptions
                        .activate(&session_id, &mut self.req_ids, &sub)
                    {
                        Ok(request) => self.send_on_session(request, timers).await,
                        Err(e) => warn!("subscribe failed: {e}"),
                    }
                }
            }
            Command::Unsubscribe(sub) => {
                let session_id = self.receiving_session_id();
                match self.subscriptions.unregister(
                    &sub,
                    session_id.as_deref(),
                    &mut self.req_ids,
                    &self.dispatcher,
                ) {
                    Ok(Some(request)) => self.send_on_session(request, timers).await,
                    Ok(None) => {}
                    Err(e) => warn!("unsubscribe rejected: {e}"),
                }
            }
            Command::SendMessage {
                text,
                sequence,
                delay,
                listener,
                enqueue_while_disconnected,
            } => {
                let session_id = self.receiving_session_id();
                let (requests, deadline) = self.messages.send(
                    text,
                    sequence,
                    delay,
                    listener,
                    enqueue_while_disconnected,
                    session_id.as_deref(),
                    &self.dispatcher,
                );
                if let Some((token, delay)) = deadline {
                    timers.schedule(
                        TaskScope::Always,
                        TaskKind::MessageDeadline { token },
                        delay,
                    );
                }
                for request in requests {
                    self.send_on_session(request, timers).await;
                }
            }
            Command::SetOption(change) => self.apply_option(change, timers).await,
        }
        false
    }

    async fn disconnect(&mut self) {
        self.manager_phase += 1;
        self.backoff = None;
        self.messages.on_disconnect(&self.dispatcher);
        self.subscriptions.on_session_close();
        self.messages.renumber_sequences();
        if let Some(mut session) = self.current.take() {
            if let Some(session_id) = session.session_id.clone() {
                let destroy = Request::Destroy(DestroyRequest {
                    session: session_id,
                    cause: Some("api".to_string()),
                });
                if session.kind.is_ws() {
                    if let Some(conn) = session.conn.as_mut() {
                        let _ = conn.send(&destroy).await;
                        conn.close().await;
                    }
                } else {
                    self.spawn_detached_request(&session, destroy);
                }
            }
            session.shut_transports();
            if session.phase().is_alive() {
                session.sm.transition(SessionPhase::Sleep);
            }
            if session.phase() == SessionPhase::Sleep {
                session.sm.transition(SessionPhase::Off);
            }
        }
        self.server_info.session_id.store(None);
        self.set_status(ClientStatus::Disconnected);
    }

    async fn apply_option(&mut self, change: OptionChange, timers: &mut Timers) {
        match change {
            OptionChange::ForcedTransport(t) => {
                self.options.forced_transport = t;
                self.notify_property("forced_transport");
                // A live session moves to the newly allowed transport by
                // rebinding; the server session survives the switch.
                if self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.phase().is_alive())
                {
                    let bean = self
                        .current
                        .as_ref()
                        .and_then(|s| s.to_recovery_bean(false));
                    self.manager_phase += 1;
                    self.set_status(ClientStatus::Connecting);
                    let kind = self.default_kind();
                    self.start_session(timers, kind, bean, "api").await;
                }
            }
            OptionChange::MaxBandwidth(bw) => {
                self.options.requested_max_bandwidth = bw;
                self.notify_property("requested_max_bandwidth");
                if let Some(session_id) = self.receiving_session_id() {
                    let req_id = self.req_ids.next();
                    let request = Request::Control(ControlRequest {
                        session: session_id,
                        req_id,
                        op: ControlOp::Constrain {
                            requested_max_bandwidth: match bw {
                                MaxBandwidth::Unlimited => None,
                                MaxBandwidth::Limited(v) => Some(v),
                            },
                        },
                    });
                    self.send_on_session(request, timers).await;
                }
            }
            OptionChange::ReverseHeartbeatInterval(d) => {
                self.options.reverse_heartbeat_interval = d;
                self.notify_property("reverse_heartbeat_interval");
                if !d.is_zero() {
                    if let Some(session) = self
                        .current
                        .as_ref()
                        .filter(|s| s.phase() == SessionPhase::Receiving)
                    {
                        timers.schedule(
                            TaskScope::Session {
                                object_id: session.object_id,
                                phase: session.sm.count(),
                            },
                            TaskKind::ReverseHeartbeat,
                            d,
                        );
                    }
                }
            }
            OptionChange::RetryDelay(d) => {
                self.options.retry_delay = d;
                self.notify_property("retry_delay");
            }
            OptionChange::FirstRetryMaxDelay(d) => {
                self.options.first_retry_max_delay = d;
                self.notify_property("first_retry_max_delay");
            }
            OptionChange::KeepaliveInterval(d) => {
                self.options.keepalive_interval = d;
                self.notify_property("keepalive_interval");
            }
            OptionChange::StalledTimeout(d) => {
                self.options.stalled_timeout = d;
                self.notify_property("stalled_timeout");
            }
            OptionChange::ReconnectTimeout(d) => {
                self.options.reconnect_timeout = d;
                self.notify_property("reconnect_timeout");
            }
            OptionChange::PollingInterval(d) => {
                self.options.polling_interval = d;
                self.notify_property("polling_interval");
            }
            OptionChange::IdleTimeout(d) => {
                self.options.idle_timeout = d;
                self.notify_property("idle_timeout");
            }
            OptionChange::SessionRecoveryTimeout(d) => {
                self.options.session_recovery_timeout = d;
                self.notify_property("session_recovery_timeout");
            }
            OptionChange::EarlyWsOpen(enabled) => {
                self.options.early_ws_open = enabled;
                self.notify_property("early_ws_open");
            }
            OptionChange::ContentLengthRequired(required) => {
                self.options.content_length_required = required;
                self.notify_property("content_length_required");
            }
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    async fn start_session(
        &mut self,
        timers: &mut Timers,
        kind: TransportKind,
        bean: Option<RecoveryBean>,
        cause: &str,
    ) {
        if let Some(mut old) = self.current.take() {
            old.shut_transports();
            if old.phase().is_alive() {
                old.sm.transition(SessionPhase::Sleep);
            }
            if old.phase() == SessionPhase::Sleep {
                old.sm.transition(SessionPhase::Off);
            }
        }
        self.next_object_id += 1;
        let forced = self.options.forced_transport.is_some();
        let mut session = Session::new(
            self.next_object_id,
            kind,
            forced,
            self.manager_phase,
            bean,
        );
        session.sm.transition(SessionPhase::Creating);
        session_debug!(session, "starting as {:?} ({cause})", kind);
        let address = self.address();
        let object_id = session.object_id;

        match session.recovery.clone() {
            // Continuation on another transport: the server session exists,
            // skip create and bind right away.
            Some(bean) if !bean.recovery => {
                session.sm.transition(SessionPhase::Created);
                self.current = Some(session);
                self.send_bind(timers).await;
            }
            // True recovery: replay from the last received progressive.
            Some(bean) => {
                session.bound_once = true;
                let request = Request::Recover(RecoverRequest {
                    session: bean.session_id.clone(),
                    recovery_from: bean.progressive,
                    cause: Some(cause.to_string()),
                });
                let phase = session.sm.count();
                let abort = session.open_abort.clone();
                let over_ws = kind.is_ws();
                session.opening_ws = over_ws;
                self.current = Some(session);
                self.spawn_open(over_ws, address, request, object_id, phase, abort);
            }
            None => {
                let request = Request::CreateSession(CreateSessionRequest {
                    cid: CID.to_string(),
                    adapter_set: self.details.adapter_set.clone(),
                    user: self.details.user.clone(),
                    password: self.details.password.clone(),
                    polling: false,
                    keepalive_millis: millis_opt(self.options.keepalive_interval),
                    idle_millis: None,
                    polling_millis: None,
                    requested_max_bandwidth: match self.options.requested_max_bandwidth {
                        MaxBandwidth::Unlimited => None,
                        MaxBandwidth::Limited(v) => Some(v),
                    },
                    old_session: self
                        .server_info
                        .session_id
                        .load_full()
                        .map(|s| (*s).clone()),
                    cause: Some(cause.to_string()),
                });
                let create_over_ws = self
                    .options
                    .forced_transport
                    .map(|t| t.allows_ws())
                    .unwrap_or(false);
                // Overlap the WS handshake with the HTTP create round-trip.
                if !create_over_ws && kind.is_ws() && self.options.early_ws_open {
                    session.pending_ws = WsLiveness::Connecting;
                    self.spawn_ws_preopen(&session, address.clone());
                }
                let phase = session.sm.count();
                let abort = session.open_abort.clone();
                session.opening_ws = create_over_ws;
                self.current = Some(session);
                self.spawn_open(create_over_ws, address, request, object_id, phase, abort);
            }
        }
    }

    fn spawn_open(
        &self,
        over_ws: bool,
        address: String,
        request: Request,
        object_id: u64,
        phase: u64,
        abort: CancellationToken,
    ) {
        let events = self.events_tx.clone();
        let ws = self.ws_connector.clone();
        let http = self.http_connector.clone();
        tokio::spawn(async move {
            let result = if over_ws {
                ws.open(&address, Some(&request), &abort).await
            } else {
                http.open(&address, Some(&request), &abort).await
            };
            let _ = events.send(SessionEvent::StreamOpened {
                object_id,
                phase,
                result,
            });
        });
    }

    fn spawn_ws_preopen(&self, session: &Session, address: String) {
        let events = self.events_tx.clone();
        let connector = self.ws_connector.clone();
        let abort = session.ws_abort.clone();
        let object_id = session.object_id;
        tokio::spawn(async move {
            let result = connector.open(&address, None, &abort).await;
            let _ = events.send(SessionEvent::WsPreOpened { object_id, result });
        });
    }

    fn spawn_detached_request(&self, session: &Session, request: Request) {
        let address = session.effective_address(&self.address()).to_string();
        let connector = self.http_connector.clone();
        tokio::spawn(async move {
            let _ = connector.request_lines(&address, &request).await;
        });
    }

    fn spawn_control(&self, request: Request) {
        let Some(session) = self.current.as_ref() else {
            return;
        };
        let address = session.effective_address(&self.address()).to_string();
        let object_id = session.object_id;
        let connector = self.http_connector.clone();
        let events = self.events_tx.clone();
        let req_id = match &request {
            Request::Control(c) => Some(c.req_id),
            _ => None,
        };
        tokio::spawn(async move {
            match connector.request_lines(&address, &request).await {
                Ok(lines) => {
                    let _ = events.send(SessionEvent::ControlLines { object_id, lines });
                }
                Err(error) => {
                    let _ = events.send(SessionEvent::ControlFailed {
                        object_id,
                        req_id,
                        request,
                        error,
                    });
                }
            }
        });
    }

    /// Put a request on the wire of the current session: inline on the
    /// WebSocket, as a separate exchange on HTTP.
    async fn send_on_session(&mut self, request: Request, _timers: &mut Timers) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let object_id = session.object_id;
        if session.kind.is_ws() {
            let result = match session.conn.as_mut() {
                Some(conn) => conn.send(&request).await,
                None => {
                    debug!("session:{object_id} no connection for request, dropped");
                    return;
                }
            };
            if let Err(e) = result {
                warn!("session:{object_id} request send failed: {e}");
                self.queue_transport_broken(object_id, "write.error");
            }
            return;
        }
        self.spawn_control(request);
    }

    /// Send the bind (or the rebind) of the current session.
    async fn send_bind(&mut self, timers: &mut Timers) {
        let configured = self.address();
        let keepalive_millis = millis_opt(self.options.keepalive_interval);
        let idle_millis = millis_opt(self.options.idle_timeout);
        let polling_millis = Some(self.options.polling_interval.as_millis() as u64);
        let first_retry_max_delay = self.options.first_retry_max_delay;

        enum Route {
            WsInline,
            WsOpen,
            WsWait,
            WsBroken,
            Http,
        }

        let Some(session) = self.current.as_mut() else {
            return;
        };
        let Some(session_id) = session.session_id.clone() else {
            session_warn!(session, "bind without a session id");
            return;
        };
        let polling = session.kind.is_polling();
        let request = Request::BindSession(BindSessionRequest {
            session: session_id,
            polling,
            keepalive_millis: if polling { None } else { keepalive_millis },
            idle_millis: if polling { idle_millis } else { None },
            polling_millis: if polling { polling_millis } else { None },
            cause: None,
        });
        let next = match session.phase() {
            SessionPhase::Created => SessionPhase::FirstBinding,
            SessionPhase::FirstPause | SessionPhase::Pause => SessionPhase::Binding,
            other => {
                session_warn!(session, "bind in phase {other}, dropped");
                return;
            }
        };
        session.sm.transition(next);
        let address = session.effective_address(&configured).to_string();
        let object_id = session.object_id;
        let phase = session.sm.count();
        let watch_sense = !session.bound_once;

        let route = if session.kind.is_ws() {
            if session.conn.is_some() && session.conn_is_ws {
                Route::WsInline
            } else {
                match std::mem::replace(&mut session.pending_ws, WsLiveness::NotConnected) {
                    WsLiveness::Connected(conn) => {
                        // Promoting the pre-opened socket abandons the
                        // create stream, if one is still live.
                        session.conn = Some(conn);
                        session.conn_is_ws = true;
                        Route::WsInline
                    }
                    WsLiveness::Connecting => {
                        session.pending_ws = WsLiveness::Connecting;
                        session.bind_pending = true;
                        session.pending_bind = Some(request.clone());
                        Route::WsWait
                    }
                    WsLiveness::NotConnected => {
                        session.opening_ws = true;
                        Route::WsOpen
                    }
                    WsLiveness::Broken => {
                        session.pending_ws = WsLiveness::Broken;
                        Route::WsBroken
                    }
                }
            }
        } else {
            session.opening_ws = false;
            Route::Http
        };

        match route {
            Route::WsInline => {
                let result = match self
                    .current
                    .as_mut()
                    .and_then(|s| s.conn.as_mut())
                {
                    Some(conn) => conn.send(&request).await,
                    None => return,
                };
                if let Err(e) = result {
                    warn!("session:{object_id} bind send failed: {e}");
                    self.queue_transport_broken(object_id, "write.error");
                    return;
                }
            }
            Route::WsOpen => {
                let abort = self
                    .current
                    .as_ref()
                    .map(|s| s.open_abort.clone())
                    .unwrap_or_default();
                self.spawn_open(true, address, request, object_id, phase, abort);
            }
            Route::WsWait => {
                trace!("session:{object_id} bind parked behind the ws handshake");
            }
            Route::WsBroken => {
                // The parent decides between the alternate protocol and a
                // plain retry.
                self.queue_transport_broken(object_id, "ws.unavailable");
                return;
            }
            Route::Http => {
                let abort = self
                    .current
                    .as_ref()
                    .map(|s| s.open_abort.clone())
                    .unwrap_or_default();
                self.spawn_open(false, address, request, object_id, phase, abort);
            }
        }

        if watch_sense {
            timers.schedule(
                TaskScope::Session { object_id, phase },
                TaskKind::StreamSenseTimeout,
                first_retry_max_delay,
            );
        }
    }

    fn session_failed(&mut self, timers: &mut Timers, cause: &str) {
        warn!("session failed: {cause}");
        self.manager_phase += 1;
        if let Some(session) = self.current.as_mut() {
            session.shut_transports();
            if session.phase().is_alive() {
                session.sm.transition(SessionPhase::Sleep);
            }
        }
        self.subscriptions.on_session_close();
        self.messages.renumber_sequences();
        self.server_info.session_id.store(None);
        self.set_status(ClientStatus::WillRetry);
        let retry_delay = self.options.retry_delay;
        let delay = self
            .backoff
            .get_or_insert_with(|| ExponentialBackoff::new(MAX_RETRY_DELAY, None, retry_delay))
            .next()
            .unwrap_or(MAX_RETRY_DELAY);
        debug!("retrying create in {delay:?}");
        timers.schedule(
            TaskScope::Manager(self.manager_phase),
            TaskKind::RetryCreate,
            delay,
        );
    }

    async fn start_recovery(&mut self, timers: &mut Timers, bean: RecoveryBean, cause: &str) {
        if self.options.session_recovery_timeout.is_zero() {
            self.session_failed(timers, cause);
            return;
        }
        if bean.started.elapsed() >= self.options.session_recovery_timeout {
            debug!("recovery budget exhausted, giving the session up");
            self.session_failed(timers, "recovery.timeout");
            return;
        }
        self.manager_phase += 1;
        self.set_status(ClientStatus::TryingRecovery);
        let kind = self
            .current
            .as_ref()
            .map(|s| s.kind)
            .unwrap_or_else(|| self.default_kind());
        let bean = RecoveryBean {
            recovery: true,
            ..bean
        };
        self.start_session(timers, kind, Some(bean), cause).await;
    }

    /// A child transport reported it cannot carry the session; switch to
    /// the alternate protocol. Stale callers (old manager phase) are
    /// ignored.
    async fn stream_sense_switch(
        &mut self,
        handler_phase: u64,
        cause: &str,
        timers: &mut Timers,
    ) {
        if handler_phase != self.manager_phase {
            debug!("stale stream-sense switch ({cause}), ignored");
            return;
        }
        self.manager_phase += 1;
        let bean = self
            .current
            .as_ref()
            .and_then(|s| s.to_recovery_bean(false));
        let kind = self
            .current
            .as_ref()
            .map(|s| s.kind.alternate_protocol())
            .unwrap_or(TransportKind::HttpStreaming);
        debug!("stream-sense switch to {kind:?} ({cause})");
        self.start_session(timers, kind, bean, cause).await;
    }

    async fn on_transport_broken(&mut self, timers: &mut Timers, cause: &'static str) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        session.conn = None;
        let phase = session.phase();
        let is_ws = session.kind.is_ws();
        let handler_phase = session.handler_phase;
        let recovering = session.recovery.as_ref().is_some_and(|b| b.recovery);
        session_debug!(session, "transport broken in {phase}: {cause}");
        match phase {
            // Expected between a LOOP and the next bind.
            SessionPhase::FirstPause | SessionPhase::Pause => {}
            SessionPhase::Sleep | SessionPhase::Off => {}
            SessionPhase::Creating
            | SessionPhase::Created
            | SessionPhase::FirstBinding
            | SessionPhase::Binding => {
                if recovering {
                    // A failed recovery attempt is paced by the retry
                    // delay, bounded by the recovery budget.
                    let bean = self.current.as_ref().and_then(|s| s.to_recovery_bean(true));
                    self.manager_phase += 1;
                    if let Some(session) = self.current.as_mut() {
                        session.shut_transports();
                        if session.phase().is_alive() {
                            session.sm.transition(SessionPhase::Sleep);
                        }
                    }
                    match bean {
                        Some(bean)
                            if bean.started.elapsed()
                                < self.options.session_recovery_timeout =>
                        {
                            timers.schedule(
                                TaskScope::Manager(self.manager_phase),
                                TaskKind::RecoveryRetry(bean),
                                self.options.retry_delay,
                            );
                        }
                        _ => self.session_failed(timers, "recovery.timeout"),
                    }
                } else if is_ws && self.may_switch_protocol() {
                    self.stream_sense_switch(handler_phase, cause, timers).await;
                } else {
                    self.session_failed(timers, cause);
                }
            }
            SessionPhase::Receiving | SessionPhase::Stalled => {
                let bean = self.current.as_ref().and_then(|s| s.to_recovery_bean(true));
                match bean {
                    Some(bean) if !self.options.session_recovery_timeout.is_zero() => {
                        self.start_recovery(timers, bean, cause).await;
                    }
                    _ => self.session_failed(timers, cause),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Poll the current stream connection; pends forever without one.
    pub async fn poll_stream(&mut self) -> StreamEvent {
        match self.current.as_mut().and_then(|s| s.conn.as_mut()) {
            Some(conn) => match conn.next_line().await {
                Some(Ok(line)) => StreamEvent::Line(line),
                Some(Err(e)) => StreamEvent::Failed(e),
                None => StreamEvent::Closed,
            },
            None => futures::future::pending().await,
        }
    }

    pub async fn handle_stream_event(&mut self, event: StreamEvent, timers: &mut Timers) {
        match event {
            StreamEvent::Line(line) => self.handle_line(line, timers).await,
            StreamEvent::Failed(e) => {
                warn!("stream failed: {e}");
                self.on_transport_broken(timers, "network.error").await;
            }
            StreamEvent::Closed => {
                self.on_transport_broken(timers, "connection.closed").await;
            }
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent, timers: &mut Timers) {
        match event {
            SessionEvent::StreamOpened {
                object_id,
                phase,
                result,
            } => {
                let valid = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.object_id == object_id && s.sm.count() == phase);
                if !valid {
                    if let Ok(conn) = result {
                        close_detached(conn);
                    }
                    return;
                }
                match result {
                    Ok(conn) => {
                        if let Some(session) = self.current.as_mut() {
                            session.conn = Some(conn);
                            session.conn_is_ws = session.opening_ws;
                            session.last_rx = Instant::now();
                        }
                    }
                    Err(TransportError::Aborted) => {}
                    Err(e) => {
                        warn!("open failed: {e}");
                        self.on_transport_broken(timers, "connect.error").await;
                    }
                }
            }
            SessionEvent::WsPreOpened { object_id, result } => {
                self.handle_ws_preopened(object_id, result, timers).await;
            }
            SessionEvent::ControlLines { object_id, lines } => {
                let valid = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.object_id == object_id && s.phase().is_alive());
                if !valid {
                    return;
                }
                for line in lines {
                    match Notification::decode(&line) {
                        Ok(n) => self.handle_notification(n, timers).await,
                        Err(e) => warn!("undecodable control response: {e}"),
                    }
                }
            }
            SessionEvent::ControlFailed {
                object_id,
                req_id,
                request,
                error,
            } => {
                let valid = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.object_id == object_id && s.phase().is_alive());
                if !valid {
                    return;
                }
                warn!("control request failed: {error}");
                let still_wanted = match req_id {
                    Some(id) => self.subscriptions.take_for_retry(id).is_some(),
                    None => true,
                };
                if still_wanted {
                    timers.schedule(
                        TaskScope::Always,
                        TaskKind::ResendControl(request),
                        CONTROL_RETRY_DELAY,
                    );
                }
            }
            SessionEvent::TransportBroken { object_id, cause } => {
                let valid = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.object_id == object_id && s.phase().is_alive());
                if valid {
                    self.on_transport_broken(timers, cause).await;
                }
            }
        }
    }

    async fn handle_ws_preopened(
        &mut self,
        object_id: u64,
        result: Result<Box<dyn StreamConnection>, TransportError>,
        timers: &mut Timers,
    ) {
        let valid = self
            .current
            .as_ref()
            .is_some_and(|s| s.object_id == object_id && s.phase().is_alive());
        if !valid {
            if let Ok(conn) = result {
                close_detached(conn);
            }
            return;
        }
        match result {
            Ok(conn) => {
                let pending = {
                    let Some(session) = self.current.as_mut() else {
                        return;
                    };
                    session_debug!(session, "early websocket open succeeded");
                    if session.bind_pending {
                        session.bind_pending = false;
                        session.pending_ws = WsLiveness::NotConnected;
                        session.conn = Some(conn);
                        session.conn_is_ws = true;
                        session.pending_bind.take()
                    } else {
                        session.pending_ws = WsLiveness::Connected(conn);
                        None
                    }
                };
                if let Some(request) = pending {
                    self.send_on_session(request, timers).await;
                }
            }
            Err(e) => {
                debug!("early websocket open failed: {e}");
                let (was_bind_pending, handler_phase) = {
                    let Some(session) = self.current.as_mut() else {
                        return;
                    };
                    session.pending_ws = WsLiveness::Broken;
                    let was = session.bind_pending;
                    session.bind_pending = false;
                    session.pending_bind = None;
                    (was, session.handler_phase)
                };
                if was_bind_pending {
                    if self.may_switch_protocol() {
                        self.stream_sense_switch(handler_phase, "ws.broken", timers)
                            .await;
                    } else {
                        self.session_failed(timers, "ws.broken");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn handle_line(&mut self, line: String, timers: &mut Timers) {
        let stalled_timeout = self.options.stalled_timeout;
        let revived = {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            session.last_rx = Instant::now();
            if session.phase() == SessionPhase::Stalled {
                session.sm.transition(SessionPhase::Receiving);
                let threshold = Self::effective_keepalive(session) + stalled_timeout;
                Some((
                    session.kind.connected_status(),
                    TaskScope::Session {
                        object_id: session.object_id,
                        phase: session.sm.count(),
                    },
                    threshold,
                ))
            } else {
                None
            }
        };
        if let Some((status, scope, threshold)) = revived {
            self.set_status(status);
            timers.schedule(scope, TaskKind::KeepaliveCheck, threshold);
        }

        trace!("line: {line:?}");
        let notification = match Notification::decode(&line) {
            Ok(n) => n,
            // Unknown directives and bad fields are recoverable; skip the
            // line and keep the stream.
            Err(e) => {
                warn!("protocol error: {e}");
                return;
            }
        };
        if notification.bears_progressive() {
            if let Some(session) = self.current.as_mut() {
                session.data_progressive += 1;
            }
        }
        self.handle_notification(notification, timers).await;
    }

    async fn handle_notification(&mut self, notification: Notification, timers: &mut Timers) {
        match notification {
            Notification::Probe | Notification::Noop { .. } => {
                self.note_data(timers).await;
            }
            Notification::Sync { seconds } => {
                trace!("sync checkpoint at {seconds}s");
                self.note_data(timers).await;
            }
            Notification::Servname { name } => {
                self.note_data(timers).await;
                self.server_info.server_name.store(Some(Arc::new(name)));
                self.notify_property("server_socket_name");
            }
            Notification::Clientip { ip } => {
                self.note_data(timers).await;
                self.server_info.client_ip.store(Some(Arc::new(ip)));
                self.notify_property("client_ip");
            }
            Notification::Conok {
                session,
                request_limit: _,
                keepalive_millis,
                control_link,
            } => {
                self.on_conok(session, keepalive_millis, control_link, timers)
                    .await;
            }
            Notification::Conerr { code, message } => {
                self.on_refused(code, message, timers);
            }
            Notification::End { code, message } => {
                self.on_refused(code, message, timers);
            }
            Notification::Error { code, message } => {
                self.on_fatal(code, message);
            }
            Notification::Loop {
                expected_delay_millis,
            } => {
                self.on_loop(expected_delay_millis, timers);
            }
            Notification::Subok {
                sub_id,
                num_items,
                num_fields,
            } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_subok(sub_id, num_items, num_fields, &self.dispatcher);
            }
            Notification::Subcmd {
                sub_id,
                num_items,
                num_fields,
                key_pos,
                cmd_pos,
            } => {
                self.note_data(timers).await;
                self.subscriptions.on_subcmd(
                    sub_id,
                    num_items,
                    num_fields,
                    key_pos,
                    cmd_pos,
                    &self.dispatcher,
                );
            }
            Notification::Unsub { sub_id } => {
                self.note_data(timers).await;
                self.subscriptions.on_unsub(sub_id, &self.dispatcher);
            }
            Notification::Update {
                sub_id,
                item,
                fields,
            } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_update(sub_id, item, &fields, &self.dispatcher);
            }
            Notification::EndOfSnapshot { sub_id, item } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_end_of_snapshot(sub_id, item, &self.dispatcher);
            }
            Notification::ClearSnapshot { sub_id, item } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_clear_snapshot(sub_id, item, &self.dispatcher);
            }
            Notification::Overflow { sub_id, item, lost } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_overflow(sub_id, item, lost, &self.dispatcher);
            }
            Notification::Conf {
                sub_id,
                max_frequency,
            } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_conf(sub_id, max_frequency, &self.dispatcher);
            }
            Notification::Reqok { req_id } => {
                self.note_data(timers).await;
                self.subscriptions.on_reqok(req_id);
            }
            Notification::Reqerr {
                req_id,
                code,
                message,
            } => {
                self.note_data(timers).await;
                self.subscriptions
                    .on_reqerr(req_id, code, &message, &self.dispatcher);
            }
            Notification::Msgdone { sequence, prog } => {
                self.note_data(timers).await;
                self.messages.on_msgdone(&sequence, prog, &self.dispatcher);
            }
            Notification::Msgfail {
                sequence,
                prog,
                code,
                message,
            } => {
                self.note_data(timers).await;
                let Some(session_id) = self.receiving_session_id() else {
                    return;
                };
                let retries = self.messages.on_msgfail(
                    &session_id,
                    &sequence,
                    prog,
                    code,
                    &message,
                    &self.dispatcher,
                );
                for request in retries {
                    self.send_on_session(request, timers).await;
                }
            }
            Notification::Mpnreg { device_id, adapter } => {
                debug!("push device {device_id} registered with {adapter}");
            }
            Notification::Mpnok { sub_id, mpn_sub_id } => {
                debug!("push subscription {mpn_sub_id} active for {sub_id}");
            }
        }
    }

    /// Stream data began: a binding session becomes a receiving one.
    async fn note_data(&mut self, timers: &mut Timers) {
        let reverse_heartbeat = self.options.reverse_heartbeat_interval;
        let stalled_timeout = self.options.stalled_timeout;
        let staged = {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            if !session.phase().is_binding() {
                return;
            }
            session.sm.transition(SessionPhase::Receiving);
            let first = !session.bound_once;
            session.bound_once = true;
            let scope = TaskScope::Session {
                object_id: session.object_id,
                phase: session.sm.count(),
            };
            (
                session.kind.connected_status(),
                scope,
                Self::effective_keepalive(session) + stalled_timeout,
                first,
                session.session_id.clone(),
            )
        };
        let (status, scope, threshold, first, session_id) = staged;
        self.backoff = None;
        self.set_status(status);
        timers.schedule(scope, TaskKind::KeepaliveCheck, threshold);
        if !reverse_heartbeat.is_zero() {
            timers.schedule(scope, TaskKind::ReverseHeartbeat, reverse_heartbeat);
        }
        if first {
            if let Some(session_id) = session_id {
                let requests = self
                    .subscriptions
                    .batch_for_session(&session_id, &mut self.req_ids);
                let (flushed, deadlines) = self.messages.flush(&session_id);
                for (token, delay) in deadlines {
                    timers.schedule(
                        TaskScope::Always,
                        TaskKind::MessageDeadline { token },
                        delay,
                    );
                }
                for request in requests.into_iter().chain(flushed) {
                    self.send_on_session(request, timers).await;
                }
            }
        }
    }

    async fn on_conok(
        &mut self,
        session_id: String,
        keepalive_millis: u64,
        control_link: Option<String>,
        timers: &mut Timers,
    ) {
        let configured = self.address();
        let staged = {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            if session.phase() != SessionPhase::Creating {
                session_debug!(session, "CONOK in phase {}, ignored", session.phase());
                return;
            }
            session.session_id = Some(session_id.clone());
            session.keepalive = Duration::from_millis(keepalive_millis);
            let recovering = session.recovery.as_ref().is_some_and(|b| b.recovery);

            let mut reopen_ws = None;
            if let Some(link) = control_link.as_ref() {
                let link_address = resolve_control_link(&configured, link);
                session_debug!(session, "control link {link_address}");
                session.control_link = Some(link_address.clone());
                // Re-point a pre-opened socket at the redirect target.
                match std::mem::replace(&mut session.pending_ws, WsLiveness::NotConnected) {
                    WsLiveness::Connecting => {
                        session.ws_abort.cancel();
                        session.ws_abort = CancellationToken::new();
                        session.pending_ws = WsLiveness::Connecting;
                        reopen_ws = Some(link_address);
                    }
                    WsLiveness::Connected(conn) => {
                        close_detached(conn);
                        session.pending_ws = WsLiveness::Connecting;
                        reopen_ws = Some(link_address);
                    }
                    other => session.pending_ws = other,
                }
            }
            session.sm.transition(SessionPhase::Created);
            if recovering {
                // The recover conversation continues on this connection.
                session.sm.transition(SessionPhase::FirstBinding);
            }
            (recovering, reopen_ws)
        };
        let (recovering, reopen_ws) = staged;
        {
            self.server_info
                .session_id
                .store(Some(Arc::new(session_id)));
            self.server_info
                .control_link
                .store(control_link.map(Arc::new));
        }
        self.set_status(ClientStatus::StreamSensing);
        if let (Some(address), Some(session)) = (reopen_ws, self.current.as_ref()) {
            self.spawn_ws_preopen(session, address);
        }
        if !recovering {
            self.send_bind(timers).await;
        }
    }

    fn on_refused(&mut self, code: i32, message: String, timers: &mut Timers) {
        match classify_code(code) {
            ServerVerdict::Fatal => self.on_fatal(code, message),
            ServerVerdict::Retry => {
                debug!("server refused ({code} {message}), retrying");
                self.session_failed(timers, "server.retry");
            }
            ServerVerdict::SyncError => {
                // The recovery (or the whole session) is unknown server
                // side; any remembered state is worthless now.
                debug!("sync error ({code} {message}), creating fresh");
                self.session_failed(timers, "sync.error");
            }
        }
    }

    fn on_fatal(&mut self, code: i32, message: String) {
        warn!("fatal server error {code}: {message}");
        self.manager_phase += 1;
        self.backoff = None;
        if let Some(mut session) = self.current.take() {
            session.shut_transports();
            if session.phase().is_alive() {
                session.sm.transition(SessionPhase::Sleep);
            }
            if session.phase() == SessionPhase::Sleep {
                session.sm.transition(SessionPhase::Off);
            }
        }
        self.subscriptions.on_session_close();
        self.messages.on_disconnect(&self.dispatcher);
        self.server_info.session_id.store(None);
        self.set_status(ClientStatus::Disconnected);
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let message = message.clone();
            self.dispatcher
                .dispatch(move || listener.on_server_error(code, &message));
        }
    }

    fn on_loop(&mut self, delay_millis: u64, timers: &mut Timers) {
        let polling_interval = self.options.polling_interval;
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let next = match session.phase() {
            SessionPhase::FirstBinding => SessionPhase::FirstPause,
            SessionPhase::Binding | SessionPhase::Receiving => SessionPhase::Pause,
            other => {
                session_debug!(session, "LOOP in phase {other}, ignored");
                return;
            }
        };
        session.sm.transition(next);
        // The HTTP stream ends with the LOOP; the WebSocket carries the
        // next bind on the same socket.
        if !session.kind.is_ws() {
            session.conn = None;
        }
        let mut delay = Duration::from_millis(delay_millis);
        if session.kind.is_polling() {
            delay = delay.max(polling_interval);
        }
        timers.schedule(
            TaskScope::Session {
                object_id: session.object_id,
                phase: session.sm.count(),
            },
            TaskKind::Bind,
            delay,
        );
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn task_valid(&self, scope: &TaskScope) -> bool {
        match scope {
            TaskScope::Manager(phase) => *phase == self.manager_phase,
            TaskScope::Session { object_id, phase } => self
                .current
                .as_ref()
                .is_some_and(|s| s.object_id == *object_id && s.sm.count() == *phase),
            TaskScope::Always => true,
        }
    }

    pub async fn handle_task(&mut self, task: ScheduledTask, timers: &mut Timers) {
        if !self.task_valid(&task.scope) {
            trace!("stale task dropped");
            return;
        }
        match task.kind {
            TaskKind::Bind => {
                if self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.phase().is_paused())
                {
                    self.send_bind(timers).await;
                }
            }
            TaskKind::StreamSenseTimeout => {
                self.on_stream_sense_timeout(timers).await;
            }
            TaskKind::KeepaliveCheck => self.on_keepalive_check(timers),
            TaskKind::ReconnectTimeout => self.on_reconnect_timeout(),
            TaskKind::RetryCreate => {
                self.set_status(ClientStatus::Connecting);
                let kind = self.default_kind();
                self.start_session(timers, kind, None, "retry").await;
            }
            TaskKind::RecoveryRetry(bean) => {
                self.start_recovery(timers, bean, "recovery.retry").await;
            }
            TaskKind::MessageDeadline { token } => {
                self.messages.on_deadline(token, &self.dispatcher);
            }
            TaskKind::ReverseHeartbeat => self.on_reverse_heartbeat(timers).await,
            TaskKind::ResendControl(request) => {
                let alive = self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.phase().is_alive());
                if !alive {
                    return;
                }
                // Dropped from pending means a REQERR landed in the
                // meantime; a REQERR is never followed by a resend.
                let still_wanted = match &request {
                    Request::Control(c) => self.subscriptions.take_for_retry(c.req_id).is_some(),
                    _ => true,
                };
                if still_wanted {
                    self.send_on_session(request, timers).await;
                }
            }
        }
    }

    async fn on_stream_sense_timeout(&mut self, timers: &mut Timers) {
        let fall_to_polling = self.may_fall_to_polling();
        let switch_protocol = self.may_switch_protocol();
        let staged = {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            if !session.phase().is_binding() || session.bound_once {
                return;
            }
            if !session.kind.is_polling() && fall_to_polling {
                session_debug!(session, "streaming stayed silent, sensing down to polling");
                session.kind = session.kind.polling_variant();
                session.sensed_polling = true;
                let next = match session.phase() {
                    SessionPhase::FirstBinding => SessionPhase::FirstPause,
                    _ => SessionPhase::Pause,
                };
                session.sm.transition(next);
                if !session.kind.is_ws() {
                    session.conn = None;
                }
                timers.schedule(
                    TaskScope::Session {
                        object_id: session.object_id,
                        phase: session.sm.count(),
                    },
                    TaskKind::Bind,
                    Duration::ZERO,
                );
                return;
            }
            (session.kind.is_ws(), session.handler_phase)
        };
        let (is_ws, handler_phase) = staged;
        if is_ws && switch_protocol {
            self.stream_sense_switch(handler_phase, "streamsense.timeout", timers)
                .await;
        } else {
            self.session_failed(timers, "streamsense.timeout");
        }
    }

    fn on_keepalive_check(&mut self, timers: &mut Timers) {
        let stalled_timeout = self.options.stalled_timeout;
        let reconnect_timeout = self.options.reconnect_timeout;
        let stalled = {
            let Some(session) = self.current.as_mut() else {
                return;
            };
            if session.phase() != SessionPhase::Receiving {
                return;
            }
            let threshold = Self::effective_keepalive(session) + stalled_timeout;
            let silent = session.last_rx.elapsed();
            if silent >= threshold {
                session_warn!(session, "no data for {silent:?}, stalled");
                session.sm.transition(SessionPhase::Stalled);
                timers.schedule(
                    TaskScope::Session {
                        object_id: session.object_id,
                        phase: session.sm.count(),
                    },
                    TaskKind::ReconnectTimeout,
                    reconnect_timeout,
                );
                true
            } else {
                timers.schedule(
                    TaskScope::Session {
                        object_id: session.object_id,
                        phase: session.sm.count(),
                    },
                    TaskKind::KeepaliveCheck,
                    threshold - silent,
                );
                false
            }
        };
        if stalled {
            self.set_status(ClientStatus::Stalled);
        }
    }

    fn on_reconnect_timeout(&mut self) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if session.phase() != SessionPhase::Stalled {
            return;
        }
        session_warn!(session, "still no data, dropping the session");
        let object_id = session.object_id;
        session.shut_transports();
        self.queue_transport_broken(object_id, "stalled");
    }

    async fn on_reverse_heartbeat(&mut self, timers: &mut Timers) {
        let interval = self.options.reverse_heartbeat_interval;
        if interval.is_zero() {
            return;
        }
        let Some(session_id) = self.receiving_session_id() else {
            return;
        };
        let req_id = self.req_ids.next();
        let request = Request::Control(ControlRequest {
            session: session_id,
            req_id,
            op: ControlOp::Heartbeat,
        });
        self.send_on_session(request, timers).await;
        if let Some(session) = self
            .current
            .as_ref()
            .filter(|s| s.phase() == SessionPhase::Receiving)
        {
            timers.schedule(
                TaskScope::Session {
                    object_id: session.object_id,
                    phase: session.sm.count(),
                },
                TaskKind::ReverseHeartbeat,
                interval,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdicts() {
        assert_eq!(classify_code(4), ServerVerdict::Retry);
        assert_eq!(classify_code(5), ServerVerdict::Retry);
        assert_eq!(classify_code(20), ServerVerdict::SyncError);
        assert_eq!(classify_code(41), ServerVerdict::SyncError);
        assert_eq!(classify_code(1), ServerVerdict::Fatal);
        assert_eq!(classify_code(8), ServerVerdict::Fatal);
        // Unknown codes never retry silently.
        assert_eq!(classify_code(9999), ServerVerdict::Fatal);
    }

    #[test]
    fn control_link_resolution() {
        assert_eq!(
            resolve_control_link("ws://push.example.com:8080", "control.example.com"),
            "ws://control.example.com:8080/"
        );
        assert_eq!(
            resolve_control_link("https://push.example.com", "edge7.example.com:8443"),
            "https://edge7.example.com:8443/"
        );
        assert_eq!(
            resolve_control_link("ws://push.example.com", "wss://other.example.com/x"),
            "wss://other.example.com/x"
        );
    }
}
