//! The public client facade.
//!
//! The facade is thin by design: it validates arguments synchronously,
//! mirrors options for the getters, and posts everything else as commands
//! to the session task. Its mutex only ever guards the mirrors, the
//! listener list and the subscription array.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use pushlink_core::UNORDERED_MESSAGES;

use crate::config::{ConnectionDetails, ConnectionOptions, ForcedTransport, MaxBandwidth};
use crate::error::Error;
use crate::listener::{ClientListener, Dispatcher, MessageListener};
use crate::session::event_loop::{Command, OptionChange, SessionThread};
use crate::session::manager::{ServerInfo, SessionCore};
use crate::status::ClientStatus;
use crate::subscription::{Subscription, SubscriptionState};
use crate::transport::http::HttpConnector;

struct Shared {
    options: Mutex<ConnectionOptions>,
    details: ConnectionDetails,
    listeners: Arc<Mutex<Vec<Arc<dyn ClientListener>>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    server_info: Arc<ServerInfo>,
}

/// Builder for a [`PushClient`].
pub struct PushClientBuilder {
    details: ConnectionDetails,
    options: ConnectionOptions,
}

impl PushClientBuilder {
    pub fn new(server_address: impl Into<String>) -> PushClientBuilder {
        PushClientBuilder {
            details: ConnectionDetails {
                server_address: Some(server_address.into()),
                ..Default::default()
            },
            options: ConnectionOptions::default(),
        }
    }

    pub fn adapter_set(mut self, adapter_set: impl Into<String>) -> Self {
        self.details.adapter_set = Some(adapter_set.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.details.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.details.password = Some(password.into());
        self
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and build the client, spawning its session and events
    /// tasks on the current tokio runtime.
    pub fn build(self) -> Result<PushClient, Error> {
        self.details
            .validate()
            .map_err(|e| Error::InvalidArgument(e.join(", ")))?;
        self.options
            .validate()
            .map_err(|e| Error::InvalidArgument(e.join(", ")))?;

        let http_connector = HttpConnector::new()?;
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        let (dispatcher, dispatcher_task) = Dispatcher::new();
        let listeners: Arc<Mutex<Vec<Arc<dyn ClientListener>>>> = Arc::new(Mutex::new(Vec::new()));
        let server_info = Arc::new(ServerInfo::default());

        let core = SessionCore::new(
            self.options.clone(),
            self.details.clone(),
            server_info.clone(),
            status_tx,
            listeners.clone(),
            dispatcher,
            events_tx,
            http_connector,
        );
        let session_task = SessionThread::spawn(core, ingress_rx, events_rx);

        Ok(PushClient {
            shared: Arc::new(Shared {
                options: Mutex::new(self.options),
                details: self.details,
                listeners,
                subscriptions: Mutex::new(Vec::new()),
                server_info,
            }),
            ingress: ingress_tx,
            status_rx,
            session_task,
            dispatcher_task,
        })
    }
}

/// A client of one push server: maintains a recoverable session and
/// multiplexes subscriptions and messages over it.
pub struct PushClient {
    shared: Arc<Shared>,
    ingress: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ClientStatus>,
    session_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl PushClient {
    /// Shorthand for [`PushClientBuilder`] with defaults.
    pub fn new(server_address: impl Into<String>) -> Result<PushClient, Error> {
        PushClientBuilder::new(server_address).build()
    }

    fn post(&self, command: Command) {
        // Failure means the session task is gone; every public call after
        // shutdown is a no-op by contract.
        let _ = self.ingress.send(command);
    }

    /// Open (or keep open) the connection. Idempotent: calling it again
    /// while connecting or connected has no effect.
    pub fn connect(&self) {
        self.post(Command::Connect);
    }

    /// Drop the connection and the server session. Idempotent.
    pub fn disconnect(&self) {
        self.post(Command::Disconnect { done: None });
    }

    /// Like [`PushClient::disconnect`], resolving once the session thread
    /// has fully processed the disconnect.
    pub async fn disconnect_and_wait(&self) {
        let (done, ack) = oneshot::channel();
        self.post(Command::Disconnect { done: Some(done) });
        let _ = ack.await;
    }

    /// Disconnect, stop both internal tasks and wait for them to drain.
    pub async fn shutdown(self) {
        let (done, ack) = oneshot::channel();
        self.post(Command::Shutdown { done });
        let _ = ack.await;
        let _ = self.session_task.await;
        // The events task drains once the session task has dropped its
        // dispatch handle.
        let _ = self.dispatcher_task.await;
    }

    /// The current observable status.
    pub fn status(&self) -> ClientStatus {
        *self.status_rx.borrow()
    }

    /// A watch on status changes; useful to await a target state.
    pub fn status_updates(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        self.shared.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        self.shared
            .listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Register a subscription. Fails synchronously when the subscription
    /// is already active or structurally incomplete.
    pub fn subscribe(&self, subscription: &Subscription) -> Result<(), Error> {
        subscription.group_spec()?;
        subscription.schema_spec()?;
        let mut subs = self.shared.subscriptions.lock();
        // Entries the server has since rejected or dropped are not active
        // anymore and must not block a new subscribe.
        subs.retain(|s| s.state().is_active());
        if subs.iter().any(|s| s.same_handle(subscription)) {
            return Err(Error::InvalidState("subscription is already active"));
        }
        // Activate synchronously so a second subscribe fails right away,
        // before the session task has even seen the first one.
        subscription.set_state(SubscriptionState::Paused);
        subs.push(subscription.clone());
        drop(subs);
        self.post(Command::Subscribe(subscription.clone()));
        Ok(())
    }

    /// Remove a subscription. Fails synchronously when it is not active.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<(), Error> {
        let mut subs = self.shared.subscriptions.lock();
        let Some(idx) = subs.iter().position(|s| s.same_handle(subscription)) else {
            return Err(Error::InvalidState("subscription is not active"));
        };
        subs.remove(idx);
        drop(subs);
        self.post(Command::Unsubscribe(subscription.clone()));
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.state().is_active())
            .cloned()
            .collect()
    }

    /// Fire-and-forget message on the unordered sequence.
    pub fn send_message(&self, text: impl Into<String>) {
        self.post(Command::SendMessage {
            text: text.into(),
            sequence: UNORDERED_MESSAGES.to_string(),
            delay: None,
            listener: None,
            enqueue_while_disconnected: false,
        });
    }

    /// Full-control message send.
    ///
    /// `sequence` defaults to the unordered sequence; sequence names are
    /// restricted to `[A-Za-z0-9_]`.
    pub fn send_message_full(
        &self,
        text: impl Into<String>,
        sequence: Option<&str>,
        delay_timeout: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
    ) -> Result<(), Error> {
        let sequence = sequence.unwrap_or(UNORDERED_MESSAGES);
        if sequence.is_empty()
            || !sequence
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidArgument(format!(
                "invalid sequence name {sequence:?}"
            )));
        }
        self.post(Command::SendMessage {
            text: text.into(),
            sequence: sequence.to_string(),
            delay: delay_timeout,
            listener,
            enqueue_while_disconnected,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// A snapshot of the current options.
    pub fn options(&self) -> ConnectionOptions {
        self.shared.options.lock().clone()
    }

    pub fn server_address(&self) -> Option<String> {
        self.shared.details.server_address.clone()
    }

    /// The id of the current server session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .server_info
            .session_id
            .load_full()
            .map(|s| (*s).clone())
    }

    pub fn server_socket_name(&self) -> Option<String> {
        self.shared
            .server_info
            .server_name
            .load_full()
            .map(|s| (*s).clone())
    }

    pub fn client_ip(&self) -> Option<String> {
        self.shared
            .server_info
            .client_ip
            .load_full()
            .map(|s| (*s).clone())
    }

    fn set_option(&self, apply: impl FnOnce(&mut ConnectionOptions), change: OptionChange) {
        apply(&mut self.shared.options.lock());
        self.post(Command::SetOption(change));
    }

    pub fn set_forced_transport(&self, transport: Option<ForcedTransport>) {
        self.set_option(
            |o| o.forced_transport = transport,
            OptionChange::ForcedTransport(transport),
        );
    }

    pub fn set_early_ws_open(&self, enabled: bool) {
        self.set_option(
            |o| o.early_ws_open = enabled,
            OptionChange::EarlyWsOpen(enabled),
        );
    }

    pub fn set_requested_max_bandwidth(&self, bandwidth: MaxBandwidth) {
        self.set_option(
            |o| o.requested_max_bandwidth = bandwidth,
            OptionChange::MaxBandwidth(bandwidth),
        );
    }

    pub fn set_reverse_heartbeat_interval(&self, interval: Duration) {
        self.set_option(
            |o| o.reverse_heartbeat_interval = interval,
            OptionChange::ReverseHeartbeatInterval(interval),
        );
    }

    pub fn set_retry_delay(&self, delay: Duration) {
        self.set_option(|o| o.retry_delay = delay, OptionChange::RetryDelay(delay));
    }

    pub fn set_first_retry_max_delay(&self, delay: Duration) {
        self.set_option(
            |o| o.first_retry_max_delay = delay,
            OptionChange::FirstRetryMaxDelay(delay),
        );
    }

    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.set_option(
            |o| o.keepalive_interval = interval,
            OptionChange::KeepaliveInterval(interval),
        );
    }

    pub fn set_stalled_timeout(&self, timeout: Duration) {
        self.set_option(
            |o| o.stalled_timeout = timeout,
            OptionChange::StalledTimeout(timeout),
        );
    }

    pub fn set_reconnect_timeout(&self, timeout: Duration) {
        self.set_option(
            |o| o.reconnect_timeout = timeout,
            OptionChange::ReconnectTimeout(timeout),
        );
    }

    pub fn set_polling_interval(&self, interval: Duration) {
        self.set_option(
            |o| o.polling_interval = interval,
            OptionChange::PollingInterval(interval),
        );
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.set_option(
            |o| o.idle_timeout = timeout,
            OptionChange::IdleTimeout(timeout),
        );
    }

    pub fn set_session_recovery_timeout(&self, timeout: Duration) {
        self.set_option(
            |o| o.session_recovery_timeout = timeout,
            OptionChange::SessionRecoveryTimeout(timeout),
        );
    }

    pub fn set_content_length_required(&self, required: bool) {
        self.set_option(
            |o| o.content_length_required = required,
            OptionChange::ContentLengthRequired(required),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushlink_core::SubscriptionMode;

    #[tokio::test]
    async fn build_rejects_bad_address() {
        assert!(PushClient::new("not a url").is_err());
        assert!(PushClient::new("ftp://example.com").is_err());
    }

    #[tokio::test]
    async fn double_subscribe_fails_synchronously() {
        let client = PushClient::new("ws://127.0.0.1:1").unwrap();
        let sub = Subscription::new(SubscriptionMode::Merge);
        sub.set_item_group("items").unwrap();
        sub.set_field_schema("fields").unwrap();
        client.subscribe(&sub).unwrap();
        assert!(matches!(
            client.subscribe(&sub),
            Err(Error::InvalidState(_))
        ));
        client.unsubscribe(&sub).unwrap();
        assert!(client.unsubscribe(&sub).is_err());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn incomplete_subscription_rejected() {
        let client = PushClient::new("ws://127.0.0.1:1").unwrap();
        let sub = Subscription::new(SubscriptionMode::Merge);
        assert!(client.subscribe(&sub).is_err());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn bad_sequence_name_rejected() {
        let client = PushClient::new("ws://127.0.0.1:1").unwrap();
        assert!(client
            .send_message_full("m", Some("bad name"), None, None, false)
            .is_err());
        assert!(client
            .send_message_full("m", Some("seq_1"), None, None, false)
            .is_ok());
        client.shutdown().await;
    }
}
