//! Listener traits and the events task.
//!
//! Listener callbacks never run on the session thread: they are queued onto
//! a dedicated events task so user code cannot stall the protocol. Between
//! two listeners on the same object the queue order is preserved.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::status::ClientStatus;

/// Events about the client as a whole.
#[allow(unused_variables)]
pub trait ClientListener: Send + Sync {
    fn on_status_change(&self, status: ClientStatus) {}
    /// A fatal server verdict; the client is disconnected and will not
    /// retry.
    fn on_server_error(&self, code: i32, message: &str) {}
    fn on_property_change(&self, property: &str) {}
}

/// The action carried by a COMMAND-mode update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Add,
    Update,
    Delete,
}

/// One update delivered to a subscription listener, with unchanged fields
/// already resolved against the previous state of the item (or key).
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    /// 1-based position of the item in the group or list.
    pub item_pos: u32,
    /// Item name, when the subscription was made with an explicit list.
    pub item_name: Option<String>,
    /// Field values by 1-based schema position; `None` is null.
    pub values: Vec<Option<String>>,
    /// Which fields changed relative to the previous update.
    pub changed: Vec<bool>,
    pub is_snapshot: bool,
    /// COMMAND mode: the key this update belongs to.
    pub key: Option<String>,
    /// COMMAND mode: the action on that key.
    pub command: Option<CommandAction>,
}

/// Events about one subscription.
#[allow(unused_variables)]
pub trait SubscriptionListener: Send + Sync {
    fn on_subscribed(&self) {}
    fn on_subscription_error(&self, code: i32, message: &str) {}
    fn on_unsubscribed(&self) {}
    fn on_item_update(&self, update: &ItemUpdate) {}
    fn on_end_of_snapshot(&self, item_pos: u32) {}
    fn on_clear_snapshot(&self, item_pos: u32) {}
    fn on_item_lost_updates(&self, item_pos: u32, lost: u64) {}
    /// Frequency granted by the server; `None` is unlimited.
    fn on_real_max_frequency(&self, updates_per_second: Option<f64>) {}
}

/// Outcome events for one sent message.
#[allow(unused_variables)]
pub trait MessageListener: Send + Sync {
    /// The server processed the message.
    fn on_processed(&self, text: &str) {}
    /// The message was abandoned after its delay timeout.
    fn on_discarded(&self, text: &str) {}
    /// The server rejected the message.
    fn on_denied(&self, text: &str, code: i32, message: &str) {}
    /// The message was dropped before reaching the server.
    fn on_abort(&self, text: &str, sent: bool) {}
    fn on_error(&self, text: &str) {}
}

/// Serializes listener callbacks onto one long-lived task.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl Dispatcher {
    pub fn new() -> (Dispatcher, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn FnOnce() + Send>>();
        let handle = tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback();
            }
        });
        (Dispatcher { tx }, handle)
    }

    pub fn dispatch(&self, callback: impl FnOnce() + Send + 'static) {
        // Send only fails at shutdown, when delivery no longer matters.
        let _ = self.tx.send(Box::new(callback));
    }
}
