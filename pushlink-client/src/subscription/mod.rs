//! Client-side subscriptions.
//!
//! A [`Subscription`] is a stable handle: it survives session turnover,
//! while the server-facing subscription id is reassigned by the manager on
//! every new session. All mutation of the protocol-facing state happens on
//! the session thread; the handle itself only takes its internal lock for
//! brief reads and for configuration before activation.

pub(crate) mod manager;

use std::sync::Arc;

use parking_lot::Mutex;

use hashbrown::{HashMap, HashSet};
use pushlink_core::{BufferSize, FieldValue, MaxFrequency, Snapshot, SubscriptionMode};

use crate::error::Error;
use crate::listener::{CommandAction, ItemUpdate, SubscriptionListener};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not registered with the client.
    Inactive,
    /// Registered; subscribe request in flight on the current session.
    Subscribing,
    /// Confirmed by the server on the current session.
    Subscribed,
    /// Registered, but no session currently carries it.
    Paused,
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SubscriptionState::Inactive)
    }
}

pub(crate) struct SubscriptionInner {
    mode: SubscriptionMode,
    item_group: Option<String>,
    item_list: Option<Vec<String>>,
    field_schema: Option<String>,
    field_list: Option<Vec<String>>,
    data_adapter: Option<String>,
    snapshot: Snapshot,
    requested_max_frequency: Option<MaxFrequency>,
    requested_buffer_size: Option<BufferSize>,
    listeners: Vec<Arc<dyn SubscriptionListener>>,
    state: SubscriptionState,
    sub_id: Option<u32>,
    num_items: Option<u32>,
    num_fields: Option<u32>,
    key_pos: Option<u32>,
    cmd_pos: Option<u32>,
    /// Last delivered values per item (MERGE/DISTINCT/RAW).
    item_values: HashMap<u32, Vec<Option<String>>>,
    /// Last delivered values per key within item (COMMAND).
    key_values: HashMap<(u32, String), Vec<Option<String>>>,
    /// Items whose snapshot phase is still open.
    snapshot_open: HashSet<u32>,
}

/// A declaration of interest in one or more server items.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Mutex<SubscriptionInner>>,
}

impl Subscription {
    pub fn new(mode: SubscriptionMode) -> Subscription {
        Subscription {
            inner: Arc::new(Mutex::new(SubscriptionInner {
                mode,
                item_group: None,
                item_list: None,
                field_schema: None,
                field_list: None,
                data_adapter: None,
                snapshot: Snapshot::No,
                requested_max_frequency: None,
                requested_buffer_size: None,
                listeners: Vec::new(),
                state: SubscriptionState::Inactive,
                sub_id: None,
                num_items: None,
                num_fields: None,
                key_pos: None,
                cmd_pos: None,
                item_values: HashMap::new(),
                key_values: HashMap::new(),
                snapshot_open: HashSet::new(),
            })),
        }
    }

    fn configure(
        &self,
        f: impl FnOnce(&mut SubscriptionInner),
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.state.is_active() {
            return Err(Error::InvalidState("subscription is active"));
        }
        f(&mut inner);
        Ok(())
    }

    pub fn set_item_group(&self, group: impl Into<String>) -> Result<(), Error> {
        self.configure(|i| {
            i.item_group = Some(group.into());
            i.item_list = None;
        })
    }

    pub fn set_items(&self, items: &[&str]) -> Result<(), Error> {
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        self.configure(|i| {
            i.item_list = Some(items);
            i.item_group = None;
        })
    }

    pub fn set_field_schema(&self, schema: impl Into<String>) -> Result<(), Error> {
        self.configure(|i| {
            i.field_schema = Some(schema.into());
            i.field_list = None;
        })
    }

    pub fn set_fields(&self, fields: &[&str]) -> Result<(), Error> {
        let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        self.configure(|i| {
            i.field_list = Some(fields);
            i.field_schema = None;
        })
    }

    pub fn set_data_adapter(&self, adapter: impl Into<String>) -> Result<(), Error> {
        self.configure(|i| i.data_adapter = Some(adapter.into()))
    }

    pub fn set_requested_snapshot(&self, snapshot: Snapshot) -> Result<(), Error> {
        self.configure(|i| i.snapshot = snapshot)
    }

    pub fn set_requested_max_frequency(&self, frequency: MaxFrequency) -> Result<(), Error> {
        self.configure(|i| i.requested_max_frequency = Some(frequency))
    }

    pub fn set_requested_buffer_size(&self, size: BufferSize) -> Result<(), Error> {
        self.configure(|i| i.requested_buffer_size = Some(size))
    }

    /// Listeners may be added at any time.
    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.inner.lock().listeners.push(listener);
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.inner.lock().mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    /// The server-assigned id on the current session, if any.
    pub fn sub_id(&self) -> Option<u32> {
        self.inner.lock().sub_id
    }

    pub(crate) fn same_handle(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn SubscriptionListener>> {
        self.inner.lock().listeners.clone()
    }

    /// The item specification as sent on the wire.
    pub(crate) fn group_spec(&self) -> Result<String, Error> {
        let inner = self.inner.lock();
        match (&inner.item_group, &inner.item_list) {
            (Some(g), _) => Ok(g.clone()),
            (None, Some(l)) if !l.is_empty() => Ok(l.join(" ")),
            _ => Err(Error::InvalidArgument(
                "subscription has no items".to_string(),
            )),
        }
    }

    /// The field specification as sent on the wire.
    pub(crate) fn schema_spec(&self) -> Result<String, Error> {
        let inner = self.inner.lock();
        match (&inner.field_schema, &inner.field_list) {
            (Some(s), _) => Ok(s.clone()),
            (None, Some(l)) if !l.is_empty() => Ok(l.join(" ")),
            _ => Err(Error::InvalidArgument(
                "subscription has no fields".to_string(),
            )),
        }
    }

    pub(crate) fn wire_params(
        &self,
    ) -> (
        SubscriptionMode,
        Option<String>,
        Snapshot,
        Option<MaxFrequency>,
        Option<BufferSize>,
    ) {
        let inner = self.inner.lock();
        (
            inner.mode,
            inner.data_adapter.clone(),
            inner.snapshot,
            inner.requested_max_frequency,
            inner.requested_buffer_size,
        )
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn assign_sub_id(&self, sub_id: u32) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.sub_id.is_none(), "sub id already assigned");
        inner.sub_id = Some(sub_id);
        inner.state = SubscriptionState::Subscribing;
    }

    /// Forget everything tied to the session that just ended.
    pub(crate) fn clear_session_state(&self) {
        let mut inner = self.inner.lock();
        inner.sub_id = None;
        inner.num_items = None;
        inner.num_fields = None;
        inner.key_pos = None;
        inner.cmd_pos = None;
        inner.item_values.clear();
        inner.key_values.clear();
        inner.snapshot_open.clear();
        if inner.state.is_active() {
            inner.state = SubscriptionState::Paused;
        }
    }

    pub(crate) fn on_subscribed(&self, num_items: u32, num_fields: u32) {
        let mut inner = self.inner.lock();
        inner.state = SubscriptionState::Subscribed;
        inner.num_items = Some(num_items);
        inner.num_fields = Some(num_fields);
        if !matches!(inner.snapshot, Snapshot::No) {
            inner.snapshot_open = (1..=num_items).collect();
        }
    }

    pub(crate) fn on_subscribed_command(
        &self,
        num_items: u32,
        num_fields: u32,
        key_pos: u32,
        cmd_pos: u32,
    ) {
        self.on_subscribed(num_items, num_fields);
        let mut inner = self.inner.lock();
        inner.key_pos = Some(key_pos);
        inner.cmd_pos = Some(cmd_pos);
    }

    pub(crate) fn on_end_of_snapshot(&self, item: u32) {
        self.inner.lock().snapshot_open.remove(&item);
    }

    pub(crate) fn on_clear_snapshot(&self, item: u32) {
        let mut inner = self.inner.lock();
        inner.item_values.remove(&item);
        inner.key_values.retain(|(i, _), _| *i != item);
    }

    fn item_name(inner: &SubscriptionInner, item: u32) -> Option<String> {
        inner
            .item_list
            .as_ref()
            .and_then(|l| l.get((item as usize).checked_sub(1)?))
            .cloned()
    }

    /// Fold one raw update into the per-item (or per-key) state and build
    /// the listener-facing events. A COMMAND DELETE followed by an ADD for
    /// the same key yields two distinct events, never a merged one.
    pub(crate) fn apply_update(&self, item: u32, fields: &[FieldValue]) -> Vec<ItemUpdate> {
        let mut inner = self.inner.lock();
        if inner.mode == SubscriptionMode::Command {
            return Self::apply_command_update(&mut inner, item, fields);
        }

        let is_snapshot = inner.snapshot_open.contains(&item);
        if inner.mode == SubscriptionMode::Merge && is_snapshot {
            inner.snapshot_open.remove(&item);
        }

        let previous = inner.item_values.get(&item);
        let (values, changed) = resolve_fields(previous.map(|v| v.as_slice()), fields);
        inner.item_values.insert(item, values.clone());
        let update = ItemUpdate {
            item_pos: item,
            item_name: Self::item_name(&inner, item),
            values,
            changed,
            is_snapshot,
            key: None,
            command: None,
        };
        vec![update]
    }

    fn apply_command_update(
        inner: &mut SubscriptionInner,
        item: u32,
        fields: &[FieldValue],
    ) -> Vec<ItemUpdate> {
        let (Some(key_pos), Some(cmd_pos)) = (inner.key_pos, inner.cmd_pos) else {
            log::warn!("command update before SUBCMD, dropped");
            return Vec::new();
        };
        let field_at = |pos: u32| pos.checked_sub(1).and_then(|p| fields.get(p as usize));
        let Some(FieldValue::Value(key)) = field_at(key_pos) else {
            log::warn!("command update without a key, dropped");
            return Vec::new();
        };
        let command = match field_at(cmd_pos) {
            Some(FieldValue::Value(c)) => match c.as_str() {
                "ADD" => CommandAction::Add,
                "UPDATE" => CommandAction::Update,
                "DELETE" => CommandAction::Delete,
                other => {
                    log::warn!("unknown command {other:?}, dropped");
                    return Vec::new();
                }
            },
            _ => CommandAction::Update,
        };
        let key = key.clone();
        let is_snapshot = inner.snapshot_open.contains(&item);
        let slot = (item, key.clone());

        let previous = match command {
            // An ADD is a fresh key by definition; resolving unchanged
            // fields against a deleted predecessor would merge two rows.
            CommandAction::Add => None,
            _ => inner.key_values.get(&slot),
        };
        let (values, changed) = resolve_fields(previous.map(|v| v.as_slice()), fields);
        match command {
            CommandAction::Delete => {
                inner.key_values.remove(&slot);
            }
            _ => {
                inner.key_values.insert(slot, values.clone());
            }
        }
        let update = ItemUpdate {
            item_pos: item,
            item_name: Self::item_name(inner, item),
            values,
            changed,
            is_snapshot,
            key: Some(key),
            command: Some(command),
        };
        vec![update]
    }
}

/// Resolve unchanged markers against the previous value vector and compute
/// per-field change flags.
fn resolve_fields(
    previous: Option<&[Option<String>]>,
    fields: &[FieldValue],
) -> (Vec<Option<String>>, Vec<bool>) {
    let mut values = Vec::with_capacity(fields.len());
    let mut changed = Vec::with_capacity(fields.len());
    for (idx, field) in fields.iter().enumerate() {
        let prev = previous.and_then(|p| p.get(idx)).cloned().flatten();
        match field {
            FieldValue::Unchanged => {
                values.push(prev);
                changed.push(false);
            }
            FieldValue::Null => {
                changed.push(prev.is_some() || previous.is_none());
                values.push(None);
            }
            FieldValue::Empty => {
                changed.push(prev.as_deref() != Some("") || previous.is_none());
                values.push(Some(String::new()));
            }
            FieldValue::Value(v) => {
                changed.push(prev.as_deref() != Some(v.as_str()) || previous.is_none());
                values.push(Some(v.clone()));
            }
        }
    }
    (values, changed)
}
