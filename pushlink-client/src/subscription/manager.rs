//! Reconciliation of client subscriptions with server state.
//!
//! The manager owns the ACTIVE set. Server-facing subscription ids are
//! assigned here, one fresh id per subscription per session, and aliased
//! back to the stable handles. Control requests are tracked by request id
//! until REQOK/REQERR; a request is retried after a network failure but
//! never after a REQERR.

use hashbrown::HashMap;
use log::{debug, warn};

use pushlink_core::{ControlOp, ControlRequest, FieldValue, MaxFrequency, Request};

use crate::error::Error;
use crate::listener::Dispatcher;
use crate::subscription::{Subscription, SubscriptionState};

/// Allocator of per-session request ids.
pub(crate) struct ReqIdGen(u32);

impl ReqIdGen {
    pub fn new() -> ReqIdGen {
        ReqIdGen(0)
    }

    pub fn next(&mut self) -> u32 {
        self.0 += 1;
        self.0
    }
}

enum PendingKind {
    Subscribe,
    Unsubscribe,
}

struct PendingControl {
    kind: PendingKind,
    sub: Subscription,
    request: Request,
}

pub(crate) struct SubscriptionManager {
    subs: Vec<Subscription>,
    by_sub_id: HashMap<u32, Subscription>,
    pending: HashMap<u32, PendingControl>,
    next_sub_id: u32,
}

impl SubscriptionManager {
    pub fn new() -> SubscriptionManager {
        SubscriptionManager {
            subs: Vec::new(),
            by_sub_id: HashMap::new(),
            pending: HashMap::new(),
            next_sub_id: 0,
        }
    }

    pub fn active(&self) -> Vec<Subscription> {
        self.subs.clone()
    }

    /// Add a subscription to the ACTIVE set. Subscribing the same handle
    /// twice is a programmer error.
    pub fn register(&mut self, sub: &Subscription) -> Result<(), Error> {
        if self.subs.iter().any(|s| s.same_handle(sub)) {
            return Err(Error::InvalidState("subscription is already active"));
        }
        sub.group_spec()?;
        sub.schema_spec()?;
        sub.set_state(SubscriptionState::Paused);
        self.subs.push(sub.clone());
        Ok(())
    }

    /// Remove a subscription from the ACTIVE set, returning the delete
    /// request to send if the server knows about it.
    pub fn unregister(
        &mut self,
        sub: &Subscription,
        session: Option<&str>,
        req_ids: &mut ReqIdGen,
        dispatcher: &Dispatcher,
    ) -> Result<Option<Request>, Error> {
        let Some(idx) = self.subs.iter().position(|s| s.same_handle(sub)) else {
            return Err(Error::InvalidState("subscription is not active"));
        };
        self.subs.remove(idx);
        let sub_id = sub.sub_id();
        sub.clear_session_state();
        sub.set_state(SubscriptionState::Inactive);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_unsubscribed());
        }
        let (Some(sub_id), Some(session)) = (sub_id, session) else {
            return Ok(None);
        };
        self.by_sub_id.remove(&sub_id);
        let req_id = req_ids.next();
        let request = Request::Control(ControlRequest {
            session: session.to_string(),
            req_id,
            op: ControlOp::Delete { sub_id },
        });
        self.pending.insert(
            req_id,
            PendingControl {
                kind: PendingKind::Unsubscribe,
                sub: sub.clone(),
                request: request.clone(),
            },
        );
        Ok(Some(request))
    }

    fn build_subscribe(
        &mut self,
        session: &str,
        req_ids: &mut ReqIdGen,
        sub: &Subscription,
    ) -> Result<Request, Error> {
        let group = sub.group_spec()?;
        let schema = sub.schema_spec()?;
        let (mode, data_adapter, snapshot, frequency, buffer) = sub.wire_params();
        self.next_sub_id += 1;
        let sub_id = self.next_sub_id;
        sub.assign_sub_id(sub_id);
        self.by_sub_id.insert(sub_id, sub.clone());
        let req_id = req_ids.next();
        let request = Request::Control(ControlRequest {
            session: session.to_string(),
            req_id,
            op: ControlOp::Add {
                sub_id,
                mode,
                group,
                schema,
                data_adapter,
                snapshot,
                requested_max_frequency: frequency,
                requested_buffer_size: buffer,
            },
        });
        self.pending.insert(
            req_id,
            PendingControl {
                kind: PendingKind::Subscribe,
                sub: sub.clone(),
                request: request.clone(),
            },
        );
        Ok(request)
    }

    /// Subscribe one subscription on a live session.
    pub fn activate(
        &mut self,
        session: &str,
        req_ids: &mut ReqIdGen,
        sub: &Subscription,
    ) -> Result<Request, Error> {
        self.build_subscribe(session, req_ids, sub)
    }

    /// Re-issue every active subscription on a session that just reached
    /// its receiving state, under fresh subscription ids.
    pub fn batch_for_session(
        &mut self,
        session: &str,
        req_ids: &mut ReqIdGen,
    ) -> Vec<Request> {
        let subs = self.subs.clone();
        let mut requests = Vec::with_capacity(subs.len());
        for sub in &subs {
            debug_assert!(sub.sub_id().is_none(), "stale sub id across sessions");
            match self.build_subscribe(session, req_ids, sub) {
                Ok(req) => requests.push(req),
                Err(e) => warn!("skipping unsubscribable subscription: {e}"),
            }
        }
        requests
    }

    /// The session carrying the tracked state ended; forget all
    /// server-assigned ids and outstanding requests.
    pub fn on_session_close(&mut self) {
        self.pending.clear();
        self.by_sub_id.clear();
        for sub in &self.subs {
            sub.clear_session_state();
        }
    }

    /// A control request failed before reaching the server; hand back the
    /// request so the caller can retry it on the same session.
    pub fn take_for_retry(&mut self, req_id: u32) -> Option<Request> {
        self.pending.get(&req_id).map(|p| p.request.clone())
    }

    pub fn on_reqok(&mut self, req_id: u32) {
        if self.pending.remove(&req_id).is_none() {
            debug!("REQOK for unknown request {req_id}, ignored");
        }
    }

    pub fn on_reqerr(&mut self, req_id: u32, code: i32, message: &str, dispatcher: &Dispatcher) {
        let Some(pending) = self.pending.remove(&req_id) else {
            debug!("REQERR for unknown request {req_id}, ignored");
            return;
        };
        match pending.kind {
            PendingKind::Subscribe => {
                let sub = pending.sub;
                if let Some(sub_id) = sub.sub_id() {
                    self.by_sub_id.remove(&sub_id);
                }
                self.subs.retain(|s| !s.same_handle(&sub));
                sub.clear_session_state();
                sub.set_state(SubscriptionState::Inactive);
                let message = message.to_string();
                for listener in sub.listeners() {
                    let message = message.clone();
                    dispatcher
                        .dispatch(move || listener.on_subscription_error(code, &message));
                }
            }
            PendingKind::Unsubscribe => {
                warn!("unsubscribe request {req_id} refused: {code} {message}");
            }
        }
    }

    pub fn on_subok(&mut self, sub_id: u32, num_items: u32, num_fields: u32, dispatcher: &Dispatcher) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            debug!("SUBOK for unknown subscription {sub_id}, ignored");
            return;
        };
        sub.on_subscribed(num_items, num_fields);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_subscribed());
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_subcmd(
        &mut self,
        sub_id: u32,
        num_items: u32,
        num_fields: u32,
        key_pos: u32,
        cmd_pos: u32,
        dispatcher: &Dispatcher,
    ) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            debug!("SUBCMD for unknown subscription {sub_id}, ignored");
            return;
        };
        sub.on_subscribed_command(num_items, num_fields, key_pos, cmd_pos);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_subscribed());
        }
    }

    pub fn on_unsub(&mut self, sub_id: u32, dispatcher: &Dispatcher) {
        // Unknown ids are expected: the subscription may have been removed
        // before its SUBOK arrived.
        let Some(sub) = self.by_sub_id.remove(&sub_id) else {
            debug!("UNSUB for unknown subscription {sub_id}, ignored");
            return;
        };
        self.subs.retain(|s| !s.same_handle(&sub));
        sub.clear_session_state();
        sub.set_state(SubscriptionState::Inactive);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_unsubscribed());
        }
    }

    pub fn on_update(
        &mut self,
        sub_id: u32,
        item: u32,
        fields: &[FieldValue],
        dispatcher: &Dispatcher,
    ) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            debug!("update for unknown subscription {sub_id}, ignored");
            return;
        };
        for update in sub.apply_update(item, fields) {
            for listener in sub.listeners() {
                let update = update.clone();
                dispatcher.dispatch(move || listener.on_item_update(&update));
            }
        }
    }

    pub fn on_end_of_snapshot(&mut self, sub_id: u32, item: u32, dispatcher: &Dispatcher) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            return;
        };
        sub.on_end_of_snapshot(item);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_end_of_snapshot(item));
        }
    }

    pub fn on_clear_snapshot(&mut self, sub_id: u32, item: u32, dispatcher: &Dispatcher) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            return;
        };
        sub.on_clear_snapshot(item);
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_clear_snapshot(item));
        }
    }

    pub fn on_overflow(&mut self, sub_id: u32, item: u32, lost: u64, dispatcher: &Dispatcher) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            return;
        };
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_item_lost_updates(item, lost));
        }
    }

    pub fn on_conf(&mut self, sub_id: u32, frequency: MaxFrequency, dispatcher: &Dispatcher) {
        let Some(sub) = self.by_sub_id.get(&sub_id) else {
            return;
        };
        let real = match frequency {
            MaxFrequency::Unlimited => None,
            MaxFrequency::Limited(f) => Some(f),
        };
        for listener in sub.listeners() {
            dispatcher.dispatch(move || listener.on_real_max_frequency(real));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use pushlink_core::SubscriptionMode;

    use super::*;
    use crate::listener::SubscriptionListener;
    use crate::subscription::Subscription;

    struct CountingListener {
        subscribed: AtomicU32,
        errors: AtomicU32,
    }

    impl SubscriptionListener for CountingListener {
        fn on_subscribed(&self) {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_subscription_error(&self, _code: i32, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_sub() -> Subscription {
        let sub = Subscription::new(SubscriptionMode::Merge);
        sub.set_item_group("items").unwrap();
        sub.set_field_schema("fields").unwrap();
        sub
    }

    fn sub_id_of(req: &Request) -> u32 {
        match req {
            Request::Control(ControlRequest {
                op: ControlOp::Add { sub_id, .. },
                ..
            }) => *sub_id,
            other => panic!("not a subscribe request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_sub_ids_across_sessions() {
        let (dispatcher, _handle) = Dispatcher::new();
        let mut mgr = SubscriptionManager::new();
        let mut ids = ReqIdGen::new();
        let sub = test_sub();
        mgr.register(&sub).unwrap();

        let batch = mgr.batch_for_session("S1", &mut ids);
        assert_eq!(batch.len(), 1);
        assert_eq!(sub_id_of(&batch[0]), 1);
        mgr.on_subok(1, 1, 1, &dispatcher);
        assert_eq!(sub.sub_id(), Some(1));

        // Session dies; the next session re-issues under a fresh id.
        mgr.on_session_close();
        assert_eq!(sub.sub_id(), None);
        let batch = mgr.batch_for_session("S2", &mut ids);
        assert_eq!(batch.len(), 1);
        assert_eq!(sub_id_of(&batch[0]), 2);
    }

    #[tokio::test]
    async fn double_subscribe_rejected() {
        let mut mgr = SubscriptionManager::new();
        let sub = test_sub();
        mgr.register(&sub).unwrap();
        assert!(matches!(
            mgr.register(&sub),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn reqerr_fails_the_subscription() {
        let (dispatcher, _handle) = Dispatcher::new();
        let mut mgr = SubscriptionManager::new();
        let mut ids = ReqIdGen::new();
        let listener = Arc::new(CountingListener {
            subscribed: AtomicU32::new(0),
            errors: AtomicU32::new(0),
        });
        let sub = test_sub();
        sub.add_listener(listener.clone());
        mgr.register(&sub).unwrap();
        let batch = mgr.batch_for_session("S1", &mut ids);
        let req_id = match &batch[0] {
            Request::Control(c) => c.req_id,
            _ => unreachable!(),
        };

        // A REQERR must never be followed by a client-side resend.
        assert!(mgr.take_for_retry(req_id).is_some());
        mgr.on_reqerr(req_id, 17, "bad group", &dispatcher);
        assert!(mgr.take_for_retry(req_id).is_none());
        assert!(mgr.active().is_empty());

        tokio::task::yield_now().await;
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_ids_ignored() {
        let (dispatcher, _handle) = Dispatcher::new();
        let mut mgr = SubscriptionManager::new();
        mgr.on_unsub(99, &dispatcher);
        mgr.on_subok(99, 1, 1, &dispatcher);
        mgr.on_update(99, 1, &[], &dispatcher);
        mgr.on_reqok(99);
    }
}
