//! Sequenced application messages.
//!
//! Sequences are independent FIFOs. Within one sequence every message gets
//! a contiguous progressive; the server either reports MSGDONE in order or
//! MSGFAIL for the first undelivered progressive. A failed message is
//! retried until its per-message delay budget runs out, then abandoned with
//! `on_discarded`, releasing the rest of the sequence. The
//! `UNORDERED_MESSAGES` sequence skips ordering entirely and, without a
//! listener, even the acknowledgment bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{debug, warn};

use pushlink_core::{MsgRequest, Request, UNORDERED_MESSAGES};

use crate::listener::{Dispatcher, MessageListener};

/// MSGFAIL codes meaning the server already discarded the message; there
/// is no point retrying.
const DISCARD_CODES: [i32; 2] = [38, 39];

struct OutstandingMessage {
    prog: u64,
    /// Stable identity across sessions; progressives are renumbered when a
    /// fresh server session starts, tokens never change.
    token: u64,
    text: String,
    listener: Option<Arc<dyn MessageListener>>,
    delay: Option<Duration>,
    /// Set when the message is first handed to a transport.
    deadline: Option<Instant>,
    enqueue_while_disconnected: bool,
    sent: bool,
}

#[derive(Default)]
struct SequenceState {
    next_prog: u64,
    window: VecDeque<OutstandingMessage>,
}

impl SequenceState {
    fn take(&mut self, prog: u64) -> Option<OutstandingMessage> {
        let idx = self.window.iter().position(|m| m.prog == prog)?;
        self.window.remove(idx)
    }
}

pub(crate) struct MessageManager {
    sequences: HashMap<String, SequenceState>,
    next_token: u64,
}

impl MessageManager {
    pub fn new() -> MessageManager {
        MessageManager {
            sequences: HashMap::new(),
            next_token: 0,
        }
    }

    fn request_for(session: &str, sequence: &str, msg: &OutstandingMessage) -> Request {
        Request::Msg(MsgRequest {
            session: session.to_string(),
            sequence: sequence.to_string(),
            prog: Some(msg.prog),
            message: msg.text.clone(),
            max_wait_millis: msg.delay.map(|d| d.as_millis() as u64),
            ack: msg.listener.is_some() || sequence != UNORDERED_MESSAGES,
        })
    }

    /// Accept one message from the user.
    ///
    /// `session` is the id of the session currently in its receiving state,
    /// if any. Returns the requests to put on the wire now, plus the
    /// `(token, delay)` deadline to arm when the message carries a delay
    /// budget.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        text: String,
        sequence: String,
        delay: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
        session: Option<&str>,
        dispatcher: &Dispatcher,
    ) -> (Vec<Request>, Option<(u64, Duration)>) {
        // Fire-and-forget fast path: no progressive, no bookkeeping.
        if sequence == UNORDERED_MESSAGES && listener.is_none() {
            let Some(session) = session else {
                if !enqueue_while_disconnected {
                    return (Vec::new(), None);
                }
                // Listener-less but buffered: tracked like an ordered
                // message so it survives until a session exists.
                return self.enqueue(text, sequence, delay, None, true, None, dispatcher);
            };
            let request = Request::Msg(MsgRequest {
                session: session.to_string(),
                sequence,
                prog: None,
                message: text,
                max_wait_millis: delay.map(|d| d.as_millis() as u64),
                ack: false,
            });
            return (vec![request], None);
        }
        self.enqueue(
            text,
            sequence,
            delay,
            listener,
            enqueue_while_disconnected,
            session,
            dispatcher,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &mut self,
        text: String,
        sequence: String,
        delay: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        enqueue_while_disconnected: bool,
        session: Option<&str>,
        dispatcher: &Dispatcher,
    ) -> (Vec<Request>, Option<(u64, Duration)>) {
        if session.is_none() && !enqueue_while_disconnected {
            if let Some(listener) = listener {
                let text = text.clone();
                dispatcher.dispatch(move || listener.on_abort(&text, false));
            }
            return (Vec::new(), None);
        }

        self.next_token += 1;
        let token = self.next_token;
        let seq = self.sequences.entry(sequence.clone()).or_default();
        seq.next_prog += 1;
        let mut msg = OutstandingMessage {
            prog: seq.next_prog,
            token,
            text,
            listener,
            delay,
            deadline: None,
            enqueue_while_disconnected,
            sent: false,
        };

        let mut requests = Vec::new();
        let mut deadline = None;
        if let Some(session) = session {
            msg.sent = true;
            if let Some(d) = msg.delay {
                msg.deadline = Some(Instant::now() + d);
                deadline = Some((token, d));
            }
            requests.push(Self::request_for(session, &sequence, &msg));
        }
        seq.window.push_back(msg);
        (requests, deadline)
    }

    /// Flush everything pending onto a session that just reached its
    /// receiving state. Messages already sent on a dead session are sent
    /// again under their current progressives.
    pub fn flush(&mut self, session: &str) -> (Vec<Request>, Vec<(u64, Duration)>) {
        let mut requests = Vec::new();
        let mut deadlines = Vec::new();
        for (name, seq) in self.sequences.iter_mut() {
            for msg in seq.window.iter_mut() {
                if !msg.sent {
                    msg.sent = true;
                    if let Some(d) = msg.delay {
                        msg.deadline = Some(Instant::now() + d);
                        deadlines.push((msg.token, d));
                    }
                }
                requests.push(Self::request_for(session, name, msg));
            }
        }
        (requests, deadlines)
    }

    /// A fresh server session starts every sequence over: compact the
    /// surviving progressives back to a contiguous run from one.
    pub fn renumber_sequences(&mut self) {
        for seq in self.sequences.values_mut() {
            let mut prog = 0;
            for msg in seq.window.iter_mut() {
                prog += 1;
                msg.prog = prog;
                msg.sent = false;
                msg.deadline = None;
            }
            seq.next_prog = prog;
        }
    }

    pub fn on_msgdone(&mut self, sequence: &str, prog: u64, dispatcher: &Dispatcher) {
        let Some(seq) = self.sequences.get_mut(sequence) else {
            debug!("MSGDONE for unknown sequence {sequence:?}, ignored");
            return;
        };
        let Some(msg) = seq.take(prog) else {
            debug!("MSGDONE for unknown progressive {sequence:?}:{prog}, ignored");
            return;
        };
        if let Some(listener) = msg.listener {
            dispatcher.dispatch(move || listener.on_processed(&msg.text));
        }
    }

    /// Handle a MSGFAIL, returning the requests to retry, if any.
    pub fn on_msgfail(
        &mut self,
        session: &str,
        sequence: &str,
        prog: u64,
        code: i32,
        message: &str,
        dispatcher: &Dispatcher,
    ) -> Vec<Request> {
        let Some(seq) = self.sequences.get_mut(sequence) else {
            debug!("MSGFAIL for unknown sequence {sequence:?}, ignored");
            return Vec::new();
        };
        let denied = code < 0;
        let discarded = DISCARD_CODES.contains(&code);
        let budget_spent = seq
            .window
            .iter()
            .find(|m| m.prog == prog)
            .and_then(|m| m.deadline)
            .is_some_and(|d| Instant::now() >= d);

        if denied || discarded || budget_spent {
            let Some(msg) = seq.take(prog) else {
                return Vec::new();
            };
            if let Some(listener) = msg.listener {
                let message = message.to_string();
                if denied {
                    dispatcher.dispatch(move || listener.on_denied(&msg.text, code, &message));
                } else {
                    dispatcher.dispatch(move || listener.on_discarded(&msg.text));
                }
            }
            return Vec::new();
        }

        if seq.window.iter().all(|m| m.prog != prog) {
            debug!("MSGFAIL for unknown progressive {sequence:?}:{prog}, ignored");
            return Vec::new();
        }
        // Retry the failed progressive and everything after it; the server
        // ordering contract restarts from the first undelivered one.
        warn!("message {sequence:?}:{prog} failed ({code} {message}), retrying");
        seq.window
            .iter()
            .filter(|m| m.sent && m.prog >= prog)
            .map(|m| Self::request_for(session, sequence, m))
            .collect()
    }

    /// The per-message delay budget ran out client-side. The token keys the
    /// message; a deadline re-armed in the meantime (requeue, new session)
    /// supersedes this firing.
    pub fn on_deadline(&mut self, token: u64, dispatcher: &Dispatcher) {
        let now = Instant::now();
        for seq in self.sequences.values_mut() {
            let Some(idx) = seq.window.iter().position(|m| m.token == token) else {
                continue;
            };
            if !seq.window[idx].deadline.is_some_and(|d| now >= d) {
                return;
            }
            if let Some(msg) = seq.window.remove(idx) {
                if let Some(listener) = msg.listener {
                    dispatcher.dispatch(move || listener.on_discarded(&msg.text));
                }
            }
            return;
        }
    }

    /// The client is disconnecting; messages not marked for buffering are
    /// aborted.
    pub fn on_disconnect(&mut self, dispatcher: &Dispatcher) {
        for seq in self.sequences.values_mut() {
            seq.window.retain_mut(|msg| {
                if msg.enqueue_while_disconnected {
                    msg.sent = false;
                    msg.deadline = None;
                    return true;
                }
                if let Some(listener) = msg.listener.take() {
                    let text = std::mem::take(&mut msg.text);
                    let sent = msg.sent;
                    dispatcher.dispatch(move || listener.on_abort(&text, sent));
                }
                false
            });
        }
    }

    /// Whether anything is waiting for a session.
    pub fn has_pending(&self) -> bool {
        self.sequences.values().any(|s| !s.window.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        processed: AtomicU32,
        discarded: Mutex<Vec<String>>,
        aborted: AtomicU32,
        denied: AtomicU32,
    }

    impl MessageListener for RecordingListener {
        fn on_processed(&self, _text: &str) {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_discarded(&self, text: &str) {
            self.discarded.lock().unwrap().push(text.to_string());
        }
        fn on_denied(&self, _text: &str, _code: i32, _message: &str) {
            self.denied.fetch_add(1, Ordering::SeqCst);
        }
        fn on_abort(&self, _text: &str, _sent: bool) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn prog_of(req: &Request) -> Option<u64> {
        match req {
            Request::Msg(m) => m.prog,
            _ => None,
        }
    }

    #[tokio::test]
    async fn progressives_are_contiguous_per_sequence() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        for expected in 1..=3u64 {
            let (reqs, _) = mgr.send(
                format!("m{expected}"),
                "s".into(),
                None,
                None,
                false,
                Some("S1"),
                &dispatcher,
            );
            assert_eq!(prog_of(&reqs[0]), Some(expected));
        }
        // An independent sequence numbers from one again.
        let (reqs, _) = mgr.send(
            "other".into(),
            "t".into(),
            None,
            None,
            false,
            Some("S1"),
            &dispatcher,
        );
        assert_eq!(prog_of(&reqs[0]), Some(1));
    }

    #[tokio::test]
    async fn unordered_without_listener_is_fire_and_forget() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        let (reqs, _) = mgr.send(
            "ping".into(),
            UNORDERED_MESSAGES.into(),
            None,
            None,
            false,
            Some("S1"),
            &dispatcher,
        );
        assert_eq!(prog_of(&reqs[0]), None);
        assert!(!mgr.has_pending());
    }

    #[tokio::test]
    async fn server_timeout_discards_without_blocking_the_rest() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        let listener = Arc::new(RecordingListener::default());
        for text in ["m1", "m2", "m3"] {
            mgr.send(
                text.into(),
                "s".into(),
                None,
                Some(listener.clone()),
                false,
                Some("S1"),
                &dispatcher,
            );
        }
        mgr.on_msgdone("s", 1, &dispatcher);
        // Server gave up on m2: timeout-exceeded code.
        let retries = mgr.on_msgfail("S1", "s", 2, 38, "timeout exceeded", &dispatcher);
        assert!(retries.is_empty());
        mgr.on_msgdone("s", 3, &dispatcher);

        tokio::task::yield_now().await;
        assert_eq!(listener.processed.load(Ordering::SeqCst), 2);
        assert_eq!(*listener.discarded.lock().unwrap(), vec!["m2".to_string()]);
        assert!(!mgr.has_pending());
    }

    #[tokio::test]
    async fn retryable_msgfail_resends_suffix() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        for text in ["m1", "m2", "m3"] {
            mgr.send(
                text.into(),
                "s".into(),
                None,
                None,
                false,
                Some("S1"),
                &dispatcher,
            );
        }
        mgr.on_msgdone("s", 1, &dispatcher);
        let retries = mgr.on_msgfail("S1", "s", 2, 10, "adapter busy", &dispatcher);
        assert_eq!(
            retries.iter().map(prog_of).collect::<Vec<_>>(),
            vec![Some(2), Some(3)]
        );
    }

    #[tokio::test]
    async fn disconnected_without_flag_aborts() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        let listener = Arc::new(RecordingListener::default());
        let (reqs, _) = mgr.send(
            "m1".into(),
            "s".into(),
            None,
            Some(listener.clone()),
            false,
            None,
            &dispatcher,
        );
        assert!(reqs.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(listener.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_while_disconnected_flushes_later() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        let (reqs, _) = mgr.send(
            "m1".into(),
            "s".into(),
            None,
            None,
            true,
            None,
            &dispatcher,
        );
        assert!(reqs.is_empty());
        assert!(mgr.has_pending());
        let (flushed, _) = mgr.flush("S2");
        assert_eq!(flushed.len(), 1);
        assert_eq!(prog_of(&flushed[0]), Some(1));
    }

    #[tokio::test]
    async fn renumber_compacts_progressives() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        for text in ["m1", "m2", "m3"] {
            mgr.send(
                text.into(),
                "s".into(),
                None,
                None,
                false,
                Some("S1"),
                &dispatcher,
            );
        }
        mgr.on_msgdone("s", 1, &dispatcher);
        mgr.renumber_sequences();
        let (flushed, _) = mgr.flush("S2");
        assert_eq!(
            flushed.iter().map(prog_of).collect::<Vec<_>>(),
            vec![Some(1), Some(2)]
        );
    }

    #[tokio::test]
    async fn disconnect_aborts_unflagged_keeps_flagged() {
        let (dispatcher, _h) = Dispatcher::new();
        let mut mgr = MessageManager::new();
        let listener = Arc::new(RecordingListener::default());
        mgr.send(
            "keep".into(),
            "s".into(),
            None,
            None,
            true,
            Some("S1"),
            &dispatcher,
        );
        mgr.send(
            "drop".into(),
            "s".into(),
            None,
            Some(listener.clone()),
            false,
            Some("S1"),
            &dispatcher,
        );
        mgr.on_disconnect(&dispatcher);
        tokio::task::yield_now().await;
        assert_eq!(listener.aborted.load(Ordering::SeqCst), 1);
        let (flushed, _) = mgr.flush("S2");
        assert_eq!(flushed.len(), 1);
    }
}
