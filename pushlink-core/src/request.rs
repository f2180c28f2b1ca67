//! Typed client requests and their line encoding.
//!
//! Every request is a verb plus `name=value` parameters joined by `&`, with
//! values percent-escaped. Over WebSocket a request travels as one text
//! frame, `<verb>\r\n<params>`; over HTTP the verb selects the URL path and
//! the parameters form the POST body. The parser half exists for the
//! round-trip guarantee and for in-process test servers.

use std::fmt;
use std::str::FromStr;

use crate::escape::{escape, unescape};
use crate::ProtocolError;

/// Subscription mode, as sent in `LS_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    Merge,
    Distinct,
    Raw,
    Command,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriptionMode::Merge => "MERGE",
            SubscriptionMode::Distinct => "DISTINCT",
            SubscriptionMode::Raw => "RAW",
            SubscriptionMode::Command => "COMMAND",
        })
    }
}

impl FromStr for SubscriptionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "MERGE" => Ok(SubscriptionMode::Merge),
            "DISTINCT" => Ok(SubscriptionMode::Distinct),
            "RAW" => Ok(SubscriptionMode::Raw),
            "COMMAND" => Ok(SubscriptionMode::Command),
            _ => Err(()),
        }
    }
}

/// Requested update frequency for a subscription, `LS_requested_max_frequency`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxFrequency {
    Unlimited,
    /// Updates per second.
    Limited(f64),
}

impl fmt::Display for MaxFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxFrequency::Unlimited => f.write_str("unlimited"),
            MaxFrequency::Limited(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for MaxFrequency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s == "unlimited" {
            Ok(MaxFrequency::Unlimited)
        } else {
            s.parse().map(MaxFrequency::Limited).map_err(|_| ())
        }
    }
}

/// Requested server-side buffer size for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Unlimited,
    Limited(u32),
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSize::Unlimited => f.write_str("unlimited"),
            BufferSize::Limited(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for BufferSize {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if s == "unlimited" {
            Ok(BufferSize::Unlimited)
        } else {
            s.parse().map(BufferSize::Limited).map_err(|_| ())
        }
    }
}

/// Snapshot request for a subscription, `LS_snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    No,
    Yes,
    /// DISTINCT mode only: at most this many snapshot events.
    Length(u32),
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Snapshot::No => f.write_str("false"),
            Snapshot::Yes => f.write_str("true"),
            Snapshot::Length(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Snapshot {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "false" => Ok(Snapshot::No),
            "true" => Ok(Snapshot::Yes),
            n => n.parse().map(Snapshot::Length).map_err(|_| ()),
        }
    }
}

/// Opens a new session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateSessionRequest {
    pub cid: String,
    pub adapter_set: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub polling: bool,
    pub keepalive_millis: Option<u64>,
    pub idle_millis: Option<u64>,
    pub polling_millis: Option<u64>,
    pub requested_max_bandwidth: Option<f64>,
    /// Session id of the session this one replaces, for server-side cleanup.
    pub old_session: Option<String>,
    pub cause: Option<String>,
}

/// Turns a created session into an active streaming or polling channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BindSessionRequest {
    pub session: String,
    pub polling: bool,
    pub keepalive_millis: Option<u64>,
    pub idle_millis: Option<u64>,
    pub polling_millis: Option<u64>,
    pub cause: Option<String>,
}

/// Subscription and session-tuning operations, `LS_op`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOp {
    Add {
        sub_id: u32,
        mode: SubscriptionMode,
        group: String,
        schema: String,
        data_adapter: Option<String>,
        snapshot: Snapshot,
        requested_max_frequency: Option<MaxFrequency>,
        requested_buffer_size: Option<BufferSize>,
    },
    Delete {
        sub_id: u32,
    },
    Reconf {
        sub_id: u32,
        requested_max_frequency: MaxFrequency,
    },
    Constrain {
        /// `None` lifts the bandwidth constraint.
        requested_max_bandwidth: Option<f64>,
    },
    Heartbeat,
}

impl ControlOp {
    fn name(&self) -> &'static str {
        match self {
            ControlOp::Add { .. } => "add",
            ControlOp::Delete { .. } => "delete",
            ControlOp::Reconf { .. } => "reconf",
            ControlOp::Constrain { .. } => "constrain",
            ControlOp::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub session: String,
    pub req_id: u32,
    pub op: ControlOp,
}

/// A sequenced or unordered application message.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgRequest {
    pub session: String,
    pub sequence: String,
    /// `None` for the fire-and-forget unordered path.
    pub prog: Option<u64>,
    pub message: String,
    pub max_wait_millis: Option<u64>,
    /// Whether the server must report the outcome (MSGDONE/MSGFAIL).
    pub ack: bool,
}

/// Resumes an interrupted session from the last received progressive.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverRequest {
    pub session: String,
    pub recovery_from: u64,
    pub cause: Option<String>,
}

/// Tears a session down server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct DestroyRequest {
    pub session: String,
    pub cause: Option<String>,
}

/// Any request the client can send.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateSession(CreateSessionRequest),
    BindSession(BindSessionRequest),
    Control(ControlRequest),
    Msg(MsgRequest),
    Recover(RecoverRequest),
    Destroy(DestroyRequest),
}

struct Params(String);

impl Params {
    fn new() -> Params {
        Params(String::new())
    }

    fn push(&mut self, name: &str, value: impl fmt::Display) {
        if !self.0.is_empty() {
            self.0.push('&');
        }
        self.0.push_str(name);
        self.0.push('=');
        self.0.push_str(&escape(&value.to_string()));
    }

    fn push_opt(&mut self, name: &str, value: Option<impl fmt::Display>) {
        if let Some(v) = value {
            self.push(name, v);
        }
    }
}

impl Request {
    /// The request verb: the WS frame header / HTTP path component.
    pub fn verb(&self) -> &'static str {
        match self {
            Request::CreateSession(_) => "create_session",
            Request::BindSession(_) => "bind_session",
            Request::Control(_) => "control",
            Request::Msg(_) => "msg",
            Request::Recover(_) => "recover",
            Request::Destroy(_) => "destroy",
        }
    }

    /// The `name=value&…` parameter string.
    pub fn encode_params(&self) -> String {
        let mut p = Params::new();
        match self {
            Request::CreateSession(r) => {
                p.push("LS_cid", &r.cid);
                p.push_opt("LS_adapter_set", r.adapter_set.as_ref());
                p.push_opt("LS_user", r.user.as_ref());
                p.push_opt("LS_password", r.password.as_ref());
                if r.polling {
                    p.push("LS_polling", "true");
                }
                p.push_opt("LS_keepalive_millis", r.keepalive_millis);
                p.push_opt("LS_idle_millis", r.idle_millis);
                p.push_opt("LS_polling_millis", r.polling_millis);
                p.push_opt("LS_requested_max_bandwidth", r.requested_max_bandwidth);
                p.push_opt("LS_old_session", r.old_session.as_ref());
                p.push_opt("LS_cause", r.cause.as_ref());
            }
            Request::BindSession(r) => {
                p.push("LS_session", &r.session);
                if r.polling {
                    p.push("LS_polling", "true");
                }
                p.push_opt("LS_keepalive_millis", r.keepalive_millis);
                p.push_opt("LS_idle_millis", r.idle_millis);
                p.push_opt("LS_polling_millis", r.polling_millis);
                p.push_opt("LS_cause", r.cause.as_ref());
            }
            Request::Control(r) => {
                p.push("LS_session", &r.session);
                p.push("LS_reqId", r.req_id);
                p.push("LS_op", r.op.name());
                match &r.op {
                    ControlOp::Add {
                        sub_id,
                        mode,
                        group,
                        schema,
                        data_adapter,
                        snapshot,
                        requested_max_frequency,
                        requested_buffer_size,
                    } => {
                        p.push("LS_subId", sub_id);
                        p.push("LS_mode", mode);
                        p.push("LS_group", group);
                        p.push("LS_schema", schema);
                        p.push_opt("LS_data_adapter", data_adapter.as_ref());
                        p.push("LS_snapshot", snapshot);
                        p.push_opt("LS_requested_max_frequency", *requested_max_frequency);
                        p.push_opt("LS_requested_buffer_size", *requested_buffer_size);
                    }
                    ControlOp::Delete { sub_id } => p.push("LS_subId", sub_id),
                    ControlOp::Reconf {
                        sub_id,
                        requested_max_frequency,
                    } => {
                        p.push("LS_subId", sub_id);
                        p.push("LS_requested_max_frequency", requested_max_frequency);
                    }
                    ControlOp::Constrain {
                        requested_max_bandwidth,
                    } => match requested_max_bandwidth {
                        Some(bw) => p.push("LS_requested_max_bandwidth", bw),
                        None => p.push("LS_requested_max_bandwidth", "unlimited"),
                    },
                    ControlOp::Heartbeat => {}
                }
            }
            Request::Msg(r) => {
                p.push("LS_session", &r.session);
                p.push("LS_sequence", &r.sequence);
                p.push_opt("LS_msg_prog", r.prog);
                p.push("LS_message", &r.message);
                p.push_opt("LS_max_wait", r.max_wait_millis);
                if r.ack {
                    p.push("LS_ack", "true");
                }
            }
            Request::Recover(r) => {
                p.push("LS_session", &r.session);
                p.push("LS_recovery_from", r.recovery_from);
                p.push_opt("LS_cause", r.cause.as_ref());
            }
            Request::Destroy(r) => {
                p.push("LS_session", &r.session);
                p.push_opt("LS_cause", r.cause.as_ref());
            }
        }
        p.0
    }

    /// The single-frame WebSocket form.
    pub fn ws_frame(&self) -> String {
        format!("{}\r\n{}", self.verb(), self.encode_params())
    }

    /// Parse a `<verb>\r\n<params>` frame.
    pub fn parse_frame(frame: &str) -> Result<Request, ProtocolError> {
        let (verb, params) = frame
            .split_once("\r\n")
            .ok_or_else(|| ProtocolError::malformed("request", "missing frame header", frame))?;
        Request::parse(verb, params)
    }

    /// Parse a request from its verb and parameter string.
    pub fn parse(verb: &str, params: &str) -> Result<Request, ProtocolError> {
        let p = ParamList::parse(verb, params)?;
        match verb {
            "create_session" => Ok(Request::CreateSession(CreateSessionRequest {
                cid: p.req("LS_cid")?.to_string(),
                adapter_set: p.get("LS_adapter_set").map(str::to_string),
                user: p.get("LS_user").map(str::to_string),
                password: p.get("LS_password").map(str::to_string),
                polling: p.flag("LS_polling"),
                keepalive_millis: p.num("LS_keepalive_millis")?,
                idle_millis: p.num("LS_idle_millis")?,
                polling_millis: p.num("LS_polling_millis")?,
                requested_max_bandwidth: p.float("LS_requested_max_bandwidth")?,
                old_session: p.get("LS_old_session").map(str::to_string),
                cause: p.get("LS_cause").map(str::to_string),
            })),
            "bind_session" => Ok(Request::BindSession(BindSessionRequest {
                session: p.req("LS_session")?.to_string(),
                polling: p.flag("LS_polling"),
                keepalive_millis: p.num("LS_keepalive_millis")?,
                idle_millis: p.num("LS_idle_millis")?,
                polling_millis: p.num("LS_polling_millis")?,
                cause: p.get("LS_cause").map(str::to_string),
            })),
            "control" => {
                let op = match p.req("LS_op")? {
                    "add" => ControlOp::Add {
                        sub_id: p.req_num("LS_subId")?,
                        mode: p
                            .req("LS_mode")?
                            .parse()
                            .map_err(|_| p.bad("bad LS_mode"))?,
                        group: p.req("LS_group")?.to_string(),
                        schema: p.req("LS_schema")?.to_string(),
                        data_adapter: p.get("LS_data_adapter").map(str::to_string),
                        snapshot: p
                            .get("LS_snapshot")
                            .map(|s| s.parse().map_err(|_| p.bad("bad LS_snapshot")))
                            .transpose()?
                            .unwrap_or(Snapshot::No),
                        requested_max_frequency: p
                            .get("LS_requested_max_frequency")
                            .map(|s| s.parse().map_err(|_| p.bad("bad frequency")))
                            .transpose()?,
                        requested_buffer_size: p
                            .get("LS_requested_buffer_size")
                            .map(|s| s.parse().map_err(|_| p.bad("bad buffer size")))
                            .transpose()?,
                    },
                    "delete" => ControlOp::Delete {
                        sub_id: p.req_num("LS_subId")?,
                    },
                    "reconf" => ControlOp::Reconf {
                        sub_id: p.req_num("LS_subId")?,
                        requested_max_frequency: p
                            .req("LS_requested_max_frequency")?
                            .parse()
                            .map_err(|_| p.bad("bad frequency"))?,
                    },
                    "constrain" => ControlOp::Constrain {
                        requested_max_bandwidth: match p.req("LS_requested_max_bandwidth")? {
                            "unlimited" => None,
                            v => Some(v.parse().map_err(|_| p.bad("bad bandwidth"))?),
                        },
                    },
                    "heartbeat" => ControlOp::Heartbeat,
                    _ => return Err(p.bad("unknown LS_op")),
                };
                Ok(Request::Control(ControlRequest {
                    session: p.req("LS_session")?.to_string(),
                    req_id: p.req_num("LS_reqId")?,
                    op,
                }))
            }
            "msg" => Ok(Request::Msg(MsgRequest {
                session: p.req("LS_session")?.to_string(),
                sequence: p.req("LS_sequence")?.to_string(),
                prog: p.num("LS_msg_prog")?,
                message: p.req("LS_message")?.to_string(),
                max_wait_millis: p.num("LS_max_wait")?,
                ack: p.flag("LS_ack"),
            })),
            "recover" => Ok(Request::Recover(RecoverRequest {
                session: p.req("LS_session")?.to_string(),
                recovery_from: p.req_num("LS_recovery_from")?,
                cause: p.get("LS_cause").map(str::to_string),
            })),
            "destroy" => Ok(Request::Destroy(DestroyRequest {
                session: p.req("LS_session")?.to_string(),
                cause: p.get("LS_cause").map(str::to_string),
            })),
            _ => Err(ProtocolError::UnknownDirective(verb.to_string())),
        }
    }
}

struct ParamList<'a> {
    verb: &'static str,
    line: &'a str,
    params: Vec<(&'a str, String)>,
}

impl<'a> ParamList<'a> {
    fn parse(verb: &str, params: &'a str) -> Result<ParamList<'a>, ProtocolError> {
        // Borrow a 'static name for error reporting; the verb set is closed.
        let verb = match verb {
            "create_session" => "create_session",
            "bind_session" => "bind_session",
            "control" => "control",
            "msg" => "msg",
            "recover" => "recover",
            "destroy" => "destroy",
            _ => return Err(ProtocolError::UnknownDirective(verb.to_string())),
        };
        let mut list = Vec::new();
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or(ProtocolError::Malformed {
                directive: verb,
                reason: "parameter without '='",
                line: params.to_string(),
            })?;
            list.push((name, unescape(value)?));
        }
        Ok(ParamList {
            verb,
            line: params,
            params: list,
        })
    }

    fn bad(&self, reason: &'static str) -> ProtocolError {
        ProtocolError::malformed(self.verb, reason, self.line)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    fn req(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.get(name).ok_or_else(|| self.bad("missing parameter"))
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("true")
    }

    fn num<T: FromStr>(&self, name: &str) -> Result<Option<T>, ProtocolError> {
        self.get(name)
            .map(|v| v.parse().map_err(|_| self.bad("bad number")))
            .transpose()
    }

    fn req_num<T: FromStr>(&self, name: &'static str) -> Result<T, ProtocolError> {
        self.req(name)?
            .parse()
            .map_err(|_| self.bad("bad number"))
    }

    fn float(&self, name: &str) -> Result<Option<f64>, ProtocolError> {
        self.num(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(req: Request) {
        let frame = req.ws_frame();
        let parsed = Request::parse_frame(&frame).unwrap();
        assert_eq!(parsed, req, "frame was {frame:?}");
    }

    #[test]
    fn create_round_trip() {
        round_trip(Request::CreateSession(CreateSessionRequest {
            cid: "pushlink_client".into(),
            adapter_set: Some("DEMO".into()),
            user: Some("user&name".into()),
            password: Some("p=a,s".into()),
            polling: false,
            keepalive_millis: Some(5000),
            idle_millis: None,
            polling_millis: None,
            requested_max_bandwidth: Some(40.0),
            old_session: None,
            cause: Some("api".into()),
        }));
    }

    #[test]
    fn bind_round_trip() {
        round_trip(Request::BindSession(BindSessionRequest {
            session: "S123".into(),
            polling: true,
            keepalive_millis: None,
            idle_millis: Some(19000),
            polling_millis: Some(0),
            cause: None,
        }));
    }

    #[test]
    fn control_round_trip() {
        round_trip(Request::Control(ControlRequest {
            session: "S123".into(),
            req_id: 7,
            op: ControlOp::Add {
                sub_id: 1,
                mode: SubscriptionMode::Command,
                group: "portfolio1".into(),
                schema: "key command qty".into(),
                data_adapter: Some("QUOTES".into()),
                snapshot: Snapshot::Yes,
                requested_max_frequency: Some(MaxFrequency::Limited(0.5)),
                requested_buffer_size: Some(BufferSize::Unlimited),
            },
        }));
        round_trip(Request::Control(ControlRequest {
            session: "S123".into(),
            req_id: 8,
            op: ControlOp::Delete { sub_id: 1 },
        }));
        round_trip(Request::Control(ControlRequest {
            session: "S123".into(),
            req_id: 9,
            op: ControlOp::Constrain {
                requested_max_bandwidth: None,
            },
        }));
        round_trip(Request::Control(ControlRequest {
            session: "S123".into(),
            req_id: 10,
            op: ControlOp::Heartbeat,
        }));
    }

    #[test]
    fn msg_round_trip() {
        round_trip(Request::Msg(MsgRequest {
            session: "S123".into(),
            sequence: "orders".into(),
            prog: Some(3),
            message: "buy|100,MSFT".into(),
            max_wait_millis: Some(2000),
            ack: true,
        }));
        round_trip(Request::Msg(MsgRequest {
            session: "S123".into(),
            sequence: crate::UNORDERED_MESSAGES.into(),
            prog: None,
            message: "ping".into(),
            max_wait_millis: None,
            ack: false,
        }));
    }

    #[test]
    fn recover_and_destroy_round_trip() {
        round_trip(Request::Recover(RecoverRequest {
            session: "S123".into(),
            recovery_from: 41,
            cause: Some("network".into()),
        }));
        round_trip(Request::Destroy(DestroyRequest {
            session: "S123".into(),
            cause: None,
        }));
    }

    #[test]
    fn unknown_verb_rejected() {
        assert!(matches!(
            Request::parse("make_session", "LS_cid=x"),
            Err(ProtocolError::UnknownDirective(_))
        ));
    }
}
