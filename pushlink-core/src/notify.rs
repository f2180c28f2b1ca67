//! Typed server notifications and their line codec.
//!
//! Each inbound line yields exactly one [`Notification`]; an unknown
//! directive is surfaced as [`ProtocolError::UnknownDirective`] and is
//! recoverable by contract. The encoder half keeps the round-trip guarantee
//! honest and feeds the in-process test servers.

use std::fmt;

use crate::escape::{escape, join_update_fields, split_update_fields, unescape, FieldValue};
use crate::request::MaxFrequency;
use crate::ProtocolError;

/// One decoded server notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Session established (create, bind or recover accepted).
    Conok {
        session: String,
        request_limit: u64,
        keepalive_millis: u64,
        /// `None` encodes as `*`: keep using the configured address.
        control_link: Option<String>,
    },
    /// Session refused.
    Conerr { code: i32, message: String },
    /// Session terminated by the server.
    End { code: i32, message: String },
    /// End of the current stream/poll cycle; rebind after the given delay.
    Loop { expected_delay_millis: u64 },
    /// Keepalive; no payload.
    Probe,
    /// Server clock checkpoint, seconds since session start.
    Sync { seconds: u64 },
    /// Name of the server socket serving this session.
    Servname { name: String },
    /// The client IP as seen by the server.
    Clientip { ip: String },
    /// Padding; content is ignored.
    Noop { payload: String },
    /// A sequenced message was processed.
    Msgdone { sequence: String, prog: u64 },
    /// A sequenced message failed or was discarded server-side.
    Msgfail {
        sequence: String,
        prog: u64,
        code: i32,
        message: String,
    },
    /// Field values for one item of one subscription.
    Update {
        sub_id: u32,
        item: u32,
        fields: Vec<FieldValue>,
    },
    /// End of snapshot for one item.
    EndOfSnapshot { sub_id: u32, item: u32 },
    /// Snapshot invalidation for one item.
    ClearSnapshot { sub_id: u32, item: u32 },
    /// The server dropped updates for a buffered item.
    Overflow { sub_id: u32, item: u32, lost: u64 },
    /// Server-chosen update frequency for a subscription.
    Conf {
        sub_id: u32,
        max_frequency: MaxFrequency,
    },
    /// Subscription activated.
    Subok {
        sub_id: u32,
        num_items: u32,
        num_fields: u32,
    },
    /// COMMAND-mode subscription activated, with key/command field positions.
    Subcmd {
        sub_id: u32,
        num_items: u32,
        num_fields: u32,
        key_pos: u32,
        cmd_pos: u32,
    },
    /// Subscription deactivated.
    Unsub { sub_id: u32 },
    /// A control request succeeded.
    Reqok { req_id: u32 },
    /// A control request failed.
    Reqerr {
        req_id: u32,
        code: i32,
        message: String,
    },
    /// Asynchronous fatal error on the conversation.
    Error { code: i32, message: String },
    /// Push-notification device registered.
    Mpnreg { device_id: String, adapter: String },
    /// Push-notification subscription activated.
    Mpnok { sub_id: u32, mpn_sub_id: String },
}

fn split_n(line: &str, n: usize) -> Vec<&str> {
    line.splitn(n, ',').collect()
}

fn int<T: std::str::FromStr>(
    directive: &'static str,
    line: &str,
    field: &str,
) -> Result<T, ProtocolError> {
    field
        .parse()
        .map_err(|_| ProtocolError::malformed(directive, "bad number", line))
}

macro_rules! expect_fields {
    ($directive:literal, $line:expr, $parts:expr, $n:literal) => {
        if $parts.len() != $n {
            return Err(ProtocolError::malformed(
                $directive,
                "wrong field count",
                $line,
            ));
        }
    };
}

impl Notification {
    /// Decode one line. The line must not include its terminator.
    pub fn decode(line: &str) -> Result<Notification, ProtocolError> {
        let (directive, rest) = match line.split_once(',') {
            Some((d, r)) => (d, Some(r)),
            None => (line, None),
        };
        match (directive, rest) {
            ("PROBE", None) => Ok(Notification::Probe),
            ("CONOK", Some(rest)) => {
                let f = split_n(rest, 4);
                expect_fields!("CONOK", line, f, 4);
                Ok(Notification::Conok {
                    session: f[0].to_string(),
                    request_limit: int("CONOK", line, f[1])?,
                    keepalive_millis: int("CONOK", line, f[2])?,
                    control_link: match f[3] {
                        "*" => None,
                        link => Some(link.to_string()),
                    },
                })
            }
            ("CONERR", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("CONERR", line, f, 2);
                Ok(Notification::Conerr {
                    code: int("CONERR", line, f[0])?,
                    message: unescape(f[1])?,
                })
            }
            ("END", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("END", line, f, 2);
                Ok(Notification::End {
                    code: int("END", line, f[0])?,
                    message: unescape(f[1])?,
                })
            }
            ("LOOP", Some(rest)) => Ok(Notification::Loop {
                expected_delay_millis: int("LOOP", line, rest)?,
            }),
            ("SYNC", Some(rest)) => Ok(Notification::Sync {
                seconds: int("SYNC", line, rest)?,
            }),
            ("SERVNAME", Some(rest)) => Ok(Notification::Servname {
                name: unescape(rest)?,
            }),
            ("CLIENTIP", Some(rest)) => Ok(Notification::Clientip {
                ip: rest.to_string(),
            }),
            ("NOOP", rest) => Ok(Notification::Noop {
                payload: rest.unwrap_or_default().to_string(),
            }),
            ("MSGDONE", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("MSGDONE", line, f, 2);
                Ok(Notification::Msgdone {
                    sequence: unescape(f[0])?,
                    prog: int("MSGDONE", line, f[1])?,
                })
            }
            ("MSGFAIL", Some(rest)) => {
                let f = split_n(rest, 4);
                expect_fields!("MSGFAIL", line, f, 4);
                Ok(Notification::Msgfail {
                    sequence: unescape(f[0])?,
                    prog: int("MSGFAIL", line, f[1])?,
                    code: int("MSGFAIL", line, f[2])?,
                    message: unescape(f[3])?,
                })
            }
            ("U", Some(rest)) => {
                let f = split_n(rest, 3);
                expect_fields!("U", line, f, 3);
                Ok(Notification::Update {
                    sub_id: int("U", line, f[0])?,
                    item: int("U", line, f[1])?,
                    fields: split_update_fields(f[2])?,
                })
            }
            ("EOS", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("EOS", line, f, 2);
                Ok(Notification::EndOfSnapshot {
                    sub_id: int("EOS", line, f[0])?,
                    item: int("EOS", line, f[1])?,
                })
            }
            ("CS", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("CS", line, f, 2);
                Ok(Notification::ClearSnapshot {
                    sub_id: int("CS", line, f[0])?,
                    item: int("CS", line, f[1])?,
                })
            }
            ("OV", Some(rest)) => {
                let f = split_n(rest, 3);
                expect_fields!("OV", line, f, 3);
                Ok(Notification::Overflow {
                    sub_id: int("OV", line, f[0])?,
                    item: int("OV", line, f[1])?,
                    lost: int("OV", line, f[2])?,
                })
            }
            ("CONF", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("CONF", line, f, 2);
                Ok(Notification::Conf {
                    sub_id: int("CONF", line, f[0])?,
                    max_frequency: f[1]
                        .parse()
                        .map_err(|_| ProtocolError::malformed("CONF", "bad frequency", line))?,
                })
            }
            ("SUBOK", Some(rest)) => {
                let f = split_n(rest, 3);
                expect_fields!("SUBOK", line, f, 3);
                Ok(Notification::Subok {
                    sub_id: int("SUBOK", line, f[0])?,
                    num_items: int("SUBOK", line, f[1])?,
                    num_fields: int("SUBOK", line, f[2])?,
                })
            }
            ("SUBCMD", Some(rest)) => {
                let f = split_n(rest, 5);
                expect_fields!("SUBCMD", line, f, 5);
                Ok(Notification::Subcmd {
                    sub_id: int("SUBCMD", line, f[0])?,
                    num_items: int("SUBCMD", line, f[1])?,
                    num_fields: int("SUBCMD", line, f[2])?,
                    key_pos: int("SUBCMD", line, f[3])?,
                    cmd_pos: int("SUBCMD", line, f[4])?,
                })
            }
            ("UNSUB", Some(rest)) => Ok(Notification::Unsub {
                sub_id: int("UNSUB", line, rest)?,
            }),
            ("REQOK", Some(rest)) => Ok(Notification::Reqok {
                req_id: int("REQOK", line, rest)?,
            }),
            ("REQERR", Some(rest)) => {
                let f = split_n(rest, 3);
                expect_fields!("REQERR", line, f, 3);
                Ok(Notification::Reqerr {
                    req_id: int("REQERR", line, f[0])?,
                    code: int("REQERR", line, f[1])?,
                    message: unescape(f[2])?,
                })
            }
            ("ERROR", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("ERROR", line, f, 2);
                Ok(Notification::Error {
                    code: int("ERROR", line, f[0])?,
                    message: unescape(f[1])?,
                })
            }
            ("MPNREG", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("MPNREG", line, f, 2);
                Ok(Notification::Mpnreg {
                    device_id: f[0].to_string(),
                    adapter: unescape(f[1])?,
                })
            }
            ("MPNOK", Some(rest)) => {
                let f = split_n(rest, 2);
                expect_fields!("MPNOK", line, f, 2);
                Ok(Notification::Mpnok {
                    sub_id: int("MPNOK", line, f[0])?,
                    mpn_sub_id: f[1].to_string(),
                })
            }
            _ => Err(ProtocolError::UnknownDirective(line.to_string())),
        }
    }

    /// True for the notifications the server stamps with a progressive,
    /// i.e. the ones replayed by recovery.
    pub fn bears_progressive(&self) -> bool {
        matches!(
            self,
            Notification::Update { .. }
                | Notification::EndOfSnapshot { .. }
                | Notification::ClearSnapshot { .. }
                | Notification::Overflow { .. }
                | Notification::Conf { .. }
                | Notification::Subok { .. }
                | Notification::Subcmd { .. }
                | Notification::Unsub { .. }
                | Notification::Msgdone { .. }
                | Notification::Msgfail { .. }
        )
    }
}

impl fmt::Display for Notification {
    /// The canonical line form; `decode(x.to_string()) == x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Conok {
                session,
                request_limit,
                keepalive_millis,
                control_link,
            } => write!(
                f,
                "CONOK,{},{},{},{}",
                session,
                request_limit,
                keepalive_millis,
                control_link.as_deref().unwrap_or("*")
            ),
            Notification::Conerr { code, message } => {
                write!(f, "CONERR,{},{}", code, escape(message))
            }
            Notification::End { code, message } => write!(f, "END,{},{}", code, escape(message)),
            Notification::Loop {
                expected_delay_millis,
            } => write!(f, "LOOP,{}", expected_delay_millis),
            Notification::Probe => f.write_str("PROBE"),
            Notification::Sync { seconds } => write!(f, "SYNC,{}", seconds),
            Notification::Servname { name } => write!(f, "SERVNAME,{}", escape(name)),
            Notification::Clientip { ip } => write!(f, "CLIENTIP,{}", ip),
            Notification::Noop { payload } => write!(f, "NOOP,{}", payload),
            Notification::Msgdone { sequence, prog } => {
                write!(f, "MSGDONE,{},{}", escape(sequence), prog)
            }
            Notification::Msgfail {
                sequence,
                prog,
                code,
                message,
            } => write!(
                f,
                "MSGFAIL,{},{},{},{}",
                escape(sequence),
                prog,
                code,
                escape(message)
            ),
            Notification::Update {
                sub_id,
                item,
                fields,
            } => write!(f, "U,{},{},{}", sub_id, item, join_update_fields(fields)),
            Notification::EndOfSnapshot { sub_id, item } => write!(f, "EOS,{},{}", sub_id, item),
            Notification::ClearSnapshot { sub_id, item } => write!(f, "CS,{},{}", sub_id, item),
            Notification::Overflow { sub_id, item, lost } => {
                write!(f, "OV,{},{},{}", sub_id, item, lost)
            }
            Notification::Conf {
                sub_id,
                max_frequency,
            } => write!(f, "CONF,{},{}", sub_id, max_frequency),
            Notification::Subok {
                sub_id,
                num_items,
                num_fields,
            } => write!(f, "SUBOK,{},{},{}", sub_id, num_items, num_fields),
            Notification::Subcmd {
                sub_id,
                num_items,
                num_fields,
                key_pos,
                cmd_pos,
            } => write!(
                f,
                "SUBCMD,{},{},{},{},{}",
                sub_id, num_items, num_fields, key_pos, cmd_pos
            ),
            Notification::Unsub { sub_id } => write!(f, "UNSUB,{}", sub_id),
            Notification::Reqok { req_id } => write!(f, "REQOK,{}", req_id),
            Notification::Reqerr {
                req_id,
                code,
                message,
            } => write!(f, "REQERR,{},{},{}", req_id, code, escape(message)),
            Notification::Error { code, message } => {
                write!(f, "ERROR,{},{}", code, escape(message))
            }
            Notification::Mpnreg { device_id, adapter } => {
                write!(f, "MPNREG,{},{}", device_id, escape(adapter))
            }
            Notification::Mpnok { sub_id, mpn_sub_id } => {
                write!(f, "MPNOK,{},{}", sub_id, mpn_sub_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_conok() {
        assert_eq!(
            Notification::decode("CONOK,S6e2a,50000,5000,*").unwrap(),
            Notification::Conok {
                session: "S6e2a".into(),
                request_limit: 50000,
                keepalive_millis: 5000,
                control_link: None,
            }
        );
        assert_eq!(
            Notification::decode("CONOK,S1,1000,5000,control.example.com").unwrap(),
            Notification::Conok {
                session: "S1".into(),
                request_limit: 1000,
                keepalive_millis: 5000,
                control_link: Some("control.example.com".into()),
            }
        );
    }

    #[test]
    fn decode_update_markers() {
        let n = Notification::decode("U,3,1,18.9||#|$").unwrap();
        assert_eq!(
            n,
            Notification::Update {
                sub_id: 3,
                item: 1,
                fields: vec![
                    FieldValue::Value("18.9".into()),
                    FieldValue::Unchanged,
                    FieldValue::Null,
                    FieldValue::Empty,
                ],
            }
        );
    }

    #[test]
    fn unknown_directive_is_recoverable() {
        assert!(matches!(
            Notification::decode("WOBBLE,1,2"),
            Err(ProtocolError::UnknownDirective(_))
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let all = vec![
            Notification::Conok {
                session: "Sx".into(),
                request_limit: 50000,
                keepalive_millis: 5000,
                control_link: None,
            },
            Notification::Conerr {
                code: 4,
                message: "recoverable, retry".into(),
            },
            Notification::End {
                code: 31,
                message: "closed by administrator".into(),
            },
            Notification::Loop {
                expected_delay_millis: 0,
            },
            Notification::Probe,
            Notification::Sync { seconds: 3 },
            Notification::Servname {
                name: "push-7".into(),
            },
            Notification::Clientip {
                ip: "192.0.2.10".into(),
            },
            Notification::Msgdone {
                sequence: "orders".into(),
                prog: 2,
            },
            Notification::Msgfail {
                sequence: "orders".into(),
                prog: 3,
                code: 38,
                message: "timeout exceeded".into(),
            },
            Notification::Update {
                sub_id: 1,
                item: 2,
                fields: vec![FieldValue::Value("a|b".into()), FieldValue::Null],
            },
            Notification::EndOfSnapshot { sub_id: 1, item: 2 },
            Notification::ClearSnapshot { sub_id: 1, item: 2 },
            Notification::Overflow {
                sub_id: 1,
                item: 2,
                lost: 9,
            },
            Notification::Conf {
                sub_id: 1,
                max_frequency: MaxFrequency::Unlimited,
            },
            Notification::Subok {
                sub_id: 1,
                num_items: 3,
                num_fields: 4,
            },
            Notification::Subcmd {
                sub_id: 2,
                num_items: 1,
                num_fields: 5,
                key_pos: 1,
                cmd_pos: 2,
            },
            Notification::Unsub { sub_id: 2 },
            Notification::Reqok { req_id: 11 },
            Notification::Reqerr {
                req_id: 12,
                code: 17,
                message: "bad group".into(),
            },
            Notification::Error {
                code: 8,
                message: "license".into(),
            },
            Notification::Mpnreg {
                device_id: "dev1".into(),
                adapter: "APNS".into(),
            },
            Notification::Mpnok {
                sub_id: 4,
                mpn_sub_id: "pn9".into(),
            },
        ];
        for n in all {
            let line = n.to_string();
            assert_eq!(Notification::decode(&line).unwrap(), n, "line {line:?}");
            // encode(decode(line)) == line
            assert_eq!(Notification::decode(&line).unwrap().to_string(), line);
        }
    }
}
