//! Wire protocol for the pushlink client.
//!
//! The push server speaks a line-based text protocol: requests are a verb
//! plus `name=value` parameters joined by `&`, responses are one directive
//! per line with `,`-separated fields. This crate contains the stateless
//! codec shared by every transport: percent escaping, the typed [`Request`]
//! encoder (and parser, used by test harnesses), and the typed
//! [`Notification`] decoder.
//!
//! The codec keeps no state between sessions; anything session-scoped lives
//! in the client crate.

mod error;
mod escape;
mod notify;
mod request;

pub use error::ProtocolError;
pub use escape::{escape, join_update_fields, split_update_fields, unescape, FieldValue};
pub use notify::Notification;
pub use request::{
    BindSessionRequest, BufferSize, ControlOp, ControlRequest, CreateSessionRequest,
    DestroyRequest, MaxFrequency, MsgRequest, RecoverRequest, Request, Snapshot, SubscriptionMode,
};

/// Name of the sequence with no ordering guarantees.
pub const UNORDERED_MESSAGES: &str = "UNORDERED_MESSAGES";
