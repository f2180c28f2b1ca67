//! A client for line-oriented push servers.
//!
//! The client keeps one long-lived, recoverable session with the server
//! over WebSocket or HTTP, picking the transport by trial ("stream-sense":
//! streaming first, then polling, then the other protocol), and multiplexes
//! item subscriptions and sequenced application messages over it. Transport
//! failures are absorbed by rebinding, recovering from the last received
//! progressive, or recreating the session with backoff; none of them
//! surface as errors.
//!
//! All protocol state lives on a single session task; listener callbacks
//! run on a separate events task so user code cannot stall the protocol.
//!
//! ```no_run
//! use pushlink_client::{PushClient, Subscription, SubscriptionMode};
//!
//! # async fn run() -> Result<(), pushlink_client::Error> {
//! let client = PushClient::new("wss://push.example.com")?;
//! let sub = Subscription::new(SubscriptionMode::Merge);
//! sub.set_items(&["item1", "item2"])?;
//! sub.set_fields(&["bid", "ask"])?;
//! client.subscribe(&sub)?;
//! client.connect();
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod environment;
mod error;
mod listener;
mod message;
mod retry;
mod session;
mod status;
mod subscription;
pub mod transport;

pub use client::{PushClient, PushClientBuilder};
pub use config::{ConnectionDetails, ConnectionOptions, ForcedTransport, MaxBandwidth};
pub use environment::{set_environment, Environment};
pub use error::Error;
pub use listener::{
    ClientListener, CommandAction, ItemUpdate, MessageListener, SubscriptionListener,
};
pub use retry::{ExponentialBackoff, SessionRetryPolicy};
pub use status::ClientStatus;
pub use subscription::{Subscription, SubscriptionState};

pub use pushlink_core::{
    BufferSize, MaxFrequency, Snapshot, SubscriptionMode, UNORDERED_MESSAGES,
};
