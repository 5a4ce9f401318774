//! Persistent chat-protocol client: session engine, entity registry,
//! event bus, and query correlation.
//!
//! This crate provides everything above the wire layer:
//! - Server directory lookup and random server selection
//! - Login, keepalive, and automatic reconnection
//! - An entity registry merged from every server message
//! - Callback subscriptions per message kind
//! - Correlated request/response user queries
//!
//! # Example
//!
//! ```rust,no_run
//! use camline_client::{Client, ClientConfig, MessageKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::new("guest", "guest"));
//!     client.on(MessageKind::Cmesg, |message| {
//!         println!("room chat: {:?}", message.payload);
//!     });
//!     client.run(true).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod correlator;
mod directory;
mod error;
mod events;
mod registry;
mod routing;
mod session;

pub use camline_protocol::{Message, MessageKind, Payload, VideoState};
pub use config::ClientConfig;
pub use correlator::{PendingQuery, QueryCorrelator};
pub use directory::{
    BoxFuture, ExtDataResolver, HttpExtDataResolver, HttpServerDirectory, ServerDirectory,
};
pub use error::{ClientError, ClientResult};
pub use events::{EventBus, SubscriptionId};
pub use registry::{EntityRecord, EntityRegistry, SessionSnapshot};
pub use routing::{MergeStrategy, is_transient, strategy_for};
pub use session::{
    Client, SessionState, StreamContext, UserRef, to_room_id, to_user_id,
};
