//! # Lettuce Talk
//!
//! Typed, envelope-based messaging over ROUTER/DEALER sockets.
//!
//! A [`ServerEndpoint`](server::ServerEndpoint) binds one ROUTER socket and
//! keeps a registry of named clients; each client is a
//! [`PeerEndpoint`](peer::PeerEndpoint) announcing its name as the socket
//! identity. Two peers can also talk directly.
//!
//! ## Layering
//!
//! - **`lettuce-core`**: message codec registry, broadcast hub, errors,
//!   options, events
//! - **`lettuce-zmtp`**: ZMTP 3.0 router/dealer sockets on `compio`
//! - **`lettuce`**: endpoints, I/O loop, client registry (this crate)
//!
//! ## Threading
//!
//! Every endpoint owns one I/O thread. Sending only enqueues; the loop
//! writes. Subscriber callbacks run on the loop thread, so they should be
//! quick.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lettuce::prelude::*;
//! use lettuce::messages::RegisterClientAck;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Message for Chat {
//!     const TYPE_ID: u32 = 1000;
//! }
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut builder = lettuce::messages::registry_builder()?;
//! builder.module("chat", 1000..=1099)?.register::<Chat>()?;
//! let codec = Arc::new(builder.build());
//!
//! let server = ServerEndpoint::bind(
//!     Endpoint::parse("tcp://127.0.0.1:0")?,
//!     EndpointOptions::default(),
//!     codec.clone(),
//! )?;
//! server.hub().subscribe::<Chat, _>(|chat| println!("server got {}", chat.text));
//!
//! let client = PeerEndpoint::connect(
//!     "c1",
//!     server.local_addr().into(),
//!     EndpointOptions::default(),
//!     codec,
//! )?;
//! client.subscribe::<RegisterClientAck, _>(|_| println!("registered"));
//! client.register_with_server(true, true)?;
//! client.send_message(Chat { text: "hello".into() })?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod dev_tracing;
pub mod messages;
pub mod peer;
pub mod registry;
pub mod send;
pub mod server;
pub mod talker;
mod transport;

pub use bytes::Bytes;
pub use transport::{LoopState, OutboundQueue};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::messages::{DeRegisterClient, DeRegisterClientAck, RegisterClient, RegisterClientAck};
    pub use crate::peer::PeerEndpoint;
    pub use crate::registry::{ClientRegistry, ClientSession};
    pub use crate::send::{SendRequest, Target};
    pub use crate::server::ServerEndpoint;
    pub use crate::talker::Talker;
    pub use crate::transport::LoopState;
    pub use lettuce_core::prelude::*;
}
