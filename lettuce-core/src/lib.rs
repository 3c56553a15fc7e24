//! Lettuce Core
//!
//! This crate contains the transport-agnostic building blocks of Lettuce Talk:
//! - Message envelope contract and startup-time codec registry (`message`)
//! - Local publish/subscribe fan-out (`hub`)
//! - Error taxonomy (`error`)
//! - Endpoint options and failure policy (`options`)
//! - Endpoint addressing (`endpoint`)
//! - Lifecycle event monitoring (`monitor`)
//! - I/O helpers shared with the socket layer (`timeout`, `poison`, `tcp`, `reconnect`)

// The tcp module needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod endpoint;
pub mod error;
pub mod hub;
pub mod message;
pub mod monitor;
pub mod options;
pub mod poison;
pub mod reconnect;
pub mod tcp;
pub mod timeout;

pub mod prelude {
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{DecodeError, LettuceError, RegistryError, Result};
    pub use crate::hub::{BroadcastHub, PublishReport, SubscriptionId};
    pub use crate::message::{DynMessage, Envelope, Message, MessageRegistry, RegistryBuilder};
    pub use crate::monitor::{EndpointEvent, EndpointMonitor, EventBus};
    pub use crate::options::{EndpointOptions, FailurePolicy};
}
