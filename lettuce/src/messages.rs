//! Registration handshake messages.
//!
//! These live in their own reserved range so application modules cannot
//! collide with them.

use lettuce_core::error::RegistryError;
use lettuce_core::message::{Message, RegistryBuilder};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const REGISTRATION_MODULE: &str = "lettuce.registration";
pub const REGISTRATION_RANGE: RangeInclusive<u32> = 100..=199;

pub const REGISTER_CLIENT: u32 = 100;
pub const REGISTER_CLIENT_ACK: u32 = 101;
pub const DEREGISTER_CLIENT: u32 = 102;
pub const DEREGISTER_CLIENT_ACK: u32 = 103;

const fn default_true() -> bool {
    true
}

/// Sent by a client to join the server's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClient {
    /// Also publish this client's messages on the server hub.
    #[serde(default)]
    pub publish_messages_to_server: bool,

    /// Let the server create the session if none exists yet.
    #[serde(default = "default_true")]
    pub pre_register_client: bool,
}

impl Default for RegisterClient {
    fn default() -> Self {
        Self {
            publish_messages_to_server: false,
            pre_register_client: true,
        }
    }
}

impl RegisterClient {
    pub fn new(publish_messages_to_server: bool, pre_register_client: bool) -> Self {
        Self {
            publish_messages_to_server,
            pre_register_client,
        }
    }
}

impl Message for RegisterClient {
    const TYPE_ID: u32 = REGISTER_CLIENT;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClientAck {}

impl Message for RegisterClientAck {
    const TYPE_ID: u32 = REGISTER_CLIENT_ACK;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeRegisterClient {}

impl Message for DeRegisterClient {
    const TYPE_ID: u32 = DEREGISTER_CLIENT;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeRegisterClientAck {}

impl Message for DeRegisterClientAck {
    const TYPE_ID: u32 = DEREGISTER_CLIENT_ACK;
}

/// Reserve the registration range and register its four messages.
pub fn register_messages(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder
        .module(REGISTRATION_MODULE, REGISTRATION_RANGE)?
        .register::<RegisterClient>()?
        .register::<RegisterClientAck>()?
        .register::<DeRegisterClient>()?
        .register::<DeRegisterClientAck>()?;
    Ok(())
}

/// A builder with the registration messages already in place.
///
/// ```
/// use lettuce::messages::registry_builder;
///
/// let registry = registry_builder().unwrap().build();
/// assert_eq!(registry.len(), 4);
/// assert_eq!(registry.module_of(101), Some("lettuce.registration"));
/// ```
pub fn registry_builder() -> Result<RegistryBuilder, RegistryError> {
    let mut builder = RegistryBuilder::new();
    register_messages(&mut builder)?;
    Ok(builder)
}
