//! Send requests: a message plus where it should go.

use lettuce_core::error::{LettuceError, Result};
use lettuce_core::message::{DynMessage, Message};
use lettuce_core::options::EndpointOptions;
use std::fmt;
use std::sync::Arc;

/// Delivery target on the server topology. Peers ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every client registered when the request is submitted.
    All,
    Client(String),
}

impl Target {
    /// The wire form: empty for `All`.
    pub fn identity(&self) -> &str {
        match self {
            Self::All => "",
            Self::Client(id) => id,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("<all>"),
            Self::Client(id) => f.write_str(id),
        }
    }
}

#[derive(Clone)]
pub struct SendRequest {
    target: Target,
    message: Arc<dyn DynMessage>,
    // Replies to a client that is de-registering skip the registry check.
    pub(crate) check_target: bool,
}

impl SendRequest {
    /// Build a request from a nullable target identity.
    ///
    /// `None` is a construction error; `Some("")` targets every registered
    /// client.
    pub fn new(target: Option<String>, message: Arc<dyn DynMessage>) -> Result<Self> {
        let target = match target {
            None => return Err(LettuceError::construction("target identity cannot be null")),
            Some(id) if id.is_empty() => Target::All,
            Some(id) => {
                EndpointOptions::validate_identity(&id)
                    .map_err(|e| LettuceError::construction(format!("invalid target identity: {e}")))?;
                Target::Client(id)
            }
        };
        Ok(Self {
            target,
            message,
            check_target: true,
        })
    }

    /// Address one client.
    pub fn to<M: Message>(identity: impl Into<String>, message: M) -> Result<Self> {
        Self::new(Some(identity.into()), Arc::new(message))
    }

    /// Address every registered client.
    pub fn broadcast<M: Message>(message: M) -> Self {
        Self {
            target: Target::All,
            message: Arc::new(message),
            check_target: true,
        }
    }

    /// Fan-out copy or loop-generated reply; the identity is already known.
    pub(crate) fn addressed(identity: String, message: Arc<dyn DynMessage>) -> Self {
        Self {
            target: Target::Client(identity),
            message,
            check_target: true,
        }
    }

    pub(crate) fn unchecked(mut self) -> Self {
        self.check_target = false;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn message(&self) -> &Arc<dyn DynMessage> {
        &self.message
    }

    pub(crate) fn into_message(self) -> Arc<dyn DynMessage> {
        self.message
    }
}

impl fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRequest")
            .field("target", &self.target)
            .field("type_id", &self.message.type_identifier())
            .finish()
    }
}
