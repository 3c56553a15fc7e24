//! Message envelope contract.
//!
//! A message is any `serde` type with a stable numeric type identifier. On the
//! wire the payload frame carries:
//!
//! ```text
//! [0..4]   type identifier (u32, big-endian)
//! [4..]    JSON body
//! ```
//!
//! Type identifiers are not discovered at runtime. Each message-defining module
//! reserves a numeric range on a [`RegistryBuilder`] during initialization and
//! registers its types inside that range; overlapping ranges and duplicate
//! identifiers are rejected before any endpoint is built.

use crate::error::{DecodeError, LettuceError, RegistryError};

use bytes::{BufMut, Bytes, BytesMut};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Size of the type identifier header in front of every body.
pub const TYPE_HEADER_LEN: usize = 4;

/// A typed unit of application data.
///
/// ```
/// use lettuce_core::message::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Chat {
///     text: String,
/// }
///
/// impl Message for Chat {
///     const TYPE_ID: u32 = 1000;
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Stable type identifier, unique within a registry.
    const TYPE_ID: u32;
}

/// Object-safe view of a [`Message`], used once the concrete type is erased
/// (outbound queue, dispatch).
pub trait DynMessage: fmt::Debug + Send + Sync + 'static {
    fn type_identifier(&self) -> u32;

    fn type_name(&self) -> &'static str;

    fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> DynMessage for M {
    #[inline]
    fn type_identifier(&self) -> u32 {
        M::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A decoded (or locally constructed) message ready for dispatch.
///
/// Cloning is cheap; the value is shared between every path it is
/// dispatched to.
#[derive(Clone)]
pub struct Envelope {
    message: Arc<dyn DynMessage>,
}

impl Envelope {
    /// Wrap a typed message.
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            message: Arc::new(message),
        }
    }

    /// Wrap an already type-erased message.
    pub fn from_dyn(message: Arc<dyn DynMessage>) -> Self {
        Self { message }
    }

    #[inline]
    pub fn type_id(&self) -> u32 {
        self.message.type_identifier()
    }

    pub fn type_name(&self) -> &'static str {
        self.message.type_name()
    }

    /// Borrow the concrete message if it is an `M`.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.message.as_any().downcast_ref::<M>()
    }

    pub fn is<M: Message>(&self) -> bool {
        self.downcast_ref::<M>().is_some()
    }

    /// Shared handle to the erased message, e.g. for forwarding.
    pub fn message(&self) -> &Arc<dyn DynMessage> {
        &self.message
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type_id", &self.type_id())
            .field("message", &self.message)
            .finish()
    }
}

type DecodeFn = fn(&[u8]) -> Result<Arc<dyn DynMessage>, serde_json::Error>;

fn decode_as<M: Message>(body: &[u8]) -> Result<Arc<dyn DynMessage>, serde_json::Error> {
    let value: M = serde_json::from_slice(body)?;
    Ok(Arc::new(value))
}

#[derive(Clone, Copy)]
struct Binding {
    type_name: &'static str,
    decode: DecodeFn,
}

#[derive(Debug, Clone)]
struct ModuleRange {
    name: String,
    range: RangeInclusive<u32>,
}

impl ModuleRange {
    fn overlaps(&self, other: &RangeInclusive<u32>) -> bool {
        self.range.start() <= other.end() && other.start() <= self.range.end()
    }
}

/// Startup-time builder for a [`MessageRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    modules: Vec<ModuleRange>,
    bindings: HashMap<u32, Binding>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `range` for the module `name` and return a registrar for its
    /// types.
    ///
    /// Fails if the name is taken or the range overlaps another module.
    pub fn module(
        &mut self,
        name: impl Into<String>,
        range: RangeInclusive<u32>,
    ) -> Result<ModuleRegistrar<'_>, RegistryError> {
        let name = name.into();

        if self.modules.iter().any(|m| m.name == name) {
            return Err(RegistryError::DuplicateModule(name));
        }

        if let Some(other) = self.modules.iter().find(|m| m.overlaps(&range)) {
            return Err(RegistryError::RangeOverlap {
                module: name,
                other: other.name.clone(),
                start: *range.start(),
                end: *range.end(),
            });
        }

        self.modules.push(ModuleRange {
            name,
            range: range.clone(),
        });
        let index = self.modules.len() - 1;
        Ok(ModuleRegistrar {
            builder: self,
            index,
        })
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry {
            bindings: self.bindings,
            modules: self.modules,
        }
    }
}

/// Registers the message types of one module inside its reserved range.
pub struct ModuleRegistrar<'a> {
    builder: &'a mut RegistryBuilder,
    index: usize,
}

impl ModuleRegistrar<'_> {
    /// Bind `M::TYPE_ID` to `M`'s decoder.
    pub fn register<M: Message>(&mut self) -> Result<&mut Self, RegistryError> {
        let type_name = std::any::type_name::<M>();
        let module = &self.builder.modules[self.index];

        if !module.range.contains(&M::TYPE_ID) {
            return Err(RegistryError::OutOfRange {
                type_id: M::TYPE_ID,
                type_name,
                module: module.name.clone(),
                start: *module.range.start(),
                end: *module.range.end(),
            });
        }

        if let Some(existing) = self.builder.bindings.get(&M::TYPE_ID) {
            return Err(RegistryError::DuplicateTypeId {
                type_id: M::TYPE_ID,
                type_name,
                existing: existing.type_name,
            });
        }

        self.builder.bindings.insert(
            M::TYPE_ID,
            Binding {
                type_name,
                decode: decode_as::<M>,
            },
        );
        Ok(self)
    }
}

/// Immutable type identifier → decoder table, shared by every endpoint.
pub struct MessageRegistry {
    bindings: HashMap<u32, Binding>,
    modules: Vec<ModuleRange>,
}

impl MessageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn contains(&self, type_id: u32) -> bool {
        self.bindings.contains_key(&type_id)
    }

    pub fn type_name(&self, type_id: u32) -> Option<&'static str> {
        self.bindings.get(&type_id).map(|b| b.type_name)
    }

    /// Name of the module whose reserved range covers `type_id`.
    pub fn module_of(&self, type_id: u32) -> Option<&str> {
        self.modules
            .iter()
            .find(|m| m.range.contains(&type_id))
            .map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Encode a message into a payload frame.
    pub fn encode(&self, message: &dyn DynMessage) -> Result<Bytes, LettuceError> {
        let type_id = message.type_identifier();
        let body = message.encode_body().map_err(|e| LettuceError::Encode {
            type_id,
            reason: e.to_string(),
        })?;

        let mut out = BytesMut::with_capacity(TYPE_HEADER_LEN + body.len());
        out.put_u32(type_id);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a payload frame of any size.
    pub fn decode(&self, payload: &[u8]) -> Result<Envelope, DecodeError> {
        self.decode_bounded(payload, None)
    }

    /// Decode a payload frame, rejecting it as `TooLarge` when it exceeds
    /// `max` bytes. Endpoints pass `EndpointOptions::max_message_size` here.
    pub fn decode_bounded(&self, payload: &[u8], max: Option<usize>) -> Result<Envelope, DecodeError> {
        if let Some(max) = max {
            if payload.len() > max {
                return Err(DecodeError::TooLarge {
                    size: payload.len(),
                    max,
                });
            }
        }

        let type_id = type_id_of(payload)?;
        let binding = self
            .bindings
            .get(&type_id)
            .ok_or(DecodeError::UnknownType(type_id))?;

        let message =
            (binding.decode)(&payload[TYPE_HEADER_LEN..]).map_err(|e| DecodeError::Malformed {
                type_id,
                reason: e.to_string(),
            })?;
        Ok(Envelope::from_dyn(message))
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.bindings.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("modules", &self.modules)
            .field("type_ids", &ids)
            .finish()
    }
}

/// Read the type identifier header of a payload frame.
pub fn type_id_of(payload: &[u8]) -> Result<u32, DecodeError> {
    match payload.get(..TYPE_HEADER_LEN) {
        Some(header) => Ok(u32::from_be_bytes([header[0], header[1], header[2], header[3]])),
        None => Err(DecodeError::Truncated(payload.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    impl Message for Ping {
        const TYPE_ID: u32 = 1000;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        tags: Vec<String>,
    }

    impl Message for Note {
        const TYPE_ID: u32 = 1001;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Stray;

    impl Message for Stray {
        const TYPE_ID: u32 = 5;
    }

    fn registry() -> MessageRegistry {
        let mut builder = MessageRegistry::builder();
        builder
            .module("app", 1000..=1999)
            .unwrap()
            .register::<Ping>()
            .unwrap()
            .register::<Note>()
            .unwrap();
        builder.build()
    }

    #[test]
    fn round_trip_preserves_type_and_fields() {
        let registry = registry();

        let note = Note {
            text: "hello".into(),
            tags: vec!["a".into(), "b".into()],
        };
        let payload = registry.encode(&note).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded.type_id(), Note::TYPE_ID);
        assert_eq!(decoded.downcast_ref::<Note>(), Some(&note));

        let payload = registry.encode(&Ping { seq: 7 }).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { seq: 7 }));
        assert!(!decoded.is::<Note>());
    }

    #[test]
    fn payload_header_is_big_endian_type_id() {
        let registry = registry();
        let payload = registry.encode(&Ping { seq: 1 }).unwrap();
        assert_eq!(&payload[..4], &1000u32.to_be_bytes());
        assert_eq!(&payload[4..], br#"{"seq":1}"#);
        assert_eq!(type_id_of(&payload), Ok(1000));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let registry = registry();
        let mut payload = BytesMut::new();
        payload.put_u32(4242);
        payload.extend_from_slice(b"{}");
        assert_eq!(
            registry.decode(&payload).unwrap_err(),
            DecodeError::UnknownType(4242)
        );
    }

    #[test]
    fn truncated_and_malformed_payloads() {
        let registry = registry();
        assert_eq!(
            registry.decode(&[0, 0]).unwrap_err(),
            DecodeError::Truncated(2)
        );

        let mut payload = BytesMut::new();
        payload.put_u32(Ping::TYPE_ID);
        payload.extend_from_slice(b"{not json");
        assert!(matches!(
            registry.decode(&payload),
            Err(DecodeError::Malformed { type_id: 1000, .. })
        ));
    }

    #[test]
    fn oversize_payload_rejected() {
        let registry = registry();
        let payload = registry.encode(&Ping { seq: 123_456 }).unwrap();
        assert!(matches!(
            registry.decode_bounded(&payload, Some(8)),
            Err(DecodeError::TooLarge { max: 8, .. })
        ));
        assert!(registry.decode_bounded(&payload, Some(payload.len())).is_ok());
        assert!(registry.decode(&payload).is_ok());
    }

    #[test]
    fn overlapping_ranges_fail_fast() {
        let mut builder = MessageRegistry::builder();
        builder.module("a", 100..=199).unwrap();
        let err = builder.module("b", 150..=250).err().unwrap();
        assert!(matches!(err, RegistryError::RangeOverlap { ref other, .. } if other == "a"));

        assert!(matches!(
            builder.module("a", 300..=399).err().unwrap(),
            RegistryError::DuplicateModule(_)
        ));
    }

    #[test]
    fn duplicate_and_out_of_range_ids_fail_fast() {
        let mut builder = MessageRegistry::builder();
        let mut app = builder.module("app", 1000..=1999).unwrap();
        app.register::<Ping>().unwrap();
        assert!(matches!(
            app.register::<Ping>().err().unwrap(),
            RegistryError::DuplicateTypeId { type_id: 1000, .. }
        ));
        assert!(matches!(
            app.register::<Stray>().err().unwrap(),
            RegistryError::OutOfRange { type_id: 5, .. }
        ));
    }

    #[test]
    fn module_lookup() {
        let registry = registry();
        assert_eq!(registry.module_of(1500), Some("app"));
        assert_eq!(registry.module_of(10), None);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(Ping::TYPE_ID));
    }
}
