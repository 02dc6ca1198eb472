//! Class instances, exceptions and the activator that creates them.
//!
//! Generated code implements [`SliceClass`] or [`SliceException`] for each
//! Slice type. Encoding writes one slice per level of the type hierarchy,
//! most-derived first; decoding asks an [`Activator`] for the first type id it
//! recognizes and slices off anything more derived.

use crate::decoder::SliceDecoder;
use crate::encoder::SliceEncoder;
use crate::error::ProtocolError;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Slice header flags.
pub(crate) mod flags {
    pub const TYPE_ID_STRING: u8 = 0x01;
    pub const TYPE_ID_INDEX: u8 = 0x02;
    pub const TYPE_ID_COMPACT: u8 = 0x03;
    pub const TYPE_ID_MASK: u8 = 0x03;
    pub const HAS_OPTIONAL_MEMBERS: u8 = 0x04;
    pub const HAS_INDIRECTION_TABLE: u8 = 0x08;
    pub const HAS_SLICE_SIZE: u8 = 0x10;
    pub const IS_LAST_SLICE: u8 = 0x20;
}

/// A class instance that can be written to and read from a Slice stream.
pub trait SliceClass: Any + Send + fmt::Debug {
    /// Most-derived Slice type id, e.g. `::Test::Truck`.
    fn slice_type_id(&self) -> &str;

    /// Writes every slice, most-derived first.
    fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError>;

    /// Reads the slices of this type. The first slice header has already been
    /// consumed by the decoder.
    fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to a class instance. Identity is pointer identity.
pub type ClassRef = Arc<Mutex<dyn SliceClass>>;

/// Wraps a value in a new [`ClassRef`].
pub fn new_class<T: SliceClass>(value: T) -> ClassRef {
    Arc::new(Mutex::new(value))
}

/// Returns whether two handles point to the same instance.
pub fn same_instance(a: &ClassRef, b: &ClassRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub(crate) fn instance_key(class: &ClassRef) -> usize {
    Arc::as_ptr(class) as *const () as usize
}

/// Locks `class` and downcasts it to `T`.
pub fn downcast<T: SliceClass>(class: &ClassRef) -> Option<MappedMutexGuard<'_, T>> {
    MutexGuard::try_map(class.lock(), |value| value.as_any_mut().downcast_mut::<T>()).ok()
}

/// A user exception carried in a reply.
pub trait SliceException: Any + Send + Sync + fmt::Debug + fmt::Display {
    /// Most-derived Slice type id.
    fn slice_type_id(&self) -> &str;

    /// Type ids of this exception and its bases, most-derived first.
    fn type_ids(&self) -> &'static [&'static str];

    /// Writes every slice, most-derived first.
    fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError>;

    /// Reads the slices of this type. The first slice header has already been
    /// consumed by the decoder.
    fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError>;

    fn as_any(&self) -> &dyn Any;

    /// Returns whether this exception is `type_id` or derives from it.
    fn is_a(&self, type_id: &str) -> bool {
        self.type_ids().iter().any(|id| *id == type_id)
    }
}

/// Result of decoding an exception.
#[derive(Debug)]
pub enum DecodedException {
    /// The most-derived recognized type, possibly a base of the type sent.
    Known(Box<dyn SliceException>),
    /// No slice was recognized. Carries the most-derived type id.
    Unknown { type_id: String },
}

/// What the decoder does when no slice of a class instance is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlicingPolicy {
    /// Substitute an [`UnknownSlicedValue`] placeholder.
    #[default]
    Slice,
    /// Fail with [`ProtocolError::UnknownClass`].
    Strict,
}

/// Placeholder for an instance whose type no slice identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSlicedValue {
    type_id: String,
}

impl UnknownSlicedValue {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
        }
    }
}

impl SliceClass for UnknownSlicedValue {
    fn slice_type_id(&self) -> &str {
        &self.type_id
    }

    fn encode(&self, _encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
        Err(ProtocolError::invalid(format!(
            "cannot re-encode sliced instance of unknown type {}",
            self.type_id
        )))
    }

    fn decode(&mut self, _decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Resolves wire type ids to constructible values.
pub trait Activator: Send + Sync {
    /// Creates a default instance of the class `type_id`.
    fn create_class(&self, type_id: &str) -> Option<ClassRef>;

    /// Maps a compact id to its type id.
    fn resolve_compact_id(&self, compact_id: i32) -> Option<String>;

    /// Creates a default instance of the exception `type_id`.
    fn create_exception(&self, type_id: &str) -> Option<Box<dyn SliceException>>;
}

pub type ClassFactory = fn() -> ClassRef;
pub type ExceptionFactory = fn() -> Box<dyn SliceException>;

/// Table-driven [`Activator`] populated by generated code at startup.
#[derive(Default, Clone)]
pub struct TypeRegistry {
    classes: HashMap<String, ClassFactory>,
    compact_ids: HashMap<i32, String>,
    exceptions: HashMap<String, ExceptionFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, type_id: impl Into<String>, factory: ClassFactory) -> Self {
        self.classes.insert(type_id.into(), factory);
        self
    }

    pub fn with_compact_id(mut self, compact_id: i32, type_id: impl Into<String>) -> Self {
        self.compact_ids.insert(compact_id, type_id.into());
        self
    }

    pub fn with_exception(mut self, type_id: impl Into<String>, factory: ExceptionFactory) -> Self {
        self.exceptions.insert(type_id.into(), factory);
        self
    }

    /// Number of registered classes and exceptions.
    pub fn len(&self) -> usize {
        self.classes.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("compact_ids", &self.compact_ids)
            .field("exceptions", &self.exceptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Activator for TypeRegistry {
    fn create_class(&self, type_id: &str) -> Option<ClassRef> {
        self.classes.get(type_id).map(|factory| factory())
    }

    fn resolve_compact_id(&self, compact_id: i32) -> Option<String> {
        self.compact_ids.get(&compact_id).cloned()
    }

    fn create_exception(&self, type_id: &str) -> Option<Box<dyn SliceException>> {
        self.exceptions.get(type_id).map(|factory| factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Marker {
        value: i32,
    }

    impl SliceClass for Marker {
        fn slice_type_id(&self) -> &str {
            "::Test::Marker"
        }

        fn encode(&self, encoder: &mut SliceEncoder) -> Result<(), ProtocolError> {
            encoder.start_slice("::Test::Marker", None, true);
            encoder.encode_i32(self.value);
            encoder.end_slice()
        }

        fn decode(&mut self, decoder: &mut SliceDecoder<'_>) -> Result<(), ProtocolError> {
            decoder.start_slice()?;
            self.value = decoder.decode_i32()?;
            decoder.end_slice()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_same_instance() {
        let a = new_class(Marker::default());
        let b = a.clone();
        let c = new_class(Marker::default());
        assert!(same_instance(&a, &b));
        assert!(!same_instance(&a, &c));
    }

    #[test]
    fn test_downcast() {
        let a = new_class(Marker { value: 7 });
        assert_eq!(downcast::<Marker>(&a).unwrap().value, 7);
        assert!(downcast::<UnknownSlicedValue>(&a).is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TypeRegistry::new()
            .with_class("::Test::Marker", || new_class(Marker::default()))
            .with_compact_id(3, "::Test::Marker");

        assert!(registry.create_class("::Test::Marker").is_some());
        assert!(registry.create_class("::Test::Other").is_none());
        assert_eq!(
            registry.resolve_compact_id(3).as_deref(),
            Some("::Test::Marker")
        );
        assert!(registry.resolve_compact_id(4).is_none());
        assert!(registry.create_exception("::Test::Marker").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_sliced_value_refuses_encode() {
        let value = UnknownSlicedValue::new("::Test::Gone");
        assert_eq!(value.slice_type_id(), "::Test::Gone");
        let mut encoder = SliceEncoder::new();
        assert!(value.encode(&mut encoder).is_err());
    }
}
