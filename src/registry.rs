//! The set of types a channel may carry, and the names they travel under.
//!
//! Every frame on the wire is tagged with a registered name. The sender looks the name up from
//! the value's runtime type, the receiver looks the type up from the name and decodes the payload
//! into a fresh instance of it.
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{RegistryError, WireError};

/// Bound for values that can be registered on a channel.
///
/// Blanket-implemented for every serde type with a `Default` that can move between tasks.
pub trait Payload: Serialize + DeserializeOwned + Default + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Default + Send + 'static {}

/// Type-erased handle for one registered type.
pub trait TypeDescriptor: Send + Sync {
    /// The Rust type identity this descriptor stands for.
    fn id(&self) -> TypeId;

    /// The Rust type name, for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Whether `value` is an instance of this descriptor's type.
    fn matches(&self, value: &dyn Any) -> bool;

    /// A fresh zero-valued instance, ready to receive decoded fields.
    fn new_instance(&self) -> Box<dyn Any + Send>;

    /// Appends the MessagePack encoding of `value` to `buf`.
    fn encode(&self, value: &dyn Any, buf: &mut Vec<u8>) -> Result<(), WireError>;

    /// Decodes one complete MessagePack value from `bytes` into `instance`.
    fn decode_into(&self, bytes: &[u8], instance: &mut (dyn Any + Send)) -> Result<(), WireError>;
}

/// The [`TypeDescriptor`] for a concrete [`Payload`] type.
struct Descriptor<T>(PhantomData<fn() -> T>);

impl<T: Payload> TypeDescriptor for Descriptor<T> {
    fn id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn matches(&self, value: &dyn Any) -> bool {
        value.is::<T>()
    }

    fn new_instance(&self) -> Box<dyn Any + Send> {
        Box::new(T::default())
    }

    fn encode(&self, value: &dyn Any, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            WireError::UnexpectedValue(format!("expected a {}", type_name::<T>()))
        })?;
        rmp_serde::encode::write_named(buf, value)?;
        Ok(())
    }

    fn decode_into(&self, bytes: &[u8], instance: &mut (dyn Any + Send)) -> Result<(), WireError> {
        let slot = instance.downcast_mut::<T>().ok_or_else(|| {
            WireError::UnexpectedValue(format!("instance is not a {}", type_name::<T>()))
        })?;
        *slot = rmp_serde::from_slice(bytes)?;
        Ok(())
    }
}

/// A registered name and its descriptor.
pub(crate) struct Entry {
    pub(crate) name: Arc<str>,
    pub(crate) descriptor: Box<dyn TypeDescriptor>,
}

/// Bidirectional mapping between wire names and Rust types.
///
/// A registry is filled in before it is handed to a [`Channel`](crate::Channel) and is
/// immutable afterwards. Both ends of a connection should register the same names for the
/// types they exchange.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    by_name: HashMap<Arc<str>, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name`.
    ///
    /// Names must be unique, and each type may only be registered once.
    pub fn register<T: Payload>(
        &mut self,
        name: impl Into<String>,
    ) -> Result<&mut Self, RegistryError> {
        let name: Arc<str> = Arc::from(name.into());
        let descriptor: Box<dyn TypeDescriptor> = Box::new(Descriptor::<T>(PhantomData));
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if let Some(existing) = self.entry_for_type(descriptor.id()) {
            return Err(RegistryError::DuplicateType {
                type_name: descriptor.type_name(),
                existing: existing.name.to_string(),
            });
        }
        let index = self.entries.len();
        self.by_name.insert(name.clone(), index);
        self.by_type.insert(descriptor.id(), index);
        self.entries.push(Entry { name, descriptor });
        Ok(self)
    }

    /// Registers `T` under a name derived from its Rust type name.
    ///
    /// The derived name comes from [`std::any::type_name`], which is not guaranteed to be stable
    /// across compiler versions. Peers built separately should use [`Registry::register`].
    pub fn register_auto<T: Payload>(&mut self) -> Result<&mut Self, RegistryError> {
        self.register::<T>(type_name::<T>())
    }

    /// Looks up the descriptor registered under `name`.
    pub fn resolve_by_name(&self, name: &str) -> Option<&dyn TypeDescriptor> {
        self.entry_by_name(name).map(|e| e.descriptor.as_ref())
    }

    /// Finds the name under which the runtime type of `value` is registered.
    pub fn resolve_by_value(&self, value: &dyn Any) -> Option<&str> {
        self.entry_for_value(value).map(|e| e.name.as_ref())
    }

    /// Produces a fresh zero-valued instance of the descriptor's type.
    pub fn new_instance(&self, descriptor: &dyn TypeDescriptor) -> Box<dyn Any + Send> {
        descriptor.new_instance()
    }

    /// Whether `T` is registered.
    pub fn contains<T: 'static>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry_by_name(&self, name: &str) -> Option<&Entry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub(crate) fn entry_for_value(&self, value: &dyn Any) -> Option<&Entry> {
        self.entries.iter().find(|e| e.descriptor.matches(value))
    }

    pub(crate) fn entry_for_type(&self, id: TypeId) -> Option<&Entry> {
        self.by_type.get(&id).map(|&i| &self.entries[i])
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (e.name.as_ref(), e.descriptor.type_name())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register::<String>("greeting")
            .unwrap()
            .register::<Point>("point")
            .unwrap();
        registry
    }

    #[test]
    fn test_resolve_both_directions() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["greeting", "point"]);

        let point = Point { x: 1, y: 2 };
        assert_eq!(registry.resolve_by_value(&point), Some("point"));
        assert_eq!(registry.resolve_by_value(&String::from("hi")), Some("greeting"));
        assert_eq!(registry.resolve_by_value(&42u32), None);

        let descriptor = registry.resolve_by_name("point").unwrap();
        assert!(descriptor.matches(&point));
        assert!(!descriptor.matches(&String::new()));
        assert!(registry.resolve_by_name("nope").is_none());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut registry = registry();
        assert_eq!(
            registry.register::<u32>("point").err(),
            Some(RegistryError::DuplicateName("point".into()))
        );
        assert_eq!(
            registry.register::<Point>("other_point").err(),
            Some(RegistryError::DuplicateType {
                type_name: type_name::<Point>(),
                existing: "point".into(),
            })
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_auto_uses_type_name() {
        let mut registry = Registry::new();
        registry.register_auto::<Point>().unwrap();
        assert_eq!(registry.resolve_by_value(&Point::default()), Some(type_name::<Point>()));
        assert!(registry.contains::<Point>());
        assert!(!registry.contains::<String>());
    }

    #[test]
    fn test_instance_decode() {
        let registry = registry();
        let descriptor = registry.resolve_by_name("point").unwrap();

        let mut buf = Vec::new();
        descriptor.encode(&Point { x: 3, y: -4 }, &mut buf).unwrap();

        let mut instance = registry.new_instance(descriptor);
        assert_eq!(instance.downcast_ref::<Point>(), Some(&Point::default()));
        descriptor.decode_into(&buf, instance.as_mut()).unwrap();
        assert_eq!(*instance.downcast::<Point>().unwrap(), Point { x: 3, y: -4 });
    }

    #[test]
    fn test_encode_wrong_type() {
        let registry = registry();
        let descriptor = registry.resolve_by_name("greeting").unwrap();
        let mut buf = Vec::new();
        assert!(matches!(
            descriptor.encode(&Point::default(), &mut buf),
            Err(WireError::UnexpectedValue(_))
        ));
        assert!(buf.is_empty());
    }
}
