//! Service injection into command trees.
//!
//! Commands and the completers, validators, converters and activators
//! attached to their options are plain values built by a
//! [`RegistryFactory`](crate::command::RegistryFactory), outside any
//! container. Before a session runs, the [`DependencyInjector`] walks the
//! tree and fills every [`Inject`] field it can resolve:
//!
//! - a field that is already set is never overwritten
//! - a service the container cannot resolve leaves the field untouched
//! - a resolved value of the wrong type is an [`Error::Injection`]
//!
//! # Example
//!
//! ```rust,ignore
//! use termhost::prelude::*;
//!
//! struct Hello {
//!     greeter: Inject<dyn Greeter>,
//! }
//! injectable!(Hello { greeter });
//!
//! let container = ServiceContainer::new().with::<dyn Greeter>(Arc::new(English));
//! let injector = DependencyInjector::new(Arc::new(container));
//! let report = injector.inject_registry(&mut registry)?;
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::command::{CommandNode, CommandRegistry};
use crate::{Error, Result};

/// A type-erased service. Holds an `Arc<T>` for the service type `T`.
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// Identifies a service type in a [`Container`].
#[derive(Clone, Copy)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// Returns the key of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Returns the type id.
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Returns the type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl std::hash::Hash for ServiceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Service lookup.
///
/// A returned handle must hold an `Arc<T>` where `T` is the type `key` was
/// made from.
pub trait Container: Send + Sync {
    /// Resolves a service, or returns `None` when it is not available.
    fn resolve(&self, key: &ServiceKey) -> Option<ServiceHandle>;
}

/// A field filled by the [`DependencyInjector`].
pub struct Inject<T: ?Sized> {
    value: Option<Arc<T>>,
}

impl<T: ?Sized> Inject<T> {
    /// Creates an empty field.
    pub fn empty() -> Self {
        Self { value: None }
    }

    /// Creates a field that is already set. Injection leaves it alone.
    pub fn with(value: Arc<T>) -> Self {
        Self { value: Some(value) }
    }

    /// Returns the service, if injected or preset.
    pub fn get(&self) -> Option<&T> {
        self.value.as_deref()
    }

    /// Returns the shared handle.
    pub fn arc(&self) -> Option<Arc<T>> {
        self.value.clone()
    }

    /// Returns true when a value is present.
    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    fn set(&mut self, value: Arc<T>) {
        self.value = Some(value);
    }
}

impl<T: ?Sized> Default for Inject<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> Clone for Inject<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Inject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inject")
            .field("service", &std::any::type_name::<T>())
            .field("set", &self.is_set())
            .finish()
    }
}

/// A value with fields that can be injected.
///
/// Implement with the [`injectable!`](crate::injectable) macro, or by hand
/// when fields need custom handling.
pub trait Injectable {
    /// Offers every [`Inject`] field to the injector.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::Injection`] from [`FieldInjector::field`].
    fn inject_fields(&mut self, injector: &mut FieldInjector<'_>) -> Result<()> {
        let _ = injector;
        Ok(())
    }

    /// Type name reported in injection errors and logs.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Declares the [`Inject`] fields of a type.
///
/// ```rust,ignore
/// injectable!(Hello { greeter, clock });
/// injectable!(Echo);
/// ```
#[macro_export]
macro_rules! injectable {
    ($ty:ty) => {
        impl $crate::inject::Injectable for $ty {}
    };
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::inject::Injectable for $ty {
            fn inject_fields(
                &mut self,
                injector: &mut $crate::inject::FieldInjector<'_>,
            ) -> $crate::Result<()> {
                $( injector.field(stringify!($field), &mut self.$field)?; )*
                Ok(())
            }
        }
    };
}

/// Counts of what an injection pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectionReport {
    /// Objects visited (commands and attached providers).
    pub visited: usize,
    /// Fields filled from the container.
    pub injected: usize,
    /// Fields left empty because the container had no matching service.
    pub unresolved: usize,
    /// Fields left alone because they were already set.
    pub preserved: usize,
}

/// Visitor handed to [`Injectable::inject_fields`].
pub struct FieldInjector<'a> {
    container: &'a dyn Container,
    owner: &'static str,
    report: &'a mut InjectionReport,
}

impl<'a> FieldInjector<'a> {
    /// Creates a visitor for one object.
    pub fn new(
        container: &'a dyn Container,
        owner: &'static str,
        report: &'a mut InjectionReport,
    ) -> Self {
        Self {
            container,
            owner,
            report,
        }
    }

    /// Offers one field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Injection`] if the container returns a value that is
    /// not an `Arc<T>`.
    pub fn field<T: ?Sized + 'static>(
        &mut self,
        name: &'static str,
        slot: &mut Inject<T>,
    ) -> Result<()> {
        if slot.is_set() {
            trace!(owner = self.owner, field = name, "Field already set, skipping");
            self.report.preserved += 1;
            return Ok(());
        }

        let key = ServiceKey::of::<T>();
        let Some(handle) = self.container.resolve(&key) else {
            debug!(
                owner = self.owner,
                field = name,
                service = key.name(),
                "No service available for field"
            );
            self.report.unresolved += 1;
            return Ok(());
        };

        match handle.downcast_ref::<Arc<T>>() {
            Some(value) => {
                slot.set(value.clone());
                self.report.injected += 1;
                trace!(owner = self.owner, field = name, service = key.name(), "Field injected");
                Ok(())
            }
            None => Err(Error::Injection {
                owner: self.owner,
                field: name,
                reason: format!("container returned a value that is not `{}`", key.name()),
            }),
        }
    }
}

/// Walks command trees and injects every reachable object.
#[derive(Clone)]
pub struct DependencyInjector {
    container: Arc<dyn Container>,
}

impl DependencyInjector {
    /// Creates an injector backed by `container`.
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self { container }
    }

    /// Returns the container.
    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    /// Injects every command in the registry.
    ///
    /// # Errors
    ///
    /// Stops at the first [`Error::Injection`].
    pub fn inject_registry(&self, registry: &mut CommandRegistry) -> Result<InjectionReport> {
        let mut report = InjectionReport::default();
        for node in registry.iter_mut() {
            self.visit(node, &mut report)?;
        }
        debug!(
            visited = report.visited,
            injected = report.injected,
            unresolved = report.unresolved,
            preserved = report.preserved,
            "Command registry injected"
        );
        Ok(report)
    }

    /// Injects a node, its option providers and all descendants.
    ///
    /// # Errors
    ///
    /// Stops at the first [`Error::Injection`].
    pub fn inject(&self, root: &mut CommandNode) -> Result<InjectionReport> {
        let mut report = InjectionReport::default();
        self.visit(root, &mut report)?;
        Ok(report)
    }

    /// Injects a single object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Injection`] on a type mismatch.
    pub fn inject_object<I: Injectable + ?Sized>(
        &self,
        object: &mut I,
        report: &mut InjectionReport,
    ) -> Result<()> {
        report.visited += 1;
        let owner = object.type_name();
        let mut injector = FieldInjector::new(self.container.as_ref(), owner, report);
        object.inject_fields(&mut injector)
    }

    fn visit(&self, node: &mut CommandNode, report: &mut InjectionReport) -> Result<()> {
        self.inject_object(node.command_mut(), report)?;

        for option in node.options_mut() {
            let providers = option.providers_mut();
            if let Some(completer) = providers.completer.as_deref_mut() {
                self.inject_object(completer, report)?;
            }
            if let Some(validator) = providers.validator.as_deref_mut() {
                self.inject_object(validator, report)?;
            }
            if let Some(converter) = providers.converter.as_deref_mut() {
                self.inject_object(converter, report)?;
            }
            if let Some(activator) = providers.activator.as_deref_mut() {
                self.inject_object(activator, report)?;
            }
        }

        for child in node.children_mut() {
            self.visit(child, report)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DependencyInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyInjector").finish_non_exhaustive()
    }
}

/// In-memory [`Container`] keyed by service type.
#[derive(Default)]
pub struct ServiceContainer {
    services: RwLock<HashMap<ServiceKey, ServiceHandle>>,
}

impl ServiceContainer {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any previous one of the same type.
    pub fn register<T: ?Sized + Send + Sync + 'static>(&self, service: Arc<T>) {
        let key = ServiceKey::of::<T>();
        debug!(service = key.name(), "Service registered");
        self.services.write().insert(key, Arc::new(service));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<T: ?Sized + Send + Sync + 'static>(self, service: Arc<T>) -> Self {
        self.register(service);
        self
    }

    /// Looks up a service by type.
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve(&ServiceKey::of::<T>())?
            .downcast_ref::<Arc<T>>()
            .cloned()
    }

    /// Returns true if a service of type `T` is registered.
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.services.read().contains_key(&ServiceKey::of::<T>())
    }

    /// Returns the number of registered services.
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl Container for ServiceContainer {
    fn resolve(&self, key: &ServiceKey) -> Option<ServiceHandle> {
        self.services.read().get(key).cloned()
    }
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services = self.services.read();
        let names: Vec<&str> = services.keys().map(ServiceKey::name).collect();
        f.debug_struct("ServiceContainer")
            .field("services", &names)
            .finish()
    }
}
