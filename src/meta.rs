//! Class and method metadata as seen by the resolution cache.
//!
//! The cache stores metadata in single machine words, so classes and methods
//! live behind [`MetaRef`], a word-sized pointer handle. Metadata is owned by
//! the class loader and stays alive until its class is unloaded, which by
//! contract outlives every cache entry referring to it.

use crate::bytecode::TosState;
use crate::sync::{AtomicBool, Ordering, RwLock};
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum Metadata {
    Klass(Klass),
    Method(Method),
}

impl Metadata {
    pub fn is_klass(&self) -> bool {
        matches!(self, Metadata::Klass(_))
    }

    pub fn is_method(&self) -> bool {
        matches!(self, Metadata::Method(_))
    }

    pub fn as_klass(&self) -> Option<&Klass> {
        match self {
            Metadata::Klass(k) => Some(k),
            Metadata::Method(_) => None,
        }
    }

    pub fn as_method(&self) -> Option<&Method> {
        match self {
            Metadata::Method(m) => Some(m),
            Metadata::Klass(_) => None,
        }
    }

    pub fn expect_klass(&self) -> &Klass {
        match self {
            Metadata::Klass(k) => k,
            Metadata::Method(m) => panic!("expected a class, found method {}", m.name),
        }
    }

    pub fn expect_method(&self) -> &Method {
        match self {
            Metadata::Method(m) => m,
            Metadata::Klass(k) => panic!("expected a method, found class {}", k.name),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Metadata::Klass(k) => &k.name,
            Metadata::Method(m) => &m.name,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KlassKind {
    Instance,
    Interface,
    Array,
}

pub struct Klass {
    pub name: String,
    pub kind: KlassKind,
    /// Virtual dispatch table, filled during class linking.
    vtable: RwLock<Vec<MetaRef>>,
    /// Declared methods; for an interface this is the itable order.
    methods: RwLock<Vec<MetaRef>>,
}

impl Klass {
    pub fn new(name: impl Into<String>, kind: KlassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            vtable: RwLock::new(Vec::new()),
            methods: RwLock::new(Vec::new()),
        }
    }

    pub fn is_interface(&self) -> bool {
        self.kind == KlassKind::Interface
    }

    pub fn is_array(&self) -> bool {
        self.kind == KlassKind::Array
    }

    /// Arrays are the only non-instance classes; virtual dispatch on an array
    /// receiver goes through the root object class instead.
    pub fn is_instance(&self) -> bool {
        self.kind != KlassKind::Array
    }

    pub fn set_vtable(&self, table: Vec<MetaRef>) {
        debug_assert!(table.iter().all(|m| m.is_method()));
        *self.vtable.write() = table;
    }

    pub fn set_methods(&self, methods: Vec<MetaRef>) {
        debug_assert!(methods.iter().all(|m| m.is_method()));
        *self.methods.write() = methods;
    }

    pub fn method_at_vtable(&self, index: usize) -> Option<MetaRef> {
        self.vtable.read().get(index).copied()
    }

    /// Looks up the interface method declared at the given itable slot.
    pub fn method_for_itable_index(&self, index: usize) -> Option<MetaRef> {
        debug_assert!(self.is_interface(), "itable lookup on non-interface class");
        self.methods.read().get(index).copied()
    }
}

impl Debug for Klass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.kind, self.name)
    }
}

pub struct Method {
    pub name: String,
    /// The defining class; always a `Metadata::Klass`.
    pub holder: MetaRef,
    pub result_type: TosState,
    /// Operand-stack slots consumed by the arguments, receiver included.
    pub parameter_size: u8,
    pub is_public: bool,
    pub is_private: bool,
    pub is_static: bool,
    pub is_final: bool,
    /// Superseded by a class redefinition but not yet collected.
    old: AtomicBool,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        holder: MetaRef,
        result_type: TosState,
        parameter_size: u8,
    ) -> Self {
        debug_assert!(holder.is_klass());
        Self {
            name: name.into(),
            holder,
            result_type,
            parameter_size,
            is_public: true,
            is_private: false,
            is_static: false,
            is_final: false,
            old: AtomicBool::new(false),
        }
    }

    /// A call to this method always binds to it, so a call site may cache the
    /// method pointer directly instead of a dispatch-table index.
    pub fn can_be_statically_bound(&self) -> bool {
        self.is_final || self.is_static || self.is_private
    }

    pub fn is_old(&self) -> bool {
        self.old.load(Ordering::Relaxed)
    }

    /// Called by the redefinition subsystem while the world is stopped.
    pub fn mark_old(&self) {
        self.old.store(true, Ordering::Relaxed);
    }
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.holder.name(), self.name)
    }
}

/// Word-sized handle to a [`Metadata`] record with pointer identity.
///
/// The safe constructor takes `&'static Metadata`: class metadata is leaked
/// for the lifetime of its class, the same way loaded code is. Equality and
/// hashing are by address, never by content.
#[derive(Copy, Clone)]
pub struct MetaRef(NonNull<Metadata>);

// SAFETY: the pointee is immutable apart from interior locks/atomics, and the
// handle is only ever dereferenced while the owning class is alive.
unsafe impl Send for MetaRef {}
unsafe impl Sync for MetaRef {}

impl MetaRef {
    pub fn new(meta: &'static Metadata) -> Self {
        Self(NonNull::from(meta))
    }

    /// # Safety
    /// `ptr` must be null or point to a live `Metadata` that outlives every
    /// use of the returned handle.
    pub unsafe fn from_ptr(ptr: *mut Metadata) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut Metadata {
        self.0.as_ptr()
    }
}

impl Deref for MetaRef {
    type Target = Metadata;

    fn deref(&self) -> &Metadata {
        // SAFETY: construction guarantees the pointee is live.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for MetaRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MetaRef {}

impl Hash for MetaRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Debug for MetaRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&**self, f)
    }
}

/// Opaque handle to a managed heap object.
///
/// The cache stores these only in the resolved-references side array; it
/// never looks inside one. The collector may rewrite the underlying slots in
/// place, so two `Oop`s read from the same slot at different times may differ
/// even though they name the same object.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Oop(NonNull<()>);

unsafe impl Send for Oop {}
unsafe impl Sync for Oop {}

impl Oop {
    pub fn from_ptr(ptr: NonNull<()>) -> Self {
        Self(ptr)
    }

    pub fn from_static<T>(value: &'static T) -> Self {
        Self(NonNull::from(value).cast())
    }

    pub fn as_ptr(self) -> *mut () {
        self.0.as_ptr()
    }
}

impl Debug for Oop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "oop@{:p}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak(meta: Metadata) -> MetaRef {
        MetaRef::new(Box::leak(Box::new(meta)))
    }

    #[test]
    fn test_pointer_identity() {
        let a = leak(Metadata::Klass(Klass::new("A", KlassKind::Instance)));
        let b = leak(Metadata::Klass(Klass::new("A", KlassKind::Instance)));
        assert_eq!(a, a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_static_binding() {
        let holder = leak(Metadata::Klass(Klass::new("H", KlassKind::Instance)));
        let mut m = Method::new("m", holder, TosState::Void, 1);
        assert!(!m.can_be_statically_bound());
        m.is_final = true;
        assert!(m.can_be_statically_bound());
        m.is_final = false;
        m.is_static = true;
        assert!(m.can_be_statically_bound());
    }

    #[test]
    fn test_vtable_lookup() {
        let holder = leak(Metadata::Klass(Klass::new("H", KlassKind::Instance)));
        let m = leak(Metadata::Method(Method::new(
            "m",
            holder,
            TosState::Int,
            1,
        )));
        holder.expect_klass().set_vtable(vec![m]);
        assert_eq!(holder.expect_klass().method_at_vtable(0), Some(m));
        assert_eq!(holder.expect_klass().method_at_vtable(1), None);
    }

    #[test]
    fn test_array_is_not_instance() {
        let k = Klass::new("[I", KlassKind::Array);
        assert!(!k.is_instance());
        assert!(Klass::new("I", KlassKind::Interface).is_instance());
    }
}
