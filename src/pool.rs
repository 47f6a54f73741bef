//! The constant pool: a class file's table of symbolic references.
//!
//! Only the entry kinds the resolution cache consults are modeled; constants
//! the interpreter loads directly (numbers, strings) never flow through the
//! cache and are out of scope here.

use crate::meta::MetaRef;
use crate::sync::{AtomicPtr, Ordering};
use std::fmt::{Debug, Formatter};
use std::ptr;

pub enum Constant {
    /// Slot 0, and the trailing slot of an 8-byte constant.
    Unused,
    Class {
        name: String,
        /// Filled in once when the named class is loaded and linked.
        resolved: AtomicPtr<crate::meta::Metadata>,
    },
    FieldRef {
        class_index: u16,
        name: String,
        descriptor: String,
    },
    MethodRef {
        class_index: u16,
        name: String,
        descriptor: String,
    },
    InterfaceMethodRef {
        class_index: u16,
        name: String,
        descriptor: String,
    },
    InvokeDynamic {
        bootstrap_index: u16,
        name: String,
        descriptor: String,
    },
}

impl Constant {
    pub fn class(name: impl Into<String>) -> Self {
        Constant::Class {
            name: name.into(),
            resolved: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tag {
    Unused,
    /// A class slot whose metadata has been resolved.
    Klass,
    /// A class slot still holding only a symbolic name.
    UnresolvedKlass,
    FieldRef,
    MethodRef,
    InterfaceMethodRef,
    InvokeDynamic,
}

impl Tag {
    pub fn is_klass(self) -> bool {
        self == Tag::Klass
    }
}

pub struct ConstantPool {
    entries: Box<[Constant]>,
    /// Root of the class hierarchy; virtual dispatch on an array receiver is
    /// redirected here.
    object_klass: MetaRef,
}

impl ConstantPool {
    pub fn new(entries: Vec<Constant>, object_klass: MetaRef) -> Self {
        debug_assert!(matches!(entries.first(), None | Some(Constant::Unused)));
        debug_assert!(object_klass.is_klass());
        Self {
            entries: entries.into_boxed_slice(),
            object_klass,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn object_klass(&self) -> MetaRef {
        self.object_klass
    }

    pub fn tag_at(&self, index: u16) -> Tag {
        match self.entries.get(index as usize) {
            None | Some(Constant::Unused) => Tag::Unused,
            Some(Constant::Class { resolved, .. }) => {
                if resolved.load(Ordering::Acquire).is_null() {
                    Tag::UnresolvedKlass
                } else {
                    Tag::Klass
                }
            }
            Some(Constant::FieldRef { .. }) => Tag::FieldRef,
            Some(Constant::MethodRef { .. }) => Tag::MethodRef,
            Some(Constant::InterfaceMethodRef { .. }) => Tag::InterfaceMethodRef,
            Some(Constant::InvokeDynamic { .. }) => Tag::InvokeDynamic,
        }
    }

    /// The class slot named by the member reference at `index`, straight from
    /// the class file, bypassing any cache indirection.
    pub fn uncached_klass_ref_index_at(&self, index: u16) -> Option<u16> {
        match self.entries.get(index as usize)? {
            Constant::FieldRef { class_index, .. }
            | Constant::MethodRef { class_index, .. }
            | Constant::InterfaceMethodRef { class_index, .. } => Some(*class_index),
            _ => None,
        }
    }

    pub fn resolved_klass_at(&self, index: u16) -> Option<MetaRef> {
        match self.entries.get(index as usize)? {
            Constant::Class { resolved, .. } => {
                // SAFETY: the slot only ever holds null or a pointer to class
                // metadata that outlives this pool.
                unsafe { MetaRef::from_ptr(resolved.load(Ordering::Acquire)) }
            }
            _ => None,
        }
    }

    /// Records the outcome of class resolution. Called at link time; later
    /// calls for the same slot must agree.
    pub fn resolve_klass_at(&self, index: u16, klass: MetaRef) {
        debug_assert!(klass.is_klass());
        match self.entries.get(index as usize) {
            Some(Constant::Class { resolved, .. }) => {
                let prev = resolved.swap(klass.as_ptr(), Ordering::Release);
                debug_assert!(
                    prev.is_null() || prev == klass.as_ptr(),
                    "class slot {index} re-resolved to a different class"
                );
            }
            _ => panic!("constant pool slot {index} is not a class"),
        }
    }

    pub fn name_at(&self, index: u16) -> Option<&str> {
        match self.entries.get(index as usize)? {
            Constant::Unused => None,
            Constant::Class { name, .. }
            | Constant::FieldRef { name, .. }
            | Constant::MethodRef { name, .. }
            | Constant::InterfaceMethodRef { name, .. }
            | Constant::InvokeDynamic { name, .. } => Some(name),
        }
    }
}

impl Debug for ConstantPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (i, entry) in self.entries.iter().enumerate() {
            let tag = self.tag_at(i as u16);
            match entry {
                Constant::Unused => continue,
                _ => map.entry(&i, &(tag, self.name_at(i as u16).unwrap_or(""))),
            };
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Klass, KlassKind, Metadata};

    fn leak_klass(name: &str) -> MetaRef {
        MetaRef::new(Box::leak(Box::new(Metadata::Klass(Klass::new(
            name,
            KlassKind::Instance,
        )))))
    }

    fn pool() -> (ConstantPool, MetaRef) {
        let object = leak_klass("java/lang/Object");
        let pool = ConstantPool::new(
            vec![
                Constant::Unused,
                Constant::class("Holder"),
                Constant::FieldRef {
                    class_index: 1,
                    name: "count".into(),
                    descriptor: "I".into(),
                },
                Constant::MethodRef {
                    class_index: 1,
                    name: "run".into(),
                    descriptor: "()V".into(),
                },
            ],
            object,
        );
        (pool, object)
    }

    #[test]
    fn test_tags_track_resolution() {
        let (pool, _) = pool();
        assert_eq!(pool.tag_at(1), Tag::UnresolvedKlass);
        assert!(!pool.tag_at(1).is_klass());

        let holder = leak_klass("Holder");
        pool.resolve_klass_at(1, holder);
        assert_eq!(pool.tag_at(1), Tag::Klass);
        assert_eq!(pool.resolved_klass_at(1), Some(holder));
    }

    #[test]
    fn test_member_refs_name_their_class_slot() {
        let (pool, _) = pool();
        assert_eq!(pool.uncached_klass_ref_index_at(2), Some(1));
        assert_eq!(pool.uncached_klass_ref_index_at(3), Some(1));
        assert_eq!(pool.uncached_klass_ref_index_at(1), None);
        assert_eq!(pool.uncached_klass_ref_index_at(0), None);
    }

    #[test]
    fn test_out_of_range_is_unused() {
        let (pool, _) = pool();
        assert_eq!(pool.tag_at(99), Tag::Unused);
        assert_eq!(pool.resolved_klass_at(99), None);
    }
}
