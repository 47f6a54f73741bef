//! The per-class cache of resolved constant pool references.
//!
//! One [`CacheEntry`] per rewritten bytecode site, in a fixed-length array
//! allocated at class link time. The container owns the side array of
//! appendix references for dynamic call sites and the lock their linkage
//! serializes on; everything else is per-entry and lives in [`entry`].

use crate::error::CacheError;
use crate::meta::{MetaRef, Metadata, Oop};
use crate::pool::ConstantPool;
use crate::sync::{Arc, AtomicPtr, Mutex, MutexGuard, Ordering};
use std::fmt::{Debug, Formatter};
use std::ptr::{self, NonNull};

mod entry;

pub use entry::CacheEntry;

/// Appendix slots for handle/dynamic call sites.
///
/// Each slot is written at most once, before its owning entry publishes, and
/// is otherwise touched only by the collector relocating the referenced
/// object in place.
pub struct ResolvedReferences {
    slots: Box<[AtomicPtr<()>]>,
}

impl ResolvedReferences {
    fn with_len(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Oop> {
        let raw = self.slots.get(index)?.load(Ordering::Relaxed);
        NonNull::new(raw).map(Oop::from_ptr)
    }

    pub(crate) fn set_once(&self, index: usize, value: Oop) {
        let slot = &self.slots[index];
        debug_assert!(
            slot.load(Ordering::Relaxed).is_null(),
            "appendix slot {index} written twice"
        );
        slot.store(value.as_ptr(), Ordering::Relaxed);
    }

    /// Collector interface: every slot that may hold a managed reference.
    /// Relocation writes back through the same atomics.
    pub fn slots(&self) -> impl Iterator<Item = &AtomicPtr<()>> + '_ {
        self.slots.iter()
    }
}

pub struct ConstantPoolCache {
    pool: Arc<ConstantPool>,
    entries: Box<[CacheEntry]>,
    resolved_references: ResolvedReferences,
    /// Serializes handle/dynamic call-site linkage; every other writer is
    /// serialized upstream by the resolver.
    linkage_lock: Mutex<()>,
}

impl ConstantPoolCache {
    /// Reserves `length` zeroed entries. All-zero is the unresolved state, so
    /// the cache is immediately safe to share, if useless until
    /// [`ConstantPoolCache::initialize`] runs.
    pub fn allocate(pool: Arc<ConstantPool>, length: usize) -> Self {
        Self {
            pool,
            entries: (0..length).map(|_| CacheEntry::unresolved()).collect(),
            resolved_references: ResolvedReferences::with_len(0),
            linkage_lock: Mutex::new(()),
        }
    }

    /// Populates every entry's constant pool index from the rewriter's
    /// inverse map and wires invokedynamic entries to their appendix slots.
    /// Runs once, before the cache may receive concurrent resolutions.
    pub fn initialize(
        &mut self,
        inverse_index_map: &[u16],
        invokedynamic_references_map: &[Option<usize>],
    ) -> Result<(), CacheError> {
        if inverse_index_map.len() != self.entries.len() {
            return Err(CacheError::IndexMapLengthMismatch {
                map: inverse_index_map.len(),
                cache: self.entries.len(),
            });
        }
        for (i, (entry, &cp_index)) in
            self.entries.iter().zip(inverse_index_map).enumerate()
        {
            if cp_index == 0 || cp_index as usize >= self.pool.len() {
                return Err(CacheError::InvalidPoolIndex {
                    entry: i,
                    index: cp_index,
                });
            }
            entry.initialize(cp_index);
        }

        self.resolved_references =
            ResolvedReferences::with_len(invokedynamic_references_map.len());
        for (ref_index, &target) in invokedynamic_references_map.iter().enumerate() {
            if let Some(entry) = target {
                let Some(e) = self.entries.get(entry) else {
                    return Err(CacheError::ReferenceEntryOutOfBounds {
                        reference: ref_index,
                        entry,
                    });
                };
                e.initialize_resolved_reference_index(ref_index);
            }
        }

        tracing::debug!(
            entries = self.entries.len(),
            references = self.resolved_references.len(),
            "initialized constant pool cache"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, index: usize) -> &CacheEntry {
        &self.entries[index]
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> + '_ {
        self.entries.iter()
    }

    pub fn constant_pool(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn resolved_references(&self) -> &ResolvedReferences {
        &self.resolved_references
    }

    pub(crate) fn lock_linkage(&self) -> MutexGuard<'_, ()> {
        self.linkage_lock.lock()
    }

    pub fn method_if_resolved(&self, index: usize) -> Option<MetaRef> {
        self.entry_at(index).method_if_resolved(&self.pool)
    }

    pub fn appendix_if_resolved(&self, index: usize) -> Option<Oop> {
        self.entry_at(index).appendix_if_resolved(self)
    }

    /// Redefinition support: wherever an entry points to one of
    /// `old_methods`, replace it with the corresponding new method. At most
    /// one replacement happens per entry. Returns the number of entries
    /// updated. Runs only while the world is stopped.
    pub fn adjust_method_entries(
        &self,
        old_methods: &[MetaRef],
        new_methods: &[MetaRef],
    ) -> usize {
        debug_assert_eq!(old_methods.len(), new_methods.len());
        let Some(first) = old_methods.first() else {
            return 0;
        };
        // Every replaced method comes from the one class being redefined.
        let old_holder = first.expect_method().holder;

        let mut updated = 0;
        let mut holder_logged = false;
        for entry in self.entries.iter() {
            if !entry.is_interesting_method_entry(Some(old_holder)) {
                continue;
            }
            for (&old, &new) in old_methods.iter().zip(new_methods) {
                if entry.adjust_method_entry(old, new) {
                    if !holder_logged {
                        tracing::debug!(
                            holder = old_holder.name(),
                            "adjusting cached methods of redefined class"
                        );
                        holder_logged = true;
                    }
                    updated += 1;
                    break;
                }
            }
        }
        updated
    }

    /// Diagnostic: no entry still points at a method superseded by
    /// redefinition.
    pub fn check_no_old_entries(&self) -> bool {
        self.entries.iter().all(|e| {
            !e.is_interesting_method_entry(None) || e.check_no_old_entries()
        })
    }

    /// Collector interface: the entry slots that may hold class or method
    /// pointers. Relocation writes back through the same atomics and must
    /// preserve non-nullness.
    pub fn metadata_slots(&self) -> impl Iterator<Item = &AtomicPtr<Metadata>> + '_ {
        self.entries.iter().map(|e| e.f1_slot())
    }

    /// Collector interface: the appendix slots.
    pub fn reference_slots(&self) -> impl Iterator<Item = &AtomicPtr<()>> + '_ {
        self.resolved_references.slots()
    }

    /// Diagnostic invariant sweep; cheap enough to run after bulk operations
    /// in debug builds.
    pub fn verify(&self) {
        for (i, entry) in self.entries.iter().enumerate() {
            assert!(
                entry.constant_pool_index() != 0,
                "entry {i} has no constant pool index"
            );
            if entry.has_appendix() {
                assert!(
                    entry.f2_as_index() < self.resolved_references.len(),
                    "entry {i} appendix slot out of range"
                );
            }
        }
    }
}

impl Debug for ConstantPoolCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "constant pool cache [{}]", self.entries.len())?;
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(f, "{i:4}  {entry:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Klass, KlassKind};
    use crate::pool::Constant;

    fn leak_klass(name: &str) -> MetaRef {
        MetaRef::new(Box::leak(Box::new(Metadata::Klass(Klass::new(
            name,
            KlassKind::Instance,
        )))))
    }

    fn pool() -> Arc<ConstantPool> {
        Arc::new(ConstantPool::new(
            vec![
                Constant::Unused,
                Constant::class("Holder"),
                Constant::MethodRef {
                    class_index: 1,
                    name: "run".into(),
                    descriptor: "()V".into(),
                },
                Constant::InvokeDynamic {
                    bootstrap_index: 0,
                    name: "apply".into(),
                    descriptor: "()Ljava/lang/Runnable;".into(),
                },
            ],
            leak_klass("java/lang/Object"),
        ))
    }

    #[test]
    fn test_initialize_assigns_indices() {
        let mut cache = ConstantPoolCache::allocate(pool(), 2);
        cache.initialize(&[2, 3], &[Some(1)]).unwrap();
        assert_eq!(cache.entry_at(0).constant_pool_index(), 2);
        assert_eq!(cache.entry_at(1).constant_pool_index(), 3);
        // the invokedynamic entry is wired to appendix slot 0
        assert_eq!(cache.entry_at(1).f2_as_index(), 0);
        assert_eq!(cache.resolved_references().len(), 1);
        cache.verify();
    }

    #[test]
    fn test_initialize_rejects_length_mismatch() {
        let mut cache = ConstantPoolCache::allocate(pool(), 2);
        assert_eq!(
            cache.initialize(&[2], &[]),
            Err(CacheError::IndexMapLengthMismatch { map: 1, cache: 2 })
        );
    }

    #[test]
    fn test_initialize_rejects_unusable_pool_index() {
        let mut cache = ConstantPoolCache::allocate(pool(), 1);
        assert_eq!(
            cache.initialize(&[0], &[]),
            Err(CacheError::InvalidPoolIndex { entry: 0, index: 0 })
        );
        assert_eq!(
            cache.initialize(&[9], &[]),
            Err(CacheError::InvalidPoolIndex { entry: 0, index: 9 })
        );
    }

    #[test]
    fn test_initialize_rejects_dangling_reference_entry() {
        let mut cache = ConstantPoolCache::allocate(pool(), 1);
        assert_eq!(
            cache.initialize(&[3], &[Some(4)]),
            Err(CacheError::ReferenceEntryOutOfBounds {
                reference: 0,
                entry: 4
            })
        );
    }

    #[test]
    fn test_resolved_references_single_assignment() {
        let refs = ResolvedReferences::with_len(2);
        assert_eq!(refs.get(0), None);
        let value = Oop::from_static(&42u64);
        refs.set_once(0, value);
        assert_eq!(refs.get(0), Some(value));
        assert_eq!(refs.get(1), None);
        assert_eq!(refs.get(2), None);
    }

    #[test]
    fn test_relocation_writes_preserve_resolutions() {
        use crate::bytecode::{Bytecode, TosState};
        use crate::meta::Method;

        let mut cache = ConstantPoolCache::allocate(pool(), 1);
        cache.initialize(&[2], &[]).unwrap();

        let holder = leak_klass("Holder");
        let m = MetaRef::new(Box::leak(Box::new(Metadata::Method(Method::new(
            "run",
            holder,
            TosState::Void,
            1,
        )))));
        cache.entry_at(0).set_method(Bytecode::InvokeStatic, m, None);

        // a moving collector rewrites each slot in place; here the "moved"
        // metadata happens to be at the same address
        for slot in cache.metadata_slots() {
            let current = slot.load(Ordering::Relaxed);
            if !current.is_null() {
                slot.store(current, Ordering::Relaxed);
            }
        }
        assert_eq!(cache.method_if_resolved(0), Some(m));
    }

    #[test]
    fn test_slot_walks_cover_every_entry() {
        let mut cache = ConstantPoolCache::allocate(pool(), 2);
        cache.initialize(&[2, 3], &[Some(1)]).unwrap();
        assert_eq!(cache.metadata_slots().count(), 2);
        assert_eq!(cache.reference_slots().count(), 1);
    }
}
