//! One cached member resolution.
//!
//! An entry is four machine words written by one resolving thread and read by
//! any number of interpreter threads without locks. The protocol that makes
//! this sound:
//!
//! * Writers store every other word before the word that publishes the entry,
//!   and the publishing store has release ordering. For field and direct-call
//!   entries the publishing store is the bytecode merged into `indices`; for
//!   handle/dynamic entries it is `f1` itself, followed by the bytecode.
//! * Readers load the bytecode and `f1` with acquire ordering and treat a
//!   zero bytecode or a null `f1` as "unresolved". Only after that test may
//!   the remaining words be read with plain loads.
//!
//! Concurrent writers of the same entry are serialized by the resolver,
//! except for handle/dynamic linkage, which serializes on the cache's own
//! lock. The only in-place mutation after publication is the redefinition
//! walk, which runs while the world is stopped.

use super::ConstantPoolCache;
use crate::bytecode::{Bytecode, TosState};
use crate::meta::{MetaRef, Metadata, Oop};
use crate::newtypes::{ByteOffset, FieldIndex};
use crate::pool::ConstantPool;
use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use std::fmt::{Debug, Formatter};
use std::ptr;

// Layout of `indices`: [ bytecode_2:8 | bytecode_1:8 | cp_index:16 ].
const CP_INDEX_MASK: usize = 0xffff;
const BYTECODE_1_SHIFT: u32 = 16;
const BYTECODE_2_SHIFT: u32 = 24;
const BYTECODE_MASK: usize = 0xff;

// Layout of `flags`: [ tos:4 @28 | option bits @20..25 | field index or
// parameter size in the low 16 ]. Bits 16..20 and 25..28 are unused.
const TOS_STATE_SHIFT: u32 = 28;
const TOS_STATE_MASK: usize = 0xf;
const IS_VFINAL_SHIFT: u32 = 20;
const IS_VOLATILE_SHIFT: u32 = 21;
const IS_FINAL_SHIFT: u32 = 22;
const IS_FORCED_VIRTUAL_SHIFT: u32 = 23;
const HAS_APPENDIX_SHIFT: u32 = 24;
const FIELD_INDEX_MASK: usize = 0xffff;
const PARAMETER_SIZE_MASK: usize = 0xff;

pub struct CacheEntry {
    indices: AtomicUsize,
    /// The publication sentinel: a class for field and interface entries, a
    /// method for direct, handle and dynamic entries, null otherwise.
    f1: AtomicPtr<Metadata>,
    /// Field byte offset, vtable index, itable index, resolved-references
    /// index, or an exposed method pointer when `is_vfinal` is set.
    f2: AtomicUsize,
    flags: AtomicUsize,
}

impl CacheEntry {
    /// All-zero is the unresolved state for every word.
    pub(crate) const fn unresolved() -> Self {
        Self {
            indices: AtomicUsize::new(0),
            f1: AtomicPtr::new(ptr::null_mut()),
            f2: AtomicUsize::new(0),
            flags: AtomicUsize::new(0),
        }
    }

    /// Records which constant pool slot this entry caches. Happens once, at
    /// rewrite time, before the entry is visible to any other thread.
    pub(crate) fn initialize(&self, cp_index: u16) {
        debug_assert!(cp_index > 0, "constant pool slot 0 is not usable");
        debug_assert_eq!(
            self.indices.load(Ordering::Relaxed),
            0,
            "entry initialized twice"
        );
        self.indices.store(cp_index as usize, Ordering::Relaxed);
    }

    /// Pre-wires `f2` with this entry's slot in the resolved-references
    /// array, before any resolution can run.
    pub(crate) fn initialize_resolved_reference_index(&self, ref_index: usize) {
        debug_assert_eq!(self.f2.load(Ordering::Relaxed), 0, "f2 already in use");
        self.f2.store(ref_index, Ordering::Relaxed);
    }

    pub fn constant_pool_index(&self) -> u16 {
        (self.indices.load(Ordering::Relaxed) & CP_INDEX_MASK) as u16
    }

    pub fn bytecode_1(&self) -> Option<Bytecode> {
        let raw = (self.indices.load(Ordering::Acquire) >> BYTECODE_1_SHIFT) & BYTECODE_MASK;
        Bytecode::from_raw(raw as u8)
    }

    pub fn bytecode_2(&self) -> Option<Bytecode> {
        let raw = (self.indices.load(Ordering::Acquire) >> BYTECODE_2_SHIFT) & BYTECODE_MASK;
        Bytecode::from_raw(raw as u8)
    }

    /// The interpreter's fast-path gate: has this site been resolved for the
    /// given bytecode?
    pub fn is_resolved(&self, code: Bytecode) -> bool {
        self.bytecode_1() == Some(code) || self.bytecode_2() == Some(code)
    }

    fn set_bytecode_1(&self, code: Bytecode) {
        let current = self.bytecode_1();
        debug_assert!(
            current.is_none() || current == Some(code),
            "bytecode_1 update must be consistent"
        );
        // The release fences the stores to f1/f2/flags; a reader that sees
        // the code sees them too.
        self.indices.fetch_or(
            (code.as_raw() as usize) << BYTECODE_1_SHIFT,
            Ordering::Release,
        );
    }

    fn set_bytecode_2(&self, code: Bytecode) {
        let current = self.bytecode_2();
        debug_assert!(
            current.is_none() || current == Some(code),
            "bytecode_2 update must be consistent"
        );
        self.indices.fetch_or(
            (code.as_raw() as usize) << BYTECODE_2_SHIFT,
            Ordering::Release,
        );
    }

    pub fn f1(&self) -> Option<MetaRef> {
        // SAFETY: the slot holds null or a pointer installed by a setter,
        // and metadata outlives the cache.
        unsafe { MetaRef::from_ptr(self.f1.load(Ordering::Acquire)) }
    }

    pub fn is_f1_null(&self) -> bool {
        self.f1.load(Ordering::Acquire).is_null()
    }

    fn set_f1(&self, meta: MetaRef) {
        let prev = self.f1.load(Ordering::Relaxed);
        debug_assert!(
            prev.is_null() || prev == meta.as_ptr(),
            "illegal overwrite of cache entry f1"
        );
        self.f1.store(meta.as_ptr(), Ordering::Relaxed);
    }

    /// Publishes `f1`, fencing all earlier stores to this entry.
    fn release_set_f1(&self, meta: MetaRef) {
        self.f1.store(meta.as_ptr(), Ordering::Release);
    }

    fn set_f2(&self, value: usize) {
        let prev = self.f2.load(Ordering::Relaxed);
        debug_assert!(
            prev == 0 || prev == value,
            "illegal overwrite of cache entry f2"
        );
        self.f2.store(value, Ordering::Relaxed);
    }

    fn set_f2_as_vfinal_method(&self, method: MetaRef) {
        debug_assert!(method.is_method());
        debug_assert!(self.is_vfinal(), "flags must be written before the method word");
        self.set_f2(method.as_ptr().expose_provenance());
    }

    pub fn f2_as_index(&self) -> usize {
        debug_assert!(!self.is_vfinal());
        self.f2.load(Ordering::Relaxed)
    }

    pub fn f2_as_field_offset(&self) -> ByteOffset {
        ByteOffset::new(self.f2.load(Ordering::Relaxed))
    }

    pub fn f2_as_vtable_index(&self) -> usize {
        self.f2_as_index()
    }

    pub fn f2_as_itable_index(&self) -> usize {
        self.f2_as_index()
    }

    pub fn f2_as_vfinal_method(&self) -> MetaRef {
        debug_assert!(self.is_vfinal());
        let addr = self.f2.load(Ordering::Relaxed);
        // SAFETY: vfinal entries hold an exposed method pointer in f2.
        unsafe { MetaRef::from_ptr(ptr::with_exposed_provenance_mut(addr)) }
            .expect("vfinal entry with null method word")
    }

    fn make_flags(
        &self,
        state: TosState,
        option_bits: usize,
        field_index_or_parameter_size: usize,
    ) -> usize {
        let f = ((state.as_bits() as usize) << TOS_STATE_SHIFT)
            | option_bits
            | field_index_or_parameter_size;
        // A second resolution of a shared entry must agree on the stack
        // category; the packed word keeps whatever bits are already set.
        debug_assert!(
            self.flags.load(Ordering::Relaxed) >> TOS_STATE_SHIFT == 0
                || self.flag_state() == state,
            "inconsistent stack category"
        );
        self.flags.load(Ordering::Relaxed) | f
    }

    /// First write wins, via a compare-and-swap from zero. A bare parameter
    /// size recorded earlier by [`CacheEntry::set_parameter_size`] is
    /// upgraded to the full packed word; any other mismatch keeps the
    /// existing value.
    fn set_flags(&self, new_flags: usize) {
        if let Err(existing) =
            self.flags
                .compare_exchange(0, new_flags, Ordering::Relaxed, Ordering::Relaxed)
        {
            if existing == new_flags {
                return;
            }
            if existing & !PARAMETER_SIZE_MASK == 0
                && existing == new_flags & PARAMETER_SIZE_MASK
            {
                self.flags.store(new_flags, Ordering::Relaxed);
            } else {
                debug_assert!(
                    false,
                    "inconsistent cache entry flags: {existing:#x} vs {new_flags:#x}"
                );
            }
        }
    }

    fn set_field_flags(&self, field_type: TosState, option_bits: usize, field_index: FieldIndex) {
        debug_assert_eq!(
            field_index.as_usize() & FIELD_INDEX_MASK,
            field_index.as_usize(),
            "field index does not fit in the low flag bits"
        );
        self.set_flags(self.make_flags(field_type, option_bits, field_index.as_usize()));
    }

    fn set_method_flags(&self, return_type: TosState, option_bits: usize, parameter_size: usize) {
        debug_assert_eq!(
            parameter_size & PARAMETER_SIZE_MASK,
            parameter_size,
            "parameter size out of range"
        );
        self.set_flags(self.make_flags(return_type, option_bits, parameter_size));
    }

    fn option_bit(&self, shift: u32) -> bool {
        (self.flags.load(Ordering::Relaxed) >> shift) & 1 != 0
    }

    /// Once set this stays set: clearing it would turn the method pointer in
    /// f2 back into a table index and dangle it.
    pub fn is_vfinal(&self) -> bool {
        self.option_bit(IS_VFINAL_SHIFT)
    }

    pub fn is_volatile(&self) -> bool {
        self.option_bit(IS_VOLATILE_SHIFT)
    }

    pub fn is_final(&self) -> bool {
        self.option_bit(IS_FINAL_SHIFT)
    }

    pub fn is_forced_virtual(&self) -> bool {
        self.option_bit(IS_FORCED_VIRTUAL_SHIFT)
    }

    pub fn has_appendix(&self) -> bool {
        self.option_bit(HAS_APPENDIX_SHIFT)
    }

    pub fn flag_state(&self) -> TosState {
        let bits = (self.flags.load(Ordering::Relaxed) >> TOS_STATE_SHIFT) & TOS_STATE_MASK;
        TosState::from_bits(bits as u8).expect("invalid stack category bits")
    }

    pub fn parameter_size(&self) -> u8 {
        (self.flags.load(Ordering::Relaxed) & PARAMETER_SIZE_MASK) as u8
    }

    pub fn field_index(&self) -> FieldIndex {
        FieldIndex::new(self.flags.load(Ordering::Relaxed) & FIELD_INDEX_MASK)
    }

    /// Caches a resolved field reference. Either bytecode may be absent when
    /// only one access direction occurs in the method body.
    #[allow(clippy::too_many_arguments)]
    pub fn set_field(
        &self,
        get_code: Option<Bytecode>,
        put_code: Option<Bytecode>,
        field_holder: MetaRef,
        field_index: FieldIndex,
        field_offset: ByteOffset,
        field_type: TosState,
        is_final: bool,
        is_volatile: bool,
    ) {
        debug_assert!(field_holder.is_klass());
        debug_assert!(get_code.is_none_or(|c| c.is_field_access()));
        debug_assert!(put_code.is_none_or(|c| c.is_field_access()));
        self.set_f1(field_holder);
        self.set_f2(field_offset.as_usize());
        self.set_field_flags(
            field_type,
            ((is_volatile as usize) << IS_VOLATILE_SHIFT)
                | ((is_final as usize) << IS_FINAL_SHIFT),
            field_index,
        );
        if let Some(code) = get_code {
            self.set_bytecode_1(code);
        }
        if let Some(code) = put_code {
            self.set_bytecode_2(code);
        }
    }

    /// Records only the parameter size, ahead of full resolution. Used when a
    /// suspended frame must be re-entered before its call site has been
    /// resolved again.
    ///
    /// Publishing on our own is only safe while the flags word is still zero;
    /// if another thread has initialized the entry in the interim we merely
    /// check agreement.
    pub fn set_parameter_size(&self, value: u8) {
        if self.flags.load(Ordering::Relaxed) == 0 {
            let _ = self.flags.compare_exchange(
                0,
                value as usize & PARAMETER_SIZE_MASK,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
        assert_eq!(
            self.parameter_size(),
            value,
            "parameter size must not change"
        );
    }

    /// Caches a resolved call. `vtable_index` is consulted only when the
    /// method cannot be statically bound.
    ///
    /// An `invokeinterface` that resolved to a non-interface method (one
    /// declared on the root object class) is stored as a virtual entry with
    /// `is_forced_virtual` set. Its `bytecode_1` is written only when the
    /// method is public; otherwise every caller must re-resolve the site.
    pub fn set_method(&self, invoke_code: Bytecode, method: MetaRef, vtable_index: Option<usize>) {
        let m = method.expect_method();
        debug_assert!(!m.is_old(), "attempt to cache a superseded method");

        match invoke_code {
            Bytecode::InvokeInterface | Bytecode::InvokeVirtual => {
                let forced_virtual = invoke_code == Bytecode::InvokeInterface;
                if m.can_be_statically_bound() {
                    self.set_method_flags(
                        m.result_type,
                        (1 << IS_VFINAL_SHIFT)
                            | ((m.is_final as usize) << IS_FINAL_SHIFT)
                            | ((forced_virtual as usize) << IS_FORCED_VIRTUAL_SHIFT),
                        m.parameter_size as usize,
                    );
                    self.set_f2_as_vfinal_method(method);
                } else {
                    debug_assert!(!m.is_final);
                    let index =
                        vtable_index.expect("non-statically-bound method needs a vtable index");
                    self.set_method_flags(
                        m.result_type,
                        (forced_virtual as usize) << IS_FORCED_VIRTUAL_SHIFT,
                        m.parameter_size as usize,
                    );
                    self.set_f2(index);
                }
                if forced_virtual && m.is_public {
                    self.set_bytecode_1(invoke_code);
                }
                // Dispatch as invokevirtual even when linking for
                // invokeinterface as well.
                self.set_bytecode_2(Bytecode::InvokeVirtual);
            }
            Bytecode::InvokeSpecial | Bytecode::InvokeStatic => {
                // Preserve is_vfinal on an entry shared with an invokevirtual
                // bytecode; resetting it would dangle the f2 method pointer.
                self.set_method_flags(
                    m.result_type,
                    ((self.is_vfinal() as usize) << IS_VFINAL_SHIFT)
                        | ((m.is_final as usize) << IS_FINAL_SHIFT),
                    m.parameter_size as usize,
                );
                self.set_f1(method);
                self.set_bytecode_1(invoke_code);
            }
            _ => unreachable!("{invoke_code:?} does not resolve through the cache"),
        }
    }

    /// Caches an interface call that stays an interface call: `f1` names the
    /// declaring interface, `f2` its itable slot.
    pub fn set_interface_call(&self, method: MetaRef, itable_index: usize) {
        let m = method.expect_method();
        let interface = m.holder;
        debug_assert!(interface.expect_klass().is_interface());
        debug_assert!(!m.is_final, "interfaces cannot declare final methods");
        self.set_f1(interface);
        self.set_f2(itable_index);
        self.set_method_flags(m.result_type, 0, m.parameter_size as usize);
        self.set_bytecode_1(Bytecode::InvokeInterface);
    }

    pub fn set_method_handle(
        &self,
        cache: &ConstantPoolCache,
        adapter: MetaRef,
        appendix: Option<Oop>,
    ) {
        self.set_method_handle_common(cache, Bytecode::InvokeHandle, adapter, appendix);
    }

    pub fn set_dynamic_call(
        &self,
        cache: &ConstantPoolCache,
        adapter: MetaRef,
        appendix: Option<Oop>,
    ) {
        self.set_method_handle_common(cache, Bytecode::InvokeDynamic, adapter, appendix);
    }

    /// This entry can be the subject of data races: user code runs during
    /// call-site bootstrap, so competing resolutions cannot be serialized
    /// upstream. Three words are updated (flags, refs[f2], f1) in that
    /// order, f1 last. Competing writers take the cache's linkage lock; a
    /// loser blocks until the winner has stored f1 and left, then finds the
    /// entry linked and keeps the winner's result.
    fn set_method_handle_common(
        &self,
        cache: &ConstantPoolCache,
        invoke_code: Bytecode,
        adapter: MetaRef,
        appendix: Option<Oop>,
    ) {
        let _linkage = cache.lock_linkage();
        if !self.is_f1_null() {
            return;
        }

        let m = adapter.expect_method();
        let has_appendix = appendix.is_some();
        self.set_method_flags(
            m.result_type,
            ((has_appendix as usize) << HAS_APPENDIX_SHIFT) | (1 << IS_FINAL_SHIFT),
            m.parameter_size as usize,
        );

        // refs[f2] carries the trailing argument handed to the adapter,
        // commonly the call site's type descriptor or the call-site object.
        // The appendix slot is counted in the adapter's parameter size.
        if let Some(appendix) = appendix {
            cache.resolved_references().set_once(self.f2_as_index(), appendix);
        }

        // Must be the last word stored.
        self.release_set_f1(adapter);
        // The fast path does not dispatch on bytecode_1 here, but decoding
        // and is_resolved do.
        self.set_bytecode_1(invoke_code);

        tracing::trace!(
            code = ?invoke_code,
            adapter = ?adapter,
            has_appendix,
            "linked call site"
        );
    }

    /// Decodes the action of `set_method` and `set_interface_call`: which
    /// method, if any, is currently cached here?
    pub fn method_if_resolved(&self, cpool: &ConstantPool) -> Option<MetaRef> {
        if let Some(invoke_code) = self.bytecode_1() {
            if let Some(f1) = self.f1() {
                match invoke_code {
                    Bytecode::InvokeInterface => {
                        debug_assert!(f1.is_klass());
                        return f1
                            .as_klass()
                            .and_then(|k| k.method_for_itable_index(self.f2_as_itable_index()));
                    }
                    Bytecode::InvokeStatic | Bytecode::InvokeSpecial => {
                        debug_assert!(!self.has_appendix());
                        debug_assert!(f1.is_method());
                        return Some(f1);
                    }
                    Bytecode::InvokeHandle | Bytecode::InvokeDynamic => {
                        debug_assert!(f1.is_method());
                        return Some(f1);
                    }
                    _ => {}
                }
            }
        }
        if self.bytecode_2() == Some(Bytecode::InvokeVirtual) {
            if self.is_vfinal() {
                return Some(self.f2_as_vfinal_method());
            }
            let holder_index = cpool.uncached_klass_ref_index_at(self.constant_pool_index())?;
            // The class may have been unloaded by a concurrent redefinition;
            // an unresolved holder slot is an ordinary miss.
            if cpool.tag_at(holder_index).is_klass() {
                let mut klass = cpool.resolved_klass_at(holder_index)?;
                if !klass.expect_klass().is_instance() {
                    // Array receivers dispatch through the root object class;
                    // arrays carry no method table of their own.
                    klass = cpool.object_klass();
                }
                return klass
                    .expect_klass()
                    .method_at_vtable(self.f2_as_vtable_index());
            }
        }
        None
    }

    /// The trailing argument recorded for a handle/dynamic call site, if the
    /// site is linked and has one.
    pub fn appendix_if_resolved(&self, cache: &ConstantPoolCache) -> Option<Oop> {
        if self.is_f1_null() || !self.has_appendix() {
            return None;
        }
        cache.resolved_references().get(self.f2_as_index())
    }

    /// Redefinition support: if this entry refers to `old_method`, swap in
    /// `new_method`. The replacement is call-compatible, so no other field
    /// changes. Runs only while the world is stopped.
    pub fn adjust_method_entry(&self, old_method: MetaRef, new_method: MetaRef) -> bool {
        if self.is_vfinal() {
            // f2 carries the method pointer instead of a vtable index
            if self.f2_as_vfinal_method() == old_method {
                self.f2
                    .store(new_method.as_ptr().expose_provenance(), Ordering::Release);
                tracing::trace!(old = ?old_method, new = ?new_method, "updated vfinal entry");
                return true;
            }
            return false;
        }
        match self.f1() {
            // null f1 means a vtable-indexed virtual entry; the vtable itself
            // is rewritten elsewhere
            None => false,
            Some(f1) if f1 == old_method => {
                self.f1.store(new_method.as_ptr(), Ordering::Release);
                tracing::trace!(old = ?old_method, new = ?new_method, "updated method entry");
                true
            }
            Some(_) => false,
        }
    }

    /// Does this entry hold a method defined by `klass` (any method, when
    /// `klass` is `None`)? Field entries and vtable-indexed virtual entries
    /// never qualify.
    pub fn is_interesting_method_entry(&self, klass: Option<MetaRef>) -> bool {
        let m = if self.is_vfinal() {
            self.f2_as_vfinal_method()
        } else {
            match self.f1() {
                None => return false,
                Some(f1) if f1.is_method() => f1,
                // f1 can also hold a class, for field and interface entries
                Some(_) => return false,
            }
        };
        match m.as_method() {
            Some(method) => klass.is_none_or(|k| method.holder == k),
            None => false,
        }
    }

    /// Diagnostic: true when this method entry holds no pointer to a
    /// superseded method. Callers filter with
    /// [`CacheEntry::is_interesting_method_entry`] first.
    pub(crate) fn check_no_old_entries(&self) -> bool {
        if self.is_vfinal() {
            self.f2_as_vfinal_method()
                .as_method()
                .is_some_and(|m| !m.is_old())
        } else {
            match self.f1() {
                None => true,
                Some(f1) => f1.as_method().is_some_and(|m| !m.is_old()),
            }
        }
    }

    pub(crate) fn f1_slot(&self) -> &AtomicPtr<Metadata> {
        &self.f1
    }
}

impl Debug for CacheEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let indices = self.indices.load(Ordering::Relaxed);
        write!(
            f,
            "[{:02x}|{:02x}|{:5}] f1={:p} f2={:#014x} flags={:#010x}",
            (indices >> BYTECODE_2_SHIFT) & BYTECODE_MASK,
            (indices >> BYTECODE_1_SHIFT) & BYTECODE_MASK,
            indices & CP_INDEX_MASK,
            self.f1.load(Ordering::Relaxed),
            self.f2.load(Ordering::Relaxed),
            self.flags.load(Ordering::Relaxed),
        )
    }
}
