//! Shared fixtures: a small universe of classes, methods, and a constant
//! pool shaped like the output of class loading plus rewriting.
#![allow(dead_code)]

use jvm_rs::{
    Constant, ConstantPool, ConstantPoolCache, Klass, KlassKind, MetaRef, Metadata, Method, Oop,
    TosState,
};
use std::sync::Arc;

pub const FIELD_CP: u16 = 42;
pub const VIRTUAL_CP: u16 = 10;
pub const STATIC_CP: u16 = 11;
pub const INTERFACE_CP: u16 = 12;
pub const INDY_CP: u16 = 13;
pub const ARRAY_VIRTUAL_CP: u16 = 14;

pub fn leak(meta: Metadata) -> MetaRef {
    MetaRef::new(Box::leak(Box::new(meta)))
}

pub fn instance_klass(name: &str) -> MetaRef {
    leak(Metadata::Klass(Klass::new(name, KlassKind::Instance)))
}

pub fn interface_klass(name: &str) -> MetaRef {
    leak(Metadata::Klass(Klass::new(name, KlassKind::Interface)))
}

pub fn array_klass(name: &str) -> MetaRef {
    leak(Metadata::Klass(Klass::new(name, KlassKind::Array)))
}

pub fn method(name: &str, holder: MetaRef, result_type: TosState, parameter_size: u8) -> MetaRef {
    method_with(name, holder, result_type, parameter_size, |_| {})
}

pub fn method_with(
    name: &str,
    holder: MetaRef,
    result_type: TosState,
    parameter_size: u8,
    configure: impl FnOnce(&mut Method),
) -> MetaRef {
    let mut m = Method::new(name, holder, result_type, parameter_size);
    configure(&mut m);
    leak(Metadata::Method(m))
}

pub fn oop(value: u64) -> Oop {
    Oop::from_static(Box::leak(Box::new(value)))
}

/// A loaded-and-linked universe: a holder class, an interface, an array
/// class, and a constant pool whose class slots are already resolved.
pub struct Fixture {
    pub object: MetaRef,
    pub holder: MetaRef,
    pub iface: MetaRef,
    pub array: MetaRef,
    pub pool: Arc<ConstantPool>,
}

impl Fixture {
    pub fn new() -> Self {
        let object = instance_klass("java/lang/Object");
        let holder = instance_klass("demo/Holder");
        let iface = interface_klass("demo/Callable");
        let array = array_klass("[Ldemo/Holder;");

        let mut entries: Vec<Constant> = (0..64).map(|_| Constant::Unused).collect();
        entries[1] = Constant::class("demo/Holder");
        entries[2] = Constant::class("[Ldemo/Holder;");
        entries[3] = Constant::class("demo/Callable");
        entries[VIRTUAL_CP as usize] = Constant::MethodRef {
            class_index: 1,
            name: "run".into(),
            descriptor: "()V".into(),
        };
        entries[STATIC_CP as usize] = Constant::MethodRef {
            class_index: 1,
            name: "create".into(),
            descriptor: "()I".into(),
        };
        entries[INTERFACE_CP as usize] = Constant::InterfaceMethodRef {
            class_index: 3,
            name: "call".into(),
            descriptor: "()I".into(),
        };
        entries[INDY_CP as usize] = Constant::InvokeDynamic {
            bootstrap_index: 0,
            name: "apply".into(),
            descriptor: "()Ljava/lang/Runnable;".into(),
        };
        entries[ARRAY_VIRTUAL_CP as usize] = Constant::MethodRef {
            class_index: 2,
            name: "hashCode".into(),
            descriptor: "()I".into(),
        };
        entries[FIELD_CP as usize] = Constant::FieldRef {
            class_index: 1,
            name: "count".into(),
            descriptor: "I".into(),
        };

        let pool = Arc::new(ConstantPool::new(entries, object));
        pool.resolve_klass_at(1, holder);
        pool.resolve_klass_at(2, array);
        pool.resolve_klass_at(3, iface);

        Fixture {
            object,
            holder,
            iface,
            array,
            pool,
        }
    }

    pub fn cache(
        &self,
        inverse_index_map: &[u16],
        invokedynamic_references_map: &[Option<usize>],
    ) -> ConstantPoolCache {
        let mut cache = ConstantPoolCache::allocate(Arc::clone(&self.pool), inverse_index_map.len());
        cache
            .initialize(inverse_index_map, invokedynamic_references_map)
            .unwrap();
        cache
    }
}
