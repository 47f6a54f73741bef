//! # jvm-rs
//!
//! Member-resolution records for a class-file bytecode interpreter: the
//! per-class constant pool cache, the entry publication protocol that lets
//! interpreter threads read resolutions without locks, and the metadata
//! vocabulary the cache stores.
//!
//! The symbolic resolver, the bytecode rewriter, and the dispatch loop are
//! collaborators; they drive the typed setters and read the entries through
//! the decode operations exposed here.

pub mod bytecode;
pub mod cache;
pub mod error;
pub mod meta;
pub mod newtypes;
pub mod pool;
pub mod sync;

pub use bytecode::{Bytecode, TosState};
pub use cache::{CacheEntry, ConstantPoolCache, ResolvedReferences};
pub use error::CacheError;
pub use meta::{Klass, KlassKind, MetaRef, Metadata, Method, Oop};
pub use newtypes::{ByteOffset, FieldIndex};
pub use pool::{Constant, ConstantPool, Tag};
