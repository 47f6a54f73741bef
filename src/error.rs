use thiserror::Error;

#[cfg(feature = "fuzzing")]
use arbitrary::Arbitrary;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "fuzzing", derive(Arbitrary))]
pub enum CacheError {
    #[error("inverse index map length {map} does not match cache length {cache}")]
    IndexMapLengthMismatch { map: usize, cache: usize },

    #[error("constant pool index {index} is not usable by cache entry {entry}")]
    InvalidPoolIndex { entry: usize, index: u16 },

    #[error("invokedynamic reference {reference} maps to out-of-bounds cache entry {entry}")]
    ReferenceEntryOutOfBounds { reference: usize, entry: usize },
}
