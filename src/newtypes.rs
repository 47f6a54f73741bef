use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteOffset(pub usize);

impl Display for ByteOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for ByteOffset {
    fn from(offset: usize) -> Self {
        ByteOffset(offset)
    }
}

impl From<ByteOffset> for usize {
    fn from(offset: ByteOffset) -> Self {
        offset.0
    }
}

impl ByteOffset {
    pub const ZERO: Self = ByteOffset(0);

    pub fn new(offset: usize) -> Self {
        ByteOffset(offset)
    }

    pub fn checked_add(self, other: impl Into<usize>) -> Option<Self> {
        self.0.checked_add(other.into()).map(ByteOffset)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl Add<usize> for ByteOffset {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        ByteOffset(self.0 + rhs)
    }
}

impl AddAssign<usize> for ByteOffset {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldIndex(pub usize);

impl Display for FieldIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for FieldIndex {
    fn from(index: usize) -> Self {
        FieldIndex(index)
    }
}

impl From<FieldIndex> for usize {
    fn from(index: FieldIndex) -> Self {
        index.0
    }
}

impl FieldIndex {
    pub fn new(index: usize) -> Self {
        FieldIndex(index)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}
