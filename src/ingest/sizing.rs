use bitcoin::Transaction;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Trait describing how many bytes a value contributes to the queue budget.
///
/// The queue suspends producers on this measure, so implementations should report retained memory
/// rather than wire length where the two differ.
pub trait ByteSized {
    /// Estimate the number of bytes retained while this value is buffered.
    fn byte_size(&self) -> usize;
}

impl ByteSized for () {
    fn byte_size(&self) -> usize {
        0
    }
}

impl ByteSized for u8 {
    fn byte_size(&self) -> usize {
        1
    }
}

macro_rules! impl_scalar_byte_size {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ByteSized for $ty {
                fn byte_size(&self) -> usize {
                    core::mem::size_of::<$ty>()
                }
            }
        )+
    };
}

impl_scalar_byte_size!(u16, u32, u64, usize, i16, i32, i64, isize);

impl<T: ByteSized + ?Sized> ByteSized for &T {
    fn byte_size(&self) -> usize {
        T::byte_size(self)
    }
}

impl<T: ByteSized + ?Sized> ByteSized for Box<T> {
    fn byte_size(&self) -> usize {
        (**self).byte_size()
    }
}

impl<T: ByteSized + ?Sized> ByteSized for Arc<T> {
    fn byte_size(&self) -> usize {
        (**self).byte_size()
    }
}

impl<T: ByteSized> ByteSized for Option<T> {
    fn byte_size(&self) -> usize {
        self.as_ref().map(ByteSized::byte_size).unwrap_or(0)
    }
}

impl ByteSized for [u8] {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSized for Bytes {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSized for BytesMut {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSized for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl<T: ByteSized> ByteSized for Vec<T> {
    fn byte_size(&self) -> usize {
        self.iter().map(ByteSized::byte_size).sum()
    }
}

impl ByteSized for Transaction {
    fn byte_size(&self) -> usize {
        self.total_size()
    }
}
