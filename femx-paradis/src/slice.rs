use crate::{ParallelIndexedAccess, ParallelIndexedCollection};
use std::marker::PhantomData;
use std::ops::Range;

/// Shared handle for writing disjoint parts of a mutable slice from several threads.
///
/// Used for scatter passes where each worker reserves its own slots through an atomic
/// cursor, and for filling row ranges of a compressed layout.
pub struct ParallelSliceAccess<'a, T> {
    ptr: *mut T,
    len: usize,
    marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> ParallelSliceAccess<'a, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Construct a mutable subslice for the given range.
    ///
    /// # Safety
    ///
    /// The range must lie within the slice, and no two threads may hold overlapping subslices
    /// (or records) at the same time.
    pub unsafe fn subslice_mut(&self, range: Range<usize>) -> &'a mut [T] {
        let Range { start, end } = range;
        debug_assert!(start <= end && end <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(start), end - start)
    }

    /// Raw pointer to the element at `index`, for atomic updates.
    ///
    /// Panics if `index` is out of bounds.
    pub fn ptr_at(&self, index: usize) -> *mut T {
        assert!(index < self.len, "index {} out of bounds for length {}", index, self.len);
        self.ptr.wrapping_add(index)
    }
}

impl<'a, T> Clone for ParallelSliceAccess<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for ParallelSliceAccess<'a, T> {}

unsafe impl<'a, T: Send + Sync> Sync for ParallelSliceAccess<'a, T> {}
unsafe impl<'a, T: Send + Sync> Send for ParallelSliceAccess<'a, T> {}

unsafe impl<'a, 'b, T: 'b + Sync + Send> ParallelIndexedAccess<'b> for ParallelSliceAccess<'a, T>
where
    'a: 'b,
{
    type Record = &'b T;
    type RecordMut = &'b mut T;

    unsafe fn get_unchecked(&self, index: usize) -> Self::Record {
        debug_assert!(index < self.len);
        &*self.ptr.add(index)
    }

    unsafe fn get_unchecked_mut(&self, index: usize) -> Self::RecordMut {
        debug_assert!(index < self.len);
        &mut *self.ptr.add(index)
    }
}

unsafe impl<'a, T: 'a + Sync + Send> ParallelIndexedCollection<'a> for [T] {
    type Access = ParallelSliceAccess<'a, T>;

    unsafe fn create_access(&'a mut self) -> Self::Access {
        ParallelSliceAccess {
            ptr: self.as_mut_ptr(),
            len: <[T]>::len(self),
            marker: PhantomData,
        }
    }

    fn len(&self) -> usize {
        <[T]>::len(self)
    }
}
