//! A compact "vector of vectors".
//!
//! `NestedVec` stores a sequence of arrays back to back in a single allocation, with an offset
//! table marking where each array begins. It is the storage used for element-to-dof incidence
//! tables and their dof-to-element inverses.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::ops::Range;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedVec<T> {
    data: Vec<T>,
    // Always holds `len() + 1` entries, starting at zero
    offsets: Vec<usize>,
}

impl<T: Debug> Debug for NestedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Default for NestedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NestedVec<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            offsets: vec![0],
        }
    }

    /// Construct from a compressed offset table and the concatenated array data.
    ///
    /// Panics if `offsets` is empty, does not start at zero, is not monotonically increasing
    /// or does not end at `data.len()`.
    pub fn from_offsets_and_data(offsets: Vec<usize>, data: Vec<T>) -> Self {
        assert_eq!(offsets.first(), Some(&0), "Offsets must start at zero.");
        assert_eq!(
            offsets.last(),
            Some(&data.len()),
            "Last offset must equal the number of elements."
        );
        assert!(
            offsets.windows(2).all(|w| w[0] <= w[1]),
            "Offsets must be monotonically increasing."
        );
        Self { data, offsets }
    }

    /// Return a data structure that can be used for appending single elements to the same array.
    /// When the returned data structure is dropped, the result is equivalent to
    /// adding the array at once with `NestedVec::push`.
    pub fn begin_array<'a>(&'a mut self) -> ArrayAppender<'a, T> {
        let initial_count = self.data.len();
        ArrayAppender {
            initial_count,
            data: &mut self.data,
            offsets: &mut self.offsets,
        }
    }

    pub fn iter<'a>(&'a self) -> impl 'a + ExactSizeIterator<Item = &'a [T]> {
        self.offsets.windows(2).map(move |w| &self.data[w[0]..w[1]])
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over all elements inside all arrays.
    pub fn iter_array_elements<'a>(&'a self) -> impl 'a + Iterator<Item = &'a T> {
        self.data.iter()
    }

    pub fn total_num_elements(&self) -> usize {
        self.data.len()
    }

    /// The offset table. Array `i` occupies `offsets()[i] .. offsets()[i + 1]` of `data()`.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn get(&self, index: usize) -> Option<&[T]> {
        let range = self.get_index_range(index)?;
        self.data.get(range)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut [T]> {
        let range = self.get_index_range(index)?;
        self.data.get_mut(range)
    }

    /// Length of array `index`, or zero if the index is out of bounds.
    pub fn array_len(&self, index: usize) -> usize {
        self.get_index_range(index).map(|range| range.len()).unwrap_or(0)
    }

    fn get_index_range(&self, index: usize) -> Option<Range<usize>> {
        let begin = *self.offsets.get(index)?;
        let end = *self.offsets.get(index + 1)?;
        Some(begin..end)
    }

    pub fn first(&self) -> Option<&[T]> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&[T]> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn clear(&mut self) {
        self.offsets.truncate(1);
        self.data.clear();
    }

    /// Decompose into the offset table and the concatenated data.
    pub fn into_offsets_and_data(self) -> (Vec<usize>, Vec<T>) {
        (self.offsets, self.data)
    }
}

#[derive(Debug)]
pub struct ArrayAppender<'a, T> {
    data: &'a mut Vec<T>,
    offsets: &'a mut Vec<usize>,
    initial_count: usize,
}

impl<'a, T> ArrayAppender<'a, T> {
    pub fn push_single(&mut self, element: T) -> &mut Self {
        self.data.push(element);
        self
    }

    pub fn count(&self) -> usize {
        self.data.len() - self.initial_count
    }
}

impl<'a, T> Drop for ArrayAppender<'a, T> {
    fn drop(&mut self) {
        self.offsets.push(self.data.len());
    }
}

impl<T: Clone> NestedVec<T> {
    pub fn push(&mut self, array: &[T]) {
        self.data.extend_from_slice(array);
        self.offsets.push(self.data.len());
    }
}

impl<'a, T: Clone> From<&'a Vec<Vec<T>>> for NestedVec<T> {
    fn from(nested_vec: &'a Vec<Vec<T>>) -> Self {
        let total = nested_vec.iter().map(Vec::len).sum();
        let mut result = Self {
            data: Vec::with_capacity(total),
            offsets: Vec::with_capacity(nested_vec.len() + 1),
        };
        result.offsets.push(0);
        for vec in nested_vec {
            result.push(vec);
        }
        result
    }
}

impl<T: Clone> From<Vec<Vec<T>>> for NestedVec<T> {
    fn from(vec_vec: Vec<Vec<T>>) -> Self {
        Self::from(&vec_vec)
    }
}

impl<'a, T: Clone> From<&'a NestedVec<T>> for Vec<Vec<T>> {
    fn from(nested: &NestedVec<T>) -> Self {
        nested.iter().map(|slice| slice.to_vec()).collect()
    }
}

impl<T: Clone> From<NestedVec<T>> for Vec<Vec<T>> {
    fn from(nested: NestedVec<T>) -> Self {
        Self::from(&nested)
    }
}
