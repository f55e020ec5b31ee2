//! femx-paradis
//! ============
//!
//! Parallel building blocks for element loops: cost-balanced work partitions, element
//! coloring and race-free mutable access to disjoint records of a shared collection.

pub mod balance;
pub mod coloring;
pub mod slice;

pub use balance::{balance, par_prefix_sum, WorkPartition};

use femx_nested_vec::NestedVec;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

/// Parallel access to the (mutable) records of a collection.
///
/// A record is whatever the collection hands out for a single index: a reference to a slice
/// element, a view of a matrix row and so on.
///
/// # Safety
///
/// Implementors must make it sound for several threads to obtain immutable records for the same
/// index, and mutable records for *different* indices, at the same time.
///
/// Consumers are responsible for never obtaining a mutable record for an index while any other
/// record (mutable or not, on any thread) for that index is alive.
pub unsafe trait ParallelIndexedAccess<'record>: Sync + Send + Clone {
    type Record;
    type RecordMut;

    unsafe fn get_unchecked(&self, index: usize) -> Self::Record;
    unsafe fn get_unchecked_mut(&self, index: usize) -> Self::RecordMut;
}

/// A collection that can hand out a [`ParallelIndexedAccess`] to its records.
///
/// Creating the access borrows the collection mutably, so the access is the only way to reach
/// the records for as long as it lives.
///
/// # Safety
///
/// Consumers may access every index in `[0, len)` through the access, so `len` must be exact.
pub unsafe trait ParallelIndexedCollection<'a> {
    type Access;

    unsafe fn create_access(&'a mut self) -> Self::Access;
    fn len(&self) -> usize;
}

/// A single subset handed out by [`DisjointSubsets::subsets_par_iter`].
pub struct SubsetAccess<'data, Access> {
    label: usize,
    indices: &'data [usize],
    access: Access,
}

impl<'data, Access> SubsetAccess<'data, Access> {
    pub fn global_indices(&self) -> &[usize] {
        self.indices
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The underlying collection access.
    ///
    /// Records of this subset's indices may be mutated through it without synchronization, since
    /// no other subset of the same [`DisjointSubsets`] contains them.
    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn get<'b>(&'b self, local_index: usize) -> <Access as ParallelIndexedAccess<'b>>::Record
    where
        'data: 'b,
        Access: ParallelIndexedAccess<'b>,
    {
        let global_index = self.indices[local_index];
        unsafe { self.access.get_unchecked(global_index) }
    }

    pub fn get_mut<'b>(&'b mut self, local_index: usize) -> <Access as ParallelIndexedAccess<'b>>::RecordMut
    where
        'data: 'b,
        Access: ParallelIndexedAccess<'b>,
    {
        let global_index = self.indices[local_index];
        unsafe { self.access.get_unchecked_mut(global_index) }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubsetsNotDisjointError {
    pub index: usize,
}

impl fmt::Display for SubsetsNotDisjointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index {} is shared by more than one subset", self.index)
    }
}

impl Error for SubsetsNotDisjointError {}

/// Labeled subsets of indices where no index occurs in more than one subset.
///
/// A color class produced by element coloring is a `DisjointSubsets` whose subsets are the
/// elements' dofs and whose labels are the element indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisjointSubsets {
    // Largest index in any subset, used to bounds check the storage once up front
    max_index: Option<usize>,
    // An index may repeat within a subset, but never across subsets
    subsets: NestedVec<usize>,
    labels: Vec<usize>,
}

impl DisjointSubsets {
    pub fn try_from_disjoint_subsets<Subsets: Into<NestedVec<usize>>>(
        subsets: Subsets,
        labels: Vec<usize>,
    ) -> Result<Self, SubsetsNotDisjointError> {
        let subsets = subsets.into();
        assert_eq!(subsets.len(), labels.len(), "Must have exactly one label per subset.");

        let mut owner = HashSet::new();
        let mut local = HashSet::new();
        for subset in subsets.iter() {
            local.clear();
            local.extend(subset.iter().copied());
            for &index in &local {
                if !owner.insert(index) {
                    return Err(SubsetsNotDisjointError { index });
                }
            }
        }

        let max_index = subsets.iter_array_elements().copied().max();
        Ok(Self {
            max_index,
            subsets,
            labels,
        })
    }

    /// Construct without verifying disjointness.
    ///
    /// # Safety
    ///
    /// No index may occur in two different subsets, and `max_index` must be the largest index in
    /// any subset (or `None` if all subsets are empty).
    pub unsafe fn from_disjoint_subsets_unchecked<Subsets: Into<NestedVec<usize>>>(
        subsets: Subsets,
        labels: Vec<usize>,
        max_index: Option<usize>,
    ) -> Self {
        let subsets = subsets.into();
        assert_eq!(subsets.len(), labels.len(), "Must have exactly one label per subset.");
        Self {
            max_index,
            subsets,
            labels,
        }
    }

    pub fn subsets(&self) -> &NestedVec<usize> {
        &self.subsets
    }

    pub fn into_subsets(self) -> NestedVec<usize> {
        self.subsets
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Create a parallel iterator over the subsets, fetching records from the provided storage.
    ///
    /// Panics if any subset contains an index that exceeds the length reported by `storage`.
    pub fn subsets_par_iter<'a, Storage>(
        &'a self,
        storage: &'a mut Storage,
    ) -> impl 'a + IndexedParallelIterator<Item = SubsetAccess<'a, Storage::Access>>
    where
        Storage: ?Sized + ParallelIndexedCollection<'a>,
        Storage::Access: 'a + Clone + Send + Sync,
    {
        if let Some(max_index) = self.max_index {
            assert!(max_index < storage.len(), "Subsets contain indices out of bounds.");
        }
        let access = unsafe { storage.create_access() };
        let subsets = &self.subsets;
        let labels = &self.labels;

        (0..self.labels.len())
            .into_par_iter()
            .map(move |i| SubsetAccess {
                label: labels[i],
                indices: &subsets.data()[subsets.offsets()[i]..subsets.offsets()[i + 1]],
                access: access.clone(),
            })
    }
}
