//! Element incidence tables and their dof-to-element inverse.
use crate::SparseError;
use femx_nested_vec::NestedVec;
use femx_paradis::{balance, par_prefix_sum, ParallelIndexedAccess, ParallelIndexedCollection};
use femx_traits::dof::regular_dofs;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use femx_paradis::coloring::sorted_regular_subsets;

/// Check that every regular dof in `incidence` is smaller than `bound`.
///
/// Reports the first offending element.
pub fn check_incidence_bounds(incidence: &NestedVec<usize>, bound: usize) -> Result<(), SparseError> {
    let violation = (0..incidence.len()).into_par_iter().find_map_first(|element| {
        regular_dofs(incidence.get(element).unwrap_or(&[]))
            .find(|&dof| dof >= bound)
            .map(|dof| SparseError::IncidenceOutOfBounds { element, dof, bound })
    });
    match violation {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Build the dof-to-element table of an element-to-dof incidence table.
///
/// Entry `d` lists, in ascending order, every element whose incidence row contains the regular
/// dof `d`. An element listing a dof twice appears twice. The table is built in two parallel
/// passes over the elements: atomic counting, then a fill in which every insertion reserves its
/// slot through an atomic cursor.
///
/// Panics if a regular dof is not smaller than `num_dofs`.
pub fn inverse_incidence(incidence: &NestedVec<usize>, num_dofs: usize) -> NestedVec<usize> {
    let element_partition = balance(incidence.len(), |element| incidence.array_len(element) + 1);
    let element_dofs = |element: usize| regular_dofs(incidence.get(element).unwrap_or(&[]));

    let counts: Vec<AtomicUsize> = (0..num_dofs)
        .into_par_iter()
        .map(|_| AtomicUsize::new(0))
        .collect();
    element_partition.par_ranges().for_each(|elements| {
        for element in elements {
            for dof in element_dofs(element) {
                counts[dof].fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let mut offsets: Vec<usize> = counts.into_par_iter().map(AtomicUsize::into_inner).collect();
    offsets.push(0);
    let dof_partition = balance(num_dofs, |_| 1);
    let total = par_prefix_sum(&mut offsets[..num_dofs], &dof_partition);
    offsets[num_dofs] = total;

    let cursors: Vec<AtomicUsize> = offsets[..num_dofs]
        .par_iter()
        .map(|&offset| AtomicUsize::new(offset))
        .collect();
    let mut elements = vec![0; total];
    {
        let access = unsafe { elements.as_mut_slice().create_access() };
        element_partition.par_ranges().for_each(|range| {
            for element in range {
                for dof in element_dofs(element) {
                    let slot = cursors[dof].fetch_add(1, Ordering::Relaxed);
                    // The cursor hands out each slot exactly once
                    unsafe { *access.get_unchecked_mut(slot) = element };
                }
            }
        });
    }

    // Buckets were filled in scheduling order
    let dof_partition = balance(num_dofs, |dof| offsets[dof + 1] - offsets[dof] + 1);
    dof_partition
        .split_by_offsets_mut(&mut elements, &offsets)
        .into_par_iter()
        .zip(dof_partition.par_ranges())
        .for_each(|(chunk, dofs)| {
            let base = offsets[dofs.start];
            for dof in dofs {
                chunk[offsets[dof] - base..offsets[dof + 1] - base].sort_unstable();
            }
        });

    NestedVec::from_offsets_and_data(offsets, elements)
}
