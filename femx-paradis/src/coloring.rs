//! Element coloring.
//!
//! A coloring partitions elements into classes such that no two elements of the same class
//! share a regular dof. Element loops can then run each class in parallel without any
//! synchronization on the values they scatter into.
use crate::{balance, DisjointSubsets};
use femx_nested_vec::NestedVec;
use femx_traits::dof::regular_dofs;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;

const COLORS_PER_PASS: usize = u32::BITS as usize;
const NO_COLOR: u32 = u32::MAX;

/// Sorted, deduplicated regular dofs of every subset.
pub fn sorted_regular_subsets(subsets: &NestedVec<usize>) -> NestedVec<usize> {
    sorted_regular_subsets_excluding(subsets, |_| false)
}

fn sorted_regular_subsets_excluding<F>(subsets: &NestedVec<usize>, excluded: F) -> NestedVec<usize>
where
    F: Fn(usize) -> bool + Sync,
{
    let sorted: Vec<Vec<usize>> = subsets
        .iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|dofs| {
            let mut dofs: Vec<usize> = regular_dofs(dofs).filter(|&d| !excluded(d)).collect();
            dofs.sort_unstable();
            dofs.dedup();
            dofs
        })
        .collect();
    NestedVec::from(sorted)
}

/// Group elements by color into disjoint subsets of their (regular) dofs.
fn color_classes(element_colors: &[usize], dofs: &NestedVec<usize>) -> Vec<DisjointSubsets> {
    let num_colors = element_colors.iter().map(|&c| c + 1).max().unwrap_or(0);
    let mut members = vec![Vec::new(); num_colors];
    for (element, &color) in element_colors.iter().enumerate() {
        members[color].push(element);
    }

    members
        .into_par_iter()
        .filter(|elements| !elements.is_empty())
        .map(|elements| {
            let mut subsets = NestedVec::new();
            for &element in &elements {
                subsets.push(dofs.get(element).unwrap_or(&[]));
            }
            let max_index = subsets.iter_array_elements().copied().max();

            debug_assert!(DisjointSubsets::try_from_disjoint_subsets(subsets.clone(), elements.clone()).is_ok());
            // Elements of one color share no dof by construction
            unsafe { DisjointSubsets::from_disjoint_subsets_unchecked(subsets, elements, max_index) }
        })
        .collect()
}

/// Greedy first-fit coloring on a single thread.
///
/// Elements are visited in order; each receives the lowest color not yet used by any element
/// sharing one of its regular dofs.
pub fn sequential_greedy_coloring(subsets: &NestedVec<usize>) -> Vec<DisjointSubsets> {
    let dofs = sorted_regular_subsets(subsets);
    let num_dofs = dofs.iter_array_elements().map(|&d| d + 1).max().unwrap_or(0);

    // Colors in use at each dof, one bit per color of the current window
    let mut used = vec![0u32; num_dofs];
    let mut element_colors = vec![usize::MAX; dofs.len()];
    let mut remaining: Vec<usize> = (0..dofs.len()).collect();
    let mut postponed = Vec::new();
    let mut base_color = 0;

    while !remaining.is_empty() {
        used.iter_mut().for_each(|mask| *mask = 0);
        for &element in &remaining {
            let element_dofs = dofs.get(element).unwrap_or(&[]);
            let mask = element_dofs.iter().fold(0, |acc, &d| acc | used[d]);
            if mask == u32::MAX {
                postponed.push(element);
            } else {
                let bit = (!mask).trailing_zeros();
                element_dofs.iter().for_each(|&d| used[d] |= 1 << bit);
                element_colors[element] = base_color + bit as usize;
            }
        }
        std::mem::swap(&mut remaining, &mut postponed);
        postponed.clear();
        base_color += COLORS_PER_PASS;
    }

    color_classes(&element_colors, &dofs)
}

/// Greedy coloring with bitmasks, processing elements in parallel.
///
/// Each pass considers a window of 32 colors. Every dof carries a bitmask of the colors already
/// taken at that dof, protected by its own mutex. An element locks all of its dofs in ascending
/// order, picks the lowest bit that is free at every dof and marks it. Elements finding no free
/// bit are retried in the next pass with the window shifted by 32. Every pass colors at least
/// one element, so the loop terminates.
///
/// Irregular dof markers are ignored. The returned classes hold each element's sorted regular
/// dofs, labeled by element index.
pub fn parallel_greedy_coloring(subsets: &NestedVec<usize>) -> Vec<DisjointSubsets> {
    parallel_greedy_coloring_excluding(subsets, |_| false)
}

/// Like [`parallel_greedy_coloring`], but dofs for which `excluded` returns `true` take no part
/// in the coloring.
///
/// Elements sharing only excluded dofs may receive the same color, and excluded dofs are left
/// out of the returned classes. Writes to excluded dofs must therefore be synchronized by the
/// caller, typically with atomic additions.
pub fn parallel_greedy_coloring_excluding<F>(subsets: &NestedVec<usize>, excluded: F) -> Vec<DisjointSubsets>
where
    F: Fn(usize) -> bool + Sync,
{
    let dofs = sorted_regular_subsets_excluding(subsets, excluded);
    let num_dofs = dofs
        .data()
        .par_iter()
        .map(|&d| d + 1)
        .max()
        .unwrap_or(0);

    let masks: Vec<Mutex<u32>> = (0..num_dofs).map(|_| Mutex::new(0)).collect();
    let mut element_colors = vec![usize::MAX; dofs.len()];
    let mut remaining: Vec<usize> = (0..dofs.len()).collect();
    let mut base_color = 0;
    let mut passes = 0;

    while !remaining.is_empty() {
        masks.par_iter().for_each(|mask| *mask.lock() = 0);

        let partition = balance(remaining.len(), |k| dofs.array_len(remaining[k]) + 1);
        let mut bits = vec![NO_COLOR; remaining.len()];
        partition
            .split_mut(&mut bits)
            .into_par_iter()
            .zip(partition.par_ranges())
            .for_each(|(chunk_bits, range)| {
                let mut guards: Vec<MutexGuard<'_, u32>> = Vec::new();
                for (bit, &element) in chunk_bits.iter_mut().zip(&remaining[range]) {
                    let element_dofs = dofs.get(element).unwrap_or(&[]);
                    guards.reserve(element_dofs.len());
                    // Ascending lock order rules out deadlocks between elements
                    guards.extend(element_dofs.iter().map(|&d| masks[d].lock()));
                    let used = guards.iter().fold(0, |acc, mask| acc | **mask);
                    if used != u32::MAX {
                        let free = (!used).trailing_zeros();
                        guards.iter_mut().for_each(|mask| **mask |= 1 << free);
                        *bit = free;
                    }
                    guards.clear();
                }
            });

        let mut postponed = Vec::new();
        for (&element, &bit) in remaining.iter().zip(&bits) {
            if bit == NO_COLOR {
                postponed.push(element);
            } else {
                element_colors[element] = base_color + bit as usize;
            }
        }
        remaining = postponed;
        base_color += COLORS_PER_PASS;
        passes += 1;
    }

    let classes = color_classes(&element_colors, &dofs);
    debug!(
        "Colored {} elements with {} colors in {} passes",
        dofs.len(),
        classes.len(),
        passes
    );
    classes
}
