//! Cost-balanced partitioning of index ranges.
//!
//! Every row- or element-parallel loop splits its index range into one contiguous chunk per
//! worker. With [`WorkPartition::balanced`] the chunks carry roughly equal total cost, which
//! matters for rows of very different length.
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// An ordered sequence of disjoint, contiguous ranges covering `[0, n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPartition {
    // `boundaries[k] .. boundaries[k + 1]` is chunk `k`
    boundaries: Vec<usize>,
}

impl WorkPartition {
    /// Split `[0, n)` into `num_chunks` ranges of (nearly) equal length.
    pub fn uniform(n: usize, num_chunks: usize) -> Self {
        let num_chunks = num_chunks.max(1);
        let boundaries = (0..=num_chunks).map(|k| k * n / num_chunks).collect();
        Self { boundaries }
    }

    /// Split `[0, n)` into `num_chunks` ranges of (nearly) equal accumulated cost.
    ///
    /// The cost of each chunk exceeds `total_cost / num_chunks` by less than the largest single
    /// cost. Both the cost evaluation and the prefix sum run in parallel.
    pub fn balanced<F>(n: usize, num_chunks: usize, cost: F) -> Self
    where
        F: Fn(usize) -> usize + Sync + Send,
    {
        let num_chunks = num_chunks.max(1);
        let mut prefix: Vec<usize> = (0..n).into_par_iter().map(&cost).collect();
        let total = par_prefix_sum(&mut prefix, &Self::uniform(n, num_chunks));

        let mut boundaries = Vec::with_capacity(num_chunks + 1);
        boundaries.push(0);
        for k in 1..num_chunks {
            let target = (total as u128 * k as u128 / num_chunks as u128) as usize;
            // First index whose exclusive prefix reaches the target
            boundaries.push(prefix.partition_point(|&p| p < target));
        }
        boundaries.push(n);
        Self { boundaries }
    }

    pub fn from_boundaries(boundaries: Vec<usize>) -> Self {
        assert_eq!(boundaries.first(), Some(&0), "Boundaries must start at zero.");
        assert!(
            boundaries.windows(2).all(|w| w[0] <= w[1]),
            "Boundaries must be monotonically increasing."
        );
        Self { boundaries }
    }

    pub fn num_chunks(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// Length of the partitioned range.
    pub fn len(&self) -> usize {
        self.boundaries.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn boundaries(&self) -> &[usize] {
        &self.boundaries
    }

    pub fn range(&self, chunk: usize) -> Range<usize> {
        self.boundaries[chunk]..self.boundaries[chunk + 1]
    }

    pub fn ranges(&self) -> impl '_ + ExactSizeIterator<Item = Range<usize>> {
        self.boundaries.windows(2).map(|w| w[0]..w[1])
    }

    pub fn par_ranges(&self) -> impl '_ + IndexedParallelIterator<Item = Range<usize>> {
        self.boundaries.par_windows(2).map(|w| w[0]..w[1])
    }

    /// Split a slice with one entry per index into one mutable chunk per range.
    pub fn split_mut<'a, T>(&self, data: &'a mut [T]) -> Vec<&'a mut [T]> {
        self.split_blocks_mut(data, 1)
    }

    /// Split a slice with `block_size` entries per index into one mutable chunk per range.
    pub fn split_blocks_mut<'a, T>(&self, data: &'a mut [T], block_size: usize) -> Vec<&'a mut [T]> {
        assert_eq!(data.len(), block_size * self.len(), "Slice length does not match partition.");
        split_at_offsets(data, self.boundaries.iter().map(|&b| block_size * b))
    }

    /// Split a slice into one chunk per range, where index `i` owns
    /// `offsets[i] .. offsets[i + 1]` of the slice.
    pub fn split_by_offsets_mut<'a, T>(&self, data: &'a mut [T], offsets: &[usize]) -> Vec<&'a mut [T]> {
        assert_eq!(offsets.len(), self.len() + 1, "Offsets do not match partition.");
        assert_eq!(data.len(), offsets[self.len()], "Slice length does not match offsets.");
        split_at_offsets(data, self.boundaries.iter().map(|&b| offsets[b]))
    }
}

fn split_at_offsets<'a, T>(mut data: &'a mut [T], cuts: impl Iterator<Item = usize>) -> Vec<&'a mut [T]> {
    let mut chunks = Vec::new();
    let mut consumed = 0;
    for cut in cuts.skip(1) {
        let (head, tail) = std::mem::take(&mut data).split_at_mut(cut - consumed);
        chunks.push(head);
        data = tail;
        consumed = cut;
    }
    chunks
}

/// Partition `[0, n)` by cost into as many chunks as the current rayon pool has threads.
pub fn balance<F>(n: usize, cost: F) -> WorkPartition
where
    F: Fn(usize) -> usize + Sync + Send,
{
    WorkPartition::balanced(n, rayon::current_num_threads(), cost)
}

/// In-place exclusive prefix sum, returning the total.
///
/// Each chunk of `partition` first sums its entries in parallel, a serial pass turns the chunk
/// totals into chunk base offsets, and a second parallel pass rescans each chunk from its base.
pub fn par_prefix_sum(values: &mut [usize], partition: &WorkPartition) -> usize {
    assert_eq!(values.len(), partition.len(), "Partition does not cover the values.");
    let chunk_totals: Vec<usize> = partition
        .par_ranges()
        .map(|range| values[range].iter().sum())
        .collect();

    let mut bases = Vec::with_capacity(chunk_totals.len());
    let mut total = 0;
    for chunk_total in chunk_totals {
        bases.push(total);
        total += chunk_total;
    }

    partition
        .split_mut(values)
        .into_par_iter()
        .zip(bases)
        .for_each(|(chunk, base)| {
            let mut running = base;
            for value in chunk {
                let count = *value;
                *value = running;
                running += count;
            }
        });
    total
}
