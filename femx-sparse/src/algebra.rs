//! Sparse matrix products and transposition for scalar matrices.
//!
//! All operations run in parallel over balanced row partitions. Symmetric operands are expanded
//! to full storage first. Results use general storage, except that restricting a symmetric
//! operator yields symmetric storage.
use crate::entry::BlockEntry;
use crate::matrix::zeroed_values;
use crate::{MatrixGraph, SparseError, SparseMatrix, Symmetry};
use femx_paradis::{balance, par_prefix_sum, ParallelIndexedAccess, ParallelIndexedCollection, WorkPartition};
use femx_traits::{AtomicAdd, Real};
use log::debug;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};

const VACANT: usize = usize::MAX;

/// Open-addressed map from the column indices of one row to their local slots.
///
/// The table holds the first column hashing to each bucket. Columns that collide fall back to a
/// binary search in the row.
#[derive(Debug, Default)]
struct RowHash {
    keys: Vec<usize>,
    slots: Vec<usize>,
    mask: usize,
}

impl RowHash {
    fn rebuild(&mut self, cols: &[usize]) {
        let size = (2 * cols.len()).next_power_of_two().max(16);
        self.mask = size - 1;
        self.keys.clear();
        self.keys.resize(size, VACANT);
        self.slots.resize(size, 0);
        for (k, &col) in cols.iter().enumerate() {
            let bucket = col & self.mask;
            if self.keys[bucket] == VACANT {
                self.keys[bucket] = col;
                self.slots[bucket] = k;
            }
        }
    }

    fn find(&self, col: usize, cols: &[usize]) -> Option<usize> {
        let bucket = col & self.mask;
        if self.keys[bucket] == col {
            Some(self.slots[bucket])
        } else {
            cols.binary_search(&col).ok()
        }
    }
}

fn expanded<T: BlockEntry>(matrix: &SparseMatrix<T>) -> Cow<'_, SparseMatrix<T>> {
    if matrix.is_symmetric() {
        Cow::Owned(matrix.to_full())
    } else {
        Cow::Borrowed(matrix)
    }
}

/// The transpose `A^T`.
///
/// Column counts are gathered with atomic counters, rows of the result are laid out by a prefix
/// sum and filled through atomic cursors, and every result row is finally sorted.
pub fn transpose<T>(matrix: &SparseMatrix<T>) -> SparseMatrix<T>
where
    T: Real + AtomicAdd + BlockEntry<Scalar = T>,
{
    if matrix.is_symmetric() {
        return matrix.clone();
    }
    let graph = matrix.graph();
    let (nrows, ncols) = (graph.nrows(), graph.ncols());
    let rows = graph.balance();

    let counts: Vec<AtomicUsize> = (0..ncols).map(|_| AtomicUsize::new(0)).collect();
    rows.par_ranges().for_each(|range| {
        for row in range {
            for &col in graph.row_indices(row) {
                counts[col].fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    let mut offsets: Vec<usize> = counts.into_iter().map(AtomicUsize::into_inner).collect();
    offsets.push(0);
    let nnz = par_prefix_sum(&mut offsets[..ncols], &WorkPartition::uniform(ncols, rayon::current_num_threads()));
    offsets[ncols] = nnz;

    let cursors: Vec<AtomicUsize> = offsets[..ncols].iter().map(|&o| AtomicUsize::new(o)).collect();
    let mut col_indices = vec![0; nnz];
    let mut values = vec![T::zero(); nnz];
    {
        let index_access = unsafe { col_indices.as_mut_slice().create_access() };
        let value_access = unsafe { values.as_mut_slice().create_access() };
        rows.par_ranges().for_each(|range| {
            for row in range {
                for (col, &value) in matrix.row(row).iter() {
                    let slot = cursors[col].fetch_add(1, Ordering::Relaxed);
                    // Every slot is claimed by exactly one cursor increment
                    unsafe {
                        *index_access.get_unchecked_mut(slot) = row;
                        *value_access.get_unchecked_mut(slot) = value;
                    }
                }
            }
        });
    }

    let partition = balance(ncols, |row| 1 + offsets[row + 1] - offsets[row]);
    partition
        .split_by_offsets_mut(&mut col_indices, &offsets)
        .into_par_iter()
        .zip(partition.split_by_offsets_mut(&mut values, &offsets))
        .zip(partition.par_ranges())
        .for_each(|((index_chunk, value_chunk), range)| {
            let base = offsets[range.start];
            let mut entries = Vec::new();
            for row in range {
                let local = offsets[row] - base..offsets[row + 1] - base;
                entries.clear();
                entries.extend(
                    index_chunk[local.clone()]
                        .iter()
                        .copied()
                        .zip(value_chunk[local.clone()].iter().copied()),
                );
                entries.sort_unstable_by_key(|&(col, _)| col);
                for (k, (col, value)) in entries.iter().copied().enumerate() {
                    index_chunk[local.start + k] = col;
                    value_chunk[local.start + k] = value;
                }
            }
        });

    let graph = MatrixGraph::from_parts(ncols, nrows, offsets, col_indices, false);
    SparseMatrix::from_parts(graph, values, Symmetry::General)
}

/// The product `C = A * B`.
///
/// Row `i` of the pattern of `C` is the union of the rows of `B` selected by the columns of row
/// `i` of `A`, computed with the k-way merge. Values are accumulated through a per-row column
/// hash.
pub fn mat_mult<T>(a: &SparseMatrix<T>, b: &SparseMatrix<T>) -> Result<SparseMatrix<T>, SparseError>
where
    T: Real + AtomicAdd + BlockEntry<Scalar = T>,
{
    if a.ncols() != b.nrows() {
        return Err(SparseError::DimensionMismatch {
            left: (a.nrows(), a.ncols()),
            right: (b.nrows(), b.ncols()),
        });
    }
    let a = expanded(a);
    let b = expanded(b);
    let (a_graph, b_graph) = (a.graph(), b.graph());

    let partition = balance(a.nrows(), |row| {
        1 + a_graph
            .row_indices(row)
            .iter()
            .map(|&k| b_graph.row_len(k))
            .sum::<usize>()
    });
    let graph = MatrixGraph::from_row_unions(a.nrows(), b.ncols(), &partition, |row, arrays| {
        arrays.extend(
            a_graph
                .row_indices(row)
                .iter()
                .map(|&k| b_graph.row_indices(k)),
        );
    });

    let mut values: Vec<T> = zeroed_values(&graph, &partition);
    partition
        .split_by_offsets_mut(&mut values, graph.row_offsets())
        .into_par_iter()
        .zip(partition.par_ranges())
        .for_each(|(chunk, range)| {
            let base = graph.row_offsets()[range.start];
            let mut hash = RowHash::default();
            for row in range {
                let cols = graph.row_indices(row);
                let row_values = &mut chunk[graph.row_offsets()[row] - base..][..cols.len()];
                hash.rebuild(cols);
                for (k, &a_ik) in a.row(row).iter() {
                    for (j, &b_kj) in b.row(k).iter() {
                        if let Some(local) = hash.find(j, cols) {
                            row_values[local] += a_ik * b_kj;
                        }
                    }
                }
            }
        });

    debug!(
        "Multiplied {}x{} by {}x{}: {} non-zeros",
        a.nrows(),
        a.ncols(),
        b.nrows(),
        b.ncols(),
        graph.nnz()
    );
    Ok(SparseMatrix::from_parts(graph, values, Symmetry::General))
}

/// The Galerkin restriction `P^T * A * P` of a square matrix `A`.
///
/// A symmetric `A` gives a symmetric coarse operator, stored as its lower triangle.
pub fn restrict<T>(a: &SparseMatrix<T>, p: &SparseMatrix<T>) -> Result<SparseMatrix<T>, SparseError>
where
    T: Real + AtomicAdd + BlockEntry<Scalar = T>,
{
    if a.nrows() != a.ncols() {
        return Err(SparseError::NotSquare {
            nrows: a.nrows(),
            ncols: a.ncols(),
        });
    }
    if a.ncols() != p.nrows() {
        return Err(SparseError::DimensionMismatch {
            left: (a.nrows(), a.ncols()),
            right: (p.nrows(), p.ncols()),
        });
    }
    let ap = mat_mult(a, p)?;
    let pt = transpose(&expanded(p));
    let coarse = mat_mult(&pt, &ap)?;
    if a.is_symmetric() {
        coarse.to_symmetric()
    } else {
        Ok(coarse)
    }
}

impl<T> SparseMatrix<T>
where
    T: Real + AtomicAdd + BlockEntry<Scalar = T>,
{
    pub fn transpose(&self) -> Self {
        transpose(self)
    }

    pub fn mat_mult(&self, other: &Self) -> Result<Self, SparseError> {
        mat_mult(self, other)
    }

    pub fn restrict(&self, p: &Self) -> Result<Self, SparseError> {
        restrict(self, p)
    }
}
