use crate::entry::{add_block, atomic_add_block, transpose_block, BlockEntry};
use crate::{MatrixGraph, SparseError};
use femx_paradis::{ParallelIndexedAccess, ParallelIndexedCollection, WorkPartition};
use femx_traits::dof::is_regular_dof;
use femx_traits::AtomicAdd;
use nalgebra::{DMatrix, DMatrixView};
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Which part of the matrix the pattern stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Symmetry {
    /// Every non-zero is stored.
    General,
    /// Only positions with `col <= row` are stored and the upper part is implied by symmetry.
    /// Diagonal blocks are stored in full.
    Symmetric,
}

/// A sparse matrix of dense blocks over a [`MatrixGraph`].
///
/// The graph may be shared between several matrices, in which case it can no longer grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SparseMatrixArchive<B>", try_from = "SparseMatrixArchive<B>")]
#[serde(bound(serialize = "B: BlockEntry + Serialize", deserialize = "B: BlockEntry + Deserialize<'de>"))]
pub struct SparseMatrix<B> {
    graph: Arc<MatrixGraph>,
    values: Vec<B>,
    symmetry: Symmetry,
}

/// An immutable row of a [`SparseMatrix`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockRow<'a, B> {
    col_indices: &'a [usize],
    values: &'a [B],
}

/// A mutable row of a [`SparseMatrix`].
#[derive(Debug, PartialEq)]
pub struct BlockRowMut<'a, B> {
    col_indices: &'a [usize],
    values: &'a mut [B],
}

impl<'a, B> BlockRow<'a, B> {
    /// Number of non-zeros in this row.
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    pub fn col_indices(&self) -> &'a [usize] {
        self.col_indices
    }

    pub fn values(&self) -> &'a [B] {
        self.values
    }

    pub fn get(&self, col: usize) -> Option<&'a B> {
        let values = self.values;
        self.col_indices
            .binary_search(&col)
            .ok()
            .map(|k| &values[k])
    }

    pub fn iter(&self) -> impl 'a + ExactSizeIterator<Item = (usize, &'a B)> {
        self.col_indices.iter().copied().zip(self.values.iter())
    }
}

impl<'a, B> BlockRowMut<'a, B> {
    /// Number of non-zeros in this row.
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    pub fn col_indices(&self) -> &[usize] {
        self.col_indices
    }

    pub fn values_mut(&mut self) -> &mut [B] {
        self.values
    }

    pub fn cols_and_values_mut(&mut self) -> (&[usize], &mut [B]) {
        (self.col_indices, self.values)
    }

    pub fn get_mut(&mut self, col: usize) -> Option<&mut B> {
        match self.col_indices.binary_search(&col) {
            Ok(k) => Some(&mut self.values[k]),
            Err(_) => None,
        }
    }
}

/// Reusable buffers for scattering element matrices.
#[derive(Debug, Default)]
struct ScatterWorkspace {
    row_perm: Vec<usize>,
    col_perm: Vec<usize>,
    sorted_cols: Vec<usize>,
    positions: Vec<usize>,
    slots: Vec<(usize, usize, usize)>,
}

thread_local! {
    static SCATTER_WORKSPACE: RefCell<ScatterWorkspace> = RefCell::new(ScatterWorkspace::default());
}

/// Local indices of the regular dofs, ordered by dof.
fn regular_permutation(dofs: &[usize], perm: &mut Vec<usize>) {
    perm.clear();
    perm.extend((0..dofs.len()).filter(|&k| is_regular_dof(dofs[k])));
    perm.sort_unstable_by_key(|&k| dofs[k]);
}

/// Calls `add(slot, a, b)` for every pair of regular element dofs `(row_dofs[a], col_dofs[b])`
/// that the matrix stores, after checking the element matrix shape.
///
/// Fails without calling `add` if some position is missing from the graph.
fn scatter_element<B, F>(
    graph: &MatrixGraph,
    symmetry: Symmetry,
    row_dofs: &[usize],
    col_dofs: &[usize],
    element_matrix: &DMatrixView<B::Scalar>,
    mut add: F,
) -> Result<(), SparseError>
where
    B: BlockEntry,
    F: FnMut(usize, usize, usize),
{
    let expected = (B::ROWS * row_dofs.len(), B::COLS * col_dofs.len());
    if element_matrix.shape() != expected {
        return Err(SparseError::ElementMatrixShape {
            expected,
            actual: element_matrix.shape(),
        });
    }

    SCATTER_WORKSPACE.with(|ws| {
        let ws = &mut *ws.borrow_mut();
        regular_permutation(row_dofs, &mut ws.row_perm);
        regular_permutation(col_dofs, &mut ws.col_perm);
        ws.sorted_cols.clear();
        ws.sorted_cols
            .extend(ws.col_perm.iter().map(|&b| col_dofs[b]));

        // Look every position up before touching any value
        ws.slots.clear();
        for &a in &ws.row_perm {
            let row = row_dofs[a];
            let cols = match symmetry {
                Symmetry::General => &ws.sorted_cols[..],
                Symmetry::Symmetric => &ws.sorted_cols[..ws.sorted_cols.partition_point(|&c| c <= row)],
            };
            graph.positions_sorted(row, cols, &mut ws.positions)?;
            ws.slots.extend(
                ws.col_perm
                    .iter()
                    .zip(&ws.positions)
                    .map(|(&b, &slot)| (slot, a, b)),
            );
        }
        for &(slot, a, b) in &ws.slots {
            add(slot, a, b);
        }
        Ok(())
    })
}

impl<B: BlockEntry> SparseMatrix<B> {
    /// A zero matrix over the given graph.
    ///
    /// Values are initialized in parallel along the graph's row partition.
    pub fn from_graph(graph: impl Into<Arc<MatrixGraph>>, symmetry: Symmetry) -> Result<Self, SparseError> {
        let graph = graph.into();
        check_symmetry::<B>(&graph, symmetry)?;
        let values = zeroed_values(&graph, graph.balance());
        Ok(Self { graph, values, symmetry })
    }

    pub fn from_graph_and_values(
        graph: impl Into<Arc<MatrixGraph>>,
        values: Vec<B>,
        symmetry: Symmetry,
    ) -> Result<Self, SparseError> {
        let graph = graph.into();
        check_symmetry::<B>(&graph, symmetry)?;
        if values.len() != graph.nnz() {
            return Err(SparseError::InvalidPattern(format!(
                "expected {} values, got {}",
                graph.nnz(),
                values.len()
            )));
        }
        Ok(Self { graph, values, symmetry })
    }

    pub(crate) fn from_parts(graph: MatrixGraph, values: Vec<B>, symmetry: Symmetry) -> Self {
        debug_assert_eq!(graph.nnz(), values.len());
        Self {
            graph: Arc::new(graph),
            values,
            symmetry,
        }
    }

    /// Matrix from `(row, col, block)` triplets. Duplicate positions are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, B)],
        symmetry: Symmetry,
    ) -> Result<Self, SparseError> {
        let coordinates: Vec<_> = triplets.iter().map(|&(i, j, _)| (i, j)).collect();
        let graph = MatrixGraph::from_coordinates(nrows, ncols, &coordinates)?;
        let mut matrix = Self::from_graph(graph, symmetry)?;
        for &(i, j, block) in triplets {
            let slot = matrix.graph.get_position(i, j)?;
            add_block(&mut matrix.values[slot], |p, q| block.component(p, q));
        }
        Ok(matrix)
    }

    pub fn nrows(&self) -> usize {
        self.graph.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.graph.ncols()
    }

    /// Number of stored blocks, including reserved slots.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn is_symmetric(&self) -> bool {
        self.symmetry == Symmetry::Symmetric
    }

    pub fn graph(&self) -> &MatrixGraph {
        &self.graph
    }

    /// Shared handle to the graph, for building further matrices over the same pattern.
    pub fn graph_arc(&self) -> Arc<MatrixGraph> {
        Arc::clone(&self.graph)
    }

    pub fn values(&self) -> &[B] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [B] {
        &mut self.values
    }

    pub fn row(&self, row: usize) -> BlockRow<'_, B> {
        let start = self.graph.row_offsets()[row];
        let col_indices = self.graph.row_indices(row);
        BlockRow {
            col_indices,
            values: &self.values[start..start + col_indices.len()],
        }
    }

    pub fn row_mut(&mut self, row: usize) -> BlockRowMut<'_, B> {
        let start = self.graph.row_offsets()[row];
        let col_indices = self.graph.row_indices(row);
        BlockRowMut {
            col_indices,
            values: &mut self.values[start..start + col_indices.len()],
        }
    }

    /// The stored block at `(row, col)`.
    ///
    /// Symmetric matrices only store positions with `col <= row`.
    pub fn get_entry(&self, row: usize, col: usize) -> Option<&B> {
        self.graph.position(row, col).map(|slot| &self.values[slot])
    }

    pub fn get_entry_mut(&mut self, row: usize, col: usize) -> Option<&mut B> {
        self.graph
            .position(row, col)
            .map(move |slot| &mut self.values[slot])
    }

    /// The block at `(row, col)`, inserting it into a reserved slot if needed.
    ///
    /// Insertion requires that the graph is neither frozen nor shared with another matrix.
    pub fn entry_mut(&mut self, row: usize, col: usize) -> Result<&mut B, SparseError> {
        if let Some(slot) = self.graph.position(row, col) {
            return Ok(&mut self.values[slot]);
        }
        let slot = self.create_position(row, col)?;
        Ok(&mut self.values[slot])
    }

    /// Insert `(row, col)` into a reserved slot of the graph, returning its slot.
    pub fn create_position(&mut self, row: usize, col: usize) -> Result<usize, SparseError> {
        if self.is_symmetric() && col > row {
            return Err(SparseError::InvalidPattern(format!(
                "({row}, {col}) lies above the diagonal of a symmetric matrix"
            )));
        }
        if let Some(slot) = self.graph.position(row, col) {
            return Ok(slot);
        }
        let graph = Arc::get_mut(&mut self.graph).ok_or(SparseError::PatternFrozen { row, col })?;
        let (slot, shifted) = graph.insert_position(row, col)?;
        self.values[shifted].rotate_right(1);
        self.values[slot] = B::zero_block();
        Ok(slot)
    }

    /// Forbid further position creation.
    ///
    /// Graphs shared with other matrices cannot grow anyway and are left untouched.
    pub fn freeze(&mut self) {
        if let Some(graph) = Arc::get_mut(&mut self.graph) {
            graph.freeze();
        }
    }

    /// Add a dense element matrix at the positions `row_dofs x col_dofs`.
    ///
    /// Component `(p, q)` of the block for local dofs `(a, b)` is read from row
    /// `ROWS * a + p` and column `COLS * b + q` of the element matrix. Irregular dofs are
    /// skipped, and symmetric matrices skip positions above the diagonal. Either every
    /// position is added or, if some position is missing from the graph, none is.
    pub fn add_element_matrix(
        &mut self,
        row_dofs: &[usize],
        col_dofs: &[usize],
        element_matrix: DMatrixView<B::Scalar>,
    ) -> Result<(), SparseError> {
        let values = &mut self.values;
        scatter_element::<B, _>(&self.graph, self.symmetry, row_dofs, col_dofs, &element_matrix, |slot, a, b| {
            add_block(&mut values[slot], |p, q| element_matrix[(B::ROWS * a + p, B::COLS * b + q)])
        })
    }

    /// Shared access for concurrent element scattering.
    pub fn par_access(&mut self) -> SparseMatrixParAccess<'_, B> {
        SparseMatrixParAccess {
            graph: &self.graph,
            values: self.values.as_mut_ptr(),
            symmetry: self.symmetry,
            marker: PhantomData,
        }
    }

    pub fn set_zero(&mut self) {
        self.for_each_row_chunk(|values| values.fill(B::zero_block()));
    }

    pub fn scale(&mut self, factor: B::Scalar) {
        self.for_each_row_chunk(|values| {
            for block in values {
                for q in 0..B::COLS {
                    for p in 0..B::ROWS {
                        *block.component_mut(p, q) *= factor;
                    }
                }
            }
        });
    }

    fn for_each_row_chunk(&mut self, f: impl Fn(&mut [B]) + Sync) {
        let graph = &self.graph;
        graph
            .balance()
            .split_by_offsets_mut(&mut self.values, graph.row_offsets())
            .into_par_iter()
            .for_each(|chunk| f(chunk));
    }

    fn check_vector_lengths(&self, x: &[B::Scalar], y: &[B::Scalar], transposed: bool) {
        let (x_len, y_len) = if transposed {
            (self.nrows() * B::ROWS, self.ncols() * B::COLS)
        } else {
            (self.ncols() * B::COLS, self.nrows() * B::ROWS)
        };
        assert_eq!(x.len(), x_len, "input vector length must match the matrix");
        assert_eq!(y.len(), y_len, "output vector length must match the matrix");
    }

    /// Compute `y += alpha * A * x`.
    ///
    /// General matrices write each output row from exactly one worker. Symmetric matrices also
    /// add the transposed contribution of every off-diagonal block, using atomic additions.
    ///
    /// Panics if the vector lengths do not match the matrix.
    pub fn mult_add(&self, alpha: B::Scalar, x: &[B::Scalar], y: &mut [B::Scalar]) {
        self.check_vector_lengths(x, y, false);
        let partition = self.graph.balance();
        match self.symmetry {
            Symmetry::General => partition
                .split_blocks_mut(y, B::ROWS)
                .into_par_iter()
                .zip(partition.par_ranges())
                .for_each(|(y_chunk, rows)| {
                    let mut acc = vec![B::Scalar::zero(); B::ROWS];
                    for (local, row) in rows.enumerate() {
                        acc.fill(B::Scalar::zero());
                        for (col, block) in self.row(row).iter() {
                            for q in 0..B::COLS {
                                let x_q = x[B::COLS * col + q];
                                for p in 0..B::ROWS {
                                    acc[p] += block.component(p, q) * x_q;
                                }
                            }
                        }
                        for p in 0..B::ROWS {
                            y_chunk[B::ROWS * local + p] += alpha * acc[p];
                        }
                    }
                }),
            Symmetry::Symmetric => {
                let y_access = unsafe { y.create_access() };
                partition.par_ranges().for_each(|rows| {
                    let mut acc = vec![B::Scalar::zero(); B::ROWS];
                    for row in rows {
                        acc.fill(B::Scalar::zero());
                        for (col, block) in self.row(row).iter() {
                            for q in 0..B::COLS {
                                let x_q = x[B::COLS * col + q];
                                for p in 0..B::ROWS {
                                    acc[p] += block.component(p, q) * x_q;
                                }
                            }
                            if col != row {
                                for q in 0..B::COLS {
                                    let mut sum = B::Scalar::zero();
                                    for p in 0..B::ROWS {
                                        sum += block.component(p, q) * x[B::ROWS * row + p];
                                    }
                                    // Other workers may update the same output entries
                                    unsafe {
                                        B::Scalar::atomic_add(y_access.ptr_at(B::COLS * col + q), alpha * sum);
                                    }
                                }
                            }
                        }
                        for p in 0..B::ROWS {
                            unsafe {
                                B::Scalar::atomic_add(y_access.ptr_at(B::ROWS * row + p), alpha * acc[p]);
                            }
                        }
                    }
                });
            }
        }
    }

    /// Compute `y += alpha * A^T * x`.
    ///
    /// Panics if the vector lengths do not match the matrix.
    pub fn mult_trans_add(&self, alpha: B::Scalar, x: &[B::Scalar], y: &mut [B::Scalar]) {
        if self.is_symmetric() {
            return self.mult_add(alpha, x, y);
        }
        self.check_vector_lengths(x, y, true);
        let y_access = unsafe { y.create_access() };
        self.graph.balance().par_ranges().for_each(|rows| {
            for row in rows {
                for (col, block) in self.row(row).iter() {
                    for q in 0..B::COLS {
                        let mut sum = B::Scalar::zero();
                        for p in 0..B::ROWS {
                            sum += block.component(p, q) * x[B::ROWS * row + p];
                        }
                        unsafe {
                            B::Scalar::atomic_add(y_access.ptr_at(B::COLS * col + q), alpha * sum);
                        }
                    }
                }
            }
        });
    }

    /// Compute `y = A * x`.
    pub fn mult(&self, x: &[B::Scalar], y: &mut [B::Scalar]) {
        y.par_iter_mut().for_each(|y_i| *y_i = B::Scalar::zero());
        self.mult_add(B::Scalar::one(), x, y);
    }

    /// The same matrix with every non-zero stored explicitly.
    pub fn to_full(&self) -> Self {
        if !self.is_symmetric() {
            return self.clone();
        }
        let mut triplets = Vec::with_capacity(2 * self.nnz());
        for row in 0..self.nrows() {
            for (col, block) in self.row(row).iter() {
                triplets.push((row, col, *block));
                if col != row {
                    triplets.push((col, row, transpose_block(block)));
                }
            }
        }
        let coordinates = triplets.iter().map(|&(i, j, _)| (i, j)).collect();
        let graph = MatrixGraph::from_coordinates_in_bounds(self.nrows(), self.ncols(), coordinates);
        let mut values = vec![B::zero_block(); graph.nnz()];
        for (i, j, block) in triplets {
            if let Some(slot) = graph.position(i, j) {
                add_block(&mut values[slot], |p, q| block.component(p, q));
            }
        }
        Self {
            graph: Arc::new(graph),
            values,
            symmetry: Symmetry::General,
        }
    }

    /// The lower triangle (including the diagonal) of a square matrix, as symmetric storage.
    ///
    /// The upper triangle is discarded without checking that it mirrors the lower one.
    pub fn to_symmetric(&self) -> Result<Self, SparseError> {
        if self.is_symmetric() {
            return Ok(self.clone());
        }
        if self.nrows() != self.ncols() || B::ROWS != B::COLS {
            return Err(SparseError::NotSquare {
                nrows: self.nrows() * B::ROWS,
                ncols: self.ncols() * B::COLS,
            });
        }
        let mut row_offsets = Vec::with_capacity(self.nrows() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for row in 0..self.nrows() {
            for (col, block) in self.row(row).iter().take_while(|&(col, _)| col <= row) {
                col_indices.push(col);
                values.push(*block);
            }
            row_offsets.push(col_indices.len());
        }
        let graph = MatrixGraph::from_parts(self.nrows(), self.ncols(), row_offsets, col_indices, false);
        Ok(Self {
            graph: Arc::new(graph),
            values,
            symmetry: Symmetry::Symmetric,
        })
    }

    /// Dense scalar matrix, with the implied upper triangle filled in for symmetric storage.
    pub fn to_dense(&self) -> DMatrix<B::Scalar> {
        let mut dense = DMatrix::zeros(self.nrows() * B::ROWS, self.ncols() * B::COLS);
        for row in 0..self.nrows() {
            for (col, block) in self.row(row).iter() {
                for q in 0..B::COLS {
                    for p in 0..B::ROWS {
                        let value = block.component(p, q);
                        dense[(B::ROWS * row + p, B::COLS * col + q)] = value;
                        if self.is_symmetric() && col != row {
                            dense[(B::COLS * col + q, B::ROWS * row + p)] = value;
                        }
                    }
                }
            }
        }
        dense
    }
}

/// Zeroed values for `graph`, first touched along `partition`.
pub(crate) fn zeroed_values<B: BlockEntry>(graph: &MatrixGraph, partition: &WorkPartition) -> Vec<B> {
    let nnz = graph.nnz();
    let mut values = Vec::with_capacity(nnz);
    partition
        .split_by_offsets_mut(&mut values.spare_capacity_mut()[..nnz], graph.row_offsets())
        .into_par_iter()
        .for_each(|chunk| {
            for value in chunk {
                value.write(B::zero_block());
            }
        });
    // All nnz values were initialized above
    unsafe { values.set_len(nnz) };
    values
}

fn check_symmetry<B: BlockEntry>(graph: &MatrixGraph, symmetry: Symmetry) -> Result<(), SparseError> {
    if symmetry == Symmetry::General {
        return Ok(());
    }
    if graph.nrows() != graph.ncols() || B::ROWS != B::COLS {
        return Err(SparseError::NotSquare {
            nrows: graph.nrows() * B::ROWS,
            ncols: graph.ncols() * B::COLS,
        });
    }
    let upper = (0..graph.nrows())
        .into_par_iter()
        .find_first(|&row| graph.row_indices(row).last().map_or(false, |&col| col > row));
    match upper {
        Some(row) => Err(SparseError::InvalidPattern(format!(
            "row {row} of a symmetric pattern has columns above the diagonal"
        ))),
        None => Ok(()),
    }
}

/// Concurrent access to the values of a [`SparseMatrix`].
///
/// The graph is read-only while the access exists. Records are the matrix rows.
pub struct SparseMatrixParAccess<'a, B> {
    graph: &'a MatrixGraph,
    values: *mut B,
    symmetry: Symmetry,
    marker: PhantomData<&'a mut [B]>,
}

impl<'a, B> Clone for SparseMatrixParAccess<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B> Copy for SparseMatrixParAccess<'a, B> {}

unsafe impl<'a, B: Send + Sync> Sync for SparseMatrixParAccess<'a, B> {}
unsafe impl<'a, B: Send + Sync> Send for SparseMatrixParAccess<'a, B> {}

impl<'a, B: BlockEntry> SparseMatrixParAccess<'a, B> {
    pub fn graph(&self) -> &'a MatrixGraph {
        self.graph
    }

    /// Add an element matrix with atomic updates, safe to call from any number of threads.
    ///
    /// See [`SparseMatrix::add_element_matrix`] for the layout of the element matrix.
    pub fn add_element_matrix_atomic(
        &self,
        row_dofs: &[usize],
        col_dofs: &[usize],
        element_matrix: DMatrixView<B::Scalar>,
    ) -> Result<(), SparseError> {
        scatter_element::<B, _>(self.graph, self.symmetry, row_dofs, col_dofs, &element_matrix, |slot, a, b| {
            // Every concurrent update of the matrix values goes through atomic additions
            unsafe {
                atomic_add_block(self.values.add(slot), |p, q| {
                    element_matrix[(B::ROWS * a + p, B::COLS * b + q)]
                })
            }
        })
    }

    /// Add an element matrix with plain updates.
    ///
    /// # Safety
    ///
    /// No other thread may concurrently update the rows named by `row_dofs`. This holds for
    /// elements of the same color in an element coloring.
    pub unsafe fn add_element_matrix_unsynchronized(
        &self,
        row_dofs: &[usize],
        col_dofs: &[usize],
        element_matrix: DMatrixView<B::Scalar>,
    ) -> Result<(), SparseError> {
        scatter_element::<B, _>(self.graph, self.symmetry, row_dofs, col_dofs, &element_matrix, |slot, a, b| {
            let block = &mut *self.values.add(slot);
            add_block(block, |p, q| element_matrix[(B::ROWS * a + p, B::COLS * b + q)])
        })
    }

    /// Add an element matrix with atomic updates on the rows selected by `atomic_rows` and plain
    /// updates on all other rows.
    ///
    /// # Safety
    ///
    /// No other thread may concurrently update the rows named by `row_dofs` for which
    /// `atomic_rows` returns `false`. This holds for elements of the same color in a coloring
    /// that excludes the atomic rows.
    pub unsafe fn add_element_matrix_with_atomic_rows<F>(
        &self,
        row_dofs: &[usize],
        col_dofs: &[usize],
        element_matrix: DMatrixView<B::Scalar>,
        atomic_rows: F,
    ) -> Result<(), SparseError>
    where
        F: Fn(usize) -> bool,
    {
        scatter_element::<B, _>(self.graph, self.symmetry, row_dofs, col_dofs, &element_matrix, |slot, a, b| {
            let component = |p: usize, q: usize| element_matrix[(B::ROWS * a + p, B::COLS * b + q)];
            if atomic_rows(row_dofs[a]) {
                atomic_add_block(self.values.add(slot), component)
            } else {
                add_block(&mut *self.values.add(slot), component)
            }
        })
    }
}

unsafe impl<'a, 'b, B: 'b + BlockEntry> ParallelIndexedAccess<'b> for SparseMatrixParAccess<'a, B>
where
    'a: 'b,
{
    type Record = BlockRow<'b, B>;
    type RecordMut = BlockRowMut<'b, B>;

    unsafe fn get_unchecked(&self, global_index: usize) -> Self::Record {
        let start = self.graph.row_offsets()[global_index];
        let col_indices = self.graph.row_indices(global_index);
        BlockRow {
            col_indices,
            values: std::slice::from_raw_parts(self.values.add(start), col_indices.len()),
        }
    }

    unsafe fn get_unchecked_mut(&self, global_index: usize) -> Self::RecordMut {
        let start = self.graph.row_offsets()[global_index];
        let col_indices = self.graph.row_indices(global_index);
        BlockRowMut {
            col_indices,
            values: std::slice::from_raw_parts_mut(self.values.add(start), col_indices.len()),
        }
    }
}

unsafe impl<'a, B: 'a + BlockEntry> ParallelIndexedCollection<'a> for SparseMatrix<B> {
    type Access = SparseMatrixParAccess<'a, B>;

    unsafe fn create_access(&'a mut self) -> Self::Access {
        self.par_access()
    }

    fn len(&self) -> usize {
        self.nrows()
    }
}

/// Plain-data form of a [`SparseMatrix`] used for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrixArchive<B> {
    pub nrows: usize,
    pub ncols: usize,
    pub nnz: usize,
    pub symmetric: bool,
    pub row_offsets: Vec<usize>,
    pub col_indices: Vec<usize>,
    pub values: Vec<B>,
}

impl<B: BlockEntry> From<SparseMatrix<B>> for SparseMatrixArchive<B> {
    fn from(matrix: SparseMatrix<B>) -> Self {
        let (nrows, ncols, nnz) = (matrix.nrows(), matrix.ncols(), matrix.nnz());
        let symmetric = matrix.is_symmetric();
        let (row_offsets, col_indices) = Arc::try_unwrap(matrix.graph).map_or_else(
            |graph| (graph.row_offsets().to_vec(), graph.col_indices().to_vec()),
            MatrixGraph::into_parts,
        );
        Self {
            nrows,
            ncols,
            nnz,
            symmetric,
            row_offsets,
            col_indices,
            values: matrix.values,
        }
    }
}

impl<B: BlockEntry> TryFrom<SparseMatrixArchive<B>> for SparseMatrix<B> {
    type Error = SparseError;

    fn try_from(archive: SparseMatrixArchive<B>) -> Result<Self, Self::Error> {
        if archive.col_indices.len() != archive.nnz {
            return Err(SparseError::InvalidPattern(format!(
                "archive declares {} non-zeros but holds {} column indices",
                archive.nnz,
                archive.col_indices.len()
            )));
        }
        let graph = MatrixGraph::try_from_offsets_and_indices(
            archive.nrows,
            archive.ncols,
            archive.row_offsets,
            archive.col_indices,
        )?;
        let symmetry = if archive.symmetric {
            Symmetry::Symmetric
        } else {
            Symmetry::General
        };
        Self::from_graph_and_values(graph, archive.values, symmetry)
    }
}

/// Expands blocks into scalar entries. Symmetric storage is expanded to the full matrix.
impl<'a, B: BlockEntry> TryFrom<&'a SparseMatrix<B>> for CsrMatrix<B::Scalar> {
    type Error = SparseError;

    fn try_from(matrix: &'a SparseMatrix<B>) -> Result<Self, Self::Error> {
        let full;
        let matrix = if matrix.is_symmetric() {
            full = matrix.to_full();
            &full
        } else {
            matrix
        };
        let nrows = matrix.nrows() * B::ROWS;
        let mut row_offsets = Vec::with_capacity(nrows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for row in 0..matrix.nrows() {
            let block_row = matrix.row(row);
            for p in 0..B::ROWS {
                for (col, block) in block_row.iter() {
                    for q in 0..B::COLS {
                        col_indices.push(B::COLS * col + q);
                        values.push(block.component(p, q));
                    }
                }
                row_offsets.push(col_indices.len());
            }
        }
        CsrMatrix::try_from_csr_data(nrows, matrix.ncols() * B::COLS, row_offsets, col_indices, values)
            .map_err(|err| SparseError::InvalidPattern(err.to_string()))
    }
}

impl<B: BlockEntry> fmt::Display for SparseMatrix<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..self.nrows() {
            write!(f, "row {row}:")?;
            for (col, block) in self.row(row).iter() {
                write!(f, " ({col}, {block:?})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
