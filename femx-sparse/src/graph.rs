use crate::incidence::{check_incidence_bounds, inverse_incidence, sorted_regular_subsets};
use crate::merge::KWayMerger;
use crate::SparseError;
use femx_nested_vec::NestedVec;
use femx_paradis::{par_prefix_sum, WorkPartition};
use log::debug;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::OnceLock;

/// Column index of a reserved slot that [`MatrixGraph::create_position`] has not filled yet.
pub const EMPTY_SLOT: usize = usize::MAX;

/// The non-zero pattern of a sparse matrix in compressed row form.
///
/// Columns within a row are stored strictly ascending. Graphs built with
/// [`MatrixGraph::from_row_counts`] or [`MatrixGraph::with_max_per_row`] reserve slots at the end
/// of each row, marked with [`EMPTY_SLOT`], into which positions can be inserted until the
/// graph is frozen.
#[derive(Debug, Clone)]
pub struct MatrixGraph {
    nrows: usize,
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    reserved: bool,
    frozen: bool,
    balance: OnceLock<WorkPartition>,
}

impl PartialEq for MatrixGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nrows == other.nrows
            && self.ncols == other.ncols
            && self.row_offsets == other.row_offsets
            && self.col_indices == other.col_indices
    }
}

impl Eq for MatrixGraph {}

impl MatrixGraph {
    pub(crate) fn from_parts(
        nrows: usize,
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        reserved: bool,
    ) -> Self {
        debug_assert_eq!(row_offsets.len(), nrows + 1);
        Self {
            nrows,
            ncols,
            row_offsets,
            col_indices,
            reserved,
            frozen: false,
            balance: OnceLock::new(),
        }
    }

    /// A graph whose row `i` reserves `counts[i]` empty slots.
    pub fn from_row_counts(counts: &[usize], ncols: usize) -> Self {
        let nrows = counts.len();
        let mut row_offsets = Vec::with_capacity(nrows + 1);
        row_offsets.extend_from_slice(counts);
        row_offsets.push(0);
        let partition = WorkPartition::uniform(nrows, rayon::current_num_threads());
        let nnz = par_prefix_sum(&mut row_offsets[..nrows], &partition);
        row_offsets[nrows] = nnz;
        Self::from_parts(nrows, ncols, row_offsets, vec![EMPTY_SLOT; nnz], true)
    }

    /// A graph reserving `max_per_row` empty slots in every row.
    pub fn with_max_per_row(nrows: usize, ncols: usize, max_per_row: usize) -> Self {
        Self::from_row_counts(&vec![max_per_row; nrows], ncols)
    }

    /// Construct from compressed row data, validating every invariant.
    ///
    /// Rows may end in [`EMPTY_SLOT`] entries, which become reserved slots.
    pub fn try_from_offsets_and_indices(
        nrows: usize,
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
    ) -> Result<Self, SparseError> {
        let invalid = |message: String| Err(SparseError::InvalidPattern(message));
        if row_offsets.len() != nrows + 1 {
            return invalid(format!("expected {} row offsets, got {}", nrows + 1, row_offsets.len()));
        }
        if row_offsets[0] != 0 {
            return invalid(String::from("first row offset must be zero"));
        }
        if row_offsets[nrows] != col_indices.len() {
            return invalid(format!(
                "last row offset {} does not match {} column indices",
                row_offsets[nrows],
                col_indices.len()
            ));
        }
        if let Some(row) = row_offsets.windows(2).position(|w| w[0] > w[1]) {
            return invalid(format!("row offsets decrease at row {row}"));
        }

        let problem = (0..nrows).into_par_iter().find_map_first(|row| {
            let cols = &col_indices[row_offsets[row]..row_offsets[row + 1]];
            let occupied = cols.partition_point(|&c| c != EMPTY_SLOT);
            if cols[occupied..].iter().any(|&c| c != EMPTY_SLOT) {
                Some(format!("row {row} has columns after an empty slot"))
            } else if cols[..occupied].windows(2).any(|w| w[0] >= w[1]) {
                Some(format!("columns of row {row} are not strictly ascending"))
            } else if cols[..occupied].last().map_or(false, |&c| c >= ncols) {
                Some(format!("row {row} has a column index out of bounds for {ncols} columns"))
            } else {
                None
            }
        });
        if let Some(message) = problem {
            return invalid(message);
        }

        let reserved = col_indices.par_iter().any(|&c| c == EMPTY_SLOT);
        Ok(Self::from_parts(nrows, ncols, row_offsets, col_indices, reserved))
    }

    /// Pattern of an unordered list of `(row, col)` coordinates, duplicates allowed.
    pub fn from_coordinates(nrows: usize, ncols: usize, coordinates: &[(usize, usize)]) -> Result<Self, SparseError> {
        if let Some(&(row, col)) = coordinates
            .par_iter()
            .find_first(|&&(row, col)| row >= nrows || col >= ncols)
        {
            return Err(SparseError::IndexOutOfBounds { row, col, nrows, ncols });
        }

        Ok(Self::from_coordinates_in_bounds(nrows, ncols, coordinates.to_vec()))
    }

    pub(crate) fn from_coordinates_in_bounds(nrows: usize, ncols: usize, mut coordinates: Vec<(usize, usize)>) -> Self {
        coordinates.par_sort_unstable();
        coordinates.dedup();

        let mut row_offsets = Vec::with_capacity(nrows + 1);
        let mut col_indices = Vec::with_capacity(coordinates.len());
        row_offsets.push(0);
        for (row, col) in coordinates {
            // Close every row up to and including the previous one
            while row_offsets.len() <= row {
                row_offsets.push(col_indices.len());
            }
            col_indices.push(col);
        }
        while row_offsets.len() < nrows + 1 {
            row_offsets.push(col_indices.len());
        }
        Self::from_parts(nrows, ncols, row_offsets, col_indices, false)
    }

    /// Build a pattern whose row `i` is the union of the sorted arrays gathered for it.
    ///
    /// A counting merge sizes every row, a parallel prefix sum lays the rows out, and a second
    /// merge writes the columns. Rows are processed in the chunks of `partition`, and each chunk
    /// first touches the part of the column array that it later fills.
    pub(crate) fn from_row_unions<'a, G>(nrows: usize, ncols: usize, partition: &WorkPartition, gather: G) -> Self
    where
        G: Fn(usize, &mut Vec<&'a [usize]>) + Sync,
    {
        assert_eq!(partition.len(), nrows);
        let mut row_offsets = vec![0; nrows + 1];
        partition
            .split_mut(&mut row_offsets[..nrows])
            .into_par_iter()
            .zip(partition.par_ranges())
            .for_each(|(counts, rows)| {
                let mut merger = KWayMerger::new();
                let mut arrays = Vec::new();
                for (count, row) in counts.iter_mut().zip(rows) {
                    arrays.clear();
                    gather(row, &mut arrays);
                    *count = merger.count(&arrays);
                }
            });
        let nnz = par_prefix_sum(&mut row_offsets[..nrows], partition);
        row_offsets[nrows] = nnz;

        let mut col_indices: Vec<usize> = Vec::with_capacity(nnz);
        partition
            .split_by_offsets_mut(&mut col_indices.spare_capacity_mut()[..nnz], &row_offsets)
            .into_par_iter()
            .for_each(|chunk| {
                for slot in chunk {
                    slot.write(0);
                }
            });
        // All nnz slots were initialized above
        unsafe { col_indices.set_len(nnz) };

        partition
            .split_by_offsets_mut(&mut col_indices, &row_offsets)
            .into_par_iter()
            .zip(partition.par_ranges())
            .for_each(|(chunk, rows)| {
                let mut merger = KWayMerger::new();
                let mut arrays = Vec::new();
                let base = row_offsets[rows.start];
                for row in rows {
                    arrays.clear();
                    gather(row, &mut arrays);
                    let output = &mut chunk[row_offsets[row] - base..row_offsets[row + 1] - base];
                    let written = merger.merge_into(&arrays, output);
                    debug_assert_eq!(written, output.len());
                }
            });

        Self::from_parts(nrows, ncols, row_offsets, col_indices, false)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of slots, including reserved ones.
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    /// All column indices, including [`EMPTY_SLOT`] entries of reserved slots.
    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn has_reserved_slots(&self) -> bool {
        self.reserved
    }

    /// Slot range of a row, including reserved slots.
    ///
    /// Panics if the row is out of bounds.
    pub fn row_range(&self, row: usize) -> Range<usize> {
        self.row_offsets[row]..self.row_offsets[row + 1]
    }

    pub fn row_capacity(&self, row: usize) -> usize {
        self.row_offsets[row + 1] - self.row_offsets[row]
    }

    /// Number of occupied slots in a row.
    pub fn row_len(&self, row: usize) -> usize {
        let cols = &self.col_indices[self.row_range(row)];
        if self.reserved {
            cols.partition_point(|&c| c != EMPTY_SLOT)
        } else {
            cols.len()
        }
    }

    /// Occupied column indices of a row, ascending.
    pub fn row_indices(&self, row: usize) -> &[usize] {
        let start = self.row_offsets[row];
        &self.col_indices[start..start + self.row_len(row)]
    }

    fn check_bounds(&self, row: usize, col: usize) -> Result<(), SparseError> {
        if row < self.nrows && col < self.ncols {
            Ok(())
        } else {
            Err(SparseError::IndexOutOfBounds {
                row,
                col,
                nrows: self.nrows,
                ncols: self.ncols,
            })
        }
    }

    /// Slot of `(row, col)` if it is part of the pattern.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        if row >= self.nrows {
            return None;
        }
        self.row_indices(row)
            .binary_search(&col)
            .ok()
            .map(|k| self.row_offsets[row] + k)
    }

    /// Slot of `(row, col)`, failing if it is not part of the pattern.
    pub fn get_position(&self, row: usize, col: usize) -> Result<usize, SparseError> {
        self.check_bounds(row, col)?;
        self.position(row, col)
            .ok_or(SparseError::EntryNotFound { row, col })
    }

    /// Slots of the ascending (duplicates allowed) columns `sorted_cols` within `row`.
    ///
    /// Walks the row once rather than searching for every column.
    pub fn positions_sorted(
        &self,
        row: usize,
        sorted_cols: &[usize],
        positions: &mut Vec<usize>,
    ) -> Result<(), SparseError> {
        positions.clear();
        if row >= self.nrows {
            let col = sorted_cols.first().copied().unwrap_or(0);
            return self.check_bounds(row, col);
        }
        let start = self.row_offsets[row];
        let cols = self.row_indices(row);
        let mut k = 0;
        for &col in sorted_cols {
            while k < cols.len() && cols[k] < col {
                k += 1;
            }
            if cols.get(k) != Some(&col) {
                self.check_bounds(row, col)?;
                return Err(SparseError::EntryNotFound { row, col });
            }
            positions.push(start + k);
        }
        Ok(())
    }

    /// Insert `(row, col)` into a reserved slot, returning its slot.
    ///
    /// Returns the existing slot if the position is already present.
    pub fn create_position(&mut self, row: usize, col: usize) -> Result<usize, SparseError> {
        self.insert_position(row, col).map(|(position, _)| position)
    }

    /// Like `create_position`, but also returns the slot range that was shifted by one to make
    /// room. The range is empty if nothing was inserted.
    pub(crate) fn insert_position(&mut self, row: usize, col: usize) -> Result<(usize, Range<usize>), SparseError> {
        self.check_bounds(row, col)?;
        if let Some(position) = self.position(row, col) {
            return Ok((position, position..position));
        }
        if self.frozen {
            return Err(SparseError::PatternFrozen { row, col });
        }
        let occupied = self.row_len(row);
        let capacity = self.row_capacity(row);
        if occupied == capacity {
            return Err(SparseError::RowFull { row, col, capacity });
        }

        let start = self.row_offsets[row];
        let position = start + self.row_indices(row).partition_point(|&c| c < col);
        let shifted = position..start + occupied + 1;
        self.col_indices[shifted.clone()].rotate_right(1);
        self.col_indices[position] = col;
        self.invalidate_balance();
        Ok((position, shifted))
    }

    /// Forbid further position creation.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Row partition balancing `1 + row capacity`, computed on first use.
    pub fn balance(&self) -> &WorkPartition {
        self.balance.get_or_init(|| {
            WorkPartition::balanced(self.nrows, rayon::current_num_threads(), |row| 1 + self.row_capacity(row))
        })
    }

    fn invalidate_balance(&mut self) {
        self.balance = OnceLock::new();
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<usize>) {
        (self.row_offsets, self.col_indices)
    }
}

/// Builds a [`MatrixGraph`] from element incidence tables.
///
/// Row `i` of the graph holds every column touched by an element whose row incidence contains
/// dof `i`. The builder inverts the row incidence table, then merges the (sorted) column
/// incidences of the elements at each row.
#[derive(Debug, Clone)]
pub struct IncidenceGraphBuilder<'a> {
    row_incidence: &'a NestedVec<usize>,
    col_incidence: &'a NestedVec<usize>,
    nrows: usize,
    ncols: usize,
    symmetric: bool,
    diagonal: bool,
    num_chunks: Option<usize>,
}

impl<'a> IncidenceGraphBuilder<'a> {
    pub fn new(
        row_incidence: &'a NestedVec<usize>,
        col_incidence: &'a NestedVec<usize>,
        nrows: usize,
        ncols: usize,
    ) -> Self {
        Self {
            row_incidence,
            col_incidence,
            nrows,
            ncols,
            symmetric: false,
            diagonal: false,
            num_chunks: None,
        }
    }

    /// Square pattern of a single incidence table, with an explicit diagonal.
    pub fn square(incidence: &'a NestedVec<usize>, num_dofs: usize) -> Self {
        Self::new(incidence, incidence, num_dofs, num_dofs).with_diagonal(true)
    }

    /// Only keep columns `<= row` in every row.
    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    /// Include `(i, i)` in every row `i` that has a matching column, even rows without elements.
    pub fn with_diagonal(mut self, diagonal: bool) -> Self {
        self.diagonal = diagonal;
        self
    }

    /// Number of row chunks processed in parallel. Defaults to the rayon thread count.
    pub fn with_num_chunks(mut self, num_chunks: usize) -> Self {
        self.num_chunks = Some(num_chunks);
        self
    }

    pub fn build(&self) -> Result<MatrixGraph, SparseError> {
        let (nrows, ncols) = (self.nrows, self.ncols);
        if self.row_incidence.len() != self.col_incidence.len() {
            return Err(SparseError::ElementCountMismatch {
                row_elements: self.row_incidence.len(),
                col_elements: self.col_incidence.len(),
            });
        }
        check_incidence_bounds(self.row_incidence, nrows)?;
        check_incidence_bounds(self.col_incidence, ncols)?;

        let columns = sorted_regular_subsets(self.col_incidence);
        let row_elements = inverse_incidence(self.row_incidence, nrows);
        // Backing storage for the single-entry diagonal arrays
        let diagonal: Vec<usize> = if self.diagonal {
            (0..nrows.min(ncols)).collect()
        } else {
            Vec::new()
        };

        let num_chunks = self.num_chunks.unwrap_or_else(rayon::current_num_threads);
        let partition = WorkPartition::balanced(nrows, num_chunks, |row| {
            let elements = row_elements.get(row).unwrap_or(&[]);
            1 + elements.iter().map(|&e| columns.array_len(e)).sum::<usize>()
        });

        let symmetric = self.symmetric;
        let graph = MatrixGraph::from_row_unions(nrows, ncols, &partition, |row, arrays| {
            for &element in row_elements.get(row).unwrap_or(&[]) {
                let cols = columns.get(element).unwrap_or(&[]);
                if symmetric {
                    arrays.push(&cols[..cols.partition_point(|&c| c <= row)]);
                } else {
                    arrays.push(cols);
                }
            }
            if let Some(diagonal) = diagonal.get(row..=row) {
                arrays.push(diagonal);
            }
        });

        debug!(
            "Built {}x{} graph from {} elements: {} non-zeros in {} chunks",
            nrows,
            ncols,
            self.row_incidence.len(),
            graph.nnz(),
            partition.num_chunks()
        );
        Ok(graph)
    }
}
