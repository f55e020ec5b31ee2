use crate::assembly::local::{ElementConnectivityAssembler, ElementMatrixAssembler};

use eyre::WrapErr;
use log::debug;
use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, Scalar};
use num::Zero;
use rayon::prelude::*;
use thread_local::ThreadLocal;

use femx_nested_vec::NestedVec;
use femx_paradis::coloring::{parallel_greedy_coloring, parallel_greedy_coloring_excluding};
use femx_paradis::{balance, par_prefix_sum, DisjointSubsets};
use femx_sparse::{BlockEntry, IncidenceGraphBuilder, MatrixGraph, SparseMatrix, Symmetry};
use femx_traits::dof::UNUSED_DOF;

use std::cell::RefCell;

/// Collects the row and column incidence tables of all elements in parallel.
pub fn gather_incidence<A>(assembler: &A) -> (NestedVec<usize>, NestedVec<usize>)
where
    A: ?Sized + ElementConnectivityAssembler + Sync,
{
    (gather_row_incidence(assembler), gather_col_incidence(assembler))
}

fn gather_row_incidence<A>(assembler: &A) -> NestedVec<usize>
where
    A: ?Sized + ElementConnectivityAssembler + Sync,
{
    gather_dofs(
        assembler.num_elements(),
        |element| assembler.element_row_dof_count(element),
        |output, element| assembler.populate_element_row_dofs(output, element),
    )
}

fn gather_col_incidence<A>(assembler: &A) -> NestedVec<usize>
where
    A: ?Sized + ElementConnectivityAssembler + Sync,
{
    gather_dofs(
        assembler.num_elements(),
        |element| assembler.element_col_dof_count(element),
        |output, element| assembler.populate_element_col_dofs(output, element),
    )
}

fn gather_dofs<C, P>(num_elements: usize, count: C, populate: P) -> NestedVec<usize>
where
    C: Fn(usize) -> usize + Sync + Send,
    P: Fn(&mut [usize], usize) + Sync,
{
    let mut offsets: Vec<usize> = (0..num_elements).into_par_iter().map(&count).collect();
    let partition = balance(num_elements, |element| 1 + offsets[element]);
    let total = par_prefix_sum(&mut offsets, &partition);
    offsets.push(total);

    let mut dofs = vec![UNUSED_DOF; total];
    partition
        .split_by_offsets_mut(&mut dofs, &offsets)
        .into_par_iter()
        .zip(partition.par_ranges())
        .for_each(|(chunk, elements)| {
            let base = offsets[elements.start];
            for element in elements {
                populate(&mut chunk[offsets[element] - base..offsets[element + 1] - base], element);
            }
        });
    NestedVec::from_offsets_and_data(offsets, dofs)
}

#[derive(Debug, Clone)]
struct AssemblerWorkspace<T: Scalar> {
    // Buffers reused across elements and across assembled matrices
    row_dofs: Vec<usize>,
    col_dofs: Vec<usize>,
    element_matrix: DMatrix<T>,
}

impl<T: Scalar> Default for AssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            row_dofs: Vec::new(),
            col_dofs: Vec::new(),
            element_matrix: DMatrix::from_row_slice(0, 0, &[]),
        }
    }
}

impl<T: Scalar + Zero> AssemblerWorkspace<T> {
    /// Fetch the dofs of an element and compute its element matrix into the workspace.
    fn prepare_element<B, A>(&mut self, assembler: &A, element_index: usize) -> eyre::Result<()>
    where
        B: BlockEntry<Scalar = T>,
        A: ?Sized + ElementMatrixAssembler<B>,
    {
        let row_count = assembler.element_row_dof_count(element_index);
        let col_count = assembler.element_col_dof_count(element_index);
        self.row_dofs.resize(row_count, UNUSED_DOF);
        self.col_dofs.resize(col_count, UNUSED_DOF);
        assembler.populate_element_row_dofs(&mut self.row_dofs, element_index);
        assembler.populate_element_col_dofs(&mut self.col_dofs, element_index);

        self.element_matrix
            .resize_mut(B::ROWS * row_count, B::COLS * col_count, T::zero());
        self.element_matrix.fill(T::zero());
        assembler
            .assemble_element_matrix_into(element_index, DMatrixViewMut::from(&mut self.element_matrix))
            .wrap_err_with(|| format!("failed to assemble the element matrix of element {element_index}"))
    }

    fn element_matrix(&self) -> DMatrixView<T> {
        DMatrixView::from(&self.element_matrix)
    }
}

/// A serial assembler for sparse matrices.
#[derive(Debug, Clone)]
pub struct SparseAssembler<B: BlockEntry> {
    symmetry: Symmetry,
    workspace: RefCell<AssemblerWorkspace<B::Scalar>>,
}

impl<B: BlockEntry> Default for SparseAssembler<B> {
    fn default() -> Self {
        Self::new(Symmetry::General)
    }
}

impl<B: BlockEntry> SparseAssembler<B> {
    pub fn new(symmetry: Symmetry) -> Self {
        Self {
            symmetry,
            workspace: RefCell::new(AssemblerWorkspace::default()),
        }
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    /// The graph coupling the dofs of every element, built on a single chunk.
    pub fn assemble_pattern<A>(&self, assembler: &A) -> eyre::Result<MatrixGraph>
    where
        A: ?Sized + ElementConnectivityAssembler,
    {
        let ws = &mut *self.workspace.borrow_mut();
        let mut rows = NestedVec::new();
        let mut cols = NestedVec::new();
        for element in 0..assembler.num_elements() {
            ws.row_dofs
                .resize(assembler.element_row_dof_count(element), UNUSED_DOF);
            ws.col_dofs
                .resize(assembler.element_col_dof_count(element), UNUSED_DOF);
            assembler.populate_element_row_dofs(&mut ws.row_dofs, element);
            assembler.populate_element_col_dofs(&mut ws.col_dofs, element);
            rows.push(&ws.row_dofs);
            cols.push(&ws.col_dofs);
        }

        let graph = IncidenceGraphBuilder::new(&rows, &cols, assembler.num_rows(), assembler.num_cols())
            .symmetric(self.symmetry == Symmetry::Symmetric)
            .with_num_chunks(1)
            .build()?;
        Ok(graph)
    }

    pub fn assemble<A>(&self, assembler: &A) -> eyre::Result<SparseMatrix<B>>
    where
        A: ?Sized + ElementMatrixAssembler<B>,
    {
        let graph = self.assemble_pattern(assembler)?;
        let mut matrix = SparseMatrix::from_graph(graph, self.symmetry)?;
        self.assemble_into(&mut matrix, assembler)?;
        Ok(matrix)
    }

    /// Add the element matrices of every element to an existing matrix.
    pub fn assemble_into<A>(&self, matrix: &mut SparseMatrix<B>, assembler: &A) -> eyre::Result<()>
    where
        A: ?Sized + ElementMatrixAssembler<B>,
    {
        let ws = &mut *self.workspace.borrow_mut();
        for element in 0..assembler.num_elements() {
            ws.prepare_element::<B, A>(assembler, element)?;
            matrix
                .add_element_matrix(&ws.row_dofs, &ws.col_dofs, ws.element_matrix())
                .wrap_err_with(|| format!("failed to add the element matrix of element {element}"))?;
        }
        Ok(())
    }
}

/// A parallel assembler for sparse matrices.
///
/// Elements are either scattered color by color, where elements of the same color touch disjoint
/// rows and need no synchronization, or all at once with atomic additions.
#[derive(Debug)]
pub struct SparseParAssembler<B: BlockEntry> {
    symmetry: Symmetry,
    workspace: ThreadLocal<RefCell<AssemblerWorkspace<B::Scalar>>>,
}

impl<B: BlockEntry> Default for SparseParAssembler<B> {
    fn default() -> Self {
        Self::new(Symmetry::General)
    }
}

impl<B: BlockEntry> SparseParAssembler<B> {
    pub fn new(symmetry: Symmetry) -> Self {
        Self {
            symmetry,
            workspace: ThreadLocal::new(),
        }
    }

    pub fn symmetry(&self) -> Symmetry {
        self.symmetry
    }

    pub fn assemble_pattern<A>(&self, assembler: &A) -> eyre::Result<MatrixGraph>
    where
        A: ?Sized + ElementConnectivityAssembler + Sync,
    {
        let (rows, cols) = gather_incidence(assembler);
        self.build_graph(assembler, &rows, &cols)
    }

    fn build_graph<A>(
        &self,
        assembler: &A,
        rows: &NestedVec<usize>,
        cols: &NestedVec<usize>,
    ) -> eyre::Result<MatrixGraph>
    where
        A: ?Sized + ElementConnectivityAssembler,
    {
        let graph = IncidenceGraphBuilder::new(rows, cols, assembler.num_rows(), assembler.num_cols())
            .symmetric(self.symmetry == Symmetry::Symmetric)
            .build()?;
        Ok(graph)
    }

    /// Colors the elements so that elements of the same color share no row dof.
    pub fn color_elements<A>(&self, assembler: &A) -> Vec<DisjointSubsets>
    where
        A: ?Sized + ElementConnectivityAssembler + Sync,
    {
        parallel_greedy_coloring(&gather_row_incidence(assembler))
    }

    /// Colors the elements ignoring the rows selected by `atomic_rows`.
    ///
    /// Rows shared by many elements, such as those of a global constraint, would otherwise force
    /// one color per element. Use the result with
    /// [`assemble_into_colored_with_atomic_rows`](Self::assemble_into_colored_with_atomic_rows)
    /// and the same predicate.
    pub fn color_elements_with_atomic_rows<A, F>(&self, assembler: &A, atomic_rows: F) -> Vec<DisjointSubsets>
    where
        A: ?Sized + ElementConnectivityAssembler + Sync,
        F: Fn(usize) -> bool + Sync,
    {
        parallel_greedy_coloring_excluding(&gather_row_incidence(assembler), atomic_rows)
    }

    /// Builds the pattern and colors the elements from a single incidence pass, then assembles
    /// color by color.
    pub fn assemble<A>(&self, assembler: &A) -> eyre::Result<SparseMatrix<B>>
    where
        A: ?Sized + ElementMatrixAssembler<B> + Sync,
    {
        let (rows, cols) = gather_incidence(assembler);
        let graph = self.build_graph(assembler, &rows, &cols)?;
        let colors = parallel_greedy_coloring(&rows);
        let mut matrix = SparseMatrix::from_graph(graph, self.symmetry)?;
        self.assemble_into_colored(&mut matrix, &colors, assembler)?;
        Ok(matrix)
    }

    /// Adds all element matrices to `matrix`, running the elements of each color in parallel.
    ///
    /// `colors` must come from [`color_elements`](Self::color_elements) (or otherwise hold the
    /// sorted regular row dofs of each element, labeled by element index).
    ///
    /// Panics if a color references a row beyond the matrix.
    pub fn assemble_into_colored<A>(
        &self,
        matrix: &mut SparseMatrix<B>,
        colors: &[DisjointSubsets],
        assembler: &A,
    ) -> eyre::Result<()>
    where
        A: ?Sized + ElementMatrixAssembler<B> + Sync,
    {
        self.assemble_into_colored_with_atomic_rows(matrix, colors, assembler, |_| false)
    }

    /// Like [`assemble_into_colored`](Self::assemble_into_colored), but adds to the rows selected
    /// by `atomic_rows` with atomic updates.
    ///
    /// `colors` must come from
    /// [`color_elements_with_atomic_rows`](Self::color_elements_with_atomic_rows) with the same
    /// predicate, so that elements of one color only share atomic rows.
    pub fn assemble_into_colored_with_atomic_rows<A, F>(
        &self,
        matrix: &mut SparseMatrix<B>,
        colors: &[DisjointSubsets],
        assembler: &A,
        atomic_rows: F,
    ) -> eyre::Result<()>
    where
        A: ?Sized + ElementMatrixAssembler<B> + Sync,
        F: Fn(usize) -> bool + Sync,
    {
        for color in colors {
            color
                .subsets_par_iter(&mut *matrix)
                .map(|subset| {
                    let ws = &mut *self.workspace.get_or_default().borrow_mut();
                    let element = subset.label();
                    ws.prepare_element::<B, A>(assembler, element)?;
                    debug_assert!(ws
                        .row_dofs
                        .iter()
                        .filter(|&&dof| femx_traits::dof::is_regular_dof(dof) && !atomic_rows(dof))
                        .all(|dof| subset.global_indices().contains(dof)));

                    // Elements of one color only share atomic rows, every other row is written by one thread
                    let result = unsafe {
                        subset.access().add_element_matrix_with_atomic_rows(
                            &ws.row_dofs,
                            &ws.col_dofs,
                            ws.element_matrix(),
                            &atomic_rows,
                        )
                    };
                    result.wrap_err_with(|| format!("failed to add the element matrix of element {element}"))
                })
                .collect::<eyre::Result<()>>()?;
        }
        debug!(
            "Assembled {} elements in {} colors into a {}x{} matrix",
            assembler.num_elements(),
            colors.len(),
            matrix.nrows(),
            matrix.ncols()
        );
        Ok(())
    }

    /// Adds all element matrices to `matrix` in parallel using atomic additions.
    pub fn assemble_into_atomic<A>(&self, matrix: &mut SparseMatrix<B>, assembler: &A) -> eyre::Result<()>
    where
        A: ?Sized + ElementMatrixAssembler<B> + Sync,
    {
        let access = matrix.par_access();
        (0..assembler.num_elements())
            .into_par_iter()
            .with_min_len(16)
            .try_for_each(|element| {
                let ws = &mut *self.workspace.get_or_default().borrow_mut();
                ws.prepare_element::<B, A>(assembler, element)?;
                access
                    .add_element_matrix_atomic(&ws.row_dofs, &ws.col_dofs, ws.element_matrix())
                    .wrap_err_with(|| format!("failed to add the element matrix of element {element}"))
            })
    }
}
