use femx_sparse::BlockEntry;
use nalgebra::DMatrixViewMut;

/// Describes which global dofs each element couples.
///
/// Row dofs index block rows of the assembled matrix, column dofs index block columns. Square
/// problems only implement the row methods; the column methods default to them. Dofs may be
/// [`UNUSED_DOF`](femx_traits::dof::UNUSED_DOF) or
/// [`CONSTRAINED_DOF`](femx_traits::dof::CONSTRAINED_DOF), in which case they are skipped during
/// pattern construction and assembly.
pub trait ElementConnectivityAssembler {
    fn num_elements(&self) -> usize;

    /// Number of block rows of the assembled matrix.
    fn num_rows(&self) -> usize;

    /// Number of block columns of the assembled matrix.
    fn num_cols(&self) -> usize {
        self.num_rows()
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize;

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize);

    fn element_col_dof_count(&self, element_index: usize) -> usize {
        self.element_row_dof_count(element_index)
    }

    fn populate_element_col_dofs(&self, output: &mut [usize], element_index: usize) {
        self.populate_element_row_dofs(output, element_index)
    }

    /// Returns an adapter that maps every element dof through the provided function.
    ///
    /// Changing the dof indices usually changes the size of the index space too, so the new
    /// number of rows and columns must be given. This is typically used to offset the dofs of one
    /// body so that it assembles into its block of a larger matrix.
    fn map_element_dofs<F>(self, num_rows: usize, num_cols: usize, f: F) -> MapElementDofs<Self, F>
    where
        Self: Sized,
        F: Fn(usize) -> usize,
    {
        MapElementDofs {
            mapped: self,
            function: f,
            num_rows,
            num_cols,
        }
    }
}

/// Produces the dense element matrix of an element.
///
/// The output has `B::ROWS * row_dof_count` rows and `B::COLS * col_dof_count` columns and is
/// zeroed before the call. Component `(p, q)` of the block coupling local dofs `(a, b)` lives at
/// row `B::ROWS * a + p` and column `B::COLS * b + q`.
pub trait ElementMatrixAssembler<B: BlockEntry>: ElementConnectivityAssembler {
    fn assemble_element_matrix_into(
        &self,
        element_index: usize,
        output: DMatrixViewMut<B::Scalar>,
    ) -> eyre::Result<()>;
}

impl<'a, A> ElementConnectivityAssembler for &'a A
where
    A: ?Sized + ElementConnectivityAssembler,
{
    fn num_elements(&self) -> usize {
        (**self).num_elements()
    }

    fn num_rows(&self) -> usize {
        (**self).num_rows()
    }

    fn num_cols(&self) -> usize {
        (**self).num_cols()
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize {
        (**self).element_row_dof_count(element_index)
    }

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize) {
        (**self).populate_element_row_dofs(output, element_index)
    }

    fn element_col_dof_count(&self, element_index: usize) -> usize {
        (**self).element_col_dof_count(element_index)
    }

    fn populate_element_col_dofs(&self, output: &mut [usize], element_index: usize) {
        (**self).populate_element_col_dofs(output, element_index)
    }
}

impl<'a, B, A> ElementMatrixAssembler<B> for &'a A
where
    B: BlockEntry,
    A: ?Sized + ElementMatrixAssembler<B>,
{
    fn assemble_element_matrix_into(
        &self,
        element_index: usize,
        output: DMatrixViewMut<B::Scalar>,
    ) -> eyre::Result<()> {
        (**self).assemble_element_matrix_into(element_index, output)
    }
}

#[derive(Debug, Clone)]
pub struct MapElementDofs<Mapped, F> {
    mapped: Mapped,
    function: F,
    num_rows: usize,
    num_cols: usize,
}

impl<Assembler, F> ElementConnectivityAssembler for MapElementDofs<Assembler, F>
where
    Assembler: ElementConnectivityAssembler,
    F: Fn(usize) -> usize,
{
    fn num_elements(&self) -> usize {
        self.mapped.num_elements()
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_cols
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize {
        self.mapped.element_row_dof_count(element_index)
    }

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize) {
        self.mapped.populate_element_row_dofs(output, element_index);
        map_dofs(output, &self.function);
    }

    fn element_col_dof_count(&self, element_index: usize) -> usize {
        self.mapped.element_col_dof_count(element_index)
    }

    fn populate_element_col_dofs(&self, output: &mut [usize], element_index: usize) {
        self.mapped.populate_element_col_dofs(output, element_index);
        map_dofs(output, &self.function);
    }
}

impl<B, Assembler, F> ElementMatrixAssembler<B> for MapElementDofs<Assembler, F>
where
    B: BlockEntry,
    Assembler: ElementMatrixAssembler<B>,
    F: Fn(usize) -> usize,
{
    fn assemble_element_matrix_into(
        &self,
        element_index: usize,
        output: DMatrixViewMut<B::Scalar>,
    ) -> eyre::Result<()> {
        self.mapped.assemble_element_matrix_into(element_index, output)
    }
}

// Irregular markers pass through untouched
fn map_dofs<F: Fn(usize) -> usize>(dofs: &mut [usize], f: &F) {
    for dof in dofs {
        if femx_traits::dof::is_regular_dof(*dof) {
            *dof = f(*dof);
        }
    }
}
