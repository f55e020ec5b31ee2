use femx::{ElementConnectivityAssembler, ElementMatrixAssembler};
use nalgebra::{DMatrix, DMatrixViewMut, Matrix2};

mod global;
mod local;

/// Element assembler over explicit dof lists with a deterministic symmetric element matrix.
#[derive(Debug, Clone)]
pub struct MockElementAssembler {
    pub num_dofs: usize,
    pub element_dofs: Vec<Vec<usize>>,
}

impl MockElementAssembler {
    /// Dense element matrices of every element with square blocks of size `block`.
    pub fn element_matrices(&self, block: usize) -> Vec<(Vec<usize>, DMatrix<f64>)> {
        self.element_dofs
            .iter()
            .enumerate()
            .map(|(element, dofs)| {
                let n = block * dofs.len();
                let mut matrix = DMatrix::zeros(n, n);
                mock_element_matrix(element, DMatrixViewMut::from(&mut matrix));
                (dofs.clone(), matrix)
            })
            .collect()
    }
}

fn mock_element_matrix(element: usize, mut output: DMatrixViewMut<f64>) {
    for r in 0..output.nrows() {
        for c in 0..output.ncols() {
            let diagonal = if r == c { 4.0 } else { 0.0 };
            output[(r, c)] = (element + 1) as f64 + 0.25 * (r + c) as f64 + diagonal;
        }
    }
}

impl ElementConnectivityAssembler for MockElementAssembler {
    fn num_elements(&self) -> usize {
        self.element_dofs.len()
    }

    fn num_rows(&self) -> usize {
        self.num_dofs
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize {
        self.element_dofs[element_index].len()
    }

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize) {
        output.copy_from_slice(&self.element_dofs[element_index]);
    }
}

impl ElementMatrixAssembler<f64> for MockElementAssembler {
    fn assemble_element_matrix_into(&self, element_index: usize, output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        mock_element_matrix(element_index, output);
        Ok(())
    }
}

impl ElementMatrixAssembler<Matrix2<f64>> for MockElementAssembler {
    fn assemble_element_matrix_into(&self, element_index: usize, output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        mock_element_matrix(element_index, output);
        Ok(())
    }
}

/// Quadrilateral elements of an `nx x ny` grid, with vertices numbered row by row.
pub fn quad_grid(nx: usize, ny: usize) -> MockElementAssembler {
    let vertex = |i: usize, j: usize| j * (nx + 1) + i;
    let element_dofs = (0..ny)
        .flat_map(|j| {
            (0..nx).map(move |i| vec![vertex(i, j), vertex(i + 1, j), vertex(i + 1, j + 1), vertex(i, j + 1)])
        })
        .collect();
    MockElementAssembler {
        num_dofs: (nx + 1) * (ny + 1),
        element_dofs,
    }
}
