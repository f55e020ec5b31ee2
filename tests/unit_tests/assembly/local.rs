use super::{quad_grid, MockElementAssembler};
use femx::sparse::Symmetry;
use femx::traits::dof::UNUSED_DOF;
use femx::{ElementConnectivityAssembler, SparseAssembler, SparseParAssembler};
use matrixcompare::assert_matrix_eq;
use util::dense_scatter;

#[test]
fn map_element_dofs_offsets_into_larger_matrix() {
    let grid = quad_grid(2, 1);
    let offset = grid.num_dofs;
    let mapped = grid.clone().map_element_dofs(2 * offset, 2 * offset, move |dof| dof + offset);

    assert_eq!(mapped.num_elements(), 2);
    assert_eq!((mapped.num_rows(), mapped.num_cols()), (12, 12));
    let mut dofs = vec![0; 4];
    mapped.populate_element_row_dofs(&mut dofs, 1);
    assert_eq!(dofs, vec![7, 8, 11, 10]);
    mapped.populate_element_col_dofs(&mut dofs, 0);
    assert_eq!(dofs, vec![6, 7, 10, 9]);

    let matrix = SparseAssembler::<f64>::default()
        .assemble(&mapped)
        .unwrap();
    let shifted: Vec<_> = grid
        .element_matrices(1)
        .into_iter()
        .map(|(dofs, element_matrix)| (dofs.iter().map(|&dof| dof + offset).collect(), element_matrix))
        .collect();
    let expected = dense_scatter(12, 1, &shifted);
    assert_matrix_eq!(matrix.to_dense(), expected, comp = abs, tol = 1e-12);
    assert!(matrix.graph().row_indices(0).is_empty());
}

#[test]
fn map_element_dofs_keeps_irregular_markers() {
    let mock = MockElementAssembler {
        num_dofs: 2,
        element_dofs: vec![vec![0, UNUSED_DOF, 1]],
    };
    let mapped = mock.map_element_dofs(2, 2, |dof| 1 - dof);
    let mut dofs = vec![0; 3];
    mapped.populate_element_row_dofs(&mut dofs, 0);
    assert_eq!(dofs, vec![1, UNUSED_DOF, 0]);

    let matrix = SparseParAssembler::<f64>::new(Symmetry::Symmetric)
        .assemble(&mapped)
        .unwrap();
    // The element matrix is symmetric, so swapping both dofs transposes the assembled matrix
    let reference = dense_scatter(2, 1, &[(vec![1, UNUSED_DOF, 0], mapped_element_matrix())]);
    assert_matrix_eq!(matrix.to_dense(), reference, comp = abs, tol = 1e-12);
}

fn mapped_element_matrix() -> nalgebra::DMatrix<f64> {
    MockElementAssembler {
        num_dofs: 2,
        element_dofs: vec![vec![0, UNUSED_DOF, 1]],
    }
    .element_matrices(1)
    .remove(0)
    .1
}

#[test]
fn assemblers_accept_trait_objects() {
    let grid = quad_grid(2, 2);
    let dynamic: &(dyn femx::ElementMatrixAssembler<f64> + Sync) = &grid;
    let serial = SparseAssembler::<f64>::default()
        .assemble(dynamic)
        .unwrap();
    let colored = SparseParAssembler::<f64>::default()
        .assemble(dynamic)
        .unwrap();
    assert_eq!(serial.graph(), colored.graph());
    assert_matrix_eq!(serial.to_dense(), colored.to_dense(), comp = abs, tol = 1e-12);
}
