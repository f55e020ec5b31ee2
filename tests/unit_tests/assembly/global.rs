use super::{quad_grid, MockElementAssembler};
use femx::paradis::coloring::sequential_greedy_coloring;
use femx::sparse::{MatrixGraph, NestedVec, SparseError, SparseMatrix, Symmetry};
use femx::traits::dof::{CONSTRAINED_DOF, UNUSED_DOF};
use femx::{gather_incidence, ElementConnectivityAssembler, ElementMatrixAssembler, SparseAssembler, SparseParAssembler};
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DMatrixViewMut, Matrix2};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::HashSet;
use util::dense_scatter;

fn mock_pattern_assembler() -> MockElementAssembler {
    MockElementAssembler {
        num_dofs: 6,
        element_dofs: vec![vec![0, 1, 2], vec![2, 3], vec![], vec![3, 4, 4, 4, 4, 4, 4]],
    }
}

#[test]
fn assemble_mock_pattern() {
    // Empty pattern
    {
        let assembler = MockElementAssembler {
            num_dofs: 0,
            element_dofs: vec![vec![]],
        };
        let expected = MatrixGraph::try_from_offsets_and_indices(0, 0, vec![0], vec![]).unwrap();
        assert_eq!(SparseAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
        assert_eq!(SparseParAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
    }

    // Empty pattern, no elements touching any dof
    {
        let assembler = MockElementAssembler {
            num_dofs: 5,
            element_dofs: vec![vec![]],
        };
        let expected = MatrixGraph::try_from_offsets_and_indices(5, 5, vec![0; 6], vec![]).unwrap();
        assert_eq!(SparseAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
        assert_eq!(SparseParAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
    }

    // Simple pattern with an empty element and repeated dofs
    {
        let assembler = mock_pattern_assembler();
        let expected = MatrixGraph::try_from_offsets_and_indices(
            6,
            6,
            vec![0, 3, 6, 10, 13, 15, 15],
            vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 3, 2, 3, 4, 3, 4],
        )
        .unwrap();
        assert_eq!(SparseAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
        assert_eq!(SparseParAssembler::<f64>::default().assemble_pattern(&assembler).unwrap(), expected);
    }

    // Same pattern, lower triangle only
    {
        let assembler = mock_pattern_assembler();
        let expected = MatrixGraph::try_from_offsets_and_indices(
            6,
            6,
            vec![0, 1, 3, 6, 8, 10, 10],
            vec![0, 0, 1, 0, 1, 2, 2, 3, 3, 4],
        )
        .unwrap();
        let serial = SparseAssembler::<f64>::new(Symmetry::Symmetric);
        let par = SparseParAssembler::<f64>::new(Symmetry::Symmetric);
        assert_eq!(serial.assemble_pattern(&assembler).unwrap(), expected);
        assert_eq!(par.assemble_pattern(&assembler).unwrap(), expected);
    }
}

#[test]
fn gather_incidence_collects_element_dofs() {
    let assembler = mock_pattern_assembler();
    let (rows, cols) = gather_incidence(&assembler);
    let expected = NestedVec::from(&assembler.element_dofs);
    assert_eq!(rows, expected);
    assert_eq!(cols, expected);

    let (rows, _) = gather_incidence(&quad_grid(3, 2));
    assert_eq!(rows.len(), 6);
    assert_eq!(rows.get(4), Some(&[5, 6, 10, 9][..]));
}

#[test]
fn assemblers_agree_with_dense_reference_on_grid() {
    let assembler = quad_grid(4, 3);
    let expected = dense_scatter(assembler.num_dofs, 1, &assembler.element_matrices(1));

    for symmetry in [Symmetry::General, Symmetry::Symmetric] {
        let serial = SparseAssembler::<f64>::new(symmetry);
        let mut serial_matrix = serial.assemble(&assembler).unwrap();
        assert_eq!(serial_matrix.symmetry(), symmetry);
        assert_matrix_eq!(serial_matrix.to_dense(), expected, comp = abs, tol = 1e-12);

        let par = SparseParAssembler::<f64>::new(symmetry);
        let colored = par.assemble(&assembler).unwrap();
        assert_eq!(colored.graph(), serial_matrix.graph());
        assert_matrix_eq!(colored.to_dense(), expected, comp = abs, tol = 1e-12);

        let mut atomic = SparseMatrix::from_graph(par.assemble_pattern(&assembler).unwrap(), symmetry).unwrap();
        par.assemble_into_atomic(&mut atomic, &assembler).unwrap();
        assert_matrix_eq!(atomic.to_dense(), expected, comp = abs, tol = 1e-12);

        // Assembling into an existing matrix accumulates
        serial.assemble_into(&mut serial_matrix, &assembler).unwrap();
        assert_matrix_eq!(serial_matrix.to_dense(), &expected * 2.0, comp = abs, tol = 1e-12);
    }
}

#[test]
fn element_colors_are_valid() {
    let assembler = quad_grid(5, 4);
    let colors = SparseParAssembler::<f64>::default().color_elements(&assembler);

    let mut seen = vec![0; assembler.num_elements()];
    for color in &colors {
        let mut dofs_in_color = HashSet::new();
        for (subset, &element) in color.subsets().iter().zip(color.labels()) {
            seen[element] += 1;
            let mut expected = assembler.element_dofs[element].clone();
            expected.sort_unstable();
            assert_eq!(subset, expected.as_slice());
            for &dof in subset {
                assert!(dofs_in_color.insert(dof), "dof {dof} shared within a color");
            }
        }
    }
    assert!(seen.iter().all(|&count| count == 1));
    // Interior vertices of a quad grid touch four elements
    assert!(colors.len() >= 4);
}

#[test]
fn assemble_into_colored_accepts_sequential_coloring() {
    let assembler = quad_grid(3, 3);
    let par = SparseParAssembler::<f64>::default();
    let (rows, _) = gather_incidence(&assembler);
    let colors = sequential_greedy_coloring(&rows);

    let mut matrix = SparseMatrix::from_graph(par.assemble_pattern(&assembler).unwrap(), Symmetry::General).unwrap();
    par.assemble_into_colored(&mut matrix, &colors, &assembler)
        .unwrap();

    let expected = dense_scatter(assembler.num_dofs, 1, &assembler.element_matrices(1));
    assert_matrix_eq!(matrix.to_dense(), expected, comp = abs, tol = 1e-12);
}

#[test]
fn colored_assembly_with_atomic_hub_row() {
    // Every element also couples to one extra dof, as with a global constraint
    let mut assembler = quad_grid(6, 5);
    let hub = assembler.num_dofs;
    assembler.num_dofs += 1;
    assembler.element_dofs.iter_mut().for_each(|dofs| dofs.push(hub));
    let expected = dense_scatter(assembler.num_dofs, 1, &assembler.element_matrices(1));

    for symmetry in [Symmetry::General, Symmetry::Symmetric] {
        let par = SparseParAssembler::<f64>::new(symmetry);
        assert_eq!(par.color_elements(&assembler).len(), assembler.num_elements());

        let is_hub = |dof: usize| dof == hub;
        let colors = par.color_elements_with_atomic_rows(&assembler, is_hub);
        // Each quad has at most 8 neighbors once the hub is ignored
        assert!(colors.len() <= 9);
        assert!(colors
            .iter()
            .all(|color| color.subsets().iter_array_elements().all(|&dof| dof != hub)));

        let mut matrix = SparseMatrix::from_graph(par.assemble_pattern(&assembler).unwrap(), symmetry).unwrap();
        par.assemble_into_colored_with_atomic_rows(&mut matrix, &colors, &assembler, is_hub)
            .unwrap();
        assert_matrix_eq!(matrix.to_dense(), expected, comp = abs, tol = 1e-10);
    }
}

#[test]
fn assemble_block_matrix() {
    let assembler = quad_grid(2, 2);
    let expected = dense_scatter(assembler.num_dofs, 2, &assembler.element_matrices(2));

    let serial = SparseAssembler::<Matrix2<f64>>::default()
        .assemble(&assembler)
        .unwrap();
    assert_eq!(serial.nrows(), 9);
    assert_matrix_eq!(serial.to_dense(), expected, comp = abs, tol = 1e-12);

    let par = SparseParAssembler::<Matrix2<f64>>::new(Symmetry::Symmetric);
    let colored = par.assemble(&assembler).unwrap();
    assert_matrix_eq!(colored.to_dense(), expected, comp = abs, tol = 1e-12);

    let mut atomic = SparseMatrix::from_graph(serial.graph_arc(), Symmetry::General).unwrap();
    par.assemble_into_atomic(&mut atomic, &assembler).unwrap();
    assert_matrix_eq!(atomic.to_dense(), expected, comp = abs, tol = 1e-12);
}

#[test]
fn assemble_skips_irregular_dofs() {
    let assembler = MockElementAssembler {
        num_dofs: 3,
        element_dofs: vec![vec![0, UNUSED_DOF, 2], vec![CONSTRAINED_DOF, 1, 2], vec![UNUSED_DOF]],
    };
    let expected = dense_scatter(3, 1, &assembler.element_matrices(1));

    for symmetry in [Symmetry::General, Symmetry::Symmetric] {
        let serial = SparseAssembler::<f64>::new(symmetry)
            .assemble(&assembler)
            .unwrap();
        assert_eq!(serial.get_entry(1, 0), None);
        assert_matrix_eq!(serial.to_dense(), expected, comp = abs, tol = 1e-12);

        let colored = SparseParAssembler::<f64>::new(symmetry)
            .assemble(&assembler)
            .unwrap();
        assert_matrix_eq!(colored.to_dense(), expected, comp = abs, tol = 1e-12);
    }
}

/// Couples the vertex dofs of each grid cell (rows) with a single dof per cell (columns).
struct CellCouplingAssembler {
    grid: MockElementAssembler,
}

impl ElementConnectivityAssembler for CellCouplingAssembler {
    fn num_elements(&self) -> usize {
        self.grid.num_elements()
    }

    fn num_rows(&self) -> usize {
        self.grid.num_rows()
    }

    fn num_cols(&self) -> usize {
        self.grid.num_elements()
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize {
        self.grid.element_row_dof_count(element_index)
    }

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize) {
        self.grid.populate_element_row_dofs(output, element_index)
    }

    fn element_col_dof_count(&self, _element_index: usize) -> usize {
        1
    }

    fn populate_element_col_dofs(&self, output: &mut [usize], element_index: usize) {
        output[0] = element_index;
    }
}

impl ElementMatrixAssembler<f64> for CellCouplingAssembler {
    fn assemble_element_matrix_into(&self, element_index: usize, mut output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        for a in 0..output.nrows() {
            output[(a, 0)] = (element_index * 10 + a) as f64;
        }
        Ok(())
    }
}

#[test]
fn assemble_rectangular_coupling() {
    let assembler = CellCouplingAssembler { grid: quad_grid(3, 2) };
    let mut expected = DMatrix::zeros(12, 6);
    for (element, dofs) in assembler.grid.element_dofs.iter().enumerate() {
        for (a, &dof) in dofs.iter().enumerate() {
            expected[(dof, element)] += (element * 10 + a) as f64;
        }
    }

    let serial = SparseAssembler::<f64>::default()
        .assemble(&assembler)
        .unwrap();
    assert_eq!((serial.nrows(), serial.ncols()), (12, 6));
    assert_matrix_eq!(serial.to_dense(), expected, comp = abs, tol = 0.0);

    let par = SparseParAssembler::<f64>::default();
    let colored = par.assemble(&assembler).unwrap();
    assert_matrix_eq!(colored.to_dense(), expected, comp = abs, tol = 0.0);

    let mut atomic = SparseMatrix::from_graph(serial.graph_arc(), Symmetry::General).unwrap();
    par.assemble_into_atomic(&mut atomic, &assembler).unwrap();
    assert_matrix_eq!(atomic.to_dense(), expected, comp = abs, tol = 0.0);

    let err = SparseAssembler::<f64>::new(Symmetry::Symmetric)
        .assemble(&assembler)
        .unwrap_err();
    assert!(err.downcast_ref::<SparseError>().is_some());
}

struct FailingAssembler {
    mock: MockElementAssembler,
    failing_element: usize,
}

impl ElementConnectivityAssembler for FailingAssembler {
    fn num_elements(&self) -> usize {
        self.mock.num_elements()
    }

    fn num_rows(&self) -> usize {
        self.mock.num_rows()
    }

    fn element_row_dof_count(&self, element_index: usize) -> usize {
        self.mock.element_row_dof_count(element_index)
    }

    fn populate_element_row_dofs(&self, output: &mut [usize], element_index: usize) {
        self.mock.populate_element_row_dofs(output, element_index)
    }
}

impl ElementMatrixAssembler<f64> for FailingAssembler {
    fn assemble_element_matrix_into(&self, element_index: usize, output: DMatrixViewMut<f64>) -> eyre::Result<()> {
        if element_index == self.failing_element {
            Err(eyre::eyre!("element {element_index} is degenerate"))
        } else {
            ElementMatrixAssembler::<f64>::assemble_element_matrix_into(&self.mock, element_index, output)
        }
    }
}

#[test]
fn element_errors_are_propagated() {
    let assembler = FailingAssembler {
        mock: quad_grid(3, 3),
        failing_element: 4,
    };

    let err = SparseAssembler::<f64>::default()
        .assemble(&assembler)
        .unwrap_err();
    assert_eq!(err.to_string(), "failed to assemble the element matrix of element 4");
    assert!(err
        .chain()
        .any(|cause| cause.to_string() == "element 4 is degenerate"));

    let par = SparseParAssembler::<f64>::default();
    assert!(par.assemble(&assembler).is_err());
    let mut matrix = SparseMatrix::from_graph(par.assemble_pattern(&assembler).unwrap(), Symmetry::General).unwrap();
    let err = par
        .assemble_into_atomic(&mut matrix, &assembler)
        .unwrap_err();
    assert!(err
        .chain()
        .any(|cause| cause.to_string() == "element 4 is degenerate"));
}

#[test]
fn out_of_bounds_dofs_are_rejected() {
    let assembler = MockElementAssembler {
        num_dofs: 3,
        element_dofs: vec![vec![0, 1], vec![2, 7]],
    };
    let expected = SparseError::IncidenceOutOfBounds {
        element: 1,
        dof: 7,
        bound: 3,
    };
    let err = SparseAssembler::<f64>::default()
        .assemble_pattern(&assembler)
        .unwrap_err();
    assert_eq!(err.downcast_ref::<SparseError>(), Some(&expected));
    let err = SparseParAssembler::<f64>::default()
        .assemble(&assembler)
        .unwrap_err();
    assert_eq!(err.downcast_ref::<SparseError>(), Some(&expected));

    // Element dofs missing from an existing matrix are reported per element
    let assembler = MockElementAssembler {
        num_dofs: 3,
        element_dofs: vec![vec![0, 1, 2]],
    };
    let mut matrix = SparseMatrix::<f64>::from_triplets(3, 3, &[(0, 0, 1.0)], Symmetry::General).unwrap();
    let err = SparseAssembler::<f64>::default()
        .assemble_into(&mut matrix, &assembler)
        .unwrap_err();
    assert_eq!(err.to_string(), "failed to add the element matrix of element 0");
    assert_eq!(matrix.values(), &[1.0]);
}

fn mock_assembler_strategy() -> impl Strategy<Value = MockElementAssembler> {
    (1..12usize).prop_flat_map(|num_dofs| {
        let dof = prop_oneof![8 => 0..num_dofs, 1 => Just(UNUSED_DOF), 1 => Just(CONSTRAINED_DOF)];
        vec(vec(dof, 0..5), 0..15).prop_map(move |element_dofs| MockElementAssembler {
            num_dofs,
            element_dofs,
        })
    })
}

proptest! {
    #[test]
    fn assemblers_agree_with_dense_reference(assembler in mock_assembler_strategy(), symmetric in any::<bool>()) {
        let symmetry = if symmetric { Symmetry::Symmetric } else { Symmetry::General };
        let expected = dense_scatter(assembler.num_dofs, 1, &assembler.element_matrices(1));

        let serial = SparseAssembler::<f64>::new(symmetry).assemble(&assembler).unwrap();
        assert_matrix_eq!(serial.to_dense(), expected, comp = abs, tol = 1e-10);

        let par = SparseParAssembler::<f64>::new(symmetry);
        let colored = par.assemble(&assembler).unwrap();
        prop_assert_eq!(colored.graph(), serial.graph());
        assert_matrix_eq!(colored.to_dense(), expected, comp = abs, tol = 1e-10);

        let mut atomic = SparseMatrix::from_graph(serial.graph_arc(), symmetry).unwrap();
        par.assemble_into_atomic(&mut atomic, &assembler).unwrap();
        assert_matrix_eq!(atomic.to_dense(), expected, comp = abs, tol = 1e-10);
    }
}
