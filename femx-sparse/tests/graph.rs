use femx_sparse::incidence::inverse_incidence;
use femx_sparse::{IncidenceGraphBuilder, MatrixGraph, NestedVec, SparseError, EMPTY_SLOT};
use femx_traits::dof::{is_regular_dof, CONSTRAINED_DOF, UNUSED_DOF};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn chain_incidence() -> NestedVec<usize> {
    NestedVec::from(vec![vec![0, 1], vec![1, 2], vec![2, 3], vec![3, 4]])
}

#[test]
fn incidence_graph_chain_example() {
    let incidence = chain_incidence();
    let graph = IncidenceGraphBuilder::new(&incidence, &incidence, 5, 5)
        .build()
        .unwrap();

    assert_eq!(graph.nrows(), 5);
    assert_eq!(graph.ncols(), 5);
    assert_eq!(graph.row_indices(0), &[0, 1]);
    assert_eq!(graph.row_indices(1), &[0, 1, 2]);
    assert_eq!(graph.row_indices(2), &[1, 2, 3]);
    assert_eq!(graph.row_indices(3), &[2, 3, 4]);
    assert_eq!(graph.row_indices(4), &[3, 4]);
    assert_eq!(graph.row_offsets(), &[0, 2, 5, 8, 11, 13]);
    assert_eq!(graph.nnz(), 13);
    assert!(!graph.has_reserved_slots());
}

#[test]
fn incidence_graph_symmetric_keeps_lower_triangle() {
    let incidence = chain_incidence();
    let graph = IncidenceGraphBuilder::new(&incidence, &incidence, 5, 5)
        .symmetric(true)
        .build()
        .unwrap();

    assert_eq!(graph.row_offsets(), &[0, 1, 3, 5, 7, 9]);
    assert_eq!(graph.col_indices(), &[0, 0, 1, 1, 2, 2, 3, 3, 4]);
}

#[test]
fn incidence_graph_diagonal_covers_untouched_rows() {
    let incidence = NestedVec::from(vec![vec![0, 1], vec![3]]);

    let without = IncidenceGraphBuilder::new(&incidence, &incidence, 4, 4)
        .build()
        .unwrap();
    assert_eq!(without.row_indices(2), &[] as &[usize]);

    let with = IncidenceGraphBuilder::square(&incidence, 4).build().unwrap();
    assert_eq!(with.row_indices(0), &[0, 1]);
    assert_eq!(with.row_indices(1), &[0, 1]);
    assert_eq!(with.row_indices(2), &[2]);
    assert_eq!(with.row_indices(3), &[3]);
}

#[test]
fn incidence_graph_skips_irregular_dofs() {
    let incidence = NestedVec::from(vec![vec![1, UNUSED_DOF, 0], vec![CONSTRAINED_DOF, 2]]);
    let graph = IncidenceGraphBuilder::new(&incidence, &incidence, 3, 3)
        .build()
        .unwrap();

    assert_eq!(graph.row_indices(0), &[0, 1]);
    assert_eq!(graph.row_indices(1), &[0, 1]);
    assert_eq!(graph.row_indices(2), &[2]);
}

#[test]
fn incidence_graph_rectangular() {
    let rows = NestedVec::from(vec![vec![0, 1], vec![1]]);
    let cols = NestedVec::from(vec![vec![2, 0], vec![3]]);
    let graph = IncidenceGraphBuilder::new(&rows, &cols, 2, 4)
        .build()
        .unwrap();

    assert_eq!(graph.ncols(), 4);
    assert_eq!(graph.row_indices(0), &[0, 2]);
    assert_eq!(graph.row_indices(1), &[0, 2, 3]);
}

#[test]
fn incidence_graph_rejects_inconsistent_input() {
    let rows = NestedVec::from(vec![vec![0, 1], vec![1]]);
    let cols = NestedVec::from(vec![vec![0, 1]]);
    let err = IncidenceGraphBuilder::new(&rows, &cols, 2, 2)
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        SparseError::ElementCountMismatch {
            row_elements: 2,
            col_elements: 1
        }
    );

    let incidence = NestedVec::from(vec![vec![0, 1], vec![1, 5]]);
    let err = IncidenceGraphBuilder::new(&incidence, &incidence, 3, 3)
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        SparseError::IncidenceOutOfBounds {
            element: 1,
            dof: 5,
            bound: 3
        }
    );
}

#[test]
fn inverse_incidence_chain_example() {
    let inverse = inverse_incidence(&chain_incidence(), 6);
    let expected = NestedVec::from(vec![vec![0], vec![0, 1], vec![1, 2], vec![2, 3], vec![3], vec![]]);
    assert_eq!(inverse, expected);
}

#[test]
fn graph_positions() {
    let incidence = chain_incidence();
    let graph = IncidenceGraphBuilder::new(&incidence, &incidence, 5, 5)
        .build()
        .unwrap();

    assert_eq!(graph.get_position(1, 2), Ok(4));
    assert_eq!(graph.position(1, 2), Some(4));
    assert_eq!(graph.position(0, 4), None);
    assert_eq!(graph.get_position(0, 4), Err(SparseError::EntryNotFound { row: 0, col: 4 }));
    assert_eq!(
        graph.get_position(7, 0),
        Err(SparseError::IndexOutOfBounds {
            row: 7,
            col: 0,
            nrows: 5,
            ncols: 5
        })
    );

    let mut positions = Vec::new();
    graph
        .positions_sorted(1, &[0, 2, 2], &mut positions)
        .unwrap();
    assert_eq!(positions, vec![2, 4, 4]);
    assert_eq!(
        graph.positions_sorted(1, &[0, 3], &mut positions),
        Err(SparseError::EntryNotFound { row: 1, col: 3 })
    );
}

#[test]
fn graph_create_positions_in_reserved_slots() {
    let mut graph = MatrixGraph::with_max_per_row(3, 4, 2);
    assert!(graph.has_reserved_slots());
    assert_eq!(graph.nnz(), 6);
    assert_eq!(graph.row_capacity(0), 2);
    assert_eq!(graph.row_len(0), 0);

    assert_eq!(graph.create_position(0, 3), Ok(0));
    assert_eq!(graph.create_position(0, 1), Ok(0));
    assert_eq!(graph.row_indices(0), &[1, 3]);
    assert_eq!(graph.create_position(0, 3), Ok(1));
    assert_eq!(
        graph.create_position(0, 2),
        Err(SparseError::RowFull {
            row: 0,
            col: 2,
            capacity: 2
        })
    );
    assert_eq!(graph.create_position(2, 0), Ok(4));
    assert_eq!(graph.col_indices(), &[1, 3, EMPTY_SLOT, EMPTY_SLOT, 0, EMPTY_SLOT]);
    assert_eq!(graph.balance().len(), 3);

    graph.freeze();
    assert!(graph.is_frozen());
    assert_eq!(graph.create_position(0, 1), Ok(0));
    assert_eq!(graph.create_position(1, 0), Err(SparseError::PatternFrozen { row: 1, col: 0 }));
}

#[test]
fn graph_from_row_counts() {
    let graph = MatrixGraph::from_row_counts(&[1, 0, 3], 5);
    assert_eq!(graph.row_offsets(), &[0, 1, 1, 4]);
    assert_eq!(graph.row_capacity(2), 3);
    assert_eq!(graph.row_indices(2), &[] as &[usize]);
}

#[test]
fn graph_from_coordinates() {
    let graph = MatrixGraph::from_coordinates(3, 3, &[(1, 0), (0, 2), (1, 0), (0, 1)]).unwrap();
    assert_eq!(graph.row_offsets(), &[0, 2, 3, 3]);
    assert_eq!(graph.col_indices(), &[1, 2, 0]);

    assert_eq!(
        MatrixGraph::from_coordinates(3, 3, &[(0, 0), (1, 3)]),
        Err(SparseError::IndexOutOfBounds {
            row: 1,
            col: 3,
            nrows: 3,
            ncols: 3
        })
    );
}

#[test]
fn graph_try_from_offsets_and_indices() {
    let graph = MatrixGraph::try_from_offsets_and_indices(2, 3, vec![0, 2, 4], vec![0, 2, 1, EMPTY_SLOT]).unwrap();
    assert!(graph.has_reserved_slots());
    assert_eq!(graph.row_indices(1), &[1]);

    let invalid = [
        (vec![0, 2], vec![0, 1]),
        (vec![1, 2, 2], vec![0, 1]),
        (vec![0, 2, 1], vec![0, 1]),
        (vec![0, 2, 2], vec![1, 0]),
        (vec![0, 2, 2], vec![0, 3]),
        (vec![0, 2, 2], vec![EMPTY_SLOT, 1]),
    ];
    for (offsets, indices) in invalid {
        let result = MatrixGraph::try_from_offsets_and_indices(2, 3, offsets, indices);
        assert!(matches!(result, Err(SparseError::InvalidPattern(_))));
    }
}

fn incidence_strategy() -> impl Strategy<Value = (usize, Vec<Vec<usize>>)> {
    (1..20usize).prop_flat_map(|num_dofs| (Just(num_dofs), vec(vec(0..num_dofs, 0..6), 0..15)))
}

fn dof_strategy(num_dofs: usize) -> impl Strategy<Value = usize> {
    prop_oneof![8 => 0..num_dofs, 1 => Just(UNUSED_DOF), 1 => Just(CONSTRAINED_DOF)]
}

/// Separate row and column tables over the same elements, with `nrows != ncols`.
fn coupling_strategy() -> impl Strategy<Value = (usize, usize, Vec<Vec<usize>>, Vec<Vec<usize>>)> {
    (1..12usize, 1..8usize, any::<bool>())
        .prop_map(|(n, extra, wide)| if wide { (n, n + extra) } else { (n + extra, n) })
        .prop_flat_map(|(nrows, ncols)| {
            (0..15usize).prop_flat_map(move |num_elements| {
                (
                    Just(nrows),
                    Just(ncols),
                    vec(vec(dof_strategy(nrows), 0..6), num_elements),
                    vec(vec(dof_strategy(ncols), 0..6), num_elements),
                )
            })
        })
}

fn brute_force_coupling_rows(
    nrows: usize,
    row_elements: &[Vec<usize>],
    col_elements: &[Vec<usize>],
) -> Vec<Vec<usize>> {
    let mut rows = vec![BTreeSet::new(); nrows];
    for (row_dofs, col_dofs) in row_elements.iter().zip(col_elements) {
        for &i in row_dofs.iter().filter(|&&i| i < nrows) {
            rows[i].extend(col_dofs.iter().copied().filter(|&j| is_regular_dof(j)));
        }
    }
    rows.into_iter()
        .map(|row| row.into_iter().collect())
        .collect()
}

fn brute_force_rows(num_dofs: usize, elements: &[Vec<usize>], symmetric: bool) -> Vec<Vec<usize>> {
    let mut rows = vec![BTreeSet::new(); num_dofs];
    for element in elements {
        for &i in element {
            for &j in element {
                if !symmetric || j <= i {
                    rows[i].insert(j);
                }
            }
        }
    }
    rows.into_iter()
        .map(|row| row.into_iter().collect())
        .collect()
}

proptest! {
    #[test]
    fn incidence_graph_rows_are_element_unions((num_dofs, elements) in incidence_strategy(),
                                               symmetric in any::<bool>(),
                                               num_chunks in 1..5usize) {
        let incidence = NestedVec::from(&elements);
        let graph = IncidenceGraphBuilder::new(&incidence, &incidence, num_dofs, num_dofs)
            .symmetric(symmetric)
            .with_num_chunks(num_chunks)
            .build()
            .unwrap();

        let expected = brute_force_rows(num_dofs, &elements, symmetric);
        prop_assert_eq!(graph.nrows(), num_dofs);
        for (row, expected_row) in expected.iter().enumerate() {
            prop_assert_eq!(graph.row_indices(row), expected_row.as_slice());
        }
        prop_assert!(graph.col_indices().len() == graph.row_offsets()[num_dofs]);
    }

    #[test]
    fn incidence_graph_rows_are_row_col_unions((nrows, ncols, row_elements, col_elements) in coupling_strategy(),
                                               num_chunks in 1..8usize) {
        let row_incidence = NestedVec::from(&row_elements);
        let col_incidence = NestedVec::from(&col_elements);
        let graph = IncidenceGraphBuilder::new(&row_incidence, &col_incidence, nrows, ncols)
            .with_num_chunks(num_chunks)
            .build()
            .unwrap();

        let expected = brute_force_coupling_rows(nrows, &row_elements, &col_elements);
        prop_assert_eq!((graph.nrows(), graph.ncols()), (nrows, ncols));
        for (row, expected_row) in expected.iter().enumerate() {
            prop_assert_eq!(graph.row_indices(row), expected_row.as_slice());
        }
        prop_assert_eq!(graph.nnz(), expected.iter().map(Vec::len).sum::<usize>());
    }

    #[test]
    fn inverse_incidence_lists_every_element((num_dofs, elements) in incidence_strategy()) {
        let incidence = NestedVec::from(&elements);
        let inverse = inverse_incidence(&incidence, num_dofs);
        prop_assert_eq!(inverse.len(), num_dofs);
        for dof in 0..num_dofs {
            let mut expected = Vec::new();
            for (element, dofs) in elements.iter().enumerate() {
                expected.extend(dofs.iter().filter(|&&d| d == dof).map(|_| element));
            }
            prop_assert_eq!(inverse.get(dof).unwrap(), expected.as_slice());
        }
    }
}
