use femx_traits::dof::is_regular_dof;
use nalgebra::{DMatrix, Scalar};
use num::Zero;
use std::ops::AddAssign;

/// Poor man's approx assertion for matrices
#[macro_export]
macro_rules! assert_approx_matrix_eq {
    ($x:expr, $y:expr, abstol = $tol:expr) => {{
        let diff = $x - $y;

        let max_absdiff = diff.abs().max();
        let approx_eq = max_absdiff <= $tol;

        if !approx_eq {
            println!("abstol: {:e}", $tol);
            println!("left: {}", $x);
            println!("right: {}", $y);
            println!("diff: {:e}", diff);
        }
        assert!(approx_eq);
    }};
}

#[macro_export]
macro_rules! assert_panics {
    ($e:expr) => {{
        use std::panic::catch_unwind;
        use std::stringify;
        let expr_string = stringify!($e);
        let result = catch_unwind(|| $e);
        if result.is_ok() {
            panic!("assert_panics!({}) failed.", expr_string);
        }
    }};
}

/// Dense reference for scattering `(dofs, element_matrix)` pairs into an `n x n` block matrix
/// with square blocks of size `block`.
///
/// Irregular dofs are skipped together with their rows and columns of the element matrix.
pub fn dense_scatter<T>(n: usize, block: usize, elements: &[(Vec<usize>, DMatrix<T>)]) -> DMatrix<T>
where
    T: Scalar + Zero + AddAssign + Copy,
{
    let mut dense = DMatrix::zeros(block * n, block * n);
    for (dofs, element_matrix) in elements {
        assert_eq!(element_matrix.shape(), (block * dofs.len(), block * dofs.len()));
        for (a, &row) in dofs.iter().enumerate().filter(|&(_, &d)| is_regular_dof(d)) {
            for (b, &col) in dofs.iter().enumerate().filter(|&(_, &d)| is_regular_dof(d)) {
                for p in 0..block {
                    for q in 0..block {
                        dense[(block * row + p, block * col + q)] += element_matrix[(block * a + p, block * b + q)];
                    }
                }
            }
        }
    }
    dense
}

/// Lower triangle (including the diagonal) of a square dense matrix.
pub fn lower_triangle<T: Scalar + Zero + Copy>(matrix: &DMatrix<T>) -> DMatrix<T> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| if j <= i { matrix[(i, j)] } else { T::zero() })
}
