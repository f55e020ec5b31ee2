use std::error::Error;
use std::fmt;

/// Errors raised while building or addressing sparse patterns and matrices.
///
/// All variants describe caller-contract or capacity violations and carry the offending
/// indices.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SparseError {
    /// A row or column index lies outside the matrix.
    IndexOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    /// An incidence table references a dof beyond the declared number of rows or columns.
    IncidenceOutOfBounds { element: usize, dof: usize, bound: usize },
    /// Row and column incidence tables describe different numbers of elements.
    ElementCountMismatch { row_elements: usize, col_elements: usize },
    /// The position is not part of the pattern and the pattern cannot grow.
    EntryNotFound { row: usize, col: usize },
    /// All reserved slots of the row are occupied.
    RowFull { row: usize, col: usize, capacity: usize },
    /// The pattern has been frozen (or is shared) and can no longer be modified.
    PatternFrozen { row: usize, col: usize },
    /// The dense element matrix does not match the element's dof lists.
    ElementMatrixShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// Operand dimensions are incompatible.
    DimensionMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Symmetric storage requires a square pattern with square blocks.
    NotSquare { nrows: usize, ncols: usize },
    /// Offsets, column indices or values do not form a valid pattern.
    InvalidPattern(String),
}

impl fmt::Display for SparseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfBounds { row, col, nrows, ncols } => {
                write!(f, "position ({row}, {col}) is out of bounds for a {nrows}x{ncols} matrix")
            }
            Self::IncidenceOutOfBounds { element, dof, bound } => {
                write!(f, "element {element} references dof {dof}, but only {bound} dofs exist")
            }
            Self::ElementCountMismatch {
                row_elements,
                col_elements,
            } => write!(
                f,
                "row incidence has {row_elements} elements but column incidence has {col_elements}"
            ),
            Self::EntryNotFound { row, col } => write!(f, "illegal position ({row}, {col}): entry not found"),
            Self::RowFull { row, col, capacity } => write!(
                f,
                "cannot insert ({row}, {col}): row {row} is full ({capacity} slots)"
            ),
            Self::PatternFrozen { row, col } => {
                write!(f, "cannot insert ({row}, {col}): the pattern is frozen")
            }
            Self::ElementMatrixShape { expected, actual } => write!(
                f,
                "element matrix has shape {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::DimensionMismatch { left, right } => write!(
                f,
                "incompatible dimensions {}x{} and {}x{}",
                left.0, left.1, right.0, right.1
            ),
            Self::NotSquare { nrows, ncols } => {
                write!(f, "symmetric storage requires a square matrix, got {nrows}x{ncols}")
            }
            Self::InvalidPattern(message) => write!(f, "invalid sparsity pattern: {message}"),
        }
    }
}

impl Error for SparseError {}
