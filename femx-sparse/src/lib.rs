//! Concurrent construction of sparse matrix patterns and matrices for finite element assembly.
//!
//! The central types are [`MatrixGraph`], the (possibly growable) non-zero pattern of a matrix,
//! and [`SparseMatrix`], a matrix of dense blocks over a shared graph. Patterns are built from
//! element incidence tables by [`IncidenceGraphBuilder`], which unions sorted column lists with a
//! k-way merge in parallel over balanced row chunks.
mod error;

pub mod algebra;
pub mod entry;
pub mod graph;
pub mod incidence;
pub mod matrix;
pub mod merge;

pub use algebra::{mat_mult, restrict, transpose};
pub use entry::BlockEntry;
pub use error::SparseError;
pub use graph::{IncidenceGraphBuilder, MatrixGraph, EMPTY_SLOT};
pub use matrix::{BlockRow, BlockRowMut, SparseMatrix, SparseMatrixArchive, SparseMatrixParAccess, Symmetry};
pub use merge::KWayMerger;

pub use femx_nested_vec::NestedVec;
