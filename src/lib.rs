//! femx
//! ====
//!
//! Concurrent construction and assembly of block sparse matrices for finite element solvers.
//!
//! The workspace is layered bottom-up:
//!
//! - [`traits`]: scalar traits, lock-free atomic addition and dof markers.
//! - [`nested_vec`]: ragged arrays used for incidence tables.
//! - [`paradis`]: work balancing, element coloring and parallel disjoint access.
//! - [`sparse`]: k-way merging, matrix graphs, block sparse matrices and sparse products.
//!
//! This crate adds the element-loop driver in [`assembly`] on top.
pub mod assembly;

pub extern crate femx_nested_vec as nested_vec;
pub extern crate femx_paradis as paradis;
pub extern crate femx_sparse as sparse;
pub extern crate femx_traits as traits;
pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

pub use assembly::global::{gather_incidence, SparseAssembler, SparseParAssembler};
pub use assembly::local::{ElementConnectivityAssembler, ElementMatrixAssembler, MapElementDofs};
