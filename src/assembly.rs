//! Element-loop assembly of sparse matrices.
//!
//! [`local`] holds the traits through which element kernels describe their dofs and element
//! matrices. [`global`] drives the element loop, building the matrix graph from the element
//! incidences and scattering element matrices serially, color by color, or atomically.
pub mod global;
pub mod local;
