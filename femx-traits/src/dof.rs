//! Markers for degrees of freedom that do not correspond to a matrix row or column.
//!
//! Element dof lists may contain these reserved values in place of a regular index. They are
//! skipped by graph construction, coloring and scatter-add.

/// The local dof is not used by the element.
pub const UNUSED_DOF: usize = usize::MAX;

/// The local dof is eliminated by a constraint and owned elsewhere.
pub const CONSTRAINED_DOF: usize = usize::MAX - 1;

/// Returns `true` if `dof` is a regular index rather than one of the irregular markers.
#[inline]
pub fn is_regular_dof(dof: usize) -> bool {
    dof < CONSTRAINED_DOF
}

/// Iterate over the regular dofs of a dof list.
pub fn regular_dofs(dofs: &[usize]) -> impl '_ + Iterator<Item = usize> {
    dofs.iter().copied().filter(|&dof| is_regular_dof(dof))
}
