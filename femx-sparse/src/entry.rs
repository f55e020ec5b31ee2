use femx_traits::{AtomicAdd, Real};
use nalgebra::SMatrix;
use std::fmt::Debug;

/// The value stored at each non-zero position of a [`SparseMatrix`](crate::SparseMatrix).
///
/// An entry is a dense `ROWS x COLS` block of scalars. Plain scalars are `1 x 1` blocks.
/// Element matrices address block `(i, j)` component `(p, q)` at row `ROWS * i + p` and
/// column `COLS * j + q`.
pub trait BlockEntry: Copy + Send + Sync + Debug + PartialEq + 'static {
    type Scalar: Real + AtomicAdd;

    const ROWS: usize;
    const COLS: usize;

    fn zero_block() -> Self;

    fn component(&self, r: usize, c: usize) -> Self::Scalar;

    fn component_mut(&mut self, r: usize, c: usize) -> &mut Self::Scalar;

    /// Pointer to component `(r, c)` of the block at `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid block and `(r, c)` must be within its shape.
    unsafe fn component_ptr(block: *mut Self, r: usize, c: usize) -> *mut Self::Scalar;
}

macro_rules! impl_scalar_entry {
    ($($scalar:ty),*) => {
        $(
            impl BlockEntry for $scalar {
                type Scalar = $scalar;

                const ROWS: usize = 1;
                const COLS: usize = 1;

                fn zero_block() -> Self {
                    0.0
                }

                fn component(&self, _r: usize, _c: usize) -> Self::Scalar {
                    *self
                }

                fn component_mut(&mut self, _r: usize, _c: usize) -> &mut Self::Scalar {
                    self
                }

                unsafe fn component_ptr(block: *mut Self, _r: usize, _c: usize) -> *mut Self::Scalar {
                    block
                }
            }
        )*
    };
}

impl_scalar_entry!(f32, f64);

impl<T, const R: usize, const C: usize> BlockEntry for SMatrix<T, R, C>
where
    T: Real + AtomicAdd,
{
    type Scalar = T;

    const ROWS: usize = R;
    const COLS: usize = C;

    fn zero_block() -> Self {
        Self::zeros()
    }

    fn component(&self, r: usize, c: usize) -> T {
        self[(r, c)]
    }

    fn component_mut(&mut self, r: usize, c: usize) -> &mut T {
        &mut self[(r, c)]
    }

    unsafe fn component_ptr(block: *mut Self, r: usize, c: usize) -> *mut T {
        // Fixed-size matrices store their components contiguously in column-major order
        block.cast::<T>().add(c * R + r)
    }
}

/// Atomically add `scale * m[(row0 + p, col0 + q)]` to every component `(p, q)` of the block.
///
/// # Safety
///
/// `block` must be valid and every concurrent access to it must be atomic.
pub(crate) unsafe fn atomic_add_block<B, F>(block: *mut B, component: F)
where
    B: BlockEntry,
    F: Fn(usize, usize) -> B::Scalar,
{
    for q in 0..B::COLS {
        for p in 0..B::ROWS {
            B::Scalar::atomic_add(B::component_ptr(block, p, q), component(p, q));
        }
    }
}

pub(crate) fn add_block<B, F>(block: &mut B, component: F)
where
    B: BlockEntry,
    F: Fn(usize, usize) -> B::Scalar,
{
    for q in 0..B::COLS {
        for p in 0..B::ROWS {
            *block.component_mut(p, q) += component(p, q);
        }
    }
}

pub(crate) fn transpose_block<B: BlockEntry>(block: &B) -> B {
    debug_assert_eq!(B::ROWS, B::COLS);
    let mut transposed = B::zero_block();
    for q in 0..B::COLS {
        for p in 0..B::ROWS {
            *transposed.component_mut(q, p) = block.component(p, q);
        }
    }
    transposed
}
