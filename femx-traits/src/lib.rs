use nalgebra::RealField;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use nalgebra;

pub mod dof;

pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Scalars that support a data-race-free `+=` through a raw pointer.
///
/// # Safety
///
/// Implementors must perform the addition as a single atomic read-modify-write on the
/// memory pointed to by `target`.
pub unsafe trait AtomicAdd: Sized {
    /// Atomically add `value` to the scalar stored at `target`.
    ///
    /// # Safety
    ///
    /// `target` must be valid for reads and writes, suitably aligned for the corresponding
    /// atomic integer type, and every concurrent access to the same location must also go
    /// through [`AtomicAdd::atomic_add`].
    unsafe fn atomic_add(target: *mut Self, value: Self);
}

unsafe impl AtomicAdd for f64 {
    unsafe fn atomic_add(target: *mut Self, value: Self) {
        debug_assert_eq!(target as usize % std::mem::align_of::<AtomicU64>(), 0);
        let atomic = AtomicU64::from_ptr(target.cast());
        let mut current = atomic.load(Ordering::Relaxed);
        loop {
            let updated = (f64::from_bits(current) + value).to_bits();
            match atomic.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

unsafe impl AtomicAdd for f32 {
    unsafe fn atomic_add(target: *mut Self, value: Self) {
        let atomic = AtomicU32::from_ptr(target.cast());
        let mut current = atomic.load(Ordering::Relaxed);
        loop {
            let updated = (f32::from_bits(current) + value).to_bits();
            match atomic.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}
