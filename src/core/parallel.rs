//! Parallel primitives.

#![allow(dead_code)]

use crate::core::pbrt::{bits_to_float, float_to_bits, Float};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Implement atomic floating point value using `AtomicU32`.
pub struct AtomicFloat {
    /// Bit representation of floating point value.
    bits: AtomicU32,
}

impl AtomicFloat {
    /// Create a new `AtomicFloat`.
    ///
    /// * `v` - The value.
    pub fn new(v: Float) -> Self {
        Self {
            bits: AtomicU32::new(float_to_bits(v)),
        }
    }

    /// Returns the current value.
    pub fn load(&self) -> Float {
        bits_to_float(self.bits.load(Ordering::Relaxed))
    }

    /// Stores a value.
    ///
    /// * `v` - The value to store.
    pub fn store(&self, v: Float) {
        self.bits.store(float_to_bits(v), Ordering::Relaxed);
    }

    /// Add a floating point value.
    ///
    /// * `v` - The value to add.
    pub fn add(&self, v: Float) {
        let mut old_bits: u32 = self.bits.load(Ordering::Relaxed);
        loop {
            let new_bits = float_to_bits(bits_to_float(old_bits) + v);
            let result = self
                .bits
                .compare_exchange_weak(old_bits, new_bits, Ordering::SeqCst, Ordering::Relaxed);
            match result {
                Ok(_) => break,
                Err(x) => {
                    old_bits = x;
                }
            }
        }
    }

    /// Raise the stored value to at least `v`.
    ///
    /// * `v` - The lower bound.
    pub fn fetch_max(&self, v: Float) {
        let mut old_bits: u32 = self.bits.load(Ordering::Relaxed);
        while v > bits_to_float(old_bits) {
            let result = self.bits.compare_exchange_weak(
                old_bits,
                float_to_bits(v),
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
            match result {
                Ok(_) => break,
                Err(x) => {
                    old_bits = x;
                }
            }
        }
    }

    /// Lower the stored value to at most `v`.
    ///
    /// * `v` - The upper bound.
    pub fn fetch_min(&self, v: Float) {
        let mut old_bits: u32 = self.bits.load(Ordering::Relaxed);
        while v < bits_to_float(old_bits) {
            let result = self.bits.compare_exchange_weak(
                old_bits,
                float_to_bits(v),
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
            match result {
                Ok(_) => break,
                Err(x) => {
                    old_bits = x;
                }
            }
        }
    }
}

impl Default for AtomicFloat {
    /// Returns the "default value" for `AtomicFloat`.
    fn default() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }
}

impl Clone for AtomicFloat {
    /// Snapshots the current value into a new `AtomicFloat`.
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

/// A test-and-set spin lock protecting a value. Contention is expected to be
/// rare and critical sections very short.
pub struct SpinLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new `SpinLock`.
    ///
    /// * `value` - The protected value.
    pub fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available. The returned guard
    /// releases the lock when dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.flag.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Returns a mutable reference to the value without locking. Requires
    /// exclusive access to the lock itself.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: Clone> Clone for SpinLock<T> {
    /// Snapshots the protected value into a new, unlocked `SpinLock`.
    fn clone(&self) -> Self {
        let guard = self.lock();
        Self::new(guard.clone())
    }
}

/// Scoped access to a locked `SpinLock`.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The flag is held, so no other thread can alias the value.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The flag is held, so no other thread can alias the value.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_adds_sum_up() {
        let f = Arc::new(AtomicFloat::new(0.0));
        let mut handles = vec![];
        for _ in 0..4 {
            let f = Arc::clone(&f);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    f.add(1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(f.load(), 4000.0);
    }

    #[test]
    fn fetch_max_monotonic() {
        let f = AtomicFloat::new(1.0);
        f.fetch_max(0.5);
        assert_eq!(f.load(), 1.0);
        f.fetch_max(2.5);
        assert_eq!(f.load(), 2.5);
    }

    #[test]
    fn fetch_min_monotonic() {
        let f = AtomicFloat::new(1.0);
        f.fetch_min(2.0);
        assert_eq!(f.load(), 1.0);
        f.fetch_min(0.25);
        assert_eq!(f.load(), 0.25);
    }

    #[test]
    fn spin_lock_serializes() {
        let lock = Arc::new(SpinLock::new(0_u64));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
