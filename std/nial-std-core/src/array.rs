//!
//! Runtime Array Type
//!
//! Fixed-length numeric arrays shared between host values. The element
//! storage is allocated once and never moves, so the address of the first
//! element stays valid for as long as the array is alive. Native code
//! reached through the FFI bridge may read and write through that address.
//!

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct NialArray<T> {
    data: Mutex<Box<[T]>>,
}

impl<T: Copy> NialArray<T> {
    pub fn from_vec(values: Vec<T>) -> Self {
        Self {
            data: Mutex::new(values.into_boxed_slice()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<[T]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Element at `index`, or `None` when out of bounds
    pub fn get(&self, index: usize) -> Option<T> {
        self.lock().get(index).copied()
    }

    /// Overwrite element at `index`; returns false when out of bounds
    pub fn set(&self, index: usize, value: T) -> bool {
        match self.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.lock().to_vec()
    }

    /// Address of the first element, or null for an empty array.
    ///
    /// The pointer is valid while `self` is alive. Writes through it must not
    /// overlap with calls to `set` from another thread.
    pub fn as_mut_ptr(&self) -> *mut T {
        let mut guard = self.lock();
        if guard.is_empty() {
            std::ptr::null_mut()
        } else {
            guard.as_mut_ptr()
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for NialArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}
