use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One parallel storage lane of a kernel: a vector shared between the
/// kernel and the work it schedules.
///
/// The container guarantees a lane is only mutated between cycles, so the
/// lock is never contended by the scheduler itself.
#[derive(Debug)]
pub struct SharedLane<T> {
    inner: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for SharedLane<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SharedLane<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedLane<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::with_capacity(capacity))),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, value: T) {
        self.write().push(value);
    }

    /// Move the last value into `index`. Returns the removed value.
    pub fn swap_remove(&self, index: usize) -> Option<T> {
        let mut values = self.write();
        (index < values.len()).then(|| values.swap_remove(index))
    }

    /// Overwrite `index`. Returns false if out of bounds.
    pub fn set(&self, index: usize, value: T) -> bool {
        match self.write().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every value and give the allocation back.
    pub fn clear_and_release(&self) {
        let mut values = self.write();
        values.clear();
        values.shrink_to_fit();
    }

    pub fn capacity(&self) -> usize {
        self.read().capacity()
    }
}

impl<T: Clone> SharedLane<T> {
    pub fn get(&self, index: usize) -> Option<T> {
        self.read().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.read().clone()
    }
}
