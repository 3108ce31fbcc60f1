//! # Object Pool
//!
//! Free-list of reusable values with an explicit reset hook.
//!
//! The pool never blocks: when the free list is empty a new value is created, so
//! starvation is resolved by growing. A [`Pooled`] guard owns its value exclusively and
//! puts it back on drop; [`Pooled::detach`] takes the value out of the pool for good.
//! Values returned while `max_idle` values are already idle are freed instead, so a
//! burst does not pin its peak allocation forever.
//!
//! ```rust
//! use packet_engine::utils::pool::ObjectPool;
//!
//! let pool = ObjectPool::new(Vec::<u8>::new, |v: &mut Vec<u8>| v.clear());
//! {
//!     let mut v = pool.acquire();
//!     v.push(7);
//! }
//! assert_eq!(pool.available(), 1);
//! assert!(pool.acquire().is_empty());
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

type CreateFn<T> = dyn Fn() -> T + Send + Sync + 'static;

struct Shared<T> {
    free: Mutex<Vec<T>>,
    create: Box<CreateFn<T>>,
    reset: fn(&mut T),
    max_idle: usize,
}

/// Thread-safe pool of `T` values.
pub struct ObjectPool<T: Default + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Default + Send + 'static> ObjectPool<T> {
    /// Create an empty pool with no idle limit. `reset` runs on every acquire, before
    /// the value is handed out.
    pub fn new<F>(create: F, reset: fn(&mut T)) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_max_idle(create, reset, usize::MAX)
    }

    /// Create an empty pool keeping at most `max_idle` values on its free list.
    pub fn with_max_idle<F>(create: F, reset: fn(&mut T), max_idle: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                create: Box::new(create),
                reset,
                max_idle,
            }),
        }
    }

    /// Allocate up to `count` values up front, within the idle limit.
    pub fn prefill(&self, count: usize) {
        let count = count.min(self.shared.max_idle.saturating_sub(self.available()));
        let values: Vec<T> = (0..count).map(|_| (self.shared.create)()).collect();
        if let Ok(mut free) = self.shared.free.lock() {
            free.extend(values);
        }
    }

    /// Most values kept idle; returns beyond it are freed
    pub fn max_idle(&self) -> usize {
        self.shared.max_idle
    }

    /// Take a value from the free list, or create one if the list is empty.
    pub fn acquire(&self) -> Pooled<T> {
        let recycled = match self.shared.free.lock() {
            Ok(mut free) => free.pop(),
            Err(_) => None,
        };
        let mut value = recycled.unwrap_or_else(|| (self.shared.create)());
        (self.shared.reset)(&mut value);

        Pooled {
            value,
            shared: Some(self.shared.clone()),
        }
    }

    /// Number of idle values waiting in the pool
    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

impl<T: Default + Send + 'static> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Default + Send + 'static> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("available", &self.available())
            .field("max_idle", &self.shared.max_idle)
            .finish()
    }
}

/// A value borrowed from an [`ObjectPool`]; returned to the pool when dropped.
pub struct Pooled<T: Default + Send + 'static> {
    value: T,
    shared: Option<Arc<Shared<T>>>,
}

impl<T: Default + Send + 'static> Pooled<T> {
    /// Remove the value from pool management. It will be freed normally.
    pub fn detach(mut self) -> T {
        self.shared = None;
        std::mem::take(&mut self.value)
    }
}

impl<T: Default + Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let value = std::mem::take(&mut self.value);
            if let Ok(mut free) = shared.free.lock() {
                if free.len() < shared.max_idle {
                    free.push(value);
                }
            }
        }
    }
}

impl<T: Default + Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T: Default + Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: Default + Send + fmt::Debug + 'static> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reset_runs_on_acquire() {
        let pool = ObjectPool::new(|| vec![1u8, 2, 3], |v: &mut Vec<u8>| v.clear());
        let v = pool.acquire();
        assert!(v.is_empty());
    }

    #[test]
    fn test_value_returns_on_drop() {
        let pool = ObjectPool::new(String::new, |_| {});
        pool.prefill(2);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // grows
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_idle_values_are_capped() {
        let pool = ObjectPool::with_max_idle(String::new, |_| {}, 2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.available(), 0);

        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_prefill_respects_idle_cap() {
        let pool = ObjectPool::with_max_idle(String::new, |_| {}, 3);
        pool.prefill(10);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.max_idle(), 3);
    }

    #[test]
    fn test_detach_leaves_pool() {
        let pool = ObjectPool::new(|| String::from("x"), |_| {});
        let s = pool.acquire().detach();
        assert_eq!(s, "x");
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_recycled_values_are_not_recreated() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        let pool = ObjectPool::new(
            || {
                CREATED.fetch_add(1, Ordering::SeqCst);
                0u64
            },
            |_| {},
        );

        for _ in 0..10 {
            let _v = pool.acquire();
        }
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    }
}
