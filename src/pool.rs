//! Thread-safe object pooling for resources that are acquired and released on
//! the replay and merge hot paths.

use std::sync::Mutex;

/// A bounded free-list pool.
///
/// `get` pops an idle object or constructs a fresh one; `put` returns an
/// object, dropping it if the pool already holds `max_idle` items. Callers are
/// responsible for resetting objects before reuse.
pub struct ObjectPool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle = self.idle.lock().map(|v| v.len()).unwrap_or(0);
        f.debug_struct("ObjectPool")
            .field("idle", &idle)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl<T> ObjectPool<T> {
    pub fn new(max_idle: usize, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle.min(64))),
            max_idle,
            make: Box::new(make),
        }
    }

    pub fn get(&self) -> T {
        if let Ok(mut idle) = self.idle.lock() {
            if let Some(item) = idle.pop() {
                return item;
            }
        }
        (self.make)()
    }

    pub fn put(&self, item: T) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(item);
            }
        }
    }
}
