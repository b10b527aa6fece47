//! Life-lock: lets a driver hold a weak reference into a handler that
//! lives inline inside another structure (not behind its own `Arc`),
//! while guaranteeing the handler's destructor never runs while a
//! callback still has it promoted.
//!
//! The four states from the contract (`empty`, `working`, `retired`,
//! `expired`) are derived from an `Arc<()>` anchor rather than stored
//! directly: the anchor's strong-count *is* the ground truth, the
//! `initialized` flag only disambiguates `empty` from `expired` (both
//! have a strong count of zero).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const SPIN_COUNT: u32 = 40;
const SLEEP_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeLockState {
    Empty,
    Working,
    Retired,
    Expired,
}

/// A life-lock. Never `Clone`, never `Copy`, never moved once it has
/// produced a weak reference — moving would invalidate the addresses
/// weak pointers believe they're protecting.
pub struct LifeLock {
    anchor: Mutex<Option<Arc<()>>>,
    weak: Mutex<Weak<()>>,
    initialized: AtomicBool,
}

impl LifeLock {
    pub const fn new() -> Self {
        LifeLock {
            anchor: Mutex::new(None),
            weak: Mutex::new(Weak::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize from `empty`. A no-op outside of `empty`.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let arc = Arc::new(());
        *self.weak.lock().unwrap() = Arc::downgrade(&arc);
        *self.anchor.lock().unwrap() = Some(arc);
    }

    pub fn state(&self) -> LifeLockState {
        if !self.initialized.load(Ordering::Acquire) {
            return LifeLockState::Empty;
        }
        if self.anchor.lock().unwrap().is_some() {
            return LifeLockState::Working;
        }
        if self.weak.lock().unwrap().strong_count() > 0 {
            LifeLockState::Retired
        } else {
            LifeLockState::Expired
        }
    }

    /// Produce a weak reference to `ptr`. Outside of `working`, the
    /// returned weak is already expired and will never promote.
    pub fn weak<T>(&self, ptr: *const T) -> LifeLockWeak<T> {
        let anchor = if self.anchor.lock().unwrap().is_some() {
            self.weak.lock().unwrap().clone()
        } else {
            Weak::new()
        };
        LifeLockWeak { anchor, ptr }
    }

    /// Release the life-lock's own strong reference. Outstanding
    /// promoted references may still exist; they keep the state at
    /// `retired` until dropped.
    pub fn retire(&self) {
        self.anchor.lock().unwrap().take();
    }

    /// Retire (if not already) and block until every promoted
    /// reference has been released, then reset to `empty`. Idempotent:
    /// calling this on an already-`empty` lock returns immediately.
    pub fn destroy(&self) {
        self.retire();
        self.await_expired();
        *self.weak.lock().unwrap() = Weak::new();
        self.initialized.store(false, Ordering::Release);
    }

    fn await_expired(&self) {
        for _ in 0..SPIN_COUNT {
            if self.weak.lock().unwrap().strong_count() == 0 {
                return;
            }
            std::hint::spin_loop();
        }
        let mut backoff = Duration::from_micros(50);
        loop {
            if self.weak.lock().unwrap().strong_count() == 0 {
                return;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(SLEEP_MAX);
        }
    }
}

impl Default for LifeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak pointer into a life-locked `T`. Promoting it blocks
/// `retire -> expired` on the owning [`LifeLock`] until the guard is
/// dropped.
pub struct LifeLockWeak<T> {
    anchor: Weak<()>,
    ptr: *const T,
}

// A LifeLockWeak only ever dereferences `ptr` through a promoted guard,
// and the life-lock contract guarantees `*ptr` stays alive for as long
// as a strong anchor can be held — the same guarantee `Arc<T>` gives.
unsafe impl<T: Sync> Send for LifeLockWeak<T> {}
unsafe impl<T: Sync> Sync for LifeLockWeak<T> {}

impl<T> Clone for LifeLockWeak<T> {
    fn clone(&self) -> Self {
        LifeLockWeak { anchor: self.anchor.clone(), ptr: self.ptr }
    }
}

impl<T> LifeLockWeak<T> {
    pub fn upgrade(&self) -> Option<LifeLockGuard<'_, T>> {
        if self.ptr.is_null() {
            return None;
        }
        let strong = self.anchor.upgrade()?;
        Some(LifeLockGuard { _strong: strong, ptr: self.ptr, _marker: std::marker::PhantomData })
    }
}

/// Holds a live strong reference for the duration of one callback.
/// Dropping it is what allows `retire -> expired` to proceed.
pub struct LifeLockGuard<'a, T> {
    _strong: Arc<()>,
    ptr: *const T,
    _marker: std::marker::PhantomData<&'a T>,
}

impl<T> std::ops::Deref for LifeLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: a live `_strong` anchor means the owning LifeLock has
        // not finished `destroy()`, which the contract requires to run
        // before `T`'s destructor (see `LifeLocked`'s field order).
        unsafe { &*self.ptr }
    }
}

/// Convenience wrapper: owns `T` inline alongside its life-lock and
/// enforces the correct teardown order via field declaration order
/// (Rust drops struct fields top-to-bottom).
pub struct LifeLocked<T> {
    life_lock: LifeLock,
    value: Option<T>,
}

impl<T> LifeLocked<T> {
    pub fn new(value: T) -> Self {
        let life_lock = LifeLock::new();
        life_lock.init();
        LifeLocked { life_lock, value: Some(value) }
    }

    pub fn empty() -> Self {
        LifeLocked { life_lock: LifeLock::new(), value: None }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub fn weak(&self) -> LifeLockWeak<T> {
        let ptr = self.value.as_ref().map_or(std::ptr::null(), |v| v as *const T);
        self.life_lock.weak(ptr)
    }

    /// Tear down any existing value, then place a new one, re-arming
    /// the life-lock.
    pub fn emplace(&mut self, value: T) -> &mut T {
        self.reset();
        self.life_lock.init();
        self.value = Some(value);
        self.value.as_mut().unwrap()
    }

    /// Destroy the life-lock (waiting out any promoted references)
    /// and drop the value.
    pub fn reset(&mut self) {
        self.life_lock.destroy();
        self.value = None;
    }
}

impl<T> Drop for LifeLocked<T> {
    fn drop(&mut self) {
        self.life_lock.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn weak_outside_working_is_immediately_expired() {
        let lock = LifeLock::new();
        let value = 42i32;
        let weak = lock.weak(&value as *const i32);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_promotes_while_working_and_expires_after_destroy() {
        let lock = LifeLock::new();
        lock.init();
        let value = 7i32;
        let weak = lock.weak(&value as *const i32);
        {
            let guard = weak.upgrade().expect("should promote while working");
            assert_eq!(*guard, 7);
        }
        lock.destroy();
        assert_eq!(lock.state(), LifeLockState::Empty);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn destroy_waits_for_outstanding_guard() {
        let lock = Arc::new(LifeLock::new());
        lock.init();
        let value = Arc::new(99i32);
        let weak = lock.weak(Arc::as_ptr(&value));

        let guard = weak.upgrade().unwrap();
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            lock2.destroy();
            released2.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), 0, "destroy must not finish early");
        drop(guard);
        handle.join().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_is_idempotent() {
        let lock = LifeLock::new();
        lock.init();
        lock.destroy();
        lock.destroy();
        assert_eq!(lock.state(), LifeLockState::Empty);
    }

    #[test]
    fn life_locked_drop_order_waits_before_dropping_value() {
        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let locked = LifeLocked::new(DropFlag(drops.clone()));
        let weak = locked.weak();
        let guard = weak.upgrade().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(guard);
        drop(locked);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
