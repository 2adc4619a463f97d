//! Leveled mutex acquisition.
//!
//! Every long-lived lock in the daemon belongs to one of the classes below,
//! and locks must be taken in strictly increasing class order. Debug builds
//! keep a thread-local stack of held classes and panic on a violation;
//! release builds compile the bookkeeping out entirely.

use std::fmt;

use parking_lot::{Mutex, MutexGuard};

/// Lock classes in acquisition order. A thread holding a lock of some class
/// may only acquire locks of a strictly greater class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockClass {
    /// The virtual-directory tree.
    VdTree = 1,
    /// The file-handle and dentry tables.
    FhTables = 2,
    /// The table of volumes.
    VolumeTable = 3,
    /// A single volume (guards its metadata store).
    Volume = 4,
    /// A single internal file handle.
    Fh = 5,
    /// A single dentry.
    Dentry = 6,
    /// A single peer node.
    Node = 7,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<LockClass>> = const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn push_class(class: LockClass) {
    HELD.with(|held| {
        let held = held.borrow();
        if let Some(&top) = held.iter().max() {
            assert!(
                class > top,
                "lock order violation: acquiring {class:?} while holding {top:?}"
            );
        }
        drop(held);
    });
    HELD.with(|held| held.borrow_mut().push(class));
}

#[cfg(debug_assertions)]
fn pop_class(class: LockClass) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&c| c == class) {
            held.remove(pos);
        }
    });
}

/// Assert that the current thread holds no leveled locks. Called before
/// blocking on a peer reply, which must never happen under object locks.
pub fn assert_unlocked() {
    #[cfg(debug_assertions)]
    HELD.with(|held| {
        let held = held.borrow();
        assert!(
            held.is_empty(),
            "blocking call while holding locks: {:?}",
            &*held
        );
    });
}

/// A mutex tagged with its lock class.
pub struct OrderedMutex<T> {
    class: LockClass,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(class: LockClass, value: T) -> Self {
        OrderedMutex {
            class,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        push_class(self.class);
        OrderedGuard {
            class: self.class,
            guard: self.inner.lock(),
        }
    }

    pub fn class(&self) -> LockClass {
        self.class
    }
}

impl<T: fmt::Debug> fmt::Debug for OrderedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("class", &self.class)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard returned by [`OrderedMutex::lock`]; pops the class on release.
pub struct OrderedGuard<'a, T> {
    class: LockClass,
    guard: MutexGuard<'a, T>,
}

impl<T: fmt::Debug> fmt::Debug for OrderedGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedGuard")
            .field("class", &self.class)
            .field("value", &*self.guard)
            .finish()
    }
}

impl<T> std::ops::Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        pop_class(self.class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_order_is_accepted() {
        let a = OrderedMutex::new(LockClass::FhTables, 1u32);
        let b = OrderedMutex::new(LockClass::Fh, 2u32);
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(*ga + *gb, 3);
        drop(gb);
        drop(ga);
        assert_unlocked();
    }

    #[test]
    fn reacquire_after_release() {
        let a = OrderedMutex::new(LockClass::Volume, ());
        let b = OrderedMutex::new(LockClass::Fh, ());
        drop(b.lock());
        drop(a.lock());
        let ga = a.lock();
        drop(ga);
        let _gb = b.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn decreasing_order_panics() {
        let a = OrderedMutex::new(LockClass::Fh, ());
        let b = OrderedMutex::new(LockClass::VolumeTable, ());
        let _ga = a.lock();
        let _gb = b.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "blocking call while holding locks")]
    fn assert_unlocked_panics_under_lock() {
        let a = OrderedMutex::new(LockClass::Node, ());
        let _ga = a.lock();
        assert_unlocked();
    }
}
