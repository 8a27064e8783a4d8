//! Word-sized locks built directly on `std::sync::atomic`.
//!
//! The runtime keeps its critical sections tiny (a few pointer moves), so
//! both locks spin instead of parking. `RwLock` is used only by the handle
//! index; everything else takes a `SpinLock`. Neither lock is fair.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the test-and-set word grants exclusive access to `data` while a
// guard is alive.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Writer-preferring reader-writer spin lock.
///
/// A writer raises its flag first and then waits for the reader count to
/// drain; an arriving reader increments the count, re-checks the flag, and
/// backs off if a writer got there first. This is the protocol the handle
/// index depends on: grabs are reader-side and stay cheap, registration and
/// reaping are writer-side and rare.
pub struct RwLock<T> {
    write: AtomicBool,
    read: AtomicI32,
    data: UnsafeCell<T>,
}

// SAFETY: readers only receive `&T`; `&mut T` is only reachable through the
// write guard, which excludes both writers and readers.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        RwLock {
            write: AtomicBool::new(false),
            read: AtomicI32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        loop {
            while self.write.load(Ordering::Acquire) {
                spin_loop();
            }
            self.read.fetch_add(1, Ordering::Acquire);
            if self.write.load(Ordering::Acquire) {
                // A writer slipped in between the check and the increment.
                self.read.fetch_sub(1, Ordering::Release);
            } else {
                return ReadGuard { lock: self };
            }
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        while self.write.swap(true, Ordering::Acquire) {
            spin_loop();
        }
        while self.read.load(Ordering::Acquire) != 0 {
            spin_loop();
        }
        WriteGuard { lock: self }
    }
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read.fetch_sub(1, Ordering::Release);
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spinlock_counts_under_contention() {
        let n = Arc::new(SpinLock::new(0u64));
        let mut handles = vec![];
        for _ in 0..4 {
            let n = n.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *n.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*n.lock(), 40_000);
    }

    #[test]
    fn rwlock_readers_see_writer_results() {
        let v = Arc::new(RwLock::new(vec![0i32; 8]));
        let writer = {
            let v = v.clone();
            thread::spawn(move || {
                for i in 0..1_000 {
                    let mut g = v.write();
                    for x in g.iter_mut() {
                        *x = i;
                    }
                }
            })
        };
        let reader = {
            let v = v.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let g = v.read();
                    let first = g[0];
                    // A writer never publishes a half-updated vector.
                    assert!(g.iter().all(|&x| x == first));
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
