//! Double-buffered result storage shared between a single writer and many
//! lock-free readers.
//!
//! Writers serialise on a mutex, build the next value off to the side and
//! publish it with one atomic pointer swap. Readers load the published value
//! without taking a lock. A live [`ReadGuard`] keeps its value alive but never
//! holds up a writer: the next publish simply swaps in a fresh allocation.

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::{ArcSwap, Guard};

/// Lock-protected write / lock-free read double buffer.
pub struct DoubleBuffered<T> {
    published: ArcSwap<T>,
    generation: AtomicU64,
    write_lock: Mutex<()>,
}

impl<T> DoubleBuffered<T> {
    pub fn new(initial: T) -> Self {
        Self {
            published: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Borrow the most recently published value without blocking.
    pub fn read(&self) -> ReadGuard<T> {
        ReadGuard {
            inner: self.published.load(),
        }
    }

    /// Number of successful publishes since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl<T: Clone> DoubleBuffered<T> {
    /// Apply `update` to a copy of the current value and publish it.
    pub fn write<F>(&self, update: F)
    where
        F: FnOnce(&mut T),
    {
        let _ = self.try_write(|slot| {
            update(slot);
            Ok::<(), std::convert::Infallible>(())
        });
    }

    /// Apply a fallible `update` to a copy of the current value.
    ///
    /// The copy is published only when `update` returns `Ok`. On `Err` (or a
    /// panic inside `update`) it is discarded, so readers keep observing the
    /// previous complete value.
    pub fn try_write<F, E>(&self, update: F) -> Result<(), E>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
    {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            // A panicking writer never published, so the state is consistent.
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next = T::clone(&self.published.load());
        update(&mut next)?;

        self.published.store(Arc::new(next));
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Clone the most recently published value.
    pub fn snapshot(&self) -> T {
        T::clone(&self.read())
    }
}

impl<T: fmt::Debug> fmt::Debug for DoubleBuffered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleBuffered")
            .field("generation", &self.generation())
            .field("published", &*self.read())
            .finish()
    }
}

/// Shared view of a published value. Later publishes do not affect it.
pub struct ReadGuard<T> {
    inner: Guard<Arc<T>>,
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use super::DoubleBuffered;

    #[test]
    fn read_returns_initial_value_before_any_write() {
        let buffer = DoubleBuffered::new(vec![0.0f32; 4]);
        assert_eq!(*buffer.read(), vec![0.0; 4]);
        assert_eq!(buffer.generation(), 0);
    }

    #[test]
    fn write_publishes_new_value() {
        let buffer = DoubleBuffered::new(0u32);
        buffer.write(|slot| *slot = 7);
        assert_eq!(*buffer.read(), 7);
        buffer.write(|slot| *slot = 9);
        assert_eq!(*buffer.read(), 9);
        assert_eq!(buffer.generation(), 2);
    }

    #[test]
    fn failed_write_does_not_publish() {
        let buffer = DoubleBuffered::new(vec![1u8, 1, 1]);
        let result: Result<(), &str> = buffer.try_write(|slot| {
            slot[0] = 99;
            Err("boom")
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(*buffer.read(), vec![1, 1, 1]);
        assert_eq!(buffer.generation(), 0);
    }

    #[test]
    fn panicking_writer_leaves_previous_value_visible() {
        let buffer = Arc::new(DoubleBuffered::new(5i32));
        let writer = buffer.clone();
        let outcome = thread::spawn(move || {
            writer.write(|slot| {
                *slot = -1;
                panic!("writer failed mid-update");
            });
        })
        .join();
        assert!(outcome.is_err());
        assert_eq!(*buffer.read(), 5);

        buffer.write(|slot| *slot = 6);
        assert_eq!(*buffer.read(), 6);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_values() {
        const WIDTH: usize = 256;
        let buffer = Arc::new(DoubleBuffered::new(vec![0u64; WIDTH]));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut observed = 0usize;
                    while !done.load(Ordering::Relaxed) {
                        let guard = buffer.read();
                        let first = guard[0];
                        assert!(guard.iter().all(|value| *value == first));
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for round in 1..=2_000u64 {
            buffer.write(|slot| {
                for value in slot.iter_mut() {
                    *value = round;
                }
            });
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().expect("reader thread");
        }
        assert_eq!(buffer.read()[WIDTH - 1], 2_000);
    }

    #[test]
    fn held_guard_does_not_block_consecutive_writes() {
        let buffer = Arc::new(DoubleBuffered::new(0u32));
        let guard = buffer.read();

        let writer = buffer.clone();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            writer.write(|slot| *slot = 1);
            writer.write(|slot| *slot = 2);
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("both writes finish while the guard is held");
        assert_eq!(*guard, 0);
        assert_eq!(*buffer.read(), 2);
        assert_eq!(buffer.generation(), 2);
    }
}
