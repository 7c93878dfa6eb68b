use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A spin-lock that can be laid out directly inside a shared-memory region
/// and taken by any process mapping it. It is a single word with no heap
/// state, so a zero-filled region starts with every lock released.
#[repr(transparent)]
pub struct SpinLock(AtomicU32);

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock(AtomicU32::new(UNLOCKED))
    }

    /// Reinterpret a word inside a mapped region as a lock.
    ///
    /// # Safety
    /// `ptr` must be 4-aligned and point into a mapping that outlives the
    /// returned reference.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a SpinLock {
        debug_assert_eq!(ptr as usize % std::mem::align_of::<AtomicU32>(), 0);
        &*(ptr as *const SpinLock)
    }

    pub fn lock(&self) -> SpinLockGuard<'_> {
        loop {
            if self
                .0
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard(self);
            }
            while self.0.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        self.0
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard(self))
    }
}

impl Default for SpinLock {
    fn default() -> SpinLock {
        SpinLock::new()
    }
}

pub struct SpinLockGuard<'a>(&'a SpinLock);

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exclusion_under_contention() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut unsynced = 0u64;

        // Move a raw pointer to `unsynced` across threads; the lock is the
        // only thing keeping the increments from racing.
        let ptr = SendPtr(&mut unsynced as *mut u64);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                let ptr = ptr;
                std::thread::spawn(move || {
                    let ptr = ptr;
                    for _ in 0..10_000 {
                        let _guard = lock.lock();
                        unsafe { *ptr.0 += 1 };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsynced, 40_000);
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new();
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[derive(Clone, Copy)]
    struct SendPtr(*mut u64);
    unsafe impl Send for SendPtr {}
}
