//! Owner-validated spinlock.
//!
//! The lock word packs the claiming CPU and thread into a single owner
//! record, so misuse is detected rather than assumed away: relocking on the
//! CPU that already holds the lock and releasing from a non-owner are both
//! fatal. Locking also masks interrupts on the local CPU, which is what
//! makes the lock sufficient on single-CPU configurations where spinning
//! never happens.

use crate::arch::Arch;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use portable_atomic::{AtomicUsize, Ordering};

/// Bits of the owner word reserved for the CPU field.
const CPU_BITS: u32 = 8;
const CPU_FIELD_MASK: usize = (1 << CPU_BITS) - 1;

/// Identity of the execution context acquiring a lock: CPU index plus the
/// id of the thread running there (0 when no thread is installed yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claimant {
    pub cpu: usize,
    pub thread: u64,
}

impl Claimant {
    /// Claimant for early boot or interrupt entry on `cpu`, before any
    /// thread is current.
    pub const fn cpu_only(cpu: usize) -> Self {
        Self { cpu, thread: 0 }
    }

    /// Owner word: thread bits above, `cpu + 1` in the low field so a held
    /// lock is always nonzero.
    fn packed(self) -> usize {
        ((self.thread as usize) << CPU_BITS) | (self.cpu + 1)
    }
}

/// Opaque key returned by [`SpinLock::acquire`], capturing the interrupt
/// state to restore on release.
#[derive(Debug, Clone, Copy)]
pub struct SpinKey {
    restore_interrupts: bool,
}

/// A busy-wait mutual exclusion lock with owner validation.
pub struct SpinLock<T> {
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create an unlocked spinlock around `data`.
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock and return a guard dereferencing to the data.
    ///
    /// Interrupts are masked for the lifetime of the guard.
    ///
    /// # Panics
    ///
    /// Panics if `who`'s CPU already holds this lock.
    pub fn lock<A: Arch>(&self, who: Claimant) -> SpinGuard<'_, T, A> {
        let key = self.acquire::<A>(who);
        SpinGuard {
            lock: self,
            who,
            key,
            _arch: PhantomData,
        }
    }

    /// Acquire the raw lock, returning the interrupt-restore key.
    ///
    /// Prefer [`lock`](Self::lock); this exists for callers that need to
    /// thread the key through code the borrow checker cannot follow, and
    /// for exercising the ownership validation directly.
    pub fn acquire<A: Arch>(&self, who: Claimant) -> SpinKey {
        let restore_interrupts = A::interrupts_enabled();
        A::disable_interrupts();

        let packed = who.packed();
        loop {
            let current = self.owner.load(Ordering::Acquire);
            if current != 0 && (current & CPU_FIELD_MASK) == (who.cpu + 1) {
                log::error!(
                    "spinlock relock on cpu {} (owner word {:#x})",
                    who.cpu,
                    current
                );
                panic!("spinlock relocked on cpu {} while already held", who.cpu);
            }
            if current == 0
                && self
                    .owner
                    .compare_exchange_weak(0, packed, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        SpinKey { restore_interrupts }
    }

    /// Release the raw lock and restore the interrupt state saved in `key`.
    ///
    /// # Panics
    ///
    /// Panics if the recorded owner is not `who` — releasing an unheld lock
    /// and releasing from a different (CPU, thread) are both fatal.
    pub fn release<A: Arch>(&self, who: Claimant, key: SpinKey) {
        let expected = who.packed();
        if self
            .owner
            .compare_exchange(expected, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            let current = self.owner.load(Ordering::Relaxed);
            log::error!(
                "spinlock release by non-owner: cpu {} thread {} (owner word {:#x})",
                who.cpu,
                who.thread,
                current
            );
            panic!("spinlock released by non-owner");
        }
        if key.restore_interrupts {
            A::enable_interrupts();
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

/// RAII guard for [`SpinLock`]; releases and restores interrupts on drop.
pub struct SpinGuard<'a, T, A: Arch> {
    lock: &'a SpinLock<T>,
    who: Claimant,
    key: SpinKey,
    _arch: PhantomData<A>,
}

impl<'a, T, A: Arch> SpinGuard<'a, T, A> {
    /// Release the lock but leave interrupts masked.
    ///
    /// Used on the self-abort path, where the final context switch must run
    /// with interrupts held off after the scheduler lock is dropped.
    pub fn unlock_stay_masked(self) {
        let mut key = self.key;
        key.restore_interrupts = false;
        self.lock.release::<A>(self.who, key);
        core::mem::forget(self);
    }
}

impl<'a, T, A: Arch> Deref for SpinGuard<'a, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, so access is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T, A: Arch> DerefMut for SpinGuard<'a, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock, so access is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T, A: Arch> Drop for SpinGuard<'a, T, A> {
    fn drop(&mut self) {
        self.lock.release::<A>(self.who, self.key);
    }
}
