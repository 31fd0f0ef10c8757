// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mutual-exclusion primitives for the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: CriticalSection::with(), SleepLock::lock()
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: A critical section is closure-scoped and never spans I/O;
//!             a sleep lock may be held across I/O but never inside a critical section
//!
//! The kernel runs one processor at a time, so "disable preemption" is enough
//! to make short edits of the coremap, page tables and TLB indivisible. On the
//! host those steps are backed by a spin lock. Operations that read from a
//! file must instead use [`SleepLock`], which yields to the scheduler while
//! contended.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

/// Indivisible-step primitive guarding short, non-recursive state edits.
pub struct CriticalSection<T> {
    inner: Mutex<T>,
}

impl<T> CriticalSection<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Runs `f` with preemption disabled and exclusive access to the state.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Consumes the section and returns the protected state.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Hook invoked while a [`SleepLock`] is contended.
pub type YieldFn = fn();

fn spin_yield() {
    core::hint::spin_loop();
}

/// Blocking lock for operations that may sleep on I/O.
pub struct SleepLock<T> {
    inner: Mutex<T>,
    yield_now: YieldFn,
    contended: AtomicUsize,
}

impl<T> SleepLock<T> {
    /// Creates a lock that spins politely while contended.
    pub const fn new(value: T) -> Self {
        Self::with_yield(value, spin_yield)
    }

    /// Creates a lock that calls `yield_now` (typically the scheduler's
    /// thread yield) every time acquisition fails.
    pub const fn with_yield(value: T, yield_now: YieldFn) -> Self {
        Self { inner: Mutex::new(value), yield_now, contended: AtomicUsize::new(0) }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return SleepLockGuard { guard };
            }
            self.contended.fetch_add(1, Ordering::Relaxed);
            (self.yield_now)();
        }
    }

    /// Number of failed acquisition attempts so far.
    pub fn contention_count(&self) -> usize {
        self.contended.load(Ordering::Relaxed)
    }
}

pub struct SleepLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
