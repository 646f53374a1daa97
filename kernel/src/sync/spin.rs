//! Busy-wait locks for short, non-blocking critical sections.
//!
//! The coremap is guarded by one of these. It is only ever held across
//! in-memory scans and updates; any path that needs disk I/O releases the
//! lock first.
//!
//! The default `ticket_mutex` feature selects a FIFO ticket lock; without
//! it a plain test-and-set lock is used.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(feature = "ticket_mutex")]
pub type SpinLock<T> = TicketLock<T>;
#[cfg(feature = "ticket_mutex")]
pub type SpinLockGuard<'a, T> = TicketLockGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
pub type SpinLock<T> = TasLock<T>;
#[cfg(not(feature = "ticket_mutex"))]
pub type SpinLockGuard<'a, T> = TasLockGuard<'a, T>;

/// A spinning mutex with FIFO ticketing: the thread that started waiting
/// first gets the lock first.
pub struct TicketLock<T: ?Sized> {
    next_ticket: AtomicUsize,
    next_serving: AtomicUsize,
    data: UnsafeCell<T>,
}

pub struct TicketLockGuard<'a, T: ?Sized + 'a> {
    next_serving: &'a AtomicUsize,
    ticket: usize,
    data: &'a mut T,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}
unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            next_serving: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TicketLock<T> {
    pub fn lock(&self) -> TicketLockGuard<T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        while self.next_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        TicketLockGuard {
            next_serving: &self.next_serving,
            ticket,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn is_locked(&self) -> bool {
        let ticket = self.next_ticket.load(Ordering::Relaxed);
        self.next_serving.load(Ordering::Relaxed) != ticket
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: ?Sized> Deref for TicketLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: ?Sized> DerefMut for TicketLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for TicketLockGuard<'a, T> {
    fn drop(&mut self) {
        self.next_serving.store(self.ticket + 1, Ordering::Release);
    }
}

/// A plain test-and-set spinlock. No fairness guarantee.
pub struct TasLock<T: ?Sized> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

pub struct TasLockGuard<'a, T: ?Sized + 'a> {
    held: &'a AtomicBool,
    data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for TasLock<T> {}
unsafe impl<T: ?Sized + Send> Send for TasLock<T> {}

impl<T> TasLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> TasLock<T> {
    pub fn lock(&self) -> TasLockGuard<T> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        TasLockGuard {
            held: &self.held,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: ?Sized> Deref for TasLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'a, T: ?Sized> DerefMut for TasLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'a, T: ?Sized> Drop for TasLockGuard<'a, T> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
