//! The lock every table in this crate is built on.
//!
//! With the default `ticket_mutex` feature waiters are served first-in
//! first-out, so a thread stuck behind a long swap transfer cannot be starved
//! by later arrivals. Without it a plain test-and-set spinlock is used.

#[cfg(feature = "ticket_mutex")]
pub type Mutex<T> = spin::mutex::TicketMutex<T>;
#[cfg(feature = "ticket_mutex")]
pub type MutexGuard<'a, T> = spin::mutex::TicketMutexGuard<'a, T>;

#[cfg(not(feature = "ticket_mutex"))]
pub type Mutex<T> = spin::mutex::SpinMutex<T>;
#[cfg(not(feature = "ticket_mutex"))]
pub type MutexGuard<'a, T> = spin::mutex::SpinMutexGuard<'a, T>;
