//! Dedicated reception threads
//!
//! Every client and server owns at most one [`Worker`]: a named OS thread
//! running a blocking receive loop, a shared run flag, and a wake action
//! that unblocks the loop's pending read when the worker is stopped.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{trace, warn};

/// Lock a mutex, ignoring poisoning
///
/// Listener panics are caught before they can unwind through a lock, so a
/// poisoned mutex only means a panic elsewhere; the data is still valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run flag shared between a worker and its loop
#[derive(Debug, Clone)]
pub(crate) struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub(crate) fn new() -> Self {
        RunFlag(Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Address a wake action must reach to unblock a socket bound to `local`
///
/// A wildcard bind is reachable through the loopback address of its family.
pub(crate) fn wake_target(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), local.port()),
        _ => local,
    }
}

type Wake = Box<dyn FnOnce() + Send>;

/// Handle to a running reception thread
pub(crate) struct Worker {
    flag: RunFlag,
    handle: JoinHandle<()>,
    wake: Option<Wake>,
}

impl Worker {
    /// Spawn `body` on a new named thread
    ///
    /// The flag is cleared when `body` returns, whatever the reason.
    pub(crate) fn spawn<F, W>(name: String, body: F, wake: W) -> io::Result<Worker>
    where
        F: FnOnce(&RunFlag) + Send + 'static,
        W: FnOnce() + Send + 'static,
    {
        let flag = RunFlag::new();
        let thread_flag = flag.clone();

        let handle = thread::Builder::new().name(name).spawn(move || {
            body(&thread_flag);
            thread_flag.clear();
        })?;

        Ok(Worker {
            flag,
            handle,
            wake: Some(Box::new(wake)),
        })
    }

    /// Whether the loop is running and has not been asked to stop
    pub(crate) fn is_running(&self) -> bool {
        self.flag.is_running()
    }

    /// Whether the caller is this worker's own thread
    pub(crate) fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    /// Signal the loop, unblock it, and wait for the thread to exit
    ///
    /// Called from the worker's own thread (from inside a listener
    /// callback), it only signals; the loop exits once the callback returns.
    pub(crate) fn stop(mut self) {
        self.flag.clear();
        if let Some(wake) = self.wake.take() {
            wake();
        }

        if self.is_current() {
            trace!("Stop requested from reception thread, not joining");
            return;
        }

        let name = self.handle.thread().name().unwrap_or("worker").to_string();
        if self.handle.join().is_err() {
            warn!(thread = %name, "Reception thread panicked");
        }
    }
}
