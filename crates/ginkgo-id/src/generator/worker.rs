use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use portable_atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// Cooperative stop flag handed to a background worker.
#[derive(Clone, Debug, Default)]
pub(crate) struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Parks for at most `timeout`, returning early on unpark. Returns
    /// `true` if the worker should exit.
    pub(crate) fn park_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        thread::park_timeout(timeout);
        self.is_stopped()
    }

    /// Sleeps for the full `duration` unless stopped. Unparks that are not
    /// a stop request do not cut the sleep short. Returns `true` if the
    /// worker should exit.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.is_stopped();
            }
            if self.park_timeout(deadline - now) {
                return true;
            }
        }
    }
}

/// A named OS thread with a stop flag and a bounded join.
///
/// The worker closure owns the sending half of a zero-capacity channel. When
/// the closure returns (or unwinds) the sender is dropped, which is how
/// [`BackgroundWorker::shutdown`] learns the thread is done without blocking
/// on `JoinHandle::join` indefinitely.
#[derive(Debug)]
pub(crate) struct BackgroundWorker {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    name: &'static str,
    stop: StopSignal,
    thread: Thread,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub(crate) fn spawn<F>(name: &'static str, f: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let stop = StopSignal::default();
        let (done_tx, done) = bounded::<()>(0);
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _done = done_tx;
                f(worker_stop);
            })
            .map_err(|source| Error::Spawn { name, source })?;

        Ok(Self {
            name,
            stop,
            thread: handle.thread().clone(),
            done,
            handle: Some(handle),
        })
    }

    pub(crate) fn thread(&self) -> &Thread {
        &self.thread
    }

    pub(crate) fn unpark(&self) {
        self.thread.unpark();
    }

    /// Signals the worker to stop and waits up to `timeout` for it to exit.
    /// Returns `false` if the worker did not finish in time; the thread is
    /// then left detached.
    pub(crate) fn shutdown(&mut self, timeout: Duration) -> bool {
        self.stop.0.store(true, Ordering::Release);
        self.thread.unpark();

        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(worker = self.name, ?timeout, "worker did not stop in time");
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::error!(worker = self.name, "worker panicked");
                    }
                }
                true
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop.0.store(true, Ordering::Release);
        self.thread.unpark();
    }
}
