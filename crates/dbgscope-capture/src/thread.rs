use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CaptureError, Result};

/// Stop request shared between a reader and its thread
///
/// Unlike a plain flag, a token can be waited on with a timeout, so polling
/// readers wake up as soon as a stop is requested.
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<StopState>,
}

#[derive(Default)]
struct StopState {
    stopped: Mutex<bool>,
    condition: Condvar,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.condition.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep for up to `timeout`; returns true if a stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.inner.stopped.lock();
        while !*stopped {
            if self
                .inner
                .condition
                .wait_until(&mut stopped, deadline)
                .timed_out()
            {
                break;
            }
        }
        *stopped
    }
}

/// Marks the thread ended even if the body panics
struct EndGuard(Arc<AtomicBool>);

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A named reader thread with stop-and-join semantics
pub struct ReaderThread {
    stop: StopToken,
    ended: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderThread {
    /// Spawn `body` on a new thread; the thread is marked ended when `body` returns
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let stop = StopToken::new();
        let ended = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            let ended = Arc::clone(&ended);
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let _ended = EndGuard(ended);
                    body(stop);
                })
                .map_err(|e| CaptureError::os("spawn reader thread", e))?
        };

        Ok(Self {
            stop,
            ended,
            handle: Some(handle),
        })
    }

    /// Whether the thread body has returned
    pub fn at_end(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Request a stop and wait for the thread to exit
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderThread {
    fn drop(&mut self) {
        self.stop();
    }
}
