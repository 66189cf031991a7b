//! Background operations with a single result and cooperative cancellation.
//!
//! Work runs on tokio's blocking pool: the caller's runtime when there is
//! one, otherwise a process-wide current-thread runtime that is never
//! driven and only lends its pool.

use crate::{Error, Result};
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Work checks it at stage boundaries, so a
/// cancelled operation stops at the next check, not immediately.
#[derive(Clone)]
pub struct CancellationToken(Arc<watch::Sender<bool>>);

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancellationToken")
            .field(&self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Returns `Err(Error::Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // the sender lives in `self`, so the channel cannot close
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Handle to an operation running on the blocking pool.
///
/// The result is delivered exactly once, either by [`wait`](Self::wait) or
/// by the first [`try_result`](Self::try_result) that finds it finished.
/// Dropping the handle detaches the operation.
#[derive(Debug)]
pub struct TaskHandle<T> {
    state: State<T>,
    token: CancellationToken,
}

#[derive(Debug)]
enum State<T> {
    Running {
        task: JoinHandle<()>,
        result: oneshot::Receiver<Result<T>>,
    },
    Ready(Result<T>),
    Taken,
}

fn blocking_pool() -> Result<Handle> {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();

    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }
    let runtime = Builder::new_current_thread()
        .thread_name("machsign-worker")
        .build()?;
    Ok(RUNTIME.get_or_init(|| runtime).handle().clone())
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Runs `work` on the blocking pool. `token` is handed to the work and
    /// kept by the handle for [`cancel`](Self::cancel).
    pub fn spawn<F>(name: &str, token: CancellationToken, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Result<T> + Send + 'static,
    {
        let handle = match blocking_pool() {
            Ok(handle) => handle,
            Err(e) => return Self { state: State::Ready(Err(e)), token },
        };
        let (tx, rx) = oneshot::channel();
        let worker_token = token.clone();
        let name = name.to_string();
        let task = handle.spawn_blocking(move || {
            log::debug!("{name}: started");
            // the receiver may be gone if the handle was dropped
            let _ = tx.send(work(worker_token));
        });
        Self {
            state: State::Running { task, result: rx },
            token,
        }
    }
}

impl<T> TaskHandle<T> {
    /// A handle whose result is already known.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(result),
            token: CancellationToken::new(),
        }
    }

    /// Requests cancellation. The result will be `Err(Error::Cancelled)`
    /// unless the operation already passed its last check.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once the result is available (or already taken).
    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Running { task, .. } => task.is_finished(),
            State::Ready(_) | State::Taken => true,
        }
    }

    /// Blocks until the operation completes. Must not be called from async
    /// code.
    pub fn wait(mut self) -> Result<T> {
        match std::mem::replace(&mut self.state, State::Taken) {
            State::Running { result, .. } => {
                result.blocking_recv().unwrap_or_else(|_| panicked())
            }
            State::Ready(result) => result,
            State::Taken => Err(Error::Signing("task result already taken".into())),
        }
    }

    /// Returns the result if the operation has finished, without blocking.
    /// Subsequent calls return `None`.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        if !self.is_finished() {
            return None;
        }
        match std::mem::replace(&mut self.state, State::Taken) {
            State::Running { mut result, .. } => {
                Some(result.try_recv().unwrap_or_else(|_| panicked()))
            }
            State::Ready(result) => Some(result),
            State::Taken => None,
        }
    }
}

/// The worker dropped its sender without sending, which only a panic does.
fn panicked<T>() -> Result<T> {
    Err(Error::Signing("worker panicked".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_wait_delivers_result() {
        let handle = TaskHandle::spawn("test", CancellationToken::new(), |_| Ok(42));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_try_result_once() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut handle = TaskHandle::spawn("test", CancellationToken::new(), move |_| {
            rx.recv().ok();
            Ok("done")
        });
        assert!(handle.try_result().is_none());
        tx.send(()).unwrap();
        let result = loop {
            if let Some(r) = handle.try_result() {
                break r;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(result.unwrap(), "done");
        assert!(handle.try_result().is_none());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_cancel() {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = TaskHandle::spawn("test", CancellationToken::new(), move |token| {
            rx.recv().ok();
            token.check()?;
            Ok(())
        });
        handle.cancel();
        tx.send(()).unwrap();
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancelled_future() {
        let token = CancellationToken::new();
        let clone = token.clone();
        let handle = TaskHandle::spawn("test", CancellationToken::new(), move |_| {
            clone.cancel();
            Ok(())
        });
        handle.wait().unwrap();
        assert!(token.is_cancelled());

        let runtime = Builder::new_current_thread().build().unwrap();
        runtime.block_on(token.cancelled());
    }

    #[test]
    fn test_spawn_inside_runtime() {
        let runtime = Builder::new_current_thread().build().unwrap();
        let handle = runtime.block_on(async {
            TaskHandle::spawn("test", CancellationToken::new(), |_| Ok("pooled"))
        });
        assert_eq!(handle.wait().unwrap(), "pooled");
    }

    #[test]
    fn test_ready() {
        let mut handle = TaskHandle::ready(Err::<(), _>(Error::MissingIdentity));
        assert!(handle.is_finished());
        assert!(matches!(handle.try_result(), Some(Err(Error::MissingIdentity))));
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_panic_is_error() {
        let handle: TaskHandle<()> =
            TaskHandle::spawn("test", CancellationToken::new(), |_| panic!("boom"));
        assert!(matches!(handle.wait(), Err(Error::Signing(_))));
    }
}
