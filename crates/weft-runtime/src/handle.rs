use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::error::RuntimeError;

/// Observed state of an [`ExecutionHandle`].
#[derive(Debug)]
pub enum ExecutionState<T> {
    Pending,
    Ready(T),
    Failed(RuntimeError),
}

/// Completion handle for work scheduled on the runtime thread.
///
/// The handle can be polled without blocking ([`try_poll`](Self::try_poll)),
/// awaited as a future, or waited on from a host thread that must not proceed
/// before the result is in ([`wait`](Self::wait)). Never wait on a handle from
/// inside a runtime body: the runtime thread would block on itself.
pub struct ExecutionHandle<T> {
    shared: Arc<Shared<T>>,
    epoch: u64,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

struct Slot<T> {
    result: Option<Result<T, RuntimeError>>,
    waker: Option<Waker>,
    taken: bool,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> ExecutionHandle<T> {
    pub(crate) fn pair(epoch: u64) -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                result: None,
                waker: None,
                taken: false,
            }),
            ready: Condvar::new(),
        });
        let completer = Completer {
            shared: Some(Arc::clone(&shared)),
        };
        (Self { shared, epoch }, completer)
    }

    /// A handle that is already complete.
    pub(crate) fn ready(epoch: u64, result: Result<T, RuntimeError>) -> Self {
        let (handle, completer) = Self::pair(epoch);
        completer.complete(result);
        handle
    }

    /// Runtime epoch the work was scheduled under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_ready(&self) -> bool {
        let slot = self.shared.lock();
        slot.result.is_some() || slot.taken
    }

    /// Take the result if it is in, without blocking.
    pub fn try_poll(&mut self) -> ExecutionState<T> {
        let mut slot = self.shared.lock();
        match slot.result.take() {
            Some(result) => {
                slot.taken = true;
                match result {
                    Ok(value) => ExecutionState::Ready(value),
                    Err(err) => ExecutionState::Failed(err),
                }
            }
            None if slot.taken => ExecutionState::Failed(already_taken()),
            None => ExecutionState::Pending,
        }
    }

    /// Block the calling thread until the result is in.
    pub fn wait(self) -> Result<T, RuntimeError> {
        let mut slot = self.shared.lock();
        loop {
            if let Some(result) = slot.result.take() {
                slot.taken = true;
                return result;
            }
            if slot.taken {
                return Err(already_taken());
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> Future for ExecutionHandle<T> {
    type Output = Result<T, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        if let Some(result) = slot.result.take() {
            slot.taken = true;
            return Poll::Ready(result);
        }
        if slot.taken {
            return Poll::Ready(Err(already_taken()));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for ExecutionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("epoch", &self.epoch)
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn already_taken() -> RuntimeError {
    RuntimeError::Fault("execution result was already taken".into())
}

/// Producer side of an [`ExecutionHandle`].
///
/// Dropping it without completing reports a fault, so a dying runtime thread
/// never leaves a waiter hanging.
pub(crate) struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: Result<T, RuntimeError>) {
        if let Some(shared) = self.shared.take() {
            fill(&shared, result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            fill(
                &shared,
                Err(RuntimeError::Fault(
                    "runtime stopped before the execution completed".into(),
                )),
            );
        }
    }
}

fn fill<T>(shared: &Shared<T>, result: Result<T, RuntimeError>) {
    let waker = {
        let mut slot = shared.lock();
        slot.result = Some(result);
        slot.waker.take()
    };
    shared.ready.notify_all();
    if let Some(waker) = waker {
        waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn try_poll_sees_pending_then_ready() {
        let (mut handle, completer) = ExecutionHandle::<u32>::pair(3);
        assert!(matches!(handle.try_poll(), ExecutionState::Pending));
        completer.complete(Ok(7));
        assert!(handle.is_ready());
        assert!(matches!(handle.try_poll(), ExecutionState::Ready(7)));
        assert!(matches!(handle.try_poll(), ExecutionState::Failed(_)));
        assert_eq!(handle.epoch(), 3);
    }

    #[test]
    fn wait_blocks_until_completed_from_another_thread() {
        let (handle, completer) = ExecutionHandle::<String>::pair(1);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done".into()));
        });
        assert_eq!(handle.wait().unwrap(), "done");
        worker.join().unwrap();
    }

    #[test]
    fn dropped_completer_reports_fault() {
        let (handle, completer) = ExecutionHandle::<()>::pair(1);
        drop(completer);
        assert!(handle.wait().unwrap_err().is_fault());
    }

    #[tokio::test]
    async fn handle_is_awaitable() {
        let (handle, completer) = ExecutionHandle::<i64>::pair(2);
        std::thread::spawn(move || completer.complete(Ok(42)));
        assert_eq!(handle.await.unwrap(), 42);
    }
}
