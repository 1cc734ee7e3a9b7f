//! Cancellable futures with stop and timeout control.
//!
//! A [`Cancellable`] pairs an asynchronous operation with a [`StopHandle`].
//! Stopping is not an abort: the operation observes the handle and takes its
//! own "finish successfully now" path (a query returns whatever it parsed so
//! far). A timeout, in contrast, settles the future with
//! [`RegistryError::Timeout`] and then stops it so owned processes and
//! temporary files are released.
//!
//! [`TaskGroup`] composes several cancellables: it resolves when every child
//! resolves, fails on the first child failure, and fans its own stop out to
//! every child.

use crate::error::{RegistryError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxResultFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Stop control shared between a cancellable operation and its callers.
///
/// Stopping is idempotent; stopping after settlement has no effect.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Creates a fresh, unstopped handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an early, successful finish.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns true once [`stop`](Self::stop) was called on this handle or a
    /// parent.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when a stop is requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Creates a handle that is stopped whenever this one is.
    pub fn child(&self) -> StopHandle {
        Self {
            token: self.token.child_token(),
        }
    }
}

/// An asynchronous result with attached stop and timeout control.
///
/// Settlement is exactly-once: the future yields a single result, and a
/// timeout that fires first wins over any later stop or completion.
pub struct Cancellable<T> {
    inner: BoxResultFuture<T>,
    stop: StopHandle,
}

impl<T: Send + 'static> Cancellable<T> {
    /// Creates a cancellable from an operation that receives its stop handle.
    ///
    /// The operation must treat a stop as "finish successfully now".
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: FnOnce(StopHandle) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_stop_handle(StopHandle::new(), operation)
    }

    /// Like [`new`](Self::new) but with a caller-supplied stop handle, e.g.
    /// a [`StopHandle::child`] of a group.
    pub fn with_stop_handle<F, Fut>(stop: StopHandle, operation: F) -> Self
    where
        F: FnOnce(StopHandle) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let inner = Box::pin(operation(stop.clone()));
        Self { inner, stop }
    }

    /// An already-settled cancellable.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            inner: Box::pin(async move { result }),
            stop: StopHandle::new(),
        }
    }

    /// Returns a handle that can stop this operation from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Requests an early, successful finish.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Transforms the successful result, keeping the same stop handle.
    pub fn map<U, F>(self, f: F) -> Cancellable<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let stop = self.stop.clone();
        Cancellable {
            inner: Box::pin(async move { self.await.map(f) }),
            stop,
        }
    }

    /// Attaches a deadline. When it elapses first, the future fails with
    /// [`RegistryError::Timeout`] and the stop handler is invoked.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        let Some(timeout) = timeout else {
            return self;
        };
        let stop = self.stop.clone();
        let inner = self.inner;
        Self {
            inner: Box::pin(async move {
                match tokio::time::timeout(timeout, inner).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(?timeout, "Operation timed out");
                        stop.stop();
                        Err(RegistryError::Timeout(timeout))
                    }
                }
            }),
            stop: self.stop,
        }
    }
}

impl<T> Future for Cancellable<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Cancellable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

/// A group of cancellables joined as one.
pub struct TaskGroup<T> {
    stop: StopHandle,
    children: Vec<Cancellable<T>>,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::with_stop_handle(StopHandle::new())
    }

    /// Creates an empty group controlled by `stop`.
    pub fn with_stop_handle(stop: StopHandle) -> Self {
        Self {
            stop,
            children: Vec::new(),
        }
    }

    /// Returns the group's stop handle; stopping it stops every child.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns true if the group has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Adds an existing child.
    pub fn push(&mut self, child: Cancellable<T>) {
        self.children.push(child);
    }

    /// Adds a child built from an operation whose stop handle is linked to
    /// the group.
    pub fn spawn_with<F, Fut>(&mut self, operation: F)
    where
        F: FnOnce(StopHandle) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let child = Cancellable::with_stop_handle(self.stop.child(), operation);
        self.children.push(child);
    }

    /// Waits for every child. Results keep the order children were added.
    ///
    /// Fails with the first child error; the remaining children keep running
    /// until they settle on their own (their stop handles and timeouts still
    /// apply) rather than being force-cancelled.
    pub async fn join(self) -> Result<Vec<T>> {
        let TaskGroup { stop, children } = self;
        let count = children.len();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(count);

        for (index, child) in children.into_iter().enumerate() {
            handles.push(child.stop_handle());
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = child.await;
                let _ = tx.send((index, result));
            });
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
        let mut remaining = count;
        let mut fanned_out = false;

        while remaining > 0 {
            tokio::select! {
                message = rx.recv() => match message {
                    Some((index, Ok(value))) => {
                        slots[index] = Some(value);
                        remaining -= 1;
                    }
                    Some((index, Err(e))) => {
                        debug!(index, error = %e, "Task group child failed");
                        return Err(e);
                    }
                    None => {
                        return Err(RegistryError::unknown_failure(
                            None,
                            "task group child ended without a result",
                        ));
                    }
                },
                _ = stop.stopped(), if !fanned_out => {
                    fanned_out = true;
                    debug!(children = handles.len(), "Stopping task group");
                    for handle in &handles {
                        handle.stop();
                    }
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Converts the group into a single cancellable sharing the group's stop
    /// handle.
    pub fn into_cancellable(self) -> Cancellable<Vec<T>> {
        let stop = self.stop.clone();
        Cancellable {
            inner: Box::pin(self.join()),
            stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stop_takes_success_path() {
        let op = Cancellable::new(|stop| async move {
            stop.stopped().await;
            Ok::<_, RegistryError>("partial")
        });
        op.stop();
        assert_eq!(op.await.unwrap(), "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_stops() {
        let observed = Arc::new(AtomicBool::new(false));
        let op = Cancellable::new(|_stop| async move {
            std::future::pending::<()>().await;
            Ok::<u32, RegistryError>(1)
        })
        .with_timeout(Some(Duration::from_millis(100)));
        let handle = op.stop_handle();

        let flag = observed.clone();
        let watcher = tokio::spawn(async move {
            handle.stopped().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(matches!(op.await, Err(RegistryError::Timeout(_))));
        watcher.await.unwrap();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_timeout() {
        let op = Cancellable::new(|_| async { Ok::<_, RegistryError>(7) })
            .with_timeout(Some(Duration::from_secs(1)));
        assert_eq!(op.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stop_after_settlement_is_noop() {
        let op = Cancellable::new(|_| async { Ok::<_, RegistryError>(1) });
        let handle = op.stop_handle();
        assert_eq!(op.await.unwrap(), 1);
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_group_preserves_order() {
        let mut group = TaskGroup::new();
        for i in 0..4u32 {
            group.spawn_with(move |_| async move {
                tokio::task::yield_now().await;
                Ok(i)
            });
        }
        assert_eq!(group.join().await.unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_group_stop_fans_out() {
        let mut group = TaskGroup::new();
        for i in 0..3u32 {
            group.spawn_with(move |stop| async move {
                stop.stopped().await;
                Ok(i * 10)
            });
        }
        let external = Cancellable::new(|stop| async move {
            stop.stopped().await;
            Ok(99)
        });
        group.push(external);

        let stop = group.stop_handle();
        let joined = tokio::spawn(group.join());
        stop.stop();
        assert_eq!(joined.await.unwrap().unwrap(), vec![0, 10, 20, 99]);
    }

    #[tokio::test]
    async fn test_group_first_error_wins() {
        let mut group = TaskGroup::new();
        group.spawn_with(|stop| async move {
            stop.stopped().await;
            Ok(1)
        });
        group.spawn_with(|_| async { Err::<u32, _>(RegistryError::AccessDenied) });
        let stop = group.stop_handle();
        assert!(matches!(group.join().await, Err(RegistryError::AccessDenied)));
        stop.stop();
    }

    #[tokio::test]
    async fn test_empty_group() {
        let group: TaskGroup<u8> = TaskGroup::new();
        assert!(group.join().await.unwrap().is_empty());
    }
}
