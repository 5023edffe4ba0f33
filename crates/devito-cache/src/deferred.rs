//! Settle-once values.
//!
//! A [`Deferred`] is the producing side: it can be resolved or rejected
//! exactly once, and later attempts are ignored. Any number of [`Pending`]
//! handles can wait on it; waiters that arrive after settlement get the
//! stored result immediately. If every `Deferred` clone is dropped without
//! settling, waiters receive [`Abandoned`] converted into their error type.

use std::sync::Arc;
use tokio::sync::watch;

type Slot<T, E> = Option<Result<T, E>>;

/// The producer went away without settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deferred value was dropped before it settled")]
pub struct Abandoned;

/// Producing side of a settle-once value.
///
/// # Example
///
/// ```ignore
/// use devito_cache::{Abandoned, Deferred};
///
/// let deferred: Deferred<u32, Abandoned> = Deferred::new();
/// let waiter = deferred.subscribe();
///
/// assert!(deferred.resolve(7));
/// assert!(!deferred.reject(Abandoned)); // already settled
/// assert_eq!(waiter.wait().await, Ok(7));
/// ```
#[derive(Debug)]
pub struct Deferred<T, E> {
    tx: Arc<watch::Sender<Slot<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A deferred that is already resolved.
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    /// Returns `true` if this call settled the value.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Returns `true` if this call settled the value.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, result: Result<T, E>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        })
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A waiting handle that does not keep the producer alive.
    pub fn subscribe(&self) -> Pending<T, E> {
        Pending {
            rx: self.tx.subscribe(),
        }
    }

    pub async fn wait(&self) -> Result<T, E> {
        self.subscribe().wait().await
    }
}

/// Waiting side of a [`Deferred`].
#[derive(Debug)]
pub struct Pending<T, E> {
    rx: watch::Receiver<Slot<T, E>>,
}

impl<T, E> Clone for Pending<T, E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T, E> Pending<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The settled result, if any, without waiting.
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.rx.borrow().clone()
    }

    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or_else(|| Err(Abandoned.into())),
            Err(_) => Err(Abandoned.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Failed(&'static str),
        Gone,
    }

    impl From<Abandoned> for TestError {
        fn from(_: Abandoned) -> Self {
            TestError::Gone
        }
    }

    #[tokio::test]
    async fn settles_exactly_once() {
        let d: Deferred<u32, TestError> = Deferred::new();
        assert!(!d.is_settled());
        assert!(d.resolve(1));
        assert!(!d.resolve(2));
        assert!(!d.reject(TestError::Failed("late")));
        assert_eq!(d.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn late_listener_gets_stored_value() {
        let d: Deferred<&'static str, TestError> = Deferred::new();
        d.reject(TestError::Failed("boom"));
        let pending = d.subscribe();
        assert!(pending.is_settled());
        assert_eq!(pending.wait().await, Err(TestError::Failed("boom")));
        assert_eq!(pending.peek(), Some(Err(TestError::Failed("boom"))));
    }

    #[tokio::test]
    async fn waiters_are_woken_on_settle() {
        let d: Deferred<u32, TestError> = Deferred::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pending = d.subscribe();
                tokio::spawn(async move { pending.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(5)).await;
        d.resolve(7);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(7));
        }
    }

    #[tokio::test]
    async fn dropping_the_producer_abandons_waiters() {
        let d: Deferred<u32, TestError> = Deferred::new();
        let pending = d.subscribe();
        drop(d);
        assert_eq!(pending.wait().await, Err(TestError::Gone));
    }

    #[tokio::test]
    async fn settled_value_survives_producer_drop() {
        let d: Deferred<u32, TestError> = Deferred::resolved(3);
        let pending = d.subscribe();
        drop(d);
        assert_eq!(pending.wait().await, Ok(3));
    }
}
