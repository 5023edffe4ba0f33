//! Quiescence-window debouncing.
//!
//! Every [`Debouncer::schedule`] call restarts the window. When the window
//! passes with no new item, the callback runs once with everything collected
//! since the burst began, in call order. Items scheduled while the callback
//! is running start the next burst. Dropping the debouncer cancels a pending
//! fire.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Collects items into bursts and hands each burst to a callback.
///
/// The callback runs on the debouncer's own task, one burst at a time, so it
/// never overlaps itself.
///
/// # Example
///
/// ```ignore
/// use devito_core::Debouncer;
/// use std::time::Duration;
///
/// let rebuilds = Debouncer::new(Duration::from_millis(200), |paths: Vec<String>| async move {
///     println!("rebuilding for {} changes", paths.len());
/// });
///
/// rebuilds.schedule("src/a.ts".to_string());
/// rebuilds.schedule("src/b.ts".to_string());
/// // one callback with both paths, 200ms after the second call
/// ```
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
    window: Duration,
}

impl<T> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer").field("window", &self.window).finish()
    }
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn the debounce loop on the current tokio runtime.
    pub fn new<F, Fut>(window: Duration, fire: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let task = tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(item) => batch.push(item),
                            None => return,
                        },
                        _ = tokio::time::sleep(window) => break,
                    }
                }
                fire(batch).await;
            }
        });
        Self { tx, task, window }
    }

    /// Add an item to the current burst and restart the window.
    pub fn schedule(&self, item: T) {
        if self.tx.send(item).is_err() {
            tracing::warn!("debouncer loop has stopped; dropping scheduled item");
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
