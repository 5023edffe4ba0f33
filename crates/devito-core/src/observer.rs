//! Build lifecycle hooks.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::bus::{BusMessage, ChangeBus};
use crate::error::CompileFailure;

/// Logical paths announced before every bundled rebuild.
pub const BUNDLE_PATHS: [&str; 2] = ["/bundle.js", "/bundle.css"];

/// Receives coordinator events. Every method defaults to doing nothing.
///
/// For one rebuild the order is `on_change` (only when files changed), then
/// `on_before_rebuild`, then exactly one of `on_applied` or `on_failed`. A
/// superseded generation gets `on_before_rebuild` and nothing after it.
#[async_trait]
pub trait BuildObserver: Send + Sync {
    /// Watched files changed; their cache entries are already evicted.
    async fn on_change(&self, _paths: &[PathBuf]) {}

    /// A build of `generation` is about to start.
    async fn on_before_rebuild(&self, _generation: u64) {}

    /// The artifacts of `generation` are now being served.
    async fn on_applied(&self, _generation: u64) {}

    /// The current generation failed; the previous artifacts stay live.
    async fn on_failed(&self, _failure: &CompileFailure) {}
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl BuildObserver for NoopObserver {}

/// Forwards build events to connected clients.
#[derive(Debug, Clone)]
pub struct BusNotifier {
    bus: ChangeBus,
}

impl BusNotifier {
    pub fn new(bus: ChangeBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl BuildObserver for BusNotifier {
    async fn on_before_rebuild(&self, generation: u64) {
        let report = self.bus.broadcast(&BusMessage::update(BUNDLE_PATHS)).await;
        tracing::debug!(
            "announced build {} to {} clients",
            generation,
            report.delivered
        );
    }

    async fn on_failed(&self, failure: &CompileFailure) {
        self.bus.broadcast(&BusMessage::Error(failure.clone())).await;
    }
}
