//! Change propagation bus.
//!
//! Fans live-update messages out to every connected client. Each client owns
//! a bounded channel; a client that has gone away or stops draining its
//! channel is removed without affecting the others.

use futures::future::join_all;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

use crate::error::{CompileFailure, TransportFailure};

/// Messages sent to clients.
///
/// Serialized as `{"type": "...", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum BusMessage {
    /// First message on every connection: drop anything cached so far.
    Start,
    /// These logical paths are about to change.
    Update(Vec<String>),
    /// The last build failed.
    Error(CompileFailure),
}

impl BusMessage {
    pub fn update<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BusMessage::Update(paths.into_iter().map(Into::into).collect())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients that accepted the message.
    pub delivered: usize,
    /// Clients removed because the send failed.
    pub dropped: Vec<u64>,
}

const DEFAULT_CAPACITY: usize = 100;
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct BusInner {
    clients: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    // held for a whole broadcast so per-client order matches call order
    order: tokio::sync::Mutex<()>,
    capacity: usize,
    send_timeout: Duration,
}

impl BusInner {
    fn disconnect(&self, id: u64) -> bool {
        self.clients.write().remove(&id).is_some()
    }
}

/// Connected clients and the broadcast entry point. Cheap to clone.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("clients", &self.client_count())
            .field("send_timeout", &self.inner.send_timeout)
            .finish()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }

    /// # Arguments
    ///
    /// * `capacity` - Messages buffered per client before sends start waiting
    /// * `send_timeout` - How long a broadcast waits on one full client
    pub fn with_settings(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                clients: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                order: tokio::sync::Mutex::new(()),
                capacity: capacity.max(1),
                send_timeout,
            }),
        }
    }

    /// Register a client. The returned channel already holds `start`.
    pub fn connect(&self) -> ClientChannel {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let _ = tx.try_send(BusMessage::Start.to_json());
        self.inner.clients.write().insert(id, tx);
        tracing::debug!("client {} connected", id);

        ClientChannel {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a client. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: u64) -> bool {
        self.inner.disconnect(id)
    }

    /// Send `message` to every client concurrently.
    ///
    /// Never fails as a whole: clients whose send fails are removed and
    /// listed in the report.
    pub async fn broadcast(&self, message: &BusMessage) -> BroadcastReport {
        let json = message.to_json();
        let _order = self.inner.order.lock().await;

        let clients: Vec<(u64, mpsc::Sender<String>)> = self
            .inner
            .clients
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let timeout = self.inner.send_timeout;
        let sends = clients.into_iter().map(|(id, tx)| {
            let json = json.clone();
            async move {
                tx.send_timeout(json, timeout).await.map_err(|e| match e {
                    SendTimeoutError::Closed(_) => TransportFailure::Closed(id),
                    SendTimeoutError::Timeout(_) => TransportFailure::Timeout(id),
                })
            }
        });

        let mut report = BroadcastReport::default();
        for result in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    tracing::warn!("{}", failure);
                    let id = failure.client_id();
                    self.inner.disconnect(id);
                    report.dropped.push(id);
                }
            }
        }
        report.dropped.sort_unstable();
        report
    }

    /// Get number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }
}

/// One client's end of the bus. Dropping it disconnects the client.
pub struct ClientChannel {
    id: u64,
    rx: mpsc::Receiver<String>,
    bus: Weak<BusInner>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel").field("id", &self.id).finish()
    }
}

impl ClientChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized message, or `None` once disconnected.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting messages while staying registered until the next
    /// broadcast notices.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for ClientChannel {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.disconnect(self.id) {
                tracing::debug!("client {} disconnected", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        assert_eq!(BusMessage::Start.to_json(), r#"{"type":"start"}"#);
        assert_eq!(
            BusMessage::update(["/bundle.js"]).to_json(),
            r#"{"type":"update","payload":["/bundle.js"]}"#
        );
        let error = BusMessage::Error(CompileFailure::new("boom")).to_json();
        assert_eq!(
            error,
            r#"{"type":"error","payload":{"message":"boom","diagnostics":[]}}"#
        );
    }

    #[tokio::test]
    async fn connect_sends_start_first() {
        let bus = ChangeBus::new();
        let mut client = bus.connect();
        assert_eq!(client.recv().await.unwrap(), BusMessage::Start.to_json());
        assert_eq!(bus.client_count(), 1);
    }

    #[tokio::test]
    async fn messages_arrive_in_broadcast_order() {
        let bus = ChangeBus::new();
        let mut client = bus.connect();
        client.recv().await.unwrap();

        bus.broadcast(&BusMessage::update(["/a"])).await;
        bus.broadcast(&BusMessage::update(["/b"])).await;
        bus.broadcast(&BusMessage::Error(CompileFailure::new("x"))).await;

        let got: Vec<BusMessage> = (0..3)
            .map(|_| serde_json::from_str(&client.try_recv().unwrap()).unwrap())
            .collect();
        assert_eq!(
            got,
            vec![
                BusMessage::update(["/a"]),
                BusMessage::update(["/b"]),
                BusMessage::Error(CompileFailure::new("x")),
            ]
        );
    }

    #[tokio::test]
    async fn dropping_the_channel_disconnects() {
        let bus = ChangeBus::new();
        let client = bus.connect();
        let id = client.id();
        drop(client);
        assert_eq!(bus.client_count(), 0);
        assert!(!bus.disconnect(id));
    }

    #[tokio::test]
    async fn closed_client_is_removed_and_others_still_receive() {
        let bus = ChangeBus::new();
        let mut gone = bus.connect();
        let mut alive = bus.connect();
        gone.close();

        let report = bus.broadcast(&BusMessage::update(["/bundle.js"])).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![gone.id()]);
        assert_eq!(bus.client_count(), 1);

        alive.recv().await.unwrap();
        assert_eq!(
            alive.recv().await.unwrap(),
            BusMessage::update(["/bundle.js"]).to_json()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_client_times_out() {
        let bus = ChangeBus::with_settings(1, Duration::from_millis(50));
        // never drained: its single slot is taken by `start`
        let stuck = bus.connect();
        let mut reader = bus.connect();
        reader.recv().await.unwrap();

        let report = bus.broadcast(&BusMessage::update(["/x"])).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![stuck.id()]);
        assert_eq!(reader.recv().await.unwrap(), BusMessage::update(["/x"]).to_json());
    }
}
