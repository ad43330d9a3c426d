//! Live tailing of a scope over a message transport.
//!
//! A stream starts at the current head of its scope and never replays
//! history. Each round it registers a wake handle, then takes a snapshot,
//! so a write landing between the two is caught by the next round. Records
//! newer than the stream's high-water mark are sent oldest first.
//!
//! Records written and trimmed out of the bounded history before the stream
//! wakes are not delivered.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::store::EventStore;
use crate::types::{LogRecord, Scope};

/// Errors that end a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A record could not be encoded for the wire.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing to the peer failed.
    #[error("failed to send record: {0}")]
    Send(String),

    /// Reading from the peer failed.
    #[error("failed to read from peer: {0}")]
    Receive(String),
}

/// Something the peer sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Any message; its content is ignored.
    Message,

    /// The peer closed the connection.
    Closed,
}

/// How a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server is shutting down.
    Cancelled,

    /// The peer went away.
    PeerClosed,
}

/// A bidirectional message channel to one streaming consumer.
///
/// `next_incoming` must be cancel safe: the stream loop drops its future
/// whenever a wake arrives first.
pub trait StreamTransport: Send {
    /// Sends one record to the peer.
    fn send_record(
        &mut self,
        record: &LogRecord,
    ) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Waits for the next message from the peer.
    fn next_incoming(&mut self) -> impl Future<Output = Result<Incoming, StreamError>> + Send;

    /// Closes the connection. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

enum Wakeup {
    Changed,
    Incoming(Result<Incoming, StreamError>),
    Cancelled,
}

/// Tails `scope` into `transport` until the peer leaves, a transport
/// operation fails or `cancel` fires.
///
/// # Errors
///
/// Returns the [`StreamError`] of the first failed transport operation.
pub async fn run_stream<T: StreamTransport>(
    store: Arc<EventStore>,
    scope: Scope,
    transport: &mut T,
    cancel: CancellationToken,
) -> Result<StreamEnd, StreamError> {
    let result = tail(&store, &scope, transport, &cancel).await;
    match &result {
        Ok(end) => debug!(%scope, ?end, "Stream finished"),
        Err(err) => debug!(%scope, error = %err, "Stream failed"),
    }
    if !matches!(result, Ok(StreamEnd::PeerClosed)) {
        transport.close().await;
    }
    result
}

async fn tail<T: StreamTransport>(
    store: &EventStore,
    scope: &Scope,
    transport: &mut T,
    cancel: &CancellationToken,
) -> Result<StreamEnd, StreamError> {
    let mut handle = store.wait(scope);
    let mut high_water = store.head(scope);
    debug!(%scope, ?high_water, "Stream started");

    loop {
        let wakeup = tokio::select! {
            biased;
            () = cancel.cancelled() => Wakeup::Cancelled,
            () = handle.notified() => Wakeup::Changed,
            incoming = transport.next_incoming() => Wakeup::Incoming(incoming),
        };

        match wakeup {
            Wakeup::Cancelled => return Ok(StreamEnd::Cancelled),
            Wakeup::Incoming(Ok(Incoming::Message)) => {
                trace!(%scope, "Ignoring message from stream peer");
            }
            Wakeup::Incoming(Ok(Incoming::Closed)) => return Ok(StreamEnd::PeerClosed),
            Wakeup::Incoming(Err(err)) => return Err(err),
            Wakeup::Changed => {
                handle = store.wait(scope);
                let delta = store.delta(scope, high_water);
                if delta.head.is_none() {
                    // The scope was cleared; start over from an empty history.
                    high_water = None;
                    continue;
                }
                trace!(%scope, count = delta.records.len(), "Sending new records");
                for record in &delta.records {
                    transport.send_record(record).await?;
                }
                high_water = delta.head;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FixedLimits;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// Transport backed by in-memory channels.
    struct ChannelTransport {
        sent: mpsc::UnboundedSender<LogRecord>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
        fail_sends: bool,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl StreamTransport for ChannelTransport {
        async fn send_record(&mut self, record: &LogRecord) -> Result<(), StreamError> {
            if self.fail_sends {
                return Err(StreamError::Send("broken pipe".into()));
            }
            self.sent
                .send(record.clone())
                .map_err(|err| StreamError::Send(err.to_string()))
        }

        async fn next_incoming(&mut self) -> Result<Incoming, StreamError> {
            Ok(self.incoming.recv().await.unwrap_or(Incoming::Closed))
        }

        async fn close(&mut self) {
            self.closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct Harness {
        store: Arc<EventStore>,
        received: mpsc::UnboundedReceiver<LogRecord>,
        peer: mpsc::UnboundedSender<Incoming>,
        cancel: CancellationToken,
        closed: Arc<std::sync::atomic::AtomicBool>,
        task: JoinHandle<Result<StreamEnd, StreamError>>,
    }

    impl Harness {
        async fn start(store: Arc<EventStore>, scope: Scope, fail_sends: bool) -> Self {
            let (sent_tx, received) = mpsc::unbounded_channel();
            let (peer, incoming) = mpsc::unbounded_channel();
            let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let mut transport = ChannelTransport {
                sent: sent_tx,
                incoming,
                fail_sends,
                closed: closed.clone(),
            };
            let cancel = CancellationToken::new();
            let listeners_before = store.scope_listener_count(&scope);

            let task = tokio::spawn({
                let store = store.clone();
                let scope = scope.clone();
                let cancel = cancel.clone();
                async move { run_stream(store, scope, &mut transport, cancel).await }
            });

            // Wait until the stream has registered its first wake handle.
            timeout(Duration::from_secs(5), async {
                while store.scope_listener_count(&scope) <= listeners_before {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("stream never registered");

            Self {
                store,
                received,
                peer,
                cancel,
                closed,
                task,
            }
        }

        async fn next(&mut self) -> LogRecord {
            timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("timed out waiting for record")
                .expect("stream ended")
        }

        async fn assert_quiet(&mut self) {
            let extra = timeout(Duration::from_millis(50), self.received.recv()).await;
            assert!(extra.is_err(), "unexpected record: {extra:?}");
        }
    }

    fn new_store() -> Arc<EventStore> {
        Arc::new(EventStore::new(Arc::new(FixedLimits::new(100, 1000))))
    }

    #[tokio::test]
    async fn global_stream_delivers_new_record() {
        let mut h = Harness::start(new_store(), Scope::Global, false).await;
        let id = h.store.add("x", "hello");

        let record = h.next().await;
        assert_eq!(record.id, id);
        assert_eq!(record.service, "x");
        assert_eq!(record.message, "hello");
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn history_is_not_replayed() {
        let store = new_store();
        store.add("a", "old");
        let mut h = Harness::start(store, Scope::service("a"), false).await;

        h.store.add("a", "new");
        assert_eq!(h.next().await.message, "new");
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn batched_records_arrive_in_order() {
        let mut h = Harness::start(new_store(), Scope::service("a"), false).await;
        h.store.add_batch("a", &["1", "2", "3"]);

        for expected in ["1", "2", "3"] {
            assert_eq!(h.next().await.message, expected);
        }
    }

    #[tokio::test]
    async fn service_stream_ignores_other_services() {
        let mut h = Harness::start(new_store(), Scope::service("a"), false).await;
        h.store.add("b", "elsewhere");
        h.store.add("a", "here");

        assert_eq!(h.next().await.message, "here");
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn stream_restarts_after_service_is_cleared() {
        let mut h = Harness::start(new_store(), Scope::service("a"), false).await;
        h.store.add("a", "before");
        assert_eq!(h.next().await.message, "before");

        h.store.delete_service("a").unwrap();
        h.store.add("a", "after");
        assert_eq!(h.next().await.message, "after");
    }

    #[tokio::test]
    async fn peer_messages_are_ignored() {
        let mut h = Harness::start(new_store(), Scope::Global, false).await;
        h.peer.send(Incoming::Message).unwrap();
        h.store.add("a", "still streaming");
        assert_eq!(h.next().await.message, "still streaming");
    }

    #[tokio::test]
    async fn peer_close_ends_stream() {
        let h = Harness::start(new_store(), Scope::Global, false).await;
        h.peer.send(Incoming::Closed).unwrap();

        let end = h.task.await.unwrap().unwrap();
        assert_eq!(end, StreamEnd::PeerClosed);
    }

    #[tokio::test]
    async fn cancellation_ends_stream_and_closes_transport() {
        let h = Harness::start(new_store(), Scope::Global, false).await;
        h.cancel.cancel();

        let end = h.task.await.unwrap().unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert!(h.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_failure_ends_stream_with_error() {
        let h = Harness::start(new_store(), Scope::Global, true).await;
        h.store.add("a", "undeliverable");

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(StreamError::Send(_))));
    }

    #[tokio::test]
    async fn finished_stream_releases_its_wake_handle() {
        let h = Harness::start(new_store(), Scope::Global, false).await;
        assert_eq!(h.store.listener_count(), 1);
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert_eq!(h.store.listener_count(), 0);
    }
}
