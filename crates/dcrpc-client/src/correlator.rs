//! Request/response correlation.
//!
//! The correlator owns the pending-call map. Every access goes through
//! [`Correlator::submit`], [`Correlator::on_incoming`], [`Correlator::cancel`]
//! or [`Correlator::drain_on_close`]; the map is never handed out.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dcrpc_core::{Incoming, Notification, Outcome, Request};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::{Result, RpcError};
use crate::events::EventDispatcher;
use crate::framer::{FrameError, FrameWriter};
use crate::state::{ConnectionState, LossReason, StateCell};

/// Monotonic request id source. One allocator is shared by every connection a
/// supervisor starts, so ids stay unique across restarts.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Cancelled ids remembered for silent discarding of late responses.
const MAX_REMEMBERED_CANCELS: usize = 1024;

#[derive(Default)]
struct PendingSet {
    calls: HashMap<u64, PendingEntry>,
    /// Cancelled ids whose late responses are dropped without a warning.
    /// Holds at most `MAX_REMEMBERED_CANCELS`; the oldest ids go first.
    cancelled: BTreeSet<u64>,
    /// Set once by `drain_on_close`; later submissions are refused.
    drained: Option<LossReason>,
}

/// The caller's side of an outstanding request. Resolves exactly once.
///
/// Dropping it detaches the caller but leaves the request registered until a
/// response, a cancel or the connection closing resolves it.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            // The sender only vanishes without a value when the whole
            // correlator was dropped.
            received.unwrap_or(Err(RpcError::TransportLost(LossReason::StreamClosed)))
        })
    }
}

pub struct Correlator {
    ids: std::sync::Arc<IdAllocator>,
    pending: Mutex<PendingSet>,
    state: StateCell,
    writer: FrameWriter,
    events: EventDispatcher,
}

impl Correlator {
    pub(crate) fn new(
        ids: std::sync::Arc<IdAllocator>,
        writer: FrameWriter,
        initial: ConnectionState,
    ) -> Self {
        Self {
            ids,
            pending: Mutex::new(PendingSet::default()),
            state: StateCell::new(initial),
            writer,
            events: EventDispatcher::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub(crate) fn writer(&self) -> &FrameWriter {
        &self.writer
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.calls.len()
    }

    /// Registers and sends a request. Fails with `NotReady` unless the
    /// connection is `Ready`.
    pub async fn submit(&self, method: &str, params: Vec<Value>) -> Result<PendingCall> {
        let state = self.state.get();
        if !state.is_ready() {
            return Err(RpcError::NotReady(state));
        }
        self.submit_unchecked(method, params).await
    }

    /// Like `submit` without the state check; used for the startup handshake.
    pub(crate) async fn submit_unchecked(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<PendingCall> {
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if let Some(ref reason) = pending.drained {
                return Err(RpcError::TransportLost(reason.clone()));
            }
            pending.calls.insert(
                id,
                PendingEntry {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let request = Request::new(id, method, params);
        let sent = match serde_json::to_value(&request) {
            Ok(message) => self.writer.write(&message).await,
            Err(e) => Err(FrameError::Json(e)),
        };

        if let Err(e) = sent {
            self.pending.lock().await.calls.remove(&id);
            tracing::warn!("Failed to send request {} ({}): {}", id, method, e);
            if !matches!(e, FrameError::Json(_)) {
                self.state.degrade(format!("write failed: {}", e));
            }
            return Err(RpcError::Send(e.to_string()));
        }

        tracing::debug!("Sent request {} ({})", id, method);
        Ok(PendingCall {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Sends a notification; the engine does not answer it.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let state = self.state.get();
        if !state.is_ready() {
            return Err(RpcError::NotReady(state));
        }

        let message = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| RpcError::Send(e.to_string()))?;
        self.writer
            .write(&message)
            .await
            .map_err(|e| RpcError::Send(e.to_string()))
    }

    /// Routes one decoded frame.
    pub async fn on_incoming(&self, message: Value) {
        match Incoming::classify(message) {
            Incoming::Response { id, outcome } => self.resolve(id, outcome).await,
            Incoming::Notification(notification) => {
                tracing::debug!("Received notification {}", notification.method);
                self.events.dispatch(&notification);
            }
            Incoming::Request { id, method } => {
                tracing::warn!(
                    "Ignoring request {} ({}) from engine: client serves no methods",
                    id,
                    method
                );
            }
            Incoming::Invalid(reason) => {
                tracing::warn!("Dropping unclassifiable frame: {}", reason);
            }
        }
    }

    async fn resolve(&self, id: u64, outcome: Outcome) {
        let entry = {
            let mut pending = self.pending.lock().await;
            match pending.calls.remove(&id) {
                Some(entry) => entry,
                None => {
                    if pending.cancelled.remove(&id) {
                        tracing::debug!("Discarding response to cancelled request {}", id);
                    } else {
                        tracing::warn!("Response for unknown request id {}", id);
                    }
                    return;
                }
            }
        };

        let result = match outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(RpcError::from(error)),
            Outcome::Invalid(reason) => Err(RpcError::Protocol(reason)),
        };

        tracing::debug!(
            "Resolved request {} ({}): {}",
            id,
            entry.method,
            if result.is_ok() { "ok" } else { "error" }
        );
        if entry.tx.send(result).is_err() {
            tracing::debug!("Caller of request {} stopped waiting", id);
        }
    }

    /// Stops tracking a call. Its waiter resolves with `Cancelled` and a late
    /// response is dropped silently. Returns whether the call was pending.
    pub async fn cancel(&self, id: u64) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.calls.remove(&id) {
            Some(entry) => {
                pending.cancelled.insert(id);
                if pending.cancelled.len() > MAX_REMEMBERED_CANCELS {
                    // Ids grow monotonically, so the first is the oldest.
                    pending.cancelled.pop_first();
                }
                let _ = entry.tx.send(Err(RpcError::Cancelled));
                tracing::debug!("Cancelled request {} ({})", id, entry.method);
                true
            }
            None => false,
        }
    }

    /// Resolves every outstanding call with `TransportLost` and refuses new
    /// ones. Only the first invocation has an effect; returns the number of
    /// calls resolved.
    pub async fn drain_on_close(&self, reason: LossReason) -> usize {
        let drained: Vec<(u64, PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            if pending.drained.is_some() {
                return 0;
            }
            pending.drained = Some(reason.clone());
            pending.cancelled.clear();
            pending.calls.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!("Failing request {} ({}): {}", id, entry.method, reason);
            let _ = entry.tx.send(Err(RpcError::TransportLost(reason.clone())));
        }
        count
    }

    /// Moves to `Closed`, fails outstanding calls, ends event streams and
    /// closes the write side. Later calls are no-ops.
    pub async fn close(&self, reason: LossReason) {
        if !self.state.close(reason.clone()) {
            return;
        }
        tracing::info!("Connection closed: {}", reason);

        let failed = self.drain_on_close(reason).await;
        if failed > 0 {
            tracing::warn!("{} outstanding calls failed with transport loss", failed);
        }
        self.events.close();
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::framer::{FrameReader, FrameWriter};
    use dcrpc_core::FrameFormat;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    const MAX: usize = 64 * 1024;

    /// Correlator whose writes land in a reader the test can inspect.
    fn correlator(initial: ConnectionState) -> (Correlator, FrameReader) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let writer = FrameWriter::new(Box::new(ours), FrameFormat::Lines, MAX);
        let reader = FrameReader::new(Box::new(theirs), FrameFormat::Lines, MAX);
        (
            Correlator::new(Arc::new(IdAllocator::new()), writer, initial),
            reader,
        )
    }

    #[tokio::test]
    async fn test_submit_writes_request_and_resolves() {
        let (correlator, mut engine) = correlator(ConnectionState::Ready);

        let call = correlator
            .submit("get_fresh_msg_cnt", vec![json!(7), json!(42)])
            .await
            .unwrap();
        let sent = engine.read_next().await.unwrap();
        assert_eq!(sent["id"], call.id());
        assert_eq!(sent["method"], "get_fresh_msg_cnt");
        assert_eq!(sent["params"], json!([7, 42]));

        correlator
            .on_incoming(json!({"id": call.id(), "result": 3}))
            .await;
        assert_eq!(call.await.unwrap(), json!(3));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_requires_ready() {
        let (correlator, _engine) = correlator(ConnectionState::Starting);

        let err = correlator.submit("anything", vec![]).await.unwrap_err();
        assert_eq!(err, RpcError::NotReady(ConnectionState::Starting));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        let call = correlator.submit("x", vec![]).await.unwrap();

        correlator.on_incoming(json!({"id": 999, "result": 1})).await;
        assert_eq!(correlator.pending_count().await, 1);

        correlator.on_incoming(json!({"id": call.id(), "result": 2})).await;
        assert_eq!(call.await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_notification_never_resolves_call() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        let mut events = correlator.events().subscribe(EventFilter::all());
        let call = correlator.submit("x", vec![]).await.unwrap();

        correlator
            .on_incoming(json!({"method": "event", "params": {"id": call.id()}}))
            .await;

        assert_eq!(correlator.pending_count().await, 1);
        assert_eq!(events.recv().await.unwrap().method, "event");
    }

    #[tokio::test]
    async fn test_response_without_body_is_protocol_error() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        let call = correlator.submit("x", vec![]).await.unwrap();

        correlator.on_incoming(json!({"id": call.id()})).await;
        assert!(matches!(call.await, Err(RpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_cancel_discards_late_response() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        let call = correlator.submit("slow", vec![]).await.unwrap();
        let id = call.id();

        assert!(correlator.cancel(id).await);
        assert!(!correlator.cancel(id).await);
        assert_eq!(call.await, Err(RpcError::Cancelled));

        correlator.on_incoming(json!({"id": id, "result": 1})).await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_runs_once() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        let first = correlator.submit("a", vec![]).await.unwrap();
        let second = correlator.submit("b", vec![]).await.unwrap();

        assert_eq!(correlator.drain_on_close(LossReason::StreamClosed).await, 2);
        assert_eq!(correlator.drain_on_close(LossReason::Shutdown).await, 0);

        assert_eq!(
            first.await,
            Err(RpcError::TransportLost(LossReason::StreamClosed))
        );
        assert_eq!(
            second.await,
            Err(RpcError::TransportLost(LossReason::StreamClosed))
        );
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_after_drain_is_refused() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);
        correlator.drain_on_close(LossReason::Shutdown).await;

        let err = correlator.submit_unchecked("late", vec![]).await.unwrap_err();
        assert_eq!(err, RpcError::TransportLost(LossReason::Shutdown));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_failure_degrades() {
        let (correlator, engine) = correlator(ConnectionState::Ready);
        drop(engine);

        let err = correlator.submit("x", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Send(_)));
        assert!(matches!(correlator.state(), ConnectionState::Degraded(_)));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_degraded_rejects_new_calls_but_resolves_in_flight() {
        let (correlator, mut engine) = correlator(ConnectionState::Ready);

        let in_flight = correlator.submit("slow", vec![]).await.unwrap();
        engine.read_next().await.unwrap();
        drop(engine);

        let err = correlator.submit("b", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Send(_)));

        let err = correlator.submit("c", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::NotReady(ConnectionState::Degraded(_))
        ));
        assert_eq!(correlator.pending_count().await, 1);

        correlator
            .on_incoming(json!({"id": in_flight.id(), "result": 1}))
            .await;
        assert_eq!(in_flight.await.unwrap(), json!(1));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_ids_are_bounded() {
        let (correlator, _engine) = correlator(ConnectionState::Ready);

        let mut ids = Vec::new();
        for _ in 0..MAX_REMEMBERED_CANCELS + 10 {
            let call = correlator.submit("slow", vec![]).await.unwrap();
            ids.push(call.id());
            assert!(correlator.cancel(call.id()).await);
        }

        let cancelled = correlator.pending.lock().await.cancelled.clone();
        assert_eq!(cancelled.len(), MAX_REMEMBERED_CANCELS);
        assert!(!cancelled.contains(&ids[0]));
        assert!(cancelled.contains(ids.last().unwrap()));

        // Forgotten ids fall back to the unknown-id path and change nothing.
        correlator.on_incoming(json!({"id": ids[0], "result": 1})).await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let ids = IdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(ids.next_id()));
        }
    }
}
