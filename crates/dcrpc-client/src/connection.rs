//! Connection to an engine: the single entry point for calls and events.

use std::sync::Arc;
use std::time::Duration;

use dcrpc_core::{Notification, RpcConfig};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::correlator::{Correlator, IdAllocator, PendingCall};
use crate::error::{Result, RpcError};
use crate::events::{EventFilter, EventStream, ListenerResult, SubscriptionId};
use crate::framer::{self, FrameError, FrameReader};
use crate::state::{self, ConnectionState, LossReason};
use crate::supervisor::{ProcessExit, ProcessHandle};

/// Method name under which pumped events are dispatched.
pub const EVENT_METHOD: &str = "event";

/// Handle to a live connection. Cheap to clone; every clone talks to the same
/// engine.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    correlator: Arc<Correlator>,
    process: Option<ProcessHandle>,
    reader_task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // With a process attached, dropping its handle asks the monitor to stop
        // the engine, and the reader ends at end of stream.
        if self.process.is_none() {
            self.reader_task.abort();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let correlator = self.correlator.clone();
                handle.spawn(async move { correlator.close(LossReason::Shutdown).await });
            }
        }
    }
}

impl Connection {
    /// Connects over an existing stream pair. The connection is ready at once.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_streams_with(reader, writer, &RpcConfig::default())
    }

    /// Like [`Connection::from_streams`] with explicit transport settings.
    pub fn from_streams_with<R, W>(reader: R, writer: W, rpc: &RpcConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = framer::framed(reader, writer, rpc.frame_format, rpc.max_frame_size);
        let correlator = Arc::new(Correlator::new(
            Arc::new(IdAllocator::new()),
            writer,
            ConnectionState::Ready,
        ));
        let reader_task = spawn_reader(reader, correlator.clone(), None);
        Self::assemble(correlator, reader_task, None)
    }

    pub(crate) fn assemble(
        correlator: Arc<Correlator>,
        reader_task: JoinHandle<()>,
        process: Option<ProcessHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                correlator,
                process,
                reader_task,
            }),
        }
    }

    pub(crate) fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    pub(crate) fn process(&self) -> Option<&ProcessHandle> {
        self.inner.process.as_ref()
    }

    /// Calls a method and waits for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.submit(method, params).await?.await
    }

    /// Calls a method and deserializes its result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Sends a request and returns its pending call without waiting.
    pub async fn submit(&self, method: &str, params: Vec<Value>) -> Result<PendingCall> {
        self.inner.correlator.submit(method, params).await
    }

    /// Stops waiting for a call. A late response is discarded.
    pub async fn cancel(&self, id: u64) -> bool {
        self.inner.correlator.cancel(id).await
    }

    /// Sends a notification. Nothing is returned for it.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.inner.correlator.notify(method, params).await
    }

    pub fn subscribe_events(&self, filter: EventFilter) -> EventStream {
        self.inner.correlator.events().subscribe(filter)
    }

    /// Registers a callback run on the reader task for every matching event.
    pub fn add_listener<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> ListenerResult + Send + Sync + 'static,
    {
        self.inner.correlator.events().add_listener(filter, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.correlator.events().unsubscribe(id)
    }

    /// Registers a callback for an unrequested engine exit. Connections built
    /// from plain streams have no process and never call it.
    pub fn on_crash<F>(&self, callback: F)
    where
        F: Fn(&ProcessExit) + Send + Sync + 'static,
    {
        if let Some(ref process) = self.inner.process {
            process.on_crash(Box::new(callback));
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.correlator.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.correlator.state_changes()
    }

    /// Waits until the connection is closed.
    pub async fn wait_closed(&self) -> LossReason {
        state::wait_closed(self.state_changes()).await
    }

    pub async fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count().await
    }

    /// Engine process id, if this connection owns a process.
    pub fn pid(&self) -> Option<u32> {
        self.inner.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Stops the connection and, if attached, the engine process. Idempotent;
    /// returns the exit record of the process.
    pub async fn shutdown(&self) -> Option<ProcessExit> {
        match self.inner.process {
            Some(ref process) => {
                process.request_shutdown();
                Some(process.wait().await)
            }
            None => {
                self.inner.correlator.close(LossReason::Shutdown).await;
                None
            }
        }
    }

    pub async fn close(&self) {
        self.shutdown().await;
    }

    /// Polls `method` in a loop and dispatches every result as an `event`
    /// notification. Ends when the connection stops carrying calls or the
    /// engine answers with an error.
    pub fn spawn_event_pump(&self, method: impl Into<String>) -> JoinHandle<()> {
        let correlator = self.inner.correlator.clone();
        let method = method.into();

        tokio::spawn(async move {
            tracing::info!("Event pump started ({})", method);
            loop {
                let pending = match correlator.submit(&method, Vec::new()).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        tracing::debug!("Event pump stopping: {}", e);
                        break;
                    }
                };

                match pending.await {
                    Ok(event) => correlator
                        .events()
                        .dispatch(&Notification::new(EVENT_METHOD, event)),
                    Err(e @ RpcError::TransportLost(_)) | Err(e @ RpcError::Cancelled) => {
                        tracing::debug!("Event pump stopping: {}", e);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Event pump failed: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("Event pump stopped ({})", method);
        })
    }
}

/// Spawns the task that feeds decoded frames to the correlator.
///
/// `grace` is set when a process owns the stream: end of stream then only
/// degrades the connection and leaves the exit monitor a grace period to
/// report the process exit.
pub(crate) fn spawn_reader(
    mut reader: FrameReader,
    correlator: Arc<Correlator>,
    grace: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.read_next().await {
                Ok(message) => correlator.on_incoming(message).await,
                Err(FrameError::Malformed(reason)) => {
                    tracing::warn!("Skipping malformed frame: {}", reason);
                }
                Err(FrameError::StreamClosed) => {
                    tracing::debug!("Engine output stream ended");
                    if let Some(grace) = grace {
                        correlator
                            .state_cell()
                            .degrade("engine closed its output stream");
                        let closed = state::wait_closed(correlator.state_changes());
                        if tokio::time::timeout(grace, closed).await.is_ok() {
                            break;
                        }
                    }
                    correlator.close(LossReason::StreamClosed).await;
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read from engine: {}", e);
                    correlator.close(LossReason::Io(e.to_string())).await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Engine side of an in-memory connection.
    fn pair() -> (Connection, BufReader<DuplexStream>, DuplexStream) {
        let (client_read, engine_write) = tokio::io::duplex(64 * 1024);
        let (engine_read, client_write) = tokio::io::duplex(64 * 1024);
        let connection = Connection::from_streams(client_read, client_write);
        (connection, BufReader::new(engine_read), engine_write)
    }

    async fn next_request(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut DuplexStream, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (connection, mut engine_in, mut engine_out) = pair();

        let caller = connection.clone();
        let call = tokio::spawn(async move {
            caller
                .call("get_fresh_msg_cnt", vec![json!(7), json!(42)])
                .await
        });

        let request = next_request(&mut engine_in).await;
        assert_eq!(request["method"], "get_fresh_msg_cnt");
        reply(&mut engine_out, json!({"id": request["id"], "result": 3})).await;

        assert_eq!(call.await.unwrap().unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_call_as_decodes() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Info {
            name: String,
        }

        let (connection, mut engine_in, mut engine_out) = pair();
        let caller = connection.clone();
        let call = tokio::spawn(async move {
            let info: Result<Info> = caller.call_as("get_info", vec![]).await;
            let count: Result<u32> = caller.call_as("get_info", vec![]).await;
            (info, count)
        });

        for _ in 0..2 {
            let request = next_request(&mut engine_in).await;
            reply(
                &mut engine_out,
                json!({"id": request["id"], "result": {"name": "engine"}}),
            )
            .await;
        }

        let (info, count) = call.await.unwrap();
        assert_eq!(info.unwrap().name, "engine");
        assert!(matches!(count, Err(RpcError::Decode(_))));
    }

    #[tokio::test]
    async fn test_notify_has_no_id() {
        let (connection, mut engine_in, _engine_out) = pair();

        connection
            .notify("ping", json!({"seq": 1}))
            .await
            .unwrap();

        let message = next_request(&mut engine_in).await;
        assert_eq!(message["method"], "ping");
        assert!(message.get("id").is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_closes() {
        let (connection, mut engine_in, engine_out) = pair();

        let caller = connection.clone();
        let call = tokio::spawn(async move { caller.call("slow", vec![]).await });
        next_request(&mut engine_in).await;
        drop(engine_out);

        assert_eq!(
            call.await.unwrap(),
            Err(RpcError::TransportLost(LossReason::StreamClosed))
        );
        assert_eq!(connection.wait_closed().await, LossReason::StreamClosed);

        let err = connection.call("later", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::NotReady(ConnectionState::Closed(_))));
    }

    #[tokio::test]
    async fn test_shutdown_without_process() {
        let (connection, _engine_in, _engine_out) = pair();

        assert!(connection.shutdown().await.is_none());
        assert!(connection.shutdown().await.is_none());
        assert_eq!(
            connection.state(),
            ConnectionState::Closed(LossReason::Shutdown)
        );
        assert_eq!(connection.pid(), None);
    }

    #[tokio::test]
    async fn test_event_pump_dispatches_results() {
        let (connection, mut engine_in, mut engine_out) = pair();
        let mut events = connection.subscribe_events(EventFilter::all().account(1));
        let pump = connection.spawn_event_pump("get_next_event");

        for account in [2, 1] {
            let request = next_request(&mut engine_in).await;
            assert_eq!(request["method"], "get_next_event");
            reply(
                &mut engine_out,
                json!({"id": request["id"], "result": {"contextId": account, "event": {"kind": "Info"}}}),
            )
            .await;
        }

        let event = events.recv().await.unwrap();
        assert_eq!(event.method, EVENT_METHOD);
        assert_eq!(event.params["contextId"], 1);

        next_request(&mut engine_in).await;
        connection.shutdown().await;
        pump.await.unwrap();
    }
}
