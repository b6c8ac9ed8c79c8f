//! In-memory engine for driving a `Connection` from tests.

#![allow(dead_code)]

use dcrpc_client::framer::{self, FrameReader, FrameWriter};
use dcrpc_client::Connection;
use dcrpc_core::{ErrorObject, FrameFormat, Notification, Request, Response, RpcConfig};
use serde_json::Value;

const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Engine end of a duplex pair. Dropping it closes the client's stream.
pub struct FakeEngine {
    reader: FrameReader,
    writer: FrameWriter,
}

pub fn connect() -> (Connection, FakeEngine) {
    connect_with(FrameFormat::Lines)
}

pub fn connect_with(format: FrameFormat) -> (Connection, FakeEngine) {
    let (client_read, engine_write) = tokio::io::duplex(256 * 1024);
    let (engine_read, client_write) = tokio::io::duplex(256 * 1024);

    let rpc = RpcConfig {
        frame_format: format,
        max_frame_size: MAX_FRAME_SIZE,
        ..RpcConfig::default()
    };
    let connection = Connection::from_streams_with(client_read, client_write, &rpc);
    let (reader, writer) = framer::framed(engine_read, engine_write, format, MAX_FRAME_SIZE);

    (connection, FakeEngine { reader, writer })
}

impl FakeEngine {
    /// Next request the client sent.
    pub async fn next_request(&mut self) -> Request {
        let message = self.reader.read_next().await.expect("client stream ended");
        serde_json::from_value(message).expect("not a request")
    }

    pub async fn next_message(&mut self) -> Value {
        self.reader.read_next().await.expect("client stream ended")
    }

    pub async fn reply(&self, id: u64, result: Value) {
        self.send(serde_json::to_value(Response::success(id, result)).unwrap())
            .await;
    }

    pub async fn reply_error(&self, id: u64, code: i64, message: &str) {
        let response = Response::error(id, ErrorObject::application_error(code, message));
        self.send(serde_json::to_value(response).unwrap()).await;
    }

    pub async fn notify(&self, method: &str, params: Value) {
        self.send(serde_json::to_value(Notification::new(method, params)).unwrap())
            .await;
    }

    pub async fn send(&self, message: Value) {
        self.writer.write(&message).await.expect("client stream closed");
    }
}
