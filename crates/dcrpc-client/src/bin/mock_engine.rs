//! dcrpc mock engine
//!
//! Scripted stand-in for the messaging engine, used by the integration tests.
//! Speaks JSON-RPC on stdin/stdout and answers a handful of test methods:
//!
//! - `get_system_info` → engine description
//! - `echo [..]` → the params array
//! - `sleep [ms, value]` → `value` after `ms` milliseconds
//! - `fail [code, message]` → an error response
//! - `exit [code]` → exits without answering
//! - `emit [method, params]` → sends a notification, then answers `true`
//! - `queue_event [event]` / `get_next_event` → long-poll event queue
//! - `stderr [text]` → writes `text` to stderr
//! - `env [name]` → value of an environment variable
//! - `close_stdout` → closes stdout without answering and keeps running
//!
//! Environment switches: `MOCK_ENGINE_EXIT_AT_START=<code>`,
//! `MOCK_ENGINE_SILENT=1` (never answer), `MOCK_ENGINE_IGNORE_STDIN_EOF=1`
//! (keep running after stdin closes), `MOCK_ENGINE_FRAMING=content_length`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dcrpc_client::framer::{self, FrameError, FrameWriter};
use dcrpc_core::{ErrorObject, FrameFormat, Notification, Request, Response};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

struct MockEngine {
    writer: FrameWriter,
    events_tx: mpsc::UnboundedSender<Value>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl MockEngine {
    async fn send(&self, message: impl serde::Serialize) {
        match serde_json::to_value(message) {
            Ok(value) => {
                if let Err(e) = self.writer.write(&value).await {
                    eprintln!("mock engine: write failed: {}", e);
                }
            }
            Err(e) => eprintln!("mock engine: serialize failed: {}", e),
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        let id = request.id;
        let params = request.params;
        let arg = |index: usize| params.get(index).cloned().unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "get_system_info" => Ok(json!({
                "deltachat_core_version": "mock",
                "pid": std::process::id(),
            })),
            "echo" => Ok(Value::Array(params.clone())),
            "sleep" => {
                let ms = arg(0).as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(arg(1))
            }
            "fail" => {
                let code = arg(0).as_i64().unwrap_or(-1);
                let message = arg(1).as_str().unwrap_or("failure").to_string();
                Err(ErrorObject::application_error(code, message))
            }
            "exit" => {
                let code = arg(0).as_i64().unwrap_or(0) as i32;
                std::process::exit(code);
            }
            "emit" => match arg(0) {
                Value::String(method) => {
                    self.send(Notification::new(method, arg(1))).await;
                    Ok(Value::Bool(true))
                }
                _ => Err(ErrorObject::invalid_params("emit expects [method, params]")),
            },
            "queue_event" => {
                let _ = self.events_tx.send(arg(0));
                Ok(Value::Null)
            }
            "get_next_event" => match self.events_rx.lock().await.recv().await {
                Some(event) => Ok(event),
                None => Err(ErrorObject::application_error(-1, "event queue closed")),
            },
            "stderr" => {
                eprintln!("{}", arg(0).as_str().unwrap_or_default());
                Ok(Value::Null)
            }
            "env" => match arg(0) {
                Value::String(name) => Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null)),
                _ => Err(ErrorObject::invalid_params("env expects [name]")),
            },
            other => Err(ErrorObject::method_not_found(other)),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(error) => Response::error(id, error),
        }
    }
}

/// Closes file descriptor 1 so the client sees end of stream.
#[cfg(unix)]
fn close_stdout() {
    use std::os::fd::{FromRawFd, OwnedFd};

    // SAFETY: the only stdout writer was closed above; nothing uses fd 1 afterwards.
    drop(unsafe { OwnedFd::from_raw_fd(1) });
}

#[cfg(not(unix))]
fn close_stdout() {}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(code) = std::env::var("MOCK_ENGINE_EXIT_AT_START") {
        std::process::exit(code.parse().unwrap_or(1));
    }

    let silent = env_flag("MOCK_ENGINE_SILENT");
    let ignore_eof = env_flag("MOCK_ENGINE_IGNORE_STDIN_EOF");
    let format = match std::env::var("MOCK_ENGINE_FRAMING").as_deref() {
        Ok("content_length") => FrameFormat::ContentLength,
        _ => FrameFormat::Lines,
    };

    let (mut reader, writer) =
        framer::framed(tokio::io::stdin(), tokio::io::stdout(), format, MAX_FRAME_SIZE);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(MockEngine {
        writer,
        events_tx,
        events_rx: Mutex::new(events_rx),
    });

    loop {
        let message = match reader.read_next().await {
            Ok(message) => message,
            Err(FrameError::Malformed(reason)) => {
                eprintln!("mock engine: malformed frame: {}", reason);
                continue;
            }
            Err(FrameError::StreamClosed) => break,
            Err(e) => return Err(e.into()),
        };

        if silent {
            continue;
        }

        let request: Request = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(_) => {
                eprintln!("mock engine: ignoring non-request message");
                continue;
            }
        };

        if request.method == "close_stdout" {
            engine.writer.close().await;
            close_stdout();
            continue;
        }

        let engine = engine.clone();
        tokio::spawn(async move {
            let response = engine.handle_request(request).await;
            engine.send(response).await;
        });
    }

    if ignore_eof {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    Ok(())
}
