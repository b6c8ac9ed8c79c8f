//! Connection lifecycle: `Starting → Ready → Degraded → Closed`.

use std::fmt;
use tokio::sync::watch;

/// Why a connection stopped carrying calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// The engine closed its output stream.
    StreamClosed,
    /// The engine process exited without being asked to.
    ProcessExited(Option<i32>),
    /// The client shut the connection down.
    Shutdown,
    Io(String),
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::StreamClosed => write!(f, "engine closed the stream"),
            LossReason::ProcessExited(Some(code)) => {
                write!(f, "engine exited with code {}", code)
            }
            LossReason::ProcessExited(None) => write!(f, "engine was terminated by a signal"),
            LossReason::Shutdown => write!(f, "connection shut down"),
            LossReason::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Ready,
    /// New calls are rejected; calls already in flight may still complete.
    Degraded(String),
    /// Terminal.
    Closed(LossReason),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Starting => write!(f, "starting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Degraded(reason) => write!(f, "degraded: {}", reason),
            ConnectionState::Closed(reason) => write!(f, "closed: {}", reason),
        }
    }
}

/// Shared state holder. Transitions only move forward.
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// `Starting → Ready`. Returns false from any other state.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Starting) {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// `Starting | Ready → Degraded`. An earlier degradation keeps its reason.
    pub fn degrade(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.tx.send_if_modified(|state| match state {
            ConnectionState::Starting | ConnectionState::Ready => {
                *state = ConnectionState::Degraded(reason.clone());
                true
            }
            _ => false,
        });
        if changed {
            tracing::warn!("Connection degraded: {}", reason);
        }
        changed
    }

    /// Moves to `Closed`. Returns true only for the first caller.
    pub fn close(&self, reason: LossReason) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = ConnectionState::Closed(reason.clone());
                true
            }
        })
    }
}

/// Waits until the watched state is `Closed` and returns the reason.
pub(crate) async fn wait_closed(mut rx: watch::Receiver<ConnectionState>) -> LossReason {
    match rx.wait_for(ConnectionState::is_closed).await {
        Ok(state) => match &*state {
            ConnectionState::Closed(reason) => reason.clone(),
            _ => LossReason::StreamClosed,
        },
        // The cell is gone, so nothing can carry calls any more.
        Err(_) => LossReason::StreamClosed,
    }
}
