//! Failure values returned to callers.

use dcrpc_core::ErrorObject;
use serde_json::Value;
use thiserror::Error;

use crate::state::{ConnectionState, LossReason};

/// Outcome of a failed call.
///
/// Remote errors and transport loss reach exactly the callers they concern.
/// Nothing here is retried automatically.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The connection was not `Ready`; nothing was sent.
    #[error("Connection not ready ({0})")]
    NotReady(ConnectionState),

    /// The engine answered with an error payload.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The connection closed while the call was outstanding.
    #[error("Transport lost: {0}")]
    TransportLost(LossReason),

    /// The request could not be written.
    #[error("Failed to send request: {0}")]
    Send(String),

    /// The engine's response broke the wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Call cancelled")]
    Cancelled,

    /// The result did not have the expected shape.
    #[error("Failed to decode result: {0}")]
    Decode(String),
}

impl RpcError {
    /// Remote error code, if the engine produced this failure.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_transport_lost(&self) -> bool {
        matches!(self, RpcError::TransportLost(_))
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
