//! Shared types for the dcrpc client: wire protocol, configuration and storage.

pub mod error;
pub mod models;
pub mod protocol;
pub mod storage;

pub use error::{Error, Result};
pub use models::{
    ClientConfig, EngineConfig, FrameFormat, RpcConfig, ACCOUNTS_PATH_ENV, DEFAULT_SERVER,
    SERVER_PATH_ENV,
};
pub use protocol::{ErrorObject, Incoming, Notification, Outcome, Request, Response};
