pub mod config;

pub use config::{
    ClientConfig, EngineConfig, FrameFormat, RpcConfig, ACCOUNTS_PATH_ENV, DEFAULT_SERVER,
    SERVER_PATH_ENV,
};
