//! dcrpc Client Library
//!
//! Talks JSON-RPC to a messaging engine running as a child process (or over
//! any byte stream pair). Calls are correlated by id, engine notifications are
//! fanned out to subscribers, and the engine process is supervised.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use dcrpc_client::{connect, EventFilter};
//! use dcrpc_core::ClientConfig;
//!
//! let connection = connect(ClientConfig::default()).await?;
//! let mut events = connection.subscribe_events(EventFilter::all().account(1));
//! let fresh = connection
//!     .call("get_fresh_msg_cnt", vec![1.into(), 42.into()])
//!     .await?;
//! println!("{} fresh messages", fresh);
//! # let _ = events.recv().await;
//! connection.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod correlator;
pub mod error;
pub mod events;
pub mod framer;
pub mod handles;
pub mod state;
pub mod supervisor;

pub use connection::{Connection, EVENT_METHOD};
pub use correlator::{IdAllocator, PendingCall};
pub use error::{Result, RpcError};
pub use events::{EventFilter, EventStream, ListenerError, ListenerResult, SubscriptionId};
pub use framer::FrameError;
pub use handles::{Account, Chat, Contact, Message};
pub use state::{ConnectionState, LossReason};
pub use supervisor::{ProcessExit, Supervisor, SupervisorError};

/// Starts the configured engine and waits until it is ready.
pub async fn connect(config: dcrpc_core::ClientConfig) -> supervisor::Result<Connection> {
    Supervisor::new(config)?.start().await
}
