//! xenstore-client - an async client for the XenStore wire protocol
//!
//! One connection to `xenstored` (Unix socket or XenBus device) is shared by
//! any number of concurrent requests, transactions and watch monitors. A
//! single reader task demultiplexes replies and watch events.

pub mod client;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod router;
pub mod transaction;
pub mod transport;
pub mod validate;

pub use client::{Client, Node};
pub use error::{Result, WireError, XsError};
pub use monitor::Monitor;
pub use protocol::{Event, MAX_PAYLOAD, Operation, Packet};
pub use router::Router;
pub use transaction::{Transaction, TransactionState};
pub use transport::{Transport, TransportConfig, TransportKind, UnixSocketTransport, XenBusTransport};
