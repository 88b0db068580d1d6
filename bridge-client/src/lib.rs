//! Bridge client: owns one outbound connection to the host, correlates
//! requests with responses, queues traffic while disconnected, and reconnects
//! with backoff.

pub mod manager;

pub use manager::{ClientError, ConnectionManager, ConnectionState, ManagerConfig, PendingReply};
