// ABOUTME: Agent connector for convoke: the client half run inside every agent process.
// ABOUTME: Provides reconnect-with-backoff, registration, heartbeats, handler dispatch and delegation.

pub mod backoff;
pub mod connector;
pub mod error;
pub mod handler;
pub mod registration;
pub mod transport;

// Reconnect policy
pub use backoff::{jitter_sample, next_delay, BackoffConfig, ReconnectMachine, ReconnectState};

// Connector
pub use connector::{Connector, ConnectorConfig, ConnectorStatus};

// Error types
pub use error::{ConnectorError, HandlerError, RegistrationError};

// Handlers
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskHandler};

// Registration
pub use registration::{RegistrationConfig, DEFAULT_REGISTRATION_TIMEOUT};

// Transport
pub use transport::{TcpTransport, Transport};

// Re-export protocol types for convenience
pub use convoke_proto;
