// ABOUTME: Central router for convoke: agent registry, liveness tracking and task routing
// ABOUTME: One actor task owns all router state; connections talk to it over a command channel

pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;

pub use config::RouterConfig;
pub use connection::{handle_connection, serve_link};
pub use error::{InvalidTransition, RegistrationError, RouterError, RoutingError};
pub use registry::{
    evaluate_liveness, AgentIdentity, ConnectionId, ConnectionState, Liveness, LivenessChange,
    Registry,
};
pub use router::{Router, RouterCommand, RouterHandle, RouterStats};
pub use server::{run, run_until, serve, shutdown_signal};
