// ABOUTME: Library side of the convoke CLI: configuration loading and subcommand implementations.
// ABOUTME: The binary in main.rs only parses arguments and dispatches here.

//! # convoke-cli
//!
//! Provides the `convoke` binary:
//!
//! ```text
//! convoke
//! ├── serve                         # Run the router
//! ├── orchestrate                   # Run the workflow orchestrator agent
//! ├── agent                         # Run an echo agent for given capabilities
//! ├── config                        # Print the effective configuration
//! └── version                       # Show version info
//! ```
//!
//! ## Usage
//!
//! ```bash
//! convoke serve --listen 127.0.0.1:7450
//! convoke agent --id lit-1 --type literature --capability review_literature
//! convoke orchestrate --router 127.0.0.1:7450
//! ```

pub mod commands;
pub mod config;

pub use config::Config;

/// Version of the convoke CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
