/// IC card reader client
///
/// Monitors the liveness of a card reader backend and drives single-flight
/// card reads against it, with a desktop window, a CLI, and a bundled
/// PC/SC reader service.
pub mod cli;
pub mod core;
pub mod gui;
pub mod server;

// Re-export commonly used types
pub use crate::core::{
    backend::{BackendError, HttpBackend, ReaderBackend},
    config::ClientConfig,
    controller::CardReadController,
    health::{HealthMonitor, HealthReport},
    protocol::{ReadCardResponse, ReadReply},
    reader::{CardSource, CardSourceError},
    state::{CardRecord, ConnectionStatus, ErrorKind, OperationError, OperationState, StatusSnapshot},
    utils::{format_hex_spaced, parse_hex},
};

// Common error type
pub type Result<T> = anyhow::Result<T>;
