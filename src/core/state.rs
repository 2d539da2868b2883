use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::utils::parse_hex;

/// Message shown when the read request never got a usable answer.
pub const TRANSPORT_FAILURE_MESSAGE: &str =
    "Unable to reach the card reader service. Make sure the reader backend is running.";

/// Reachability of the reader backend as seen by the last completed probe
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Online,
    #[default]
    Offline,
}

impl ConnectionStatus {
    pub fn is_online(self) -> bool {
        self == ConnectionStatus::Online
    }
}

impl From<bool> for ConnectionStatus {
    fn from(online: bool) -> Self {
        if online {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Online => write!(f, "online"),
            ConnectionStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Card identification returned by a successful read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Answer-To-Reset as hex text, e.g. "3B 65 00 00 9C 11 01 01 03"
    pub atr: String,
    /// Name of the reader device the card sits in
    pub reader: String,
}

impl CardRecord {
    pub fn new(atr: impl Into<String>, reader: impl Into<String>) -> Self {
        Self {
            atr: atr.into(),
            reader: reader.into(),
        }
    }

    /// Decode the ATR text into raw bytes
    pub fn atr_bytes(&self) -> anyhow::Result<Vec<u8>> {
        parse_hex(&self.atr)
    }
}

/// Distinguishes "the backend understood and refused" from "the backend was unreachable"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    BackendReported,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::BackendReported => write!(f, "backend"),
            ErrorKind::Transport => write!(f, "transport"),
        }
    }
}

/// User-facing failure of the last read attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    /// Failure reported by the backend; the message is kept verbatim
    pub fn backend(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::BackendReported,
            message: message.into(),
        }
    }

    /// Failure to get any usable answer; always carries the fixed message
    pub fn transport() -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: TRANSPORT_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// State of the card read operation.
///
/// The result payloads live inside the variants, so a card record and an
/// error can never be held at the same time.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    #[default]
    Idle,
    Reading,
    Success(CardRecord),
    Error(OperationError),
}

impl OperationState {
    pub fn is_reading(&self) -> bool {
        matches!(self, OperationState::Reading)
    }

    pub fn card(&self) -> Option<&CardRecord> {
        match self {
            OperationState::Success(card) => Some(card),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match self {
            OperationState::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::Reading => "reading",
            OperationState::Success(_) => "success",
            OperationState::Error(_) => "error",
        }
    }
}

/// Read-only view handed to the rendering layer after every transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionStatus,
    pub operation: OperationState,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn card(&self) -> Option<&CardRecord> {
        self.operation.card()
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.operation.error()
    }

    /// Whether the read trigger should be offered to the user
    pub fn can_trigger(&self) -> bool {
        self.connection.is_online() && !self.operation.is_reading()
    }
}
