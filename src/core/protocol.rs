use serde::{Deserialize, Serialize};

use crate::core::backend::BackendError;
use crate::core::state::CardRecord;

/// Body of `GET /api/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn online() -> Self {
        Self {
            status: "online".to_string(),
        }
    }
}

/// Card payload inside a successful read response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardData {
    pub atr: String,
    pub reader: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Body of `GET /api/card/read`, as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCardResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CardData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A read response that passed shape validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply {
    Card(CardRecord),
    Refused(String),
}

impl ReadCardResponse {
    pub fn card(card: &CardRecord) -> Self {
        Self {
            success: true,
            data: Some(CardData {
                atr: card.atr.clone(),
                reader: card.reader.clone(),
                status: Some("connected".to_string()),
            }),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Decode a raw body and validate its shape
    pub fn parse(body: &str) -> Result<ReadReply, BackendError> {
        let response: ReadCardResponse = serde_json::from_str(body)
            .map_err(|e| BackendError::Malformed(format!("invalid JSON body: {e}")))?;
        response.into_reply()
    }

    /// `success = true` must carry `data`, `success = false` must carry `error`
    pub fn into_reply(self) -> Result<ReadReply, BackendError> {
        match self {
            ReadCardResponse {
                success: true,
                data: Some(data),
                ..
            } => Ok(ReadReply::Card(CardRecord::new(data.atr, data.reader))),
            ReadCardResponse {
                success: false,
                error: Some(error),
                ..
            } => Ok(ReadReply::Refused(error)),
            ReadCardResponse { success: true, .. } => Err(BackendError::Malformed(
                "success response without card data".to_string(),
            )),
            ReadCardResponse { success: false, .. } => Err(BackendError::Malformed(
                "failure response without error message".to_string(),
            )),
        }
    }
}
