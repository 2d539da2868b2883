use pcsc::{Context, Disposition, Protocols, Scope, ShareMode};
use std::ffi::CString;
use std::sync::Mutex;
use thiserror::Error;

use crate::core::state::CardRecord;
use crate::core::utils::format_hex_spaced;

/// Why the reader service could not produce a card record
#[derive(Debug, Error)]
pub enum CardSourceError {
    #[error("PC/SC service unavailable: {0}")]
    Unavailable(String),

    #[error("no card reader found")]
    NoReader,

    #[error("reader not found: {0}")]
    UnknownReader(String),

    #[error("no card present")]
    NoCard,

    #[error("card connection failed: {0}")]
    Connection(String),
}

impl CardSourceError {
    /// HTTP status the reader service answers with
    pub fn http_status(&self) -> u16 {
        match self {
            CardSourceError::NoReader | CardSourceError::UnknownReader(_) => 404,
            CardSourceError::NoCard => 400,
            CardSourceError::Unavailable(_) | CardSourceError::Connection(_) => 500,
        }
    }

    /// Message shown to the end user by the client
    pub fn user_message(&self) -> String {
        match self {
            CardSourceError::NoReader => {
                "Hardware error: no card reader found. Check the USB connection and the reader driver."
                    .to_string()
            }
            CardSourceError::UnknownReader(name) => format!("Card reader not found: {name}"),
            CardSourceError::NoCard => {
                "No card detected in the reader. Make sure the card is fully inserted.".to_string()
            }
            CardSourceError::Connection(_) => {
                "Card connection failed. The chip may have poor contact, please reinsert the card."
                    .to_string()
            }
            CardSourceError::Unavailable(e) => format!("System error: {e}"),
        }
    }
}

/// Hardware side of the reader service
pub trait CardSource: Send + Sync {
    /// Names of the attached readers
    fn list_readers(&self) -> Result<Vec<String>, CardSourceError>;

    /// Power up the card in `reader` (or the first reader) and return its ATR
    fn read_card(&self, reader: Option<&str>) -> Result<CardRecord, CardSourceError>;
}

/// `CardSource` backed by the system PC/SC stack.
///
/// The context is opened on first use, so the service can come up before
/// the PC/SC daemon does.
#[derive(Default)]
pub struct PcscCardSource {
    context: Mutex<Option<Context>>,
}

impl PcscCardSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current context, established on demand and again if the PC/SC service restarted
    fn context(&self) -> Result<Context, CardSourceError> {
        let mut slot = self
            .context
            .lock()
            .map_err(|_| CardSourceError::Unavailable("PC/SC context lock poisoned".to_string()))?;

        if let Some(context) = slot.as_ref() {
            if context.is_valid().is_ok() {
                return Ok(context.clone());
            }
            log::warn!("PC/SC context invalid, re-establishing");
        }

        let context = establish()?;
        *slot = Some(context.clone());
        Ok(context)
    }
}

fn establish() -> Result<Context, CardSourceError> {
    Context::establish(Scope::User).map_err(|e| CardSourceError::Unavailable(e.to_string()))
}

impl CardSource for PcscCardSource {
    fn list_readers(&self) -> Result<Vec<String>, CardSourceError> {
        let context = self.context()?;
        let mut readers_buf = vec![0; 2048];
        let readers = match context.list_readers(&mut readers_buf) {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(CardSourceError::Unavailable(e.to_string())),
        };

        Ok(readers
            .map(|name| name.to_string_lossy().to_string())
            .collect())
    }

    fn read_card(&self, reader: Option<&str>) -> Result<CardRecord, CardSourceError> {
        let readers = self.list_readers()?;
        log::info!("Detected readers: {readers:?}");

        let reader_name = match reader {
            Some(wanted) => readers
                .into_iter()
                .find(|name| name == wanted)
                .ok_or_else(|| CardSourceError::UnknownReader(wanted.to_string()))?,
            None => readers.into_iter().next().ok_or(CardSourceError::NoReader)?,
        };

        log::info!("Connecting to reader: {reader_name}");
        let reader_cstr = CString::new(reader_name.as_str())
            .map_err(|_| CardSourceError::UnknownReader(reader_name.clone()))?;

        let card = self
            .context()?
            .connect(&reader_cstr, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| match e {
                pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => CardSourceError::NoCard,
                other => CardSourceError::Connection(other.to_string()),
            })?;

        let status = card
            .status2_owned()
            .map_err(|e| CardSourceError::Connection(e.to_string()))?;
        let atr = format_hex_spaced(status.atr());
        log::info!("Read card ATR: {atr}");

        if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
            log::warn!("Failed to disconnect cleanly from card: {e}");
        }

        Ok(CardRecord::new(atr, reader_name))
    }
}
