use anyhow::{bail, Context, Result};

/// Parse ATR text into bytes.
/// Accepts the forms readers and services commonly print:
/// - "3B6500009C" (compact)
/// - "3B 65 00 00 9C" (space-separated, as PC/SC tools print it)
/// - "3B:65:00:00:9C" or "0x3B,0x65" (separators and prefixes)
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = clean_hex_string(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        bail!("Hex string must have an even number of digits: '{hex_str}'");
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

/// Strip separators and 0x prefixes, uppercase the rest
fn clean_hex_string(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ' ' | ',' | ':' | '-' | '\t' | '\n' | '\r'))
        .collect::<String>()
        .to_uppercase()
}

/// Format bytes the way PC/SC tools print an ATR: "3B 65 00"
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Re-render ATR text in spaced form, leaving undecodable text untouched
pub fn display_atr(atr: &str) -> String {
    match parse_hex(atr) {
        Ok(bytes) if !bytes.is_empty() => format_hex_spaced(&bytes),
        _ => atr.trim().to_string(),
    }
}
