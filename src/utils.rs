use crate::error::AppError;

use base64::{engine, read};
use std::io::{Cursor, Read};
use tracing::error;

/// Decode a base64 payload (as returned by Google TTS) into `buf`.
pub fn b64_decode_to_buf(enc: &str, buf: &mut Vec<u8>) -> Result<(), AppError> {
    let mut cur = Cursor::new(enc.as_bytes());
    let mut decoder = read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder.read_to_end(buf).map_err(|e| {
        error!(error=%e, "failed to decode base64 payload");
        AppError::Tts(format!("invalid base64 audio: {e}"))
    })?;
    Ok(())
}

/// Base URL for links handed to the telephony provider: the configured one, else the host the
/// webhook arrived on.
pub fn base_url(configured: Option<&str>, host: &str) -> String {
    match configured {
        Some(url) => url.to_string(),
        None => format!("https://{host}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64() {
        let mut buf = Vec::new();
        b64_decode_to_buf("aGVsbG8=", &mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = Vec::new();
        assert!(b64_decode_to_buf("!!not base64!!", &mut buf).is_err());
    }

    #[test]
    fn base_url_prefers_config() {
        assert_eq!(base_url(Some("https://a.example"), "b.example"), "https://a.example");
        assert_eq!(base_url(None, "b.example"), "https://b.example");
    }
}
