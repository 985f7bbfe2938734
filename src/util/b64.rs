use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::de::DeserializeOwned;

/// Errors produced when decoding a base64 header payload.
#[derive(Debug, thiserror::Error)]
pub enum HeaderPayloadError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode raw bytes as a base64 string suitable for an HTTP header value.
pub fn encode_header<T: AsRef<[u8]>>(input: T) -> String {
    b64.encode(input.as_ref())
}

/// Decode a base64 header value back into raw bytes.
pub fn decode_header(input: &str) -> Result<Vec<u8>, HeaderPayloadError> {
    Ok(b64.decode(input.trim())?)
}

/// Decode a base64 header value that carries a JSON document.
///
/// Used for the `X-Mandate` and `X-Payment` request headers, whose payloads
/// ride base64-encoded to survive header value restrictions.
pub fn decode_json_header<T: DeserializeOwned>(input: &str) -> Result<T, HeaderPayloadError> {
    let bytes = decode_header(input)?;
    Ok(serde_json::from_slice(&bytes)?)
}
