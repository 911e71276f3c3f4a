//! Bundle wire codec — one bundle to and from its byte encoding.
//!
//! Transport framing is not handled here; a convergence layer wraps these
//! bytes however its link requires. Encoding faults are ordinary error
//! values, never panics.

use crate::bundle::Bundle;

/// Hard ceiling on one encoded bundle. A bundle that encodes larger than
/// this never reaches a connection.
pub const MAX_BUNDLE_LEN: usize = 16 * 1024 * 1024;

/// Encode a bundle. Fails if serialization fails or the result exceeds
/// [`MAX_BUNDLE_LEN`].
pub fn encode_bundle(bundle: &Bundle) -> Result<Vec<u8>, WireError> {
    let bytes = bincode::serialize(bundle).map_err(WireError::Encode)?;
    if bytes.len() > MAX_BUNDLE_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decode one bundle from its exact byte encoding.
pub fn decode_bundle(bytes: &[u8]) -> Result<Bundle, WireError> {
    if bytes.len() > MAX_BUNDLE_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(WireError::Decode)
}

/// Errors from the bundle codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bundle encode failed: {0}")]
    Encode(bincode::Error),

    #[error("bundle decode failed: {0}")]
    Decode(bincode::Error),

    #[error("encoded bundle is {0} bytes, over the {MAX_BUNDLE_LEN} byte limit")]
    TooLarge(usize),
}
