//! Versioned value encoding.
//!
//! Every persisted value is `FORMAT_VERSION ++ postcard(value)`. Readers
//! refuse any other leading byte instead of misinterpreting it.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::MetaError;

/// Current on-disk format of encoded values.
pub const FORMAT_VERSION: u8 = 1;

/// Encode `value` with postcard, prefixed by [`FORMAT_VERSION`].
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaError> {
    let mut out = vec![FORMAT_VERSION];
    let body = postcard::to_allocvec(value)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a value written by [`encode`]. Any other version byte is rejected
/// with [`MetaError::UnsupportedVersion`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    match bytes.split_first() {
        Some((&FORMAT_VERSION, body)) => Ok(postcard::from_bytes(body)?),
        Some((&found, _)) => Err(MetaError::UnsupportedVersion {
            found,
            expected: FORMAT_VERSION,
        }),
        None => Err(MetaError::Corrupt("empty value".into())),
    }
}
