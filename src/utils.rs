//! Utility functions for identifiers, hashing and serialization

use bech32::Bech32m;
use uuid7::uuid7;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("cbor codec: {0}")]
pub struct CodecError(pub String);

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn to_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, CodecError> {
    minicbor::to_vec(value).map_err(|e| CodecError(e.to_string()))
}

pub fn from_cbor<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| CodecError(e.to_string()))
}

/// Encode and hash in one go, the hash is hex sha256 of the cbor bytes.
pub fn cbor_with_hash<T: minicbor::Encode<()>>(value: &T) -> Result<(String, Vec<u8>), CodecError> {
    let cbor = to_cbor(value)?;
    let hash = sha256::digest(cbor.as_slice());
    Ok((hash, cbor))
}

/// Link a payload onto a hash chain: `sha256(prev || payload)`.
pub fn chain_hash(prev: Option<&str>, payload: &[u8]) -> String {
    let mut buf = Vec::with_capacity(64 + payload.len());
    if let Some(prev) = prev {
        buf.extend_from_slice(prev.as_bytes());
    }
    buf.extend_from_slice(payload);
    sha256::digest(buf)
}
