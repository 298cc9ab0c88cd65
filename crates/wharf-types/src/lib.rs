//! Shared types and identifiers for Wharf.
//!
//! This crate defines the core types used across the Wharf workspace:
//! identifiers ([`PieceCid`], [`PayloadCid`], [`BlockHash`], [`PeerId`],
//! [`Address`], [`ProposalCid`]), shard bookkeeping ([`ShardKey`],
//! [`ShardRecord`], [`ShardState`], [`BlockLocation`]), token accounting
//! ([`TokenAmount`]) and the retrieval-market records in [`retrieval`].

use std::fmt;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod events;
pub mod retrieval;

pub use retrieval::*;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when parsing a hex-encoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),
    #[error("invalid hex character {0:?}")]
    InvalidHex(char),
}

fn parse_hex32(s: &str) -> Result<[u8; 32], IdParseError> {
    let s = s.trim();
    if s.len() != 64 {
        return Err(IdParseError::Length(s.len()));
    }
    let mut out = [0u8; 32];
    let raw = s.as_bytes();
    for (i, byte) in out.iter_mut().enumerate() {
        let hi = hex_nibble(raw[i * 2])?;
        let lo = hex_nibble(raw[i * 2 + 1])?;
        *byte = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_nibble(c: u8) -> Result<u8, IdParseError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(IdParseError::InvalidHex(c as char)),
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Wrap raw bytes without hashing.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex32(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Content identifier of a sealed piece: `blake3(piece_bytes)`.
    PieceCid
);

define_id!(
    /// Root content identifier of a retrievable payload DAG.
    PayloadCid
);

define_id!(
    /// Multihash of a single block inside a piece: `blake3(block_bytes)`.
    BlockHash
);

define_id!(
    /// Network identity of a remote peer.
    PeerId
);

define_id!(
    /// Wallet or payment-channel address on chain.
    Address
);

define_id!(
    /// Identifier of a storage deal proposal.
    ProposalCid
);

// ---------------------------------------------------------------------------
// Shard bookkeeping
// ---------------------------------------------------------------------------

/// Key of a shard in the dagstore: the piece CID rendered as hex.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardKey(String);

impl ShardKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The hex string form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the key back into the piece it was derived from.
    pub fn piece_cid(&self) -> Result<PieceCid, IdParseError> {
        self.0.parse()
    }
}

impl From<PieceCid> for ShardKey {
    fn from(piece: PieceCid) -> Self {
        Self(piece.to_string())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardKey({})", self.0)
    }
}

/// Lifecycle state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// Registered lazily; nothing fetched or indexed yet.
    New,
    /// Fetch and index in progress.
    Initializing,
    /// Indexed and ready to be acquired.
    Available,
    /// At least one accessor is currently open.
    Serving,
    /// Last operation failed; see [`ShardRecord::last_error`].
    Errored,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Initializing => "initializing",
            Self::Available => "available",
            Self::Serving => "serving",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Persisted record of a registered shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub key: ShardKey,
    /// Opaque locator understood by the mount registry (`scheme://...`).
    pub source_url: String,
    /// Local copy of the shard data, if one has been fetched.
    pub transient_path: Option<String>,
    pub state: ShardState,
    /// Lazy shards are fetched on first acquire rather than at registration.
    pub lazy: bool,
    /// Present only when `state == Errored`.
    pub last_error: Option<String>,
}

impl ShardRecord {
    /// A freshly registered shard in [`ShardState::New`].
    pub fn new(key: ShardKey, source_url: String, lazy: bool) -> Self {
        Self {
            key,
            source_url,
            transient_path: None,
            state: ShardState::New,
            lazy,
            last_error: None,
        }
    }

    /// Move the record into `Errored`. An empty message is replaced so the
    /// record always carries a reason.
    pub fn set_errored(&mut self, error: impl Into<String>) {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        self.state = ShardState::Errored;
        self.last_error = Some(error);
    }

    /// Move the record into a non-error state, clearing any previous error.
    pub fn set_state(&mut self, state: ShardState) {
        debug_assert_ne!(state, ShardState::Errored, "use set_errored");
        self.state = state;
        self.last_error = None;
    }
}

/// Location of one block inside a shard's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub hash: BlockHash,
    /// Byte offset of the block from the start of the shard data.
    pub offset: u64,
    pub len: u32,
}

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

/// An amount of the payment token in its smallest unit.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtract, stopping at zero.
    pub fn saturating_sub(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_sub(other.0))
    }

    /// Multiply by a byte count, capping at the maximum amount.
    pub fn saturating_mul(self, factor: u64) -> TokenAmount {
        TokenAmount(self.0.saturating_mul(u128::from(factor)))
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl Add for TokenAmount {
    type Output = TokenAmount;

    fn add(self, rhs: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TokenAmount {
    fn add_assign(&mut self, rhs: TokenAmount) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Mul<u64> for TokenAmount {
    type Output = TokenAmount;

    fn mul(self, rhs: u64) -> TokenAmount {
        self.saturating_mul(rhs)
    }
}

impl FromStr for TokenAmount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Self)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenAmount({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_cid_from_data_deterministic() {
        let a = PieceCid::from_data(b"piece bytes");
        let b = PieceCid::from_data(b"piece bytes");
        assert_eq!(a, b, "same data must produce same PieceCid");
        assert_ne!(a, PieceCid::from_data(b"other bytes"));
    }

    #[test]
    fn test_display_outputs_hex() {
        let bytes = [
            0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f, 0x60, 0x71, 0x82, 0x93, 0xa4, 0xb5, 0xc6, 0xd7,
            0xe8, 0xf9, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb,
            0xcc, 0xdd, 0xee, 0xff,
        ];
        let id = BlockHash::from(bytes);
        assert_eq!(
            id.to_string(),
            "0a1b2c3d4e5f60718293a4b5c6d7e8f900112233445566778899aabbccddeeff"
        );
    }

    #[test]
    fn test_id_parse_display_inverse() {
        let id = PayloadCid::from_data(b"payload");
        let parsed: PayloadCid = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let upper: PayloadCid = id.to_string().to_uppercase().parse().unwrap();
        assert_eq!(id, upper);
    }

    #[test]
    fn test_id_parse_rejects_bad_input() {
        assert_eq!("abcd".parse::<PieceCid>(), Err(IdParseError::Length(4)));
        let bad = "g".repeat(64);
        assert_eq!(bad.parse::<PieceCid>(), Err(IdParseError::InvalidHex('g')));
    }

    #[test]
    fn test_debug_format() {
        let id = PeerId::from([0u8; 32]);
        let debug = format!("{id:?}");
        assert!(debug.starts_with("PeerId("));
        assert!(debug.ends_with(')'));
    }

    #[test]
    fn test_shard_key_from_piece() {
        let piece = PieceCid::from_data(b"p1");
        let key = ShardKey::from(piece);
        assert_eq!(key.as_str(), piece.to_string());
        assert_eq!(key.piece_cid().unwrap(), piece);
        assert!(ShardKey::new("not-a-piece").piece_cid().is_err());
    }

    #[test]
    fn test_shard_record_errored_always_has_message() {
        let mut rec = ShardRecord::new(ShardKey::new("k"), "market://k".into(), true);
        assert_eq!(rec.state, ShardState::New);
        assert!(rec.last_error.is_none());

        rec.set_errored("");
        assert_eq!(rec.state, ShardState::Errored);
        assert_eq!(rec.last_error.as_deref(), Some("unknown error"));

        rec.set_state(ShardState::Available);
        assert!(rec.last_error.is_none());
    }

    #[test]
    fn test_token_amount_arithmetic() {
        let a = TokenAmount::from(700u64);
        let b = TokenAmount::from(200u64);
        assert_eq!((a + b).value(), 900);
        assert_eq!(b.saturating_sub(a), TokenAmount::ZERO);
        assert_eq!((b * 3).value(), 600);
        assert!(TokenAmount::ZERO.is_zero());
        assert_eq!("42".parse::<TokenAmount>().unwrap().value(), 42);
    }

    #[test]
    fn test_shard_record_roundtrip_postcard() {
        let mut rec = ShardRecord::new(
            ShardKey::from(PieceCid::from_data(b"p")),
            "market://p".into(),
            false,
        );
        rec.transient_path = Some("/tmp/x".into());
        let encoded = postcard::to_allocvec(&rec).unwrap();
        let decoded: ShardRecord = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(rec, decoded);
    }
}
