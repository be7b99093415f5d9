//! Shared identifier newtypes used across the card module.
//!
//! All identifiers travel as lowercase hex on the wire. Parsing is strict:
//! wrong length or non-hex input is rejected at the boundary so the inner
//! byte arrays are always well-formed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Token name → amount in the token's base unit (millisatoshi for BTC).
///
/// A `BTreeMap` keeps wire serialization deterministic.
pub type TokenAmounts = BTreeMap<String, u64>;

/// Errors produced when parsing identifier newtypes from their wire form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("expected {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid bech32: {0}")]
    Bech32(String),
    #[error("unexpected bech32 prefix: {0}")]
    Bech32Prefix(String),
}

/// A 32-byte x-only public key, hex-encoded on the wire (64 lowercase chars).
///
/// Identifies holders, merchants, the module itself, and every event author
/// on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse either a 64-char hex key or a bech32 `npub1…` key.
    pub fn parse_flexible(s: &str) -> Result<Self, IdParseError> {
        if s.starts_with("npub1") {
            Self::from_npub(s)
        } else {
            s.parse()
        }
    }

    /// Decode a NIP-19 `npub1…` bech32 public key.
    pub fn from_npub(s: &str) -> Result<Self, IdParseError> {
        let (hrp, data) = bech32::decode(s).map_err(|e| IdParseError::Bech32(e.to_string()))?;
        if hrp.as_str() != "npub" {
            return Err(IdParseError::Bech32Prefix(hrp.as_str().to_string()));
        }
        let bytes: [u8; 32] = data.try_into().map_err(|v: Vec<u8>| IdParseError::Length {
            expected: 64,
            actual: v.len() * 2,
        })?;
        Ok(PublicKey(bytes))
    }
}

impl FromStr for PublicKey {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(IdParseError::Length {
                expected: 64,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| IdParseError::Hex(e.to_string()))?;
        Ok(PublicKey(bytes.try_into().expect("length checked")))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The 7-byte NTAG 424 DNA card UID, hex-encoded on the wire (14 chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardId(pub [u8; 7]);

impl CardId {
    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for CardId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 14 {
            return Err(IdParseError::Length {
                expected: 14,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| IdParseError::Hex(e.to_string()))?;
        Ok(CardId(bytes.try_into().expect("length checked")))
    }
}

impl Display for CardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for CardId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CardId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 16-byte AES-128 key, hex-encoded on the wire (32 lowercase chars).
///
/// Used for the module-wide SUN decryption key (`k1`) and the per-card
/// keys `k0`, `k2`, `k3`, `k4`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AesKey(pub [u8; 16]);

impl AesKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Generate a cryptographically random key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        AesKey(bytes)
    }
}

// Keys never appear in logs.
impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AesKey(..)")
    }
}

impl FromStr for AesKey {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(IdParseError::Length {
                expected: 32,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| IdParseError::Hex(e.to_string()))?;
        Ok(AesKey(bytes.try_into().expect("length checked")))
    }
}

impl Serialize for AesKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
