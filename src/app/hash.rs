//! Content address for stored page images
//!
//! Page files are named after the MD5 digest of their bytes so a page can be
//! re-verified without a network round trip. The digest is kept as a 16-byte
//! array and rendered as lowercase hex for file names and the record index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};

/// MD5 digest of a page image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Md5Hash([u8; 16]);

impl Md5Hash {
    /// Digest of the given bytes
    pub fn compute(bytes: &[u8]) -> Self {
        Md5Hash(md5::compute(bytes).0)
    }

    /// Parse a 32-character hex string (case insensitive)
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use chapter_fetcher::app::Md5Hash;
    ///
    /// let hash = Md5Hash::from_hex("50c9d1c465f3cbff652be1509c2e2a4e")?;
    /// assert_eq!(hash, Md5Hash::from_hex("50C9D1C465F3CBFF652BE1509C2E2A4E")?);
    /// # Ok::<(), chapter_fetcher::errors::StorageError>(())
    /// ```
    pub fn from_hex(hex: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidHash {
            hash: hex.to_string(),
        };

        if hex.len() != 32 || !hex.is_ascii() {
            return Err(invalid());
        }

        let mut bytes = [0u8; 16];
        for (slot, pair) in bytes.iter_mut().zip(hex.as_bytes().chunks(2)) {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
            *slot = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }

        Ok(Md5Hash(bytes))
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Whether `bytes` hash to this digest
    pub fn matches(&self, bytes: &[u8]) -> bool {
        Self::compute(bytes) == *self
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Md5Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Md5Hash {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Md5Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Md5Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Md5Hash::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
