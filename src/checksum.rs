use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AtomsError;

pub const HASH_LENGTH: usize = 12;
const CHUNK_SIZE: usize = 64 * 1024;

/// A truncated SHA-256 content digest: exactly 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let is_valid = normalized.len() == HASH_LENGTH
            && normalized.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(format!(
                "invalid content hash {value:?}: expected {HASH_LENGTH} hex characters"
            ));
        }
        Ok(Self(normalized))
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn digest(path: &Path) -> Result<ContentHash, AtomsError> {
    let mut file = File::open(path)
        .map_err(|err| AtomsError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| AtomsError::Filesystem(format!("read {}: {err}", path.display())))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(HASH_LENGTH);
    Ok(ContentHash(encoded))
}

pub fn matches(path: &Path, expected: &ContentHash) -> Result<bool, AtomsError> {
    Ok(digest(path)? == *expected)
}
