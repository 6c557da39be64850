// src/hash.rs

//! Content fingerprints for APKs, dex segments and helper binaries
//!
//! A fingerprint is a hash value tagged with the algorithm that produced it.
//! Fingerprints are stored and compared in prefixed form
//! (`sha256:<hex>`), so a cache written with one algorithm never matches a
//! fingerprint computed with another.
//!
//! | Use | Algorithm |
//! |-----|-----------|
//! | APK and dex segment identity (default) | SHA-256 |
//! | Local-only fast fingerprinting (opt-in) | XXH128 |

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HashAlgorithm {
    /// SHA-256, the fingerprint recorded for every cached artifact
    #[default]
    Sha256,

    /// XXH128, non-cryptographic and much faster on large APKs
    Xxh128,
}

impl HashAlgorithm {
    /// Hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Xxh128 => 16,
        }
    }

    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Prefix used in stored fingerprints
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(FingerprintError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Fingerprint parse errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("fingerprint is missing its algorithm prefix: {0}")]
    MissingPrefix(String),

    #[error("invalid fingerprint length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid hex in fingerprint: {0}")]
    InvalidHex(String),
}

/// A content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    algorithm: HashAlgorithm,
    value: String,
}

impl Fingerprint {
    /// Create a fingerprint from a hex digest, validating its shape
    pub fn new(
        algorithm: HashAlgorithm,
        value: impl Into<String>,
    ) -> Result<Self, FingerprintError> {
        let value = value.into();
        let expected = algorithm.hex_len();

        if value.len() != expected {
            return Err(FingerprintError::InvalidLength {
                expected,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidHex(value));
        }

        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    /// Parse a stored fingerprint such as `sha256:abc...`
    ///
    /// Unlike free-form hash strings, stored fingerprints always carry their
    /// prefix; a bare digest is rejected.
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| FingerprintError::MissingPrefix(s.to_string()))?;
        Self::new(algo.parse()?, hex)
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hex digest without the prefix
    #[inline]
    pub fn hex(&self) -> &str {
        &self.value
    }

    /// Leading hex digits, used for helper version tags and log lines
    pub fn short(&self, digits: usize) -> &str {
        &self.value[..digits.min(self.value.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.value)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Incremental hasher over either algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Xxh128(Box<Xxh3>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Box::new(Xxh3::new())),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Fingerprint {
        let value = match self.state {
            HasherState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            HasherState::Xxh128(hasher) => format!("{:032x}", hasher.digest128()),
        };
        Fingerprint {
            algorithm: self.algorithm,
            value,
        }
    }
}

/// Fingerprint a byte slice
pub fn fingerprint_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Fingerprint {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Fingerprint everything a reader yields
pub fn fingerprint_reader<R: Read>(
    algorithm: HashAlgorithm,
    reader: &mut R,
) -> io::Result<Fingerprint> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Fingerprint a file without loading it into memory
pub fn fingerprint_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    fingerprint_reader(algorithm, &mut file)
}

/// SHA-256 fingerprint of a byte slice
#[inline]
pub fn sha256(data: &[u8]) -> Fingerprint {
    fingerprint_bytes(HashAlgorithm::Sha256, data)
}
