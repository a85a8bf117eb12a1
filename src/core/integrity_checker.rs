//! File Integrity Checker Module
//!
//! Digest computation and verification for cached artifacts. Digests are
//! written as tagged strings (`"sha256:<hex>"`) in catalog metadata; a version
//! token in that shape doubles as the expected digest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::task;
use tracing::{debug, info, warn};

// Hash algorithm imports from RustCrypto
use blake2::Blake2b512;
use digest::{Digest, DynDigest};
use md5::Md5;
use sha2::{Sha256, Sha512};

use crate::core::error_handling::{errors, FetchError};
use crate::core::models::RemoteItem;

/// Supported hash algorithms for artifact verification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// SHA-256 (Recommended - secure and widely used)
    Sha256,
    /// SHA-512 (Recommended - highest security)
    Sha512,
    /// BLAKE2b-512 (Recommended - fastest secure hash)
    Blake2b512,
    /// MD5 (Legacy - S3-style ETags)
    Md5,
}

impl HashAlgorithm {
    /// Get the name of the hash algorithm
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha512 => "SHA-512",
            HashAlgorithm::Blake2b512 => "BLAKE2b-512",
            HashAlgorithm::Md5 => "MD5",
        }
    }

    /// Prefix used in tagged digests
    pub fn tag(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake2b512 => "blake2b",
            HashAlgorithm::Md5 => "md5",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Some(HashAlgorithm::Sha512),
            "blake2b" | "blake2b512" | "blake2b-512" => Some(HashAlgorithm::Blake2b512),
            "md5" => Some(HashAlgorithm::Md5),
            _ => None,
        }
    }

    /// Get the expected output length in bytes
    pub fn output_length(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
            HashAlgorithm::Blake2b512 => 64,
            HashAlgorithm::Md5 => 16,
        }
    }

    /// Create a new hasher instance
    pub fn create_hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Sha256 => Box::new(Sha256::new()),
            HashAlgorithm::Sha512 => Box::new(Sha512::new()),
            HashAlgorithm::Blake2b512 => Box::new(Blake2b512::new()),
            HashAlgorithm::Md5 => Box::new(Md5::new()),
        }
    }

    /// Guess the algorithm of an untagged hex digest from its length
    pub fn detect_algorithm_from_hash(hash: &str) -> Option<HashAlgorithm> {
        if !is_valid_hex(hash) {
            return None;
        }
        match hash.len() {
            32 => Some(HashAlgorithm::Md5),
            64 => Some(HashAlgorithm::Sha256),
            128 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

fn is_valid_hex(hash: &str) -> bool {
    !hash.is_empty() && hash.len() % 2 == 0 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

/// A digest the artifact must match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex
    pub hex: String,
}

impl ExpectedDigest {
    /// Parse `"<algo>:<hex>"`. Anything else is not a digest.
    pub fn parse_tagged(value: &str) -> Option<Self> {
        let (tag, hex) = value.split_once(':')?;
        let algorithm = HashAlgorithm::from_tag(tag)?;
        let hex = hex.trim().to_ascii_lowercase();

        if !is_valid_hex(&hex) || hex.len() != algorithm.output_length() * 2 {
            return None;
        }

        Some(Self { algorithm, hex })
    }

    /// Like `parse_tagged`, but also accepts a bare hex digest (e.g. an ETag)
    pub fn parse_lenient(value: &str) -> Option<Self> {
        let trimmed = value.trim().trim_matches('"');
        Self::parse_tagged(trimmed).or_else(|| {
            HashAlgorithm::detect_algorithm_from_hash(trimmed).map(|algorithm| Self {
                algorithm,
                hex: trimmed.to_ascii_lowercase(),
            })
        })
    }

    pub fn matches(&self, computed_hex: &str) -> bool {
        self.hex.eq_ignore_ascii_case(computed_hex)
    }
}

impl fmt::Display for ExpectedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.tag(), self.hex)
    }
}

/// What a finished transfer is checked against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expectation {
    pub size: Option<u64>,
    pub digest: Option<ExpectedDigest>,
}

impl Expectation {
    /// Size from the catalog; digest from the explicit checksum, otherwise
    /// from the version token when it is itself a tagged digest.
    ///
    /// A declared checksum that cannot be understood is an error: the
    /// artifact could never be verified against it.
    pub fn for_item(item: &RemoteItem) -> Result<Self, FetchError> {
        let digest = match item.checksum.as_deref() {
            Some(declared) => Some(ExpectedDigest::parse_lenient(declared).ok_or_else(|| {
                errors::checksum_mismatch(declared, "unsupported or malformed checksum")
            })?),
            None => ExpectedDigest::parse_tagged(&item.remote_version),
        };

        Ok(Self {
            size: item.expected_size,
            digest,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.digest.is_none()
    }
}

/// Incremental digest fed while bytes stream to disk
pub struct StreamingDigest {
    algorithm: HashAlgorithm,
    hasher: Box<dyn DynDigest + Send>,
}

impl StreamingDigest {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            hasher: algorithm.create_hasher(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Tagged digest of everything fed so far
    pub fn finalize(self) -> ExpectedDigest {
        ExpectedDigest {
            algorithm: self.algorithm,
            hex: hex::encode(self.hasher.finalize()),
        }
    }
}

impl fmt::Debug for StreamingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingDigest")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Verifies files already on disk
#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    /// Buffer size for reading files (default: 64KB)
    buffer_size: usize,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityChecker {
    pub fn new() -> Self {
        Self {
            buffer_size: 64 * 1024,
        }
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1024),
        }
    }

    /// Compute the hex digest of a file on a blocking worker
    pub async fn compute_hash(
        &self,
        file_path: &Path,
        algorithm: HashAlgorithm,
    ) -> std::io::Result<String> {
        let path: PathBuf = file_path.to_path_buf();
        let buffer_size = self.buffer_size;
        let started = Instant::now();

        let hex = task::spawn_blocking(move || -> std::io::Result<String> {
            let file = File::open(&path)?;
            let mut reader = BufReader::with_capacity(buffer_size, file);
            let mut hasher = algorithm.create_hasher();
            let mut buffer = vec![0u8; buffer_size];

            loop {
                let read = reader.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }

            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        debug!(
            "Computed {} of {} in {:?}",
            algorithm.name(),
            file_path.display(),
            started.elapsed()
        );
        Ok(hex)
    }

    /// Check a file against an expectation; returns its size on success
    pub async fn verify_file(
        &self,
        file_path: &Path,
        expectation: &Expectation,
    ) -> Result<u64, FetchError> {
        let size = tokio::fs::metadata(file_path).await?.len();

        if let Some(expected) = expectation.size {
            if expected != size {
                warn!(
                    "❌ Size check failed for {}: expected {} bytes, found {}",
                    file_path.display(),
                    expected,
                    size
                );
                return Err(errors::checksum_mismatch(
                    format!("{} bytes", expected),
                    format!("{} bytes", size),
                ));
            }
        }

        if let Some(digest) = &expectation.digest {
            let computed = self.compute_hash(file_path, digest.algorithm).await?;
            if !digest.matches(&computed) {
                warn!(
                    "❌ File integrity check failed: {} ({})",
                    file_path.display(),
                    digest.algorithm.name()
                );
                return Err(errors::checksum_mismatch(
                    digest.to_string(),
                    format!("{}:{}", digest.algorithm.tag(), computed),
                ));
            }
            info!(
                "✅ File integrity verified: {} ({})",
                file_path.display(),
                digest.algorithm.name()
            );
        }

        Ok(size)
    }
}
