//! Content hashing for transferred files.
//!
//! The receiver feeds every chunk through a [`StreamingHasher`] as it is
//! written, so verification at the end never re-reads the file. The sender
//! hashes its source once up front with [`hash_file`].

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read buffer used when hashing files from disk.
const HASH_READ_BUFFER: usize = 64 * 1024;

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Length of the digest in bytes.
    pub const LEN: usize = 32;

    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, used as the stable file identity.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hashes an in-memory buffer in one go.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = StreamingHasher::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:.16})", self.to_hex())
    }
}

/// Incremental hash context, updated as bytes are written.
#[derive(Clone, Default, Debug)]
pub struct StreamingHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    #[inline]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// Compares two digests.
#[inline]
pub fn compare(a: &ContentHash, b: &ContentHash) -> bool {
    a == b
}

/// Hashes a whole file from disk.
pub async fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let file = File::open(path).await?;
    let hasher = hash_reader(file, u64::MAX).await?;
    Ok(hasher.finalize())
}

/// Hashes the first `limit` bytes of a file, returning the open context.
///
/// Used when resuming a partial download: the receiver seeds its context with
/// the prefix already on disk and continues with incoming chunks.
pub async fn hash_prefix(path: &Path, limit: u64) -> std::io::Result<StreamingHasher> {
    let file = File::open(path).await?;
    let hasher = hash_reader(file, limit).await?;
    if hasher.bytes_hashed() < limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "partial file holds {} bytes, expected at least {}",
                hasher.bytes_hashed(),
                limit
            ),
        ));
    }
    Ok(hasher)
}

async fn hash_reader(mut file: File, limit: u64) -> std::io::Result<StreamingHasher> {
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_READ_BUFFER];
    let mut remaining = limit;

    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = file.read(&mut buffer[..want]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }

    Ok(hasher)
}
