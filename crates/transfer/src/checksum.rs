use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::codec::Chunk;
use crate::error::TransferError;
use crate::io::{ChunkSink, IoFuture};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub async fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Wraps a sink and hashes every payload passing through it.
pub struct DigestSink<S> {
    inner: S,
    hasher: Sha256,
    bytes: u64,
}

impl<S: ChunkSink> DigestSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex digest of everything written so far.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ChunkSink> ChunkSink for DigestSink<S> {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        self.hasher.update(chunk.payload());
        self.bytes += chunk.len() as u64;
        self.inner.write(chunk)
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        self.inner.close()
    }
}
