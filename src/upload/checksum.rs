/*!
 * SHA-256 hashing for session integrity anchors and chunk records
 */

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Streaming hasher that calculates checksum incrementally
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    /// Create a new streaming hasher
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Update the hash with new data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an in-memory chunk
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a whole file, streamed in 64 KiB blocks
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

/// Hash a file on the blocking pool
pub async fn hash_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| crate::error::CovtrailError::Worker(format!("hash task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // SHA256 of "hello world"
    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_streaming_hasher() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), HELLO_WORLD);
    }

    #[test]
    fn test_hash_bytes_matches_streaming() {
        assert_eq!(hash_bytes(b"hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_hash_file_spans_buffer_boundary() {
        let data: Vec<u8> = (0..(HASH_BUFFER_SIZE * 2 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();

        assert_eq!(hash_file(temp.path()).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_hash_missing_file() {
        let result = hash_file(Path::new("/definitely/not/here.bin"));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"hello world").unwrap();
        temp.flush().unwrap();

        assert_eq!(hash_file_async(temp.path()).await.unwrap(), HELLO_WORLD);
    }
}
