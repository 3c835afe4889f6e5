//! Content hashing (SHA-1 for torrent pieces, SHA-256 for v2 and general use)

use std::path::Path;
use std::str::FromStr;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::{BridgeError, BridgeResult};

const FILE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl FromStr for HashAlgorithm {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(BridgeError::Validation(format!(
                "unsupported hash algorithm: {}",
                other
            ))),
        }
    }
}

impl HashAlgorithm {
    /// Raw digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// Hex digest of `length` bytes of a file starting at `offset`
    /// (to end of file when `length` is `None`).
    pub async fn digest_file(
        self,
        path: &Path,
        offset: u64,
        length: Option<u64>,
    ) -> BridgeResult<String> {
        let mut file = crate::fileops::open_existing(path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut buffer = vec![0u8; FILE_CHUNK];
        let mut remaining = length.unwrap_or(u64::MAX);

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            match self {
                HashAlgorithm::Sha1 => sha1.update(&buffer[..n]),
                HashAlgorithm::Sha256 => sha256.update(&buffer[..n]),
            }
            remaining -= n as u64;
        }

        Ok(match self {
            HashAlgorithm::Sha1 => hex::encode(sha1.finalize()),
            HashAlgorithm::Sha256 => hex::encode(sha256.finalize()),
        })
    }
}

/// SHA-1 of `data`, the piece hash used throughout the torrent engine.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_digests() {
        assert_eq!(
            hex::encode(HashAlgorithm::Sha1.digest(b"")),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            hex::encode(HashAlgorithm::Sha256.digest(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("SHA1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn test_digest_file_range() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let whole = HashAlgorithm::Sha1.digest_file(&path, 0, None).await.unwrap();
        assert_eq!(whole, hex::encode(sha1(b"hello world")));

        let range = HashAlgorithm::Sha256
            .digest_file(&path, 6, Some(5))
            .await
            .unwrap();
        assert_eq!(range, hex::encode(HashAlgorithm::Sha256.digest(b"world")));
    }

    #[tokio::test]
    async fn test_digest_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = HashAlgorithm::Sha1
            .digest_file(&temp.path().join("nope"), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }
}
