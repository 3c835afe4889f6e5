//! Filesystem operations shared by the file gateway and the control channel.
//!
//! Callers pass paths that were already resolved by [`crate::paths::resolve`];
//! nothing here re-checks containment.

use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::hashing;

/// Result of a stat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    /// Milliseconds since the unix epoch
    pub mtime: u64,
    pub is_dir: bool,
    pub is_file: bool,
}

pub(crate) async fn open_existing(path: &Path) -> BridgeResult<File> {
    File::open(path).await.map_err(|e| not_found_or_io(path, e))
}

fn not_found_or_io(path: &Path, e: std::io::Error) -> BridgeError {
    if e.kind() == ErrorKind::NotFound {
        BridgeError::NotFound(path.display().to_string())
    } else {
        e.into()
    }
}

/// Write `data` at `offset`, creating the file and its parents as needed.
///
/// When `expected_sha1` is given the data is hashed first; a mismatch
/// returns [`BridgeError::Conflict`] and nothing is written.
pub async fn write_at(
    path: &Path,
    offset: u64,
    data: &[u8],
    expected_sha1: Option<&[u8]>,
) -> BridgeResult<()> {
    if let Some(expected) = expected_sha1 {
        let actual = hashing::sha1(data);
        if actual.as_slice() != expected {
            return Err(BridgeError::Conflict(format!(
                "hash mismatch: expected {}, got {}",
                hex::encode(expected),
                hex::encode(actual)
            )));
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    file.write_all(data).await?;
    file.flush().await?;

    debug!(path = %path.display(), offset, bytes = data.len(), "Wrote file range");
    Ok(())
}

/// Read `length` bytes at `offset` (to end of file when `length` is `None`).
/// Ranges longer than `max` are refused before anything is allocated.
pub async fn read_range(
    path: &Path,
    offset: u64,
    length: Option<u64>,
    max: u64,
) -> BridgeResult<Vec<u8>> {
    let mut file = open_existing(path).await?;
    let size = file.metadata().await?.len();
    if offset > size {
        return Err(BridgeError::Validation(format!(
            "offset {} is past end of file ({} bytes)",
            offset, size
        )));
    }

    let available = size - offset;
    let want = match length {
        Some(len) if len > available => {
            return Err(BridgeError::Validation(format!(
                "range {}+{} exceeds file size {}",
                offset, len, size
            )))
        }
        Some(len) => len,
        None => available,
    };
    if want > max {
        return Err(BridgeError::TooLarge(format!(
            "read of {} bytes exceeds the {} byte limit; request a smaller length",
            want, max
        )));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; want as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

pub async fn stat(path: &Path) -> BridgeResult<FileStat> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| not_found_or_io(path, e))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(FileStat {
        size: metadata.len(),
        mtime,
        is_dir: metadata.is_dir(),
        is_file: metadata.is_file(),
    })
}

pub async fn ensure_dir(path: &Path) -> BridgeResult<()> {
    fs::create_dir_all(path).await?;
    Ok(())
}

/// Rename `from` to `to`.
///
/// Fails with NotFound when the source is missing and with Conflict when
/// the destination exists and `overwrite` is false. Moves across devices
/// are not attempted.
pub async fn atomic_move(from: &Path, to: &Path, overwrite: bool) -> BridgeResult<()> {
    if !fs::try_exists(from).await? {
        return Err(BridgeError::NotFound(from.display().to_string()));
    }
    if !overwrite && fs::try_exists(to).await? {
        return Err(BridgeError::Conflict(format!(
            "destination exists: {}",
            to.display()
        )));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(from, to).await?;
    debug!(from = %from.display(), to = %to.display(), "Moved");
    Ok(())
}

/// Names of the entries in a directory, sorted.
pub async fn list_dir(path: &Path) -> BridgeResult<Vec<String>> {
    let mut entries = fs::read_dir(path)
        .await
        .map_err(|e| not_found_or_io(path, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Remove a file, or a directory and everything below it.
pub async fn delete(path: &Path) -> BridgeResult<()> {
    let metadata = fs::symlink_metadata(path)
        .await
        .map_err(|e| not_found_or_io(path, e))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}

pub async fn truncate(path: &Path, length: u64) -> BridgeResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| not_found_or_io(path, e))?;
    file.set_len(length).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/piece.bin");

        write_at(&path, 0, b"hello", None).await.unwrap();
        write_at(&path, 5, b" world", None).await.unwrap();

        assert_eq!(read_range(&path, 0, None, u64::MAX).await.unwrap(), b"hello world");
        assert_eq!(read_range(&path, 6, Some(5), u64::MAX).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_sparse_write_at_offset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sparse.bin");

        write_at(&path, 4, b"xy", None).await.unwrap();
        assert_eq!(read_range(&path, 0, None, u64::MAX).await.unwrap(), b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn test_hash_mismatch_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.bin");
        write_at(&path, 0, b"original", None).await.unwrap();

        let wrong = hashing::sha1(b"something else");
        let err = write_at(&path, 0, b"replaced", Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
        assert_eq!(read_range(&path, 0, None, u64::MAX).await.unwrap(), b"original");

        let right = hashing::sha1(b"replaced");
        write_at(&path, 0, b"replaced", Some(&right)).await.unwrap();
        assert_eq!(read_range(&path, 0, None, u64::MAX).await.unwrap(), b"replaced");
    }

    #[tokio::test]
    async fn test_read_missing_and_out_of_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.bin");
        assert!(matches!(
            read_range(&path, 0, None, u64::MAX).await,
            Err(BridgeError::NotFound(_))
        ));

        write_at(&path, 0, b"abc", None).await.unwrap();
        assert!(matches!(
            read_range(&path, 2, Some(5), u64::MAX).await,
            Err(BridgeError::Validation(_))
        ));
        assert!(read_range(&path, 3, None, u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_over_limit_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.bin");
        write_at(&path, 0, b"0123456789", None).await.unwrap();

        assert!(matches!(
            read_range(&path, 0, None, 4).await,
            Err(BridgeError::TooLarge(_))
        ));
        assert!(matches!(
            read_range(&path, 2, Some(5), 4).await,
            Err(BridgeError::TooLarge(_))
        ));
        assert_eq!(read_range(&path, 6, None, 4).await.unwrap(), b"6789");
    }

    #[tokio::test]
    async fn test_stat_file_and_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.bin");
        write_at(&path, 0, b"12345", None).await.unwrap();

        let st = stat(&path).await.unwrap();
        assert_eq!(st.size, 5);
        assert!(st.is_file && !st.is_dir);
        assert!(st.mtime > 0);

        let st = stat(temp.path()).await.unwrap();
        assert!(st.is_dir);

        let json = serde_json::to_value(&st).unwrap();
        assert!(json.get("isDir").is_some());
    }

    #[tokio::test]
    async fn test_move_rules() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from.bin");
        let to = temp.path().join("sub/to.bin");

        assert!(matches!(
            atomic_move(&from, &to, false).await,
            Err(BridgeError::NotFound(_))
        ));

        write_at(&from, 0, b"1", None).await.unwrap();
        atomic_move(&from, &to, false).await.unwrap();
        assert!(!from.exists());
        assert_eq!(read_range(&to, 0, None, u64::MAX).await.unwrap(), b"1");

        write_at(&from, 0, b"2", None).await.unwrap();
        assert!(matches!(
            atomic_move(&from, &to, false).await,
            Err(BridgeError::Conflict(_))
        ));
        atomic_move(&from, &to, true).await.unwrap();
        assert_eq!(read_range(&to, 0, None, u64::MAX).await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_list_delete_truncate() {
        let temp = TempDir::new().unwrap();
        write_at(&temp.path().join("b.txt"), 0, b"bbbb", None).await.unwrap();
        write_at(&temp.path().join("a/x.txt"), 0, b"x", None).await.unwrap();

        assert_eq!(list_dir(temp.path()).await.unwrap(), vec!["a", "b.txt"]);

        truncate(&temp.path().join("b.txt"), 2).await.unwrap();
        assert_eq!(stat(&temp.path().join("b.txt")).await.unwrap().size, 2);

        delete(&temp.path().join("a")).await.unwrap();
        assert_eq!(list_dir(temp.path()).await.unwrap(), vec!["b.txt"]);
    }
}
