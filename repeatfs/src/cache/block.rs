//! Block storage primitives for the Block Cache Engine.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One in-memory block: up to `block_size` bytes plus a dirty flag.
/// Only the last block of a cache entry may be shorter than `block_size`.
#[derive(Debug, Clone)]
pub struct Block {
    /// The block's bytes.
    pub data: Vec<u8>,
    /// Whether this block has unflushed writes.
    pub dirty: bool,
}

impl Block {
    /// A new, empty, dirty block.
    pub fn new() -> Self {
        Block {
            data: Vec::new(),
            dirty: false,
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// Disk-overflow file for one cache entry, named by hashing the backing
/// path, matching `CacheEntry.reset_cache`'s `hashlib.md5` naming.
pub fn disk_overflow_path(cache_dir: &Path, backing_path: &Path) -> PathBuf {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(backing_path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    cache_dir.join(hex)
}

/// Truncate-and-recreate the disk overflow file for a fresh/reset entry.
pub fn init_disk_overflow(path: &Path) -> Result<()> {
    File::create(path)?;
    Ok(())
}

/// Read one block-sized chunk from the disk overflow file at `block_idx`,
/// returning the bytes read and whether this was the file's last block
/// (`CacheEntry.get_disk_block`).
pub fn get_disk_block(path: &Path, block_idx: u64, block_size: u64) -> Result<(Vec<u8>, bool)> {
    let file_size = fs::metadata(path)?.len();
    let mut handle = File::open(path)?;
    handle.seek(SeekFrom::Start(block_idx * block_size))?;

    let mut buf = vec![0u8; block_size as usize];
    let mut total = 0usize;
    loop {
        let n = handle.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);

    let end = (block_idx * block_size + total as u64) == file_size;
    Ok((buf, end))
}

/// Write one block to the disk overflow file at its exact offset, zero
/// extending the file first if the write would otherwise leave a gap, and
/// truncating the file iff this is the entry's last block
/// (`CacheEntry.set_disk_block`).
pub fn set_disk_block(path: &Path, block_idx: u64, data: &[u8], block_size: u64, is_last: bool) -> Result<()> {
    let file_size = fs::metadata(path)?.len();
    let mut handle = OpenOptions::new().read(true).write(true).open(path)?;

    let byte_pos = block_idx * block_size;
    if file_size < byte_pos {
        handle.seek(SeekFrom::End(0))?;
        handle.write_all(&vec![0u8; (byte_pos - file_size) as usize])?;
    }

    handle.seek(SeekFrom::Start(byte_pos))?;
    handle.write_all(data)?;

    if is_last {
        let end_pos = handle.stream_position()?;
        handle.set_len(end_pos)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow");
        init_disk_overflow(&path).unwrap();

        set_disk_block(&path, 0, b"abcd", 4, false).unwrap();
        set_disk_block(&path, 1, b"ef", 4, true).unwrap();

        let (block0, end0) = get_disk_block(&path, 0, 4).unwrap();
        assert_eq!(block0, b"abcd");
        assert!(!end0);

        let (block1, end1) = get_disk_block(&path, 1, 4).unwrap();
        assert_eq!(block1, b"ef");
        assert!(end1);
    }

    #[test]
    fn disk_overflow_path_is_stable_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = disk_overflow_path(dir.path(), Path::new("/root/x.fastq"));
        let b = disk_overflow_path(dir.path(), Path::new("/root/x.fastq"));
        let c = disk_overflow_path(dir.path(), Path::new("/root/y.fastq"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
