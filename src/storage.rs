use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context;
use sha1::{Digest, Sha1};

use crate::{error::SwarmError, swarmerr};

/// chunk size used when streaming the file through the hasher
const HASH_CHUNK_SIZE: usize = 65536;

/// Random-access piece storage over a single backing file.
///
/// A seed opens its file read-only; a leecher creates (or truncates) the
/// destination and sizes it once the file length is learned from the swarm.
/// The node serializes all access through its own lock, so the store itself
/// is single-owner and does no caching.
pub struct FileStore {
    file: Option<File>,
    size: Option<u64>,
    writable: bool,
}

impl FileStore {
    /// Open an existing file read-only, recording its on-disk size.
    pub fn open(path: &Path) -> Result<Self, SwarmError> {
        let file =
            File::open(path).with_context(|| format!("Error opening {}", path.display()))?;
        let size = file
            .metadata()
            .with_context(|| "Error reading file metadata")?
            .len();
        Ok(Self {
            file: Some(file),
            size: Some(size),
            writable: false,
        })
    }

    /// Create or truncate the destination file for writing. The size is
    /// unknown until `set_size` is called.
    pub fn create(path: &Path) -> Result<Self, SwarmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Error creating {}", path.display()))?;
        Ok(Self {
            file: Some(file),
            size: None,
            writable: true,
        })
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Truncate or extend the backing file to exactly `size` bytes. Newly
    /// created bytes read back as zero.
    pub fn set_size(&mut self, size: u64) -> Result<(), SwarmError> {
        if !self.writable {
            return Err(swarmerr!("File is not open for writing"));
        }
        let file = self.file.as_ref().ok_or_else(|| swarmerr!("File is closed"))?;
        file.set_len(size).with_context(|| "Error resizing file")?;
        self.size = Some(size);
        Ok(())
    }

    fn piece_span(&self, index: usize, piece_size: u64) -> Result<(u64, usize), SwarmError> {
        let size = self.size.ok_or_else(|| swarmerr!("File size is not known"))?;
        let offset = index as u64 * piece_size;
        if piece_size == 0 || offset >= size {
            return Err(swarmerr!("Piece {index} is out of range"));
        }
        Ok((offset, piece_size.min(size - offset) as usize))
    }

    /// Read piece `index`. Every piece is `piece_size` bytes except the
    /// final one, which may be shorter.
    pub fn read_piece(&mut self, index: usize, piece_size: u64) -> Result<Vec<u8>, SwarmError> {
        let (offset, length) = self.piece_span(index, piece_size)?;
        let file = self.file.as_mut().ok_or_else(|| swarmerr!("File is closed"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)
            .with_context(|| format!("Error reading piece {index}"))?;
        Ok(buf)
    }

    /// Write piece `index` at its offset. The caller is trusted to pass a
    /// buffer of the correct length.
    pub fn write_piece(
        &mut self,
        index: usize,
        piece_size: u64,
        data: &[u8],
    ) -> Result<(), SwarmError> {
        if !self.writable {
            return Err(swarmerr!("File is not open for writing"));
        }
        let file = self.file.as_mut().ok_or_else(|| swarmerr!("File is closed"))?;
        file.seek(SeekFrom::Start(index as u64 * piece_size))?;
        file.write_all(data)
            .with_context(|| format!("Error writing piece {index}"))?;
        Ok(())
    }

    /// Stream the entire file through SHA-1 and return the digest as
    /// lowercase hex.
    pub fn compute_hash(&mut self) -> Result<String, SwarmError> {
        let file = self.file.as_mut().ok_or_else(|| swarmerr!("File is closed"))?;
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).with_context(|| "Error hashing file")?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Release the file handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }
}
