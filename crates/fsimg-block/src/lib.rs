#![forbid(unsafe_code)]
//! Device I/O layer.
//!
//! Provides the byte-addressed [`ByteDevice`] and block-addressed
//! [`BlockDevice`] traits, a file backend using `pread`/`pwrite` semantics,
//! and the adapter between the two. All volume I/O in fsimg goes through
//! [`BlockDevice`]; the imaging stream itself is plain `std::io` and is not
//! represented here.

use fsimg_error::{ImgError, Result};
use fsimg_types::{BlockNumber, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open `path` read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| ImgError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| ImgError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(ImgError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(ImgError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| ImgError::Format("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| ImgError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(ImgError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface, operating in block-count units.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read `count` consecutive blocks starting at `start` into `buf`.
    ///
    /// `buf.len()` MUST equal `count * block_size()`.
    fn read_blocks_into(&self, start: BlockNumber, count: usize, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size() as usize;
        if buf.len() != count * bs {
            return Err(ImgError::Format(format!(
                "read_blocks_into buffer size mismatch: got={} expected={}",
                buf.len(),
                count * bs
            )));
        }
        for (idx, chunk) in buf.chunks_exact_mut(bs).enumerate() {
            let block = BlockNumber(start.0 + idx as u64);
            let one = self.read_block(block)?;
            chunk.copy_from_slice(one.as_slice());
        }
        Ok(())
    }

    /// Write `count` consecutive blocks starting at `start` from `buf`.
    ///
    /// `buf.len()` MUST equal `count * block_size()`.
    fn write_blocks_from(&self, start: BlockNumber, count: usize, buf: &[u8]) -> Result<()> {
        let bs = self.block_size() as usize;
        if buf.len() != count * bs {
            return Err(ImgError::Format(format!(
                "write_blocks_from buffer size mismatch: got={} expected={}",
                buf.len(),
                count * bs
            )));
        }
        for (idx, chunk) in buf.chunks_exact(bs).enumerate() {
            let block = BlockNumber(start.0 + idx as u64);
            self.write_block(block, chunk)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(ImgError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(ImgError::Format(format!(
                "volume length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(ImgError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| ImgError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                ImgError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| ImgError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(ImgError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(ImgError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| ImgError::Format("block offset overflow".to_owned()))?;
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Read the superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; SUPERBLOCK_SIZE];
    let offset = u64::try_from(SUPERBLOCK_OFFSET)
        .map_err(|_| ImgError::Format("superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
