#![forbid(unsafe_code)]
//! Metadata image transcoding.
//!
//! Serializes the critical metadata of an open [`Volume`] — superblock,
//! group-descriptor table, allocation bitmaps, and the inode table — to and
//! from a flat byte stream, independent of the underlying block device.
//!
//! Four symmetric operation pairs are exposed, each stateless and driven
//! entirely by the caller:
//!
//! - [`write_inode_table`] / [`read_inode_table`]
//! - [`write_superblock`] / [`read_superblock`]
//! - [`write_bitmap`] / [`read_bitmap`]
//!
//! A full dump is the caller's sequencing of these (superblock +
//! descriptors, then bitmaps, then the inode table); a restore replays the
//! same sections in the same order. The layer never decides which sections
//! to include and never validates overall filesystem consistency.
//!
//! All multi-byte integers on the image are little-endian via the
//! `fsimg-ondisk` codecs, so images transfer across host architectures.
//!
//! Operations process block groups and bitmap chunks strictly in ascending
//! order; the image layout depends on that for the restore direction. Any
//! error aborts the whole operation with no partial continuation.

use fsimg_error::{ImgError, Result};
use fsimg_ondisk::{GroupDesc, Superblock};
use fsimg_types::{BlockNumber, GroupNumber, SUPERBLOCK_SIZE};
use fsimg_volume::Volume;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

/// Working-buffer span for inode-table transcoding, in blocks.
///
/// A tuning choice, not a format requirement: images produced with any
/// chunk size are identical.
const TABLE_BUF_BLOCKS: usize = 32;

/// Working-buffer size for bitmap transcoding, in bytes.
const BITMAP_BUF: usize = 1024;

// ── Flags ───────────────────────────────────────────────────────────────────

/// Behavior flags for the transcoding operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageFlags(pub u32);

impl ImageFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Inode-table write only: skip all-zero blocks by seeking, leaving
    /// holes in the image.
    pub const SPARSE_WRITE: Self = Self(1 << 0);
    /// Bitmap operations only: select the inode bitmap instead of the
    /// block bitmap.
    pub const INODE_BITMAP: Self = Self(1 << 1);

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

impl std::ops::BitOr for ImageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Zero-block detection ────────────────────────────────────────────────────

/// Whether every byte of the block-sized region is zero.
///
/// Short-circuits on the first non-zero byte.
#[must_use]
pub fn check_zero_block(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

// ── Exact-transfer helpers ──────────────────────────────────────────────────

/// Write all of `buf`, distinguishing a stalled sink (`ShortWrite`) from an
/// OS failure (`Io`).
fn write_exact<W: Write>(out: &mut W, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match out.write(&buf[written..]) {
            Ok(0) => {
                return Err(ImgError::ShortWrite {
                    expected: buf.len(),
                    actual: written,
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(ImgError::Io(e)),
        }
    }
    Ok(())
}

/// Fill all of `buf`, distinguishing early end-of-stream (`ShortRead`) from
/// an OS failure (`Io`).
fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(ImgError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(ImgError::Io(e)),
        }
    }
    Ok(())
}

// ── Inode-table transcoder ──────────────────────────────────────────────────

/// Validate one group's inode-table location against the volume's block
/// range and return it.
fn checked_table_loc(vol: &Volume, group: u32, span: u64) -> Result<u64> {
    let table = vol.inode_table_loc(GroupNumber(group))?;
    if table.0 == 0 {
        return Err(ImgError::MissingInodeTable { group });
    }
    let geo = vol.geometry();
    if table.0 < u64::from(geo.first_data_block) || table.0 + span - 1 >= geo.total_blocks {
        return Err(ImgError::BadInodeTable {
            group,
            block: table.0,
        });
    }
    Ok(table.0)
}

/// Stream the raw inode table of every block group to the image.
///
/// With [`ImageFlags::SPARSE_WRITE`], runs of all-zero blocks are skipped
/// by seeking forward (a hole, on sinks that support them) and runs of
/// non-zero blocks are coalesced into single writes. A dump that ends in a
/// hole leaves the sink's length short of the table's nominal size; callers
/// that need the full length materialized (e.g. before a later sequential
/// read) must extend the sink themselves.
pub fn write_inode_table<W: Write + Seek>(
    vol: &mut Volume,
    img: &mut W,
    flags: ImageFlags,
) -> Result<()> {
    let geo = vol.geometry();
    let block_size = geo.block_size as usize;
    let group_count = geo.group_count;
    let table_blocks = geo.inode_blocks_per_group() as usize;
    let sparse = flags.contains(ImageFlags::SPARSE_WRITE);

    let mut buf = vec![0_u8; block_size * TABLE_BUF_BLOCKS];

    for group in 0..group_count {
        let mut blk = checked_table_loc(vol, group, table_blocks as u64)?;
        let mut left = table_blocks;

        while left > 0 {
            let c = left.min(TABLE_BUF_BLOCKS);
            let chunk = &mut buf[..c * block_size];
            vol.read_blocks(BlockNumber(blk), c, chunk)?;

            if sparse {
                write_sparse_blocks(img, chunk, block_size)?;
            } else {
                write_exact(img, chunk)?;
            }

            blk += c as u64;
            left -= c;
        }

        tracing::trace!(
            target: "fsimg::imager",
            group,
            blocks = table_blocks,
            sparse,
            "inode_table_group_written"
        );
    }

    tracing::debug!(
        target: "fsimg::imager",
        groups = group_count,
        sparse,
        "inode_table_write"
    );
    Ok(())
}

/// Write a chunk of blocks, seeking over zero blocks and coalescing each
/// run of non-zero blocks into one write call.
fn write_sparse_blocks<W: Write + Seek>(
    img: &mut W,
    chunk: &[u8],
    block_size: usize,
) -> Result<()> {
    let nblocks = chunk.len() / block_size;
    let mut idx = 0;

    while idx < nblocks {
        if check_zero_block(&chunk[idx * block_size..(idx + 1) * block_size]) {
            let span = i64::try_from(block_size)
                .map_err(|_| ImgError::Format("block size does not fit i64".to_owned()))?;
            img.seek(SeekFrom::Current(span))?;
            idx += 1;
            continue;
        }

        // Extend the run across consecutive non-zero blocks so the whole
        // run goes out in one write call.
        let mut end = idx + 1;
        while end < nblocks && !check_zero_block(&chunk[end * block_size..(end + 1) * block_size])
        {
            end += 1;
        }
        write_exact(img, &chunk[idx * block_size..end * block_size])?;
        idx = end;
    }
    Ok(())
}

/// Stream the inode table of every block group from the image back onto
/// the volume.
///
/// The image is read densely from the current stream position (sparse
/// holes read back as zeros on hole-aware sources). On success the
/// volume's inode cache is flushed so later reads observe the restored
/// table.
pub fn read_inode_table<R: Read>(
    vol: &mut Volume,
    img: &mut R,
    _flags: ImageFlags,
) -> Result<()> {
    let geo = vol.geometry();
    let block_size = geo.block_size as usize;
    let group_count = geo.group_count;
    let table_blocks = geo.inode_blocks_per_group() as usize;

    let mut buf = vec![0_u8; block_size * TABLE_BUF_BLOCKS];

    for group in 0..group_count {
        let table = vol.inode_table_loc(GroupNumber(group))?;
        if table.0 == 0 {
            return Err(ImgError::MissingInodeTable { group });
        }

        let mut blk = table.0;
        let mut left = table_blocks;
        while left > 0 {
            let c = left.min(TABLE_BUF_BLOCKS);
            let chunk = &mut buf[..c * block_size];
            read_exact(img, chunk)?;
            vol.write_blocks(BlockNumber(blk), c, chunk)?;

            blk += c as u64;
            left -= c;
        }
    }

    vol.flush_inode_cache();
    tracing::debug!(
        target: "fsimg::imager",
        groups = group_count,
        "inode_table_read"
    );
    Ok(())
}

// ── Superblock / group-descriptor transcoder ────────────────────────────────

/// Write the superblock (one zero-padded block) followed by the full
/// group-descriptor table (one contiguous write of `desc_blocks` blocks).
///
/// Encoding to the little-endian on-image layout happens into the transient
/// buffer; the volume's in-memory structures are never touched, so they
/// remain byte-order correct whether or not the write succeeds.
pub fn write_superblock<W: Write>(
    vol: &mut Volume,
    img: &mut W,
    _flags: ImageFlags,
) -> Result<()> {
    let Some(descs) = vol.group_desc() else {
        return Err(ImgError::NoGroupDesc);
    };
    let geo = vol.geometry();
    let block_size = geo.block_size as usize;
    let desc_size = geo.desc_size;
    let desc_blocks = geo.desc_blocks() as usize;

    let mut block = vec![0_u8; block_size];
    vol.superblock()
        .encode_into(&mut block)
        .map_err(|e| ImgError::Format(format!("superblock encode: {e}")))?;
    write_exact(img, &block)?;

    let mut table = vec![0_u8; desc_blocks * block_size];
    for (idx, gd) in descs.iter().enumerate() {
        let offset = idx * usize::from(desc_size);
        gd.write_to_bytes(&mut table[offset..], desc_size)
            .map_err(|e| ImgError::Format(format!("group descriptor {idx} encode: {e}")))?;
    }
    write_exact(img, &table)?;

    tracing::debug!(
        target: "fsimg::imager",
        desc_blocks,
        groups = descs.len(),
        "superblock_write"
    );
    Ok(())
}

/// Read the superblock and group-descriptor table from the image and
/// install them on the volume.
///
/// Reads `(desc_blocks + 1)` blocks in one transfer, decodes both
/// structures into temporaries, and only then replaces the volume's
/// metadata — a failure at any point leaves the volume unmodified.
pub fn read_superblock<R: Read>(vol: &mut Volume, img: &mut R, _flags: ImageFlags) -> Result<()> {
    let geo = vol.geometry();
    let block_size = geo.block_size as usize;
    let desc_size = geo.desc_size;
    let desc_blocks = geo.desc_blocks() as usize;
    let group_count = geo.group_count as usize;

    let mut buf = vec![0_u8; (desc_blocks + 1) * block_size];
    read_exact(img, &mut buf)?;

    let sb = Superblock::parse_from_bytes(&buf[..SUPERBLOCK_SIZE])
        .map_err(|e| ImgError::Format(format!("image superblock: {e}")))?;

    let mut descs = Vec::with_capacity(group_count);
    for idx in 0..group_count {
        let offset = block_size + idx * usize::from(desc_size);
        let gd = GroupDesc::parse_from_bytes(&buf[offset..], desc_size)
            .map_err(|e| ImgError::Format(format!("image group descriptor {idx}: {e}")))?;
        descs.push(gd);
    }

    vol.install_metadata(sb, descs)?;
    tracing::debug!(
        target: "fsimg::imager",
        desc_blocks,
        groups = group_count,
        "superblock_read"
    );
    Ok(())
}

// ── Bitmap transcoder ───────────────────────────────────────────────────────

/// Item range and sizing for one bitmap section.
struct BitmapSpan {
    /// First item number.
    itr: u64,
    /// Total bits to transfer.
    cnt: u64,
    /// Packed section size in bytes across all groups.
    total_size: u64,
}

fn bitmap_span(vol: &Volume, flags: ImageFlags) -> BitmapSpan {
    let geo = vol.geometry();
    let groups = u64::from(geo.group_count);
    if flags.contains(ImageFlags::INODE_BITMAP) {
        let per_group = u64::from(geo.inodes_per_group);
        BitmapSpan {
            itr: 1,
            cnt: per_group * groups,
            total_size: (per_group / 8) * groups,
        }
    } else {
        let per_group = u64::from(geo.clusters_per_group);
        BitmapSpan {
            itr: u64::from(geo.first_data_block),
            cnt: per_group * groups,
            total_size: (per_group / 8) * groups,
        }
    }
}

/// Write one allocation bitmap (inode or block, per
/// [`ImageFlags::INODE_BITMAP`]) as a packed-bit section, zero-padded to
/// the next block boundary.
///
/// The selected bitmap is loaded from the volume first if it is not already
/// resident.
pub fn write_bitmap<W: Write>(vol: &mut Volume, img: &mut W, flags: ImageFlags) -> Result<()> {
    let span = bitmap_span(vol, flags);
    let block_size = u64::from(vol.geometry().block_size);
    let inode_map = flags.contains(ImageFlags::INODE_BITMAP);

    let map = if inode_map {
        vol.ensure_inode_bitmap()?
    } else {
        vol.ensure_block_bitmap()?
    };

    let mut buf = [0_u8; BITMAP_BUF];
    let mut itr = span.itr;
    let mut cnt = span.cnt;
    while cnt > 0 {
        let size = (BITMAP_BUF as u64).min(cnt >> 3);
        if size == 0 {
            break;
        }
        #[expect(clippy::cast_possible_truncation)] // size <= BITMAP_BUF
        let size_bytes = size as usize;

        map.get_range(itr, size << 3, &mut buf[..size_bytes])?;
        write_exact(img, &buf[..size_bytes])?;

        itr += size << 3;
        cnt -= size << 3;
    }

    // Pad the section out to the next block boundary so every image
    // section starts block-aligned.
    let rem = span.total_size % block_size;
    if rem != 0 {
        let zeros = [0_u8; BITMAP_BUF];
        let mut pad = block_size - rem;
        while pad > 0 {
            #[expect(clippy::cast_possible_truncation)] // bounded by BITMAP_BUF
            let c = pad.min(BITMAP_BUF as u64) as usize;
            write_exact(img, &zeros[..c])?;
            pad -= c as u64;
        }
    }

    tracing::debug!(
        target: "fsimg::imager",
        inode_map,
        bits = span.cnt,
        bytes = span.total_size,
        "bitmap_write"
    );
    Ok(())
}

/// Read one allocation bitmap section from the image into the volume's
/// bitmap structure, then consume the zero padding so the stream is left
/// at the section's block-aligned end.
pub fn read_bitmap<R: Read>(vol: &mut Volume, img: &mut R, flags: ImageFlags) -> Result<()> {
    let span = bitmap_span(vol, flags);
    let block_size = u64::from(vol.geometry().block_size);
    let inode_map = flags.contains(ImageFlags::INODE_BITMAP);

    let map = if inode_map {
        vol.ensure_inode_bitmap()?
    } else {
        vol.ensure_block_bitmap()?
    };

    let mut buf = [0_u8; BITMAP_BUF];
    let mut itr = span.itr;
    let mut cnt = span.cnt;
    while cnt > 0 {
        let size = (BITMAP_BUF as u64).min(cnt >> 3);
        if size == 0 {
            break;
        }
        #[expect(clippy::cast_possible_truncation)] // size <= BITMAP_BUF
        let size_bytes = size as usize;

        read_exact(img, &mut buf[..size_bytes])?;
        map.set_range(itr, size << 3, &buf[..size_bytes])?;

        itr += size << 3;
        cnt -= size << 3;
    }

    // Discard the write path's padding so chained section reads start on
    // a block boundary.
    let rem = span.total_size % block_size;
    if rem != 0 {
        let mut pad = block_size - rem;
        while pad > 0 {
            #[expect(clippy::cast_possible_truncation)] // bounded by BITMAP_BUF
            let c = pad.min(BITMAP_BUF as u64) as usize;
            read_exact(img, &mut buf[..c])?;
            pad -= c as u64;
        }
    }

    tracing::debug!(
        target: "fsimg::imager",
        inode_map,
        bits = span.cnt,
        bytes = span.total_size,
        "bitmap_read"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_detection_short_circuits_semantics() {
        assert!(check_zero_block(&[0_u8; 1024]));
        assert!(check_zero_block(&[]));

        let mut block = [0_u8; 1024];
        block[1023] = 1;
        assert!(!check_zero_block(&block));
        block[1023] = 0;
        block[0] = 1;
        assert!(!check_zero_block(&block));
    }

    #[test]
    fn flags_contain_and_combine() {
        let flags = ImageFlags::SPARSE_WRITE | ImageFlags::INODE_BITMAP;
        assert!(flags.contains(ImageFlags::SPARSE_WRITE));
        assert!(flags.contains(ImageFlags::INODE_BITMAP));
        assert!(!ImageFlags::NONE.contains(ImageFlags::SPARSE_WRITE));
        assert_eq!(flags.bits(), 0b11);
    }

    /// Sink that accepts `limit` bytes and then reports no progress.
    struct StallingWriter {
        limit: usize,
        written: usize,
    }

    impl Write for StallingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let room = self.limit.saturating_sub(self.written);
            let n = buf.len().min(room);
            self.written += n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_exact_reports_short_write() {
        let mut sink = StallingWriter {
            limit: 100,
            written: 0,
        };
        let err = write_exact(&mut sink, &[7_u8; 256]).unwrap_err();
        match err {
            ImgError::ShortWrite { expected, actual } => {
                assert_eq!(expected, 256);
                assert_eq!(actual, 100);
            }
            other => panic!("expected ShortWrite, got {other:?}"),
        }
    }

    #[test]
    fn read_exact_reports_short_read() {
        let data = [9_u8; 50];
        let mut src = &data[..];
        let mut buf = [0_u8; 80];
        let err = read_exact(&mut src, &mut buf).unwrap_err();
        match err {
            ImgError::ShortRead { expected, actual } => {
                assert_eq!(expected, 80);
                assert_eq!(actual, 50);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[test]
    fn write_exact_surfaces_io_errors_verbatim() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from_raw_os_error(28)) // ENOSPC
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = write_exact(&mut FailingWriter, &[1_u8; 8]).unwrap_err();
        match err {
            ImgError::Io(io) => assert_eq!(io.raw_os_error(), Some(28)),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn sparse_chunk_coalesces_nonzero_runs() {
        // Layout: Z N N Z N  (block size 4 for brevity)
        let bs = 4;
        let mut chunk = vec![0_u8; bs * 5];
        chunk[bs..3 * bs].fill(0xAB);
        chunk[4 * bs..5 * bs].fill(0xCD);

        struct RecordingSink {
            writes: Vec<usize>,
            seeks: Vec<i64>,
        }
        impl Write for RecordingSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.writes.push(buf.len());
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl Seek for RecordingSink {
            fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
                if let SeekFrom::Current(delta) = pos {
                    self.seeks.push(delta);
                }
                Ok(0)
            }
        }

        let mut sink = RecordingSink {
            writes: Vec::new(),
            seeks: Vec::new(),
        };
        write_sparse_blocks(&mut sink, &chunk, bs).unwrap();

        // Two runs coalesced into exactly two writes, two holes seeked.
        assert_eq!(sink.writes, vec![2 * bs, bs]);
        assert_eq!(sink.seeks, vec![4, 4]);
    }
}
