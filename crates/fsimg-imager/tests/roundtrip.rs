#![forbid(unsafe_code)]
//! End-to-end transcoding properties: round-trip identity, sparse
//! equivalence, section alignment, and failure isolation.

use fsimg_block::{BlockBuf, BlockDevice};
use fsimg_error::{ImgError, Result};
use fsimg_imager::{
    ImageFlags, read_bitmap, read_inode_table, read_superblock, write_bitmap, write_inode_table,
    write_superblock,
};
use fsimg_ondisk::{GroupDesc, Superblock};
use fsimg_types::{BlockNumber, InodeNumber, SUPER_MAGIC};
use fsimg_volume::Volume;
use std::collections::HashMap;
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::Mutex;

// ── In-memory device ────────────────────────────────────────────────────────

struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let blocks = self.blocks.lock().unwrap();
        blocks.get(&block.0).map_or_else(
            || Ok(BlockBuf::new(vec![0_u8; self.block_size as usize])),
            |data| Ok(BlockBuf::new(data.clone())),
        )
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.blocks.lock().unwrap().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Stream wrappers ─────────────────────────────────────────────────────────

/// Counts payload bytes handed to the sink; seeks cost nothing.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

/// Sink that accepts `limit` bytes then stalls.
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

impl Seek for StallingWriter {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Ok(0)
    }
}

// ── Volume fixtures ─────────────────────────────────────────────────────────

/// Small fixture: 1K blocks, 2 groups of 256 blocks / 32 inodes, 4-block
/// inode table per group.
fn superblock_small() -> Superblock {
    Superblock {
        inodes_count: 64,
        blocks_count: 512,
        reserved_blocks_count: 0,
        free_blocks_count: 400,
        free_inodes_count: 50,
        first_data_block: 1,
        block_size: 1024,
        cluster_size: 1024,
        blocks_per_group: 256,
        clusters_per_group: 256,
        inodes_per_group: 32,
        inode_size: 128,
        first_ino: 11,
        desc_size: 32,
        magic: SUPER_MAGIC,
        uuid: *b"fsimg-test-uuid!",
        volume_name: "smallvol".to_owned(),
        last_mounted: "/mnt/small".to_owned(),
        rev_level: 1,
        minor_rev_level: 0,
        creator_os: 0,
        feature_compat: 0x0010,
        feature_incompat: 0x0002,
        feature_ro_compat: 0x0001,
        state: 1,
        errors: 1,
        mnt_count: 3,
        max_mnt_count: 25,
        mtime: 1_700_000_000,
        wtime: 1_700_000_500,
        lastcheck: 1_699_000_000,
        checkinterval: 0,
        mkfs_time: 1_600_000_000,
    }
}

fn descs_small() -> Vec<GroupDesc> {
    vec![
        GroupDesc {
            block_bitmap: 10,
            inode_bitmap: 11,
            inode_table: 12,
            free_blocks_count: 200,
            free_inodes_count: 25,
            used_dirs_count: 1,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        },
        GroupDesc {
            block_bitmap: 266,
            inode_bitmap: 267,
            inode_table: 268,
            free_blocks_count: 200,
            free_inodes_count: 25,
            used_dirs_count: 1,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        },
    ]
}

fn seed_device(dev: &MemBlockDevice, sb: &Superblock, descs: &[GroupDesc]) {
    let block_size = dev.block_size() as usize;
    let desc_size = sb.group_desc_size();

    if block_size == 1024 {
        let mut sb_block = vec![0_u8; block_size];
        sb.encode_into(&mut sb_block).unwrap();
        dev.write_block(BlockNumber(1), &sb_block).unwrap();
    } else {
        let mut block0 = vec![0_u8; block_size];
        sb.encode_into(&mut block0[1024..]).unwrap();
        dev.write_block(BlockNumber(0), &block0).unwrap();
    }

    let mut gdt = vec![0_u8; block_size];
    for (idx, gd) in descs.iter().enumerate() {
        gd.write_to_bytes(&mut gdt[idx * usize::from(desc_size)..], desc_size)
            .unwrap();
    }
    let gdt_block = u64::from(sb.first_data_block) + 1;
    dev.write_block(BlockNumber(gdt_block), &gdt).unwrap();
}

fn open_small() -> Volume {
    let dev = MemBlockDevice::new(1024, 512);
    seed_device(&dev, &superblock_small(), &descs_small());
    Volume::open(Box::new(dev)).expect("open small volume")
}

/// Fill the small fixture's inode-table blocks with a zero / non-zero
/// pattern. The final block of the whole table is zero, so a sparse dump
/// ends in a hole.
fn fill_small_tables(vol: &Volume) {
    let bs = 1024_usize;
    // Group 0 table at 12..=15: NZ, Z, NZ, Z.
    vol.write_blocks(BlockNumber(12), 1, &vec![0x11; bs]).unwrap();
    vol.write_blocks(BlockNumber(14), 1, &vec![0x22; bs]).unwrap();
    // Group 1 table at 268..=271: Z, NZ, NZ, Z.
    vol.write_blocks(BlockNumber(269), 1, &vec![0x33; bs]).unwrap();
    vol.write_blocks(BlockNumber(270), 1, &vec![0x44; bs]).unwrap();
}

/// Concatenated inode-table bytes of the small fixture, in group order.
fn small_table_contents(vol: &Volume) -> Vec<u8> {
    let bs = 1024_usize;
    let mut out = vec![0_u8; 8 * bs];
    vol.read_blocks(BlockNumber(12), 4, &mut out[..4 * bs]).unwrap();
    vol.read_blocks(BlockNumber(268), 4, &mut out[4 * bs..]).unwrap();
    out
}

/// Wide fixture: 9600 inodes across 2 groups so the inode bitmap spans
/// multiple 1024-byte transfer chunks and its packed size (1200 bytes) is
/// not block-aligned.
fn superblock_wide() -> Superblock {
    Superblock {
        inodes_count: 9600,
        blocks_count: 16385,
        reserved_blocks_count: 0,
        free_blocks_count: 10000,
        free_inodes_count: 9000,
        first_data_block: 1,
        block_size: 1024,
        cluster_size: 1024,
        blocks_per_group: 8192,
        clusters_per_group: 8192,
        inodes_per_group: 4800,
        inode_size: 128,
        first_ino: 11,
        desc_size: 32,
        magic: SUPER_MAGIC,
        uuid: [3_u8; 16],
        volume_name: "widevol".to_owned(),
        last_mounted: String::new(),
        rev_level: 1,
        minor_rev_level: 0,
        creator_os: 0,
        feature_compat: 0,
        feature_incompat: 0,
        feature_ro_compat: 0,
        state: 1,
        errors: 1,
        mnt_count: 0,
        max_mnt_count: 20,
        mtime: 0,
        wtime: 0,
        lastcheck: 0,
        checkinterval: 0,
        mkfs_time: 0,
    }
}

fn descs_wide() -> Vec<GroupDesc> {
    vec![
        GroupDesc {
            block_bitmap: 10,
            inode_bitmap: 11,
            inode_table: 12,
            free_blocks_count: 5000,
            free_inodes_count: 4500,
            used_dirs_count: 1,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        },
        GroupDesc {
            block_bitmap: 8200,
            inode_bitmap: 8201,
            inode_table: 8202,
            free_blocks_count: 5000,
            free_inodes_count: 4500,
            used_dirs_count: 1,
            itable_unused: 0,
            flags: 0,
            checksum: 0,
        },
    ]
}

fn open_wide() -> Volume {
    let dev = MemBlockDevice::new(1024, 16385);
    seed_device(&dev, &superblock_wide(), &descs_wide());
    Volume::open(Box::new(dev)).expect("open wide volume")
}

// ── Inode-table round trips ─────────────────────────────────────────────────

#[test]
fn inode_table_round_trip_dense() {
    let mut vol = open_small();
    fill_small_tables(&vol);
    let original = small_table_contents(&vol);

    let mut img = Cursor::new(Vec::new());
    write_inode_table(&mut vol, &mut img, ImageFlags::NONE).expect("write");
    assert_eq!(img.get_ref().len(), 8 * 1024, "dense image is full-size");

    let mut restored = open_small();
    img.set_position(0);
    read_inode_table(&mut restored, &mut img, ImageFlags::NONE).expect("read");
    assert_eq!(small_table_contents(&restored), original);
}

#[test]
fn inode_table_round_trip_sparse_matches_dense() {
    let mut vol = open_small();
    fill_small_tables(&vol);
    let original = small_table_contents(&vol);

    let mut dense = CountingWriter::new(Cursor::new(Vec::new()));
    write_inode_table(&mut vol, &mut dense, ImageFlags::NONE).expect("dense write");

    let mut sparse = CountingWriter::new(Cursor::new(Vec::new()));
    write_inode_table(&mut vol, &mut sparse, ImageFlags::SPARSE_WRITE).expect("sparse write");

    // Holes cost no payload bytes: only the 4 non-zero blocks are written.
    assert_eq!(dense.written, 8 * 1024);
    assert_eq!(sparse.written, 4 * 1024);
    assert!(sparse.written <= dense.written);

    // Materialize the trailing hole the way an orchestrator's set_len
    // would, then restore.
    let mut bytes = sparse.inner.into_inner();
    assert!(bytes.len() < 8 * 1024, "trailing hole leaves the sink short");
    bytes.resize(8 * 1024, 0);

    let mut restored = open_small();
    let mut img = Cursor::new(bytes);
    read_inode_table(&mut restored, &mut img, ImageFlags::NONE).expect("read");
    assert_eq!(small_table_contents(&restored), original);
}

#[test]
fn sparse_image_file_round_trips_after_extension() {
    let mut vol = open_small();
    fill_small_tables(&vol);
    let original = small_table_contents(&vol);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("table.img");
    let mut file = std::fs::File::create(&path).unwrap();
    write_inode_table(&mut vol, &mut file, ImageFlags::SPARSE_WRITE).expect("write");
    file.set_len(8 * 1024).unwrap();
    drop(file);

    let mut restored = open_small();
    let mut file = std::fs::File::open(&path).unwrap();
    read_inode_table(&mut restored, &mut file, ImageFlags::NONE).expect("read");
    assert_eq!(small_table_contents(&restored), original);
}

#[test]
fn restore_invalidates_inode_cache() {
    let mut vol = open_small();
    fill_small_tables(&vol);
    let mut img = Cursor::new(Vec::new());
    write_inode_table(&mut vol, &mut img, ImageFlags::NONE).expect("write");

    let mut restored = open_small();
    // Warm the cache with the pre-restore (all-zero) record.
    let before = restored.read_inode(InodeNumber(1)).expect("read");
    assert!(before.iter().all(|&b| b == 0));

    img.set_position(0);
    read_inode_table(&mut restored, &mut img, ImageFlags::NONE).expect("restore");

    let after = restored.read_inode(InodeNumber(1)).expect("read again");
    assert_eq!(&after[..4], &[0x11, 0x11, 0x11, 0x11]);
}

// ── Inode-table boundary errors ─────────────────────────────────────────────

#[test]
fn missing_inode_table_halts_before_writing() {
    let dev = MemBlockDevice::new(1024, 512);
    let mut descs = descs_small();
    descs[0].inode_table = 0;
    seed_device(&dev, &superblock_small(), &descs);
    let mut vol = Volume::open(Box::new(dev)).expect("open");

    let mut img = CountingWriter::new(Cursor::new(Vec::new()));
    let err = write_inode_table(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(err, ImgError::MissingInodeTable { group: 0 }));
    assert_eq!(img.written, 0, "no byte may reach the image");
}

#[test]
fn out_of_range_inode_table_is_rejected() {
    let dev = MemBlockDevice::new(1024, 512);
    let mut descs = descs_small();
    // Span 600..=603 exceeds the 512-block volume.
    descs[1].inode_table = 600;
    seed_device(&dev, &superblock_small(), &descs);
    let mut vol = Volume::open(Box::new(dev)).expect("open");

    let mut img = Cursor::new(Vec::new());
    let err = write_inode_table(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(
        err,
        ImgError::BadInodeTable {
            group: 1,
            block: 600
        }
    ));
}

#[test]
fn short_write_aborts_inode_table_dump() {
    let mut vol = open_small();
    fill_small_tables(&vol);

    let mut img = StallingWriter {
        limit: 1500,
        written: 0,
    };
    let err = write_inode_table(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(err, ImgError::ShortWrite { .. }));
}

#[test]
fn short_read_aborts_inode_table_restore() {
    let mut vol = open_small();
    let truncated = vec![0_u8; 1000];
    let mut img = Cursor::new(truncated);
    let err = read_inode_table(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(err, ImgError::ShortRead { .. }));
}

// ── Superblock / descriptor round trips ─────────────────────────────────────

#[test]
fn superblock_round_trip_preserves_fields() {
    let mut vol = open_small();
    let sb_before = vol.superblock().clone();
    let descs_before = vol.group_desc().unwrap().to_vec();

    let mut img = Cursor::new(Vec::new());
    write_superblock(&mut vol, &mut img, ImageFlags::NONE).expect("write");

    // One superblock block plus one descriptor block.
    assert_eq!(img.get_ref().len(), 2 * 1024);
    // The write must not perturb the in-memory superblock.
    assert_eq!(vol.superblock(), &sb_before);
    // Multi-byte fields are little-endian on the image regardless of host.
    assert_eq!(img.get_ref()[0x38], 0x53);
    assert_eq!(img.get_ref()[0x39], 0xEF);

    // Restore onto a volume whose metadata differs.
    let dev = MemBlockDevice::new(1024, 512);
    let mut other_sb = superblock_small();
    other_sb.volume_name = "scribbled".to_owned();
    other_sb.free_blocks_count = 1;
    let mut other_descs = descs_small();
    other_descs[0].free_blocks_count = 7;
    seed_device(&dev, &other_sb, &other_descs);
    let mut restored = Volume::open(Box::new(dev)).expect("open");

    img.set_position(0);
    read_superblock(&mut restored, &mut img, ImageFlags::NONE).expect("read");
    assert_eq!(restored.superblock(), &sb_before);
    assert_eq!(restored.group_desc().unwrap(), descs_before.as_slice());
}

#[test]
fn short_super_read_leaves_volume_unmodified() {
    let mut vol = open_small();
    let sb_before = vol.superblock().clone();

    let mut img = Cursor::new(vec![0_u8; 700]);
    let err = read_superblock(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(err, ImgError::ShortRead { .. }));
    assert_eq!(vol.superblock(), &sb_before);
    assert!(vol.group_desc().is_some());
}

#[test]
fn short_super_write_is_fatal() {
    let mut vol = open_small();
    let mut img = StallingWriter {
        limit: 512,
        written: 0,
    };
    let err = write_superblock(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(
        err,
        ImgError::ShortWrite {
            expected: 1024,
            actual: 512
        }
    ));
}

// ── Bitmap round trips ──────────────────────────────────────────────────────

#[test]
fn inode_bitmap_round_trip_across_chunk_boundary() {
    let mut vol = open_wide();
    let marked = [1_u64, 5, 11, 4800, 4801, 8191, 8192, 8193, 9600];
    {
        let map = vol.ensure_inode_bitmap().expect("load");
        for &item in &marked {
            map.mark(item).unwrap();
        }
    }

    let mut img = Cursor::new(Vec::new());
    write_bitmap(&mut vol, &mut img, ImageFlags::INODE_BITMAP).expect("write");

    // Packed size is 1200 bytes (600 per group), padded to 2 blocks.
    let len = img.get_ref().len();
    assert_eq!(len, 2048);
    assert_eq!(len % 1024, 0, "section must end on a block boundary");

    let mut restored = open_wide();
    img.set_position(0);
    read_bitmap(&mut restored, &mut img, ImageFlags::INODE_BITMAP).expect("read");
    // The read consumes the padding, leaving the stream block-aligned.
    assert_eq!(img.position(), 2048);

    let map = restored.ensure_inode_bitmap().expect("map");
    assert_eq!(map.count_marked(), marked.len() as u64);
    for &item in &marked {
        assert!(map.test(item).unwrap(), "item {item} lost in round trip");
    }
    assert!(!map.test(2).unwrap());
    assert!(!map.test(8194).unwrap());
}

#[test]
fn block_bitmap_round_trip_with_padding() {
    let mut vol = open_small();
    let marked = [1_u64, 10, 11, 12, 255, 256, 257, 512];
    {
        let map = vol.ensure_block_bitmap().expect("load");
        for &item in &marked {
            map.mark(item).unwrap();
        }
    }

    let mut img = Cursor::new(Vec::new());
    write_bitmap(&mut vol, &mut img, ImageFlags::NONE).expect("write");

    // 32 packed bytes per group, so 64 data bytes padded to one block.
    assert_eq!(img.get_ref().len(), 1024);

    let mut restored = open_small();
    img.set_position(0);
    read_bitmap(&mut restored, &mut img, ImageFlags::NONE).expect("read");
    assert_eq!(img.position(), 1024);

    let map = restored.ensure_block_bitmap().expect("map");
    assert_eq!(map.count_marked(), marked.len() as u64);
    for &item in &marked {
        assert!(map.test(item).unwrap());
    }
}

#[test]
fn bitmap_short_write_uses_write_error_kind() {
    let mut vol = open_wide();
    let _ = vol.ensure_inode_bitmap().expect("load");

    let mut img = StallingWriter {
        limit: 100,
        written: 0,
    };
    let err = write_bitmap(&mut vol, &mut img, ImageFlags::INODE_BITMAP).unwrap_err();
    assert!(
        matches!(err, ImgError::ShortWrite { .. }),
        "bitmap writes report short *writes*, got {err:?}"
    );
}

#[test]
fn bitmap_short_read_is_fatal() {
    let mut vol = open_small();
    let mut img = Cursor::new(vec![0_u8; 10]);
    let err = read_bitmap(&mut vol, &mut img, ImageFlags::NONE).unwrap_err();
    assert!(matches!(err, ImgError::ShortRead { .. }));
}

// ── Full dump / restore sequencing ──────────────────────────────────────────

#[test]
fn chained_dump_restores_section_by_section() {
    let mut vol = open_small();
    fill_small_tables(&vol);
    {
        let map = vol.ensure_block_bitmap().expect("load");
        map.mark(12).unwrap();
        map.mark(268).unwrap();
    }
    {
        let map = vol.ensure_inode_bitmap().expect("load");
        map.mark(1).unwrap();
        map.mark(33).unwrap();
    }
    let sb_before = vol.superblock().clone();
    let table_before = small_table_contents(&vol);

    let mut img = Cursor::new(Vec::new());
    write_superblock(&mut vol, &mut img, ImageFlags::NONE).expect("super");
    write_bitmap(&mut vol, &mut img, ImageFlags::NONE).expect("block bitmap");
    write_bitmap(&mut vol, &mut img, ImageFlags::INODE_BITMAP).expect("inode bitmap");
    write_inode_table(&mut vol, &mut img, ImageFlags::NONE).expect("table");

    // super (2 blocks) + block bitmap (1) + inode bitmap (1) + table (8).
    assert_eq!(img.get_ref().len(), 12 * 1024);

    let mut restored = open_small();
    img.set_position(0);
    read_superblock(&mut restored, &mut img, ImageFlags::NONE).expect("super");
    read_bitmap(&mut restored, &mut img, ImageFlags::NONE).expect("block bitmap");
    read_bitmap(&mut restored, &mut img, ImageFlags::INODE_BITMAP).expect("inode bitmap");
    read_inode_table(&mut restored, &mut img, ImageFlags::NONE).expect("table");

    assert_eq!(restored.superblock(), &sb_before);
    assert_eq!(small_table_contents(&restored), table_before);
    let blocks = restored.ensure_block_bitmap().expect("map");
    assert!(blocks.test(12).unwrap());
    assert!(blocks.test(268).unwrap());
    assert!(!blocks.test(13).unwrap());
    let inodes = restored.ensure_inode_bitmap().expect("map");
    assert!(inodes.test(1).unwrap());
    assert!(inodes.test(33).unwrap());
    assert!(!inodes.test(2).unwrap());
}
