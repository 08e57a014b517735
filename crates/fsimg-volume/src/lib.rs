#![forbid(unsafe_code)]
//! The volume handle.
//!
//! A [`Volume`] owns a block device plus the in-memory metadata the imaging
//! layer works against: the parsed superblock, derived [`Geometry`], the
//! group-descriptor table, lazily loaded allocation bitmaps, and a bounded
//! inode cache. All mutation goes through `&mut Volume`; there is no shared
//! global state and no internal locking beyond the cache's own mutex.

pub mod bitmap;

use fsimg_block::BlockDevice;
use fsimg_error::{ImgError, Result};
use fsimg_ondisk::{GroupDesc, Superblock};
use fsimg_types::{
    BlockNumber, GroupNumber, InodeNumber, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, inode_index_in_group,
    inode_to_group,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub use bitmap::ItemBitmap;

// ── Geometry ────────────────────────────────────────────────────────────────

/// Cached volume geometry derived from the superblock at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub total_blocks: u64,
    pub total_clusters: u64,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub group_count: u32,
    pub desc_size: u16,
}

impl Geometry {
    /// Derive geometry from a parsed superblock.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        Self {
            block_size: sb.block_size,
            blocks_per_group: sb.blocks_per_group,
            clusters_per_group: sb.clusters_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            total_blocks: sb.blocks_count,
            // Without a bigalloc-style cluster feature, clusters and blocks
            // are the same unit.
            total_clusters: sb.blocks_count,
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            group_count: sb.groups_count(),
            desc_size: sb.group_desc_size(),
        }
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // table spans fit u32
    pub fn inode_blocks_per_group(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        let bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        bytes.div_ceil(u64::from(self.block_size)) as u32
    }

    /// Blocks occupied by the contiguous group-descriptor table.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // descriptor spans fit u32
    pub fn desc_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 0;
        }
        let bytes = u64::from(self.group_count) * u64::from(self.desc_size);
        bytes.div_ceil(u64::from(self.block_size)) as u32
    }

    /// First block of the group-descriptor table (the block after the one
    /// holding the superblock).
    #[must_use]
    pub fn gdt_start_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.first_data_block) + 1)
    }

    /// Packed bytes of one group's slice of the inode bitmap.
    #[must_use]
    pub fn inode_bitmap_bytes_per_group(&self) -> usize {
        (self.inodes_per_group / 8) as usize
    }

    /// Packed bytes of one group's slice of the block bitmap.
    #[must_use]
    pub fn block_bitmap_bytes_per_group(&self) -> usize {
        (self.clusters_per_group / 8) as usize
    }
}

// ── Inode cache ─────────────────────────────────────────────────────────────

/// Raw-inode cache with FIFO eviction.
///
/// Restores that rewrite the inode table on the device must invalidate this
/// cache, or stale pre-restore records would keep being served.
#[derive(Debug)]
struct InodeCache {
    state: Mutex<InodeCacheState>,
}

#[derive(Debug)]
struct InodeCacheState {
    entries: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl InodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InodeCacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    fn get(&self, ino: u64) -> Option<Vec<u8>> {
        self.state.lock().entries.get(&ino).cloned()
    }

    fn insert(&self, ino: u64, raw: Vec<u8>) {
        let mut state = self.state.lock();
        if state.entries.insert(ino, raw).is_none() {
            state.order.push_back(ino);
        }
        while state.order.len() > state.capacity {
            if let Some(victim) = state.order.pop_front() {
                let _ = state.entries.remove(&victim);
            }
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }
}

const INODE_CACHE_CAPACITY: usize = 64;

// ── Volume ──────────────────────────────────────────────────────────────────

/// An open filesystem volume.
pub struct Volume {
    dev: Box<dyn BlockDevice>,
    superblock: Superblock,
    geometry: Geometry,
    group_desc: Option<Vec<GroupDesc>>,
    inode_bitmap: Option<ItemBitmap>,
    block_bitmap: Option<ItemBitmap>,
    inode_cache: InodeCache,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("group_desc_len", &self.group_desc.as_ref().map(Vec::len))
            .field("inode_bitmap_loaded", &self.inode_bitmap.is_some())
            .field("block_bitmap_loaded", &self.block_bitmap.is_some())
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open a volume: parse the superblock, validate geometry, and load the
    /// group-descriptor table.
    pub fn open(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let sb_region = read_superblock_region(dev.as_ref())?;
        let superblock = Superblock::parse_from_bytes(&sb_region).map_err(|e| {
            ImgError::Corruption {
                block: 0,
                detail: format!("superblock: {e}"),
            }
        })?;
        superblock
            .validate_geometry()
            .map_err(|e| ImgError::Format(format!("superblock geometry: {e}")))?;
        if superblock.block_size != dev.block_size() {
            return Err(ImgError::Format(format!(
                "device block size {} does not match superblock block size {}",
                dev.block_size(),
                superblock.block_size
            )));
        }

        let geometry = Geometry::from_superblock(&superblock);
        let group_desc = read_group_desc_table(dev.as_ref(), &geometry)?;

        tracing::debug!(
            target: "fsimg::volume",
            block_size = geometry.block_size,
            groups = geometry.group_count,
            total_blocks = geometry.total_blocks,
            "volume_open"
        );

        Ok(Self {
            dev,
            superblock,
            geometry,
            group_desc: Some(group_desc),
            inode_bitmap: None,
            block_bitmap: None,
            inode_cache: InodeCache::new(INODE_CACHE_CAPACITY),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn group_desc(&self) -> Option<&[GroupDesc]> {
        self.group_desc.as_deref()
    }

    /// Starting block of `group`'s inode table.
    pub fn inode_table_loc(&self, group: GroupNumber) -> Result<BlockNumber> {
        let descs = self.group_desc.as_deref().ok_or(ImgError::NoGroupDesc)?;
        let gd = descs.get(group.0 as usize).ok_or_else(|| {
            ImgError::Format(format!(
                "group {group} out of range (volume has {} groups)",
                descs.len()
            ))
        })?;
        Ok(BlockNumber(gd.inode_table))
    }

    // ── Block I/O (block-count units) ───────────────────────────────────

    /// Read `count` consecutive blocks starting at `start` into `buf`.
    pub fn read_blocks(&self, start: BlockNumber, count: usize, buf: &mut [u8]) -> Result<()> {
        self.dev.read_blocks_into(start, count, buf)
    }

    /// Write `count` consecutive blocks starting at `start` from `buf`.
    pub fn write_blocks(&self, start: BlockNumber, count: usize, buf: &[u8]) -> Result<()> {
        self.dev.write_blocks_from(start, count, buf)
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }

    // ── Bitmaps ─────────────────────────────────────────────────────────

    /// The inode allocation bitmap, loading it from the device on first use.
    ///
    /// Covers items `1 ..= inodes_per_group * group_count`.
    pub fn ensure_inode_bitmap(&mut self) -> Result<&mut ItemBitmap> {
        if self.inode_bitmap.is_none() {
            let loaded = self.load_bitmap(BitmapKind::Inode)?;
            self.inode_bitmap = Some(loaded);
        }
        Ok(self.inode_bitmap.as_mut().expect("loaded above"))
    }

    /// The block allocation bitmap, loading it from the device on first use.
    ///
    /// Covers items `first_data_block .. first_data_block +
    /// clusters_per_group * group_count`.
    pub fn ensure_block_bitmap(&mut self) -> Result<&mut ItemBitmap> {
        if self.block_bitmap.is_none() {
            let loaded = self.load_bitmap(BitmapKind::Block)?;
            self.block_bitmap = Some(loaded);
        }
        Ok(self.block_bitmap.as_mut().expect("loaded above"))
    }

    fn load_bitmap(&self, kind: BitmapKind) -> Result<ItemBitmap> {
        let descs = self.group_desc.as_deref().ok_or(ImgError::NoGroupDesc)?;
        let geo = &self.geometry;

        let (start, per_group_bits, per_group_bytes) = match kind {
            BitmapKind::Inode => (
                1_u64,
                u64::from(geo.inodes_per_group),
                geo.inode_bitmap_bytes_per_group(),
            ),
            BitmapKind::Block => (
                u64::from(geo.first_data_block),
                u64::from(geo.clusters_per_group),
                geo.block_bitmap_bytes_per_group(),
            ),
        };

        let count = per_group_bits * u64::from(geo.group_count);
        let mut map = ItemBitmap::new(start, count)?;

        for (idx, gd) in descs.iter().enumerate() {
            let bitmap_block = match kind {
                BitmapKind::Inode => gd.inode_bitmap,
                BitmapKind::Block => gd.block_bitmap,
            };
            if bitmap_block == 0 {
                return Err(ImgError::Corruption {
                    block: 0,
                    detail: format!("group {idx} has no {} bitmap block", kind.name()),
                });
            }
            let raw = self.dev.read_block(BlockNumber(bitmap_block))?;
            let first = start + per_group_bits * idx as u64;
            map.set_range(first, per_group_bits, &raw.as_slice()[..per_group_bytes])?;
        }

        tracing::debug!(
            target: "fsimg::volume",
            kind = kind.name(),
            items = count,
            groups = descs.len(),
            "bitmap_load"
        );
        Ok(map)
    }

    /// Write loaded bitmaps back to their per-group bitmap blocks.
    ///
    /// Bitmaps that were never loaded are left untouched on the device.
    pub fn flush_bitmaps(&mut self) -> Result<()> {
        let descs = self.group_desc.as_deref().ok_or(ImgError::NoGroupDesc)?;
        let geo = &self.geometry;
        let block_size = geo.block_size as usize;

        if let Some(map) = &self.inode_bitmap {
            let per_group_bits = u64::from(geo.inodes_per_group);
            let per_group_bytes = geo.inode_bitmap_bytes_per_group();
            for (idx, gd) in descs.iter().enumerate() {
                let mut block = vec![0_u8; block_size];
                let first = 1 + per_group_bits * idx as u64;
                map.get_range(first, per_group_bits, &mut block[..per_group_bytes])?;
                self.dev.write_block(BlockNumber(gd.inode_bitmap), &block)?;
            }
        }

        if let Some(map) = &self.block_bitmap {
            let per_group_bits = u64::from(geo.clusters_per_group);
            let per_group_bytes = geo.block_bitmap_bytes_per_group();
            for (idx, gd) in descs.iter().enumerate() {
                let mut block = vec![0_u8; block_size];
                let first = u64::from(geo.first_data_block) + per_group_bits * idx as u64;
                map.get_range(first, per_group_bits, &mut block[..per_group_bytes])?;
                self.dev.write_block(BlockNumber(gd.block_bitmap), &block)?;
            }
        }

        Ok(())
    }

    // ── Metadata install / write-back ───────────────────────────────────

    /// Replace the in-memory superblock and descriptor table, re-deriving
    /// geometry.
    ///
    /// Loaded bitmaps and the inode cache are dropped: they were derived
    /// from the previous metadata.
    pub fn install_metadata(&mut self, sb: Superblock, descs: Vec<GroupDesc>) -> Result<()> {
        sb.validate_geometry()
            .map_err(|e| ImgError::Format(format!("superblock geometry: {e}")))?;
        self.geometry = Geometry::from_superblock(&sb);
        self.superblock = sb;
        self.group_desc = Some(descs);
        self.inode_bitmap = None;
        self.block_bitmap = None;
        self.inode_cache.clear();
        Ok(())
    }

    /// Write the in-memory superblock and descriptor table back to the
    /// device.
    pub fn flush_metadata(&mut self) -> Result<()> {
        let descs = self.group_desc.as_deref().ok_or(ImgError::NoGroupDesc)?;
        let geo = &self.geometry;
        let block_size = geo.block_size as usize;

        // Superblock lives at byte offset 1024 regardless of block size:
        // its own block for 1K volumes, the tail of block 0 otherwise.
        let sb_block = BlockNumber((SUPERBLOCK_OFFSET / block_size) as u64);
        let offset_in_block = SUPERBLOCK_OFFSET % block_size;
        let mut block = self.dev.read_block(sb_block)?.into_inner();
        let region = self.superblock.encode_region();
        block[offset_in_block..offset_in_block + SUPERBLOCK_SIZE].copy_from_slice(&region);
        self.dev.write_block(sb_block, &block)?;

        let desc_blocks = geo.desc_blocks() as usize;
        let desc_size = usize::from(geo.desc_size);
        let mut table = vec![0_u8; desc_blocks * block_size];
        for (idx, gd) in descs.iter().enumerate() {
            let offset = idx * desc_size;
            gd.write_to_bytes(&mut table[offset..], geo.desc_size)
                .map_err(|e| ImgError::Format(format!("group descriptor {idx}: {e}")))?;
        }
        self.dev
            .write_blocks_from(geo.gdt_start_block(), desc_blocks, &table)?;

        tracing::debug!(
            target: "fsimg::volume",
            desc_blocks,
            groups = descs.len(),
            "metadata_flush"
        );
        Ok(())
    }

    // ── Inode access ────────────────────────────────────────────────────

    /// Read the raw on-disk record for inode `ino`, via the cache.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        if ino.0 == 0 || ino.0 > u64::from(self.geometry.total_inodes) {
            return Err(ImgError::Format(format!(
                "inode {ino} outside volume range 1..={}",
                self.geometry.total_inodes
            )));
        }
        if let Some(raw) = self.inode_cache.get(ino.0) {
            return Ok(raw);
        }

        let geo = &self.geometry;
        let group = inode_to_group(ino, geo.inodes_per_group);
        let index = inode_index_in_group(ino, geo.inodes_per_group);
        let table = self.inode_table_loc(group)?;
        if table.0 == 0 {
            return Err(ImgError::MissingInodeTable { group: group.0 });
        }

        let byte_offset = u64::from(index) * u64::from(geo.inode_size);
        let block = BlockNumber(table.0 + byte_offset / u64::from(geo.block_size));
        let offset_in_block = usize::try_from(byte_offset % u64::from(geo.block_size))
            .map_err(|_| ImgError::Format("inode offset does not fit usize".to_owned()))?;

        let raw_block = self.dev.read_block(block)?;
        let inode_size = usize::from(geo.inode_size);
        let raw = raw_block.as_slice()[offset_in_block..offset_in_block + inode_size].to_vec();
        self.inode_cache.insert(ino.0, raw.clone());
        Ok(raw)
    }

    /// Drop all cached inode records.
    ///
    /// Must be called after the on-device inode table changes underneath
    /// the handle (e.g. an image restore) so later reads observe the new
    /// data.
    pub fn flush_inode_cache(&self) {
        self.inode_cache.clear();
        tracing::debug!(target: "fsimg::volume", "inode_cache_flush");
    }
}

#[derive(Debug, Clone, Copy)]
enum BitmapKind {
    Inode,
    Block,
}

impl BitmapKind {
    fn name(self) -> &'static str {
        match self {
            Self::Inode => "inode",
            Self::Block => "block",
        }
    }
}

fn read_superblock_region(dev: &dyn BlockDevice) -> Result<[u8; SUPERBLOCK_SIZE]> {
    let block_size = dev.block_size() as usize;
    if block_size < SUPERBLOCK_SIZE {
        return Err(ImgError::Format(format!(
            "device block size {block_size} is below the minimum {SUPERBLOCK_SIZE}"
        )));
    }
    let mut region = [0_u8; SUPERBLOCK_SIZE];

    if block_size == SUPERBLOCK_SIZE {
        // 1K blocks: the superblock occupies block 1 exactly.
        let raw = dev.read_block(BlockNumber((SUPERBLOCK_OFFSET / block_size) as u64))?;
        region.copy_from_slice(&raw.as_slice()[..SUPERBLOCK_SIZE]);
    } else {
        // Larger blocks: the superblock is the tail of block 0.
        let raw = dev.read_block(BlockNumber(0))?;
        region.copy_from_slice(
            &raw.as_slice()[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE],
        );
    }
    Ok(region)
}

fn read_group_desc_table(dev: &dyn BlockDevice, geo: &Geometry) -> Result<Vec<GroupDesc>> {
    let block_size = geo.block_size as usize;
    let desc_blocks = geo.desc_blocks() as usize;
    let desc_size = usize::from(geo.desc_size);

    let mut table = vec![0_u8; desc_blocks * block_size];
    dev.read_blocks_into(geo.gdt_start_block(), desc_blocks, &mut table)?;

    let mut descs = Vec::with_capacity(geo.group_count as usize);
    for idx in 0..geo.group_count as usize {
        let offset = idx * desc_size;
        let gd = GroupDesc::parse_from_bytes(&table[offset..], geo.desc_size).map_err(|e| {
            ImgError::Corruption {
                block: geo.gdt_start_block().0,
                detail: format!("group descriptor {idx}: {e}"),
            }
        })?;
        descs.push(gd);
    }
    Ok(descs)
}
