#![forbid(unsafe_code)]
//! On-disk metadata codecs.
//!
//! [`Superblock`] and [`GroupDesc`] decode from and encode to the on-disk
//! little-endian layout. In-memory structs always hold native-order
//! integers; the codec boundary is the single place byte-order conversion
//! happens, so no in-place swapping of shared structures is ever needed and
//! images are portable across host architectures.

use fsimg_types::{
    ParseError, SUPERBLOCK_SIZE, SUPER_MAGIC, ensure_slice, read_fixed, read_le_u16, read_le_u32,
    trim_nul_padded, write_bytes, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

fn log_from_block_size(block_size: u32) -> u32 {
    block_size.trailing_zeros().saturating_sub(10)
}

/// Write an ASCII label into a NUL-padded fixed-size field.
///
/// Oversized labels are truncated to the field width.
fn encode_nul_padded(out: &mut [u8], offset: usize, width: usize, label: &str) -> Result<(), ParseError> {
    let mut field = vec![0_u8; width];
    let bytes = label.as_bytes();
    let take = bytes.len().min(width);
    field[..take].copy_from_slice(&bytes[..take]);
    write_bytes(out, offset, &field)
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock: the fixed-size root metadata record of a volume.
///
/// Multi-byte integers are stored little-endian on disk regardless of host
/// order; [`Superblock::parse_from_bytes`] and [`Superblock::encode_into`]
/// are exact inverses over the modeled fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub reserved_blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── State & lifecycle ────────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub mkfs_time: u32,
}

impl Superblock {
    /// Parse a superblock from a 1024-byte on-disk region.
    pub fn parse_from_bytes(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);

        let r_blocks_lo = u64::from(read_le_u32(region, 0x08)?);
        let r_blocks_hi = u64::from(read_le_u32(region, 0x154)?);

        let free_blocks_lo = u64::from(read_le_u32(region, 0x0C)?);
        let free_blocks_hi = u64::from(read_le_u32(region, 0x158)?);

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size",
            });
        }

        let log_cluster_size = read_le_u32(region, 0x1C)?;
        let Some(cluster_size) = block_size_from_log(log_cluster_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_cluster_size",
                reason: "invalid shift",
            });
        };

        Ok(Self {
            // Core geometry
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            reserved_blocks_count: r_blocks_lo | (r_blocks_hi << 32),
            free_blocks_count: free_blocks_lo | (free_blocks_hi << 32),
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            cluster_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            clusters_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            first_ino: read_le_u32(region, 0x54)?,
            desc_size: read_le_u16(region, 0xFE)?,

            // Identity
            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            // Revision & OS
            rev_level: read_le_u32(region, 0x4C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            // Features
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,

            // State & lifecycle
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,
            mkfs_time: read_le_u32(region, 0x108)?,
        })
    }

    /// Encode this superblock into the first [`SUPERBLOCK_SIZE`] bytes of
    /// `out`, little-endian. Bytes of `out` not covered by a modeled field
    /// are left untouched, so callers pass a zeroed region.
    #[expect(clippy::cast_possible_truncation)] // lo/hi splits are deliberate
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }

        write_le_u32(out, 0x00, self.inodes_count)?;
        write_le_u32(out, 0x04, self.blocks_count as u32)?;
        write_le_u32(out, 0x150, (self.blocks_count >> 32) as u32)?;
        write_le_u32(out, 0x08, self.reserved_blocks_count as u32)?;
        write_le_u32(out, 0x154, (self.reserved_blocks_count >> 32) as u32)?;
        write_le_u32(out, 0x0C, self.free_blocks_count as u32)?;
        write_le_u32(out, 0x158, (self.free_blocks_count >> 32) as u32)?;
        write_le_u32(out, 0x10, self.free_inodes_count)?;
        write_le_u32(out, 0x14, self.first_data_block)?;
        write_le_u32(out, 0x18, log_from_block_size(self.block_size))?;
        write_le_u32(out, 0x1C, log_from_block_size(self.cluster_size))?;
        write_le_u32(out, 0x20, self.blocks_per_group)?;
        write_le_u32(out, 0x24, self.clusters_per_group)?;
        write_le_u32(out, 0x28, self.inodes_per_group)?;
        write_le_u16(out, 0x58, self.inode_size)?;
        write_le_u32(out, 0x54, self.first_ino)?;
        write_le_u16(out, 0xFE, self.desc_size)?;

        write_le_u16(out, 0x38, self.magic)?;
        write_bytes(out, 0x68, &self.uuid)?;
        encode_nul_padded(out, 0x78, 16, &self.volume_name)?;
        encode_nul_padded(out, 0x88, 64, &self.last_mounted)?;

        write_le_u32(out, 0x4C, self.rev_level)?;
        write_le_u16(out, 0x3E, self.minor_rev_level)?;
        write_le_u32(out, 0x48, self.creator_os)?;

        write_le_u32(out, 0x5C, self.feature_compat)?;
        write_le_u32(out, 0x60, self.feature_incompat)?;
        write_le_u32(out, 0x64, self.feature_ro_compat)?;

        write_le_u16(out, 0x3A, self.state)?;
        write_le_u16(out, 0x3C, self.errors)?;
        write_le_u16(out, 0x34, self.mnt_count)?;
        write_le_u16(out, 0x36, self.max_mnt_count)?;
        write_le_u32(out, 0x2C, self.mtime)?;
        write_le_u32(out, 0x30, self.wtime)?;
        write_le_u32(out, 0x40, self.lastcheck)?;
        write_le_u32(out, 0x44, self.checkinterval)?;
        write_le_u32(out, 0x108, self.mkfs_time)?;

        Ok(())
    }

    /// Encode into a fresh zero-filled 1024-byte region.
    #[must_use]
    pub fn encode_region(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut region = [0_u8; SUPERBLOCK_SIZE];
        self.encode_into(&mut region)
            .expect("region is exactly SUPERBLOCK_SIZE");
        region
    }

    /// Size of each group descriptor (32 or 64 bytes).
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.desc_size >= 64 { 64 } else { 32 }
    }

    /// Number of block groups described by this superblock.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // group count fits u32 on disk
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        data_blocks.div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    /// Validate the structural parameters the imaging layer depends on.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be non-zero",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be a non-zero multiple of 8",
            });
        }
        if self.clusters_per_group == 0 || self.clusters_per_group % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "s_clusters_per_group",
                reason: "must be a non-zero multiple of 8",
            });
        }
        if !matches!(self.group_desc_size(), 32 | 64) {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be 32 or 64",
            });
        }
        if self.inode_size == 0 || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must not exceed block size",
            });
        }
        Ok(())
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

/// Parsed group descriptor: per-group locations of the bitmaps and inode
/// table plus free-space accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub itable_unused: u32,
    pub flags: u16,
    pub checksum: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size_usize = usize::from(desc_size);
        if desc_size_usize < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        if bytes.len() < desc_size_usize {
            return Err(ParseError::InsufficientData {
                needed: desc_size_usize,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;
        let itable_unused_lo = u32::from(read_le_u16(bytes, 0x1C)?);
        let checksum = read_le_u16(bytes, 0x1E)?;

        if desc_size_usize >= 64 {
            let block_bitmap_hi = u64::from(read_le_u32(bytes, 0x20)?);
            let inode_bitmap_hi = u64::from(read_le_u32(bytes, 0x24)?);
            let inode_table_hi = u64::from(read_le_u32(bytes, 0x28)?);

            let free_blocks_hi = u32::from(read_le_u16(bytes, 0x2C)?);
            let free_inodes_hi = u32::from(read_le_u16(bytes, 0x2E)?);
            let used_dirs_hi = u32::from(read_le_u16(bytes, 0x30)?);
            let itable_unused_hi = u32::from(read_le_u16(bytes, 0x32)?);

            Ok(Self {
                block_bitmap: block_bitmap_lo | (block_bitmap_hi << 32),
                inode_bitmap: inode_bitmap_lo | (inode_bitmap_hi << 32),
                inode_table: inode_table_lo | (inode_table_hi << 32),
                free_blocks_count: free_blocks_lo | (free_blocks_hi << 16),
                free_inodes_count: free_inodes_lo | (free_inodes_hi << 16),
                used_dirs_count: used_dirs_lo | (used_dirs_hi << 16),
                itable_unused: itable_unused_lo | (itable_unused_hi << 16),
                flags,
                checksum,
            })
        } else {
            Ok(Self {
                block_bitmap: block_bitmap_lo,
                inode_bitmap: inode_bitmap_lo,
                inode_table: inode_table_lo,
                free_blocks_count: free_blocks_lo,
                free_inodes_count: free_inodes_lo,
                used_dirs_count: used_dirs_lo,
                itable_unused: itable_unused_lo,
                flags,
                checksum,
            })
        }
    }

    /// Encode this descriptor into the first `desc_size` bytes of `bytes`,
    /// little-endian.
    #[expect(clippy::cast_possible_truncation)] // lo/hi splits are deliberate
    pub fn write_to_bytes(&self, bytes: &mut [u8], desc_size: u16) -> Result<(), ParseError> {
        let desc_size_usize = usize::from(desc_size);
        if desc_size_usize < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        // Probe the full span up front so a short buffer never takes a
        // partial encode.
        ensure_slice(bytes, 0, desc_size_usize)?;

        write_le_u32(bytes, 0x00, self.block_bitmap as u32)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap as u32)?;
        write_le_u32(bytes, 0x08, self.inode_table as u32)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count as u16)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count as u16)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count as u16)?;
        write_le_u16(bytes, 0x12, self.flags)?;
        write_le_u16(bytes, 0x1C, self.itable_unused as u16)?;
        write_le_u16(bytes, 0x1E, self.checksum)?;

        if desc_size_usize >= 64 {
            write_le_u32(bytes, 0x20, (self.block_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x24, (self.inode_bitmap >> 32) as u32)?;
            write_le_u32(bytes, 0x28, (self.inode_table >> 32) as u32)?;
            write_le_u16(bytes, 0x2C, (self.free_blocks_count >> 16) as u16)?;
            write_le_u16(bytes, 0x2E, (self.free_inodes_count >> 16) as u16)?;
            write_le_u16(bytes, 0x30, (self.used_dirs_count >> 16) as u16)?;
            write_le_u16(bytes, 0x32, (self.itable_unused >> 16) as u16)?;
        }

        Ok(())
    }
}
