//! Packed-bit allocation bitmap keyed by 64-bit item numbers.
//!
//! An [`ItemBitmap`] covers a contiguous item range `[start, start+count)`
//! (inode numbers or block/cluster numbers) with one bit per item, LSB-first
//! within each byte — the same packing the on-disk bitmap blocks use, so
//! range transfers against an image are plain byte moves when the range is
//! byte-aligned.

use fsimg_error::{ImgError, Result};

/// Get bit `idx` from a packed bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a packed bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: usize) {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a packed bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: usize) {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// One bit per allocatable item over the range `[start, start + count)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBitmap {
    start: u64,
    count: u64,
    bits: Vec<u8>,
}

impl ItemBitmap {
    /// Create an all-clear bitmap covering `count` items from `start`.
    pub fn new(start: u64, count: u64) -> Result<Self> {
        let bytes = usize::try_from(count.div_ceil(8))
            .map_err(|_| ImgError::Format("bitmap size does not fit usize".to_owned()))?;
        Ok(Self {
            start,
            count,
            bits: vec![0_u8; bytes],
        })
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    fn index_of(&self, item: u64) -> Result<usize> {
        if item < self.start || item >= self.start + self.count {
            return Err(ImgError::Format(format!(
                "item {item} outside bitmap range {}..{}",
                self.start,
                self.start + self.count
            )));
        }
        usize::try_from(item - self.start)
            .map_err(|_| ImgError::Format("bitmap index does not fit usize".to_owned()))
    }

    /// Whether `item` is flagged.
    pub fn test(&self, item: u64) -> Result<bool> {
        Ok(bitmap_get(&self.bits, self.index_of(item)?))
    }

    /// Flag `item`.
    pub fn mark(&mut self, item: u64) -> Result<()> {
        let idx = self.index_of(item)?;
        bitmap_set(&mut self.bits, idx);
        Ok(())
    }

    /// Unflag `item`.
    pub fn unmark(&mut self, item: u64) -> Result<()> {
        let idx = self.index_of(item)?;
        bitmap_clear(&mut self.bits, idx);
        Ok(())
    }

    fn check_range(&self, first: u64, nbits: u64) -> Result<u64> {
        if first < self.start {
            return Err(ImgError::Format(format!(
                "range start {first} precedes bitmap start {}",
                self.start
            )));
        }
        let rel = first - self.start;
        let end = rel
            .checked_add(nbits)
            .ok_or_else(|| ImgError::Format("bitmap range overflows u64".to_owned()))?;
        if end > self.count {
            return Err(ImgError::Format(format!(
                "range {first}+{nbits} exceeds bitmap end {}",
                self.start + self.count
            )));
        }
        Ok(rel)
    }

    /// Pack `nbits` bits starting at item `first` into `out`, LSB-first.
    ///
    /// `out` must hold at least `nbits.div_ceil(8)` bytes; trailing bits of
    /// the final byte are cleared.
    pub fn get_range(&self, first: u64, nbits: u64, out: &mut [u8]) -> Result<()> {
        let rel = self.check_range(first, nbits)?;
        let needed = usize::try_from(nbits.div_ceil(8))
            .map_err(|_| ImgError::Format("range size does not fit usize".to_owned()))?;
        if out.len() < needed {
            return Err(ImgError::Format(format!(
                "range buffer too small: got={} need={needed}",
                out.len()
            )));
        }

        out[..needed].fill(0);

        // Byte-aligned ranges move whole bytes; the imaging paths always
        // land here because group sizes are multiples of 8.
        if rel % 8 == 0 && nbits % 8 == 0 {
            let src = usize::try_from(rel / 8)
                .map_err(|_| ImgError::Format("range offset does not fit usize".to_owned()))?;
            out[..needed].copy_from_slice(&self.bits[src..src + needed]);
            return Ok(());
        }

        for i in 0..nbits {
            let idx = usize::try_from(rel + i)
                .map_err(|_| ImgError::Format("range offset does not fit usize".to_owned()))?;
            if bitmap_get(&self.bits, idx) {
                #[expect(clippy::cast_possible_truncation)] // i < nbits <= out bits
                bitmap_set(out, i as usize);
            }
        }
        Ok(())
    }

    /// Unpack `nbits` bits from `src` into the bitmap starting at item
    /// `first`, LSB-first.
    pub fn set_range(&mut self, first: u64, nbits: u64, src: &[u8]) -> Result<()> {
        let rel = self.check_range(first, nbits)?;
        let needed = usize::try_from(nbits.div_ceil(8))
            .map_err(|_| ImgError::Format("range size does not fit usize".to_owned()))?;
        if src.len() < needed {
            return Err(ImgError::Format(format!(
                "range buffer too small: got={} need={needed}",
                src.len()
            )));
        }

        if rel % 8 == 0 && nbits % 8 == 0 {
            let dst = usize::try_from(rel / 8)
                .map_err(|_| ImgError::Format("range offset does not fit usize".to_owned()))?;
            self.bits[dst..dst + needed].copy_from_slice(&src[..needed]);
            return Ok(());
        }

        for i in 0..nbits {
            let idx = usize::try_from(rel + i)
                .map_err(|_| ImgError::Format("range offset does not fit usize".to_owned()))?;
            #[expect(clippy::cast_possible_truncation)] // i < nbits <= src bits
            if bitmap_get(src, i as usize) {
                bitmap_set(&mut self.bits, idx);
            } else {
                bitmap_clear(&mut self.bits, idx);
            }
        }
        Ok(())
    }

    /// Items flagged in the whole bitmap.
    #[must_use]
    pub fn count_marked(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mark_test_unmark() {
        let mut bm = ItemBitmap::new(1, 64).unwrap();
        assert!(!bm.test(1).unwrap());
        bm.mark(1).unwrap();
        bm.mark(64).unwrap();
        assert!(bm.test(1).unwrap());
        assert!(bm.test(64).unwrap());
        assert_eq!(bm.count_marked(), 2);
        bm.unmark(1).unwrap();
        assert!(!bm.test(1).unwrap());
    }

    #[test]
    fn rejects_items_outside_range() {
        let mut bm = ItemBitmap::new(10, 16).unwrap();
        assert!(bm.test(9).is_err());
        assert!(bm.test(26).is_err());
        assert!(bm.mark(26).is_err());
        assert!(bm.test(10).is_ok());
        assert!(bm.test(25).is_ok());
    }

    #[test]
    fn range_round_trip_aligned() {
        let mut bm = ItemBitmap::new(1, 128).unwrap();
        for item in [1_u64, 2, 9, 17, 64, 128] {
            bm.mark(item).unwrap();
        }

        let mut packed = [0_u8; 16];
        bm.get_range(1, 128, &mut packed).unwrap();
        // item 1 is bit 0 of byte 0
        assert_eq!(packed[0] & 0b0000_0011, 0b0000_0011);

        let mut restored = ItemBitmap::new(1, 128).unwrap();
        restored.set_range(1, 128, &packed).unwrap();
        assert_eq!(restored, bm);
    }

    #[test]
    fn range_round_trip_unaligned() {
        let mut bm = ItemBitmap::new(0, 64).unwrap();
        bm.mark(3).unwrap();
        bm.mark(5).unwrap();
        bm.mark(11).unwrap();

        // Pull an unaligned window [3, 3+9).
        let mut packed = [0_u8; 2];
        bm.get_range(3, 9, &mut packed).unwrap();
        assert!(bitmap_get(&packed, 0)); // item 3
        assert!(bitmap_get(&packed, 2)); // item 5
        assert!(bitmap_get(&packed, 8)); // item 11
        assert!(!bitmap_get(&packed, 1));

        let mut restored = ItemBitmap::new(0, 64).unwrap();
        restored.set_range(3, 9, &packed).unwrap();
        for item in [3_u64, 5, 11] {
            assert!(restored.test(item).unwrap());
        }
        assert_eq!(restored.count_marked(), 3);
    }

    #[test]
    fn set_range_clears_previously_set_bits() {
        let mut bm = ItemBitmap::new(0, 16).unwrap();
        for item in 0..16 {
            bm.mark(item).unwrap();
        }
        bm.set_range(0, 16, &[0_u8; 2]).unwrap();
        assert_eq!(bm.count_marked(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn get_set_range_round_trips(
            start in 0_u64..64,
            marked in proptest::collection::btree_set(0_u64..2048, 0..128),
        ) {
            let count = 2048_u64;
            let mut bm = ItemBitmap::new(start, count).unwrap();
            for &item in &marked {
                bm.mark(start + item).unwrap();
            }

            let mut packed = vec![0_u8; (count as usize).div_ceil(8)];
            bm.get_range(start, count, &mut packed).unwrap();

            let mut restored = ItemBitmap::new(start, count).unwrap();
            restored.set_range(start, count, &packed).unwrap();
            prop_assert_eq!(&restored, &bm);
            prop_assert_eq!(restored.count_marked(), marked.len() as u64);
        }
    }
}
