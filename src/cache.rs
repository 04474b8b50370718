//! The grain cache (C7): a bounded LRU of fully decompressed grain
//! payloads, keyed by `(extent_index, group_index, slot_index)`.

use std::collections::HashMap;
use std::io::Read;

use flate2::bufread::DeflateDecoder;

use crate::error::{Error, Result};
use crate::grain::{GrainSlot, SlotKind};
use crate::pool::FilePool;

/// Minimum cache capacity, per the read engine's requirement that a
/// sequential read crossing a group boundary never evicts a grain still
/// needed by the same read.
pub const MIN_CAPACITY: usize = 8;

const GRAIN_MARKER_HEADER_SIZE: u64 = 12;
const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrainKey {
    pub extent_index: usize,
    pub group_index: u32,
    pub slot_index: u32,
}

/// Bounded least-recently-used cache of decoded grain payloads.
///
/// Single-threaded: all mutation happens inline inside a `Handle`'s
/// `read_at`, so no internal locking is needed.
pub struct GrainCache {
    capacity: usize,
    entries: HashMap<GrainKey, Vec<u8>>,
    order: Vec<GrainKey>,
}

impl GrainCache {
    /// `capacity` is clamped up to [`MIN_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(MIN_CAPACITY),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn touch(&mut self, key: GrainKey) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push(key);
    }

    fn insert(&mut self, key: GrainKey, payload: Vec<u8>) {
        self.entries.insert(key, payload);
        self.touch(key);
        while self.entries.len() > self.capacity {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
        }
    }

    /// Returns the decoded grain for `key`, loading and decompressing it
    /// from `pool` on a cache miss. `slot` must not be [`SlotKind::Sparse`];
    /// sparse slots are handled by the read engine directly and never enter
    /// the cache. `maximum_data_size_bytes` and `extent_index` are only used
    /// to validate a compressed grain's header and to give diagnostic
    /// context to any `CorruptGrain` error.
    pub fn get_or_load(
        &mut self,
        key: GrainKey,
        slot: &GrainSlot,
        grain_size: u64,
        maximum_data_size_bytes: u64,
        extent_index: usize,
        pool: &mut dyn FilePool,
    ) -> Result<&[u8]> {
        if !self.entries.contains_key(&key) {
            let payload = load_grain(slot, grain_size, maximum_data_size_bytes, extent_index, pool)?;
            self.insert(key, payload);
        } else {
            self.touch(key);
        }
        Ok(self.entries.get(&key).unwrap())
    }
}

fn load_grain(
    slot: &GrainSlot,
    grain_size: u64,
    maximum_data_size_bytes: u64,
    extent_index: usize,
    pool: &mut dyn FilePool,
) -> Result<Vec<u8>> {
    match slot.kind {
        SlotKind::Sparse => unreachable!("sparse slots are never cached"),
        SlotKind::Standard => {
            let mut buf = vec![0u8; grain_size as usize];
            pool.read_at(slot.file_handle, slot.offset, &mut buf)?;
            Ok(buf)
        }
        SlotKind::Compressed => {
            load_compressed_grain(slot, grain_size, maximum_data_size_bytes, extent_index, pool)
        }
    }
}

fn load_compressed_grain(
    slot: &GrainSlot,
    grain_size: u64,
    maximum_data_size_bytes: u64,
    extent_index: usize,
    pool: &mut dyn FilePool,
) -> Result<Vec<u8>> {
    let mut marker = [0u8; GRAIN_MARKER_HEADER_SIZE as usize];
    pool.read_at(slot.file_handle, slot.offset, &mut marker)?;

    let lba_sectors = u64::from_le_bytes(marker[0..8].try_into().unwrap());
    if lba_sectors != slot.expected_lba_sectors {
        return Err(Error::corrupt_grain(
            extent_index,
            slot.offset,
            format!(
                "grain header lba {lba_sectors} does not match expected lba {}",
                slot.expected_lba_sectors
            ),
        ));
    }

    let compressed_size = u32::from_le_bytes(marker[8..12].try_into().unwrap()) as usize;
    if compressed_size == 0 {
        return Err(Error::malformed_grain_stream(
            slot.offset,
            "grain marker has zero compressed_size where a data grain was expected",
        ));
    }

    let mut compressed = vec![0u8; compressed_size];
    pool.read_at(slot.file_handle, slot.offset + GRAIN_MARKER_HEADER_SIZE, &mut compressed)?;

    let mut decoder = DeflateDecoder::new(compressed.as_slice());
    let mut payload = Vec::with_capacity(grain_size as usize);
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| Error::corrupt_grain(extent_index, slot.offset, format!("deflate decode failed: {e}")))?;

    if payload.len() > grain_size as usize {
        return Err(Error::corrupt_grain(
            extent_index,
            slot.offset,
            format!("decompressed grain is {} bytes, expected at most {grain_size}", payload.len()),
        ));
    }
    if payload.len() < grain_size as usize {
        let lba_bytes = slot.expected_lba_sectors * SECTOR_SIZE;
        let is_final_grain = lba_bytes + grain_size >= maximum_data_size_bytes;
        if !is_final_grain {
            return Err(Error::corrupt_grain(
                extent_index,
                slot.offset,
                format!(
                    "decompressed grain is {} bytes, expected exactly {grain_size}",
                    payload.len()
                ),
            ));
        }
        let mut padded = vec![0u8; grain_size as usize];
        let start = grain_size as usize - payload.len();
        padded[start..].copy_from_slice(&payload);
        payload = padded;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FakePool(Vec<u8>);
    impl FilePool for FakePool {
        fn size(&self, _handle: u32) -> Result<u64> {
            Ok(self.0.len() as u64)
        }
        fn read_at(&mut self, _handle: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
            let offset = offset as usize;
            if offset + buf.len() > self.0.len() {
                return Err(Error::OutOfBounds {
                    offset: offset as u64,
                    media_size: self.0.len() as u64,
                });
            }
            buf.copy_from_slice(&self.0[offset..offset + buf.len()]);
            Ok(())
        }
        fn is_open(&self, _handle: u32) -> bool {
            true
        }
    }

    fn standard_slot(offset: u64) -> GrainSlot {
        GrainSlot {
            file_handle: 0,
            offset,
            size: 512,
            kind: SlotKind::Standard,
            expected_lba_sectors: 0,
        }
    }

    #[test]
    fn test_standard_grain_loads_and_caches() {
        let mut disk = vec![0xABu8; 512];
        disk.extend(vec![0xCDu8; 512]);
        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(4);
        let key = GrainKey {
            extent_index: 0,
            group_index: 0,
            slot_index: 0,
        };
        let grain = cache
            .get_or_load(key, &standard_slot(0), 512, 1024, 0, &mut pool)
            .unwrap();
        assert_eq!(grain.len(), 512);
        assert!(grain.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_eviction_respects_capacity() {
        let disk = vec![0u8; 4096];
        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(MIN_CAPACITY);
        for i in 0..(MIN_CAPACITY + 2) {
            let key = GrainKey {
                extent_index: 0,
                group_index: 0,
                slot_index: i as u32,
            };
            cache
                .get_or_load(key, &standard_slot(0), 512, 4096, 0, &mut pool)
                .unwrap();
        }
        assert_eq!(cache.entries.len(), MIN_CAPACITY);
        let oldest = GrainKey {
            extent_index: 0,
            group_index: 0,
            slot_index: 0,
        };
        assert!(!cache.entries.contains_key(&oldest));
    }

    fn compressed_disk_and_slot(lba_sectors: u64, raw: &[u8]) -> (Vec<u8>, GrainSlot) {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut disk = Vec::new();
        disk.extend_from_slice(&lba_sectors.to_le_bytes());
        disk.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        disk.extend_from_slice(&compressed);

        let slot = GrainSlot {
            file_handle: 0,
            offset: 0,
            size: 0,
            kind: SlotKind::Compressed,
            expected_lba_sectors: lba_sectors,
        };
        (disk, slot)
    }

    #[test]
    fn test_compressed_grain_roundtrip() {
        let raw = vec![0x42u8; 512];
        let (disk, slot) = compressed_disk_and_slot(0, &raw);

        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(MIN_CAPACITY);
        let key = GrainKey {
            extent_index: 0,
            group_index: 0,
            slot_index: 0,
        };
        let grain = cache.get_or_load(key, &slot, 512, 512, 0, &mut pool).unwrap();
        assert_eq!(grain, raw.as_slice());
    }

    #[test]
    fn test_compressed_grain_lba_mismatch_is_corrupt() {
        let raw = vec![0x42u8; 512];
        let (disk, mut slot) = compressed_disk_and_slot(0, &raw);
        slot.expected_lba_sectors = 7; // disk actually carries lba=0

        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(MIN_CAPACITY);
        let key = GrainKey {
            extent_index: 2,
            group_index: 0,
            slot_index: 0,
        };
        let err = cache.get_or_load(key, &slot, 512, 512, 2, &mut pool).unwrap_err();
        assert!(matches!(err, Error::CorruptGrain { extent_index: 2, .. }));
    }

    #[test]
    fn test_short_final_grain_is_zero_padded() {
        let raw = vec![0x7Fu8; 300]; // shorter than grain_size
        let (disk, slot) = compressed_disk_and_slot(0, &raw);

        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(MIN_CAPACITY);
        let key = GrainKey {
            extent_index: 0,
            group_index: 0,
            slot_index: 0,
        };
        // lba 0 + grain_size 512 >= maximum_data_size_bytes 512: this is the final grain.
        let grain = cache.get_or_load(key, &slot, 512, 512, 0, &mut pool).unwrap();
        assert_eq!(grain.len(), 512);
        assert!(grain[..212].iter().all(|&b| b == 0));
        assert_eq!(&grain[212..], raw.as_slice());
    }

    #[test]
    fn test_short_non_final_grain_is_corrupt() {
        let raw = vec![0x7Fu8; 300];
        let (disk, slot) = compressed_disk_and_slot(0, &raw);

        let mut pool = FakePool(disk);
        let mut cache = GrainCache::new(MIN_CAPACITY);
        let key = GrainKey {
            extent_index: 0,
            group_index: 0,
            slot_index: 0,
        };
        // maximum_data_size_bytes is far beyond this grain: not the final grain.
        let err = cache
            .get_or_load(key, &slot, 512, 1_000_000, 0, &mut pool)
            .unwrap_err();
        assert!(matches!(err, Error::CorruptGrain { .. }));
    }
}
