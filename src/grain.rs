//! The grain index (C6): lazily loads the two-level grain directory/grain
//! table structure backing a sparse extent and resolves a byte offset
//! within the extent to the on-disk slot that holds it.

use crate::error::{Error, Result};
use crate::header::ExtentFileInfo;
use crate::pool::FilePool;

const DIRECTORY_ENTRY_SIZE: u64 = 4;
const TABLE_ENTRY_SIZE: u64 = 4;
const SECTOR_SIZE: u64 = 512;

/// How a resolved [`GrainSlot`] should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Not backed by any on-disk grain; reads as zero.
    Sparse,
    /// Raw, uncompressed grain data of exactly `grain_size` bytes.
    Standard,
    /// A compressed grain; its real size is carried by a per-grain header
    /// read at the slot's file offset, not known until that header is read.
    Compressed,
}

/// A single resolved grain-table entry.
#[derive(Debug, Clone, Copy)]
pub struct GrainSlot {
    pub file_handle: u32,
    pub offset: u64,
    pub size: u32,
    pub kind: SlotKind,
    /// Virtual sector number this slot's grain covers. Meaningless for
    /// [`SlotKind::Sparse`]; for [`SlotKind::Compressed`] it is cross-checked
    /// against the `lba` field of the grain's own on-disk header.
    pub expected_lba_sectors: u64,
}

/// A deferred-load block of `grain_table_entries` [`GrainSlot`]s. Once
/// loaded a group stays pinned for the handle's lifetime; only decoded
/// grain payloads are evictable (see [`crate::cache`]).
#[derive(Debug)]
pub enum GrainGroup {
    /// Known to exist at `dir_offset_bytes` (the grain table's own file
    /// offset), or entirely sparse if `dir_offset_bytes == 0`.
    Unloaded { dir_offset_bytes: u64 },
    Loaded(Vec<GrainSlot>),
}

/// Reads the primary (and, if present, secondary) grain directory for a
/// sparse extent and returns one [`GrainGroup::Unloaded`] per directory
/// entry.
pub fn load_grain_directory(
    pool: &mut dyn FilePool,
    file_handle: u32,
    info: &ExtentFileInfo,
    extent_index: usize,
) -> Result<Vec<GrainGroup>> {
    let entries = info.grain_directory_entries();
    let primary = read_directory(pool, file_handle, info.primary_gd_offset_bytes, entries)?;

    if info.has_secondary_grain_directory() {
        let secondary = read_directory(pool, file_handle, info.secondary_gd_offset_bytes, entries)?;
        for (i, (p, s)) in primary.iter().zip(secondary.iter()).enumerate() {
            if *p != 0 && *s != 0 && *p != *s {
                log::warn!(
                    "inconsistent grain directory in extent {extent_index}, entry {i}: primary={p}, secondary={s}; using primary"
                );
            }
        }
    }

    Ok(primary
        .into_iter()
        .map(|entry| GrainGroup::Unloaded {
            dir_offset_bytes: entry * SECTOR_SIZE,
        })
        .collect())
}

fn read_directory(
    pool: &mut dyn FilePool,
    file_handle: u32,
    offset_bytes: u64,
    entries: u64,
) -> Result<Vec<u64>> {
    if offset_bytes == 0 || entries == 0 {
        return Ok(vec![0; entries as usize]);
    }
    let mut buf = vec![0u8; (entries * DIRECTORY_ENTRY_SIZE) as usize];
    pool.read_at(file_handle, offset_bytes, &mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as u64)
        .collect())
}

/// Loads the grain table for a single group, turning its raw directory
/// entries into resolved [`GrainSlot`]s. `group_index` is the group's
/// position within the extent's grain directory, needed to compute each
/// slot's expected virtual LBA (`(group_index * grain_table_entries +
/// slot_index) * grain_size_sectors`).
pub fn load_grain_table(
    pool: &mut dyn FilePool,
    file_handle: u32,
    info: &ExtentFileInfo,
    dir_offset_bytes: u64,
    group_index: u32,
) -> Result<Vec<GrainSlot>> {
    let grain_size_sectors = info.grain_size_bytes / SECTOR_SIZE;
    let group_base_sector = group_index as u64 * info.grain_table_entries as u64 * grain_size_sectors;

    if dir_offset_bytes == 0 {
        return Ok(vec![
            GrainSlot {
                file_handle,
                offset: 0,
                size: 0,
                kind: SlotKind::Sparse,
                expected_lba_sectors: 0,
            };
            info.grain_table_entries as usize
        ]);
    }

    let mut buf = vec![0u8; info.grain_table_entries as usize * TABLE_ENTRY_SIZE as usize];
    pool.read_at(file_handle, dir_offset_bytes, &mut buf)?;

    let compressed = info.has_grain_compression();
    Ok(buf
        .chunks_exact(4)
        .enumerate()
        .map(|(slot_index, c)| {
            let entry = u32::from_le_bytes(c.try_into().unwrap()) as u64;
            let expected_lba_sectors = group_base_sector + slot_index as u64 * grain_size_sectors;
            if entry == 0 {
                GrainSlot {
                    file_handle,
                    offset: 0,
                    size: 0,
                    kind: SlotKind::Sparse,
                    expected_lba_sectors,
                }
            } else if compressed {
                GrainSlot {
                    file_handle,
                    offset: entry * SECTOR_SIZE,
                    size: 0,
                    kind: SlotKind::Compressed,
                    expected_lba_sectors,
                }
            } else {
                GrainSlot {
                    file_handle,
                    offset: entry * SECTOR_SIZE,
                    size: info.grain_size_bytes as u32,
                    kind: SlotKind::Standard,
                    expected_lba_sectors,
                }
            }
        })
        .collect())
}

/// Computes `(group_index, slot_index, offset_in_grain)` for a byte offset
/// relative to the start of its extent.
pub fn locate(info: &ExtentFileInfo, offset_in_extent: u64) -> (u32, u32, u64) {
    let grain_size = info.grain_size_bytes;
    let group_span = info.grain_table_entries as u64 * grain_size;
    let group_index = (offset_in_extent / group_span) as u32;
    let offset_in_group = offset_in_extent % group_span;
    let slot_index = (offset_in_group / grain_size) as u32;
    let offset_in_grain = offset_in_group % grain_size;
    (group_index, slot_index, offset_in_grain)
}

/// Resolves a byte offset within a sparse extent to its [`GrainSlot`],
/// lazily loading the group it falls into if this is the first touch.
/// `extent_index` is only used as diagnostic context for any `CorruptGrain`
/// error raised here.
pub fn resolve(
    pool: &mut dyn FilePool,
    file_handle: u32,
    info: &ExtentFileInfo,
    groups: &mut [GrainGroup],
    offset_in_extent: u64,
    extent_index: usize,
) -> Result<(GrainSlot, u64)> {
    let (group_index, slot_index, offset_in_grain) = locate(info, offset_in_extent);
    let group = groups.get_mut(group_index as usize).ok_or_else(|| {
        Error::corrupt_grain(extent_index, offset_in_extent, "offset resolves outside the grain directory")
    })?;

    let slots = match group {
        GrainGroup::Loaded(slots) => slots,
        GrainGroup::Unloaded { dir_offset_bytes } => {
            let loaded = load_grain_table(pool, file_handle, info, *dir_offset_bytes, group_index)?;
            *group = GrainGroup::Loaded(loaded);
            match group {
                GrainGroup::Loaded(slots) => slots,
                GrainGroup::Unloaded { .. } => unreachable!(),
            }
        }
    };

    let slot = slots.get(slot_index as usize).copied().ok_or_else(|| {
        Error::corrupt_grain(extent_index, offset_in_extent, "slot index outside grain table")
    })?;
    Ok((slot, offset_in_grain))
}
