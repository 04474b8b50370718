//! The read engine (C8): walks the extent table and grain index to service
//! positional reads, falling back to zero-fill or a parent handle for
//! sparse holes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{GrainCache, GrainKey};
use crate::error::Result;
use crate::extent::{ExtentTable, VirtualExtent};
use crate::grain;
use crate::pool::FilePool;

/// Reads up to `dst.len()` bytes starting at `offset` into `dst`, walking
/// extents and (for sparse ones) grains as needed. Does not move any
/// cursor. Returns the number of bytes actually written, which is less than
/// `dst.len()` only at end-of-media or on abort.
#[allow(clippy::too_many_arguments)]
pub fn read_at(
    dst: &mut [u8],
    offset: u64,
    media_size: u64,
    extent_table: &mut ExtentTable,
    grain_cache: &mut GrainCache,
    file_pool: &mut dyn FilePool,
    parent: Option<&Arc<super::handle::Handle>>,
    parent_content_identifier: Option<u32>,
    abort: &AtomicBool,
) -> Result<usize> {
    if offset >= media_size || dst.is_empty() {
        return Ok(0);
    }

    let want = dst.len().min((media_size - offset) as usize);
    let mut written = 0usize;
    let mut cursor = offset;

    while written < want {
        // Swapping (rather than loading) clears the flag as part of
        // observing it, so the handle is usable again on the next call
        // without requiring a separate "clear abort" API.
        if abort.swap(false, Ordering::Relaxed) {
            break;
        }

        let (ext_idx, off_in_ext) = match extent_table.extent_at(cursor) {
            Some(v) => v,
            None => {
                return Err(crate::error::Error::OutOfBounds {
                    offset: cursor,
                    media_size,
                })
            }
        };
        let ext_size = extent_table.size_of(ext_idx);
        let remaining_in_call = (want - written) as u64;
        let remaining_in_extent = ext_size - off_in_ext;
        let chunk = remaining_in_call.min(remaining_in_extent) as usize;

        match extent_table.extent_mut(ext_idx) {
            VirtualExtent::Flat { file_handle, file_offset } => {
                let fh = *file_handle;
                let fo = *file_offset;
                file_pool.read_at(fh, fo + off_in_ext, &mut dst[written..written + chunk])?;
            }
            VirtualExtent::Zero => {
                dst[written..written + chunk].fill(0);
            }
            VirtualExtent::Sparse {
                file_handle,
                extent_file_info,
                grain_groups,
            } => {
                let fh = *file_handle;
                let info = extent_file_info.clone();
                let (slot, offset_in_grain) =
                    grain::resolve(file_pool, fh, &info, grain_groups, off_in_ext, ext_idx)?;
                let grain_chunk = ((info.grain_size_bytes - offset_in_grain) as usize).min(chunk);

                if slot.kind == grain::SlotKind::Sparse {
                    match (parent, parent_content_identifier) {
                        (Some(parent), _) => {
                            let got = parent.read_at(&mut dst[written..written + grain_chunk], cursor)?;
                            if got < grain_chunk {
                                dst[written + got..written + grain_chunk].fill(0);
                            }
                        }
                        (None, Some(cid)) if cid != 0xFFFF_FFFF => {
                            return Err(crate::error::Error::MissingParent { content_identifier: cid });
                        }
                        _ => {
                            dst[written..written + grain_chunk].fill(0);
                        }
                    }
                } else {
                    let (group_index, slot_index, _) = grain::locate(&info, off_in_ext);
                    let key = GrainKey {
                        extent_index: ext_idx,
                        group_index,
                        slot_index,
                    };
                    let grain = grain_cache.get_or_load(
                        key,
                        &slot,
                        info.grain_size_bytes,
                        info.maximum_data_size_bytes,
                        ext_idx,
                        file_pool,
                    )?;
                    let start = offset_in_grain as usize;
                    dst[written..written + grain_chunk].copy_from_slice(&grain[start..start + grain_chunk]);
                }

                written += grain_chunk;
                cursor += grain_chunk as u64;
                continue;
            }
        }

        written += chunk;
        cursor += chunk as u64;
    }

    Ok(written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Computes a new absolute offset from `current`, `media_size`, `whence`
/// and `delta`. Negative results are clamped to 0; there is no upper bound
/// (seeking past the end is legal, reads there just return 0).
pub fn seek(current: u64, media_size: u64, whence: Whence, delta: i64) -> u64 {
    let base: i128 = match whence {
        Whence::Start => 0,
        Whence::Current => current as i128,
        Whence::End => media_size as i128,
    };
    (base + delta as i128).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_from_start() {
        assert_eq!(seek(500, 1000, Whence::Start, 10), 10);
    }

    #[test]
    fn test_seek_from_current() {
        assert_eq!(seek(500, 1000, Whence::Current, 10), 510);
        assert_eq!(seek(500, 1000, Whence::Current, -10), 490);
    }

    #[test]
    fn test_seek_from_end_past_media_size_is_allowed() {
        assert_eq!(seek(0, 1000, Whence::End, 100), 1100);
    }

    #[test]
    fn test_seek_clamps_negative_to_zero() {
        assert_eq!(seek(0, 1000, Whence::Start, -5), 0);
    }
}
