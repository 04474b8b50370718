//! The `Handle` facade (C9): the crate's single public entry point for
//! opening a VMDK/COWD virtual disk and reading from it.

use std::cell::{Cell, RefCell};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::GrainCache;
use crate::descriptor::{self, DescriptorInfo, DiskType, ExtentValues};
use crate::engine::{self, Whence};
use crate::error::{Error, Result};
use crate::extent::{ExtentKind, ExtentTable, VirtualExtent};
use crate::grain;
use crate::header::{self, ExtentFileInfo};
use crate::pool::{FilePool, StdFilePool};

/// Default grain cache capacity; a few hundred grains, well above the
/// engine's minimum of [`crate::cache::MIN_CAPACITY`].
const DEFAULT_CACHE_CAPACITY: usize = 256;
const HEADER_PROBE_SIZE: usize = 2048;

/// A read-only handle onto a VMDK or COWD virtual disk.
///
/// Internally mutable state (the grain cache, lazily-loaded grain groups,
/// the read cursor, and the attached parent) lives behind `RefCell`/`Cell`
/// so a `Handle` can be shared via `Arc` and still serve as a parent for
/// differencing-disk reads, per the single-threaded cooperative
/// concurrency model this crate assumes.
pub struct Handle {
    descriptor: DescriptorInfo,
    media_size: u64,
    extent_table: RefCell<ExtentTable>,
    grain_cache: RefCell<GrainCache>,
    file_pool: RefCell<Box<dyn FilePool>>,
    parent: RefCell<Option<Arc<Handle>>>,
    current_offset: Cell<u64>,
    abort: AtomicBool,
}

impl Handle {
    /// Opens a virtual disk rooted at `path`, resolving sibling extent
    /// files relative to its parent directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut pool = StdFilePool::new();
        let root_handle = pool.open(path)?;

        let descriptor_text = read_descriptor_text(&mut pool, root_handle, path)?;
        let descriptor = descriptor::parse_descriptor(&descriptor_text)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut handles = Vec::with_capacity(descriptor.extents.len());
        for extent in &descriptor.extents {
            let handle = match &extent.filename {
                Some(name) => pool.open(sibling_path(base_dir, name))?,
                None => u32::MAX, // Zero extents carry no file.
            };
            handles.push(handle);
        }

        let extent_table = build_extent_table(&descriptor, &mut pool, &handles)?;
        Self::finish(descriptor, extent_table, pool)
    }

    /// Opens a virtual disk from a descriptor already parsed by the caller
    /// and a pre-built [`FilePool`] whose handle IDs line up, in order, with
    /// `descriptor.extents`.
    pub fn open_with_file_pool(
        descriptor_text: &str,
        mut pool: impl FilePool + 'static,
        extent_handles: Vec<u32>,
    ) -> Result<Self> {
        let descriptor = descriptor::parse_descriptor(descriptor_text)?;
        let extent_table = build_extent_table(&descriptor, &mut pool, &extent_handles)?;
        Self::finish(descriptor, extent_table, pool)
    }

    fn finish(descriptor: DescriptorInfo, extent_table: ExtentTable, pool: impl FilePool + 'static) -> Result<Self> {
        let media_size = extent_table.media_size();
        Ok(Handle {
            descriptor,
            media_size,
            extent_table: RefCell::new(extent_table),
            grain_cache: RefCell::new(GrainCache::new(DEFAULT_CACHE_CAPACITY)),
            file_pool: RefCell::new(Box::new(pool) as Box<dyn FilePool>),
            parent: RefCell::new(None),
            current_offset: Cell::new(0),
            abort: AtomicBool::new(false),
        })
    }

    /// Attaches `parent` as the handle used to resolve sparse holes in this
    /// disk. Cross-checks `parent.content_identifier()` against this
    /// descriptor's declared `parentCID`; a mismatch is [`Error::InconsistentParent`].
    pub fn set_parent(&self, parent: Arc<Handle>) -> Result<()> {
        let expected = self.descriptor.parent_content_identifier.unwrap_or(0xFFFF_FFFF);
        let found = parent.content_identifier();
        if expected != 0xFFFF_FFFF && expected != found {
            return Err(Error::InconsistentParent { expected, found });
        }
        *self.parent.borrow_mut() = Some(parent);
        Ok(())
    }

    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub fn disk_type(&self) -> &DiskType {
        &self.descriptor.disk_type
    }

    pub fn content_identifier(&self) -> u32 {
        self.descriptor.content_identifier
    }

    pub fn parent_content_identifier(&self) -> Option<u32> {
        self.descriptor.parent_content_identifier
    }

    pub fn parent_filename(&self) -> Option<&str> {
        self.descriptor.parent_filename.as_deref()
    }

    /// UTF-16 code units of the parent filename, mirroring the paired
    /// UTF-8/UTF-16 accessors a descriptor's `parentFileNameHint` is exposed
    /// through.
    pub fn parent_filename_utf16(&self) -> Option<Vec<u16>> {
        self.descriptor
            .parent_filename
            .as_deref()
            .map(|s| s.encode_utf16().collect())
    }

    pub fn number_of_extents(&self) -> usize {
        self.descriptor.extents.len()
    }

    pub fn extent_descriptor(&self, index: usize) -> Option<&ExtentValues> {
        self.descriptor.extents.get(index)
    }

    pub fn offset(&self) -> u64 {
        self.current_offset.get()
    }

    /// Requests cooperative cancellation of any read in progress. The
    /// engine observes this between grain-sized chunks and clears it
    /// itself once observed, so the handle remains usable afterward.
    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Positional read; does not move [`Handle::offset`].
    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let mut extent_table = self.extent_table.borrow_mut();
        let mut grain_cache = self.grain_cache.borrow_mut();
        let mut file_pool = self.file_pool.borrow_mut();
        let parent = self.parent.borrow();

        engine::read_at(
            dst,
            offset,
            self.media_size,
            &mut extent_table,
            &mut grain_cache,
            &mut *file_pool,
            parent.as_ref(),
            self.descriptor.parent_content_identifier,
            &self.abort,
        )
    }

    /// Reads at the current cursor and advances it by the number of bytes
    /// actually read. Exposed to callers through `impl Read for Handle`
    /// (`read_at` is the name-collision-free positional equivalent).
    fn read_stream(&self, dst: &mut [u8]) -> Result<usize> {
        let offset = self.current_offset.get();
        let n = self.read_at(dst, offset)?;
        self.current_offset.set(offset + n as u64);
        Ok(n)
    }

    /// Moves the read cursor. Exposed to callers through `impl Seek for Handle`.
    fn seek_cursor(&self, whence: Whence, delta: i64) -> u64 {
        let new_offset = engine::seek(self.current_offset.get(), self.media_size, whence, delta);
        self.current_offset.set(new_offset);
        new_offset
    }

    /// Drops the handle, closing every extent file it owns. Any attached
    /// parent is left open; its lifetime is the caller's responsibility.
    pub fn close(self) {}
}

fn sibling_path(base_dir: &Path, filename: &str) -> PathBuf {
    base_dir.join(filename)
}

/// Builds the extent table from a parsed descriptor and handles already
/// opened (in descriptor order) in `pool`; `handles[i] == u32::MAX` for
/// `Zero` extents, which carry no backing file.
fn build_extent_table(descriptor: &DescriptorInfo, pool: &mut dyn FilePool, handles: &[u32]) -> Result<ExtentTable> {
    let mut rows = Vec::with_capacity(descriptor.extents.len());

    for (i, extent) in descriptor.extents.iter().enumerate() {
        let handle = handles[i];
        match crate::extent::extent_kind_for(extent.extent_type) {
            ExtentKind::Zero => rows.push((VirtualExtent::Zero, extent.size)),
            ExtentKind::Flat => rows.push((
                VirtualExtent::Flat {
                    file_handle: handle,
                    file_offset: extent.offset_in_file,
                },
                extent.size,
            )),
            ExtentKind::Sparse => {
                let info = read_extent_header(pool, handle)?;
                let size = info.maximum_data_size_bytes;
                let groups = grain::load_grain_directory(pool, handle, &info, rows.len())?;
                rows.push((
                    VirtualExtent::Sparse {
                        file_handle: handle,
                        extent_file_info: info,
                        grain_groups: groups,
                    },
                    size,
                ));
            }
        }
    }

    Ok(ExtentTable::build(rows))
}

fn read_extent_header(pool: &mut dyn FilePool, handle: u32) -> Result<ExtentFileInfo> {
    let size = pool.size(handle)?;
    let n = size.min(HEADER_PROBE_SIZE as u64) as usize;
    let mut buf = vec![0u8; n];
    pool.read_at(handle, 0, &mut buf)?;
    header::parse_header(&buf)
}

/// Reads the descriptor text for the file opened as `root_handle`: either
/// recovered from an embedded region of a VMDK sparse header, or the whole
/// file if it looks like a standalone descriptor.
fn read_descriptor_text(pool: &mut dyn FilePool, root_handle: u32, path: &Path) -> Result<String> {
    let size = pool.size(root_handle)?;
    let probe_len = size.min(HEADER_PROBE_SIZE as u64) as usize;
    let mut probe = vec![0u8; probe_len];
    pool.read_at(root_handle, 0, &mut probe)?;

    if probe.len() >= 4 && &probe[0..4] == header::VMDK_SIGNATURE {
        let info = header::parse_vmdk_sparse_header(&probe)
            .map_err(|_| Error::unsupported_format("VMDK signature present but header is malformed"))?;
        if info.descriptor_size_bytes == 0 {
            return Err(Error::unsupported_format(
                "VMDK sparse file carries no embedded descriptor and is not a standalone descriptor",
            ));
        }
        let mut text_buf = vec![0u8; info.descriptor_size_bytes as usize];
        pool.read_at(root_handle, info.descriptor_offset_bytes, &mut text_buf)?;
        let end = text_buf.iter().position(|&b| b == 0).unwrap_or(text_buf.len());
        return String::from_utf8(text_buf[..end].to_vec())
            .map_err(|_| Error::malformed_descriptor(0, "embedded descriptor is not valid UTF-8"));
    }

    if probe.first() == Some(&b'#') || probe.starts_with(b"version=") {
        return String::from_utf8(probe)
            .map_err(|_| Error::malformed_descriptor(0, "descriptor text is not valid UTF-8"));
    }

    Err(Error::unsupported_format(format!(
        "{} is neither a VMDK/COWD sparse extent file nor a text descriptor",
        path.display()
    )))
}

impl io::Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_stream(buf).map_err(Into::into)
    }
}

impl io::Seek for Handle {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (whence, delta) = match pos {
            io::SeekFrom::Start(n) => (Whence::Start, n as i64),
            io::SeekFrom::Current(n) => (Whence::Current, n),
            io::SeekFrom::End(n) => (Whence::End, n),
        };
        Ok(self.seek_cursor(whence, delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_open_minimal_flat_disk() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "disk.flat", &[0xABu8; 10 * 1024 * 1024]);
        let descriptor = format!(
            "# Disk DescriptorFile\nversion=1\nCID=1\nparentCID=ffffffff\ncreateType=\"monolithicFlat\"\n\n# Extent description\nRW 20480 FLAT \"disk.flat\" 0\n"
        );
        let descriptor_path = write_file(dir.path(), "disk.vmdk", descriptor.as_bytes());

        let handle = Handle::open(&descriptor_path).unwrap();
        assert_eq!(handle.media_size(), 20480 * 512);

        let mut buf = [0u8; 4096];
        let n = handle.read_at(&mut buf, 0).unwrap();
        assert_eq!(n, 4096);
        assert!(buf.iter().all(|&b| b == 0xAB));

        let mut tail = [0u8; 8];
        let n = handle.read_at(&mut tail, 10 * 1024 * 1024 - 3).unwrap();
        assert_eq!(n, 3);
        assert!(tail[..3].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_parent_filename_utf8_and_utf16_views() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "disk-s001.vmdk", &[0u8; 512]);
        let descriptor = "# Disk DescriptorFile\nversion=1\nCID=1\nparentCID=ffffffff\ncreateType=\"monolithicFlat\"\nparentFileNameHint=\"base.vmdk\"\n\n# Extent description\nRW 1 FLAT \"disk-s001.vmdk\" 0\n";
        let descriptor_path = write_file(dir.path(), "disk.vmdk", descriptor.as_bytes());

        let handle = Handle::open(&descriptor_path).unwrap();
        assert_eq!(handle.parent_filename(), Some("base.vmdk"));
        assert_eq!(
            handle.parent_filename_utf16(),
            Some("base.vmdk".encode_utf16().collect::<Vec<u16>>())
        );
    }

    #[test]
    fn test_seek_and_stream_read_advance_cursor() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "disk.flat", &[0x11u8; 4096]);
        let descriptor = "# Disk DescriptorFile\nversion=1\nCID=1\nparentCID=ffffffff\ncreateType=\"monolithicFlat\"\n\n# Extent description\nRW 8 FLAT \"disk.flat\" 0\n";
        let descriptor_path = write_file(dir.path(), "disk.vmdk", descriptor.as_bytes());

        let mut handle = Handle::open(&descriptor_path).unwrap();
        use std::io::{Read, Seek, SeekFrom};
        handle.seek(SeekFrom::Start(10)).unwrap();
        let mut buf = [0u8; 5];
        let n = handle.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(handle.offset(), 15);
    }
}
