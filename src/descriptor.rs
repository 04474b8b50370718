//! The textual descriptor parser (C2 value table + C3 descriptor parser).
//!
//! A descriptor is a small text format made of three sections: a header of
//! `key=value` pairs, an extent list, and a disk-database of `ddb.*`
//! key/value pairs. It is carried either as a standalone file or embedded in
//! the header region of a monolithic/stream-optimized VMDK sparse extent
//! (see [`crate::header`]).
//!
//! See also: https://github.com/libyal/libvmdk/blob/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const HEADER_SIGNATURE: &str = "# Disk DescriptorFile";
const EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DDB_SECTION_SIGNATURE: &str = "# The Disk Data Base";

const NO_PARENT: u32 = 0xffff_ffff;

/// Encoding tag applied to descriptor text fields (`filename`, `parentFileNameHint`).
///
/// See also: https://github.com/libyal/libvmdk/blame/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#211-encodings
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub enum Encoding {
    #[serde(rename = "UTF-8")]
    Utf8,
    #[serde(rename = "Big5")]
    Big5,
    #[serde(rename = "GBK")]
    Gbk,
    #[serde(rename = "Shift_JIS")]
    ShiftJis,
    #[serde(rename = "windows-1252")]
    Windows1252,
}

/// Access mode declared for an extent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentAccess {
    NoAccess,
    RdOnly,
    Rw,
}

/// Extent carrier type, as declared in the descriptor's extent line.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentType {
    Flat,
    Vmfs,
    Sparse,
    VmfsSparse,
    Zero,
    VmfsRaw,
    VmfsRdm,
}

impl ExtentType {
    /// Whether this extent type belongs to the "flat family" (direct byte
    /// segments) as opposed to the "sparse family" (grain-indexed).
    ///
    /// `Zero` is compatible with either family: it never reads any bytes.
    pub fn is_sparse_family(self) -> bool {
        matches!(self, ExtentType::Sparse | ExtentType::VmfsSparse)
    }

    pub fn is_flat_family(self) -> bool {
        matches!(self, ExtentType::Flat | ExtentType::Vmfs | ExtentType::VmfsRaw | ExtentType::VmfsRdm)
    }
}

/// Disk type as declared by `createType`.
///
/// See also: https://github.com/libyal/libvmdk/blame/main/documentation/VMWare%20Virtual%20Disk%20Format%20(VMDK).asciidoc#212-disk-type
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub enum DiskType {
    #[serde(rename = "2GbMaxExtentFlat")]
    TwoGbMaxExtentFlat,
    #[serde(rename = "twoGbMaxExtentFlat")]
    TwoGbMaxExtentFlatAlt,
    #[serde(rename = "2GbMaxExtentSparse")]
    TwoGbMaxExtentSparse,
    #[serde(rename = "twoGbMaxExtentSparse")]
    TwoGbMaxExtentSparseAlt,
    Custom,
    FullDevice,
    MonolithicFlat,
    MonolithicSparse,
    PartitionedDevice,
    StreamOptimized,
    Vmfs,
    VmfsEagerZeroedThick,
    VmfsPreallocated,
    VmfsRaw,
    #[serde(rename = "vmfsRDM")]
    VmfsRawDeviceMap,
    #[serde(rename = "vmfsRDMP")]
    VmfsPassthroughRawDeviceMap,
    VmfsSparse,
    VmfsThin,
}

/// One line of the descriptor's extent section.
#[derive(Debug, Clone)]
pub struct ExtentValues {
    pub access: ExtentAccess,
    pub extent_type: ExtentType,
    /// Mandatory unless `extent_type == Zero`.
    pub filename: Option<String>,
    /// Size in bytes (the descriptor records it in 512-byte sectors).
    pub size: u64,
    /// Start offset of this extent's data within its file, in bytes (0 for sparse).
    pub offset_in_file: u64,
}

static EXTENT_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\w+)\s+(\d+)\s+(\w+)\s*(?:"([^"]*)"|'([^']*)'|([\w\-\.\/]+))?\s*(\d+)?\s*$"#).unwrap()
});

impl FromStr for ExtentValues {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let captures = EXTENT_LINE_REGEX
            .captures(s)
            .ok_or_else(|| format!("invalid extent line: {s}"))?;

        let access_str = serde_json::Value::String(captures.get(1).unwrap().as_str().to_string());
        let access: ExtentAccess = serde_json::from_value(access_str)
            .map_err(|_| format!("invalid access mode: {}", captures.get(1).unwrap().as_str()))?;

        let sector_count: u64 = captures
            .get(2)
            .unwrap()
            .as_str()
            .parse()
            .map_err(|_| format!("invalid sector count: {}", captures.get(2).unwrap().as_str()))?;

        let extent_type_str =
            serde_json::Value::String(captures.get(3).unwrap().as_str().to_string());
        let extent_type: ExtentType = serde_json::from_value(extent_type_str)
            .map_err(|_| format!("invalid extent type: {}", captures.get(3).unwrap().as_str()))?;

        let filename = captures
            .get(4)
            .or_else(|| captures.get(5))
            .or_else(|| captures.get(6))
            .map(|m| m.as_str().to_string());
        if filename.is_none() && extent_type != ExtentType::Zero {
            return Err(format!("extent line missing filename: {s}"));
        }

        let offset_sectors: u64 = match captures.get(7) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| format!("invalid offset: {}", m.as_str()))?,
            None => 0,
        };

        Ok(ExtentValues {
            access,
            extent_type,
            filename,
            size: sector_count * 512,
            offset_in_file: offset_sectors * 512,
        })
    }
}

/// A fully parsed descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorInfo {
    pub content_identifier: u32,
    pub parent_content_identifier: Option<u32>,
    pub disk_type: DiskType,
    pub parent_filename: Option<String>,
    pub media_size: u64,
    pub version: u32,
    pub encoding: Option<Encoding>,
    pub extents: Vec<ExtentValues>,
    /// Verbatim `ddb.*` key/value pairs; never interpreted by the read path.
    pub disk_database: BTreeMap<String, String>,
}

fn section_of(line: &str) -> Option<&'static str> {
    if !line.starts_with('#') {
        return None;
    }
    match line {
        HEADER_SIGNATURE => Some("header"),
        EXTENT_SECTION_SIGNATURE => Some("extent"),
        DDB_SECTION_SIGNATURE => Some("ddb"),
        _ => None,
    }
}

static KEY_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([\w\.]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|(.*?))\s*$"#).unwrap()
});

fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let captures = KEY_VALUE_REGEX.captures(line)?;
    let value = captures
        .get(2)
        .or_else(|| captures.get(3))
        .or_else(|| captures.get(4))
        .unwrap();
    Some((captures.get(1).unwrap().as_str(), value.as_str()))
}

/// Parses a complete descriptor text, either standalone or recovered from an
/// embedded sparse-header descriptor region.
pub fn parse_descriptor(text: &str) -> Result<DescriptorInfo> {
    let mut header: BTreeMap<String, (usize, String)> = BTreeMap::new();
    let mut extents = Vec::new();
    let mut disk_database: BTreeMap<String, String> = BTreeMap::new();
    let mut section = "";

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line.trim());
        if line.is_empty() {
            continue;
        }
        if let Some(found) = section_of(line) {
            section = found;
            continue;
        }
        if line.starts_with('#') {
            // Unrecognized comment/banner; ignore.
            continue;
        }
        match section {
            "header" => {
                if let Some((k, v)) = parse_key_value(line) {
                    header.insert(k.to_string(), (line_no + 1, v.to_string()));
                } else {
                    return Err(Error::malformed_descriptor(
                        line_no + 1,
                        format!("expected key=value, found: {line}"),
                    ));
                }
            }
            "extent" => {
                let extent: ExtentValues = line
                    .parse()
                    .map_err(|e| Error::malformed_descriptor(line_no + 1, e))?;
                if let Some(first) = extents.first().map(|e: &ExtentValues| e.extent_type) {
                    let compatible = first.is_sparse_family() == extent.extent_type.is_sparse_family()
                        || extent.extent_type == ExtentType::Zero
                        || first == ExtentType::Zero;
                    if !compatible {
                        return Err(Error::malformed_descriptor(
                            line_no + 1,
                            "mixing incompatible extent types within one disk",
                        ));
                    }
                }
                extents.push(extent);
            }
            "ddb" => {
                if let Some((k, v)) = parse_key_value(line) {
                    disk_database.insert(k.to_string(), v.to_string());
                }
            }
            _ => {}
        }
    }

    let version = match header.get("version") {
        Some((line, v)) => v
            .parse()
            .map_err(|_| Error::malformed_descriptor(*line, "invalid version"))?,
        None => 1,
    };

    let encoding = match header.get("encoding") {
        Some((line, s)) => Some(
            serde_json::from_value(serde_json::Value::String(s.clone()))
                .map_err(|_| Error::malformed_descriptor(*line, format!("invalid encoding: {s}")))?,
        ),
        None => None,
    };

    let content_identifier = match header.get("CID") {
        Some((line, s)) => {
            u32::from_str_radix(s, 16).map_err(|_| Error::malformed_descriptor(*line, "invalid CID"))?
        }
        None => 0,
    };

    let parent_content_identifier = match header.get("parentCID") {
        Some((line, s)) => Some(
            u32::from_str_radix(s, 16).map_err(|_| Error::malformed_descriptor(*line, "invalid parentCID"))?,
        ),
        None => None,
    };

    let (_, create_type_str) = header
        .get("createType")
        .ok_or_else(|| Error::malformed_descriptor(0, "missing createType"))?;
    let disk_type: DiskType =
        serde_json::from_value(serde_json::Value::String(create_type_str.clone()))
            .unwrap_or(DiskType::Custom);

    let parent_filename = header.get("parentFileNameHint").map(|(_, v)| v.clone());
    if let Some(cid) = parent_content_identifier {
        if cid != NO_PARENT && parent_filename.is_none() {
            return Err(Error::MissingParent {
                content_identifier: cid,
            });
        }
    }

    let media_size = extents.iter().map(|e| e.size).sum();

    Ok(DescriptorInfo {
        content_identifier,
        parent_content_identifier,
        disk_type,
        parent_filename,
        media_size,
        version,
        encoding,
        extents,
        disk_database,
    })
}

fn strip_comment(line: &str) -> &str {
    // Trailing comments are only meaningful outside quoted strings; since no
    // descriptor value in practice contains an unescaped '#', a plain split
    // is sufficient and matches the on-disk format's own informal grammar.
    if line.starts_with('#') {
        return line;
    }
    match line.find('#') {
        Some(idx) => line[..idx].trim_end(),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value_pair() {
        assert_eq!(parse_key_value("key1 = value1"), Some(("key1", "value1")));
        assert_eq!(
            parse_key_value("key3 = \"with quotes\""),
            Some(("key3", "with quotes"))
        );
        assert_eq!(
            parse_key_value("key.with.periods = aaa"),
            Some(("key.with.periods", "aaa"))
        );
        assert_eq!(parse_key_value("key4"), None);
    }

    #[test]
    fn test_parse_minimal_flat_descriptor() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=123a5678
parentCID=ffffffff
createType="monolithicFlat"

# Extent description
RW 20480 FLAT "disk.flat" 0

# The Disk Data Base
#DDB

ddb.adapterType = "ide"
"#;
        let d = parse_descriptor(text).unwrap();
        assert_eq!(d.content_identifier, 0x123a5678);
        assert_eq!(d.parent_content_identifier, Some(0xffffffff));
        assert_eq!(d.disk_type, DiskType::MonolithicFlat);
        assert_eq!(d.media_size, 20480 * 512);
        assert_eq!(d.extents.len(), 1);
        let extent = &d.extents[0];
        assert_eq!(extent.access, ExtentAccess::Rw);
        assert_eq!(extent.extent_type, ExtentType::Flat);
        assert_eq!(extent.filename.as_deref(), Some("disk.flat"));
        assert_eq!(d.disk_database.get("ddb.adapterType").unwrap(), "ide");
    }

    #[test]
    fn test_zero_extent_needs_no_filename() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=1
parentCID=ffffffff
createType="2GbMaxExtentSparse"

# Extent description
RW 4192256 ZERO
"#;
        let d = parse_descriptor(text).unwrap();
        assert_eq!(d.extents[0].extent_type, ExtentType::Zero);
        assert!(d.extents[0].filename.is_none());
    }

    #[test]
    fn test_missing_parent_file_name_hint_errors() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=1
parentCID=12345678
createType="monolithicSparse"

# Extent description
RW 2048 SPARSE "disk-s001.vmdk"
"#;
        let err = parse_descriptor(text).unwrap_err();
        assert!(matches!(err, Error::MissingParent { content_identifier: 0x12345678 }));
    }

    #[test]
    fn test_descriptor_parse_is_deterministic() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=deadbeef
parentCID=ffffffff
createType="monolithicFlat"

# Extent description
RW 100 FLAT "a.flat"
"#;
        let a = parse_descriptor(text).unwrap();
        let b = parse_descriptor(text).unwrap();
        assert_eq!(a.content_identifier, b.content_identifier);
        assert_eq!(a.media_size, b.media_size);
        assert_eq!(a.extents.len(), b.extents.len());
    }

    #[test]
    fn test_single_quoted_values_are_accepted() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=1
parentCID=ffffffff
createType='monolithicFlat'

# Extent description
RW 100 FLAT 'disk.flat'
"#;
        let d = parse_descriptor(text).unwrap();
        assert_eq!(d.disk_type, DiskType::MonolithicFlat);
        assert_eq!(d.extents[0].filename.as_deref(), Some("disk.flat"));
    }

    #[test]
    fn test_malformed_cid_reports_its_own_line() {
        let text = "# Disk DescriptorFile\nversion=1\nCID=not-hex\nparentCID=ffffffff\ncreateType=\"monolithicFlat\"\n\n# Extent description\nRW 100 FLAT \"disk.flat\"\n";
        let err = parse_descriptor(text).unwrap_err();
        match err {
            Error::MalformedDescriptor { line, .. } => assert_eq!(line, 3),
            other => panic!("expected MalformedDescriptor, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_extent_types_rejected() {
        let text = r#"
# Disk DescriptorFile
version=1
CID=1
parentCID=ffffffff
createType="custom"

# Extent description
RW 100 FLAT "a.flat"
RW 100 SPARSE "b.vmdk"
"#;
        assert!(parse_descriptor(text).is_err());
    }
}
