//! Scan-chain map, packed scan images and bit-level value extraction.
//!
//! The scan map is produced by the RTL toolchain: an ordered list of named
//! bit ranges over the design's single scan chain, optionally with reset
//! values, enum member names, and mappings from reset-time DPI functions to
//! the scan ranges their results patch. The packed scan image is LSB-first
//! within each byte, ascending byte addresses.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::codec::{self, FieldReader, FieldWriter, Records};
use crate::error::{HostError, HostResult};

pub const SCAN_MAP_MAGIC: [u8; 4] = *b"LMSM";
pub const SCAN_MAP_VERSION: u32 = 1;

/// Stable record tags of the scan-map container.
mod tag {
    pub const CHAIN_LENGTH: u32 = 1;
    pub const VARIABLE: u32 = 2;
    pub const RESET_DPI: u32 = 3;
    pub const INITIAL_IMAGE: u32 = 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMember {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanVariable {
    pub name: String,
    pub hdl_path: String,
    /// Bit offset into the scan chain.
    pub offset: u32,
    pub width: u32,
    pub reset_value: Option<u64>,
    pub enum_members: Vec<EnumMember>,
}

impl ScanVariable {
    /// The declared enum member name for `value`, if any.
    pub fn member_name(&self, value: u64) -> Option<&str> {
        self.enum_members.iter().find(|m| m.value == value).map(|m| m.name.as_str())
    }
}

/// A reset-time DPI function whose result patches a scan range before the
/// initial image is scanned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetDpiMapping {
    pub func_id: u32,
    pub scan_offset: u32,
    pub scan_width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanMap {
    /// Total chain length in bits.
    pub chain_length: u32,
    pub variables: Vec<ScanVariable>,
    pub reset_dpi: Vec<ResetDpiMapping>,
    /// Packed initial image, if the toolchain embedded one.
    pub initial_image: Option<Vec<u8>>,
}

impl ScanMap {
    pub fn load(path: &Path) -> HostResult<ScanMap> {
        let file = File::open(path)
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
        ScanMap::decode(&mut BufReader::new(file))
    }

    pub fn save(&self, path: &Path) -> HostResult<()> {
        let file = File::create(path)
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
        let mut w = BufWriter::new(file);
        self.encode(&mut w)
            .and_then(|()| w.flush())
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        codec::write_header(w, SCAN_MAP_MAGIC, SCAN_MAP_VERSION)?;
        codec::write_record(w, tag::CHAIN_LENGTH, &self.chain_length.to_le_bytes())?;
        for var in &self.variables {
            let mut f = FieldWriter::new();
            f.string(&var.name)
                .string(&var.hdl_path)
                .u32(var.offset)
                .u32(var.width)
                .u8(var.reset_value.is_some() as u8)
                .u64(var.reset_value.unwrap_or(0))
                .u32(var.enum_members.len() as u32);
            for m in &var.enum_members {
                f.string(&m.name).u64(m.value);
            }
            codec::write_record(w, tag::VARIABLE, &f.finish())?;
        }
        for m in &self.reset_dpi {
            let payload =
                FieldWriter::new().u32(m.func_id).u32(m.scan_offset).u32(m.scan_width).finish();
            codec::write_record(w, tag::RESET_DPI, &payload)?;
        }
        if let Some(image) = &self.initial_image {
            codec::write_record(w, tag::INITIAL_IMAGE, image)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> HostResult<ScanMap> {
        let version = codec::read_header(r, SCAN_MAP_MAGIC, "scan map")?;
        if version != SCAN_MAP_VERSION {
            return Err(HostError::InvalidArg(format!("scan map: unknown version {version}")));
        }
        let mut map = ScanMap::default();
        let mut records = Records::new(r, "scan map");
        while let Some((tag, payload)) = records.next()? {
            let mut f = FieldReader::new(&payload, "scan map");
            match tag {
                tag::CHAIN_LENGTH => map.chain_length = f.u32()?,
                tag::VARIABLE => {
                    let name = f.string()?;
                    let hdl_path = f.string()?;
                    let offset = f.u32()?;
                    let width = f.u32()?;
                    let has_reset = f.u8()? != 0;
                    let reset_raw = f.u64()?;
                    let n_members = f.u32()?;
                    let mut enum_members = Vec::with_capacity(n_members as usize);
                    for _ in 0..n_members {
                        let name = f.string()?;
                        let value = f.u64()?;
                        enum_members.push(EnumMember { name, value });
                    }
                    map.variables.push(ScanVariable {
                        name,
                        hdl_path,
                        offset,
                        width,
                        reset_value: has_reset.then_some(reset_raw),
                        enum_members,
                    });
                }
                tag::RESET_DPI => {
                    map.reset_dpi.push(ResetDpiMapping {
                        func_id: f.u32()?,
                        scan_offset: f.u32()?,
                        scan_width: f.u32()?,
                    });
                }
                tag::INITIAL_IMAGE => map.initial_image = Some(payload.clone()),
                _ => {} // unknown record from a newer toolchain
            }
        }
        Ok(map)
    }

    /// Whether `func_id` is bound to a reset-time scan patch.
    pub fn is_reset_dpi(&self, func_id: u32) -> bool {
        self.reset_dpi.iter().any(|m| m.func_id == func_id)
    }
}

/// Number of 32-bit words holding a chain of `chain_length` bits.
pub fn chain_words(chain_length: u32) -> usize {
    (chain_length as usize + 31) / 32
}

/// Value of the bits at positions `[offset, offset + width)` of the raw
/// scan words, LSB-first. Widths beyond 64 are capped at 64.
pub fn extract_bits(words: &[u32], offset: u32, width: u32) -> u64 {
    let width = width.min(64);
    let mut value = 0u64;
    for i in 0..width {
        let bit = (offset + i) as usize;
        let word = bit / 32;
        if word >= words.len() {
            break;
        }
        let b = (words[word] >> (bit % 32)) & 1;
        value |= u64::from(b) << i;
    }
    value
}

/// Overwrites bits `[offset, offset + width)` of a packed image with the
/// low bits of `value`; image bits above bit 63 of the range are cleared.
pub fn patch_bits(image: &mut [u8], offset: u32, width: u32, value: u64) {
    for i in 0..width {
        let bit = (offset + i) as usize;
        let byte = bit / 8;
        if byte >= image.len() {
            break;
        }
        let mask = 1u8 << (bit % 8);
        if i < 64 && (value >> i) & 1 != 0 {
            image[byte] |= mask;
        } else {
            image[byte] &= !mask;
        }
    }
}

/// Expands a packed image into the word layout of the scan data window.
pub fn image_to_words(image: &[u8], chain_length: u32) -> Vec<u32> {
    let mut words = vec![0u32; chain_words(chain_length)];
    for (i, byte) in image.iter().enumerate() {
        let word = i / 4;
        if word >= words.len() {
            break;
        }
        words[word] |= u32::from(*byte) << (8 * (i % 4));
    }
    words
}

/// Packs scan data words back into the byte image, trimmed to the chain.
pub fn words_to_image(words: &[u32], chain_length: u32) -> Vec<u8> {
    let n_bytes = (chain_length as usize + 7) / 8;
    let mut image = vec![0u8; n_bytes];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (words[i / 4] >> (8 * (i % 4))) as u8;
    }
    image
}
