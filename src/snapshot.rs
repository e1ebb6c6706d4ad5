//! Snapshot files: a captured scan image plus enough metadata to interpret
//! it offline. Snapshots embed the scan map so `inspect` and
//! `deposit_script` work without the original work directory.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::codec::{self, FieldReader, FieldWriter, Records};
use crate::error::{HostError, HostResult};
use crate::scan::ScanMap;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LMSS";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Stable record tags of the snapshot container.
mod tag {
    pub const META: u32 = 1;
    pub const SCAN_DATA: u32 = 2;
    pub const SCAN_MAP: u32 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub cycle_count: u64,
    pub dut_time: u64,
    pub design_hash: [u32; 8],
    /// Packed scan image, LSB-first within each byte.
    pub raw_scan_data: Vec<u8>,
    pub scan_map: Option<ScanMap>,
}

impl Snapshot {
    pub fn load(path: &Path) -> HostResult<Snapshot> {
        let file = File::open(path)
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
        Snapshot::decode(&mut BufReader::new(file))
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
        codec::write_header(w, SNAPSHOT_MAGIC, SNAPSHOT_VERSION)?;
        let mut meta = FieldWriter::new();
        meta.u64(self.cycle_count).u64(self.dut_time);
        for word in self.design_hash {
            meta.u32(word);
        }
        codec::write_record(w, tag::META, &meta.finish())?;
        codec::write_record(w, tag::SCAN_DATA, &self.raw_scan_data)?;
        if let Some(map) = &self.scan_map {
            // Nested scan-map container, header and all, so the snapshot is
            // self-contained.
            let mut nested = Vec::new();
            map.encode(&mut nested)?;
            codec::write_record(w, tag::SCAN_MAP, &nested)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> HostResult<Snapshot> {
        let version = codec::read_header(r, SNAPSHOT_MAGIC, "snapshot")?;
        if version != SNAPSHOT_VERSION {
            return Err(HostError::InvalidArg(format!("snapshot: unknown version {version}")));
        }
        let mut snap = Snapshot::default();
        let mut records = Records::new(r, "snapshot");
        while let Some((tag, payload)) = records.next()? {
            match tag {
                tag::META => {
                    let mut f = FieldReader::new(&payload, "snapshot");
                    snap.cycle_count = f.u64()?;
                    snap.dut_time = f.u64()?;
                    for word in snap.design_hash.iter_mut() {
                        *word = f.u32()?;
                    }
                }
                tag::SCAN_DATA => snap.raw_scan_data = payload,
                tag::SCAN_MAP => snap.scan_map = Some(ScanMap::decode(&mut &payload[..])?),
                _ => {} // unknown record from a newer toolchain
            }
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ResetDpiMapping, ScanVariable};

    #[test]
    fn snapshot_roundtrip_with_embedded_map() {
        let snap = Snapshot {
            cycle_count: 123_456_789,
            dut_time: 42,
            design_hash: [1, 2, 3, 4, 5, 6, 7, 8],
            raw_scan_data: vec![0xEF, 0xBE, 0xAD, 0xDE, 0x00],
            scan_map: Some(ScanMap {
                chain_length: 40,
                variables: vec![ScanVariable {
                    name: "reg_q".into(),
                    hdl_path: "top.reg_q".into(),
                    offset: 0,
                    width: 32,
                    reset_value: None,
                    enum_members: vec![],
                }],
                reset_dpi: vec![ResetDpiMapping { func_id: 0, scan_offset: 0, scan_width: 32 }],
                initial_image: None,
            }),
        };
        let mut raw = Vec::new();
        snap.encode(&mut raw).unwrap();
        assert_eq!(Snapshot::decode(&mut &raw[..]).unwrap(), snap);
    }

    #[test]
    fn snapshot_roundtrip_without_map() {
        let snap = Snapshot { raw_scan_data: vec![1, 2, 3], ..Snapshot::default() };
        let mut raw = Vec::new();
        snap.encode(&mut raw).unwrap();
        assert_eq!(Snapshot::decode(&mut &raw[..]).unwrap(), snap);
    }
}
