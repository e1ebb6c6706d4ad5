//! Memory map of the design's shadowed memories, plus the word-file loader
//! used by `loadmem`.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::codec::{self, FieldReader, FieldWriter, Records};
use crate::error::{HostError, HostResult};

pub const MEM_MAP_MAGIC: [u8; 4] = *b"LMMM";
pub const MEM_MAP_VERSION: u32 = 1;

mod tag {
    pub const MEMORY: u32 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    /// Index used with the MEM_SELECT register.
    pub index: u32,
    pub name: String,
    pub hdl_path: String,
    /// Number of entries.
    pub depth: u64,
    /// Entry width in bits.
    pub width: u32,
}

impl MemoryDesc {
    /// Words per entry in the memory data window.
    pub fn entry_words(&self) -> usize {
        (self.width as usize + 31) / 32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemMap {
    pub memories: Vec<MemoryDesc>,
}

impl MemMap {
    pub fn load(path: &Path) -> HostResult<MemMap> {
        let file = File::open(path)
            .map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
        MemMap::decode(&mut BufReader::new(file))
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
        codec::write_header(w, MEM_MAP_MAGIC, MEM_MAP_VERSION)?;
        for mem in &self.memories {
            let payload = FieldWriter::new()
                .u32(mem.index)
                .string(&mem.name)
                .string(&mem.hdl_path)
                .u64(mem.depth)
                .u32(mem.width)
                .finish();
            codec::write_record(w, tag::MEMORY, &payload)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> HostResult<MemMap> {
        let version = codec::read_header(r, MEM_MAP_MAGIC, "memory map")?;
        if version != MEM_MAP_VERSION {
            return Err(HostError::InvalidArg(format!("memory map: unknown version {version}")));
        }
        let mut map = MemMap::default();
        let mut records = Records::new(r, "memory map");
        while let Some((tag, payload)) = records.next()? {
            if tag != tag::MEMORY {
                continue;
            }
            let mut f = FieldReader::new(&payload, "memory map");
            map.memories.push(MemoryDesc {
                index: f.u32()?,
                name: f.string()?,
                hdl_path: f.string()?,
                depth: f.u64()?,
                width: f.u32()?,
            });
        }
        Ok(map)
    }

    /// Resolve a memory by name, or by decimal index.
    pub fn find(&self, spec: &str) -> Option<&MemoryDesc> {
        if let Some(mem) = self.memories.iter().find(|m| m.name == spec) {
            return Some(mem);
        }
        let index: u32 = spec.parse().ok()?;
        self.memories.iter().find(|m| m.index == index)
    }
}

/// Loads a little-endian 32-bit word file (the `loadmem` payload format).
pub fn load_word_file(path: &Path) -> HostResult<Vec<u32>> {
    let raw =
        fs::read(path).map_err(|e| HostError::InvalidArg(format!("{}: {e}", path.display())))?;
    if raw.len() % 4 != 0 {
        return Err(HostError::InvalidArg(format!(
            "{}: length {} is not a multiple of 4",
            path.display(),
            raw.len()
        )));
    }
    Ok(raw.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect())
}
