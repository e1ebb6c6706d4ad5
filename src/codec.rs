//! Tagged-record container shared by the scan-map, snapshot and memory-map
//! files.
//!
//! A file is a 4-byte magic, a `u32` format version, then a sequence of
//! records `{u32 tag, u32 byte length, payload}`. All integers are
//! little-endian. Tag values are stable IDs owned by each file type; readers
//! skip records with tags they do not know.

use std::io::{self, Read, Write};

use crate::error::{HostError, HostResult};

/// Upper bound on a single record payload. Anything larger is a corrupt
/// length field, not data.
const MAX_RECORD_LEN: u32 = 1 << 28;

fn corrupt(name: &str, what: &str) -> HostError {
    HostError::InvalidArg(format!("{name}: {what}"))
}

pub fn write_header<W: Write>(w: &mut W, magic: [u8; 4], version: u32) -> io::Result<()> {
    w.write_all(&magic)?;
    w.write_all(&version.to_le_bytes())
}

/// Checks the magic and returns the format version.
pub fn read_header<R: Read>(r: &mut R, magic: [u8; 4], name: &str) -> HostResult<u32> {
    let mut head = [0u8; 8];
    r.read_exact(&mut head).map_err(|_| corrupt(name, "missing file header"))?;
    if head[0..4] != magic {
        return Err(corrupt(name, "bad magic"));
    }
    Ok(u32::from_le_bytes(head[4..8].try_into().unwrap()))
}

pub fn write_record<W: Write>(w: &mut W, tag: u32, payload: &[u8]) -> io::Result<()> {
    w.write_all(&tag.to_le_bytes())?;
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)
}

/// Iterates the records of a container. EOF at a record boundary ends the
/// sequence; EOF anywhere else is a truncated file.
pub struct Records<R> {
    r: R,
    name: &'static str,
}

impl<R: Read> Records<R> {
    pub fn new(r: R, name: &'static str) -> Self {
        Records { r, name }
    }

    pub fn next(&mut self) -> HostResult<Option<(u32, Vec<u8>)>> {
        let mut head = [0u8; 8];
        match self.r.read_exact(&mut head[..1]) {
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(corrupt(self.name, "read failure")),
            Ok(()) => {}
        }
        self.r
            .read_exact(&mut head[1..])
            .map_err(|_| corrupt(self.name, "truncated record header"))?;
        let tag = u32::from_le_bytes(head[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if len > MAX_RECORD_LEN {
            return Err(corrupt(self.name, "unreasonable record length"));
        }
        let mut payload = vec![0u8; len as usize];
        self.r
            .read_exact(&mut payload)
            .map_err(|_| corrupt(self.name, "truncated record payload"))?;
        Ok(Some((tag, payload)))
    }
}

/// Sequential little-endian field reader over one record payload.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    name: &'static str,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8], name: &'static str) -> Self {
        FieldReader { buf, pos: 0, name }
    }

    fn take(&mut self, n: usize) -> HostResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| corrupt(self.name, "truncated field"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> HostResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> HostResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> HostResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> HostResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> HostResult<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| corrupt(self.name, "field is not UTF-8"))
    }
}

/// Sequential little-endian field writer building one record payload.
#[derive(Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        FieldWriter::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn string(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
