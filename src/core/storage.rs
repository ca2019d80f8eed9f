//! Raw tensor persistence.
//!
//! Two encodings of the same layer-by-layer tensors:
//! - plain text: one grid per line, values separated by spaces;
//! - binary image: magic + version header followed by tagged chunks whose
//!   payloads are LZ4-compressed little-endian `f32` runs.
//!
//! Neither encoding stores geometry. Readers fill an instance that was built
//! with the same parameters as the writer.

use std::io::{self, BufRead, Read, Write};

use crate::error::{Error, Result};
use crate::grid::Grid;

pub(crate) const MAGIC: &[u8; 8] = b"PREDCOD1";
pub(crate) const VERSION_V1: u32 = 1;
pub(crate) const VERSION_CURRENT: u32 = VERSION_V1;

// Tags are only written by the serde-gated image path.
#[cfg_attr(not(feature = "serde"), allow(dead_code))]
pub(crate) const TAG_CONFIG: [u8; 4] = *b"CFG0";
#[cfg_attr(not(feature = "serde"), allow(dead_code))]
pub(crate) const TAG_LAYER: [u8; 4] = *b"LAYR";
#[cfg_attr(not(feature = "serde"), allow(dead_code))]
pub(crate) const TAG_END: [u8; 4] = *b"END0";

/// Upper bound on both lengths of one chunk, checked before allocating.
pub(crate) const MAX_CHUNK_BYTES: usize = 256 << 20;

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Write every value of `grid` on one line.
pub fn write_grid_text<W: Write>(w: &mut W, grid: &Grid) -> io::Result<()> {
    let mut first = true;
    for v in grid.data() {
        if !first {
            w.write_all(b" ")?;
        }
        first = false;
        write!(w, "{v}")?;
    }
    w.write_all(b"\n")
}

/// Whitespace-separated token reader over a buffered stream.
pub struct TokenReader<R> {
    inner: R,
    line: String,
    pos: usize,
}

impl<R: BufRead> TokenReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
            pos: 0,
        }
    }

    fn next_token(&mut self) -> Result<&str> {
        loop {
            let rest = &self.line[self.pos..];
            let trimmed = rest.trim_start();
            if !trimmed.is_empty() {
                let start = self.pos + (rest.len() - trimmed.len());
                let len = trimmed
                    .find(char::is_whitespace)
                    .unwrap_or(trimmed.len());
                self.pos = start + len;
                return Ok(&self.line[start..start + len]);
            }

            self.line.clear();
            self.pos = 0;
            if self.inner.read_line(&mut self.line)? == 0 {
                return Err(Error::Parse("unexpected end of stream".to_string()));
            }
        }
    }

    pub fn next_f32(&mut self) -> Result<f32> {
        let tok = self.next_token()?;
        tok.parse::<f32>()
            .map_err(|e| Error::Parse(format!("bad float {tok:?}: {e}")))
    }

    /// Overwrite every value of `grid` from the stream.
    pub fn read_grid(&mut self, grid: &mut Grid) -> Result<()> {
        for i in 0..grid.len() {
            let v = self.next_f32()?;
            grid.data_mut()[i] = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_V1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported image version {version}"),
        ));
    }
    Ok(version)
}

/// Chunk layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

/// Read one chunk, returning its tag and decompressed payload.
pub fn read_chunk_lz4<R: Read>(r: &mut R) -> io::Result<([u8; 4], Vec<u8>)> {
    let mut tag = [0u8; 4];
    r.read_exact(&mut tag)?;
    let total_len = read_u32_le(r)? as usize;
    if total_len < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk too short"));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    if total_len - 4 > MAX_CHUNK_BYTES || uncompressed_len > MAX_CHUNK_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("chunk of {total_len}/{uncompressed_len} bytes exceeds {MAX_CHUNK_BYTES}"),
        ));
    }
    let mut compressed = vec![0u8; total_len - 4];
    r.read_exact(&mut compressed)?;
    Ok((tag, decompress_lz4(&compressed, uncompressed_len)?))
}

/// Append the values of `grid` as little-endian `f32`.
pub fn push_grid(buf: &mut Vec<u8>, grid: &Grid) {
    buf.reserve(grid.len() * 4);
    for v in grid.data() {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Cursor over a decompressed chunk payload.
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_grid(&mut self, grid: &mut Grid) -> Result<()> {
        let need = grid.len() * 4;
        if self.bytes.len() - self.pos < need {
            return Err(Error::Parse(format!(
                "payload holds {} bytes, grid needs {need}",
                self.bytes.len() - self.pos
            )));
        }
        for (i, chunk) in self.bytes[self.pos..self.pos + need]
            .chunks_exact(4)
            .enumerate()
        {
            grid.data_mut()[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.pos += need;
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
