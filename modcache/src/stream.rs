//! Little-endian stream primitives and the cache-file header.
//!
//! Integers are fixed-width two's-complement, floats travel as their raw
//! IEEE 754 bit pattern, byte blocks are written verbatim after an explicit
//! length.

use std::io::{self, Read, Write};

/// Magic prefix, modeled on the PNG signature: high bit set, line-ending
/// mangling detectors, EOF byte.
pub const CACHE_MAGIC: &[u8; 8] = b"\xFBjli\r\n\x1A\n";
pub const FORMAT_VERSION: u16 = 1;
pub const BOM: u16 = 0xFEFF;

pub fn write_u8(w: &mut dyn Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn read_u8(r: &mut dyn Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn write_u16(w: &mut dyn Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u16(r: &mut dyn Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

pub fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn write_i32(w: &mut dyn Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_i32(r: &mut dyn Read) -> io::Result<i32> {
    Ok(read_u32(r)? as i32)
}

pub fn write_u64(w: &mut dyn Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

pub fn write_i64(w: &mut dyn Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_i64(r: &mut dyn Read) -> io::Result<i64> {
    Ok(read_u64(r)? as i64)
}

pub fn write_f64(w: &mut dyn Write, v: f64) -> io::Result<()> {
    write_u64(w, v.to_bits())
}

pub fn read_f64(r: &mut dyn Read) -> io::Result<f64> {
    Ok(f64::from_bits(read_u64(r)?))
}

pub fn read_bytes(r: &mut dyn Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Build environment identity pinned into every cache file.
pub struct BuildIdent {
    pub pointer_size: u8,
    pub os: &'static str,
    pub arch: &'static str,
    pub version: &'static str,
    pub branch: &'static str,
    pub commit: &'static str,
}

impl BuildIdent {
    pub fn current() -> Self {
        Self {
            pointer_size: std::mem::size_of::<usize>() as u8,
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            version: env!("CARGO_PKG_VERSION"),
            branch: option_env!("MODCACHE_GIT_BRANCH").unwrap_or("main"),
            commit: option_env!("MODCACHE_GIT_COMMIT").unwrap_or("0000000000"),
        }
    }
}

fn write_cstr(w: &mut dyn Write, s: &str) -> io::Result<()> {
    debug_assert!(!s.as_bytes().contains(&0));
    w.write_all(s.as_bytes())?;
    write_u8(w, 0)
}

/// Write the header at offset 0.
pub fn write_header(w: &mut dyn Write, ident: &BuildIdent) -> io::Result<()> {
    w.write_all(CACHE_MAGIC)?;
    write_u16(w, FORMAT_VERSION)?;
    write_u16(w, BOM)?;
    write_u8(w, ident.pointer_size)?;
    write_cstr(w, ident.os)?;
    write_cstr(w, ident.arch)?;
    write_cstr(w, ident.version)?;
    write_cstr(w, ident.branch)?;
    write_cstr(w, ident.commit)
}

fn readstr_verify(r: &mut dyn Read, s: &str) -> bool {
    for expected in s.bytes() {
        match read_u8(r) {
            Ok(b) if b == expected => {}
            _ => return false,
        }
    }
    true
}

fn read_nul(r: &mut dyn Read) -> bool {
    matches!(read_u8(r), Ok(0))
}

/// Strict header check: every byte must match the given environment, or
/// the file is rejected before anything is allocated.
pub fn verify_header(r: &mut dyn Read, ident: &BuildIdent) -> bool {
    let mut magic = [0u8; 8];
    if r.read_exact(&mut magic).is_err() || &magic != CACHE_MAGIC {
        return false;
    }
    matches!(read_u16(r), Ok(FORMAT_VERSION))
        && matches!(read_u16(r), Ok(BOM))
        && matches!(read_u8(r), Ok(b) if b == ident.pointer_size)
        && readstr_verify(r, ident.os)
        && read_nul(r)
        && readstr_verify(r, ident.arch)
        && read_nul(r)
        && readstr_verify(r, ident.version)
        && read_nul(r)
        && readstr_verify(r, ident.branch)
        && read_nul(r)
        && readstr_verify(r, ident.commit)
        && read_nul(r)
}

/// Parsed header fields, for inspection tools. Unlike [`verify_header`]
/// this accepts any well-formed header.
pub struct HeaderInfo {
    pub format_version: u16,
    pub pointer_size: u8,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub branch: String,
    pub commit: String,
}

fn read_cstr(r: &mut dyn Read) -> io::Result<String> {
    let mut buf = Vec::new();
    loop {
        let b = read_u8(r)?;
        if b == 0 {
            break;
        }
        buf.push(b);
        if buf.len() > 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated header string",
            ));
        }
    }
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 header string"))
}

pub fn read_header(r: &mut dyn Read) -> io::Result<HeaderInfo> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != CACHE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad cache magic"));
    }
    let format_version = read_u16(r)?;
    let bom = read_u16(r)?;
    if bom != BOM {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad byte-order mark"));
    }
    Ok(HeaderInfo {
        format_version,
        pointer_size: read_u8(r)?,
        os: read_cstr(r)?,
        arch: read_cstr(r)?,
        version: read_cstr(r)?,
        branch: read_cstr(r)?,
        commit: read_cstr(r)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integer_round_trips() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 0xFEFF).unwrap();
        write_i32(&mut buf, -12345).unwrap();
        write_u64(&mut buf, u64::MAX - 1).unwrap();
        write_f64(&mut buf, -0.5).unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(read_u16(&mut r).unwrap(), 0xFEFF);
        assert_eq!(read_i32(&mut r).unwrap(), -12345);
        assert_eq!(read_u64(&mut r).unwrap(), u64::MAX - 1);
        assert_eq!(read_f64(&mut r).unwrap(), -0.5);
    }

    #[test]
    fn integers_are_little_endian_on_the_wire() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x0403_0201).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn header_round_trips_and_verifies() {
        let ident = BuildIdent::current();
        let mut buf = Vec::new();
        write_header(&mut buf, &ident).unwrap();
        assert!(verify_header(&mut Cursor::new(&buf), &ident));

        let info = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(info.format_version, FORMAT_VERSION);
        assert_eq!(info.os, ident.os);
        assert_eq!(info.arch, ident.arch);
    }

    #[test]
    fn header_rejects_any_environment_drift() {
        let ident = BuildIdent::current();
        let mut buf = Vec::new();
        write_header(&mut buf, &ident).unwrap();

        // flip one byte anywhere in the header
        for i in 0..buf.len() {
            let mut bad = buf.clone();
            bad[i] ^= 0x40;
            assert!(
                !verify_header(&mut Cursor::new(&bad), &ident),
                "byte {i} should be load-bearing"
            );
        }

        // truncation is a rejection, not a panic
        assert!(!verify_header(&mut Cursor::new(&buf[..5]), &ident));
    }
}
