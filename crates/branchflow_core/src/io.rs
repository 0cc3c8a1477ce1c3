//! Helpers for the binary save formats.
//!
//! All integers are written as little-endian `u64` regardless of their in-memory
//! width, all floats as little-endian `f64`.

use std::io::{BufRead, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub fn write_u64(out: &mut (impl Write + ?Sized), value: u64) -> Result<()> {
    out.write_u64::<LittleEndian>(value)?;
    Ok(())
}

pub fn read_u64(input: &mut (impl Read + ?Sized)) -> Result<u64> {
    Ok(input.read_u64::<LittleEndian>()?)
}

pub fn write_i64(out: &mut (impl Write + ?Sized), value: i64) -> Result<()> {
    out.write_i64::<LittleEndian>(value)?;
    Ok(())
}

pub fn read_i64(input: &mut (impl Read + ?Sized)) -> Result<i64> {
    Ok(input.read_i64::<LittleEndian>()?)
}

pub fn write_f64(out: &mut (impl Write + ?Sized), value: f64) -> Result<()> {
    out.write_f64::<LittleEndian>(value)?;
    Ok(())
}

pub fn read_f64(input: &mut (impl Read + ?Sized)) -> Result<f64> {
    Ok(input.read_f64::<LittleEndian>()?)
}

pub fn write_f64s<'a>(out: &mut (impl Write + ?Sized), values: impl IntoIterator<Item = &'a f64>) -> Result<()> {
    for v in values {
        write_f64(out, *v)?;
    }
    Ok(())
}

/// Writes `text` including a terminating NUL byte.
pub fn write_cstr(out: &mut (impl Write + ?Sized), text: &str) -> Result<()> {
    out.write_all(text.as_bytes())?;
    out.write_all(&[0])?;
    Ok(())
}

/// Reads bytes up to (and consuming) the next NUL.
pub fn read_cstr(input: &mut (impl Read + ?Sized)) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|_| Error::format("name field is not valid utf-8"))
}

/// Reads an ASCII decimal integer preceded by optional whitespace, leaving the
/// reader positioned on the first non-digit byte. Used for the human-readable
/// length prefix in potential files.
pub fn read_ascii_u64(input: &mut (impl BufRead + ?Sized)) -> Result<u64> {
    let mut value: Option<u64> = None;
    loop {
        let buf = input.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let mut used = 0;
        for &byte in buf {
            match byte {
                b' ' | b'\t' | b'\n' | b'\r' if value.is_none() => used += 1,
                b'0'..=b'9' => {
                    value = Some(value.unwrap_or(0) * 10 + u64::from(byte - b'0'));
                    used += 1;
                }
                _ => {
                    input.consume(used);
                    return value.ok_or_else(|| Error::format("expected ascii integer"));
                }
            }
        }
        input.consume(used);
    }
    value.ok_or_else(|| Error::format("expected ascii integer, found end of file"))
}

/// Skips exactly `count` bytes.
pub fn skip_bytes(input: &mut (impl Read + ?Sized), count: u64) -> Result<()> {
    let copied = std::io::copy(&mut input.take(count), &mut std::io::sink())?;
    if copied != count {
        return Err(Error::format(format!(
            "unexpected end of file while skipping {count} bytes"
        )));
    }
    Ok(())
}

/// Checks a fixed magic-byte header.
pub fn expect_magic(input: &mut (impl Read + ?Sized), magic: &[u8]) -> Result<()> {
    let mut found = vec![0u8; magic.len()];
    input.read_exact(&mut found)?;
    if found != magic {
        return Err(Error::format(format!(
            "file header {:?} does not match expected {:?}",
            String::from_utf8_lossy(&found),
            String::from_utf8_lossy(magic)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integers_round_trip_as_64_bit() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0xDEAD_BEEF_0123).unwrap();
        write_i64(&mut buf, -42).unwrap();
        assert_eq!(buf.len(), 16);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u64(&mut cursor).unwrap(), 0xDEAD_BEEF_0123);
        assert_eq!(read_i64(&mut cursor).unwrap(), -42);
    }

    #[test]
    fn cstr_round_trip() {
        let mut buf = Vec::new();
        write_cstr(&mut buf, "c64").unwrap();
        assert_eq!(buf, b"c64\0");
        assert_eq!(read_cstr(&mut Cursor::new(buf)).unwrap(), "c64");
    }

    #[test]
    fn ascii_length_leaves_reader_on_payload() {
        let mut cursor = Cursor::new(b" 123\nabc".to_vec());
        assert_eq!(read_ascii_u64(&mut cursor).unwrap(), 123);
        let mut rest = String::new();
        cursor.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "\nabc");
    }

    #[test]
    fn bad_magic_is_reported() {
        let mut cursor = Cursor::new(b"nope".to_vec());
        assert!(matches!(
            expect_magic(&mut cursor, b"bpot"),
            Err(Error::Format(_))
        ));
    }
}
