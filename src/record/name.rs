//! Record names: little-endian UTF-16 code units, NUL terminated.
//!
//! The stored unit count includes the terminator, so an
//! empty name is stored as a single `0x0000` unit with a count of 1.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Number of code units written for `name`, terminator included.
pub fn unit_count(name: &str) -> u64 {
    name.encode_utf16().count() as u64 + 1
}

/// Encoded byte length of `name` (two bytes per unit).
pub fn byte_len(name: &str) -> u64 {
    unit_count(name) * 2
}

pub fn write_name<W: Write>(mut writer: W, name: &str) -> io::Result<()> {
    for unit in name.encode_utf16() {
        writer.write_u16::<LittleEndian>(unit)?;
    }
    writer.write_u16::<LittleEndian>(0)
}

/// Read `units` code units and decode them. Returns a description of the
/// problem when the terminator is missing or the units are not valid UTF-16.
pub fn read_name<R: Read>(mut reader: R, units: u32) -> io::Result<Result<String, &'static str>> {
    if units == 0 {
        return Ok(Err("name length is zero (terminator missing)"));
    }
    let mut buf = Vec::with_capacity(units as usize);
    for _ in 0..units {
        buf.push(reader.read_u16::<LittleEndian>()?);
    }
    if buf.pop() != Some(0) {
        return Ok(Err("name is not NUL terminated"));
    }
    Ok(String::from_utf16(&buf).map_err(|_| "name is not valid UTF-16"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn empty_name_is_just_a_terminator() {
        let mut out = Vec::new();
        write_name(&mut out, "").unwrap();
        assert_eq!(out, vec![0, 0]);
        assert_eq!(unit_count(""), 1);
    }

    #[test]
    fn non_ascii_names_survive() {
        let mut out = Vec::new();
        write_name(&mut out, "Métadonnées").unwrap();
        let units = unit_count("Métadonnées") as u32;
        let back = read_name(Cursor::new(out), units).unwrap().unwrap();
        assert_eq!(back, "Métadonnées");
    }

    #[test]
    fn missing_terminator_is_reported() {
        let bytes = [b'a', 0, b'b', 0];
        let verdict = read_name(Cursor::new(bytes), 2).unwrap();
        assert!(verdict.is_err());
    }
}
