//! Typed framing for the control channel.
//!
//! The control channel is a reliable byte stream (TCP between hosts, a
//! unix socketpair for a forked server). Two frame types only: signed
//! 32-bit little-endian integers, and strings sent as a 32-bit
//! little-endian length followed by the bytes, no terminator.

use std::io::{self, Read, Write};

pub fn put_int<W: Write>(w: &mut W, value: i32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

pub fn get_int<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// An absent string (an option the peer did not set) goes on the wire as
/// the empty string.
pub fn put_str<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    w.write_all(&(value.len() as u32).to_le_bytes())?;
    w.write_all(value.as_bytes())
}

pub fn get_str<R: Read>(r: &mut R) -> io::Result<String> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_le_bytes(buf) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn int_round_trip() {
        let mut buf = Vec::new();
        put_int(&mut buf, -7).unwrap();
        put_int(&mut buf, 0x501).unwrap();
        assert_eq!(buf.len(), 8);

        let mut cur = Cursor::new(buf);
        assert_eq!(get_int(&mut cur).unwrap(), -7);
        assert_eq!(get_int(&mut cur).unwrap(), 0x501);
    }

    #[test]
    fn str_round_trip() {
        let mut buf = Vec::new();
        put_str(&mut buf, "localhost:2049").unwrap();
        put_str(&mut buf, "").unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(get_str(&mut cur).unwrap(), "localhost:2049");
        assert_eq!(get_str(&mut cur).unwrap(), "");
    }

    #[test]
    fn str_length_is_le_and_unterminated() {
        let mut buf = Vec::new();
        put_str(&mut buf, "ab").unwrap();
        assert_eq!(buf, [2, 0, 0, 0, b'a', b'b']);
    }
}
