//! Cursor-based byte parser for metadata blobs.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked cursor over a
//! byte slice. It implements the subset of ECMA-335 II.23.2 encodings that marshalling
//! descriptors use: single bytes, compressed unsigned integers and length-prefixed UTF-8
//! strings (`SerString`).
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::file::Parser;
//!
//! // NATIVE_TYPE_LPARRAY, element I4, ParamNum 2
//! let data = [0x2A, 0x07, 0x02];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_u8()?, 0x2A);
//! assert_eq!(parser.read_u8()?, 0x07);
//! assert_eq!(parser.read_compressed_uint()?, 2);
//! assert!(!parser.has_more_data());
//! # Ok::<(), dotmarshal::Error>(())
//! ```

use crate::{Error, Result};

/// A bounds-checked reader over a metadata blob.
///
/// Every read validates that enough bytes remain and returns [`crate::Error::OutOfBounds`]
/// otherwise, so a truncated descriptor never panics.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new `Parser` positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the total length of the underlying blob.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current offset of the cursor.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns `true` while unread bytes remain.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the number of bytes remaining from the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Look at the next byte without consuming it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the blob.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data.get(self.position).copied().ok_or(Error::OutOfBounds)
    }

    /// Read one byte and advance.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the blob.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.peek_byte()?;
        self.position += 1;
        Ok(value)
    }

    /// Read `length` raw bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::OutOfBounds)?;

        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Read a compressed unsigned integer as defined in ECMA-335 II.23.2.
    ///
    /// Values below `0x80` take one byte, values below `0x4000` two bytes and everything else
    /// four bytes, with the high bits of the first byte selecting the width.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length or
    /// [`crate::Error::Malformed`] for an invalid width prefix.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotmarshal::file::Parser;
    ///
    /// let mut parser = Parser::new(&[0x80, 0x80]);
    /// assert_eq!(parser.read_compressed_uint()?, 128);
    /// # Ok::<(), dotmarshal::Error>(())
    /// ```
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_u8()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_u8()?;
            return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte));
        }

        // 4-byte encoding: 110xxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let rest = self.read_bytes(3)?;
            return Ok(((u32::from(first_byte) & 0x1F) << 24)
                | (u32::from(rest[0]) << 16)
                | (u32::from(rest[1]) << 8)
                | u32::from(rest[2]));
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read a `SerString`: a compressed length followed by that many UTF-8 bytes.
    ///
    /// A lone `0xFF` length byte denotes a null string and yields an empty `String`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the payload is truncated or
    /// [`crate::Error::Malformed`] for invalid UTF-8.
    pub fn read_compressed_string_utf8(&mut self) -> Result<String> {
        if self.peek_byte()? == 0xFF {
            self.position += 1;
            return Ok(String::new());
        }

        let length = self.read_compressed_uint()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(length)?;

        String::from_utf8(bytes.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                start + length,
                e.utf8_error()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_compressed_uint_widths() {
        let test_cases = vec![
            (vec![0x03], 3),
            (vec![0x7F], 0x7F),
            (vec![0x80, 0x80], 0x80),
            (vec![0xAE, 0x57], 0x2E57),
            (vec![0xBF, 0xFF], 0x3FFF),
            (vec![0xC0, 0x00, 0x40, 0x00], 0x4000),
            (vec![0xDF, 0xFF, 0xFF, 0xFF], 0x1FFF_FFFF),
        ];

        for (input, expected) in test_cases {
            let mut parser = Parser::new(&input);
            assert_eq!(parser.read_compressed_uint().unwrap(), expected);
            assert!(!parser.has_more_data());
        }
    }

    #[test]
    fn read_compressed_uint_invalid_prefix() {
        let mut parser = Parser::new(&[0xE0, 0x00, 0x00, 0x00]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn read_compressed_uint_truncated() {
        let mut parser = Parser::new(&[0xC0, 0x00]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn read_prefixed_string() {
        let data = [0x05, b'H', b'e', b'l', b'l', b'o', 0x2A];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_compressed_string_utf8().unwrap(), "Hello");
        assert_eq!(parser.read_u8().unwrap(), 0x2A);
    }

    #[test]
    fn read_null_string() {
        let mut parser = Parser::new(&[0xFF]);
        assert_eq!(parser.read_compressed_string_utf8().unwrap(), "");
        assert_eq!(parser.remaining(), 0);
    }

    #[test]
    fn read_past_end() {
        let mut parser = Parser::new(&[0x01]);
        assert!(parser.read_u8().is_ok());
        assert!(matches!(parser.read_u8(), Err(Error::OutOfBounds)));
        assert!(matches!(parser.read_bytes(1), Err(Error::OutOfBounds)));
        assert_eq!(parser.pos(), 1);
    }
}
