//! Character transcoding used by the string helpers.
//!
//! The emulated ANSI code page is ISO-8859-1: code units up to `U+00FF` map to the byte of the
//! same value. Anything above goes through a small best-fit table when best-fit mapping is
//! enabled, and is otherwise unmappable.

use widestring::{U16Str, U16String};

use crate::{Error, Result};

/// Name reported in [`Error::UnmappableChar`].
pub const ANSI_ENCODING: &str = "ANSI (ISO-8859-1)";

/// Byte written for an unmappable character when the policy does not throw.
pub const REPLACEMENT: u8 = b'?';

const BEST_FIT: &[(u16, u8)] = &[
    (0x0100, b'A'),
    (0x0101, b'a'),
    (0x0102, b'A'),
    (0x0103, b'a'),
    (0x0104, b'A'),
    (0x0105, b'a'),
    (0x0106, b'C'),
    (0x0107, b'c'),
    (0x010C, b'C'),
    (0x010D, b'c'),
    (0x010E, b'D'),
    (0x010F, b'd'),
    (0x0112, b'E'),
    (0x0113, b'e'),
    (0x0118, b'E'),
    (0x0119, b'e'),
    (0x011A, b'E'),
    (0x011B, b'e'),
    (0x011E, b'G'),
    (0x011F, b'g'),
    (0x012A, b'I'),
    (0x012B, b'i'),
    (0x0130, b'I'),
    (0x0131, b'i'),
    (0x0141, b'L'),
    (0x0142, b'l'),
    (0x0143, b'N'),
    (0x0144, b'n'),
    (0x0147, b'N'),
    (0x0148, b'n'),
    (0x014C, b'O'),
    (0x014D, b'o'),
    (0x0150, b'O'),
    (0x0151, b'o'),
    (0x0158, b'R'),
    (0x0159, b'r'),
    (0x015A, b'S'),
    (0x015B, b's'),
    (0x015E, b'S'),
    (0x015F, b's'),
    (0x0160, b'S'),
    (0x0161, b's'),
    (0x0162, b'T'),
    (0x0163, b't'),
    (0x0164, b'T'),
    (0x0165, b't'),
    (0x016A, b'U'),
    (0x016B, b'u'),
    (0x016E, b'U'),
    (0x016F, b'u'),
    (0x0170, b'U'),
    (0x0171, b'u'),
    (0x0178, b'Y'),
    (0x0179, b'Z'),
    (0x017A, b'z'),
    (0x017B, b'Z'),
    (0x017C, b'z'),
    (0x017D, b'Z'),
    (0x017E, b'z'),
    (0x2010, b'-'),
    (0x2011, b'-'),
    (0x2013, b'-'),
    (0x2014, b'-'),
    (0x2018, b'\''),
    (0x2019, b'\''),
    (0x201A, b','),
    (0x201C, b'"'),
    (0x201D, b'"'),
    (0x201E, b'"'),
    (0x2022, b'.'),
    (0x2039, b'<'),
    (0x203A, b'>'),
    (0x2044, b'/'),
    (0x2122, b'T'),
    (0xFF01, b'!'),
];

fn best_fit(unit: u16) -> Option<u8> {
    BEST_FIT
        .binary_search_by_key(&unit, |&(from, _)| from)
        .ok()
        .map(|index| BEST_FIT[index].1)
}

/// Encode one UTF-16 code unit.
///
/// # Errors
/// [`Error::UnmappableChar`] if the unit cannot be represented and `throw_on_unmappable` is set.
pub fn encode_ansi_char(unit: u16, best_fit_mapping: bool, throw_on_unmappable: bool) -> Result<u8> {
    if let Ok(byte) = u8::try_from(unit) {
        return Ok(byte);
    }
    if best_fit_mapping {
        if let Some(byte) = best_fit(unit) {
            return Ok(byte);
        }
    }
    if throw_on_unmappable {
        return Err(Error::UnmappableChar {
            code_point: u32::from(unit),
            encoding: ANSI_ENCODING,
        });
    }
    Ok(REPLACEMENT)
}

/// Encode a string, one byte per code unit, without a terminator.
///
/// # Errors
/// [`Error::UnmappableChar`] for the first unmappable unit under a throwing policy.
pub fn encode_ansi(
    text: &U16Str,
    best_fit_mapping: bool,
    throw_on_unmappable: bool,
) -> Result<Vec<u8>> {
    text.as_slice()
        .iter()
        .map(|&unit| encode_ansi_char(unit, best_fit_mapping, throw_on_unmappable))
        .collect()
}

/// Decode ANSI bytes.
#[must_use]
pub fn decode_ansi(bytes: &[u8]) -> U16String {
    U16String::from_vec(bytes.iter().map(|&b| u16::from(b)).collect::<Vec<_>>())
}

/// UTF-16 code units as little-endian bytes.
#[must_use]
pub fn utf16_bytes(text: &U16Str) -> Vec<u8> {
    text.as_slice()
        .iter()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

/// Little-endian bytes as UTF-16 code units. A trailing odd byte is ignored.
#[must_use]
pub fn utf16_from_bytes(bytes: &[u8]) -> U16String {
    U16String::from_vec(
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        assert!(BEST_FIT.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    #[test]
    fn latin1_maps_directly() {
        assert_eq!(encode_ansi_char(u16::from(b'A'), false, true).unwrap(), b'A');
        assert_eq!(encode_ansi_char(0x00E9, false, true).unwrap(), 0xE9);
    }

    #[test]
    fn best_fit_substitutes() {
        let text = U16String::from_str("\u{201C}Łódź\u{201D}");
        assert_eq!(encode_ansi(&text, true, true).unwrap(), b"\"L\xF3dz\"");
    }

    #[test]
    fn unmappable_without_best_fit() {
        let text = U16String::from_str("a\u{0142}b");
        assert_eq!(encode_ansi(&text, false, false).unwrap(), b"a?b");
        assert!(matches!(
            encode_ansi(&text, false, true),
            Err(Error::UnmappableChar {
                code_point: 0x142,
                ..
            })
        ));
    }

    #[test]
    fn characters_outside_the_table_stay_unmappable() {
        assert_eq!(encode_ansi_char(0x4E2D, true, false).unwrap(), REPLACEMENT);
        assert!(encode_ansi_char(0x4E2D, true, true).is_err());
    }

    #[test]
    fn utf16_bytes_round_trip() {
        let text = U16String::from_str("hé");
        assert_eq!(utf16_bytes(&text), [b'h', 0, 0xE9, 0]);
        assert_eq!(utf16_from_bytes(&utf16_bytes(&text)), text);
        assert_eq!(decode_ansi(&[b'h', 0xE9]), text);
    }
}
