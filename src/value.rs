//! Attribute value normalization.
//!
//! Some clients send modify values still wrapped in a BER OCTET STRING
//! (`0x04 <len> <bytes>`). Those are unwrapped to the raw text; anything else
//! passes through untouched.

use thiserror::Error;

/// Universal OCTET STRING tag.
pub const TAG_OCTET_STRING: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("need {0} more byte(s) to decode length")]
    NeedMoreData(usize),
    #[error("invalid length byte 0xFF")]
    InvalidLengthByte,
    #[error("indefinite length not supported")]
    IndefiniteLength,
    #[error("length does not fit in {0} bytes")]
    LengthOverflow(usize),
}

/// A decoded BER length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BerLength {
    value: u64,
    indefinite: bool,
    encoded_len: usize,
}

impl BerLength {
    /// Parse a length field from the start of `data`.
    ///
    /// Short form, long form with up to 8 length bytes, and the indefinite
    /// marker (`0x80`) are recognised. `0xFF` is reserved and always fails.
    pub fn parse(data: &[u8]) -> Result<Self, ValueError> {
        let first = *data.first().ok_or(ValueError::NeedMoreData(1))?;
        if first == 0xFF {
            return Err(ValueError::InvalidLengthByte);
        }
        if first & 0x80 == 0 {
            return Ok(BerLength {
                value: first as u64,
                indefinite: false,
                encoded_len: 1,
            });
        }

        let count = (first & 0x7F) as usize;
        if count == 0 {
            return Ok(BerLength {
                value: 0,
                indefinite: true,
                encoded_len: 1,
            });
        }
        if count > 8 {
            return Err(ValueError::LengthOverflow(count));
        }
        if data.len() < count + 1 {
            return Err(ValueError::NeedMoreData(count + 1 - data.len()));
        }

        let value = data[1..=count]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Ok(BerLength {
            value,
            indefinite: false,
            encoded_len: count + 1,
        })
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    #[inline]
    pub fn indefinite(&self) -> bool {
        self.indefinite
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Concrete length as `usize`, failing for indefinite form or a value the
    /// platform cannot address.
    pub fn definite(&self) -> Result<usize, ValueError> {
        if self.indefinite {
            return Err(ValueError::IndefiniteLength);
        }
        usize::try_from(self.value).map_err(|_| ValueError::LengthOverflow(self.encoded_len - 1))
    }
}

/// Strip a leading OCTET STRING header from `raw`, if present.
///
/// The payload is everything after the tag and length bytes. A declared length
/// that disagrees with the bytes actually present is not checked.
pub fn normalize_value(raw: &[u8]) -> Result<String, ValueError> {
    match raw.first() {
        Some(&TAG_OCTET_STRING) => {
            let len = BerLength::parse(&raw[1..])?;
            len.definite()?;
            let start = 1 + len.encoded_len();
            Ok(String::from_utf8_lossy(&raw[start..]).into_owned())
        }
        _ => Ok(String::from_utf8_lossy(raw).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form() {
        let len = BerLength::parse(&[0x05]).unwrap();
        assert_eq!(len.value(), 5);
        assert_eq!(len.encoded_len(), 1);
        assert!(!len.indefinite());
        assert_eq!(len.definite().unwrap(), 5);
    }

    #[test]
    fn test_long_form() {
        let len = BerLength::parse(&[0x81, 0xC8]).unwrap();
        assert_eq!(len.value(), 200);
        assert_eq!(len.encoded_len(), 2);

        let len = BerLength::parse(&[0x82, 0x01, 0x00]).unwrap();
        assert_eq!(len.value(), 256);
        assert_eq!(len.encoded_len(), 3);

        let len = BerLength::parse(&[0x88, 0, 0, 0, 0, 0, 0, 0x01, 0x02]).unwrap();
        assert_eq!(len.value(), 0x0102);
        assert_eq!(len.encoded_len(), 9);
    }

    #[test]
    fn test_ff_always_invalid() {
        assert_eq!(BerLength::parse(&[0xFF]), Err(ValueError::InvalidLengthByte));
        assert_eq!(BerLength::parse(&[0xFF; 16]), Err(ValueError::InvalidLengthByte));
    }

    #[test]
    fn test_nine_length_bytes_overflow() {
        let mut data = vec![0x89];
        data.extend_from_slice(&[0x01; 9]);
        assert_eq!(BerLength::parse(&data), Err(ValueError::LengthOverflow(9)));
    }

    #[test]
    fn test_indefinite() {
        let len = BerLength::parse(&[0x80]).unwrap();
        assert!(len.indefinite());
        assert_eq!(len.encoded_len(), 1);
        assert_eq!(len.definite(), Err(ValueError::IndefiniteLength));
    }

    #[test]
    fn test_need_more_data() {
        assert_eq!(BerLength::parse(&[]), Err(ValueError::NeedMoreData(1)));
        assert_eq!(BerLength::parse(&[0x82, 0x01]), Err(ValueError::NeedMoreData(1)));
    }

    #[test]
    fn test_normalize_plain_passthrough() {
        assert_eq!(normalize_value(b"hello").unwrap(), "hello");
        assert_eq!(normalize_value(b"").unwrap(), "");
    }

    #[test]
    fn test_normalize_octet_string() {
        assert_eq!(normalize_value(&[0x04, 0x05, b'h', b'e', b'l', b'l', b'o']).unwrap(), "hello");

        let mut long = vec![0x04, 0x81, 0x80];
        long.extend(std::iter::repeat(b'x').take(128));
        assert_eq!(normalize_value(&long).unwrap().len(), 128);
    }

    #[test]
    fn test_normalize_rejects_bad_length() {
        assert_eq!(normalize_value(&[0x04, 0xFF, b'a']), Err(ValueError::InvalidLengthByte));
        assert_eq!(normalize_value(&[0x04, 0x80, b'a']), Err(ValueError::IndefiniteLength));
        assert_eq!(normalize_value(&[0x04]), Err(ValueError::NeedMoreData(1)));
    }
}
