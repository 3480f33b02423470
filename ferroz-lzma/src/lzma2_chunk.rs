//! LZMA2 chunk headers.
//!
//! Every chunk opens with a control byte:
//!
//! - `0x00` — end of stream
//! - `0x01` — uncompressed chunk, dictionary reset
//! - `0x02` — uncompressed chunk, no reset
//! - `0x80..` — LZMA chunk; bits 5..6 select the reset mode and the low
//!   five bits are the top of `unpack_size - 1`
//!
//! Compressed chunks follow with two big-endian bytes completing
//! `unpack_size - 1` (21 bits total), two bytes of `pack_size - 1`, and a
//! properties byte when the reset mode announces new properties.
//! Uncompressed chunks carry two bytes of `size - 1` and then the raw
//! bytes.

use std::io::{Read, Write};

use ferroz_core::error::{FerrozError, Result};

use crate::model::LzmaProps;

/// Largest uncompressed payload one compressed chunk can declare (21-bit
/// size field).
pub const MAX_CHUNK_UNPACK: usize = 1 << 21;

/// Largest compressed payload one chunk can declare (16-bit size field).
pub const MAX_CHUNK_PACK: usize = 1 << 16;

/// Largest payload of an uncompressed chunk (16-bit size field).
pub const MAX_UNCOMPRESSED_CHUNK: usize = 1 << 16;

/// Stream terminator byte.
pub const CONTROL_END: u8 = 0x00;
/// Uncompressed chunk, dictionary reset first.
pub const CONTROL_UNCOMPRESSED_RESET: u8 = 0x01;
/// Uncompressed chunk, dictionary preserved.
pub const CONTROL_UNCOMPRESSED: u8 = 0x02;
/// Set on every compressed-chunk control byte.
pub const CONTROL_LZMA: u8 = 0x80;

/// What a compressed chunk resets before decoding, from control bits 5..6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Continue with current state and dictionary.
    None,
    /// Reset coder state, keep properties and dictionary.
    State,
    /// Reset coder state with new properties, keep dictionary.
    StateProps,
    /// Reset everything; the chunk starts a fresh stream.
    StatePropsDict,
}

impl ResetMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::State,
            2 => Self::StateProps,
            _ => Self::StatePropsDict,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::State => 1,
            Self::StateProps => 2,
            Self::StatePropsDict => 3,
        }
    }

    /// Whether a properties byte follows the sizes.
    pub fn carries_props(self) -> bool {
        matches!(self, Self::StateProps | Self::StatePropsDict)
    }

    /// Whether the dictionary is reset.
    pub fn resets_dict(self) -> bool {
        self == Self::StatePropsDict
    }
}

/// A parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// Stream terminator.
    End,
    /// Uncompressed chunk of `size` raw bytes.
    Uncompressed {
        /// Reset the dictionary before copying.
        reset_dict: bool,
        /// Payload size.
        size: usize,
    },
    /// LZMA-compressed chunk.
    Lzma {
        /// Reset actions before decoding.
        reset: ResetMode,
        /// Declared uncompressed size.
        unpack: usize,
        /// Declared compressed size.
        pack: usize,
        /// New properties, present iff the reset mode carries them.
        props: Option<LzmaProps>,
    },
}

fn read_byte<R: Read>(source: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    source
        .read_exact(&mut buf)
        .map_err(|_| FerrozError::unexpected_eof(1))?;
    Ok(buf[0])
}

fn read_be16<R: Read>(source: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    source
        .read_exact(&mut buf)
        .map_err(|_| FerrozError::unexpected_eof(2))?;
    Ok(u16::from_be_bytes(buf))
}

/// Read the next chunk header.
pub fn read_chunk_header<R: Read>(source: &mut R) -> Result<ChunkHeader> {
    let control = read_byte(source)?;
    match control {
        CONTROL_END => Ok(ChunkHeader::End),
        CONTROL_UNCOMPRESSED_RESET | CONTROL_UNCOMPRESSED => {
            let size = read_be16(source)? as usize + 1;
            Ok(ChunkHeader::Uncompressed {
                reset_dict: control == CONTROL_UNCOMPRESSED_RESET,
                size,
            })
        }
        c if c & CONTROL_LZMA != 0 => {
            let reset = ResetMode::from_bits(c >> 5);
            let unpack_high = ((c & 0x1F) as usize) << 16;
            let unpack = unpack_high + read_be16(source)? as usize + 1;
            let pack = read_be16(source)? as usize + 1;
            let props = if reset.carries_props() {
                Some(LzmaProps::from_byte(read_byte(source)?)?)
            } else {
                None
            };
            Ok(ChunkHeader::Lzma {
                reset,
                unpack,
                pack,
                props,
            })
        }
        c => Err(FerrozError::corrupted(
            0,
            format!("invalid LZMA2 control byte 0x{c:02X}"),
        )),
    }
}

/// Write the header of an uncompressed chunk.
pub fn write_uncompressed_header<W: Write>(
    sink: &mut W,
    size: usize,
    reset_dict: bool,
) -> Result<u64> {
    debug_assert!(size >= 1 && size <= MAX_UNCOMPRESSED_CHUNK);
    let control = if reset_dict {
        CONTROL_UNCOMPRESSED_RESET
    } else {
        CONTROL_UNCOMPRESSED
    };
    sink.write_all(&[control])?;
    sink.write_all(&((size - 1) as u16).to_be_bytes())?;
    Ok(3)
}

/// Write the header of a compressed chunk.
pub fn write_lzma_header<W: Write>(
    sink: &mut W,
    unpack: usize,
    pack: usize,
    reset: ResetMode,
    props: LzmaProps,
) -> Result<u64> {
    debug_assert!(unpack >= 1 && unpack <= MAX_CHUNK_UNPACK);
    debug_assert!(pack >= 1 && pack <= MAX_CHUNK_PACK);
    let unpack_minus_1 = unpack - 1;
    let control = CONTROL_LZMA | (reset.bits() << 5) | ((unpack_minus_1 >> 16) as u8 & 0x1F);
    sink.write_all(&[control])?;
    sink.write_all(&((unpack_minus_1 & 0xFFFF) as u16).to_be_bytes())?;
    sink.write_all(&((pack - 1) as u16).to_be_bytes())?;
    if reset.carries_props() {
        sink.write_all(&[props.to_byte()])?;
        Ok(6)
    } else {
        Ok(5)
    }
}

/// Dictionary size for an LZMA2 properties byte (0..=40).
///
/// The ladder alternates `2^k` and `3 * 2^(k-1)`; 40 is the 4 GiB - 1
/// ceiling.
pub fn dict_size_from_prop(prop: u8) -> Result<u32> {
    if prop > 40 {
        return Err(FerrozError::invalid_header(format!(
            "invalid LZMA2 dictionary size property {prop}"
        )));
    }
    if prop == 40 {
        return Ok(u32::MAX);
    }
    let base = 2 | (prop as u32 & 1);
    Ok(base << (prop / 2 + 11))
}

/// Smallest properties byte whose dictionary size covers `dict_size`.
pub fn prop_from_dict_size(dict_size: u32) -> u8 {
    for prop in 0..40u8 {
        if dict_size_from_prop(prop).expect("prop in range") >= dict_size {
            return prop;
        }
    }
    40
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_dict_prop_ladder() {
        assert_eq!(dict_size_from_prop(0).unwrap(), 4096);
        assert_eq!(dict_size_from_prop(1).unwrap(), 6144);
        assert_eq!(dict_size_from_prop(2).unwrap(), 8192);
        assert_eq!(dict_size_from_prop(3).unwrap(), 12288);
        assert_eq!(dict_size_from_prop(18).unwrap(), 2 << 20);
        assert_eq!(dict_size_from_prop(40).unwrap(), u32::MAX);
        assert!(dict_size_from_prop(41).is_err());
    }

    #[test]
    fn test_prop_from_dict_rounds_up() {
        assert_eq!(prop_from_dict_size(4096), 0);
        assert_eq!(prop_from_dict_size(5000), 1);
        assert_eq!(prop_from_dict_size(8192), 2);
        assert_eq!(prop_from_dict_size(u32::MAX), 40);
        for prop in 0..=40u8 {
            let size = dict_size_from_prop(prop).unwrap();
            assert_eq!(prop_from_dict_size(size), prop);
        }
    }

    #[test]
    fn test_lzma_header_roundtrip() {
        let props = LzmaProps::default();
        for (unpack, pack, reset) in [
            (1usize, 1usize, ResetMode::StatePropsDict),
            (1 << 16, 1 << 16, ResetMode::StateProps),
            (MAX_CHUNK_UNPACK, MAX_CHUNK_PACK, ResetMode::None),
            (123_456, 7_890, ResetMode::State),
        ] {
            let mut bytes = Vec::new();
            let len = write_lzma_header(&mut bytes, unpack, pack, reset, props).unwrap();
            assert_eq!(len as usize, bytes.len());
            let header = read_chunk_header(&mut Cursor::new(&bytes)).unwrap();
            assert_eq!(
                header,
                ChunkHeader::Lzma {
                    reset,
                    unpack,
                    pack,
                    props: reset.carries_props().then_some(props),
                }
            );
        }
    }

    #[test]
    fn test_uncompressed_header_roundtrip() {
        for (size, reset) in [(1usize, true), (MAX_UNCOMPRESSED_CHUNK, false)] {
            let mut bytes = Vec::new();
            write_uncompressed_header(&mut bytes, size, reset).unwrap();
            let header = read_chunk_header(&mut Cursor::new(&bytes)).unwrap();
            assert_eq!(
                header,
                ChunkHeader::Uncompressed {
                    reset_dict: reset,
                    size,
                }
            );
        }
    }

    #[test]
    fn test_end_and_invalid_controls() {
        assert_eq!(
            read_chunk_header(&mut Cursor::new(&[0x00u8])).unwrap(),
            ChunkHeader::End
        );
        for bad in [0x03u8, 0x10, 0x7F] {
            let err = read_chunk_header(&mut Cursor::new(&[bad])).unwrap_err();
            assert!(err.is_data_error(), "0x{bad:02X}");
        }
    }

    #[test]
    fn test_truncated_header() {
        let err = read_chunk_header(&mut Cursor::new(&[0x80u8, 0x00])).unwrap_err();
        assert!(matches!(err, FerrozError::UnexpectedEof { .. }));
    }
}
