#[macro_use]
pub mod error;

pub mod access_flags;
pub mod annotations;
pub mod class_data;
pub mod class_def;
pub mod encoded_values;
pub mod header;
pub mod ids;
pub mod layout;
pub mod reference;
pub mod section;
pub mod strings;
pub mod type_list;

use crate::dex::error::DexError;

pub use crate::dex::class_def::ClassDef;
pub use crate::dex::layout::DexLayout;
pub use crate::dex::reference::{ByIndex, ByOffset, IndexReference, IndirectField, ItemReference, OffsetReference};
pub use crate::dex::section::{ItemKey, RecordState, SectionLookup, SectionType, Sections};

/// Sentinel stored in 32-bit index fields that point at nothing.
pub const NO_INDEX: u32 = 0xffff_ffff;

// Basic type reading and writing
pub(crate) fn read_u1(bytes: &[u8], ix: &mut usize) -> Result<u8, DexError>
{
    if bytes.len() < *ix + 1
    {
        fail!("Unexpected end of stream reading u1 at index {}", *ix);
    }
    let result = bytes[*ix];
    *ix += 1;
    Ok(result)
}

pub(crate) fn read_u2(bytes: &[u8], ix: &mut usize) -> Result<u16, DexError>
{
    if bytes.len() < *ix + 2
    {
        fail!("Unexpected end of stream reading u2 at index {}", *ix);
    }
    let result = u16::from_le_bytes([bytes[*ix], bytes[*ix + 1]]);
    *ix += 2;
    Ok(result)
}

pub(crate) fn read_u4(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    if bytes.len() < *ix + 4
    {
        fail!("Unexpected end of stream reading u4 at index {}", *ix);
    }
    let result = u32::from_le_bytes([bytes[*ix], bytes[*ix + 1], bytes[*ix + 2], bytes[*ix + 3]]);
    *ix += 4;
    Ok(result)
}

/// Reads an unsigned LEB128 value of at most five bytes.
pub(crate) fn read_uleb128(bytes: &[u8], ix: &mut usize) -> Result<u32, DexError>
{
    let mut value: u32 = 0;
    for i in 0..5
    {
        let byte = read_u1(bytes, ix)?;
        value |= ((byte & 0x7f) as u32).wrapping_shl(7 * i);
        if byte & 0x80 == 0
        {
            return Ok(value);
        }
    }
    fail!("uleb128 longer than five bytes ending at index {}", *ix);
}

pub(crate) fn read_x(bytes: &[u8], ix: &mut usize, length: usize) -> Result<Vec<u8>, DexError>
{
    if bytes.len() < *ix || bytes.len() - *ix < length
    {
        fail!("Unexpected end of stream reading {} bytes at index {}", length, *ix);
    }
    let v = bytes[*ix..*ix + length].to_vec();
    *ix += length;
    Ok(v)
}

pub(crate) fn write_u1(buffer: &mut Vec<u8>, val: u8) -> usize
{
    buffer.push(val);
    1
}

pub(crate) fn write_u2(buffer: &mut Vec<u8>, val: u16) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    2
}

pub(crate) fn write_u4(buffer: &mut Vec<u8>, val: u32) -> usize
{
    buffer.extend_from_slice(&val.to_le_bytes());
    4
}

pub(crate) fn write_uleb128(buffer: &mut Vec<u8>, val: u32) -> usize
{
    let mut remaining = val;
    let mut c = 0;
    loop
    {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining != 0
        {
            byte |= 0x80;
        }
        c += write_u1(buffer, byte);
        if remaining == 0
        {
            return c;
        }
    }
}

pub(crate) fn write_x(buffer: &mut Vec<u8>, val: &[u8]) -> usize
{
    buffer.extend_from_slice(val);
    val.len()
}

pub(crate) fn align(value: u32, alignment: u32) -> u32
{
    if alignment <= 1
    {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn uleb128_boundaries()
    {
        for v in [0u32, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0xffff_ffff]
        {
            let mut bytes = vec![];
            let written = write_uleb128(&mut bytes, v);
            assert_eq!(written, bytes.len());
            let mut ix = 0;
            assert_eq!(read_uleb128(&bytes, &mut ix).unwrap(), v);
            assert_eq!(ix, bytes.len());
        }
    }

    #[test]
    fn truncated_reads_fail()
    {
        let mut ix = 2;
        assert!(read_u4(&[0, 1, 2, 3], &mut ix).is_err());
        let mut ix = 0;
        assert!(read_uleb128(&[0x80, 0x80], &mut ix).is_err());
        let mut ix = 5;
        assert!(read_x(&[0; 4], &mut ix, 1).is_err());
    }

    #[test]
    fn alignment()
    {
        assert_eq!(align(0, 4), 0);
        assert_eq!(align(5, 4), 8);
        assert_eq!(align(8, 4), 8);
        assert_eq!(align(7, 1), 7);
    }
}
