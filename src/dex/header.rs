use crate::dex::error::DexError;
use crate::dex::ids::read_fixed;
use crate::dex::{read_u2, read_u4, write_u2, write_u4, write_x};

/// Magic written on output; any `dex\n0NN\0` is accepted on input.
pub const DEX_MAGIC: [u8; 8] = *b"dex\n035\0";
pub const HEADER_SIZE: u32 = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;

pub const TYPE_HEADER_ITEM: u16 = 0x0000;
pub const TYPE_STRING_ID_ITEM: u16 = 0x0001;
pub const TYPE_MAP_LIST: u16 = 0x1000;
pub const TYPE_CODE_ITEM: u16 = 0x2001;

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Header
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Header, DexError>
    {
        if bytes.len() < HEADER_SIZE as usize {
            fail!("Not enough bytes for header");
        }

        let magic: [u8; 8] = read_fixed(bytes, ix)?;
        if &magic[0..4] != b"dex\n" || magic[7] != 0 {
            fail!("Invalid magic value");
        }

        let header = Header {
            magic,
            checksum: read_u4(bytes, ix)?,
            signature: read_fixed(bytes, ix)?,
            file_size: read_u4(bytes, ix)?,
            header_size: read_u4(bytes, ix)?,
            endian_tag: read_u4(bytes, ix)?,
            link_size: read_u4(bytes, ix)?,
            link_off: read_u4(bytes, ix)?,
            map_off: read_u4(bytes, ix)?,
            string_ids_size: read_u4(bytes, ix)?,
            string_ids_off: read_u4(bytes, ix)?,
            type_ids_size: read_u4(bytes, ix)?,
            type_ids_off: read_u4(bytes, ix)?,
            proto_ids_size: read_u4(bytes, ix)?,
            proto_ids_off: read_u4(bytes, ix)?,
            field_ids_size: read_u4(bytes, ix)?,
            field_ids_off: read_u4(bytes, ix)?,
            method_ids_size: read_u4(bytes, ix)?,
            method_ids_off: read_u4(bytes, ix)?,
            class_defs_size: read_u4(bytes, ix)?,
            class_defs_off: read_u4(bytes, ix)?,
            data_size: read_u4(bytes, ix)?,
            data_off: read_u4(bytes, ix)?,
        };
        if header.endian_tag != ENDIAN_CONSTANT {
            fail!("Unsupported endian tag 0x{:08x}", header.endian_tag);
        }
        Ok(header)
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link_size);
        c += write_u4(bytes, self.link_off);
        c += write_u4(bytes, self.map_off);
        c += write_u4(bytes, self.string_ids_size);
        c += write_u4(bytes, self.string_ids_off);
        c += write_u4(bytes, self.type_ids_size);
        c += write_u4(bytes, self.type_ids_off);
        c += write_u4(bytes, self.proto_ids_size);
        c += write_u4(bytes, self.proto_ids_off);
        c += write_u4(bytes, self.field_ids_size);
        c += write_u4(bytes, self.field_ids_off);
        c += write_u4(bytes, self.method_ids_size);
        c += write_u4(bytes, self.method_ids_off);
        c += write_u4(bytes, self.class_defs_size);
        c += write_u4(bytes, self.class_defs_off);
        c += write_u4(bytes, self.data_size);
        c += write_u4(bytes, self.data_off);
        c
    }
}

/// One map_list entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MapItem {
    pub type_code: u16,
    pub size: u32,
    pub offset: u32,
}

pub fn read_map_list(bytes: &[u8], ix: &mut usize) -> Result<Vec<MapItem>, DexError> {
    let size = read_u4(bytes, ix)?;
    let mut items = Vec::with_capacity(size.min(64) as usize);
    for _ in 0..size {
        let type_code = read_u2(bytes, ix)?;
        read_u2(bytes, ix)?;
        items.push(MapItem { type_code, size: read_u4(bytes, ix)?, offset: read_u4(bytes, ix)? });
    }
    Ok(items)
}

pub fn write_map_list(items: &[MapItem], bytes: &mut Vec<u8>) -> usize {
    let mut c = write_u4(bytes, items.len() as u32);
    for item in items {
        c += write_u2(bytes, item.type_code);
        c += write_u2(bytes, 0);
        c += write_u4(bytes, item.size);
        c += write_u4(bytes, item.offset);
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            magic: DEX_MAGIC,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            string_ids_size: 3,
            string_ids_off: 0x70,
            ..Default::default()
        };
        let mut bytes = vec![];
        assert_eq!(header.write(&mut bytes), HEADER_SIZE as usize);
        let mut ix = 0;
        assert_eq!(Header::read(&bytes, &mut ix).unwrap(), header);
    }

    #[test]
    fn rejects_bad_magic_and_short_input() {
        let mut ix = 0;
        assert!(Header::read(&[0; 16], &mut ix).is_err());
        let mut bytes = vec![];
        Header { magic: *b"zip\n035\0", endian_tag: ENDIAN_CONSTANT, ..Default::default() }.write(&mut bytes);
        let mut ix = 0;
        assert!(Header::read(&bytes, &mut ix).is_err());
    }

    #[test]
    fn map_list_layout() {
        let items = [MapItem { type_code: TYPE_HEADER_ITEM, size: 1, offset: 0 }];
        let mut bytes = vec![];
        assert_eq!(write_map_list(&items, &mut bytes), 16);
        let mut ix = 0;
        assert_eq!(read_map_list(&bytes, &mut ix).unwrap(), items);
    }
}
