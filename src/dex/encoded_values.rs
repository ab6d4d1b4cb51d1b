use crate::dex::error::DexError;
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::{read_u1, read_uleb128, write_u1, write_uleb128, write_x};
use crate::smali_write::ItemText;

#[derive(Debug, PartialEq, Clone)]
pub struct EncodedAnnotation {
    /// The annotation's type_id.
    pub type_id: ItemKey,
    pub elements: Vec<AnnotationElement>,
}

impl EncodedAnnotation {
    pub fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<EncodedAnnotation, DexError> {
        let type_id = key_at(lookup, SectionType::TypeId, read_uleb128(bytes, ix)?)?;
        let size = read_uleb128(bytes, ix)? as usize;
        let mut elements = Vec::with_capacity(size.min(1024));

        for _ in 0..size {
            let element = AnnotationElement::read(bytes, ix, lookup)?;
            elements.push(element);
        }

        Ok(EncodedAnnotation { type_id, elements })
    }

    pub fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        let mut c = 0;

        c += write_uleb128(bytes, live_index(lookup, self.type_id, "type")?);
        c += write_uleb128(bytes, self.elements.len() as u32);

        for element in &self.elements {
            c += element.write(bytes, lookup)?;
        }

        Ok(c)
    }

    /// One-line form used inside values: `.subannotation T name = v, ... .end subannotation`.
    pub fn render(&self, names: &dyn ItemText) -> Result<String, DexError> {
        let mut out = format!(".subannotation {}", names.item_text(self.type_id)?);
        for (i, e) in self.elements.iter().enumerate() {
            out.push_str(if i == 0 { " " } else { ", " });
            out.push_str(&e.render(names)?);
        }
        out.push_str(" .end subannotation");
        Ok(out)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct AnnotationElement {
    /// The element name's string_data.
    pub name: ItemKey,
    pub value: EncodedValue,
}

impl AnnotationElement {
    pub fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<AnnotationElement, DexError> {
        let name = key_at(lookup, SectionType::StringData, read_uleb128(bytes, ix)?)?;
        let value = EncodedValue::read(bytes, ix, lookup)?;

        Ok(AnnotationElement { name, value })
    }

    pub fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        let mut c = 0;

        c += write_uleb128(bytes, live_index(lookup, self.name, "name")?);
        c += self.value.write(bytes, lookup)?;

        Ok(c)
    }

    /// `name = value`
    pub fn render(&self, names: &dyn ItemText) -> Result<String, DexError> {
        Ok(format!("{} = {}", names.string_text(self.name)?, self.value.render(names)?))
    }
}

/// An encoded_value. Items in managed sections are held as keys and written with their
/// live index; method handles are not managed and keep the raw index.
#[derive(Debug, PartialEq, Clone)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(ItemKey),
    MethodHandle(u32),
    String(ItemKey),
    Type(ItemKey),
    Field(ItemKey),
    Method(ItemKey),
    Enum(ItemKey),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

impl EncodedValue
{
    #[inline]
    pub fn as_annotation(&self) -> Option<&EncodedAnnotation> {
        match self {
            EncodedValue::Annotation(ann) => Some(ann),
            _ => None,
        }
    }

    /// Smali literal text of the value.
    pub fn render(&self, names: &dyn ItemText) -> Result<String, DexError>
    {
        Ok(match self
        {
            EncodedValue::Byte(x) => format!("{}t", x),
            EncodedValue::Short(x) => format!("{}s", x),
            EncodedValue::Char(x) => match char::from_u32(*x as u32) {
                Some(c) if !c.is_control() && c != '\'' && c != '\\' => format!("'{}'", c),
                _ => format!("'\\u{:04x}'", x),
            },
            EncodedValue::Int(x) => format!("{}", x),
            EncodedValue::Long(x) => format!("{}L", x),
            EncodedValue::Float(x) => format!("{:?}f", x),
            EncodedValue::Double(x) => format!("{:?}", x),
            EncodedValue::MethodHandle(x) => format!("<method_handle {}>", x),
            EncodedValue::MethodType(k)
            | EncodedValue::String(k)
            | EncodedValue::Type(k)
            | EncodedValue::Field(k)
            | EncodedValue::Method(k) => names.item_text(*k)?,
            EncodedValue::Enum(k) => format!(".enum {}", names.item_text(*k)?),
            EncodedValue::Array(v) => {
                let items = v.iter().map(|i| i.render(names)).collect::<Result<Vec<_>, _>>()?;
                if items.is_empty() { "{}".to_string() } else { format!("{{ {} }}", items.join(", ")) }
            }
            EncodedValue::Annotation(ea) => ea.render(names)?,
            EncodedValue::Null => "null".to_string(),
            EncodedValue::Boolean(b) => b.to_string(),
        })
    }

    pub fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<EncodedValue, DexError> {
        let header_byte = read_u1(bytes, ix)?;
        let value_arg = header_byte >> 5;
        let value_type = header_byte & 0x1F;
        let size = (value_arg + 1) as usize;

        let check_size = |max: usize| -> Result<(), DexError> {
            if size > max {
                fail!("encoded value type 0x{:02x} with {} bytes", value_type, size);
            }
            Ok(())
        };

        match value_type {
            0x00 => {
                check_size(1)?;
                Ok(EncodedValue::Byte(read_u1(bytes, ix)? as i8))
            },
            0x02 => {
                check_size(2)?;
                Ok(EncodedValue::Short(read_signed(bytes, ix, size)? as i16))
            },
            0x03 => {
                check_size(2)?;
                Ok(EncodedValue::Char(read_unsigned(bytes, ix, size)? as u16))
            },
            0x04 => {
                check_size(4)?;
                Ok(EncodedValue::Int(read_signed(bytes, ix, size)? as i32))
            },
            0x06 => {
                check_size(8)?;
                Ok(EncodedValue::Long(read_signed(bytes, ix, size)?))
            },
            0x10 => {
                check_size(4)?;
                let bits = read_unsigned(bytes, ix, size)? << ((4 - size) * 8);
                Ok(EncodedValue::Float(f32::from_bits(bits as u32)))
            },
            0x11 => {
                check_size(8)?;
                let bits = read_unsigned(bytes, ix, size)? << ((8 - size) * 8);
                Ok(EncodedValue::Double(f64::from_bits(bits)))
            },
            0x15..=0x1b => {
                check_size(4)?;
                let index = read_unsigned(bytes, ix, size)? as u32;
                let section = match value_type {
                    0x15 => SectionType::ProtoId,
                    0x16 => return Ok(EncodedValue::MethodHandle(index)),
                    0x17 => SectionType::StringData,
                    0x18 => SectionType::TypeId,
                    0x19 | 0x1b => SectionType::FieldId,
                    _ => SectionType::MethodId,
                };
                let key = key_at(lookup, section, index)?;
                Ok(match value_type {
                    0x15 => EncodedValue::MethodType(key),
                    0x17 => EncodedValue::String(key),
                    0x18 => EncodedValue::Type(key),
                    0x19 => EncodedValue::Field(key),
                    0x1a => EncodedValue::Method(key),
                    _ => EncodedValue::Enum(key),
                })
            },
            0x1C => Ok(EncodedValue::Array(read_encoded_array(bytes, ix, lookup)?)),
            0x1D => Ok(EncodedValue::Annotation(EncodedAnnotation::read(bytes, ix, lookup)?)),
            0x1E => Ok(EncodedValue::Null),
            0x1F => Ok(EncodedValue::Boolean(value_arg != 0)),
            _ => fail!("Unknown EncodedValue type 0x{:02x}", value_type),
        }
    }

    pub fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError>
    {
        let c = match self {
            EncodedValue::Byte(val) => write_u1(bytes, 0x00) + write_u1(bytes, *val as u8),
            EncodedValue::Short(value) => write_signed(bytes, 0x02, *value as i64),
            EncodedValue::Char(value) => write_unsigned(bytes, 0x03, *value as u64),
            EncodedValue::Int(value) => write_signed(bytes, 0x04, *value as i64),
            EncodedValue::Long(value) => write_signed(bytes, 0x06, *value),
            EncodedValue::Float(value) => write_right_zero_extended(bytes, 0x10, value.to_bits() as u64, 4),
            EncodedValue::Double(value) => write_right_zero_extended(bytes, 0x11, value.to_bits(), 8),
            EncodedValue::MethodType(key) => write_unsigned(bytes, 0x15, live_index(lookup, *key, "method_type")? as u64),
            EncodedValue::MethodHandle(value) => write_unsigned(bytes, 0x16, *value as u64),
            EncodedValue::String(key) => write_unsigned(bytes, 0x17, live_index(lookup, *key, "string")? as u64),
            EncodedValue::Type(key) => write_unsigned(bytes, 0x18, live_index(lookup, *key, "type")? as u64),
            EncodedValue::Field(key) => write_unsigned(bytes, 0x19, live_index(lookup, *key, "field")? as u64),
            EncodedValue::Method(key) => write_unsigned(bytes, 0x1a, live_index(lookup, *key, "method")? as u64),
            EncodedValue::Enum(key) => write_unsigned(bytes, 0x1b, live_index(lookup, *key, "enum")? as u64),
            EncodedValue::Array(value) => write_u1(bytes, 0x1c) + write_encoded_array(value, bytes, lookup)?,
            EncodedValue::Annotation(value) => write_u1(bytes, 0x1d) + value.write(bytes, lookup)?,
            EncodedValue::Null => write_u1(bytes, 0x1e),
            EncodedValue::Boolean(val) => write_u1(bytes, 0x1f | ((*val as u8) << 5)),
        };
        Ok(c)
    }
}

fn key_at(lookup: &dyn SectionLookup, section: SectionType, index: u32) -> Result<ItemKey, DexError> {
    match lookup.key_at_index(section, index)? {
        Some(key) => Ok(key),
        None => fail!("encoded value refers to missing {} {}", section, index),
    }
}

fn live_index(lookup: &dyn SectionLookup, key: ItemKey, field: &str) -> Result<u32, DexError> {
    lookup
        .index_of(key)?
        .ok_or_else(|| DexError::consistency("encoded_value", field, &format!("{} was removed", key)))
}

fn read_unsigned(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u64, DexError> {
    let mut result = 0u64;
    for i in 0..size {
        result |= (read_u1(bytes, ix)? as u64) << (8 * i);
    }
    Ok(result)
}

fn read_signed(bytes: &[u8], ix: &mut usize, size: usize) -> Result<i64, DexError> {
    let shift = 64 - 8 * size as u32;
    Ok(((read_unsigned(bytes, ix, size)? << shift) as i64) >> shift)
}

fn write_header_and(bytes: &mut Vec<u8>, value_type: u8, payload: &[u8]) -> usize {
    write_u1(bytes, (((payload.len() - 1) as u8) << 5) | value_type) + write_x(bytes, payload)
}

/// Fewest bytes that sign-extend back to `value`.
fn write_signed(bytes: &mut Vec<u8>, value_type: u8, value: i64) -> usize {
    let le = value.to_le_bytes();
    let mut size = 8;
    while size > 1 {
        let top = le[size - 1];
        let next_negative = le[size - 2] & 0x80 != 0;
        if (top == 0 && !next_negative) || (top == 0xff && next_negative) {
            size -= 1;
        } else {
            break;
        }
    }
    write_header_and(bytes, value_type, &le[..size])
}

fn write_unsigned(bytes: &mut Vec<u8>, value_type: u8, value: u64) -> usize {
    let size = ((64 - value.leading_zeros() as usize + 7) / 8).max(1);
    write_header_and(bytes, value_type, &value.to_le_bytes()[..size])
}

/// Floating point values drop their low-order zero bytes.
fn write_right_zero_extended(bytes: &mut Vec<u8>, value_type: u8, bits: u64, width: usize) -> usize {
    let dropped = (bits.trailing_zeros() as usize / 8).min(width - 1);
    write_header_and(bytes, value_type, &bits.to_le_bytes()[dropped..width])
}

pub fn write_encoded_array(encoded_array: &[EncodedValue], bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError>
{
    let mut c = write_uleb128(bytes, encoded_array.len() as u32);
    for value in encoded_array {
        c += value.write(bytes, lookup)?;
    }
    Ok(c)
}

pub fn read_encoded_array(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<Vec<EncodedValue>, DexError>
{
    let size = read_uleb128(bytes, ix)? as usize;

    let mut values = Vec::with_capacity(size.min(1024));
    for _ in 0..size
    {
        values.push(EncodedValue::read(bytes, ix, lookup)?);
    }

    Ok(values)
}

/// encoded_array_item, holding a class's static field initial values.
#[derive(Debug)]
pub struct EncodedArray {
    state: RecordState,
    pub values: Vec<EncodedValue>,
}

impl EncodedArray {
    pub fn new(values: Vec<EncodedValue>) -> Self {
        EncodedArray { state: RecordState::Unbound, values }
    }
}

impl SectionItem for EncodedArray {
    const SECTION: SectionType = SectionType::EncodedArray;

    fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<Self, DexError> {
        Ok(EncodedArray::new(read_encoded_array(bytes, ix, lookup)?))
    }

    fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        write_encoded_array(&self.values, bytes, lookup)
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::section::Sections;

    fn lookup() -> Sections {
        Sections::new(&SectionType::DEX)
    }

    fn check(bytes: &[u8], expected: EncodedValue) {
        let s = lookup();
        let mut ix = 0;
        let value = EncodedValue::read(bytes, &mut ix, &s).expect("Failed to read EncodedValue");
        assert_eq!(value, expected);
        assert_eq!(ix, bytes.len());
        let mut out = vec![];
        assert_eq!(value.write(&mut out, &s).unwrap(), bytes.len());
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_encoded_value_byte() {
        check(&[0x00, 0x7F], EncodedValue::Byte(127));
    }

    #[test]
    fn test_encoded_value_short() {
        check(&[0x22, 0x34, 0x12], EncodedValue::Short(0x1234));
    }

    #[test]
    fn test_encoded_value_char() {
        check(&[0x23, 0x34, 0x12], EncodedValue::Char(0x1234));
    }

    #[test]
    fn test_encoded_value_int() {
        check(&[0x64, 0x78, 0x56, 0x34, 0x12], EncodedValue::Int(0x12345678));
    }

    #[test]
    fn negative_ints_sign_extend() {
        check(&[0x04, 0xff], EncodedValue::Int(-1));
        check(&[0x24, 0x80, 0x00], EncodedValue::Int(0x80));
        check(&[0x26, 0x00, 0x80], EncodedValue::Long(-32768));
    }

    #[test]
    fn floats_keep_high_order_bytes() {
        // 1.0f = 0x3f800000
        check(&[0x30, 0x80, 0x3f], EncodedValue::Float(1.0));
        check(&[0x11, 0x40], EncodedValue::Double(2.0));
    }

    #[test]
    fn test_encoded_value_null_and_booleans() {
        check(&[0x1E], EncodedValue::Null);
        check(&[0x1F | (1 << 5)], EncodedValue::Boolean(true));
        check(&[0x1F], EncodedValue::Boolean(false));
    }

    #[test]
    fn indices_resolve_to_live_items() {
        let mut s = lookup();
        for _ in 0..3 {
            s.map_mut(SectionType::StringData).unwrap().push();
        }
        let mut ix = 0;
        let value = EncodedValue::read(&[0x17, 0x02], &mut ix, &s).unwrap();
        assert_eq!(value, EncodedValue::String(ItemKey::new(SectionType::StringData, 2)));

        // an earlier string goes away, the value follows its target
        s.map_mut(SectionType::StringData).unwrap().remove(0);
        let mut out = vec![];
        value.write(&mut out, &s).unwrap();
        assert_eq!(out, vec![0x17, 0x01]);

        s.map_mut(SectionType::StringData).unwrap().remove(2);
        assert!(value.write(&mut vec![], &s).is_err());
        let mut ix = 0;
        assert!(EncodedValue::read(&[0x17, 0x09], &mut ix, &s).is_err());
    }

    #[test]
    fn test_encoded_annotation_read_write() {
        let mut s = lookup();
        s.map_mut(SectionType::TypeId).unwrap().push();
        for _ in 0..4 {
            s.map_mut(SectionType::StringData).unwrap().push();
        }
        let annotation = EncodedAnnotation {
            type_id: ItemKey::new(SectionType::TypeId, 0),
            elements: vec![
                AnnotationElement { name: ItemKey::new(SectionType::StringData, 2), value: EncodedValue::Boolean(true) },
                AnnotationElement { name: ItemKey::new(SectionType::StringData, 3), value: EncodedValue::Int(42) },
            ],
        };

        let mut bytes = vec![];
        annotation.write(&mut bytes, &s).unwrap();
        assert_eq!(bytes, vec![0, 2, 2, 0x3f, 3, 0x04, 42]);

        let mut ix = 0;
        let read_annotation = EncodedAnnotation::read(&bytes, &mut ix, &s).expect("Failed to read EncodedAnnotation");
        assert_eq!(annotation, read_annotation);
    }
}
