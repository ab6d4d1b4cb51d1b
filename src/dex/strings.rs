/* string_data_item: uleb128 utf16 length followed by MUTF-8 bytes and a NUL */

use std::cmp::Ordering;
use std::fmt;

use cesu8::{from_java_cesu8, to_java_cesu8};

use crate::dex::error::DexError;
use crate::dex::section::{RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::{read_u1, read_uleb128, write_u1, write_uleb128, write_x};

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString
{
    Decoded(String),
    /// Bytes that are not valid MUTF-8, kept verbatim with their declared utf16 length.
    Raw(u32, Vec<u8>),
}

#[derive(Debug)]
pub struct StringData
{
    state: RecordState,
    value: DexString,
}

impl StringData
{
    pub fn new(s: &str) -> StringData
    {
        StringData { state: RecordState::Unbound, value: DexString::Decoded(s.to_string()) }
    }

    pub fn value(&self) -> &DexString
    {
        &self.value
    }

    /// The decoded text, `None` for raw undecodable data.
    pub fn as_str(&self) -> Option<&str>
    {
        match &self.value
        {
            DexString::Decoded(s) => Some(s),
            DexString::Raw(_, _) => None,
        }
    }

    pub fn set(&mut self, s: &str)
    {
        self.value = DexString::Decoded(s.to_string());
    }

    /// Dex string order: by UTF-16 code units, raw strings last.
    pub fn dex_cmp(&self, other: &str) -> Ordering
    {
        match &self.value
        {
            DexString::Decoded(s) => s.encode_utf16().cmp(other.encode_utf16()),
            DexString::Raw(_, _) => Ordering::Greater,
        }
    }

    /// Appends the smali literal form, `"..."` with escapes.
    pub fn write_quoted(&self, out: &mut String)
    {
        out.push('"');
        match &self.value
        {
            DexString::Decoded(s) => {
                for c in s.chars()
                {
                    match c
                    {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c if (c as u32) < 0x20 || (c as u32) == 0x7f => out.push_str(&format!("\\u{:04x}", c as u32)),
                        c => out.push(c),
                    }
                }
            }
            DexString::Raw(_, bytes) => {
                for b in bytes { out.push_str(&format!("\\x{:02x}", b)); }
            }
        }
        out.push('"');
    }
}

impl fmt::Display for StringData
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match &self.value
        {
            DexString::Decoded(s) => f.write_str(s),
            DexString::Raw(size, bytes) => write!(f, "<raw string: {} units, {} bytes>", size, bytes.len()),
        }
    }
}

impl SectionItem for StringData
{
    const SECTION: SectionType = SectionType::StringData;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<StringData, DexError>
    {
        let utf16_size = read_uleb128(bytes, ix)?;
        let mut v = vec![];
        loop
        {
            let u = read_u1(bytes, ix)?;
            if u != 0 { v.push(u); }
            else { break; }
        }

        let value = match from_java_cesu8(v.as_slice())
        {
            Ok(converted) => DexString::Decoded(converted.to_string()),
            Err(_) => DexString::Raw(utf16_size, v),
        };
        Ok(StringData { state: RecordState::Unbound, value })
    }

    fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError>
    {
        let mut c = 0;
        match &self.value
        {
            DexString::Raw(utf16_size, v) => {
                c += write_uleb128(bytes, *utf16_size);
                c += write_x(bytes, v);
            }
            DexString::Decoded(s) => {
                c += write_uleb128(bytes, s.encode_utf16().count() as u32);
                c += write_x(bytes, &to_java_cesu8(s));
            }
        }
        c += write_u1(bytes, 0);
        Ok(c)
    }

    fn state(&self) -> RecordState
    {
        self.state
    }

    fn set_state(&mut self, state: RecordState)
    {
        self.state = state;
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dex::section::Sections;

    #[test]
    fn supplementary_characters_use_surrogate_encoding()
    {
        let lookup = Sections::new(&[]);
        let s = StringData::new("a\u{1F600}");
        let mut bytes = vec![];
        s.write(&mut bytes, &lookup).unwrap();
        // 3 utf16 units, 'a' + 6-byte surrogate pair + NUL
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes.len(), 1 + 1 + 6 + 1);

        let mut ix = 0;
        let back = StringData::read(&bytes, &mut ix, &lookup).unwrap();
        assert_eq!(back.as_str(), Some("a\u{1F600}"));
        assert_eq!(ix, bytes.len());
    }

    #[test]
    fn embedded_nul_is_two_bytes()
    {
        let lookup = Sections::new(&[]);
        let mut bytes = vec![];
        StringData::new("a\0b").write(&mut bytes, &lookup).unwrap();
        assert_eq!(bytes, vec![3, b'a', 0xc0, 0x80, b'b', 0]);
    }

    #[test]
    fn invalid_mutf8_is_kept_raw()
    {
        let lookup = Sections::new(&[]);
        let bytes = vec![1, 0xff, 0];
        let mut ix = 0;
        let s = StringData::read(&bytes, &mut ix, &lookup).unwrap();
        assert_eq!(s.as_str(), None);
        let mut out = vec![];
        s.write(&mut out, &lookup).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn ordering_uses_utf16_units()
    {
        // U+FFFF sorts after a surrogate pair in UTF-16 but before it in UTF-8
        let s = StringData::new("\u{FFFF}");
        assert_eq!(s.dex_cmp("\u{10000}"), Ordering::Greater);
        assert_eq!(StringData::new("Lb;").dex_cmp("La;"), Ordering::Greater);
    }

    #[test]
    fn quoted_form_escapes()
    {
        let mut out = String::new();
        StringData::new("A\"b\n").write_quoted(&mut out);
        assert_eq!(out, "\"A\\\"b\\n\"");
    }
}
