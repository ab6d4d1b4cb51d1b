use crate::dex::access_flags::AccessFlags;
use crate::dex::error::DexError;
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::{read_uleb128, write_uleb128};

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedField
{
    /// The field_id this member defines.
    pub field: ItemKey,
    pub access_flags: AccessFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMethod
{
    pub method: ItemKey,
    pub access_flags: AccessFlags,
    /// Offset of the method's code_item, 0 for abstract and native methods. Code items are
    /// not parsed, so a non-zero value cannot survive a relayout.
    pub code_off: u32,
}

/// class_data_item: the members a class defines, grouped in four lists.
#[derive(Debug, Default)]
pub struct ClassData {
    state: RecordState,
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassData
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.static_fields.is_empty()
            && self.instance_fields.is_empty()
            && self.direct_methods.is_empty()
            && self.virtual_methods.is_empty()
    }

    /// Methods that still point at a code item.
    pub fn methods_with_code(&self) -> impl Iterator<Item = &EncodedMethod> {
        self.direct_methods.iter().chain(self.virtual_methods.iter()).filter(|m| m.code_off != 0)
    }
}

fn read_members(
    bytes: &[u8],
    ix: &mut usize,
    count: u32,
    section: SectionType,
    lookup: &dyn SectionLookup,
    with_code: bool,
) -> Result<Vec<(ItemKey, AccessFlags, u32)>, DexError>
{
    let mut members = Vec::with_capacity(count.min(4096) as usize);
    let mut index = 0u32;
    for i in 0..count
    {
        let diff = read_uleb128(bytes, ix)?;
        index = if i == 0 { diff } else { index.checked_add(diff).ok_or_else(|| DexError::new("class_data member index overflow"))? };
        let access_flags = AccessFlags::from_raw(read_uleb128(bytes, ix)?);
        let code_off = if with_code { read_uleb128(bytes, ix)? } else { 0 };
        let key = match lookup.key_at_index(section, index)? {
            Some(key) => key,
            None => fail!("class_data refers to missing {} {}", section, index),
        };
        members.push((key, access_flags, code_off));
    }
    Ok(members)
}

/// Writes `(key, flags, code)` triples with delta-encoded live indices.
fn write_members(
    bytes: &mut Vec<u8>,
    group: &str,
    members: impl Iterator<Item = (ItemKey, AccessFlags, Option<u32>)>,
    lookup: &dyn SectionLookup,
) -> Result<usize, DexError>
{
    let mut c = 0;
    let mut last: Option<u32> = None;
    for (key, flags, code_off) in members
    {
        let index = lookup
            .index_of(key)?
            .ok_or_else(|| DexError::consistency("class_data", group, &format!("{} was removed", key)))?;
        let diff = match last
        {
            None => index,
            Some(prev) if index > prev => index - prev,
            Some(_) => return Err(DexError::consistency("class_data", group, "member indices are not ascending")),
        };
        last = Some(index);
        c += write_uleb128(bytes, diff);
        c += write_uleb128(bytes, flags.bits());
        if let Some(code_off) = code_off {
            c += write_uleb128(bytes, code_off);
        }
    }
    Ok(c)
}

impl SectionItem for ClassData
{
    const SECTION: SectionType = SectionType::ClassData;

    fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<ClassData, DexError>
    {
        let static_field_size = read_uleb128(bytes, ix)?;
        let instance_field_size = read_uleb128(bytes, ix)?;
        let direct_method_size = read_uleb128(bytes, ix)?;
        let virtual_method_size = read_uleb128(bytes, ix)?;

        let fields = |v: Vec<(ItemKey, AccessFlags, u32)>| -> Vec<EncodedField> {
            v.into_iter().map(|(field, access_flags, _)| EncodedField { field, access_flags }).collect()
        };
        let methods = |v: Vec<(ItemKey, AccessFlags, u32)>| -> Vec<EncodedMethod> {
            v.into_iter()
                .map(|(method, access_flags, code_off)| EncodedMethod { method, access_flags, code_off })
                .collect()
        };

        let static_fields = fields(read_members(bytes, ix, static_field_size, SectionType::FieldId, lookup, false)?);
        let instance_fields = fields(read_members(bytes, ix, instance_field_size, SectionType::FieldId, lookup, false)?);
        let direct_methods = methods(read_members(bytes, ix, direct_method_size, SectionType::MethodId, lookup, true)?);
        let virtual_methods = methods(read_members(bytes, ix, virtual_method_size, SectionType::MethodId, lookup, true)?);

        Ok(ClassData { state: RecordState::Unbound, static_fields, instance_fields, direct_methods, virtual_methods })
    }

    fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError>
    {
        let mut c = 0;
        c += write_uleb128(bytes, self.static_fields.len() as u32);
        c += write_uleb128(bytes, self.instance_fields.len() as u32);
        c += write_uleb128(bytes, self.direct_methods.len() as u32);
        c += write_uleb128(bytes, self.virtual_methods.len() as u32);

        let field = |f: &EncodedField| (f.field, f.access_flags, None);
        let method = |m: &EncodedMethod| (m.method, m.access_flags, Some(m.code_off));
        c += write_members(bytes, "static_fields", self.static_fields.iter().map(field), lookup)?;
        c += write_members(bytes, "instance_fields", self.instance_fields.iter().map(field), lookup)?;
        c += write_members(bytes, "direct_methods", self.direct_methods.iter().map(method), lookup)?;
        c += write_members(bytes, "virtual_methods", self.virtual_methods.iter().map(method), lookup)?;
        Ok(c)
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }
}
