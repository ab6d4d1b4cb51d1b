//! Fixed-size id records: type_id_item, proto_id_item, field_id_item and method_id_item.
//!
//! Each keeps its on-disk bytes and reads/writes the cross references through
//! [`ItemReference`]s laid over those bytes.

use std::marker::PhantomData;

use crate::dex::error::DexError;
use crate::dex::read_x;
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::write_x;

pub(crate) fn read_fixed<const N: usize>(bytes: &[u8], ix: &mut usize) -> Result<[u8; N], DexError> {
    let v = read_x(bytes, ix, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&v);
    Ok(out)
}

/// Reads a reference of a live record, or reports absent once the record was removed.
macro_rules! live_resolve {
    ($self:ident, $field:ident, $lookup:ident) => {{
        if !$self.state.check(Self::NAME, $self.$field.name())? {
            return Ok(None);
        }
        $self.$field.resolve(&$self.bytes, $lookup)
    }};
}

#[derive(Debug)]
pub struct TypeId {
    state: RecordState,
    bytes: [u8; 4],
    descriptor: IndexReference,
}

impl TypeId {
    pub const SIZE: usize = 4;
    const NAME: &'static str = "type_id";

    pub fn new() -> Self {
        Self::from_bytes([0xff; 4])
    }

    fn from_bytes(bytes: [u8; 4]) -> Self {
        TypeId {
            state: RecordState::Unbound,
            bytes,
            descriptor: IndexReference::new(Self::NAME, "descriptor", SectionType::StringData, 0),
        }
    }

    pub fn descriptor(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, descriptor, lookup)
    }

    pub fn set_descriptor(&mut self, string: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "descriptor")?;
        self.descriptor.set(&mut self.bytes, Some(string), lookup)
    }
}

impl Default for TypeId {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionItem for TypeId {
    const SECTION: SectionType = SectionType::TypeId;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<Self, DexError> {
        Ok(Self::from_bytes(read_fixed(bytes, ix)?))
    }

    fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        Ok(write_x(bytes, &self.bytes))
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.descriptor.refresh(&mut self.bytes, lookup)?;
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.descriptor.resolve(&self.bytes, lookup)?;
        Ok(())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.descriptor.check_live(&self.bytes, lookup)
    }
}

/// proto_id_item: shorty, return type and parameter list of a method.
#[derive(Debug)]
pub struct ProtoId {
    state: RecordState,
    bytes: [u8; 12],
    shorty: IndexReference,
    return_type: IndexReference,
    parameters: OffsetReference,
}

impl ProtoId {
    pub const SIZE: usize = 12;
    const NAME: &'static str = "proto_id";

    pub fn new() -> Self {
        let mut bytes = [0xff; 12];
        bytes[8..12].copy_from_slice(&[0; 4]);
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: [u8; 12]) -> Self {
        ProtoId {
            state: RecordState::Unbound,
            bytes,
            shorty: IndexReference::new(Self::NAME, "shorty", SectionType::StringData, 0),
            return_type: IndexReference::new(Self::NAME, "return_type", SectionType::TypeId, 4),
            parameters: OffsetReference::new(Self::NAME, "parameters", SectionType::TypeList, 8),
        }
    }

    pub fn shorty(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, shorty, lookup)
    }

    pub fn set_shorty(&mut self, string: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "shorty")?;
        self.shorty.set(&mut self.bytes, Some(string), lookup)
    }

    pub fn return_type(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, return_type, lookup)
    }

    pub fn set_return_type(&mut self, type_id: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "return_type")?;
        self.return_type.set(&mut self.bytes, Some(type_id), lookup)
    }

    /// The parameter type list, `None` for a method without parameters.
    pub fn parameters(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, parameters, lookup)
    }

    pub fn set_parameters(&mut self, list: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "parameters")?;
        self.parameters.set(&mut self.bytes, list, lookup)
    }

    pub(crate) fn parameters_offset(&self) -> u32 {
        self.parameters.stored(&self.bytes)
    }
}

impl Default for ProtoId {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionItem for ProtoId {
    const SECTION: SectionType = SectionType::ProtoId;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<Self, DexError> {
        Ok(Self::from_bytes(read_fixed(bytes, ix)?))
    }

    fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        Ok(write_x(bytes, &self.bytes))
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    fn outgoing_offsets(&self) -> Vec<(SectionType, u32)> {
        match self.parameters_offset() {
            0 => vec![],
            offset => vec![(SectionType::TypeList, offset)],
        }
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.shorty.refresh(&mut self.bytes, lookup)?;
        self.return_type.refresh(&mut self.bytes, lookup)?;
        self.parameters.refresh(&mut self.bytes, lookup)?;
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.shorty.resolve(&self.bytes, lookup)?;
        self.return_type.resolve(&self.bytes, lookup)?;
        self.parameters.resolve(&self.bytes, lookup)?;
        Ok(())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.shorty.check_live(&self.bytes, lookup)?;
        self.return_type.check_live(&self.bytes, lookup)?;
        self.parameters.check_live(&self.bytes, lookup)
    }
}

pub type FieldId = MemberId<FieldKind>;
pub type MethodId = MemberId<MethodKind>;

/// Marker for the two member id sections.
pub trait MemberKind {
    const SECTION: SectionType;
    const NAME: &'static str;
    /// Section the 16-bit middle field points into: the field's type or the method's proto.
    const DESCRIPTOR: SectionType;
    const DESCRIPTOR_FIELD: &'static str;
}

#[derive(Debug)]
pub struct FieldKind;

#[derive(Debug)]
pub struct MethodKind;

impl MemberKind for FieldKind {
    const SECTION: SectionType = SectionType::FieldId;
    const NAME: &'static str = "field_id";
    const DESCRIPTOR: SectionType = SectionType::TypeId;
    const DESCRIPTOR_FIELD: &'static str = "type";
}

impl MemberKind for MethodKind {
    const SECTION: SectionType = SectionType::MethodId;
    const NAME: &'static str = "method_id";
    const DESCRIPTOR: SectionType = SectionType::ProtoId;
    const DESCRIPTOR_FIELD: &'static str = "proto";
}

/// field_id_item and method_id_item share one shape: a class, a 16-bit second index and a name.
#[derive(Debug)]
pub struct MemberId<K> {
    state: RecordState,
    bytes: [u8; 8],
    class: IndexReference<u16>,
    descriptor: IndexReference<u16>,
    name: IndexReference,
    _kind: PhantomData<K>,
}

impl<K: MemberKind> MemberId<K> {
    pub const SIZE: usize = 8;
    const NAME: &'static str = K::NAME;

    pub fn new() -> Self {
        Self::from_bytes([0xff; 8])
    }

    fn from_bytes(bytes: [u8; 8]) -> Self {
        MemberId {
            state: RecordState::Unbound,
            bytes,
            class: IndexReference::new(K::NAME, "class", SectionType::TypeId, 0),
            descriptor: IndexReference::new(K::NAME, K::DESCRIPTOR_FIELD, K::DESCRIPTOR, 2),
            name: IndexReference::new(K::NAME, "name", SectionType::StringData, 4),
            _kind: PhantomData,
        }
    }

    pub fn class(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, class, lookup)
    }

    pub fn set_class(&mut self, type_id: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(K::NAME, "class")?;
        self.class.set(&mut self.bytes, Some(type_id), lookup)
    }

    /// The field's type, or the method's proto.
    pub fn descriptor(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, descriptor, lookup)
    }

    pub fn set_descriptor(&mut self, key: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(K::NAME, K::DESCRIPTOR_FIELD)?;
        self.descriptor.set(&mut self.bytes, Some(key), lookup)
    }

    pub fn name(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        live_resolve!(self, name, lookup)
    }

    pub fn set_name(&mut self, string: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(K::NAME, "name")?;
        self.name.set(&mut self.bytes, Some(string), lookup)
    }
}

impl<K: MemberKind> Default for MemberId<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MemberKind> SectionItem for MemberId<K> {
    const SECTION: SectionType = K::SECTION;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<Self, DexError> {
        Ok(Self::from_bytes(read_fixed(bytes, ix)?))
    }

    fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        Ok(write_x(bytes, &self.bytes))
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class.refresh(&mut self.bytes, lookup)?;
        self.descriptor.refresh(&mut self.bytes, lookup)?;
        self.name.refresh(&mut self.bytes, lookup)?;
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class.resolve(&self.bytes, lookup)?;
        self.descriptor.resolve(&self.bytes, lookup)?;
        self.name.resolve(&self.bytes, lookup)?;
        Ok(())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class.check_live(&self.bytes, lookup)?;
        self.descriptor.check_live(&self.bytes, lookup)?;
        self.name.check_live(&self.bytes, lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::section::Sections;

    fn sections() -> Sections {
        Sections::new(&SectionType::DEX)
    }

    fn push(sections: &mut Sections, kind: SectionType) -> ItemKey {
        ItemKey::new(kind, sections.map_mut(kind).unwrap().push())
    }

    #[test]
    fn new_records_store_sentinels() {
        let s = sections();
        let mut out = vec![];
        TypeId::new().write(&mut out, &s).unwrap();
        ProtoId::new().write(&mut out, &s).unwrap();
        let mut expected = vec![0xff; 12];
        expected.extend_from_slice(&[0; 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn unbound_record_refuses_to_resolve() {
        let s = sections();
        let t = TypeId::new();
        let err = t.descriptor(&s).unwrap_err();
        assert_eq!(err.message(), "type_id.descriptor: record is not attached to a section");
    }

    #[test]
    fn removed_record_reports_absent() {
        let mut s = sections();
        let string = push(&mut s, SectionType::StringData);
        let mut t = TypeId::new();
        t.set_descriptor(string, &s).unwrap();
        t.set_state(RecordState::Removed);
        assert_eq!(t.descriptor(&s).unwrap(), None);
        assert!(t.set_descriptor(string, &s).is_err());
    }

    #[test]
    fn method_id_uses_narrow_class_and_proto_fields() {
        let mut s = sections();
        let _t0 = push(&mut s, SectionType::TypeId);
        let t1 = push(&mut s, SectionType::TypeId);
        let p0 = push(&mut s, SectionType::ProtoId);
        let n0 = push(&mut s, SectionType::StringData);
        let n1 = push(&mut s, SectionType::StringData);

        let mut m = MethodId::new();
        m.set_state(RecordState::Bound(push(&mut s, SectionType::MethodId)));
        m.set_class(t1, &s).unwrap();
        m.set_descriptor(p0, &s).unwrap();
        m.set_name(n1, &s).unwrap();
        let mut out = vec![];
        m.write(&mut out, &s).unwrap();
        assert_eq!(out, vec![1, 0, 0, 0, 1, 0, 0, 0]);

        // a field's middle slot must point at a type, not a proto
        let mut f = FieldId::new();
        assert!(f.set_descriptor(p0, &s).is_err());
        f.set_name(n0, &s).unwrap();
    }
}
