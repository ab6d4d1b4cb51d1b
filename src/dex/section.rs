//! Shared per-kind collections of dex records.
//!
//! Every record lives in exactly one section and is named by an [`ItemKey`]. A section has
//! two coordinate systems: the 0-based index of a record in the section's current order, and
//! the byte offset the record was last placed at. Both can change under edits; keys cannot.
//! Slots are never reused, so a key to a removed record never finds a different one.

use std::fmt;
use std::ops::Range;

use rangemap::RangeMap;

use crate::dex::error::DexError;

/// Which shared collection a reference points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionType {
    StringData,
    TypeId,
    ProtoId,
    FieldId,
    MethodId,
    ClassId,
    TypeList,
    AnnotationItem,
    AnnotationSet,
    AnnotationSetRefList,
    AnnotationsDirectory,
    ClassData,
    EncodedArray,
    Namespace,
}

impl SectionType {
    pub const COUNT: usize = 14;

    /// The kinds a dex layout manages, in no particular order.
    pub const DEX: [SectionType; 13] = [
        SectionType::StringData,
        SectionType::TypeId,
        SectionType::ProtoId,
        SectionType::FieldId,
        SectionType::MethodId,
        SectionType::ClassId,
        SectionType::TypeList,
        SectionType::AnnotationItem,
        SectionType::AnnotationSet,
        SectionType::AnnotationSetRefList,
        SectionType::AnnotationsDirectory,
        SectionType::ClassData,
        SectionType::EncodedArray,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SectionType::StringData => "string_data",
            SectionType::TypeId => "type_id",
            SectionType::ProtoId => "proto_id",
            SectionType::FieldId => "field_id",
            SectionType::MethodId => "method_id",
            SectionType::ClassId => "class_def",
            SectionType::TypeList => "type_list",
            SectionType::AnnotationItem => "annotation_item",
            SectionType::AnnotationSet => "annotation_set",
            SectionType::AnnotationSetRefList => "annotation_set_ref_list",
            SectionType::AnnotationsDirectory => "annotations_directory",
            SectionType::ClassData => "class_data",
            SectionType::EncodedArray => "encoded_array",
            SectionType::Namespace => "namespace",
        }
    }

    /// True when references into this section store a byte offset rather than an index.
    pub fn is_offset_addressed(&self) -> bool {
        matches!(
            self,
            SectionType::TypeList
                | SectionType::AnnotationItem
                | SectionType::AnnotationSet
                | SectionType::AnnotationSetRefList
                | SectionType::AnnotationsDirectory
                | SectionType::ClassData
                | SectionType::EncodedArray
        )
    }

    /// Type code used for this section in the dex map list. `Namespace` never appears in a
    /// dex file and reports the reserved `0xffff`.
    pub fn map_type(&self) -> u16 {
        match self {
            SectionType::StringData => 0x2002,
            SectionType::TypeId => 0x0002,
            SectionType::ProtoId => 0x0003,
            SectionType::FieldId => 0x0004,
            SectionType::MethodId => 0x0005,
            SectionType::ClassId => 0x0006,
            SectionType::TypeList => 0x1001,
            SectionType::AnnotationItem => 0x2004,
            SectionType::AnnotationSet => 0x1003,
            SectionType::AnnotationSetRefList => 0x1002,
            SectionType::AnnotationsDirectory => 0x2006,
            SectionType::ClassData => 0x2000,
            SectionType::EncodedArray => 0x2005,
            SectionType::Namespace => 0xffff,
        }
    }

    pub fn alignment(&self) -> u32 {
        match self {
            SectionType::StringData
            | SectionType::AnnotationItem
            | SectionType::ClassData
            | SectionType::EncodedArray => 1,
            _ => 4,
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable handle of a record: the section it lives in and its storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    section: SectionType,
    slot: u32,
}

impl ItemKey {
    pub(crate) fn new(section: SectionType, slot: u32) -> Self {
        ItemKey { section, slot }
    }

    pub fn section(&self) -> SectionType {
        self.section
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.section, self.slot)
    }
}

/// Where a record stands relative to the section that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    /// Created but never placed in a section; references cannot resolve yet.
    #[default]
    Unbound,
    Bound(ItemKey),
    /// Taken out of its section. Accessors report absent, the record is never written.
    Removed,
}

impl RecordState {
    pub fn key(&self) -> Option<ItemKey> {
        match self {
            RecordState::Bound(key) => Some(*key),
            _ => None,
        }
    }

    /// `Ok(true)` when the record is live, `Ok(false)` once removed, and a binding error
    /// naming `record.field` while it was never attached.
    pub(crate) fn check(&self, record: &str, field: &str) -> Result<bool, DexError> {
        match self {
            RecordState::Bound(_) => Ok(true),
            RecordState::Removed => Ok(false),
            RecordState::Unbound => Err(DexError::binding(
                record,
                field,
                "record is not attached to a section",
            )),
        }
    }

    /// Setters work on attached and not-yet-attached records, never on removed ones.
    pub(crate) fn check_writable(&self, record: &str, field: &str) -> Result<(), DexError> {
        match self {
            RecordState::Removed => Err(DexError::binding(record, field, "record was removed from its section")),
            _ => Ok(()),
        }
    }
}

/// Section lookup by tag and index or offset, the only view references get of the layout.
pub trait SectionLookup {
    /// The record at `index`, `None` when nothing lives there.
    fn key_at_index(&self, section: SectionType, index: u32) -> Result<Option<ItemKey>, DexError>;

    /// The record whose placement starts exactly at `offset`.
    fn key_at_offset(&self, section: SectionType, offset: u32) -> Result<Option<ItemKey>, DexError>;

    /// Current index of a live record, `None` once removed.
    fn index_of(&self, key: ItemKey) -> Result<Option<u32>, DexError>;

    /// Current offset of a live record. A live record that was never placed reports 0.
    fn offset_of(&self, key: ItemKey) -> Result<Option<u32>, DexError>;
}

/// Index and offset bookkeeping for one section. Holds slots only, never the records.
#[derive(Debug, Default, Clone)]
pub struct SectionMap {
    order: Vec<u32>,
    index_of: Vec<Option<u32>>,
    offset_of: Vec<Option<u32>>,
    ranges: RangeMap<u32, u32>,
}

impl SectionMap {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live slots in index order.
    pub fn slots(&self) -> &[u32] {
        &self.order
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.index_of(slot).is_some()
    }

    pub fn index_of(&self, slot: u32) -> Option<u32> {
        self.index_of.get(slot as usize).copied().flatten()
    }

    pub fn offset_of(&self, slot: u32) -> Option<u32> {
        self.offset_of.get(slot as usize).copied().flatten()
    }

    pub fn slot_at(&self, index: u32) -> Option<u32> {
        self.order.get(index as usize).copied()
    }

    pub fn slot_at_offset(&self, offset: u32) -> Option<u32> {
        self.ranges
            .get_key_value(&offset)
            .filter(|(range, _)| range.start == offset)
            .map(|(_, slot)| *slot)
    }

    fn allocate(&mut self) -> u32 {
        let slot = self.index_of.len() as u32;
        self.index_of.push(None);
        self.offset_of.push(None);
        slot
    }

    pub(crate) fn push(&mut self) -> u32 {
        let slot = self.allocate();
        self.index_of[slot as usize] = Some(self.order.len() as u32);
        self.order.push(slot);
        slot
    }

    pub(crate) fn insert(&mut self, index: usize) -> Option<u32> {
        if index > self.order.len() {
            return None;
        }
        let slot = self.allocate();
        self.order.insert(index, slot);
        self.reindex_from(index);
        Some(slot)
    }

    pub(crate) fn remove(&mut self, slot: u32) -> bool {
        let Some(index) = self.index_of(slot) else {
            return false;
        };
        self.order.remove(index as usize);
        self.index_of[slot as usize] = None;
        self.unplace(slot);
        self.reindex_from(index as usize);
        true
    }

    pub(crate) fn move_to(&mut self, slot: u32, index: usize) -> bool {
        let Some(current) = self.index_of(slot) else {
            return false;
        };
        if index >= self.order.len() {
            return false;
        }
        self.order.remove(current as usize);
        self.order.insert(index, slot);
        self.reindex_from(index.min(current as usize));
        true
    }

    /// Records `slot` as occupying `[offset, offset + len)`.
    pub(crate) fn place(&mut self, slot: u32, offset: u32, len: u32) {
        self.unplace(slot);
        if let Some(entry) = self.offset_of.get_mut(slot as usize) {
            *entry = Some(offset);
        }
        if len > 0 {
            self.ranges.insert(offset..offset + len, slot);
        }
    }

    fn unplace(&mut self, slot: u32) {
        let Some(offset) = self.offset_of.get_mut(slot as usize).and_then(Option::take) else {
            return;
        };
        let range: Option<Range<u32>> = self
            .ranges
            .get_key_value(&offset)
            .filter(|(_, s)| **s == slot)
            .map(|(range, _)| range.clone());
        if let Some(range) = range {
            self.ranges.remove(range);
        }
    }

    pub(crate) fn clear_placement(&mut self) {
        for entry in self.offset_of.iter_mut() {
            *entry = None;
        }
        self.ranges = RangeMap::new();
    }

    fn reindex_from(&mut self, start: usize) {
        for (i, slot) in self.order.iter().enumerate().skip(start) {
            self.index_of[*slot as usize] = Some(i as u32);
        }
    }
}

/// Registry of section maps; a kind without a map is uninitialized.
#[derive(Debug, Clone)]
pub struct Sections {
    maps: Vec<Option<SectionMap>>,
}

impl Sections {
    pub fn new(kinds: &[SectionType]) -> Self {
        let mut maps = vec![None; SectionType::COUNT];
        for kind in kinds {
            maps[kind.slot()] = Some(SectionMap::default());
        }
        Sections { maps }
    }

    pub fn map(&self, section: SectionType) -> Result<&SectionMap, DexError> {
        self.maps[section.slot()].as_ref().ok_or_else(|| uninitialized(section))
    }

    pub(crate) fn map_mut(&mut self, section: SectionType) -> Result<&mut SectionMap, DexError> {
        self.maps[section.slot()].as_mut().ok_or_else(|| uninitialized(section))
    }

    pub fn is_live(&self, key: ItemKey) -> bool {
        self.map(key.section).map(|m| m.contains(key.slot)).unwrap_or(false)
    }
}

fn uninitialized(section: SectionType) -> DexError {
    DexError::binding(section.name(), "section", "section is not initialized in this layout")
}

impl SectionLookup for Sections {
    fn key_at_index(&self, section: SectionType, index: u32) -> Result<Option<ItemKey>, DexError> {
        Ok(self.map(section)?.slot_at(index).map(|slot| ItemKey::new(section, slot)))
    }

    fn key_at_offset(&self, section: SectionType, offset: u32) -> Result<Option<ItemKey>, DexError> {
        Ok(self.map(section)?.slot_at_offset(offset).map(|slot| ItemKey::new(section, slot)))
    }

    fn index_of(&self, key: ItemKey) -> Result<Option<u32>, DexError> {
        Ok(self.map(key.section)?.index_of(key.slot))
    }

    fn offset_of(&self, key: ItemKey) -> Result<Option<u32>, DexError> {
        let map = self.map(key.section)?;
        if !map.contains(key.slot) {
            return Ok(None);
        }
        Ok(Some(map.offset_of(key.slot).unwrap_or(0)))
    }
}

/// A record kind that can live in a section.
pub trait SectionItem: Sized {
    const SECTION: SectionType;

    /// Parses one record starting at `*ix`, advancing it past the record.
    fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<Self, DexError>;

    /// Serializes the record with the stored integers as they currently are.
    fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError>;

    fn state(&self) -> RecordState;

    fn set_state(&mut self, state: RecordState);

    /// Re-derives every stored index/offset from the live position of its target.
    fn refresh(&mut self, _lookup: &dyn SectionLookup) -> Result<(), DexError> {
        Ok(())
    }

    /// Resolves every reference without touching the stored integers.
    fn cache_items(&self, _lookup: &dyn SectionLookup) -> Result<(), DexError> {
        Ok(())
    }

    /// Errors for any reference whose target was removed or never existed. Checked before
    /// writing.
    fn check_references(&self, _lookup: &dyn SectionLookup) -> Result<(), DexError> {
        Ok(())
    }

    /// Non-zero offsets this record stores, so a parser can find the records they point at.
    fn outgoing_offsets(&self) -> Vec<(SectionType, u32)> {
        Vec::new()
    }

    fn byte_len(&self, lookup: &dyn SectionLookup) -> Result<u32, DexError> {
        let mut scratch = Vec::new();
        Ok(self.write(&mut scratch, lookup)? as u32)
    }
}

/// Record storage for one section, addressed by slot.
#[derive(Debug)]
pub struct Section<T> {
    kind: SectionType,
    items: Vec<Option<T>>,
}

impl<T> Section<T> {
    pub fn new(kind: SectionType) -> Self {
        Section { kind, items: Vec::new() }
    }

    pub fn kind(&self) -> SectionType {
        self.kind
    }

    pub fn get(&self, slot: u32) -> Option<&T> {
        self.items.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut T> {
        self.items.get_mut(slot as usize).and_then(Option::as_mut)
    }

    /// Stored records in slot order, which is creation order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.items.iter().flatten()
    }

    pub(crate) fn store(&mut self, slot: u32, item: T) {
        let slot = slot as usize;
        if self.items.len() <= slot {
            self.items.resize_with(slot + 1, || None);
        }
        self.items[slot] = Some(item);
    }

    pub(crate) fn take(&mut self, slot: u32) -> Option<T> {
        self.items.get_mut(slot as usize).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_follows_insert_remove_and_move() {
        let mut map = SectionMap::default();
        let a = map.push();
        let b = map.push();
        let c = map.insert(0).unwrap();
        assert_eq!(map.slots(), &[c, a, b]);
        assert_eq!(map.index_of(a), Some(1));

        assert!(map.remove(c));
        assert_eq!(map.index_of(a), Some(0));
        assert_eq!(map.index_of(c), None);
        assert!(!map.remove(c));

        assert!(map.move_to(b, 0));
        assert_eq!(map.slots(), &[b, a]);
        assert_eq!(map.index_of(a), Some(1));
        assert!(map.insert(5).is_none());
    }

    #[test]
    fn offset_lookup_requires_exact_start() {
        let mut map = SectionMap::default();
        let a = map.push();
        let b = map.push();
        map.place(a, 0x70, 8);
        map.place(b, 0x78, 4);
        assert_eq!(map.slot_at_offset(0x70), Some(a));
        assert_eq!(map.slot_at_offset(0x74), None);
        assert_eq!(map.slot_at_offset(0x78), Some(b));

        map.place(a, 0x100, 8);
        assert_eq!(map.slot_at_offset(0x70), None);
        assert_eq!(map.slot_at_offset(0x100), Some(a));

        map.remove(b);
        assert_eq!(map.slot_at_offset(0x78), None);
    }

    #[test]
    fn map_type_codes_are_distinct_dex_codes() {
        let mut codes: Vec<u16> = SectionType::DEX.iter().map(|k| k.map_type()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), SectionType::DEX.len());
        assert!(!SectionType::DEX.contains(&SectionType::Namespace));
        assert_eq!(SectionType::Namespace.map_type(), 0xffff);
    }

    #[test]
    fn uninitialized_section_is_a_binding_error() {
        let sections = Sections::new(&[SectionType::TypeId]);
        let err = sections.key_at_index(SectionType::StringData, 0).unwrap_err();
        assert_eq!(err.kind(), crate::dex::error::ErrorKind::Binding);
        assert_eq!(sections.key_at_index(SectionType::TypeId, 0).unwrap(), None);
    }

    #[test]
    fn unplaced_live_record_reports_offset_zero() {
        let mut sections = Sections::new(&[SectionType::TypeList]);
        let slot = sections.map_mut(SectionType::TypeList).unwrap().push();
        let key = ItemKey::new(SectionType::TypeList, slot);
        assert_eq!(sections.offset_of(key).unwrap(), Some(0));
        sections.map_mut(SectionType::TypeList).unwrap().remove(slot);
        assert_eq!(sections.offset_of(key).unwrap(), None);
    }
}
