//! Integer fields inside record buffers, and references built on top of them.
//!
//! A reference stores *which* record it points at as an integer in its owner's bytes: an
//! index for [`ByIndex`] sections, a byte offset for [`ByOffset`] sections. The first
//! successful resolution caches the target's [`ItemKey`]; from then on the stored integer is
//! only a derived value, brought back in line with the target's live position by
//! [`ItemReference::restamp`].

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use num_traits::{NumCast, PrimInt};

use crate::dex::error::DexError;
use crate::dex::section::{ItemKey, SectionLookup, SectionType};

/// A little-endian integer of width `T` at a fixed offset of a record buffer.
#[derive(Clone, Copy)]
pub struct IndirectField<T> {
    offset: usize,
    _width: PhantomData<T>,
}

impl<T: PrimInt> IndirectField<T> {
    pub const fn new(offset: usize) -> Self {
        IndirectField { offset, _width: PhantomData }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn width() -> usize {
        size_of::<T>()
    }

    pub fn get(&self, bytes: &[u8]) -> T {
        let mut raw = 0u64;
        for (i, b) in bytes[self.offset..self.offset + Self::width()].iter().enumerate() {
            raw |= (*b as u64) << (8 * i);
        }
        <T as NumCast>::from(raw).unwrap_or_else(T::max_value)
    }

    pub fn set(&self, bytes: &mut [u8], value: T) {
        let raw = value.to_u64().unwrap_or(0);
        for (i, b) in bytes[self.offset..self.offset + Self::width()].iter_mut().enumerate() {
            *b = (raw >> (8 * i)) as u8;
        }
    }
}

impl<T> fmt::Debug for IndirectField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndirectField(+{}, {} bytes)", self.offset, size_of::<T>())
    }
}

/// How a stored integer names its target.
pub trait Addressing {
    /// The stored value meaning "no target".
    fn absent<T: PrimInt>() -> T;

    fn locate(lookup: &dyn SectionLookup, section: SectionType, stored: u32) -> Result<Option<ItemKey>, DexError>;

    fn position(lookup: &dyn SectionLookup, key: ItemKey) -> Result<Option<u32>, DexError>;
}

/// Addressing by position in the section's order; all bits set means absent.
#[derive(Debug, Clone, Copy)]
pub struct ByIndex;

/// Addressing by byte offset; zero means absent.
#[derive(Debug, Clone, Copy)]
pub struct ByOffset;

impl Addressing for ByIndex {
    fn absent<T: PrimInt>() -> T {
        T::max_value()
    }

    fn locate(lookup: &dyn SectionLookup, section: SectionType, stored: u32) -> Result<Option<ItemKey>, DexError> {
        lookup.key_at_index(section, stored)
    }

    fn position(lookup: &dyn SectionLookup, key: ItemKey) -> Result<Option<u32>, DexError> {
        lookup.index_of(key)
    }
}

impl Addressing for ByOffset {
    fn absent<T: PrimInt>() -> T {
        T::zero()
    }

    fn locate(lookup: &dyn SectionLookup, section: SectionType, stored: u32) -> Result<Option<ItemKey>, DexError> {
        lookup.key_at_offset(section, stored)
    }

    fn position(lookup: &dyn SectionLookup, key: ItemKey) -> Result<Option<u32>, DexError> {
        lookup.offset_of(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cached {
    Unresolved,
    Item(ItemKey),
    /// The cached target was removed; the stored integer must not be re-resolved.
    Lost,
}

/// A reference from one record into a section, stored in the owner's bytes.
pub struct ItemReference<A, T = u32> {
    owner: &'static str,
    name: &'static str,
    section: SectionType,
    field: IndirectField<T>,
    cached: Cell<Cached>,
    _addressing: PhantomData<A>,
}

pub type IndexReference<T = u32> = ItemReference<ByIndex, T>;
pub type OffsetReference = ItemReference<ByOffset, u32>;

impl<A: Addressing, T: PrimInt> ItemReference<A, T> {
    pub fn new(owner: &'static str, name: &'static str, section: SectionType, offset: usize) -> Self {
        ItemReference {
            owner,
            name,
            section,
            field: IndirectField::new(offset),
            cached: Cell::new(Cached::Unresolved),
            _addressing: PhantomData,
        }
    }

    pub fn section(&self) -> SectionType {
        self.section
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stored(&self, bytes: &[u8]) -> T {
        self.field.get(bytes)
    }

    pub fn is_absent(&self, bytes: &[u8]) -> bool {
        self.stored(bytes) == A::absent::<T>()
    }

    /// The cached target, without consulting the section.
    pub fn cached(&self) -> Option<ItemKey> {
        match self.cached.get() {
            Cached::Item(key) => Some(key),
            _ => None,
        }
    }

    /// Resolves the stored integer to a live record and caches it. Never mutates the bytes.
    pub fn resolve(&self, bytes: &[u8], lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        match self.cached.get() {
            Cached::Item(key) => {
                if lookup.index_of(key)?.is_some() {
                    return Ok(Some(key));
                }
                self.cached.set(Cached::Lost);
                Ok(None)
            }
            Cached::Lost => Ok(None),
            Cached::Unresolved => {
                let stored = self.stored(bytes);
                if stored == A::absent::<T>() {
                    return Ok(None);
                }
                let stored = stored.to_u32().unwrap_or(u32::MAX);
                let key = A::locate(lookup, self.section, stored)?;
                if let Some(key) = key {
                    self.cached.set(Cached::Item(key));
                }
                Ok(key)
            }
        }
    }

    /// Like [`resolve`](Self::resolve), but an absent target is a consistency error.
    pub fn require(&self, bytes: &[u8], lookup: &dyn SectionLookup) -> Result<ItemKey, DexError> {
        self.resolve(bytes, lookup)?
            .ok_or_else(|| DexError::consistency(self.owner, self.name, "required reference is not set"))
    }

    /// Points the reference at `target` (or clears it), storing the target's current position.
    pub fn set(&self, bytes: &mut [u8], target: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        let Some(key) = target else {
            self.field.set(bytes, A::absent::<T>());
            self.cached.set(Cached::Unresolved);
            return Ok(());
        };
        if key.section() != self.section {
            return Err(DexError::binding(
                self.owner,
                self.name,
                &format!("expected a {} record, got {}", self.section, key),
            ));
        }
        let position = A::position(lookup, key)?
            .ok_or_else(|| DexError::binding(self.owner, self.name, &format!("{} is not live in its section", key)))?;
        self.field.set(bytes, self.narrow(position)?);
        self.cached.set(Cached::Item(key));
        Ok(())
    }

    /// Rewrites the stored integer from the cached target's live position. Returns whether
    /// the stored value changed. A reference that was never resolved is left untouched.
    pub fn restamp(&self, bytes: &mut [u8], lookup: &dyn SectionLookup) -> Result<bool, DexError> {
        let before = self.stored(bytes);
        let after = match self.cached.get() {
            Cached::Unresolved => return Ok(false),
            Cached::Lost => A::absent::<T>(),
            Cached::Item(key) => match A::position(lookup, key)? {
                Some(position) => self.narrow(position)?,
                None => {
                    self.cached.set(Cached::Lost);
                    A::absent::<T>()
                }
            },
        };
        if after != before {
            self.field.set(bytes, after);
            log::trace!(
                "{}.{} restamped {:?} -> {:?}",
                self.owner,
                self.name,
                before.to_u64(),
                after.to_u64()
            );
        }
        Ok(after != before)
    }

    /// Errors when the reference was pointed at a record that is gone, or when its stored
    /// integer names nothing live. A reference cleared with `set(None)` passes.
    pub fn check_live(&self, bytes: &[u8], lookup: &dyn SectionLookup) -> Result<(), DexError> {
        if self.resolve(bytes, lookup)?.is_some() {
            return Ok(());
        }
        if self.cached.get() == Cached::Lost {
            return Err(DexError::consistency(self.owner, self.name, "target was removed"));
        }
        if !self.is_absent(bytes) {
            return Err(DexError::consistency(
                self.owner,
                self.name,
                &format!("stored {:?} names no live {} record", self.stored(bytes).to_u64(), self.section),
            ));
        }
        Ok(())
    }

    /// `resolve` followed by `restamp`.
    pub fn refresh(&self, bytes: &mut [u8], lookup: &dyn SectionLookup) -> Result<bool, DexError> {
        self.resolve(bytes, lookup)?;
        self.restamp(bytes, lookup)
    }

    fn narrow(&self, position: u32) -> Result<T, DexError> {
        <T as NumCast>::from(position).ok_or_else(|| {
            DexError::binding(
                self.owner,
                self.name,
                &format!("position {} does not fit a {}-byte field", position, size_of::<T>()),
            )
        })
    }
}

impl<A, T> fmt::Debug for ItemReference<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemReference")
            .field("field", &format_args!("{}.{}", self.owner, self.name))
            .field("section", &self.section)
            .field("cached", &self.cached.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::section::Sections;
    use crate::dex::error::ErrorKind;

    fn sections() -> Sections {
        Sections::new(&[SectionType::TypeId, SectionType::TypeList])
    }

    fn push(sections: &mut Sections, kind: SectionType) -> ItemKey {
        ItemKey::new(kind, sections.map_mut(kind).unwrap().push())
    }

    #[test]
    fn indirect_field_reads_and_writes_little_endian() {
        let mut bytes = [0u8; 8];
        let wide = IndirectField::<u32>::new(0);
        let narrow = IndirectField::<u16>::new(4);
        wide.set(&mut bytes, 0x1234_5678);
        narrow.set(&mut bytes, 0xabcd);
        assert_eq!(bytes, [0x78, 0x56, 0x34, 0x12, 0xcd, 0xab, 0, 0]);
        assert_eq!(wide.get(&bytes), 0x1234_5678);
        assert_eq!(narrow.get(&bytes), 0xabcd);
    }

    #[test]
    fn set_stores_current_index_and_caches_target() {
        let mut s = sections();
        let _a = push(&mut s, SectionType::TypeId);
        let b = push(&mut s, SectionType::TypeId);
        let mut bytes = [0u8; 4];
        let r = IndexReference::<u32>::new("test", "type", SectionType::TypeId, 0);

        r.set(&mut bytes, Some(b), &s).unwrap();
        assert_eq!(r.stored(&bytes), 1);
        assert_eq!(r.resolve(&bytes, &s).unwrap(), Some(b));

        r.set(&mut bytes, None, &s).unwrap();
        assert!(r.is_absent(&bytes));
        assert_eq!(r.resolve(&bytes, &s).unwrap(), None);
    }

    #[test]
    fn refresh_follows_target_after_insert() {
        let mut s = sections();
        let a = push(&mut s, SectionType::TypeId);
        let mut bytes = [0u8; 4];
        let r = IndexReference::<u32>::new("test", "type", SectionType::TypeId, 0);
        r.set(&mut bytes, Some(a), &s).unwrap();

        s.map_mut(SectionType::TypeId).unwrap().insert(0).unwrap();
        assert_eq!(r.stored(&bytes), 0);
        assert!(r.refresh(&mut bytes, &s).unwrap());
        assert_eq!(r.stored(&bytes), 1);
        assert!(!r.refresh(&mut bytes, &s).unwrap());
        assert_eq!(r.resolve(&bytes, &s).unwrap(), Some(a));
    }

    #[test]
    fn removed_offset_target_resolves_to_none_not_its_successor() {
        let mut s = sections();
        let a = push(&mut s, SectionType::TypeList);
        let b = push(&mut s, SectionType::TypeList);
        s.map_mut(SectionType::TypeList).unwrap().place(a.slot(), 0x100, 8);
        let mut bytes = [0u8; 4];
        let r = OffsetReference::new("test", "interfaces", SectionType::TypeList, 0);
        r.set(&mut bytes, Some(a), &s).unwrap();
        assert_eq!(r.stored(&bytes), 0x100);

        let map = s.map_mut(SectionType::TypeList).unwrap();
        map.remove(a.slot());
        map.place(b.slot(), 0x100, 8);

        r.refresh(&mut bytes, &s).unwrap();
        assert_eq!(r.stored(&bytes), 0);
        assert_eq!(r.resolve(&bytes, &s).unwrap(), None);
        r.refresh(&mut bytes, &s).unwrap();
        assert_eq!(r.check_live(&bytes, &s).unwrap_err().kind(), ErrorKind::Consistency);

        r.set(&mut bytes, None, &s).unwrap();
        assert!(r.check_live(&bytes, &s).is_ok());
    }

    #[test]
    fn out_of_range_stored_index_is_not_live() {
        let mut s = sections();
        let _a = push(&mut s, SectionType::TypeId);
        let bytes = 7u32.to_le_bytes();
        let r = IndexReference::<u32>::new("class_def", "superclass", SectionType::TypeId, 0);
        assert_eq!(r.resolve(&bytes, &s).unwrap(), None);
        let err = r.check_live(&bytes, &s).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.message().starts_with("class_def.superclass:"));
        assert!(r.check_live(&[0xff; 4], &s).is_ok());
    }

    #[test]
    fn lazy_resolution_from_parsed_bytes() {
        let mut s = sections();
        let _a = push(&mut s, SectionType::TypeList);
        let b = push(&mut s, SectionType::TypeList);
        s.map_mut(SectionType::TypeList).unwrap().place(b.slot(), 0x200, 12);
        let bytes = 0x200u32.to_le_bytes();
        let r = OffsetReference::new("test", "interfaces", SectionType::TypeList, 0);
        assert_eq!(r.cached(), None);
        assert_eq!(r.resolve(&bytes, &s).unwrap(), Some(b));
        assert_eq!(r.cached(), Some(b));
    }

    #[test]
    fn wrong_section_and_narrow_width_are_binding_errors() {
        let mut s = sections();
        let list = push(&mut s, SectionType::TypeList);
        let mut bytes = [0u8; 4];
        let r = IndexReference::<u16>::new("test", "type", SectionType::TypeId, 0);
        let err = r.set(&mut bytes, Some(list), &s).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Binding);
        assert!(err.message().starts_with("test.type:"));

        for _ in 0..70_000 {
            push(&mut s, SectionType::TypeId);
        }
        let far = ItemKey::new(SectionType::TypeId, 69_999);
        assert_eq!(r.set(&mut bytes, Some(far), &s).unwrap_err().kind(), ErrorKind::Binding);
    }

    #[test]
    fn require_reports_missing_target() {
        let s = sections();
        let bytes = [0xffu8; 4];
        let r = IndexReference::<u32>::new("class_def", "class_type", SectionType::TypeId, 0);
        let err = r.require(&bytes, &s).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(err.message(), "class_def.class_type: required reference is not set");
    }
}
