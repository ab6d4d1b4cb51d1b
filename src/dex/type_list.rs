use crate::dex::error::DexError;
use crate::dex::reference::IndexReference;
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::{read_u4, read_x, write_x};

/// type_list: a u32 count followed by 16-bit type indices.
#[derive(Debug)]
pub struct TypeList {
    state: RecordState,
    bytes: Vec<u8>,
    entries: Vec<IndexReference<u16>>,
}

impl TypeList {
    const NAME: &'static str = "type_list";

    pub fn new() -> Self {
        TypeList { state: RecordState::Unbound, bytes: vec![0; 4], entries: vec![] }
    }

    fn entry(at: usize) -> IndexReference<u16> {
        IndexReference::new(Self::NAME, "type", SectionType::TypeId, 4 + 2 * at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, at: usize, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        if !self.state.check(Self::NAME, "type")? {
            return Ok(None);
        }
        match self.entries.get(at) {
            Some(r) => r.resolve(&self.bytes, lookup),
            None => Ok(None),
        }
    }

    /// Every entry in order; entries whose type was removed come back as `None`.
    pub fn types(&self, lookup: &dyn SectionLookup) -> Result<Vec<Option<ItemKey>>, DexError> {
        if !self.state.check(Self::NAME, "type")? {
            return Ok(vec![]);
        }
        self.entries.iter().map(|r| r.resolve(&self.bytes, lookup)).collect()
    }

    pub fn push(&mut self, type_id: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "type")?;
        let r = Self::entry(self.entries.len());
        self.bytes.extend_from_slice(&[0, 0]);
        if let Err(e) = r.set(&mut self.bytes, Some(type_id), lookup) {
            self.bytes.truncate(self.bytes.len() - 2);
            return Err(e);
        }
        self.entries.push(r);
        self.store_count();
        Ok(())
    }

    /// Drops the entry at `at`; later entries shift down and keep their targets.
    pub fn remove(&mut self, at: usize, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "type")?;
        if at >= self.entries.len() {
            fail!("type_list entry {} out of range ({} entries)", at, self.entries.len());
        }
        let targets = self
            .entries
            .iter()
            .map(|r| r.resolve(&self.bytes, lookup))
            .collect::<Result<Vec<_>, _>>()?;
        self.bytes.truncate(4);
        self.entries.clear();
        for (i, target) in targets.into_iter().enumerate() {
            if i == at {
                continue;
            }
            let r = Self::entry(self.entries.len());
            self.bytes.extend_from_slice(&[0xff, 0xff]);
            r.set(&mut self.bytes, target, lookup)?;
            self.entries.push(r);
        }
        self.store_count();
        Ok(())
    }

    fn store_count(&mut self) {
        let count = self.entries.len() as u32;
        self.bytes[0..4].copy_from_slice(&count.to_le_bytes());
    }
}

impl Default for TypeList {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionItem for TypeList {
    const SECTION: SectionType = SectionType::TypeList;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<Self, DexError> {
        let start = *ix;
        let size = read_u4(bytes, ix)? as usize;
        read_x(bytes, ix, size * 2)?;
        let entries = (0..size).map(Self::entry).collect();
        Ok(TypeList { state: RecordState::Unbound, bytes: bytes[start..*ix].to_vec(), entries })
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
        for r in &self.entries {
            r.refresh(&mut self.bytes, lookup)?;
        }
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        for r in &self.entries {
            r.resolve(&self.bytes, lookup)?;
        }
        Ok(())
    }

    /// Entries have no absent form, so a cleared entry fails as well.
    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        for (at, r) in self.entries.iter().enumerate() {
            r.check_live(&self.bytes, lookup)
                .map_err(|e| DexError::with_context(e, format!("entry {}", at)))?;
            if r.is_absent(&self.bytes) {
                return Err(DexError::consistency(Self::NAME, "type", &format!("entry {} is not set", at)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::section::Sections;

    #[test]
    fn push_and_remove_keep_targets() {
        let mut s = Sections::new(&SectionType::DEX);
        let types: Vec<ItemKey> = (0..3)
            .map(|_| ItemKey::new(SectionType::TypeId, s.map_mut(SectionType::TypeId).unwrap().push()))
            .collect();
        let mut list = TypeList::new();
        list.set_state(RecordState::Bound(ItemKey::new(SectionType::TypeList, 0)));
        for t in &types {
            list.push(*t, &s).unwrap();
        }
        let mut out = vec![];
        list.write(&mut out, &s).unwrap();
        assert_eq!(out, vec![3, 0, 0, 0, 0, 0, 1, 0, 2, 0]);

        list.remove(0, &s).unwrap();
        assert_eq!(list.types(&s).unwrap(), vec![Some(types[1]), Some(types[2])]);
        let mut out = vec![];
        list.write(&mut out, &s).unwrap();
        assert_eq!(out, vec![2, 0, 0, 0, 1, 0, 2, 0]);
        assert!(list.remove(5, &s).is_err());
    }

    #[test]
    fn parse_reads_count_and_entries() {
        let s = Sections::new(&SectionType::DEX);
        let bytes = [1, 0, 0, 0, 7, 0, 0xaa];
        let mut ix = 0;
        let list = TypeList::read(&bytes, &mut ix, &s).unwrap();
        assert_eq!(ix, 6);
        assert_eq!(list.len(), 1);
        assert_eq!(list.byte_len(&s).unwrap(), 6);
    }
}
