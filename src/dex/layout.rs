//! The dex file as a set of shared sections.
//!
//! Parsing turns every table entry and every data record reachable from one into a record
//! owned by its section. Records point at each other through cached references, so records can
//! be inserted, removed and reordered freely. [`DexLayout::refresh`] re-derives every stored
//! index and offset, and [`DexLayout::to_bytes`] places all sections again, refreshes, and
//! serializes with a new map list, signature and checksum.

use std::collections::VecDeque;

use adler::adler32_slice;
use log::debug;
use sha1::{Digest, Sha1};

use crate::dex::annotations::{AnnotationItem, AnnotationSet, AnnotationSetRefList, AnnotationsDirectory};
use crate::dex::class_data::ClassData;
use crate::dex::class_def::ClassDef;
use crate::dex::encoded_values::EncodedArray;
use crate::dex::error::DexError;
use crate::dex::header::{
    write_map_list, Header, MapItem, DEX_MAGIC, ENDIAN_CONSTANT, HEADER_SIZE, TYPE_HEADER_ITEM, TYPE_MAP_LIST,
    TYPE_STRING_ID_ITEM,
};
use crate::dex::ids::{FieldId, MemberId, MemberKind, MethodId, ProtoId, TypeId};
use crate::dex::section::{ItemKey, RecordState, Section, SectionItem, SectionLookup, SectionType, Sections};
use crate::dex::strings::StringData;
use crate::dex::type_list::TypeList;
use crate::dex::{align, read_u4, write_u4};
use crate::smali_write::ItemText;
use crate::types::{MethodDescriptor, TypeDescriptor};

/// A record kind the layout stores, with access to its storage.
pub trait LayoutItem: SectionItem {
    fn storage(layout: &DexLayout) -> &Section<Self>;

    /// The record storage together with the section registry, borrowed apart.
    fn split(layout: &mut DexLayout) -> (&mut Section<Self>, &Sections);
}

macro_rules! layout_items {
    ($($record:ty => $field:ident),* $(,)?) => {
        $(
            impl LayoutItem for $record {
                fn storage(layout: &DexLayout) -> &Section<Self> {
                    &layout.$field
                }

                fn split(layout: &mut DexLayout) -> (&mut Section<Self>, &Sections) {
                    (&mut layout.$field, &layout.sections)
                }
            }
        )*
    };
}

layout_items! {
    StringData => strings,
    TypeId => type_ids,
    ProtoId => proto_ids,
    FieldId => field_ids,
    MethodId => method_ids,
    ClassDef => class_defs,
    TypeList => type_lists,
    AnnotationItem => annotation_items,
    AnnotationSet => annotation_sets,
    AnnotationSetRefList => annotation_set_ref_lists,
    AnnotationsDirectory => annotations_directories,
    ClassData => class_data,
    EncodedArray => encoded_arrays,
}

/// Calls `$f::<Record>($args)` for the record type stored in section `$kind`.
macro_rules! dispatch {
    ($kind:expr, $f:ident ( $($arg:expr),* )) => {
        match $kind {
            SectionType::StringData => $f::<StringData>($($arg),*),
            SectionType::TypeId => $f::<TypeId>($($arg),*),
            SectionType::ProtoId => $f::<ProtoId>($($arg),*),
            SectionType::FieldId => $f::<FieldId>($($arg),*),
            SectionType::MethodId => $f::<MethodId>($($arg),*),
            SectionType::ClassId => $f::<ClassDef>($($arg),*),
            SectionType::TypeList => $f::<TypeList>($($arg),*),
            SectionType::AnnotationItem => $f::<AnnotationItem>($($arg),*),
            SectionType::AnnotationSet => $f::<AnnotationSet>($($arg),*),
            SectionType::AnnotationSetRefList => $f::<AnnotationSetRefList>($($arg),*),
            SectionType::AnnotationsDirectory => $f::<AnnotationsDirectory>($($arg),*),
            SectionType::ClassData => $f::<ClassData>($($arg),*),
            SectionType::EncodedArray => $f::<EncodedArray>($($arg),*),
            SectionType::Namespace => Err(DexError::binding("dex_layout", "section", "namespaces do not live in a dex file")),
        }
    };
}

/// Fixed-size id tables in file order, with their entry sizes.
const ID_TABLES: [(SectionType, u32); 6] = [
    (SectionType::StringData, 4),
    (SectionType::TypeId, 4),
    (SectionType::ProtoId, 12),
    (SectionType::FieldId, 8),
    (SectionType::MethodId, 8),
    (SectionType::ClassId, 32),
];

/// Data sections in the order they are laid out.
const DATA_ORDER: [SectionType; 8] = [
    SectionType::TypeList,
    SectionType::AnnotationSetRefList,
    SectionType::AnnotationSet,
    SectionType::ClassData,
    SectionType::StringData,
    SectionType::AnnotationItem,
    SectionType::EncodedArray,
    SectionType::AnnotationsDirectory,
];

/// Targets are refreshed before the records that point at them.
const REFRESH_ORDER: [SectionType; 13] = [
    SectionType::StringData,
    SectionType::TypeId,
    SectionType::TypeList,
    SectionType::ProtoId,
    SectionType::FieldId,
    SectionType::MethodId,
    SectionType::AnnotationItem,
    SectionType::AnnotationSet,
    SectionType::AnnotationSetRefList,
    SectionType::AnnotationsDirectory,
    SectionType::EncodedArray,
    SectionType::ClassData,
    SectionType::ClassId,
];

/// Result of placing every section: what the header and map list need.
struct Placement {
    tables: Vec<(SectionType, u32, u32)>,
    data_off: u32,
    map_off: u32,
    map: Vec<MapItem>,
}

#[derive(Debug)]
pub struct DexLayout {
    sections: Sections,
    strings: Section<StringData>,
    type_ids: Section<TypeId>,
    proto_ids: Section<ProtoId>,
    field_ids: Section<FieldId>,
    method_ids: Section<MethodId>,
    class_defs: Section<ClassDef>,
    type_lists: Section<TypeList>,
    annotation_items: Section<AnnotationItem>,
    annotation_sets: Section<AnnotationSet>,
    annotation_set_ref_lists: Section<AnnotationSetRefList>,
    annotations_directories: Section<AnnotationsDirectory>,
    class_data: Section<ClassData>,
    encoded_arrays: Section<EncodedArray>,
}

impl Default for DexLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl DexLayout {
    /// An empty dex with every section initialized.
    pub fn new() -> Self {
        DexLayout {
            sections: Sections::new(&SectionType::DEX),
            strings: Section::new(SectionType::StringData),
            type_ids: Section::new(SectionType::TypeId),
            proto_ids: Section::new(SectionType::ProtoId),
            field_ids: Section::new(SectionType::FieldId),
            method_ids: Section::new(SectionType::MethodId),
            class_defs: Section::new(SectionType::ClassId),
            type_lists: Section::new(SectionType::TypeList),
            annotation_items: Section::new(SectionType::AnnotationItem),
            annotation_sets: Section::new(SectionType::AnnotationSet),
            annotation_set_ref_lists: Section::new(SectionType::AnnotationSetRefList),
            annotations_directories: Section::new(SectionType::AnnotationsDirectory),
            class_data: Section::new(SectionType::ClassData),
            encoded_arrays: Section::new(SectionType::EncodedArray),
        }
    }

    /// The lookup records need for their accessors and setters.
    pub fn lookup(&self) -> &Sections {
        &self.sections
    }

    /// Parses a dex file. Every id table entry becomes a record, and so does every data record
    /// reachable from one. Code items, call sites and method handles are left alone.
    pub fn from_bytes(bytes: &[u8]) -> Result<DexLayout, DexError> {
        let mut ix = 0;
        let header = Header::read(bytes, &mut ix)?;
        if header.file_size as usize > bytes.len() {
            fail!("File size {} in header exceeds the {} bytes given", header.file_size, bytes.len());
        }
        let mut layout = DexLayout::new();

        for i in 0..header.string_ids_size {
            let mut p = header.string_ids_off as usize + 4 * i as usize;
            let offset = read_u4(bytes, &mut p)?;
            read_record::<StringData>(&mut layout, bytes, offset)
                .map_err(|e| DexError::with_context(e, format!("string #{}", i)))?;
        }
        read_table::<TypeId>(&mut layout, bytes, header.type_ids_off, header.type_ids_size, 4)?;
        read_table::<ProtoId>(&mut layout, bytes, header.proto_ids_off, header.proto_ids_size, 12)?;
        read_table::<FieldId>(&mut layout, bytes, header.field_ids_off, header.field_ids_size, 8)?;
        read_table::<MethodId>(&mut layout, bytes, header.method_ids_off, header.method_ids_size, 8)?;
        read_table::<ClassDef>(&mut layout, bytes, header.class_defs_off, header.class_defs_size, 32)?;

        let mut pending: VecDeque<(SectionType, u32)> = VecDeque::new();
        for proto in layout.proto_ids.items() {
            pending.extend(proto.outgoing_offsets());
        }
        for class in layout.class_defs.items() {
            pending.extend(class.outgoing_offsets());
        }
        while let Some((kind, offset)) = pending.pop_front() {
            if layout.sections.map(kind)?.slot_at_offset(offset).is_some() {
                continue;
            }
            pending.extend(dispatch!(kind, read_record(&mut layout, bytes, offset))?);
        }

        // Data records keep the order they had in the file.
        for kind in DATA_ORDER {
            if kind == SectionType::StringData {
                continue;
            }
            let map = layout.sections.map_mut(kind)?;
            let mut slots = map.slots().to_vec();
            slots.sort_by_key(|slot| map.offset_of(*slot).unwrap_or(0));
            for (index, slot) in slots.into_iter().enumerate() {
                map.move_to(slot, index);
            }
        }

        for kind in REFRESH_ORDER {
            dispatch!(kind, cache_section(&layout))?;
        }

        for kind in SectionType::DEX {
            debug!("{}: {} records", kind, layout.len(kind));
        }
        Ok(layout)
    }

    pub fn len(&self, kind: SectionType) -> usize {
        self.sections.map(kind).map(|m| m.len()).unwrap_or(0)
    }

    /// Keys of the live records of a section, in index order.
    pub fn keys(&self, kind: SectionType) -> Result<Vec<ItemKey>, DexError> {
        Ok(self.sections.map(kind)?.slots().iter().map(|slot| ItemKey::new(kind, *slot)).collect())
    }

    pub fn get<T: LayoutItem>(&self, key: ItemKey) -> Option<&T> {
        if key.section() != T::SECTION {
            return None;
        }
        T::storage(self).get(key.slot())
    }

    pub fn get_mut<T: LayoutItem>(&mut self, key: ItemKey) -> Option<&mut T> {
        if key.section() != T::SECTION {
            return None;
        }
        T::split(self).0.get_mut(key.slot())
    }

    /// Like [`DexLayout::get`], but a missing record is a binding error.
    pub fn record<T: LayoutItem>(&self, key: ItemKey) -> Result<&T, DexError> {
        self.get(key)
            .ok_or_else(|| DexError::binding(T::SECTION.name(), "key", &format!("{} is not a live {}", key, T::SECTION)))
    }

    /// Runs `f` on a record together with the lookup its setters need.
    pub fn edit<T: LayoutItem, R>(
        &mut self,
        key: ItemKey,
        f: impl FnOnce(&mut T, &dyn SectionLookup) -> Result<R, DexError>,
    ) -> Result<R, DexError> {
        if key.section() != T::SECTION {
            return Err(DexError::binding(T::SECTION.name(), "key", &format!("{} belongs to another section", key)));
        }
        let (section, sections) = T::split(self);
        match section.get_mut(key.slot()) {
            Some(item) => f(item, sections),
            None => Err(DexError::binding(T::SECTION.name(), "key", &format!("{} is not a live {}", key, T::SECTION))),
        }
    }

    /// Appends a record at the end of its section.
    pub fn push<T: LayoutItem>(&mut self, item: T) -> Result<ItemKey, DexError> {
        let slot = self.sections.map_mut(T::SECTION)?.push();
        Ok(self.attach(slot, item))
    }

    /// Inserts a record at `index`, shifting the records after it.
    pub fn insert<T: LayoutItem>(&mut self, index: usize, item: T) -> Result<ItemKey, DexError> {
        let len = self.len(T::SECTION);
        let Some(slot) = self.sections.map_mut(T::SECTION)?.insert(index) else {
            return Err(DexError::binding(
                T::SECTION.name(),
                "index",
                &format!("insert at {} past the end ({} records)", index, len),
            ));
        };
        Ok(self.attach(slot, item))
    }

    fn attach<T: LayoutItem>(&mut self, slot: u32, mut item: T) -> ItemKey {
        let key = ItemKey::new(T::SECTION, slot);
        item.set_state(RecordState::Bound(key));
        T::split(self).0.store(slot, item);
        key
    }

    /// Takes a record out of its section. References to it resolve to nothing from now on.
    pub fn remove<T: LayoutItem>(&mut self, key: ItemKey) -> Result<T, DexError> {
        if key.section() != T::SECTION || !self.sections.map_mut(T::SECTION)?.remove(key.slot()) {
            return Err(DexError::binding(T::SECTION.name(), "key", &format!("{} is not a live {}", key, T::SECTION)));
        }
        let Some(mut item) = T::split(self).0.take(key.slot()) else {
            return Err(DexError::binding(T::SECTION.name(), "key", &format!("{} has no record", key)));
        };
        item.set_state(RecordState::Removed);
        Ok(item)
    }

    /// Moves a live record to `index` within its section.
    pub fn move_to(&mut self, key: ItemKey, index: usize) -> Result<(), DexError> {
        if !self.sections.map_mut(key.section())?.move_to(key.slot(), index) {
            return Err(DexError::binding(key.section().name(), "index", &format!("cannot move {} to {}", key, index)));
        }
        Ok(())
    }

    /// Finds or adds a string, keeping string_ids sorted.
    pub fn intern_string(&mut self, s: &str) -> Result<ItemKey, DexError> {
        let slots = self.sections.map(SectionType::StringData)?.slots();
        let (mut lo, mut hi) = (0, slots.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let Some(existing) = self.strings.get(slots[mid]) else {
                fail!("String slot {} has no record", slots[mid]);
            };
            match existing.dex_cmp(s) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(ItemKey::new(SectionType::StringData, slots[mid])),
            }
        }
        debug!("interning string {:?} at {}", s, lo);
        self.insert(lo, StringData::new(s))
    }

    /// Finds or adds a type_id for a descriptor, keeping type_ids sorted by string index.
    pub fn intern_type(&mut self, descriptor: &str) -> Result<ItemKey, DexError> {
        descriptor
            .parse::<TypeDescriptor>()
            .map_err(|e| DexError::binding("type_id", "descriptor", e.message()))?;
        let string = self.intern_string(descriptor)?;
        let target = self.index_of(string)?.unwrap_or(u32::MAX);

        let keys = self.keys(SectionType::TypeId)?;
        let mut at = keys.len();
        for (i, key) in keys.iter().enumerate() {
            let current = self.record::<TypeId>(*key)?.descriptor(&self.sections)?;
            let index = match current {
                Some(s) => self.index_of(s)?.unwrap_or(u32::MAX),
                None => u32::MAX,
            };
            if index == target {
                return Ok(*key);
            }
            if index > target {
                at = i;
                break;
            }
        }
        let mut type_id = TypeId::new();
        type_id.set_descriptor(string, &self.sections)?;
        self.insert(at, type_id)
    }

    /// Finds or adds a proto for a method descriptor such as `(ILjava/lang/String;)V`.
    pub fn intern_proto(&mut self, descriptor: &str) -> Result<ItemKey, DexError> {
        let method: MethodDescriptor = descriptor
            .parse()
            .map_err(|e: DexError| DexError::binding("proto_id", "descriptor", e.message()))?;
        let return_type = self.intern_type(&method.result.to_jni())?;
        let mut params = Vec::with_capacity(method.params.len());
        for param in &method.params {
            params.push(self.intern_type(&param.to_jni())?);
        }
        let shorty = self.intern_string(&method.shorty())?;

        let wanted = self.proto_sort_key(return_type, &params)?;
        let keys = self.keys(SectionType::ProtoId)?;
        let mut at = keys.len();
        for (i, key) in keys.iter().enumerate() {
            let proto = self.record::<ProtoId>(*key)?;
            let Some(ret) = proto.return_type(&self.sections)? else {
                continue;
            };
            let existing_params: Vec<ItemKey> = match proto.parameters(&self.sections)? {
                Some(list) => self.record::<TypeList>(list)?.types(&self.sections)?.into_iter().flatten().collect(),
                None => vec![],
            };
            let existing = self.proto_sort_key(ret, &existing_params)?;
            if existing == wanted {
                return Ok(*key);
            }
            if existing > wanted {
                at = i;
                break;
            }
        }

        let parameters = if params.is_empty() { None } else { Some(self.intern_type_list(&params)?) };
        let mut proto = ProtoId::new();
        proto.set_shorty(shorty, &self.sections)?;
        proto.set_return_type(return_type, &self.sections)?;
        proto.set_parameters(parameters, &self.sections)?;
        self.insert(at, proto)
    }

    fn proto_sort_key(&self, return_type: ItemKey, params: &[ItemKey]) -> Result<(u32, Vec<u32>), DexError> {
        let ret = self.index_of(return_type)?.unwrap_or(u32::MAX);
        let mut indices = Vec::with_capacity(params.len());
        for p in params {
            indices.push(self.index_of(*p)?.unwrap_or(u32::MAX));
        }
        Ok((ret, indices))
    }

    /// Reuses a type_list holding exactly `types`, or appends a new one.
    pub fn intern_type_list(&mut self, types: &[ItemKey]) -> Result<ItemKey, DexError> {
        for key in self.keys(SectionType::TypeList)? {
            let existing = self.record::<TypeList>(key)?.types(&self.sections)?;
            if existing.len() == types.len() && existing.iter().zip(types).all(|(a, b)| *a == Some(*b)) {
                return Ok(key);
            }
        }
        let mut list = TypeList::new();
        for t in types {
            list.push(*t, &self.sections)?;
        }
        self.push(list)
    }

    /// Finds or adds a field_id, e.g. `intern_field("Lcom/x/A;", "count", "I")`.
    pub fn intern_field(&mut self, class: &str, name: &str, field_type: &str) -> Result<ItemKey, DexError> {
        let class = self.intern_type(class)?;
        let name = self.intern_string(name)?;
        let descriptor = self.intern_type(field_type)?;
        self.intern_member::<crate::dex::ids::FieldKind>(class, name, descriptor)
    }

    /// Finds or adds a method_id, e.g. `intern_method("Lcom/x/A;", "run", "()V")`.
    pub fn intern_method(&mut self, class: &str, name: &str, proto: &str) -> Result<ItemKey, DexError> {
        let class = self.intern_type(class)?;
        let name = self.intern_string(name)?;
        let descriptor = self.intern_proto(proto)?;
        self.intern_member::<crate::dex::ids::MethodKind>(class, name, descriptor)
    }

    /// Member ids sort by class, then name, then type or proto.
    fn intern_member<K: MemberKind>(&mut self, class: ItemKey, name: ItemKey, descriptor: ItemKey) -> Result<ItemKey, DexError>
    where
        MemberId<K>: LayoutItem,
    {
        let position = |layout: &DexLayout, key: Option<ItemKey>| -> Result<u32, DexError> {
            Ok(match key {
                Some(key) => layout.index_of(key)?.unwrap_or(u32::MAX),
                None => u32::MAX,
            })
        };
        let wanted = (position(self, Some(class))?, position(self, Some(name))?, position(self, Some(descriptor))?);
        let keys = self.keys(K::SECTION)?;
        let mut at = keys.len();
        for (i, key) in keys.iter().enumerate() {
            let member = self.record::<MemberId<K>>(*key)?;
            let existing = (
                position(self, member.class(&self.sections)?)?,
                position(self, member.name(&self.sections)?)?,
                position(self, member.descriptor(&self.sections)?)?,
            );
            if existing == wanted {
                return Ok(*key);
            }
            if existing > wanted {
                at = i;
                break;
            }
        }
        let mut member = MemberId::<K>::new();
        member.set_class(class, &self.sections)?;
        member.set_name(name, &self.sections)?;
        member.set_descriptor(descriptor, &self.sections)?;
        self.insert(at, member)
    }

    pub fn string(&self, key: ItemKey) -> Result<&StringData, DexError> {
        self.record::<StringData>(key)
    }

    /// Descriptor text of a type_id.
    pub fn type_descriptor(&self, key: ItemKey) -> Result<String, DexError> {
        let descriptor = self
            .record::<TypeId>(key)?
            .descriptor(&self.sections)?
            .ok_or_else(|| DexError::consistency("type_id", "descriptor", "required reference is not set"))?;
        self.string_text(descriptor)
    }

    /// `(PARAMS)RET` of a proto_id.
    pub fn proto_text(&self, key: ItemKey) -> Result<String, DexError> {
        let proto = self.record::<ProtoId>(key)?;
        let mut out = String::from("(");
        if let Some(list) = proto.parameters(&self.sections)? {
            for t in self.record::<TypeList>(list)?.types(&self.sections)? {
                match t {
                    Some(t) => out.push_str(&self.type_descriptor(t)?),
                    None => out.push_str("<unset>"),
                }
            }
        }
        out.push(')');
        match proto.return_type(&self.sections)? {
            Some(t) => out.push_str(&self.type_descriptor(t)?),
            None => out.push_str("<unset>"),
        }
        Ok(out)
    }

    /// A member as it appears in its definition: `name:TYPE` or `name(PARAMS)RET`.
    pub fn member_text(&self, key: ItemKey) -> Result<String, DexError> {
        match key.section() {
            SectionType::FieldId => {
                let field = self.record::<FieldId>(key)?;
                let name = self.optional_text(field.name(&self.sections)?, |k| self.string_text(k))?;
                let ty = self.optional_text(field.descriptor(&self.sections)?, |k| self.type_descriptor(k))?;
                Ok(format!("{}:{}", name, ty))
            }
            SectionType::MethodId => {
                let method = self.record::<MethodId>(key)?;
                let name = self.optional_text(method.name(&self.sections)?, |k| self.string_text(k))?;
                let proto = self.optional_text(method.descriptor(&self.sections)?, |k| self.proto_text(k))?;
                Ok(format!("{}{}", name, proto))
            }
            other => Err(DexError::binding(other.name(), "key", "not a member reference")),
        }
    }

    fn optional_text(
        &self,
        key: Option<ItemKey>,
        text: impl Fn(ItemKey) -> Result<String, DexError>,
    ) -> Result<String, DexError> {
        match key {
            Some(key) => text(key),
            None => Ok("<unset>".to_string()),
        }
    }

    fn member_class(&self, key: ItemKey) -> Result<String, DexError> {
        let class = match key.section() {
            SectionType::FieldId => self.record::<FieldId>(key)?.class(&self.sections)?,
            _ => self.record::<MethodId>(key)?.class(&self.sections)?,
        };
        self.optional_text(class, |k| self.type_descriptor(k))
    }

    /// The class_def defining `descriptor`, if this dex has one.
    pub fn find_class(&self, descriptor: &str) -> Result<Option<ItemKey>, DexError> {
        for key in self.keys(SectionType::ClassId)? {
            if let Some(t) = self.record::<ClassDef>(key)?.class_type(&self.sections)? {
                if self.type_descriptor(t)? == descriptor {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    /// Renders one class_def as smali into `out`.
    pub fn render_class(&self, key: ItemKey, out: &mut String) -> Result<(), DexError> {
        self.record::<ClassDef>(key)?.render(self, out)
    }

    /// Re-derives every stored index and offset from where its target lives now.
    pub fn refresh(&mut self) -> Result<(), DexError> {
        for kind in REFRESH_ORDER {
            dispatch!(kind, refresh_section(self))?;
        }
        Ok(())
    }

    /// Assigns every record a fresh offset, packing sections in file order, then refreshes.
    pub fn relayout(&mut self) -> Result<(), DexError> {
        self.place_all().map(|_| ())
    }

    fn place_all(&mut self) -> Result<Placement, DexError> {
        for kind in SectionType::DEX {
            self.sections.map_mut(kind)?.clear_placement();
        }

        let mut map = vec![MapItem { type_code: TYPE_HEADER_ITEM, size: 1, offset: 0 }];
        let mut tables = Vec::with_capacity(ID_TABLES.len());
        let mut offset = HEADER_SIZE;
        for (kind, size) in ID_TABLES {
            let section = self.sections.map_mut(kind)?;
            let count = section.len() as u32;
            if count == 0 {
                tables.push((kind, 0, 0));
                continue;
            }
            tables.push((kind, count, offset));
            let code = match kind {
                SectionType::StringData => TYPE_STRING_ID_ITEM,
                other => other.map_type(),
            };
            map.push(MapItem { type_code: code, size: count, offset });
            if kind != SectionType::StringData {
                let slots = section.slots().to_vec();
                for (i, slot) in slots.into_iter().enumerate() {
                    section.place(slot, offset + i as u32 * size, size);
                }
            }
            offset += count * size;
        }

        let data_off = offset;
        for kind in DATA_ORDER {
            let lengths = dispatch!(kind, record_lengths(self))?;
            if lengths.is_empty() {
                continue;
            }
            offset = align(offset, kind.alignment());
            map.push(MapItem { type_code: kind.map_type(), size: lengths.len() as u32, offset });
            let section = self.sections.map_mut(kind)?;
            for (slot, len) in lengths {
                offset = align(offset, kind.alignment());
                section.place(slot, offset, len);
                offset += len;
            }
        }

        let map_off = align(offset, 4);
        map.push(MapItem { type_code: TYPE_MAP_LIST, size: 1, offset: map_off });
        self.refresh()?;
        debug!("laid out {} map entries, map list at 0x{:x}", map.len(), map_off);
        Ok(Placement { tables, data_off, map_off, map })
    }

    /// Errors when a record cannot be written as it stands: a required reference with no
    /// live target, any reference whose target was removed, or a method still pointing at
    /// code this layout does not carry.
    pub fn verify(&self) -> Result<(), DexError> {
        let lookup = &self.sections;
        for (i, key) in self.keys(SectionType::TypeId)?.into_iter().enumerate() {
            required(self.record::<TypeId>(key)?.descriptor(lookup)?, "type_id", "descriptor", i)?;
        }
        for (i, key) in self.keys(SectionType::ProtoId)?.into_iter().enumerate() {
            let proto = self.record::<ProtoId>(key)?;
            required(proto.shorty(lookup)?, "proto_id", "shorty", i)?;
            required(proto.return_type(lookup)?, "proto_id", "return_type", i)?;
        }
        for (i, key) in self.keys(SectionType::FieldId)?.into_iter().enumerate() {
            let field = self.record::<FieldId>(key)?;
            required(field.class(lookup)?, "field_id", "class", i)?;
            required(field.descriptor(lookup)?, "field_id", "type", i)?;
            required(field.name(lookup)?, "field_id", "name", i)?;
        }
        for (i, key) in self.keys(SectionType::MethodId)?.into_iter().enumerate() {
            let method = self.record::<MethodId>(key)?;
            required(method.class(lookup)?, "method_id", "class", i)?;
            required(method.descriptor(lookup)?, "method_id", "proto", i)?;
            required(method.name(lookup)?, "method_id", "name", i)?;
        }
        for (i, key) in self.keys(SectionType::ClassId)?.into_iter().enumerate() {
            required(self.record::<ClassDef>(key)?.class_type(lookup)?, "class_def", "class_type", i)?;
        }
        for kind in REFRESH_ORDER {
            dispatch!(kind, check_section(self))?;
        }
        for key in self.keys(SectionType::ClassData)? {
            if let Some(method) = self.record::<ClassData>(key)?.methods_with_code().next() {
                return Err(DexError::consistency(
                    "class_data",
                    "code_off",
                    &format!("{} still points at a code item at 0x{:x}", self.item_text(method.method)?, method.code_off),
                ));
            }
        }
        Ok(())
    }

    /// Lays the file out again and serializes it. Writing the result back through
    /// [`DexLayout::from_bytes`] and `to_bytes` gives the same bytes.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, DexError> {
        let placement = self.place_all()?;
        self.verify()?;

        let mut out = vec![0u8; HEADER_SIZE as usize];
        let strings = self.sections.map(SectionType::StringData)?;
        for slot in strings.slots() {
            write_u4(&mut out, strings.offset_of(*slot).unwrap_or(0));
        }
        for (kind, _) in &ID_TABLES[1..] {
            dispatch!(*kind, write_section(self, &mut out))?;
        }
        for kind in DATA_ORDER {
            dispatch!(kind, write_section(self, &mut out))?;
        }
        out.resize(placement.map_off as usize, 0);
        write_map_list(&placement.map, &mut out);

        let table = |kind: SectionType| {
            placement.tables.iter().find(|(k, _, _)| *k == kind).map(|(_, count, off)| (*count, *off)).unwrap_or((0, 0))
        };
        let file_size = out.len() as u32;
        let header = Header {
            magic: DEX_MAGIC,
            checksum: 0,
            signature: [0; 20],
            file_size,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off: placement.map_off,
            string_ids_size: table(SectionType::StringData).0,
            string_ids_off: table(SectionType::StringData).1,
            type_ids_size: table(SectionType::TypeId).0,
            type_ids_off: table(SectionType::TypeId).1,
            proto_ids_size: table(SectionType::ProtoId).0,
            proto_ids_off: table(SectionType::ProtoId).1,
            field_ids_size: table(SectionType::FieldId).0,
            field_ids_off: table(SectionType::FieldId).1,
            method_ids_size: table(SectionType::MethodId).0,
            method_ids_off: table(SectionType::MethodId).1,
            class_defs_size: table(SectionType::ClassId).0,
            class_defs_off: table(SectionType::ClassId).1,
            data_size: file_size - placement.data_off,
            data_off: placement.data_off,
        };
        let mut head = Vec::with_capacity(HEADER_SIZE as usize);
        header.write(&mut head);
        out[..HEADER_SIZE as usize].copy_from_slice(&head);

        let signature = compute_sha1(&out[32..]);
        out[12..32].copy_from_slice(&signature);
        let checksum = adler32_slice(&out[12..]);
        out[8..12].copy_from_slice(&checksum.to_le_bytes());

        debug!("wrote dex of {} bytes", out.len());
        Ok(out)
    }
}

fn required(key: Option<ItemKey>, record: &str, field: &str, index: usize) -> Result<ItemKey, DexError> {
    key.ok_or_else(|| {
        DexError::with_context(
            DexError::consistency(record, field, "required reference is not set"),
            format!("{} #{}", record, index),
        )
    })
}

fn compute_sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Reads one record at `offset` and places it there. Returns the offsets it points at.
fn read_record<T: LayoutItem>(layout: &mut DexLayout, bytes: &[u8], offset: u32) -> Result<Vec<(SectionType, u32)>, DexError> {
    let mut ix = offset as usize;
    let item = T::read(bytes, &mut ix, &layout.sections)
        .map_err(|e| DexError::with_context(e, format!("{} at 0x{:x}", T::SECTION, offset)))?;
    let next = item.outgoing_offsets();
    let key = layout.push(item)?;
    layout.sections.map_mut(T::SECTION)?.place(key.slot(), offset, (ix - offset as usize) as u32);
    Ok(next)
}

fn read_table<T: LayoutItem>(layout: &mut DexLayout, bytes: &[u8], offset: u32, count: u32, size: u32) -> Result<(), DexError> {
    for i in 0..count {
        read_record::<T>(layout, bytes, offset + i * size)
            .map_err(|e| DexError::with_context(e, format!("{} #{}", T::SECTION, i)))?;
    }
    Ok(())
}

fn cache_section<T: LayoutItem>(layout: &DexLayout) -> Result<(), DexError> {
    for slot in layout.sections.map(T::SECTION)?.slots() {
        if let Some(item) = T::storage(layout).get(*slot) {
            item.cache_items(&layout.sections)?;
        }
    }
    Ok(())
}

fn check_section<T: LayoutItem>(layout: &DexLayout) -> Result<(), DexError> {
    for (index, slot) in layout.sections.map(T::SECTION)?.slots().iter().enumerate() {
        if let Some(item) = T::storage(layout).get(*slot) {
            item.check_references(&layout.sections)
                .map_err(|e| DexError::with_context(e, format!("{} #{}", T::SECTION, index)))?;
        }
    }
    Ok(())
}

fn refresh_section<T: LayoutItem>(layout: &mut DexLayout) -> Result<(), DexError> {
    let (section, sections) = T::split(layout);
    for (index, slot) in sections.map(T::SECTION)?.slots().iter().enumerate() {
        if let Some(item) = section.get_mut(*slot) {
            item.refresh(sections)
                .map_err(|e| DexError::with_context(e, format!("{} #{}", T::SECTION, index)))?;
        }
    }
    Ok(())
}

fn record_lengths<T: LayoutItem>(layout: &DexLayout) -> Result<Vec<(u32, u32)>, DexError> {
    let mut lengths = vec![];
    for (index, slot) in layout.sections.map(T::SECTION)?.slots().iter().enumerate() {
        let item = layout.record::<T>(ItemKey::new(T::SECTION, *slot))?;
        let len = item
            .byte_len(&layout.sections)
            .map_err(|e| DexError::with_context(e, format!("{} #{}", T::SECTION, index)))?;
        lengths.push((*slot, len));
    }
    Ok(lengths)
}

fn write_section<T: LayoutItem>(layout: &DexLayout, out: &mut Vec<u8>) -> Result<(), DexError> {
    let map = layout.sections.map(T::SECTION)?;
    for slot in map.slots() {
        let Some(offset) = map.offset_of(*slot) else {
            return Err(DexError::consistency(T::SECTION.name(), "offset", "record was never placed"));
        };
        if out.len() > offset as usize {
            return Err(DexError::consistency(T::SECTION.name(), "offset", &format!("record at 0x{:x} overlaps", offset)));
        }
        out.resize(offset as usize, 0);
        layout.record::<T>(ItemKey::new(T::SECTION, *slot))?.write(out, &layout.sections)?;
    }
    Ok(())
}

impl SectionLookup for DexLayout {
    fn key_at_index(&self, section: SectionType, index: u32) -> Result<Option<ItemKey>, DexError> {
        self.sections.key_at_index(section, index)
    }

    fn key_at_offset(&self, section: SectionType, offset: u32) -> Result<Option<ItemKey>, DexError> {
        self.sections.key_at_offset(section, offset)
    }

    fn index_of(&self, key: ItemKey) -> Result<Option<u32>, DexError> {
        self.sections.index_of(key)
    }

    fn offset_of(&self, key: ItemKey) -> Result<Option<u32>, DexError> {
        self.sections.offset_of(key)
    }
}

impl ItemText for DexLayout {
    fn string_text(&self, key: ItemKey) -> Result<String, DexError> {
        let string = self.string(key)?;
        Ok(match string.as_str() {
            Some(s) => s.to_string(),
            None => string.to_string(),
        })
    }

    fn item_text(&self, key: ItemKey) -> Result<String, DexError> {
        match key.section() {
            SectionType::StringData => {
                let mut out = String::new();
                self.string(key)?.write_quoted(&mut out);
                Ok(out)
            }
            SectionType::TypeId => self.type_descriptor(key),
            SectionType::ProtoId => self.proto_text(key),
            SectionType::FieldId | SectionType::MethodId => {
                Ok(format!("{}->{}", self.member_class(key)?, self.member_text(key)?))
            }
            other => Err(DexError::binding(other.name(), "key", "has no smali reference form")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::access_flags::AccessFlags;
    use crate::dex::class_data::EncodedField;
    use crate::dex::error::ErrorKind;

    fn sample() -> (DexLayout, ItemKey) {
        let mut dex = DexLayout::new();
        let class_type = dex.intern_type("Lcom/x/A;").unwrap();
        let object = dex.intern_type("Ljava/lang/Object;").unwrap();
        let field = dex.intern_field("Lcom/x/A;", "count", "I").unwrap();

        let mut data = ClassData::new();
        data.instance_fields.push(EncodedField { field, access_flags: AccessFlags::PRIVATE });
        let data = dex.push(data).unwrap();

        let mut class = ClassDef::new();
        class.set_class_type(Some(class_type), dex.lookup()).unwrap();
        class.set_superclass(Some(object), dex.lookup()).unwrap();
        class.set_access_flags(AccessFlags::PUBLIC).unwrap();
        class.set_class_data(Some(data), dex.lookup()).unwrap();
        let class = dex.push(class).unwrap();
        (dex, class)
    }

    #[test]
    fn interning_keeps_tables_sorted_and_deduplicated() {
        let mut dex = DexLayout::new();
        let b = dex.intern_string("b").unwrap();
        let a = dex.intern_string("a").unwrap();
        assert_eq!(dex.intern_string("b").unwrap(), b);
        assert_eq!(dex.keys(SectionType::StringData).unwrap(), vec![a, b]);

        let t1 = dex.intern_type("Lz;").unwrap();
        let t2 = dex.intern_type("I").unwrap();
        assert_eq!(dex.intern_type("Lz;").unwrap(), t1);
        assert_eq!(dex.keys(SectionType::TypeId).unwrap(), vec![t2, t1]);
        assert_eq!(dex.intern_type("Q").unwrap_err().kind(), ErrorKind::Binding);
    }

    #[test]
    fn protos_share_parameter_lists() {
        let mut dex = DexLayout::new();
        let p1 = dex.intern_proto("(ILjava/lang/String;)V").unwrap();
        let p2 = dex.intern_proto("(ILjava/lang/String;)Z").unwrap();
        assert_eq!(dex.intern_proto("(ILjava/lang/String;)V").unwrap(), p1);
        assert_eq!(dex.len(SectionType::TypeList), 1);
        assert_eq!(dex.proto_text(p2).unwrap(), "(ILjava/lang/String;)Z");
        let shorty = dex.record::<ProtoId>(p1).unwrap().shorty(dex.lookup()).unwrap().unwrap();
        assert_eq!(dex.string_text(shorty).unwrap(), "VIL");
    }

    #[test]
    fn member_text_forms() {
        let mut dex = DexLayout::new();
        let f = dex.intern_field("Lcom/x/A;", "count", "I").unwrap();
        let m = dex.intern_method("Lcom/x/A;", "run", "(J)V").unwrap();
        assert_eq!(dex.member_text(f).unwrap(), "count:I");
        assert_eq!(dex.item_text(f).unwrap(), "Lcom/x/A;->count:I");
        assert_eq!(dex.item_text(m).unwrap(), "Lcom/x/A;->run(J)V");
    }

    #[test]
    fn serialized_file_is_a_fixed_point() {
        let (mut dex, _) = sample();
        let first = dex.to_bytes().unwrap();
        assert_eq!(&first[0..8], &DEX_MAGIC);
        assert_eq!(u32::from_le_bytes([first[32], first[33], first[34], first[35]]) as usize, first.len());

        let mut reread = DexLayout::from_bytes(&first).unwrap();
        assert_eq!(reread.len(SectionType::ClassData), 1);
        assert!(reread.find_class("Lcom/x/A;").unwrap().is_some());
        let second = reread.to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn checksum_covers_everything_after_it() {
        let (mut dex, _) = sample();
        let bytes = dex.to_bytes().unwrap();
        let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(stored, adler32_slice(&bytes[12..]));
        assert_eq!(&bytes[12..32], &compute_sha1(&bytes[32..]));
    }

    #[test]
    fn removed_required_target_fails_serialization() {
        let (mut dex, class) = sample();
        let class_type = dex.record::<ClassDef>(class).unwrap().class_type(dex.lookup()).unwrap().unwrap();
        let _ = dex.remove::<TypeId>(class_type).unwrap();
        let err = dex.to_bytes().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }

    #[test]
    fn methods_with_code_are_refused() {
        let (mut dex, class) = sample();
        let method = dex.intern_method("Lcom/x/A;", "run", "()V").unwrap();
        let data = dex.record::<ClassDef>(class).unwrap().class_data(dex.lookup()).unwrap().unwrap();
        dex.edit::<ClassData, _>(data, |d, _| {
            d.virtual_methods.push(crate::dex::class_data::EncodedMethod {
                method,
                access_flags: AccessFlags::PUBLIC,
                code_off: 0x200,
            });
            Ok(())
        })
        .unwrap();
        let err = dex.to_bytes().unwrap_err();
        assert!(err.message().starts_with("class_data.code_off"));
    }

    #[test]
    fn records_of_another_kind_are_not_found() {
        let (dex, class) = sample();
        assert!(dex.get::<TypeId>(class).is_none());
        assert_eq!(dex.record::<TypeId>(class).unwrap_err().kind(), ErrorKind::Binding);
    }

    #[test]
    fn truncated_input_is_malformed() {
        let (mut dex, _) = sample();
        let bytes = dex.to_bytes().unwrap();
        let err = DexLayout::from_bytes(&bytes[..bytes.len() / 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
