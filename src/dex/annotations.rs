//! DEX annotation records.
//!
//! - annotation_item (visibility + encoded annotation)
//! - annotation_set_item (offsets of annotation items)
//! - annotation_set_ref_list (offsets of annotation sets, one per parameter)
//! - annotations_directory_item (class set plus per-field/method/parameter entries)
//!
//! Offsets are held as [`OffsetReference`]s over each record's bytes, so they follow
//! their targets when the data section is laid out again.

use crate::dex::encoded_values::EncodedAnnotation;
use crate::dex::error::DexError;
use crate::dex::reference::{IndexReference, OffsetReference};
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::{read_u1, read_u4, read_x, write_u1, write_u4, write_x};
use crate::smali_write::{ItemText, SmaliWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Build,
    Runtime,
    System,
}

impl Visibility {
    pub fn from_u8(v: u8) -> Result<Self, DexError> {
        match v {
            0 => Ok(Visibility::Build),
            1 => Ok(Visibility::Runtime),
            2 => Ok(Visibility::System),
            _ => fail!("Unknown annotation visibility {}", v),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Visibility::Build => 0,
            Visibility::Runtime => 1,
            Visibility::System => 2,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            Visibility::Build => "build",
            Visibility::Runtime => "runtime",
            Visibility::System => "system",
        }
    }
}

/// annotation_item
/// https://source.android.com/docs/core/runtime/dex-format#annotation-item
#[derive(Debug)]
pub struct AnnotationItem {
    state: RecordState,
    pub visibility: Visibility,
    pub annotation: EncodedAnnotation,
}

impl AnnotationItem {
    pub fn new(visibility: Visibility, annotation: EncodedAnnotation) -> Self {
        AnnotationItem { state: RecordState::Unbound, visibility, annotation }
    }

    /// `.annotation <visibility> TYPE`, indented elements, `.end annotation`.
    pub fn render(&self, names: &dyn ItemText, w: &mut SmaliWriter) -> Result<(), DexError> {
        w.line(&format!(".annotation {} {}", self.visibility.to_str(), names.item_text(self.annotation.type_id)?));
        w.indent();
        for e in &self.annotation.elements {
            w.line(&e.render(names)?);
        }
        w.dedent();
        w.line(".end annotation");
        Ok(())
    }
}

impl SectionItem for AnnotationItem {
    const SECTION: SectionType = SectionType::AnnotationItem;

    fn read(bytes: &[u8], ix: &mut usize, lookup: &dyn SectionLookup) -> Result<AnnotationItem, DexError> {
        let visibility = Visibility::from_u8(read_u1(bytes, ix)?)?;
        let annotation = EncodedAnnotation::read(bytes, ix, lookup)?;
        Ok(AnnotationItem::new(visibility, annotation))
    }

    fn write(&self, bytes: &mut Vec<u8>, lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        Ok(write_u1(bytes, self.visibility.to_u8()) + self.annotation.write(bytes, lookup)?)
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }
}

/// A u32 count followed by u32 offsets into one section.
#[derive(Debug)]
struct OffsetList {
    owner: &'static str,
    target: SectionType,
    bytes: Vec<u8>,
    entries: Vec<OffsetReference>,
}

impl OffsetList {
    fn new(owner: &'static str, target: SectionType) -> Self {
        OffsetList { owner, target, bytes: vec![0; 4], entries: vec![] }
    }

    fn entry(&self, at: usize) -> OffsetReference {
        OffsetReference::new(self.owner, "entry", self.target, 4 + 4 * at)
    }

    fn read(owner: &'static str, target: SectionType, bytes: &[u8], ix: &mut usize) -> Result<Self, DexError> {
        let start = *ix;
        let size = read_u4(bytes, ix)? as usize;
        read_x(bytes, ix, size.saturating_mul(4))?;
        let mut list = OffsetList::new(owner, target);
        list.bytes = bytes[start..*ix].to_vec();
        list.entries = (0..size).map(|at| list.entry(at)).collect();
        Ok(list)
    }

    fn items(&self, lookup: &dyn SectionLookup) -> Result<Vec<Option<ItemKey>>, DexError> {
        self.entries.iter().map(|r| r.resolve(&self.bytes, lookup)).collect()
    }

    fn push(&mut self, target: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        let r = self.entry(self.entries.len());
        self.bytes.extend_from_slice(&[0; 4]);
        if let Err(e) = r.set(&mut self.bytes, target, lookup) {
            self.bytes.truncate(self.bytes.len() - 4);
            return Err(e);
        }
        self.entries.push(r);
        self.store_count();
        Ok(())
    }

    fn remove(&mut self, at: usize, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        if at >= self.entries.len() {
            fail!("{} entry {} out of range ({} entries)", self.owner, at, self.entries.len());
        }
        let mut targets = self.items(lookup)?;
        targets.remove(at);
        self.bytes.truncate(4);
        self.entries.clear();
        for target in targets {
            self.push(target, lookup)?;
        }
        self.store_count();
        Ok(())
    }

    fn store_count(&mut self) {
        let count = self.entries.len() as u32;
        self.bytes[0..4].copy_from_slice(&count.to_le_bytes());
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        for r in &self.entries {
            r.refresh(&mut self.bytes, lookup)?;
        }
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.items(lookup).map(|_| ())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        for (at, r) in self.entries.iter().enumerate() {
            r.check_live(&self.bytes, lookup)
                .map_err(|e| DexError::with_context(e, format!("entry {}", at)))?;
        }
        Ok(())
    }

    fn outgoing_offsets(&self) -> Vec<(SectionType, u32)> {
        self.entries
            .iter()
            .map(|r| (self.target, r.stored(&self.bytes)))
            .filter(|(_, offset)| *offset != 0)
            .collect()
    }
}

/// annotation_set_item
/// https://source.android.com/docs/core/runtime/dex-format#annotation-set-item
#[derive(Debug)]
pub struct AnnotationSet {
    state: RecordState,
    list: OffsetList,
}

/// annotation_set_ref_list, one entry per method parameter; entries may be absent.
/// https://source.android.com/docs/core/runtime/dex-format#annotation-set-ref-list
#[derive(Debug)]
pub struct AnnotationSetRefList {
    state: RecordState,
    list: OffsetList,
}

macro_rules! offset_list_record {
    ($record:ident, $section:expr, $owner:literal, $target:expr) => {
        impl $record {
            pub fn new() -> Self {
                $record { state: RecordState::Unbound, list: OffsetList::new($owner, $target) }
            }

            pub fn len(&self) -> usize {
                self.list.entries.len()
            }

            pub fn is_empty(&self) -> bool {
                self.list.entries.is_empty()
            }

            pub fn items(&self, lookup: &dyn SectionLookup) -> Result<Vec<Option<ItemKey>>, DexError> {
                if !self.state.check($owner, "entry")? {
                    return Ok(vec![]);
                }
                self.list.items(lookup)
            }

            pub fn push(&mut self, target: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
                self.state.check_writable($owner, "entry")?;
                self.list.push(target, lookup)
            }

            pub fn remove(&mut self, at: usize, lookup: &dyn SectionLookup) -> Result<(), DexError> {
                self.state.check_writable($owner, "entry")?;
                self.list.remove(at, lookup)
            }
        }

        impl Default for $record {
            fn default() -> Self {
                Self::new()
            }
        }

        impl SectionItem for $record {
            const SECTION: SectionType = $section;

            fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<Self, DexError> {
                let list = OffsetList::read($owner, $target, bytes, ix)?;
                Ok($record { state: RecordState::Unbound, list })
            }

            fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError> {
                Ok(write_x(bytes, &self.list.bytes))
            }

            fn state(&self) -> RecordState {
                self.state
            }

            fn set_state(&mut self, state: RecordState) {
                self.state = state;
            }

            fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
                self.list.refresh(lookup)
            }

            fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
                self.list.cache_items(lookup)
            }

            fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
                self.list.check_references(lookup)
            }

            fn outgoing_offsets(&self) -> Vec<(SectionType, u32)> {
                self.list.outgoing_offsets()
            }
        }
    };
}

offset_list_record!(AnnotationSet, SectionType::AnnotationSet, "annotation_set", SectionType::AnnotationItem);
offset_list_record!(AnnotationSetRefList, SectionType::AnnotationSetRefList, "annotation_set_ref_list", SectionType::AnnotationSet);

/// One field_annotation, method_annotation or parameter_annotation entry: a member index
/// and the offset of its annotations.
#[derive(Debug)]
pub struct MemberAnnotations {
    bytes: [u8; 8],
    member: IndexReference,
    annotations: OffsetReference,
}

impl MemberAnnotations {
    fn with_bytes(bytes: [u8; 8], member: SectionType, annotations: SectionType) -> Self {
        MemberAnnotations {
            bytes,
            member: IndexReference::new("annotations_directory", "member", member, 0),
            annotations: OffsetReference::new("annotations_directory", "annotations", annotations, 4),
        }
    }

    pub fn member(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.member.resolve(&self.bytes, lookup)
    }

    pub fn annotations(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.annotations.resolve(&self.bytes, lookup)
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.member.refresh(&mut self.bytes, lookup)?;
        self.annotations.refresh(&mut self.bytes, lookup)?;
        Ok(())
    }
}

/// annotations_directory_item
/// https://source.android.com/docs/core/runtime/dex-format#annotations-directory-item
#[derive(Debug)]
pub struct AnnotationsDirectory {
    state: RecordState,
    class_bytes: [u8; 4],
    class_annotations: OffsetReference,
    fields: Vec<MemberAnnotations>,
    methods: Vec<MemberAnnotations>,
    parameters: Vec<MemberAnnotations>,
}

impl AnnotationsDirectory {
    const NAME: &'static str = "annotations_directory";

    pub fn new() -> Self {
        AnnotationsDirectory {
            state: RecordState::Unbound,
            class_bytes: [0; 4],
            class_annotations: OffsetReference::new(Self::NAME, "class_annotations", SectionType::AnnotationSet, 0),
            fields: vec![],
            methods: vec![],
            parameters: vec![],
        }
    }

    /// The class-level annotation set; `None` when the class carries none.
    pub fn class_annotations(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        if !self.state.check(Self::NAME, "class_annotations")? {
            return Ok(None);
        }
        self.class_annotations.resolve(&self.class_bytes, lookup)
    }

    pub fn set_class_annotations(&mut self, set: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(Self::NAME, "class_annotations")?;
        self.class_annotations.set(&mut self.class_bytes, set, lookup)
    }

    pub fn fields(&self) -> &[MemberAnnotations] {
        &self.fields
    }

    pub fn methods(&self) -> &[MemberAnnotations] {
        &self.methods
    }

    pub fn parameters(&self) -> &[MemberAnnotations] {
        &self.parameters
    }

    pub fn add_field(&mut self, field: ItemKey, set: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        let entry = Self::new_entry(SectionType::FieldId, SectionType::AnnotationSet, field, set, lookup)?;
        self.fields.push(entry);
        Ok(())
    }

    pub fn add_method(&mut self, method: ItemKey, set: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        let entry = Self::new_entry(SectionType::MethodId, SectionType::AnnotationSet, method, set, lookup)?;
        self.methods.push(entry);
        Ok(())
    }

    pub fn add_parameters(&mut self, method: ItemKey, list: ItemKey, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        let entry = Self::new_entry(SectionType::MethodId, SectionType::AnnotationSetRefList, method, list, lookup)?;
        self.parameters.push(entry);
        Ok(())
    }

    fn new_entry(
        member_section: SectionType,
        target_section: SectionType,
        member: ItemKey,
        target: ItemKey,
        lookup: &dyn SectionLookup,
    ) -> Result<MemberAnnotations, DexError> {
        let mut entry = MemberAnnotations::with_bytes([0; 8], member_section, target_section);
        entry.member.set(&mut entry.bytes, Some(member), lookup)?;
        entry.annotations.set(&mut entry.bytes, Some(target), lookup)?;
        Ok(entry)
    }

    fn entries(&self) -> impl Iterator<Item = &MemberAnnotations> {
        self.fields.iter().chain(self.methods.iter()).chain(self.parameters.iter())
    }
}

fn read_entries(
    bytes: &[u8],
    ix: &mut usize,
    count: usize,
    member: SectionType,
    target: SectionType,
) -> Result<Vec<MemberAnnotations>, DexError> {
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let raw = read_x(bytes, ix, 8)?;
        let mut entry = [0u8; 8];
        entry.copy_from_slice(&raw);
        entries.push(MemberAnnotations::with_bytes(entry, member, target));
    }
    Ok(entries)
}

impl Default for AnnotationsDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionItem for AnnotationsDirectory {
    const SECTION: SectionType = SectionType::AnnotationsDirectory;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<AnnotationsDirectory, DexError> {
        let mut dir = AnnotationsDirectory::new();
        dir.class_bytes = read_u4(bytes, ix)?.to_le_bytes();
        let fields_size = read_u4(bytes, ix)? as usize;
        let annotated_methods_size = read_u4(bytes, ix)? as usize;
        let annotated_parameters_size = read_u4(bytes, ix)? as usize;

        dir.fields = read_entries(bytes, ix, fields_size, SectionType::FieldId, SectionType::AnnotationSet)?;
        dir.methods = read_entries(bytes, ix, annotated_methods_size, SectionType::MethodId, SectionType::AnnotationSet)?;
        dir.parameters =
            read_entries(bytes, ix, annotated_parameters_size, SectionType::MethodId, SectionType::AnnotationSetRefList)?;
        Ok(dir)
    }

    fn write(&self, bytes: &mut Vec<u8>, _lookup: &dyn SectionLookup) -> Result<usize, DexError> {
        let mut c = 0;
        c += write_x(bytes, &self.class_bytes);
        c += write_u4(bytes, self.fields.len() as u32);
        c += write_u4(bytes, self.methods.len() as u32);
        c += write_u4(bytes, self.parameters.len() as u32);
        for entry in self.entries() {
            c += write_x(bytes, &entry.bytes);
        }
        Ok(c)
    }

    fn state(&self) -> RecordState {
        self.state
    }

    fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_annotations.refresh(&mut self.class_bytes, lookup)?;
        for entry in self.fields.iter_mut().chain(self.methods.iter_mut()).chain(self.parameters.iter_mut()) {
            entry.refresh(lookup)?;
        }
        Ok(())
    }

    fn outgoing_offsets(&self) -> Vec<(SectionType, u32)> {
        let class = (SectionType::AnnotationSet, self.class_annotations.stored(&self.class_bytes));
        std::iter::once(class)
            .chain(self.entries().map(|e| (e.annotations.section(), e.annotations.stored(&e.bytes))))
            .filter(|(_, offset)| *offset != 0)
            .collect()
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_annotations.resolve(&self.class_bytes, lookup)?;
        for entry in self.entries() {
            entry.member(lookup)?;
            entry.annotations(lookup)?;
        }
        Ok(())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_annotations.check_live(&self.class_bytes, lookup)?;
        for entry in self.entries() {
            entry.member.check_live(&entry.bytes, lookup)?;
            entry.annotations.check_live(&entry.bytes, lookup)?;
        }
        Ok(())
    }
}
