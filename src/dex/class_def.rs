//! class_def_item: the fixed 32-byte record that ties a class to its supertypes,
//! interfaces, annotations, members and static values.
//!
//! | offset | field            | addressing             |
//! |--------|------------------|------------------------|
//! | 0      | class type       | type_id index          |
//! | 4      | access flags     | raw                    |
//! | 8      | superclass       | type_id index, nullable|
//! | 12     | interfaces       | type_list offset       |
//! | 16     | source file      | string index, nullable |
//! | 20     | annotations      | directory offset       |
//! | 24     | class data       | class_data offset      |
//! | 28     | static values    | encoded_array offset   |

use log::warn;

use crate::dex::access_flags::{AccessFlags, FlagTarget};
use crate::dex::annotations::{AnnotationItem, AnnotationSet, AnnotationsDirectory, MemberAnnotations};
use crate::dex::class_data::ClassData;
use crate::dex::encoded_values::{EncodedArray, EncodedValue};
use crate::dex::error::DexError;
use crate::dex::ids::read_fixed;
use crate::dex::layout::DexLayout;
use crate::dex::reference::{IndexReference, IndirectField, OffsetReference};
use crate::dex::section::{ItemKey, RecordState, SectionItem, SectionLookup, SectionType};
use crate::dex::strings::StringData;
use crate::dex::type_list::TypeList;
use crate::dex::write_x;
use crate::smali_write::{ItemText, SmaliWriter};

/// Root of the class hierarchy, the only class allowed to have no superclass.
pub const ROOT_TYPE: &str = "Ljava/lang/Object;";

const NAME: &str = "class_def";

#[derive(Debug)]
pub struct ClassDef {
    state: RecordState,
    bytes: [u8; 32],
    class_type: IndexReference,
    access_flags: IndirectField<u32>,
    superclass: IndexReference,
    interfaces: OffsetReference,
    source_file: IndexReference,
    annotations: OffsetReference,
    class_data: OffsetReference,
    static_values: OffsetReference,
}

impl ClassDef {
    pub const SIZE: usize = 32;

    /// A class with every reference absent: sentinel indices, zero offsets.
    pub fn new() -> Self {
        let mut bytes = [0u8; 32];
        bytes[0..4].copy_from_slice(&[0xff; 4]);
        bytes[8..12].copy_from_slice(&[0xff; 4]);
        bytes[16..20].copy_from_slice(&[0xff; 4]);
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: [u8; 32]) -> Self {
        ClassDef {
            state: RecordState::Unbound,
            bytes,
            class_type: IndexReference::new(NAME, "class_type", SectionType::TypeId, 0),
            access_flags: IndirectField::new(4),
            superclass: IndexReference::new(NAME, "superclass", SectionType::TypeId, 8),
            interfaces: OffsetReference::new(NAME, "interfaces", SectionType::TypeList, 12),
            source_file: IndexReference::new(NAME, "source_file", SectionType::StringData, 16),
            annotations: OffsetReference::new(NAME, "annotations", SectionType::AnnotationsDirectory, 20),
            class_data: OffsetReference::new(NAME, "class_data", SectionType::ClassData, 24),
            static_values: OffsetReference::new(NAME, "static_values", SectionType::EncodedArray, 28),
        }
    }

    fn get(&self, r: &IndexReference, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        if !self.state.check(NAME, r.name())? {
            return Ok(None);
        }
        r.resolve(&self.bytes, lookup)
    }

    fn get_offset(&self, r: &OffsetReference, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        if !self.state.check(NAME, r.name())? {
            return Ok(None);
        }
        r.resolve(&self.bytes, lookup)
    }

    pub fn class_type(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get(&self.class_type, lookup)
    }

    /// The class type is required; `None` is rejected.
    pub fn set_class_type(&mut self, type_id: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "class_type")?;
        if type_id.is_none() {
            return Err(DexError::binding(NAME, "class_type", "a class type is required"));
        }
        self.class_type.set(&mut self.bytes, type_id, lookup)
    }

    pub fn access_flags(&self) -> AccessFlags {
        if self.state == RecordState::Removed {
            return AccessFlags::empty();
        }
        AccessFlags::from_raw(self.access_flags.get(&self.bytes))
    }

    pub fn set_access_flags(&mut self, flags: AccessFlags) -> Result<(), DexError> {
        self.state.check_writable(NAME, "access_flags")?;
        self.access_flags.set(&mut self.bytes, flags.bits());
        Ok(())
    }

    pub fn superclass(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get(&self.superclass, lookup)
    }

    /// `None` marks the root type.
    pub fn set_superclass(&mut self, type_id: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "superclass")?;
        self.superclass.set(&mut self.bytes, type_id, lookup)
    }

    pub fn interfaces(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get_offset(&self.interfaces, lookup)
    }

    pub fn set_interfaces(&mut self, list: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "interfaces")?;
        self.interfaces.set(&mut self.bytes, list, lookup)
    }

    pub fn source_file(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get(&self.source_file, lookup)
    }

    pub fn set_source_file(&mut self, string: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "source_file")?;
        self.source_file.set(&mut self.bytes, string, lookup)
    }

    pub fn annotations(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get_offset(&self.annotations, lookup)
    }

    pub fn set_annotations(&mut self, directory: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "annotations")?;
        self.annotations.set(&mut self.bytes, directory, lookup)
    }

    pub fn class_data(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get_offset(&self.class_data, lookup)
    }

    pub fn set_class_data(&mut self, data: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "class_data")?;
        self.class_data.set(&mut self.bytes, data, lookup)
    }

    /// The stored class data offset, as it currently sits in the record.
    pub fn class_data_offset(&self) -> u32 {
        self.class_data.stored(&self.bytes)
    }

    pub fn static_values(&self, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
        self.get_offset(&self.static_values, lookup)
    }

    pub fn set_static_values(&mut self, values: Option<ItemKey>, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.state.check_writable(NAME, "static_values")?;
        self.static_values.set(&mut self.bytes, values, lookup)
    }

    /// Renders the class as smali text into `out`.
    ///
    /// Works from the references as they resolve now and never refreshes. A missing
    /// superclass on anything but the root type is written as `<unset: error>`, the
    /// rest of the class is still rendered, and the binding error is returned at the end.
    pub fn render(&self, layout: &DexLayout, out: &mut String) -> Result<(), DexError> {
        if !self.state.check(NAME, "class_type")? {
            return Err(DexError::binding(NAME, "class_type", "record was removed from its section"));
        }
        let lookup = layout.lookup();
        let mut w = SmaliWriter::new(out);

        let class_type = self.class_type.require(&self.bytes, lookup)?;
        let descriptor = layout.type_descriptor(class_type)?;
        w.line(&format!(".class {}{}", self.access_flags().to_keywords(FlagTarget::Class), descriptor));

        let mut deferred = None;
        match self.superclass(lookup)? {
            Some(superclass) => w.line(&format!(".super {}", layout.type_descriptor(superclass)?)),
            None if descriptor == ROOT_TYPE => {}
            None => {
                w.line(".super <unset: error>");
                deferred = Some(DexError::binding(NAME, "superclass", "superclass is not set"));
            }
        }

        if let Some(source) = self.source_file(lookup)? {
            let mut quoted = String::new();
            layout.record::<StringData>(source)?.write_quoted(&mut quoted);
            w.line(&format!(".source {}", quoted));
        }

        if let Some(list) = self.interfaces(lookup)? {
            let types = layout.record::<TypeList>(list)?.types(lookup)?;
            if !types.is_empty() {
                w.blank();
                w.comment("interfaces");
                for t in types {
                    match t {
                        Some(t) => w.line(&format!(".implements {}", layout.type_descriptor(t)?)),
                        None => w.comment("removed interface"),
                    }
                }
            }
        }

        let directory = match self.annotations(lookup)? {
            Some(dir) => Some(layout.record::<AnnotationsDirectory>(dir)?),
            None => None,
        };
        if let Some(set) = directory.map(|d| d.class_annotations(lookup)).transpose()?.flatten() {
            w.blank();
            w.comment("annotations");
            render_set(layout, set, &mut w)?;
        }

        match self.class_data(lookup)? {
            Some(data) => self.render_body(layout, layout.record::<ClassData>(data)?, directory, &mut w)?,
            None => {
                warn!("{} has no class data", descriptor);
                w.comment(&format!("Null class data: {}", self.class_data_offset()));
            }
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn render_body(
        &self,
        layout: &DexLayout,
        data: &ClassData,
        directory: Option<&AnnotationsDirectory>,
        w: &mut SmaliWriter,
    ) -> Result<(), DexError> {
        let lookup = layout.lookup();
        let static_values: &[EncodedValue] = match self.static_values(lookup)? {
            Some(values) => &layout.record::<EncodedArray>(values)?.values,
            None => &[],
        };
        let no_entries: &[MemberAnnotations] = &[];
        let field_annotations = directory.map(|d| d.fields()).unwrap_or(no_entries);
        let method_annotations = directory.map(|d| d.methods()).unwrap_or(no_entries);

        let groups = [("static fields", &data.static_fields), ("instance fields", &data.instance_fields)];
        for (title, fields) in groups {
            if fields.is_empty() {
                continue;
            }
            w.blank();
            w.comment(title);
            for (i, field) in fields.iter().enumerate() {
                let mut line = format!(".field {}{}", field.access_flags.to_keywords(FlagTarget::Field), layout.member_text(field.field)?);
                if title == "static fields" {
                    if let Some(value) = static_values.get(i) {
                        line.push_str(&format!(" = {}", value.render(layout)?));
                    }
                }
                w.line(&line);
                if let Some(set) = annotations_of(field_annotations, field.field, lookup)? {
                    w.indent();
                    render_set(layout, set, w)?;
                    w.dedent();
                    w.line(".end field");
                }
            }
        }

        let groups = [("direct methods", &data.direct_methods), ("virtual methods", &data.virtual_methods)];
        for (title, methods) in groups {
            if methods.is_empty() {
                continue;
            }
            w.blank();
            w.comment(title);
            for method in methods {
                w.line(&format!(".method {}{}", method.access_flags.to_keywords(FlagTarget::Method), layout.member_text(method.method)?));
                w.indent();
                if let Some(set) = annotations_of(method_annotations, method.method, lookup)? {
                    render_set(layout, set, w)?;
                }
                if method.code_off != 0 {
                    w.comment(&format!("code_item at 0x{:x}", method.code_off));
                }
                w.dedent();
                w.line(".end method");
            }
        }
        Ok(())
    }
}

fn annotations_of(entries: &[MemberAnnotations], member: ItemKey, lookup: &dyn SectionLookup) -> Result<Option<ItemKey>, DexError> {
    for entry in entries {
        if entry.member(lookup)? == Some(member) {
            return entry.annotations(lookup);
        }
    }
    Ok(None)
}

fn render_set(layout: &DexLayout, set: ItemKey, w: &mut SmaliWriter) -> Result<(), DexError> {
    for item in layout.record::<AnnotationSet>(set)?.items(layout.lookup())? {
        match item {
            Some(item) => layout.record::<AnnotationItem>(item)?.render(layout as &dyn ItemText, w)?,
            None => w.comment("removed annotation"),
        }
    }
    Ok(())
}

impl Default for ClassDef {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionItem for ClassDef {
    const SECTION: SectionType = SectionType::ClassId;

    fn read(bytes: &[u8], ix: &mut usize, _lookup: &dyn SectionLookup) -> Result<ClassDef, DexError> {
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
        [&self.interfaces, &self.annotations, &self.class_data, &self.static_values]
            .into_iter()
            .map(|r| (r.section(), r.stored(&self.bytes)))
            .filter(|(_, offset)| *offset != 0)
            .collect()
    }

    /// Restamps in field order.
    fn refresh(&mut self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_type.refresh(&mut self.bytes, lookup)?;
        self.superclass.refresh(&mut self.bytes, lookup)?;
        self.interfaces.refresh(&mut self.bytes, lookup)?;
        self.source_file.refresh(&mut self.bytes, lookup)?;
        self.annotations.refresh(&mut self.bytes, lookup)?;
        self.class_data.refresh(&mut self.bytes, lookup)?;
        self.static_values.refresh(&mut self.bytes, lookup)?;
        Ok(())
    }

    fn cache_items(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_type.resolve(&self.bytes, lookup)?;
        self.superclass.resolve(&self.bytes, lookup)?;
        self.interfaces.resolve(&self.bytes, lookup)?;
        self.source_file.resolve(&self.bytes, lookup)?;
        self.annotations.resolve(&self.bytes, lookup)?;
        self.class_data.resolve(&self.bytes, lookup)?;
        self.static_values.resolve(&self.bytes, lookup)?;
        Ok(())
    }

    fn check_references(&self, lookup: &dyn SectionLookup) -> Result<(), DexError> {
        self.class_type.check_live(&self.bytes, lookup)?;
        self.superclass.check_live(&self.bytes, lookup)?;
        self.interfaces.check_live(&self.bytes, lookup)?;
        self.source_file.check_live(&self.bytes, lookup)?;
        self.annotations.check_live(&self.bytes, lookup)?;
        self.class_data.check_live(&self.bytes, lookup)?;
        self.static_values.check_live(&self.bytes, lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::section::Sections;

    #[test]
    fn parsed_record_writes_back_unchanged() {
        let s = Sections::new(&SectionType::DEX);
        let bytes: Vec<u8> = (0u8..32).collect();
        let mut ix = 0;
        let class = ClassDef::read(&bytes, &mut ix, &s).unwrap();
        assert_eq!(ix, 32);
        let mut out = vec![];
        class.write(&mut out, &s).unwrap();
        assert_eq!(out, bytes);
        assert_eq!(class.class_data_offset(), u32::from_le_bytes([24, 25, 26, 27]));
    }

    #[test]
    fn class_type_cannot_be_cleared() {
        let s = Sections::new(&SectionType::DEX);
        let mut class = ClassDef::new();
        let err = class.set_class_type(None, &s).unwrap_err();
        assert_eq!(err.message(), "class_def.class_type: a class type is required");
    }

    #[test]
    fn unbound_class_cannot_resolve() {
        let s = Sections::new(&SectionType::DEX);
        let class = ClassDef::new();
        assert!(class.superclass(&s).is_err());
        assert!(class.interfaces(&s).is_err());
    }

    #[test]
    fn removed_class_reports_defaults() {
        let s = Sections::new(&SectionType::DEX);
        let mut class = ClassDef::new();
        class.set_access_flags(AccessFlags::PUBLIC).unwrap();
        class.set_state(RecordState::Removed);
        assert_eq!(class.access_flags(), AccessFlags::empty());
        assert_eq!(class.superclass(&s).unwrap(), None);
        assert!(class.set_access_flags(AccessFlags::FINAL).is_err());
    }
}
