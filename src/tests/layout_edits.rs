use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dex::access_flags::AccessFlags;
use crate::dex::annotations::{AnnotationItem, AnnotationSet, AnnotationsDirectory, Visibility};
use crate::dex::encoded_values::EncodedAnnotation;
use crate::dex::error::ErrorKind;
use crate::dex::ids::TypeId;
use crate::dex::{ClassDef, DexLayout, ItemKey, SectionType};

fn layout_with_classes(names: &[&str]) -> DexLayout {
    let mut dex = DexLayout::new();
    for name in names {
        // interned after earlier classes exist, so their stored indices shift
        let class_type = dex.intern_type(name).unwrap();
        let object = dex.intern_type("Ljava/lang/Object;").unwrap();
        let mut class = ClassDef::new();
        class.set_class_type(Some(class_type), dex.lookup()).unwrap();
        class.set_superclass(Some(object), dex.lookup()).unwrap();
        class.set_access_flags(AccessFlags::PUBLIC).unwrap();
        dex.push(class).unwrap();
    }
    dex
}

fn class_names(dex: &DexLayout) -> Vec<String> {
    dex.keys(SectionType::ClassId)
        .unwrap()
        .into_iter()
        .map(|key| class_name(dex, key))
        .collect()
}

fn class_name(dex: &DexLayout, key: ItemKey) -> String {
    let class_type = dex.record::<ClassDef>(key).unwrap().class_type(dex.lookup()).unwrap().unwrap();
    dex.type_descriptor(class_type).unwrap()
}

#[test]
fn reordered_classes_survive_a_write() {
    let mut dex = layout_with_classes(&["Lz/Last;", "La/First;", "Lm/Middle;", "Lb/Second;", "Ly/Late;"]);
    let mut order = dex.keys(SectionType::ClassId).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    order.shuffle(&mut rng);
    for (i, key) in order.iter().enumerate() {
        dex.move_to(*key, i).unwrap();
    }
    assert_eq!(dex.keys(SectionType::ClassId).unwrap(), order);

    let expected: Vec<String> = order.iter().map(|key| class_name(&dex, *key)).collect();
    let bytes = dex.to_bytes().unwrap();
    let reread = DexLayout::from_bytes(&bytes).unwrap();
    assert_eq!(class_names(&reread), expected);
}

#[test]
fn refresh_is_idempotent() {
    let mut dex = layout_with_classes(&["Lb/B;", "La/A;"]);
    dex.refresh().unwrap();
    let first = dex.to_bytes().unwrap();
    dex.refresh().unwrap();
    dex.refresh().unwrap();
    let second = dex.to_bytes().unwrap();
    assert_eq!(first, second);

    let mut reread = DexLayout::from_bytes(&first).unwrap();
    reread.refresh().unwrap();
    assert_eq!(reread.to_bytes().unwrap(), first);
}

#[test]
fn interning_before_an_existing_type_keeps_references() {
    let mut dex = layout_with_classes(&["Lcom/x/B;"]);
    let before = dex.to_bytes().unwrap();
    dex.intern_type("Lcom/x/A;").unwrap();
    dex.intern_string("aaa").unwrap();
    let after = dex.to_bytes().unwrap();
    assert_ne!(before, after);

    let reread = DexLayout::from_bytes(&after).unwrap();
    let class = reread.find_class("Lcom/x/B;").unwrap().unwrap();
    assert_eq!(class_name(&reread, class), "Lcom/x/B;");
    let superclass = reread.record::<ClassDef>(class).unwrap().superclass(reread.lookup()).unwrap().unwrap();
    assert_eq!(reread.type_descriptor(superclass).unwrap(), "Ljava/lang/Object;");
    assert_eq!(reread.len(SectionType::TypeId), 3);
}

#[test]
fn moves_out_of_range_are_refused() {
    let mut dex = layout_with_classes(&["La/A;"]);
    let key = dex.keys(SectionType::ClassId).unwrap()[0];
    assert!(dex.move_to(key, 1).is_err());
}

fn superclass_of(dex: &DexLayout, class: ItemKey) -> Option<ItemKey> {
    dex.record::<ClassDef>(class).unwrap().superclass(dex.lookup()).unwrap()
}

#[test]
fn removed_superclass_fails_serialization() {
    let mut dex = layout_with_classes(&["Lcom/x/A;"]);
    let class = dex.keys(SectionType::ClassId).unwrap()[0];
    let superclass = superclass_of(&dex, class).unwrap();
    let _ = dex.remove::<TypeId>(superclass).unwrap();

    let err = dex.to_bytes().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(err.message().starts_with("class_def.superclass:"), "{}", err);

    // clearing the reference on purpose is a legal edit
    dex.edit::<ClassDef, _>(class, |c, lookup| c.set_superclass(None, lookup)).unwrap();
    let bytes = dex.to_bytes().unwrap();
    let reread = DexLayout::from_bytes(&bytes).unwrap();
    let class = reread.find_class("Lcom/x/A;").unwrap().unwrap();
    assert_eq!(superclass_of(&reread, class), None);
}

#[test]
fn removed_interface_type_fails_serialization() {
    let mut dex = layout_with_classes(&["Lcom/x/A;"]);
    let class = dex.keys(SectionType::ClassId).unwrap()[0];
    let iface = dex.intern_type("Lcom/x/I;").unwrap();
    let list = dex.intern_type_list(&[iface]).unwrap();
    dex.edit::<ClassDef, _>(class, |c, lookup| c.set_interfaces(Some(list), lookup)).unwrap();
    assert!(dex.to_bytes().is_ok());

    let _ = dex.remove::<TypeId>(iface).unwrap();
    let err = dex.to_bytes().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(err.message().starts_with("type_list.type:"), "{}", err);
}

#[test]
fn removed_annotation_item_fails_serialization() {
    let mut dex = layout_with_classes(&["Lcom/x/A;"]);
    let class = dex.keys(SectionType::ClassId).unwrap()[0];
    let marker = dex.intern_type("Lcom/x/Marker;").unwrap();
    let item = dex
        .push(AnnotationItem::new(Visibility::Runtime, EncodedAnnotation { type_id: marker, elements: vec![] }))
        .unwrap();

    let mut set = AnnotationSet::new();
    set.push(Some(item), dex.lookup()).unwrap();
    let set = dex.push(set).unwrap();
    let mut directory = AnnotationsDirectory::new();
    directory.set_class_annotations(Some(set), dex.lookup()).unwrap();
    let directory = dex.push(directory).unwrap();
    dex.edit::<ClassDef, _>(class, |c, lookup| c.set_annotations(Some(directory), lookup)).unwrap();
    assert!(dex.to_bytes().is_ok());

    let _ = dex.remove::<AnnotationItem>(item).unwrap();
    let err = dex.to_bytes().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert!(err.message().starts_with("annotation_set.entry:"), "{}", err);
}
