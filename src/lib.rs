//! # apkedit
//!
//! A library for editing the pieces of an Android package in place: the tables of a
//! `classes.dex` file and the namespace declarations of compiled XML resources.
//!
//! Records keep their raw bytes. A reference between records remembers the record it
//! resolved to, so tables can be reordered, grown or shrunk and every stored index and
//! offset is brought back in line when the file is written.
//!
//! # Examples
//!
//! ```
//!  use apkedit::dex::{ClassDef, DexLayout};
//!
//!  let mut dex = DexLayout::new();
//!  let class_type = dex.intern_type("Lcom/example/Main;").unwrap();
//!  let object = dex.intern_type("Ljava/lang/Object;").unwrap();
//!  let mut class = ClassDef::new();
//!  class.set_class_type(Some(class_type), dex.lookup()).unwrap();
//!  class.set_superclass(Some(object), dex.lookup()).unwrap();
//!  dex.push(class).unwrap();
//!
//!  let bytes = dex.to_bytes().unwrap();
//!  let reread = DexLayout::from_bytes(&bytes).unwrap();
//!  assert!(reread.find_class("Lcom/example/Main;").unwrap().is_some());
//! ```

pub mod android;
pub mod dex;
pub mod smali_write;
#[cfg(test)]
mod tests;
pub mod types;
