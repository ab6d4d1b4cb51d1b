//! APK level helpers: archive entry sources and compiled XML resources.

pub mod archive;
pub mod binary_xml;
