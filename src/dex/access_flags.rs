use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::dex::error::DexError;

// access_flags of classes, fields and methods. 0x40 and 0x80 mean different
// things for fields and methods, so both names are kept.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// What the flags belong to; decides which keywords apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTarget {
    Class,
    Field,
    Method,
}

const CLASS_KEYWORDS: &[(AccessFlags, &str)] = &[
    (AccessFlags::PUBLIC, "public"),
    (AccessFlags::PRIVATE, "private"),
    (AccessFlags::PROTECTED, "protected"),
    (AccessFlags::STATIC, "static"),
    (AccessFlags::FINAL, "final"),
    (AccessFlags::INTERFACE, "interface"),
    (AccessFlags::ABSTRACT, "abstract"),
    (AccessFlags::SYNTHETIC, "synthetic"),
    (AccessFlags::ANNOTATION, "annotation"),
    (AccessFlags::ENUM, "enum"),
];

const FIELD_KEYWORDS: &[(AccessFlags, &str)] = &[
    (AccessFlags::PUBLIC, "public"),
    (AccessFlags::PRIVATE, "private"),
    (AccessFlags::PROTECTED, "protected"),
    (AccessFlags::STATIC, "static"),
    (AccessFlags::FINAL, "final"),
    (AccessFlags::VOLATILE, "volatile"),
    (AccessFlags::TRANSIENT, "transient"),
    (AccessFlags::SYNTHETIC, "synthetic"),
    (AccessFlags::ENUM, "enum"),
];

const METHOD_KEYWORDS: &[(AccessFlags, &str)] = &[
    (AccessFlags::PUBLIC, "public"),
    (AccessFlags::PRIVATE, "private"),
    (AccessFlags::PROTECTED, "protected"),
    (AccessFlags::STATIC, "static"),
    (AccessFlags::FINAL, "final"),
    (AccessFlags::SYNCHRONIZED, "synchronized"),
    (AccessFlags::BRIDGE, "bridge"),
    (AccessFlags::VARARGS, "varargs"),
    (AccessFlags::NATIVE, "native"),
    (AccessFlags::ABSTRACT, "abstract"),
    (AccessFlags::STRICT, "strict"),
    (AccessFlags::SYNTHETIC, "synthetic"),
    (AccessFlags::CONSTRUCTOR, "constructor"),
    (AccessFlags::DECLARED_SYNCHRONIZED, "declared-synchronized"),
];

static KEYWORD_MAP: Lazy<HashMap<&'static str, AccessFlags>> = Lazy::new(|| {
    CLASS_KEYWORDS
        .iter()
        .chain(FIELD_KEYWORDS)
        .chain(METHOD_KEYWORDS)
        .map(|(flag, name)| (*name, *flag))
        .collect()
});

impl FlagTarget {
    fn keywords(self) -> &'static [(AccessFlags, &'static str)] {
        match self {
            FlagTarget::Class => CLASS_KEYWORDS,
            FlagTarget::Field => FIELD_KEYWORDS,
            FlagTarget::Method => METHOD_KEYWORDS,
        }
    }
}

impl AccessFlags {
    pub fn from_raw(bits: u32) -> AccessFlags {
        AccessFlags::from_bits_retain(bits)
    }

    /// Keywords in smali order, each followed by a space.
    pub fn to_keywords(&self, target: FlagTarget) -> String {
        let mut out = String::new();
        for (flag, name) in target.keywords() {
            if self.contains(*flag) {
                out.push_str(name);
                out.push(' ');
            }
        }
        out
    }

    /// Parses space separated keywords; a keyword the target does not know is an error.
    pub fn from_keywords(s: &str, target: FlagTarget) -> Result<AccessFlags, DexError> {
        let mut flags = AccessFlags::empty();
        for word in s.split_whitespace() {
            let Some(flag) = KEYWORD_MAP.get(word) else {
                fail!("Unknown modifier {}", word);
            };
            if !target.keywords().iter().any(|(_, name)| *name == word) {
                fail!("Modifier {} does not apply to a {:?}", word, target);
            }
            flags |= *flag;
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_bits_render_per_target() {
        let flags = AccessFlags::from_raw(0x1 | 0x40 | 0x80);
        assert_eq!(flags.to_keywords(FlagTarget::Field), "public volatile transient ");
        assert_eq!(flags.to_keywords(FlagTarget::Method), "public bridge varargs ");
        assert_eq!(flags.to_keywords(FlagTarget::Class), "public ");
    }

    #[test]
    fn class_keyword_order() {
        let flags = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        assert_eq!(flags.to_keywords(FlagTarget::Class), "public interface abstract ");
        // ACC_SUPER-style bits have no class keyword
        assert_eq!(AccessFlags::from_raw(0x20).to_keywords(FlagTarget::Class), "");
    }

    #[test]
    fn keywords_parse_back() {
        let flags = AccessFlags::from_keywords("public static final", FlagTarget::Field).unwrap();
        assert_eq!(flags.bits(), 0x19);
        let m = AccessFlags::from_keywords("private constructor", FlagTarget::Method).unwrap();
        assert_eq!(m.to_keywords(FlagTarget::Method), "private constructor ");
        assert!(AccessFlags::from_keywords("bridge", FlagTarget::Field).is_err());
        assert!(AccessFlags::from_keywords("sealed", FlagTarget::Class).is_err());
    }
}
