/* Type descriptors in the dex native (also JNI) form, e.g. Ljava/lang/Object; or [I */

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, one_of};
use nom::combinator::{all_consuming, map};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, terminated};
use nom::{IResult, Parser};
use std::fmt;
use std::str::FromStr;

use crate::dex::error::DexError;

/// A field or parameter type as stored in a type_id's descriptor string.
///
/// # Examples
///
/// ```
///  use apkedit::types::TypeDescriptor;
///
///  let t: TypeDescriptor = "[Ljava/lang/String;".parse().unwrap();
///  assert_eq!(t.to_java(), "java.lang.String[]");
///  assert_eq!(t.shorty(), 'L');
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    /// One of `ZBCSIJFDV`.
    Primitive(char),
    /// Class name without the `L` and `;`, slash separated.
    Object(String),
    Array(Box<TypeDescriptor>),
}

impl TypeDescriptor {
    pub fn to_jni(&self) -> String {
        match self {
            TypeDescriptor::Primitive(c) => c.to_string(),
            TypeDescriptor::Object(name) => format!("L{};", name),
            TypeDescriptor::Array(inner) => format!("[{}", inner.to_jni()),
        }
    }

    pub fn to_java(&self) -> String {
        match self {
            TypeDescriptor::Primitive(c) => match c {
                'Z' => "boolean",
                'B' => "byte",
                'C' => "char",
                'S' => "short",
                'I' => "int",
                'J' => "long",
                'F' => "float",
                'D' => "double",
                _ => "void",
            }
            .to_string(),
            TypeDescriptor::Object(name) => name.replace('/', "."),
            TypeDescriptor::Array(inner) => format!("{}[]", inner.to_java()),
        }
    }

    /// Shorty character: references of any kind collapse to `L`.
    pub fn shorty(&self) -> char {
        match self {
            TypeDescriptor::Primitive(c) => *c,
            _ => 'L',
        }
    }

    pub fn is_void(&self) -> bool {
        *self == TypeDescriptor::Primitive('V')
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

impl FromStr for TypeDescriptor {
    type Err = DexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_type_descriptor).parse(s) {
            Ok((_, t)) => Ok(t),
            Err(_) => Err(DexError::new(&format!("Invalid type descriptor {:?}", s))),
        }
    }
}

/// Parameter and return types of a method, e.g. `(ILjava/lang/String;)V`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<TypeDescriptor>,
    pub result: TypeDescriptor,
}

impl MethodDescriptor {
    /// The shorty a proto_id stores: return type first, then each parameter.
    pub fn shorty(&self) -> String {
        std::iter::once(&self.result).chain(self.params.iter()).map(TypeDescriptor::shorty).collect()
    }

    pub fn to_jni(&self) -> String {
        let params: String = self.params.iter().map(TypeDescriptor::to_jni).collect();
        format!("({}){}", params, self.result.to_jni())
    }
}

impl FromStr for MethodDescriptor {
    type Err = DexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match all_consuming(parse_method_descriptor).parse(s) {
            Ok((_, m)) => Ok(m),
            Err(_) => Err(DexError::new(&format!("Invalid method descriptor {:?}", s))),
        }
    }
}

fn is_class_name_char(c: char) -> bool {
    !matches!(c, ';' | '.' | '[' | '(' | ')' | '<' | '>')
}

fn parse_field_type(smali: &str) -> IResult<&str, TypeDescriptor> {
    alt((
        map(one_of("ZBCSIJFD"), TypeDescriptor::Primitive),
        map(delimited(char('L'), take_while1(is_class_name_char), char(';')), |name: &str| {
            TypeDescriptor::Object(name.to_string())
        }),
        map(preceded(char('['), parse_field_type), |t| TypeDescriptor::Array(Box::new(t))),
    ))
    .parse(smali)
}

/// Any type a type_id can name: a field type or `V`.
pub(crate) fn parse_type_descriptor(smali: &str) -> IResult<&str, TypeDescriptor> {
    alt((map(char('V'), TypeDescriptor::Primitive), parse_field_type)).parse(smali)
}

pub(crate) fn parse_method_descriptor(smali: &str) -> IResult<&str, MethodDescriptor> {
    let (o, params) = delimited(tag("("), many0(parse_field_type), tag(")")).parse(smali)?;
    let (o, result) = parse_type_descriptor(o)?;
    Ok((o, MethodDescriptor { params, result }))
}

/// Splits a type list as written in smali (`ILjava/lang/String;[J`) into descriptors.
pub fn split_type_list(s: &str) -> Result<Vec<TypeDescriptor>, DexError> {
    match all_consuming(many0(terminated(parse_field_type, many0(char(' '))))).parse(s) {
        Ok((_, v)) => Ok(v),
        Err(_) => Err(DexError::new(&format!("Invalid type list {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_parse_and_print() {
        for s in ["I", "V", "Ljava/lang/Object;", "[[J", "[Lcom/x/A$B;"] {
            let t: TypeDescriptor = s.parse().unwrap();
            assert_eq!(t.to_jni(), s);
        }
        assert_eq!("[I".parse::<TypeDescriptor>().unwrap().to_java(), "int[]");
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        for s in ["", "X", "L;", "Ljava/lang/Object", "[V", "II", "Ljava.lang.Object;"] {
            assert!(s.parse::<TypeDescriptor>().is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn method_descriptor_shorty() {
        let m: MethodDescriptor = "(I[Ljava/lang/String;J)Ljava/lang/Object;".parse().unwrap();
        assert_eq!(m.params.len(), 3);
        assert_eq!(m.shorty(), "LILJ");
        assert_eq!(m.to_jni(), "(I[Ljava/lang/String;J)Ljava/lang/Object;");
        assert!("(V)V".parse::<MethodDescriptor>().is_err());
    }

    #[test]
    fn type_lists_split() {
        let v = split_type_list("ILjava/lang/String;[J").unwrap();
        assert_eq!(v, vec![
            TypeDescriptor::Primitive('I'),
            TypeDescriptor::Object("java/lang/String".to_string()),
            TypeDescriptor::Array(Box::new(TypeDescriptor::Primitive('J'))),
        ]);
        assert!(split_type_list("").unwrap().is_empty());
    }
}
