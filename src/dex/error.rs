use std::fmt;

#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::dex::error::DexError::new($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::dex::error::DexError::new(&format!($fmtstr, $($args)*)))
    };
}

/// Broad classes of failure, so callers can tell misuse from bad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind
{
    /// The bytes being parsed do not form a valid structure.
    Malformed,
    /// Misuse of the object graph: resolving a detached record, clearing a required field,
    /// pointing a reference at the wrong kind of record.
    Binding,
    /// A stored index or offset has no live target where one is required.
    Consistency,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DexError
{
    kind: ErrorKind,
    msg: String,
    contexts: Vec<String>,
}

impl DexError
{
    pub(crate) fn new(msg: &str) -> Self
    {
        DexError {
            kind: ErrorKind::Malformed,
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    /// Misuse of a record field, named as `record.field`.
    pub(crate) fn binding(record: &str, field: &str, msg: &str) -> Self
    {
        DexError {
            kind: ErrorKind::Binding,
            msg: format!("{}.{}: {}", record, field, msg),
            contexts: Vec::new(),
        }
    }

    /// A reference that must resolve at write time does not.
    pub(crate) fn consistency(record: &str, field: &str, msg: &str) -> Self
    {
        DexError {
            kind: ErrorKind::Consistency,
            msg: format!("{}.{}: {}", record, field, msg),
            contexts: Vec::new(),
        }
    }

    pub(crate) fn with_context(base: DexError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        DexError { kind: base.kind, msg: base.msg, contexts }
    }

    pub fn kind(&self) -> ErrorKind
    {
        self.kind
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }
}

impl fmt::Display for DexError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for DexError {}

impl From<fmt::Error> for DexError
{
    fn from(_: fmt::Error) -> Self
    {
        DexError::new("text sink rejected output")
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn contexts_chain_in_display()
    {
        let e = DexError::new("Unexpected end of stream");
        let e = DexError::with_context(e, "class_def #3".to_string());
        let e = DexError::with_context(e, "classes.dex".to_string());
        assert_eq!(e.to_string(), "Unexpected end of stream for class_def #3 of classes.dex");
        assert_eq!(e.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn binding_names_record_and_field()
    {
        let e = DexError::binding("class_def", "class_type", "cannot be cleared");
        assert_eq!(e.kind(), ErrorKind::Binding);
        assert_eq!(e.message(), "class_def.class_type: cannot be cleared");
    }
}
