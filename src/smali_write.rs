use crate::dex::error::DexError;
use crate::dex::ItemKey;

/// Smali text of the items a rendered class refers to.
pub trait ItemText
{
    /// Raw text of a string_data item.
    fn string_text(&self, key: ItemKey) -> Result<String, DexError>;

    /// Reference form of any item: `"quoted"` strings, type descriptors,
    /// `Lcls;->name:TYPE` fields, `Lcls;->name(PARAMS)RET` methods and `(PARAMS)RET` protos.
    fn item_text(&self, key: ItemKey) -> Result<String, DexError>;
}

/// Line-oriented text sink used to render classes.
pub struct SmaliWriter<'a>
{
    out: &'a mut String,
    indent: usize,
}

impl<'a> SmaliWriter<'a>
{
    pub fn new(out: &'a mut String) -> Self
    {
        SmaliWriter { out, indent: 0 }
    }

    /// Writes one indented line followed by a newline.
    pub fn line(&mut self, text: &str)
    {
        for _ in 0..self.indent
        {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    pub fn blank(&mut self)
    {
        self.out.push('\n');
    }

    pub fn comment(&mut self, text: &str)
    {
        self.line(&format!("# {}", text));
    }

    pub fn indent(&mut self)
    {
        self.indent += 1;
    }

    pub fn dedent(&mut self)
    {
        self.indent = self.indent.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn lines_are_indented_in_steps_of_four()
    {
        let mut out = String::new();
        let mut w = SmaliWriter::new(&mut out);
        w.line(".method public f()V");
        w.indent();
        w.comment("code at 0x10");
        w.dedent();
        w.dedent();
        w.line(".end method");
        w.blank();
        assert_eq!(out, ".method public f()V\n    # code at 0x10\n.end method\n\n");
    }
}
