//! Compiled (binary) Android XML, as found in `AndroidManifest.xml` and `res/layout/*.xml`.
//!
//! Only the string pool and the namespace chunks are modelled. Every other chunk is kept as
//! raw bytes, so an unmodified document writes back byte for byte. Start and end namespace
//! chunks are paired by nesting; a pair always carries the same prefix and uri.

use log::{debug, warn};
use std::fmt;

use crate::dex::reference::IndirectField;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;
const MAX_UTF8_LENGTH: usize = 0x7FFF;
const MAX_UTF16_LENGTH: usize = 0x7FFF_FFFF;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML helpers.
#[derive(Debug, PartialEq, Eq)]
pub enum BinaryXmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// Misuse of the document: unknown declaration, string not in the pool.
    Binding(String),
}

impl fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed binary XML: {msg}"),
            BinaryXmlError::Binding(msg) => write!(f, "Binding error: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

fn malformed(msg: &str) -> BinaryXmlError {
    BinaryXmlError::MalformedDocument(msg.to_string())
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u16(&mut self) -> BinaryXmlResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(malformed("Unexpected end of binary XML"));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> BinaryXmlResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(malformed("Unexpected end of binary XML"));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return Err(malformed("Attempted to seek past end of document"));
        }
        self.pos = offset;
        Ok(())
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> BinaryXmlResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(malformed("Truncated binary XML chunk header"));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 || header_size < 8 {
        return Err(malformed("Invalid chunk sizing in binary XML"));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| malformed("Chunk size overflow"))?;
    if end > reader.data.len() {
        return Err(malformed("Chunk extends past end of document"));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

/// The document's string pool. Appending keeps every existing index valid.
#[derive(Clone, Debug)]
pub struct XmlStringPool {
    strings: Vec<String>,
    utf8: bool,
    styled: bool,
    /// The chunk as parsed, written back verbatim until the pool changes.
    original: Option<Vec<u8>>,
}

impl XmlStringPool {
    /// A fresh pool, encoded on write.
    pub fn new(strings: Vec<String>, utf8: bool) -> Self {
        XmlStringPool { strings, utf8, styled: false, original: None }
    }

    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> BinaryXmlResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let _styles_start = reader.read_u32()?;

        let utf8 = (flags & STRING_FLAG_UTF8) != 0;
        reader.seek(header.start + header.header_size as usize)?;

        let mut string_offsets = Vec::with_capacity(string_count.min(reader.remaining() / 4));
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }

        let strings_base = header.start + strings_start;
        let chunk_end = header.end();
        let mut strings = Vec::with_capacity(string_offsets.len());
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }
        reader.seek(chunk_end)?;

        Ok(XmlStringPool {
            strings,
            utf8,
            styled: style_count != 0,
            original: Some(reader.data[header.start..chunk_end].to_vec()),
        })
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn is_utf8(&self) -> bool {
        self.utf8
    }

    pub fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|i| i as u32)
    }

    /// Index of `value`, appending it when absent.
    pub fn intern(&mut self, value: &str) -> BinaryXmlResult<u32> {
        if let Some(idx) = self.index_of(value) {
            return Ok(idx);
        }
        self.check_encodable(value)?;
        if self.styled {
            return Err(BinaryXmlError::Binding(format!(
                "cannot add {value:?}: the string pool carries style spans that would not be re-encoded"
            )));
        }
        debug!("appending {:?} to the string pool at {}", value, self.strings.len());
        self.strings.push(value.to_string());
        self.original = None;
        Ok(self.strings.len() as u32 - 1)
    }

    /// UTF-8 pools store both lengths in at most 15 bits, UTF-16 pools in 31.
    fn check_encodable(&self, value: &str) -> BinaryXmlResult<()> {
        let units = value.encode_utf16().count();
        let fits = if self.utf8 {
            units <= MAX_UTF8_LENGTH && value.len() <= MAX_UTF8_LENGTH
        } else {
            units <= MAX_UTF16_LENGTH
        };
        if fits {
            Ok(())
        } else {
            Err(BinaryXmlError::Binding(format!(
                "string_pool.string: {} bytes are too long for a {} pool",
                value.len(),
                if self.utf8 { "UTF-8" } else { "UTF-16" }
            )))
        }
    }

    fn to_chunk(&self) -> BinaryXmlResult<Vec<u8>> {
        if let Some(original) = &self.original {
            return Ok(original.clone());
        }
        let string_count = self.strings.len() as u32;
        let header_size = 28u16;
        let strings_start = header_size as u32 + string_count * 4;
        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            self.check_encodable(s)?;
            offsets.push(string_data.len() as u32);
            if self.utf8 {
                write_utf8_string(&mut string_data, s);
            } else {
                write_utf16_string(&mut string_data, s);
            }
        }
        align_to_four(&mut string_data);

        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_STRING_POOL_TYPE, header_size);
        write_u32(&mut chunk, string_count);
        write_u32(&mut chunk, 0); // style count
        write_u32(&mut chunk, if self.utf8 { STRING_FLAG_UTF8 } else { 0 });
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, 0); // stylesStart
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&string_data);
        finalize_chunk(&mut chunk, start);
        Ok(chunk)
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(malformed("String offset exceeds chunk bounds"));
    }
    // UTF-16 length first, then the byte length
    let (_, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len >= limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    let text = std::str::from_utf8(&data[cursor..cursor + byte_len])
        .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))?;
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len + 2 > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let units: Vec<u16> = data[cursor..cursor + byte_len]
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    cursor += byte_len;
    if data[cursor] != 0 || data[cursor + 1] != 0 {
        return Err(malformed("UTF-16 string missing terminator"));
    }
    String::from_utf16(&units).map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("Invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(malformed("Truncated UTF-8 length"));
        }
        let second = data[offset + 1];
        Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> BinaryXmlResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("Invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(malformed("Truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
        buf.push((len & 0xFF) as u8);
    }
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    write_utf8_length(buf, text.encode_utf16().count());
    write_utf8_length(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

/// Whether a namespace chunk opens or closes its scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceKind {
    Start,
    End,
}

impl NamespaceKind {
    fn chunk_type(self) -> u16 {
        match self {
            NamespaceKind::Start => RES_XML_START_NAMESPACE_TYPE,
            NamespaceKind::End => RES_XML_END_NAMESPACE_TYPE,
        }
    }
}

// ResXMLTree_node followed by ResXMLTree_namespaceExt
const CHUNK_TYPE: IndirectField<u16> = IndirectField::new(0);
const LINE_NUMBER: IndirectField<u32> = IndirectField::new(8);
const COMMENT: IndirectField<u32> = IndirectField::new(12);
const PREFIX: IndirectField<u32> = IndirectField::new(16);
const URI: IndirectField<u32> = IndirectField::new(20);

const NAMESPACE_HEADER_SIZE: u16 = 0x10;
const NAMESPACE_CHUNK_SIZE: u32 = 0x18;

/// One start or end namespace chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceDecl {
    bytes: [u8; 24],
    twin: Option<NsKey>,
}

impl NamespaceDecl {
    pub fn new(kind: NamespaceKind, prefix: Option<u32>, uri: u32, line_number: u32) -> Self {
        let mut bytes = [0u8; 24];
        CHUNK_TYPE.set(&mut bytes, kind.chunk_type());
        IndirectField::<u16>::new(2).set(&mut bytes, NAMESPACE_HEADER_SIZE);
        IndirectField::<u32>::new(4).set(&mut bytes, NAMESPACE_CHUNK_SIZE);
        LINE_NUMBER.set(&mut bytes, line_number);
        COMMENT.set(&mut bytes, NO_ENTRY_INDEX);
        PREFIX.set(&mut bytes, prefix.unwrap_or(NO_ENTRY_INDEX));
        URI.set(&mut bytes, uri);
        NamespaceDecl { bytes, twin: None }
    }

    fn from_chunk(chunk: &[u8]) -> BinaryXmlResult<Self> {
        let bytes: [u8; 24] = chunk
            .try_into()
            .map_err(|_| malformed("Namespace chunk must be 24 bytes"))?;
        Ok(NamespaceDecl { bytes, twin: None })
    }

    pub fn kind(&self) -> NamespaceKind {
        match CHUNK_TYPE.get(&self.bytes) {
            RES_XML_START_NAMESPACE_TYPE => NamespaceKind::Start,
            _ => NamespaceKind::End,
        }
    }

    pub fn line_number(&self) -> u32 {
        LINE_NUMBER.get(&self.bytes)
    }

    pub fn comment_ref(&self) -> Option<u32> {
        optional(COMMENT.get(&self.bytes))
    }

    pub fn prefix_ref(&self) -> Option<u32> {
        optional(PREFIX.get(&self.bytes))
    }

    pub fn uri_ref(&self) -> Option<u32> {
        optional(URI.get(&self.bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn optional(idx: u32) -> Option<u32> {
    if idx == NO_ENTRY_INDEX {
        None
    } else {
        Some(idx)
    }
}

/// Stable handle of a declaration in a [`NamespaceTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NsKey(u32);

/// Arena of namespace declarations. Twins point at each other by key.
#[derive(Clone, Debug, Default)]
pub struct NamespaceTable {
    decls: Vec<NamespaceDecl>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn push(&mut self, decl: NamespaceDecl) -> NsKey {
        self.decls.push(decl);
        NsKey(self.decls.len() as u32 - 1)
    }

    pub fn get(&self, key: NsKey) -> Option<&NamespaceDecl> {
        self.decls.get(key.0 as usize)
    }

    fn decl(&self, key: NsKey) -> BinaryXmlResult<&NamespaceDecl> {
        self.get(key)
            .ok_or_else(|| BinaryXmlError::Binding(format!("namespace.twin: unknown declaration {}", key.0)))
    }

    fn decl_mut(&mut self, key: NsKey) -> BinaryXmlResult<&mut NamespaceDecl> {
        self.decls
            .get_mut(key.0 as usize)
            .ok_or_else(|| BinaryXmlError::Binding(format!("namespace: unknown declaration {}", key.0)))
    }

    /// The declaration mirrored with `key`, if any.
    pub fn pair(&self, key: NsKey) -> Option<NsKey> {
        self.get(key).and_then(|d| d.twin)
    }

    /// Twins two declarations as found while parsing, without touching their values.
    fn link(&mut self, a: NsKey, b: NsKey) -> BinaryXmlResult<()> {
        let (da, db) = (self.decl(a)?, self.decl(b)?);
        if da.prefix_ref() != db.prefix_ref() || da.uri_ref() != db.uri_ref() {
            warn!("namespace pair {}/{} disagrees on prefix or uri", a.0, b.0);
        }
        self.decl_mut(a)?.twin = Some(b);
        self.decl_mut(b)?.twin = Some(a);
        Ok(())
    }

    /// Makes `a` and `b` each other's twin. Both must already carry the same prefix and uri;
    /// declarations that disagree are refused and left as they were. Previous partners of
    /// either side are detached. `None` detaches `a` and its partner. Twinning a declaration
    /// with itself changes nothing.
    pub fn set_twin(&mut self, a: NsKey, b: Option<NsKey>) -> BinaryXmlResult<()> {
        self.decl(a)?;
        let Some(b) = b else {
            if let Some(old) = self.pair(a) {
                self.decl_mut(old)?.twin = None;
            }
            self.decl_mut(a)?.twin = None;
            return Ok(());
        };
        if a == b {
            return Ok(());
        }
        let (da, db) = (self.decl(a)?, self.decl(b)?);
        if self.pair(a) == Some(b) && self.pair(b) == Some(a) {
            return Ok(());
        }
        if da.prefix_ref() != db.prefix_ref() || da.uri_ref() != db.uri_ref() {
            return Err(BinaryXmlError::Binding(format!(
                "namespace.twin: declarations {} and {} disagree on prefix or uri",
                a.0, b.0
            )));
        }
        for key in [a, b] {
            if let Some(old) = self.pair(key) {
                debug!("detaching namespace {} from {}", old.0, key.0);
                self.decl_mut(old)?.twin = None;
            }
        }
        self.decl_mut(a)?.twin = Some(b);
        self.decl_mut(b)?.twin = Some(a);
        Ok(())
    }

    /// Writes the uri string index, then the twin's when it differs.
    pub fn set_uri_ref(&mut self, key: NsKey, uri: u32, pool: &XmlStringPool) -> BinaryXmlResult<()> {
        if pool.get(uri).is_none() {
            return Err(BinaryXmlError::Binding(format!("namespace.uri: string {uri} is not in the string pool")));
        }
        self.write_field(key, URI, uri)
    }

    /// Writes the prefix string index, `None` for the default namespace, then the twin's.
    pub fn set_prefix_ref(&mut self, key: NsKey, prefix: Option<u32>, pool: &XmlStringPool) -> BinaryXmlResult<()> {
        if let Some(idx) = prefix {
            if pool.get(idx).is_none() {
                return Err(BinaryXmlError::Binding(format!(
                    "namespace.prefix: string {idx} is not in the string pool"
                )));
            }
        }
        self.write_field(key, PREFIX, prefix.unwrap_or(NO_ENTRY_INDEX))
    }

    fn write_field(&mut self, key: NsKey, field: IndirectField<u32>, value: u32) -> BinaryXmlResult<()> {
        field.set(&mut self.decl_mut(key)?.bytes, value);
        if let Some(twin) = self.pair(key) {
            let decl = self.decl_mut(twin)?;
            if field.get(&decl.bytes) != value {
                field.set(&mut decl.bytes, value);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum XmlNode {
    StringPool,
    Namespace(NsKey),
    Chunk { chunk_type: u16, bytes: Vec<u8> },
}

/// `xmlns:prefix="uri"` text of one declaration.
pub struct NamespaceText<'a> {
    prefix: Option<&'a str>,
    uri: Option<&'a str>,
}

impl fmt::Display for NamespaceText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "xmlns:{}=\"{}\"", prefix, self.uri.unwrap_or("")),
            None => write!(f, "xmlns=\"{}\"", self.uri.unwrap_or("")),
        }
    }
}

/// A parsed binary XML document.
#[derive(Clone, Debug)]
pub struct XmlDocument {
    pool: XmlStringPool,
    namespaces: NamespaceTable,
    nodes: Vec<XmlNode>,
}

impl XmlDocument {
    pub fn from_bytes(data: &[u8]) -> BinaryXmlResult<Self> {
        let mut reader = BinaryReader::new(data);
        let root = read_chunk_header(&mut reader)?;
        if root.chunk_type != RES_XML_TYPE {
            return Err(malformed("Not a binary XML document"));
        }
        reader.seek(root.start + root.header_size as usize)?;

        let mut pool = None;
        let mut namespaces = NamespaceTable::new();
        let mut nodes = Vec::new();
        let mut open: Vec<NsKey> = Vec::new();
        while reader.position() < root.end() {
            let header = read_chunk_header(&mut reader)?;
            match header.chunk_type {
                RES_STRING_POOL_TYPE if pool.is_none() => {
                    pool = Some(XmlStringPool::parse(&mut reader, &header)?);
                    nodes.push(XmlNode::StringPool);
                }
                RES_XML_START_NAMESPACE_TYPE | RES_XML_END_NAMESPACE_TYPE => {
                    if header.chunk_size != NAMESPACE_CHUNK_SIZE {
                        return Err(malformed("Namespace chunk must be 24 bytes"));
                    }
                    let decl = NamespaceDecl::from_chunk(&data[header.start..header.end()])?;
                    let key = namespaces.push(decl);
                    if header.chunk_type == RES_XML_START_NAMESPACE_TYPE {
                        open.push(key);
                    } else {
                        match open.pop() {
                            Some(start) => namespaces.link(start, key)?,
                            None => warn!("end namespace chunk at 0x{:x} closes nothing", header.start),
                        }
                    }
                    nodes.push(XmlNode::Namespace(key));
                }
                chunk_type => nodes.push(XmlNode::Chunk {
                    chunk_type,
                    bytes: data[header.start..header.end()].to_vec(),
                }),
            }
            reader.seek(header.end())?;
        }
        if !open.is_empty() {
            warn!("{} namespace declarations are never closed", open.len());
        }
        let pool = pool.ok_or_else(|| malformed("Binary XML has no string pool"))?;
        debug!("parsed binary XML: {} strings, {} namespace chunks", pool.len(), namespaces.len());
        Ok(XmlDocument { pool, namespaces, nodes })
    }

    pub fn to_bytes(&self) -> BinaryXmlResult<Vec<u8>> {
        let mut out = Vec::new();
        let start = begin_chunk(&mut out, RES_XML_TYPE, 8);
        for node in &self.nodes {
            match node {
                XmlNode::StringPool => out.extend_from_slice(&self.pool.to_chunk()?),
                XmlNode::Namespace(key) => {
                    if let Some(decl) = self.namespaces.get(*key) {
                        out.extend_from_slice(decl.bytes());
                    }
                }
                XmlNode::Chunk { bytes, .. } => out.extend_from_slice(bytes),
            }
        }
        finalize_chunk(&mut out, start);
        Ok(out)
    }

    pub fn string_pool(&self) -> &XmlStringPool {
        &self.pool
    }

    pub fn namespace_table(&self) -> &NamespaceTable {
        &self.namespaces
    }

    /// Namespace declarations in document order.
    pub fn namespaces(&self) -> Vec<NsKey> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                XmlNode::Namespace(key) => Some(*key),
                _ => None,
            })
            .collect()
    }

    pub fn uri(&self, key: NsKey) -> Option<&str> {
        self.namespaces.get(key)?.uri_ref().and_then(|idx| self.pool.get(idx))
    }

    pub fn prefix(&self, key: NsKey) -> Option<&str> {
        self.namespaces.get(key)?.prefix_ref().and_then(|idx| self.pool.get(idx))
    }

    pub fn namespace_text(&self, key: NsKey) -> Option<NamespaceText<'_>> {
        self.namespaces.get(key)?;
        Some(NamespaceText { prefix: self.prefix(key), uri: self.uri(key) })
    }

    pub fn intern(&mut self, value: &str) -> BinaryXmlResult<u32> {
        self.pool.intern(value)
    }

    fn pooled(&self, field: &str, value: &str) -> BinaryXmlResult<u32> {
        self.pool.index_of(value).ok_or_else(|| {
            BinaryXmlError::Binding(format!("namespace.{field}: {value:?} is not in the string pool; intern it first"))
        })
    }

    /// Points a declaration and its twin at `uri`, which must already be pooled.
    pub fn set_uri(&mut self, key: NsKey, uri: &str) -> BinaryXmlResult<()> {
        let idx = self.pooled("uri", uri)?;
        self.namespaces.set_uri_ref(key, idx, &self.pool)
    }

    pub fn set_prefix(&mut self, key: NsKey, prefix: Option<&str>) -> BinaryXmlResult<()> {
        let idx = prefix.map(|p| self.pooled("prefix", p)).transpose()?;
        self.namespaces.set_prefix_ref(key, idx, &self.pool)
    }

    pub fn set_twin(&mut self, a: NsKey, b: Option<NsKey>) -> BinaryXmlResult<()> {
        self.namespaces.set_twin(a, b)
    }

    /// Adds a twinned start/end pair around the root element, interning both strings.
    pub fn declare_namespace(&mut self, prefix: &str, uri: &str) -> BinaryXmlResult<(NsKey, NsKey)> {
        let first_start = self.nodes.iter().position(|n| is_chunk(n, RES_XML_START_ELEMENT_TYPE));
        let last_end = self.nodes.iter().rposition(|n| is_chunk(n, RES_XML_END_ELEMENT_TYPE));
        let (Some(first_start), Some(last_end)) = (first_start, last_end) else {
            return Err(BinaryXmlError::Binding("namespace: the document has no root element".to_string()));
        };
        let line_number = match &self.nodes[first_start] {
            XmlNode::Chunk { bytes, .. } if bytes.len() >= 12 => LINE_NUMBER.get(bytes),
            _ => 0,
        };

        let prefix = self.pool.intern(prefix)?;
        let uri = self.pool.intern(uri)?;
        let start = self.namespaces.push(NamespaceDecl::new(NamespaceKind::Start, Some(prefix), uri, line_number));
        let end = self.namespaces.push(NamespaceDecl::new(NamespaceKind::End, Some(prefix), uri, line_number));
        self.namespaces.set_twin(start, Some(end))?;

        self.nodes.insert(last_end + 1, XmlNode::Namespace(end));
        self.nodes.insert(first_start, XmlNode::Namespace(start));
        Ok((start, end))
    }
}

fn is_chunk(node: &XmlNode, wanted: u16) -> bool {
    matches!(node, XmlNode::Chunk { chunk_type, .. } if *chunk_type == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(strings: &[&str], utf8: bool) -> XmlStringPool {
        XmlStringPool::new(strings.iter().map(|s| s.to_string()).collect(), utf8)
    }

    fn element_start(name: u32, line: u32) -> Vec<u8> {
        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_XML_START_ELEMENT_TYPE, 0x10);
        write_u32(&mut chunk, line);
        write_u32(&mut chunk, NO_ENTRY_INDEX);
        write_u32(&mut chunk, NO_ENTRY_INDEX); // ns
        write_u32(&mut chunk, name);
        write_u16(&mut chunk, 0x14); // attributeStart
        write_u16(&mut chunk, 0x14); // attributeSize
        write_u16(&mut chunk, 0); // attributeCount
        write_u16(&mut chunk, 0);
        write_u16(&mut chunk, 0);
        write_u16(&mut chunk, 0);
        finalize_chunk(&mut chunk, start);
        chunk
    }

    fn element_end(name: u32, line: u32) -> Vec<u8> {
        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_XML_END_ELEMENT_TYPE, 0x10);
        write_u32(&mut chunk, line);
        write_u32(&mut chunk, NO_ENTRY_INDEX);
        write_u32(&mut chunk, NO_ENTRY_INDEX);
        write_u32(&mut chunk, name);
        finalize_chunk(&mut chunk, start);
        chunk
    }

    /// `<manifest xmlns:android="...">` with nothing inside.
    fn manifest(utf8: bool) -> Vec<u8> {
        let strings = pool(&["android", ANDROID_NAMESPACE_URI, "manifest"], utf8);
        let mut doc = Vec::new();
        let start = begin_chunk(&mut doc, RES_XML_TYPE, 8);
        doc.extend_from_slice(&strings.to_chunk().unwrap());
        doc.extend_from_slice(NamespaceDecl::new(NamespaceKind::Start, Some(0), 1, 1).bytes());
        doc.extend_from_slice(&element_start(2, 1));
        doc.extend_from_slice(&element_end(2, 1));
        doc.extend_from_slice(NamespaceDecl::new(NamespaceKind::End, Some(0), 1, 1).bytes());
        finalize_chunk(&mut doc, start);
        doc
    }

    #[test]
    fn unmodified_document_round_trips() {
        for utf8 in [false, true] {
            let bytes = manifest(utf8);
            let doc = XmlDocument::from_bytes(&bytes).unwrap();
            assert_eq!(doc.string_pool().is_utf8(), utf8);
            assert_eq!(doc.string_pool().get(2), Some("manifest"));
            assert_eq!(doc.to_bytes().unwrap(), bytes);
        }
    }

    #[test]
    fn namespace_chunks_pair_by_nesting() {
        let doc = XmlDocument::from_bytes(&manifest(false)).unwrap();
        let keys = doc.namespaces();
        assert_eq!(keys.len(), 2);
        assert_eq!(doc.namespace_table().pair(keys[0]), Some(keys[1]));
        assert_eq!(doc.namespace_table().pair(keys[1]), Some(keys[0]));
        assert_eq!(doc.namespace_table().get(keys[1]).unwrap().kind(), NamespaceKind::End);
        assert_eq!(
            doc.namespace_text(keys[0]).unwrap().to_string(),
            format!("xmlns:android=\"{ANDROID_NAMESPACE_URI}\"")
        );
    }

    #[test]
    fn uri_edits_reach_the_twin() {
        let mut doc = XmlDocument::from_bytes(&manifest(false)).unwrap();
        let keys = doc.namespaces();
        let err = doc.set_uri(keys[0], "http://example.com/a").unwrap_err();
        assert!(matches!(err, BinaryXmlError::Binding(_)));

        doc.intern("http://example.com/a").unwrap();
        doc.set_uri(keys[0], "http://example.com/a").unwrap();
        assert_eq!(doc.uri(keys[1]), Some("http://example.com/a"));

        let reread = XmlDocument::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        let keys = reread.namespaces();
        assert_eq!(reread.uri(keys[0]), Some("http://example.com/a"));
        assert_eq!(reread.uri(keys[1]), Some("http://example.com/a"));
        assert_eq!(reread.string_pool().get(2), Some("manifest"));
    }

    #[test]
    fn declared_namespace_wraps_the_root() {
        let mut doc = XmlDocument::from_bytes(&manifest(true)).unwrap();
        let (start, end) = doc.declare_namespace("tools", "http://schemas.android.com/tools").unwrap();
        assert_eq!(doc.namespace_table().pair(start), Some(end));
        assert_eq!(doc.prefix(end), Some("tools"));

        let reread = XmlDocument::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        let keys = reread.namespaces();
        assert_eq!(keys.len(), 4);
        // android start, tools start, tools end, android end
        assert_eq!(reread.prefix(keys[1]), Some("tools"));
        assert_eq!(reread.namespace_table().pair(keys[1]), Some(keys[2]));
        assert_eq!(reread.namespace_table().pair(keys[0]), Some(keys[3]));
    }

    #[test]
    fn twinning_rules() {
        let strings = pool(&["a", "b", "uri:a", "uri:b"], false);
        let mut table = NamespaceTable::new();
        let a = table.push(NamespaceDecl::new(NamespaceKind::Start, Some(0), 2, 1));
        let b = table.push(NamespaceDecl::new(NamespaceKind::End, Some(0), 2, 1));
        let c = table.push(NamespaceDecl::new(NamespaceKind::End, Some(1), 3, 1));

        table.set_twin(a, Some(a)).unwrap();
        assert_eq!(table.pair(a), None);

        table.set_twin(a, Some(b)).unwrap();
        assert_eq!(table.pair(b), Some(a));
        table.set_twin(b, Some(a)).unwrap();
        assert_eq!(table.pair(a), Some(b));

        table.set_uri_ref(a, 3, &strings).unwrap();
        assert_eq!(table.get(b).unwrap().uri_ref(), Some(3));
        table.set_prefix_ref(b, Some(1), &strings).unwrap();
        assert_eq!(table.get(a).unwrap().prefix_ref(), Some(1));
        assert!(table.set_uri_ref(a, 9, &strings).is_err());

        // a now matches c, so the twin can move
        table.set_twin(c, Some(a)).unwrap();
        assert_eq!(table.pair(a), Some(c));
        assert_eq!(table.pair(b), None);

        table.set_twin(a, None).unwrap();
        assert_eq!(table.pair(a), None);
        assert_eq!(table.pair(c), None);
    }

    #[test]
    fn twinning_mismatched_declarations_is_refused() {
        let mut table = NamespaceTable::new();
        let a = table.push(NamespaceDecl::new(NamespaceKind::Start, Some(0), 2, 1));
        let b = table.push(NamespaceDecl::new(NamespaceKind::End, Some(0), 2, 1));
        let other = table.push(NamespaceDecl::new(NamespaceKind::End, Some(1), 3, 1));
        table.set_twin(a, Some(b)).unwrap();

        let err = table.set_twin(a, Some(other)).unwrap_err();
        assert!(matches!(err, BinaryXmlError::Binding(ref msg) if msg.starts_with("namespace.twin:")));
        assert_eq!(table.pair(a), Some(b));
        assert_eq!(table.pair(other), None);
        assert_eq!(table.get(other).unwrap().uri_ref(), Some(3));
    }

    #[test]
    fn overlong_strings_are_refused_by_utf8_pools() {
        let long = "x".repeat(MAX_UTF8_LENGTH + 1);
        let mut utf8 = pool(&["a"], true);
        assert!(matches!(utf8.intern(&long), Err(BinaryXmlError::Binding(_))));
        assert_eq!(utf8.len(), 1);
        assert!(pool(&[long.as_str()], true).to_chunk().is_err());

        let mut utf16 = pool(&["a"], false);
        assert_eq!(utf16.intern(&long).unwrap(), 1);
        let chunk = utf16.to_chunk().unwrap();
        let mut reader = BinaryReader::new(&chunk);
        let header = read_chunk_header(&mut reader).unwrap();
        let reread = XmlStringPool::parse(&mut reader, &header).unwrap();
        assert_eq!(reread.get(1).map(str::len), Some(MAX_UTF8_LENGTH + 1));
    }

    #[test]
    fn truncated_documents_are_rejected() {
        let bytes = manifest(false);
        assert!(matches!(
            XmlDocument::from_bytes(&bytes[..bytes.len() - 4]),
            Err(BinaryXmlError::MalformedDocument(_))
        ));
        assert!(XmlDocument::from_bytes(&[0x03, 0x00]).is_err());
    }
}
