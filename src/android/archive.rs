use crc32fast::Hasher as Crc32;
use std::io::{self, Write};

/// Compression preference for an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ApkCompression {
    #[default]
    Stored,
    Deflated,
}

/// Something an archive writer can copy into an entry: a name plus content.
///
/// Physical ZIP reading and writing live outside this crate; this is the surface such a
/// writer consumes.
pub trait InputSource {
    /// Entry name inside the archive, `/` separated.
    fn name(&self) -> &str;

    fn compression(&self) -> ApkCompression;

    /// Uncompressed length in bytes.
    fn length(&self) -> u64;

    /// CRC-32 of the uncompressed content.
    fn crc(&self) -> u32;

    fn read_bytes(&self) -> io::Result<Vec<u8>>;

    /// Copies the uncompressed content into `out`, returning the number of bytes written.
    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64>;
}

/// A single file entry held in memory.
#[derive(Clone, Debug)]
pub struct ApkEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub unix_mode: Option<u32>,
    pub compression: Option<ApkCompression>,
}

impl ApkEntry {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        ApkEntry {
            name: name.into(),
            data,
            unix_mode: None,
            compression: None,
        }
    }

    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.unix_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Option<ApkCompression>) -> Self {
        self.compression = compression;
        self
    }
}

impl InputSource for ApkEntry {
    fn name(&self) -> &str {
        &self.name
    }

    /// Entries without an explicit preference follow the usual APK rule: `resources.arsc`
    /// and already-compressed media are stored, everything else is deflated.
    fn compression(&self) -> ApkCompression {
        self.compression.unwrap_or_else(|| {
            if should_store_uncompressed(&self.name) {
                ApkCompression::Stored
            } else {
                ApkCompression::Deflated
            }
        })
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn crc(&self) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&self.data);
        crc.finalize()
    }

    fn read_bytes(&self) -> io::Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        out.write_all(&self.data)?;
        Ok(self.data.len() as u64)
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower == "resources.arsc" {
        return true;
    }
    const STORED_EXTENSIONS: &[&str] = &[
        ".png", ".jpg", ".jpeg", ".gif", ".webp", ".mp3", ".ogg", ".wav", ".mp4", ".zip", ".jar",
        ".apk",
    ];
    STORED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Presents a source under another name. Every other call goes to the wrapped source
/// unchanged, errors included.
#[derive(Clone, Debug)]
pub struct RenamedInputSource<T> {
    inner: T,
    name: String,
}

impl<T: InputSource> RenamedInputSource<T> {
    pub fn new(inner: T, name: impl Into<String>) -> Self {
        RenamedInputSource { inner, name: name.into() }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: InputSource> InputSource for RenamedInputSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn compression(&self) -> ApkCompression {
        self.inner.compression()
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn crc(&self) -> u32 {
        self.inner.crc()
    }

    fn read_bytes(&self) -> io::Result<Vec<u8>> {
        self.inner.read_bytes()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        self.inner.write_to(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    impl InputSource for FailingSource {
        fn name(&self) -> &str {
            "broken.bin"
        }

        fn compression(&self) -> ApkCompression {
            ApkCompression::Stored
        }

        fn length(&self) -> u64 {
            7
        }

        fn crc(&self) -> u32 {
            0
        }

        fn read_bytes(&self) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"))
        }

        fn write_to(&self, _out: &mut dyn Write) -> io::Result<u64> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"))
        }
    }

    #[test]
    fn crc_matches_known_value() {
        let entry = ApkEntry::new("a.txt", b"123456789".to_vec());
        assert_eq!(entry.crc(), 0xCBF4_3926);
        assert_eq!(entry.length(), 9);
    }

    #[test]
    fn default_compression_follows_name() {
        assert_eq!(ApkEntry::new("resources.arsc", vec![]).compression(), ApkCompression::Stored);
        assert_eq!(ApkEntry::new("res/icon.PNG", vec![]).compression(), ApkCompression::Stored);
        assert_eq!(ApkEntry::new("classes.dex", vec![]).compression(), ApkCompression::Deflated);
        let forced = ApkEntry::new("classes.dex", vec![]).with_compression(Some(ApkCompression::Stored));
        assert_eq!(forced.compression(), ApkCompression::Stored);
    }

    #[test]
    fn rename_changes_only_the_name() {
        let entry = ApkEntry::new("classes.dex", vec![1, 2, 3]);
        let renamed = RenamedInputSource::new(entry.clone(), "classes2.dex");
        assert_eq!(renamed.name(), "classes2.dex");
        assert_eq!(renamed.inner().name(), "classes.dex");
        assert_eq!(renamed.length(), entry.length());
        assert_eq!(renamed.crc(), entry.crc());
        assert_eq!(renamed.compression(), entry.compression());
        assert_eq!(renamed.read_bytes().unwrap(), vec![1, 2, 3]);

        let mut out = Vec::new();
        assert_eq!(renamed.write_to(&mut out).unwrap(), 3);
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(renamed.into_inner().name, "classes.dex");
    }

    #[test]
    fn rename_passes_errors_through() {
        let renamed = RenamedInputSource::new(FailingSource, "other.bin");
        let err = renamed.read_bytes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(err.to_string(), "truncated entry");
        assert!(renamed.write_to(&mut Vec::new()).is_err());
    }
}
