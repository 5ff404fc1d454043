use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Source text handed to the builder.
///
/// Consumed exactly once. Any file or stream it wraps is closed when the
/// value is dropped, which happens before `build` returns on every path.
pub enum SourceInput {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

impl SourceInput {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::Bytes(text.into().into_bytes())
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Stream(Box::new(reader))
    }

    /// The file this input came from, if any
    pub fn origin(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Read the whole input, releasing the underlying handle
    pub(crate) fn read_all(self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Path(path) => {
                let mut file = File::open(path)?;
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
            Self::Stream(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
        }
    }
}

impl fmt::Debug for SourceInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<PathBuf> for SourceInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for SourceInput {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}

impl From<Vec<u8>> for SourceInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for SourceInput {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct TrackedReader {
        inner: Cursor<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl Read for TrackedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Drop for TrackedReader {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stream_is_released_after_read() {
        let closed = Arc::new(AtomicBool::new(false));
        let source = SourceInput::from_reader(TrackedReader {
            inner: Cursor::new(b"class A {}".to_vec()),
            closed: closed.clone(),
        });

        let bytes = source.read_all().unwrap();
        assert_eq!(bytes, b"class A {}");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_from_path() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("Script.dyn");
        std::fs::write(&path, "class Script {}").unwrap();

        let source = SourceInput::from_path(&path);
        assert_eq!(source.origin(), Some(path.as_path()));
        assert_eq!(source.read_all().unwrap(), b"class Script {}");
    }

    #[test]
    fn test_missing_path_is_io_error() {
        let temp_dir = tempdir().unwrap();
        let source = SourceInput::from_path(temp_dir.path().join("missing.dyn"));
        assert!(source.read_all().is_err());
    }
}
