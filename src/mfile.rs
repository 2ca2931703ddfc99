use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{ExtractError, Result};

/// Read-only memory-mapped view of a file.
///
/// All detectors and extractors operate on this view instead of streaming
/// reads. The mapping is released when the value is dropped, so every exit
/// path of an operation that opened one unmaps it.
#[derive(Debug)]
pub struct MappedFile {
    map: Option<Mmap>,
    len: u64,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ExtractError::resource(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| ExtractError::resource(path, e))?
            .len();

        // A zero-length file cannot be mapped; give it an empty view so a
        // derived empty artifact classifies as a leaf instead of failing.
        if len == 0 {
            return Ok(Self { map: None, len: 0 });
        }

        let map = unsafe { Mmap::map(&file) }.map_err(|e| ExtractError::resource(path, e))?;

        #[cfg(target_os = "linux")]
        {
            let _ = map.advise(memmap2::Advice::Sequential);
        }

        Ok(Self {
            map: Some(map),
            len,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bounded view starting at `offset`, clamped to the mapping length.
    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let data = self.bytes();
        let start = usize::try_from(offset).ok()?;
        if start >= data.len() {
            return None;
        }
        let end = start.saturating_add(len).min(data.len());
        Some(&data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn maps_and_slices() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"firmware image bytes").unwrap();
        f.flush().unwrap();

        let m = MappedFile::open(f.path()).unwrap();
        assert_eq!(m.len(), 20);
        assert_eq!(m.slice(0, 8).unwrap(), b"firmware");
        assert_eq!(m.slice(9, 5).unwrap(), b"image");
        assert!(m.slice(100, 4).is_none());
    }

    #[test]
    fn slice_clamps_at_eof() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"short").unwrap();
        f.flush().unwrap();

        let m = MappedFile::open(f.path()).unwrap();
        assert_eq!(m.slice(0, 100).unwrap().len(), 5);
    }

    #[test]
    fn empty_file_yields_empty_view() {
        let f = NamedTempFile::new().unwrap();
        let m = MappedFile::open(f.path()).unwrap();
        assert!(m.is_empty());
        assert_eq!(m.bytes(), b"");
    }

    #[test]
    fn missing_file_is_resource_error() {
        let err = MappedFile::open(Path::new("/nonexistent/fw.epk")).unwrap_err();
        assert!(matches!(err, ExtractError::Resource { .. }));
    }
}
