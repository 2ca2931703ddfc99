use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::mfile::MappedFile;

/// An immutable byte region with identity, either the user's input or a file
/// a decoder derived from it.
pub struct Artifact {
    path: PathBuf,
    map: MappedFile,
}

impl Artifact {
    pub fn open(path: &Path) -> Result<Self> {
        let map = MappedFile::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, lossy-decoded. Decoders that key on the source
    /// name (logo.pak, tzfw.pak, *.str, *PIF) match against this.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.map.bytes()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
