//! Host-side collaborators: file descriptors, file lists and file access.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// A file as described by the host's file list: where it is and when it
/// last changed. Content is read on demand through a [`FileSystem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFile {
    pub path: PathBuf,
    pub mtime: SystemTime,
}

impl TemplateFile {
    pub fn new(path: impl Into<PathBuf>, mtime: SystemTime) -> Self {
        Self { path: path.into(), mtime }
    }

    /// File name without directories, used for suffix matching.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// True if the file name ends with `.<suffix>` (or is exactly `suffix`).
    pub fn has_suffix(&self, suffix: &str) -> bool {
        let name = self.file_name();
        name == suffix
            || name
                .strip_suffix(suffix)
                .map_or(false, |rest| rest.ends_with('.'))
    }

    pub fn identity(&self) -> Identity {
        // Out-of-range mtimes have no millisecond value; fall back to the
        // path so the identity is at least stable.
        Identity::from_mtime(self.mtime)
            .unwrap_or_else(|| Identity::from_content(self.path.to_string_lossy().as_bytes()))
    }
}

/// Ordered list of files handed to a build. Order is preserved as given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileList {
    files: Vec<TemplateFile>,
}

impl FileList {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn from_files(files: Vec<TemplateFile>) -> Self {
        Self { files }
    }

    /// Recursively collect every regular file under `dir`, sorted by path.
    ///
    /// A missing directory yields an empty list.
    pub fn load_from_dir(dir: &Path) -> io::Result<Self> {
        let mut files = Vec::new();
        if dir.exists() {
            collect_dir(dir, &mut files)?;
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { files })
    }

    /// The same list with `root` stripped from every path that starts with it.
    pub fn relative_to(&self, root: &Path) -> Self {
        let files = self
            .files
            .iter()
            .map(|f| match f.path.strip_prefix(root) {
                Ok(rel) => TemplateFile::new(rel, f.mtime),
                Err(_) => f.clone(),
            })
            .collect();
        Self { files }
    }

    pub fn push(&mut self, file: TemplateFile) {
        self.files.push(file);
    }

    pub fn files(&self) -> &[TemplateFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn collect_dir(dir: &Path, out: &mut Vec<TemplateFile>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_dir(&path, out)?;
        } else if meta.is_file() {
            let mtime = meta.modified()?;
            out.push(TemplateFile { path, mtime });
        }
    }
    Ok(())
}

/// File access used by the build. Implementations must be shareable across
/// threads since template reads run in parallel.
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }
}
