//! Core Resolver - picks the engine core a bundle is built on.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::files::FileSystem;
use crate::identity::Identity;
use crate::pipeline::BuildError;

/// Built-in engine core shipped with the crate.
pub const DEFAULT_CORE_SOURCE: &str = include_str!("../assets/bh.js");

/// Source name the built-in core is reported under in source maps.
pub const DEFAULT_CORE_NAME: &str = "bh.js";

/// Where the active core came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "path")]
pub enum CoreSource {
    /// The embedded [`DEFAULT_CORE_SOURCE`].
    Embedded,
    /// The default core installed on disk by the host.
    Installed(PathBuf),
    /// A user-supplied override (`bhFile`).
    Custom(PathBuf),
}

/// The engine core resolved for one build.
#[derive(Debug, Clone)]
pub struct EngineCore {
    pub source: CoreSource,
    pub content: String,
    pub identity: Identity,
}

impl EngineCore {
    pub fn is_default(&self) -> bool {
        !matches!(self.source, CoreSource::Custom(_))
    }

    /// Name used for this core in source maps.
    pub fn source_name(&self) -> String {
        match &self.source {
            CoreSource::Embedded => DEFAULT_CORE_NAME.to_string(),
            CoreSource::Installed(path) | CoreSource::Custom(path) => {
                path.to_string_lossy().into_owned()
            }
        }
    }
}

/// How the default core is located when no `bhFile` is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultCore {
    Embedded,
    /// Absolute, or relative to the build root.
    File(PathBuf),
}

pub struct CoreResolver {
    root: PathBuf,
    default_core: DefaultCore,
}

impl CoreResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_core: DefaultCore::Embedded,
        }
    }

    pub fn with_default_core(mut self, default_core: DefaultCore) -> Self {
        self.default_core = default_core;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the core for a build.
    ///
    /// A configured `bh_file` that cannot be read fails with
    /// [`BuildError::CoreNotFound`]; there is no fallback to the default core.
    pub fn resolve(
        &self,
        bh_file: Option<&Path>,
        fs: &dyn FileSystem,
    ) -> Result<EngineCore, BuildError> {
        match (bh_file, &self.default_core) {
            (Some(path), _) => {
                let (content, identity) = self.read_core(path, fs)?;
                debug!(path = %path.display(), %identity, "using custom core");
                Ok(EngineCore {
                    source: CoreSource::Custom(path.to_path_buf()),
                    content,
                    identity,
                })
            }
            (None, DefaultCore::File(path)) => {
                let (content, identity) = self.read_core(path, fs)?;
                Ok(EngineCore {
                    source: CoreSource::Installed(path.clone()),
                    content,
                    identity,
                })
            }
            (None, DefaultCore::Embedded) => Ok(EngineCore {
                source: CoreSource::Embedded,
                content: DEFAULT_CORE_SOURCE.to_string(),
                identity: Identity::from_content(DEFAULT_CORE_SOURCE.as_bytes()),
            }),
        }
    }

    fn read_core(&self, path: &Path, fs: &dyn FileSystem) -> Result<(String, Identity), BuildError> {
        let full = self.root.join(path);
        let not_found = |source: io::Error| BuildError::CoreNotFound {
            path: full.clone(),
            source,
        };

        let bytes = fs.read(&full).map_err(not_found)?;
        let content = String::from_utf8(bytes)
            .map_err(|e| not_found(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let identity = Identity::from_mtime_or_content(fs.modified(&full).ok(), content.as_bytes());
        Ok((content, identity))
    }
}
