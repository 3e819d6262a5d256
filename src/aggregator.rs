//! Template Aggregator - selects template sources from the host file list
//! and compiles each into a registration fragment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::compiler::{CompiledTemplate, TemplateCompiler};
use crate::files::{FileSystem, TemplateFile};
use crate::identity::Identity;
use crate::pipeline::BuildError;

/// Identities of the template set, keyed by the path the host reported.
pub type TemplateIdentities = BTreeMap<PathBuf, Identity>;

/// One template after compilation.
#[derive(Debug, Clone)]
pub struct AggregatedTemplate {
    pub path: PathBuf,
    pub source: String,
    pub compiled: CompiledTemplate,
    pub identity: Identity,
}

/// Keep the files whose names carry one of `suffixes`, in host order.
pub fn select_templates<'f>(files: &'f [TemplateFile], suffixes: &[String]) -> Vec<&'f TemplateFile> {
    files
        .iter()
        .filter(|f| suffixes.iter().any(|s| f.has_suffix(s)))
        .collect()
}

pub fn template_identities(templates: &[&TemplateFile]) -> TemplateIdentities {
    templates
        .iter()
        .map(|f| (f.path.clone(), f.identity()))
        .collect()
}

pub struct TemplateAggregator {
    root: PathBuf,
    compiler: Arc<dyn TemplateCompiler>,
    fs: Arc<dyn FileSystem>,
}

impl TemplateAggregator {
    pub fn new(root: impl Into<PathBuf>, compiler: Arc<dyn TemplateCompiler>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            compiler,
            fs,
        }
    }

    /// Read and compile every template. Files are processed in parallel;
    /// the result keeps the input order.
    ///
    /// The first failing file (in input order) aborts the whole run.
    #[instrument(skip_all, fields(templates = templates.len()))]
    pub fn aggregate(&self, templates: &[&TemplateFile]) -> Result<Vec<AggregatedTemplate>, BuildError> {
        let results: Vec<Result<AggregatedTemplate, BuildError>> = templates
            .par_iter()
            .map(|file| self.compile_one(file))
            .collect();

        results.into_iter().collect()
    }

    fn compile_one(&self, file: &TemplateFile) -> Result<AggregatedTemplate, BuildError> {
        let full = self.full_path(&file.path);
        let bytes = self.fs.read(&full).map_err(|e| BuildError::Io {
            path: full.clone(),
            source: e,
        })?;
        let source = String::from_utf8(bytes).map_err(|e| BuildError::TemplateCompile {
            path: file.path.clone(),
            cause: format!("not valid UTF-8: {}", e),
        })?;

        let compiled = self
            .compiler
            .compile(&file.path, &source)
            .map_err(|cause| BuildError::TemplateCompile {
                path: file.path.clone(),
                cause,
            })?;

        debug!(path = %file.path.display(), bytes = compiled.code.len(), "compiled template");

        Ok(AggregatedTemplate {
            path: self.display_path(&file.path),
            source,
            compiled,
            identity: file.identity(),
        })
    }

    /// Host paths may be root-relative or already carry the root.
    fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.starts_with(&self.root) {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Path relative to the root when possible, for source maps.
    fn display_path(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
